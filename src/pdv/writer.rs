//! Outbound PDV slicing.
//!
//! [`PdvWriter`] is the narrow write sink the send path streams a DIMSE
//! message through: command bytes, a mode switch, dataset bytes, and a
//! final flush. It packs as many PDVs into a PDU as the effective size cap
//! allows and forwards complete PDUs to a [`PduSink`], which in the engine
//! is the bounded PDU queue providing backpressure.

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::mpsc;

use crate::{
    error::Error,
    pdu::{PDV_HEADER_LEN, PDataTf, Pdu, Pdv},
};

/// Destination for complete P-DATA-TF PDUs.
#[async_trait]
pub trait PduSink: Send {
    /// Submit one PDU, awaiting queue capacity when necessary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] when the connection is gone.
    async fn send_pdu(&mut self, pdu: Pdu) -> Result<(), Error>;
}

#[async_trait]
impl PduSink for mpsc::Sender<Pdu> {
    async fn send_pdu(&mut self, pdu: Pdu) -> Result<(), Error> {
        self.send(pdu).await.map_err(|_| Error::Closed)
    }
}

/// Collector sink used by unit tests.
#[async_trait]
impl PduSink for Vec<Pdu> {
    async fn send_pdu(&mut self, pdu: Pdu) -> Result<(), Error> {
        self.push(pdu);
        Ok(())
    }
}

/// Write sink that slices one DIMSE message into PDVs and PDUs.
///
/// Bound to a `(presentation context, command/data)` pair; starts in
/// command mode. The per-mode buffer caps bound PDU size even when the
/// peer advertised no limit.
pub struct PdvWriter<S> {
    sink: S,
    context_id: u8,
    is_command: bool,
    /// Peer's maximum P-DATA-TF body length; zero means no stated limit.
    negotiated_max: u32,
    max_command_buffer: usize,
    max_data_buffer: usize,
    buffer: BytesMut,
    pdvs: Vec<Pdv>,
    /// Wire size of the PDVs accumulated for the current PDU.
    pdu_size: usize,
    /// Whether any PDV was emitted since the last mode switch; a mode that
    /// emitted nothing still owes the peer its last-fragment PDV.
    mode_emitted: bool,
    /// Total payload bytes accepted, for invariant checking and logging.
    written: u64,
}

impl<S: PduSink> PdvWriter<S> {
    /// Create a writer for one outgoing message.
    #[must_use]
    pub fn new(
        sink: S,
        context_id: u8,
        negotiated_max: u32,
        max_command_buffer: usize,
        max_data_buffer: usize,
    ) -> Self {
        Self {
            sink,
            context_id,
            is_command: true,
            negotiated_max,
            max_command_buffer,
            max_data_buffer,
            buffer: BytesMut::new(),
            pdvs: Vec::new(),
            pdu_size: 0,
            mode_emitted: false,
            written: 0,
        }
    }

    /// The PDU body cap for the current mode.
    fn effective_max(&self) -> usize {
        let mode_buffer = if self.is_command {
            self.max_command_buffer
        } else {
            self.max_data_buffer
        };
        if self.negotiated_max == 0 {
            mode_buffer
        } else {
            mode_buffer.min(self.negotiated_max as usize)
        }
    }

    /// Space left in the fragment buffer before a PDV must be emitted.
    fn buffer_room(&self) -> usize {
        self.effective_max()
            .saturating_sub(self.pdu_size + PDV_HEADER_LEN)
            .saturating_sub(self.buffer.len())
    }

    /// Append message bytes, emitting PDVs and PDUs as the caps fill.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] when the PDU sink is gone.
    pub async fn write(&mut self, mut bytes: &[u8]) -> Result<(), Error> {
        self.written += bytes.len() as u64;
        while !bytes.is_empty() {
            let room = self.buffer_room();
            if room == 0 {
                self.emit_pdv(false);
                self.flush_pdu_if_full().await?;
                continue;
            }
            let take = room.min(bytes.len());
            self.buffer.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
        }
        Ok(())
    }

    /// Switch from the command stream to the dataset stream.
    ///
    /// Closes the command fragment chain: buffered command bytes go out as
    /// the final command PDV with the last-fragment bit set, so the
    /// receiver can decode the command before dataset fragments arrive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] when the PDU sink is gone.
    pub async fn set_command(&mut self, is_command: bool) -> Result<(), Error> {
        if self.is_command == is_command {
            return Ok(());
        }
        if self.is_command && (!self.buffer.is_empty() || self.mode_emitted) {
            self.emit_pdv(true);
            self.flush_pdu_if_full().await?;
        }
        self.is_command = is_command;
        self.mode_emitted = false;
        Ok(())
    }

    /// Emit remaining bytes and forward the pending PDU.
    ///
    /// With `last` set, the final PDV of the current mode carries the
    /// last-fragment bit; this must be the final call for the message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] when the PDU sink is gone.
    pub async fn flush(&mut self, last: bool) -> Result<(), Error> {
        if !self.buffer.is_empty() || !self.mode_emitted {
            self.emit_pdv(last);
        }
        if !self.pdvs.is_empty() {
            self.flush_pdu().await?;
        }
        Ok(())
    }

    /// Total payload bytes accepted across both modes.
    #[must_use]
    pub fn bytes_written(&self) -> u64 { self.written }

    /// Consume the writer, returning the sink.
    pub fn into_sink(self) -> S { self.sink }

    fn emit_pdv(&mut self, is_last: bool) {
        let data = self.buffer.split().freeze();
        self.pdu_size += data.len() + PDV_HEADER_LEN;
        self.mode_emitted = true;
        self.pdvs.push(Pdv {
            context_id: self.context_id,
            is_command: self.is_command,
            is_last,
            data,
        });
    }

    /// Flush when another PDV header would no longer fit.
    async fn flush_pdu_if_full(&mut self) -> Result<(), Error> {
        if self.pdu_size + PDV_HEADER_LEN >= self.effective_max() {
            self.flush_pdu().await?;
        }
        Ok(())
    }

    async fn flush_pdu(&mut self) -> Result<(), Error> {
        let pdvs = std::mem::take(&mut self.pdvs);
        self.pdu_size = 0;
        self.sink.send_pdu(Pdu::PDataTf(PDataTf { pdvs })).await
    }
}
