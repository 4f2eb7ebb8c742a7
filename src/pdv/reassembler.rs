//! Inbound PDV reassembly.
//!
//! [`Reassembler`] consumes PDVs in arrival order and reconstructs the
//! command and dataset streams of one DIMSE message at a time. Commands are
//! decoded the moment their last fragment arrives; datasets accumulate in
//! memory except for C-STORE, where the fragments stream through a
//! [`StoreSinkProvider`] sink so arbitrarily large objects never occupy
//! memory. Within one presentation context, messages do not interleave;
//! the reassembler rejects fragments that violate that ordering.

use std::{path::PathBuf, sync::Arc};

use bytes::BytesMut;

use crate::{
    association::Association,
    dimse::{CommandField, CommandSet, Dataset, DimseMessage, FileMetaInformation},
    error::{Error, ProtocolError, StoreError},
    pdu::Pdv,
    store::{DicomFile, StoreSink, StoreSinkProvider},
    uids,
};

/// A fully reassembled inbound message.
#[derive(Debug)]
pub struct IncomingDimse {
    /// The message, with its dataset attached when one was received.
    pub message: DimseMessage,
    /// The staged file for C-STORE receptions that went through a sink.
    pub file: Option<DicomFile>,
}

/// What one PDV did to the reassembly state.
#[derive(Debug)]
pub enum ReassemblyOutcome {
    /// More fragments are required.
    Pending,
    /// A message completed.
    Complete(IncomingDimse),
    /// A C-STORE dataset could not be materialized; the association
    /// survives and the engine answers with `ProcessingFailure`.
    StoreFailed {
        /// The request whose dataset was lost.
        request: DimseMessage,
        /// Backing file of the failed sink, for the exception hook.
        filename: Option<PathBuf>,
        /// What went wrong.
        error: StoreError,
    },
}

enum ReceiveSink {
    Memory(BytesMut),
    Store(Box<dyn StoreSink>),
}

/// Per-connection reassembly state.
pub struct Reassembler {
    association: Arc<Association>,
    store: Arc<dyn StoreSinkProvider>,
    /// Command decoded, dataset still arriving.
    dimse: Option<DimseMessage>,
    sink: Option<ReceiveSink>,
    /// Remaining fragments of a failed store reception are swallowed
    /// until the chain's last fragment passes.
    discarding: bool,
}

impl Reassembler {
    /// Create the reassembler for an established association.
    #[must_use]
    pub fn new(association: Arc<Association>, store: Arc<dyn StoreSinkProvider>) -> Self {
        Self {
            association,
            store,
            dimse: None,
            sink: None,
            discarding: false,
        }
    }

    /// Feed one PDV in arrival order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on ordering violations or undecodable
    /// commands, and [`Error::Store`] when a spill sink cannot be opened.
    /// C-STORE finalization failures are reported through
    /// [`ReassemblyOutcome::StoreFailed`] instead, because they must not
    /// end the association.
    pub async fn push(&mut self, pdv: Pdv) -> Result<ReassemblyOutcome, Error> {
        if self.discarding {
            if pdv.is_command {
                return Err(ProtocolError::InterleavedFragments {
                    context_id: pdv.context_id,
                }
                .into());
            }
            self.discarding = !pdv.is_last;
            return Ok(ReassemblyOutcome::Pending);
        }
        match (&self.dimse, pdv.is_command) {
            (Some(_), true) => {
                return Err(ProtocolError::InterleavedFragments {
                    context_id: pdv.context_id,
                }
                .into());
            }
            (None, false) if !matches!(self.sink, Some(ReceiveSink::Memory(_))) => {
                return Err(ProtocolError::UnexpectedPdu {
                    pdu: 0x04,
                    phase: "awaiting a command fragment",
                }
                .into());
            }
            (None, false) => {
                // Data fragment while a command chain is still open.
                return Err(ProtocolError::InterleavedFragments {
                    context_id: pdv.context_id,
                }
                .into());
            }
            _ => {}
        }
        if self.sink.is_none() {
            match self.open_sink(&pdv).await {
                Ok(()) => {}
                // A sink that cannot be provisioned fails the reception,
                // not the association.
                Err(Error::Store(error)) => {
                    self.discarding = !pdv.is_last;
                    return Ok(self.fail_store(error));
                }
                Err(other) => return Err(other),
            }
        }

        let write_error = match self.sink.as_mut() {
            Some(ReceiveSink::Memory(buffer)) => {
                buffer.extend_from_slice(&pdv.data);
                None
            }
            Some(ReceiveSink::Store(sink)) => sink.write(&pdv.data).await.err(),
            None => unreachable!("sink opened above"),
        };
        if let Some(error) = write_error {
            self.discarding = !pdv.is_last;
            return Ok(self.fail_store(error));
        }

        if !pdv.is_last {
            return Ok(ReassemblyOutcome::Pending);
        }
        if self.dimse.is_none() {
            self.complete_command(pdv.context_id)
        } else {
            self.complete_dataset().await
        }
    }

    /// Open the sink for the fragment chain this PDV starts.
    async fn open_sink(&mut self, pdv: &Pdv) -> Result<(), Error> {
        let sink = match &self.dimse {
            // First fragment of a command.
            None => ReceiveSink::Memory(BytesMut::new()),
            // First fragment of the dataset following a decoded command.
            Some(message) => {
                if message.command_field() == Ok(CommandField::CStoreRq) {
                    let context = self
                        .association
                        .context(pdv.context_id)
                        .filter(|pc| pc.is_accepted())
                        .ok_or(ProtocolError::UnknownPresentationContext {
                            context_id: pdv.context_id,
                        })?;
                    let meta = FileMetaInformation::for_store_request(
                        &message.command,
                        context,
                        &self.association,
                    );
                    ReceiveSink::Store(self.store.create_sink(meta).await?)
                } else {
                    ReceiveSink::Memory(BytesMut::new())
                }
            }
        };
        self.sink = Some(sink);
        Ok(())
    }

    /// Decode a completed command stream and decide whether to wait for a
    /// dataset.
    fn complete_command(&mut self, context_id: u8) -> Result<ReassemblyOutcome, Error> {
        let Some(ReceiveSink::Memory(buffer)) = self.sink.take() else {
            unreachable!("command fragments always use the memory sink");
        };
        // Command sets are implicit VR little endian regardless of the
        // context's accepted transfer syntax.
        let command = CommandSet::decode(&buffer)?;
        let message = DimseMessage::from_command(command, context_id);
        if message.declares_dataset() {
            self.dimse = Some(message);
            Ok(ReassemblyOutcome::Pending)
        } else {
            Ok(ReassemblyOutcome::Complete(IncomingDimse {
                message,
                file: None,
            }))
        }
    }

    /// Materialize a completed dataset stream and attach it to the message.
    async fn complete_dataset(&mut self) -> Result<ReassemblyOutcome, Error> {
        let mut message = self.dimse.take().unwrap_or_else(|| {
            unreachable!("dataset completion requires a decoded command")
        });
        match self.sink.take() {
            Some(ReceiveSink::Memory(buffer)) => {
                let transfer_syntax = self
                    .association
                    .context(message.context_id)
                    .and_then(|pc| pc.accepted_transfer_syntax.clone())
                    .unwrap_or_else(|| uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string());
                message.dataset = Some(Dataset::in_memory(transfer_syntax, buffer.freeze()));
                Ok(ReassemblyOutcome::Complete(IncomingDimse {
                    message,
                    file: None,
                }))
            }
            Some(ReceiveSink::Store(sink)) => {
                let filename = sink.filename();
                match sink.finalize().await {
                    Ok(Some(file)) => {
                        message.dataset = Some(file.dataset.clone());
                        Ok(ReassemblyOutcome::Complete(IncomingDimse {
                            message,
                            file: Some(file),
                        }))
                    }
                    // The provider opted out of supplying a parsed file.
                    Ok(None) => Ok(ReassemblyOutcome::Complete(IncomingDimse {
                        message,
                        file: None,
                    })),
                    Err(error) => Ok(ReassemblyOutcome::StoreFailed {
                        request: message,
                        filename,
                        error,
                    }),
                }
            }
            None => unreachable!("dataset completion requires an open sink"),
        }
    }

    /// Abandon an in-flight store reception after a write failure.
    fn fail_store(&mut self, error: StoreError) -> ReassemblyOutcome {
        let filename = match self.sink.take() {
            Some(ReceiveSink::Store(sink)) => sink.filename(),
            _ => None,
        };
        let request = self
            .dimse
            .take()
            .unwrap_or_else(|| unreachable!("store sink exists only after a command"));
        ReassemblyOutcome::StoreFailed {
            request,
            filename,
            error,
        }
    }
}
