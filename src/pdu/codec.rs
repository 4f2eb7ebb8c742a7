//! `tokio_util` codec glue for the PDU layer.
//!
//! [`PduCodec`] frames and decodes PDUs for use with `FramedRead` and
//! `FramedWrite`. Structural violations are reported through `io::Error`
//! (as the codec traits require) carrying a [`ProtocolError`] payload that
//! the engine recovers with a downcast to decide abort-vs-silent teardown.

use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{MAX_PDU_LENGTH_CAP, PDU_HEADER_LEN, Pdu, RawPdu, decode_pdu, encode_pdu};
use crate::error::ProtocolError;

/// Decoder/encoder for DICOM upper layer PDUs.
#[derive(Clone, Debug)]
pub struct PduCodec {
    /// Advertised maximum receive length for the P-DATA phase.
    max_receive_length: u32,
    /// Whether inbound PDUs above `max_receive_length` are rejected
    /// outright instead of tolerated up to the absolute cap.
    strict: bool,
}

impl PduCodec {
    /// Create a codec with the given advertised receive length.
    #[must_use]
    pub fn new(max_receive_length: u32, strict: bool) -> Self {
        Self {
            max_receive_length,
            strict,
        }
    }

    fn check_length(&self, length: u32) -> Result<(), ProtocolError> {
        let effective_max = if self.strict && self.max_receive_length > 0 {
            self.max_receive_length.min(MAX_PDU_LENGTH_CAP)
        } else {
            MAX_PDU_LENGTH_CAP
        };
        if length > effective_max {
            return Err(ProtocolError::PduTooLarge {
                length,
                max: effective_max,
            });
        }
        if !self.strict && self.max_receive_length > 0 && length > self.max_receive_length {
            log::warn!(
                "inbound PDU of {length} bytes exceeds the advertised maximum of {}",
                self.max_receive_length
            );
        }
        Ok(())
    }
}

impl Decoder for PduCodec {
    type Item = Pdu;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PDU_HEADER_LEN {
            return Ok(None);
        }
        let length = u32::from_be_bytes([src[2], src[3], src[4], src[5]]);
        self.check_length(length)?;
        if src.len() < PDU_HEADER_LEN + length as usize {
            src.reserve(PDU_HEADER_LEN + length as usize - src.len());
            return Ok(None);
        }
        let pdu_type = src[0];
        src.advance(PDU_HEADER_LEN);
        let body = src.split_to(length as usize).freeze();
        let pdu = decode_pdu(RawPdu { pdu_type, body })?;
        Ok(Some(pdu))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // An empty buffer at EOF is a clean close; the engine shuts the
        // session down without raising an error.
        if src.is_empty() {
            return Ok(None);
        }
        match self.decode(src)? {
            Some(pdu) => Ok(Some(pdu)),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended mid-PDU with {} bytes buffered", src.len()),
            )),
        }
    }
}

impl Encoder<Pdu> for PduCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Pdu, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&encode_pdu(&item));
        Ok(())
    }
}
