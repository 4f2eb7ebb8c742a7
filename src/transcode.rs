//! Dataset codec collaborator.
//!
//! Dataset internals are outside this crate; the engine only needs two
//! operations before putting a dataset on the wire: converting it to the
//! accepted transfer syntax and stripping deprecated group length elements
//! (PS 3.5 §7.2). Hosts plug in a real codec; the identity default keeps
//! same-syntax traffic working without one.

use bytes::Bytes;

use crate::error::TranscodeError;

/// Conversion operations the engine delegates to the host's dataset codec.
pub trait DatasetCodec: Send + Sync {
    /// Re-encode `data` from one transfer syntax to another.
    ///
    /// # Errors
    ///
    /// Returns [`TranscodeError::UnsupportedConversion`] when the codec
    /// cannot produce the target syntax, or
    /// [`TranscodeError::MalformedDataset`] when the input does not parse.
    fn transcode(&self, data: Bytes, from: &str, to: &str) -> Result<Bytes, TranscodeError>;

    /// Remove group length elements prior to transmission.
    ///
    /// Implementations that know their datasets never carry group lengths
    /// may return the input unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`TranscodeError::MalformedDataset`] when the input does not
    /// parse under `transfer_syntax`.
    fn strip_group_lengths(
        &self,
        data: Bytes,
        transfer_syntax: &str,
    ) -> Result<Bytes, TranscodeError>;
}

/// Codec that performs no conversions.
///
/// Same-syntax payloads pass through untouched; a cross-syntax send fails,
/// which the engine surfaces to the caller without closing the connection.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityCodec;

impl DatasetCodec for IdentityCodec {
    fn transcode(&self, data: Bytes, from: &str, to: &str) -> Result<Bytes, TranscodeError> {
        if from == to {
            return Ok(data);
        }
        Err(TranscodeError::UnsupportedConversion {
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    fn strip_group_lengths(
        &self,
        data: Bytes,
        _transfer_syntax: &str,
    ) -> Result<Bytes, TranscodeError> {
        Ok(data)
    }
}
