//! Error types for the upper-layer engine.
//!
//! The taxonomy separates protocol violations (malformed PDUs, unexpected
//! sequencing) from transport failures, negotiation failures, and store-sink
//! failures. The distinction drives connection teardown: protocol violations
//! are answered with an A-ABORT before closing, transport failures close
//! silently because the socket is already gone, and negotiation failures are
//! surfaced to the caller without touching the connection.

use std::io;

use thiserror::Error;

/// Wire-level and sequencing violations of the DICOM upper layer protocol.
///
/// Receiving any of these ends the association: the engine sends
/// `A-ABORT (service-user, reason-not-specified)` and closes.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// PDU type byte not assigned by PS 3.8 (and not the tolerated 0xFF).
    #[error("unrecognized PDU type {pdu_type:#04x}")]
    UnknownPduType {
        /// Type byte as received.
        pdu_type: u8,
    },

    /// PDU length field exceeds the absolute sanity cap.
    #[error("PDU length {length} exceeds maximum of {max}")]
    PduTooLarge {
        /// Length claimed by the PDU header.
        length: u32,
        /// Largest length this engine will buffer.
        max: u32,
    },

    /// A TLV sub-item claims more bytes than its container holds.
    #[error(
        "sub-item {item_type:#04x} length {length} overruns its container ({remaining} bytes left)"
    )]
    SubItemOverflow {
        /// Item type of the offending sub-item.
        item_type: u8,
        /// Length the sub-item claimed.
        length: u32,
        /// Bytes actually remaining in the container.
        remaining: usize,
    },

    /// A required item was absent from an A-ASSOCIATE-RQ/AC.
    #[error("association PDU is missing required item: {item}")]
    MissingItem {
        /// Human-readable name of the missing item.
        item: &'static str,
    },

    /// PDU body ended before a fixed-size field could be read.
    #[error("truncated PDU while reading {field}")]
    TruncatedPdu {
        /// Field being read when the body ran out.
        field: &'static str,
    },

    /// A PDV message control header had bits 2-7 set.
    #[error("PDV message control header has reserved bits set: {header:#04x}")]
    ReservedPdvBits {
        /// Header byte as received.
        header: u8,
    },

    /// A PDV item length below the 2-byte minimum (context id + header).
    #[error("PDV item length {length} is below the 2 byte minimum")]
    PdvTooShort {
        /// Item length as received.
        length: u32,
    },

    /// A PDU arrived that the current phase of the state machine forbids.
    #[error("unexpected PDU type {pdu:#04x} while {phase}")]
    UnexpectedPdu {
        /// Type byte of the offending PDU.
        pdu: u8,
        /// Phase the session was in.
        phase: &'static str,
    },

    /// A PDV referenced a presentation context id that was never accepted.
    #[error("PDV for unknown presentation context {context_id}")]
    UnknownPresentationContext {
        /// Context id carried by the PDV.
        context_id: u8,
    },

    /// Command and dataset fragments interleaved within one context.
    #[error("command fragment received while a dataset was being reassembled on context {context_id}")]
    InterleavedFragments {
        /// Context id on which the interleave occurred.
        context_id: u8,
    },

    /// An incoming command set could not be decoded.
    #[error("malformed command set: {reason}")]
    MalformedCommandSet {
        /// What the decoder tripped over.
        reason: &'static str,
    },

    /// A DIMSE request arrived for which no provider is registered.
    #[error("no service provider registered for command field {command_field:#06x}")]
    UnimplementedService {
        /// Command field of the unhandled request.
        command_field: u16,
    },

    /// A reject/abort enum field held a value outside its assigned range.
    #[error("invalid {field} value {value}")]
    InvalidEnumValue {
        /// Name of the field.
        field: &'static str,
        /// Value as received.
        value: u8,
    },
}

/// Failures raised by a [`DatasetCodec`](crate::transcode::DatasetCodec)
/// collaborator.
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// The codec cannot convert between the two transfer syntaxes.
    #[error("cannot transcode dataset from {from} to {to}")]
    UnsupportedConversion {
        /// Transfer syntax the dataset is encoded in.
        from: String,
        /// Transfer syntax the peer accepted.
        to: String,
    },

    /// The dataset bytes were not decodable under their declared syntax.
    #[error("dataset is not valid under transfer syntax {transfer_syntax}: {reason}")]
    MalformedDataset {
        /// Declared transfer syntax.
        transfer_syntax: String,
        /// What the codec tripped over.
        reason: String,
    },
}

/// Failures in the C-STORE spill sink.
///
/// These never tear down the association: the engine answers the C-STORE
/// with `ProcessingFailure` and notifies the sink provider's exception hook.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Staging the incoming object to disk failed.
    #[error("could not stage incoming object: {0}")]
    Io(#[from] io::Error),

    /// The stored object could not be turned into a usable file.
    #[error("stored object could not be parsed: {reason}")]
    Parse {
        /// What the finalize step tripped over.
        reason: String,
    },
}

/// Top-level error for the upper-layer engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Peer violated the upper layer protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Underlying byte stream failed.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// No acceptable presentation context exists for an outgoing message.
    #[error("no acceptable presentation context for SOP class {sop_class_uid}")]
    NoPresentationContext {
        /// SOP class the message targets.
        sop_class_uid: String,
    },

    /// Dataset transcoding failed before transmission.
    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    /// The C-STORE spill sink failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The connection is closed; no further exchange is possible.
    #[error("connection closed")]
    Closed,
}

impl Error {
    /// Whether the peer should be sent an A-ABORT before closing.
    ///
    /// Only protocol violations warrant an abort; a failed transport cannot
    /// carry one and the remaining kinds leave the association open.
    #[must_use]
    pub fn warrants_abort(&self) -> bool { matches!(self, Self::Protocol(_)) }

    /// Whether this error ends the connection.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Transport(_) | Self::Closed)
    }
}

impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> Self { io::Error::new(io::ErrorKind::InvalidData, err) }
}

/// Extract a [`ProtocolError`] from an I/O error produced by the PDU codec.
///
/// The codec reports decode violations through `io::Error` to satisfy the
/// `tokio_util` codec traits; the engine recovers the structured kind here
/// to decide between abort-then-close and silent close.
#[must_use]
pub(crate) fn protocol_error_of(err: &io::Error) -> Option<&ProtocolError> {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<ProtocolError>())
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
