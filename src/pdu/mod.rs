//! DICOM upper layer protocol data units.
//!
//! This module owns the seven association PDUs of PS 3.8 plus an `Unknown`
//! escape hatch, a pure decode/encode pair over [`RawPdu`], and the
//! `tokio_util` codec glue used by the service engine. All PDU-header
//! integers are big-endian; AE titles are fixed 16-byte space-padded fields.

use bytes::Bytes;

use crate::error::ProtocolError;

mod codec;
mod reader;
mod writer;

pub use codec::PduCodec;
pub use reader::{decode_pdu, read_pdu};
pub use writer::encode_pdu;


/// Bytes in the fixed PDU header: type, reserved, and big-endian length.
pub const PDU_HEADER_LEN: usize = 6;

/// Bytes of PDV overhead inside a P-DATA-TF body: item length, context id,
/// and message control header.
pub const PDV_HEADER_LEN: usize = 6;

/// Default maximum PDU length advertised when the caller does not choose one.
pub const DEFAULT_MAX_PDU_LENGTH: u32 = 16_384;

/// Absolute cap on inbound PDU bodies, independent of negotiation.
///
/// Anything larger is a protocol error; this bounds decoder allocation.
pub const MAX_PDU_LENGTH_CAP: u32 = 131_072;

/// A framed but not yet interpreted PDU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawPdu {
    /// PDU type byte.
    pub pdu_type: u8,
    /// Body bytes following the 6-byte header.
    pub body: Bytes,
}

/// An upper layer protocol data unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Pdu {
    /// A-ASSOCIATE-RQ (0x01).
    AssociateRq(AssociateRq),
    /// A-ASSOCIATE-AC (0x02).
    AssociateAc(AssociateAc),
    /// A-ASSOCIATE-RJ (0x03).
    AssociateRj(AssociateRj),
    /// P-DATA-TF (0x04).
    PDataTf(PDataTf),
    /// A-RELEASE-RQ (0x05).
    ReleaseRq,
    /// A-RELEASE-RP (0x06).
    ReleaseRp,
    /// A-ABORT (0x07).
    Abort(Abort),
    /// Any other type byte, body preserved for diagnostics.
    Unknown {
        /// Type byte as received.
        pdu_type: u8,
        /// Unparsed body.
        body: Bytes,
    },
}

impl Pdu {
    /// The wire type byte of this PDU.
    #[must_use]
    pub fn pdu_type(&self) -> u8 {
        match self {
            Self::AssociateRq(_) => 0x01,
            Self::AssociateAc(_) => 0x02,
            Self::AssociateRj(_) => 0x03,
            Self::PDataTf(_) => 0x04,
            Self::ReleaseRq => 0x05,
            Self::ReleaseRp => 0x06,
            Self::Abort(_) => 0x07,
            Self::Unknown { pdu_type, .. } => *pdu_type,
        }
    }

    /// Short human-readable name for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::AssociateRq(_) => "A-ASSOCIATE-RQ",
            Self::AssociateAc(_) => "A-ASSOCIATE-AC",
            Self::AssociateRj(_) => "A-ASSOCIATE-RJ",
            Self::PDataTf(_) => "P-DATA-TF",
            Self::ReleaseRq => "A-RELEASE-RQ",
            Self::ReleaseRp => "A-RELEASE-RP",
            Self::Abort(_) => "A-ABORT",
            Self::Unknown { .. } => "unknown",
        }
    }
}

/// A-ASSOCIATE-RQ payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssociateRq {
    /// Protocol version bits; bit 0 identifies version 1.
    pub protocol_version: u16,
    /// Destination application entity, trimmed of padding.
    pub called_ae_title: String,
    /// Source application entity, trimmed of padding.
    pub calling_ae_title: String,
    /// Application context name; always the DICOM application context.
    pub application_context_name: String,
    /// Proposed presentation contexts, in proposal order.
    pub presentation_contexts: Vec<ProposedContext>,
    /// User information sub-items.
    pub user_info: UserInfo,
}

/// A-ASSOCIATE-AC payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssociateAc {
    /// Protocol version bits.
    pub protocol_version: u16,
    /// Echo of the called AE title field (not significant on receipt).
    pub called_ae_title: String,
    /// Echo of the calling AE title field (not significant on receipt).
    pub calling_ae_title: String,
    /// Application context name.
    pub application_context_name: String,
    /// Per-context results, one per proposed context.
    pub presentation_contexts: Vec<ContextResult>,
    /// User information sub-items.
    pub user_info: UserInfo,
}

/// One proposed presentation context (item 0x20).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProposedContext {
    /// Context id; odd per PS 3.8 §7.1.1.13.
    pub id: u8,
    /// Abstract syntax (SOP class) UID.
    pub abstract_syntax: String,
    /// Transfer syntaxes offered, in preference order.
    pub transfer_syntaxes: Vec<String>,
}

/// One presentation context result (item 0x21).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextResult {
    /// Context id this result answers.
    pub id: u8,
    /// Acceptance or the rejection reason.
    pub result: ContextResultReason,
    /// Accepted transfer syntax; only significant when accepted.
    pub transfer_syntax: Option<String>,
}

/// Result/Reason field of a presentation context result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextResultReason {
    /// Context accepted with the carried transfer syntax.
    Acceptance,
    /// Rejected by the association acceptor's user.
    UserRejection,
    /// Rejected by the provider without a stated reason.
    NoReason,
    /// The abstract syntax is not supported.
    AbstractSyntaxNotSupported,
    /// None of the proposed transfer syntaxes is supported.
    TransferSyntaxesNotSupported,
}

impl ContextResultReason {
    pub(crate) fn from_wire(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Acceptance),
            1 => Ok(Self::UserRejection),
            2 => Ok(Self::NoReason),
            3 => Ok(Self::AbstractSyntaxNotSupported),
            4 => Ok(Self::TransferSyntaxesNotSupported),
            other => Err(ProtocolError::InvalidEnumValue {
                field: "presentation context result",
                value: other,
            }),
        }
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Self::Acceptance => 0,
            Self::UserRejection => 1,
            Self::NoReason => 2,
            Self::AbstractSyntaxNotSupported => 3,
            Self::TransferSyntaxesNotSupported => 4,
        }
    }
}

/// Parsed user information item (0x50) of an A-ASSOCIATE-RQ/AC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserInfo {
    /// Maximum P-DATA-TF body length the sender is willing to receive;
    /// zero means no stated limit.
    pub max_pdu_length: u32,
    /// Implementation class UID (sub-item 0x52).
    pub implementation_class_uid: String,
    /// Implementation version name (sub-item 0x55), if sent.
    pub implementation_version_name: Option<String>,
    /// Asynchronous operations window (sub-item 0x53): invoked, performed.
    pub max_async_ops: Option<(u16, u16)>,
    /// SCP/SCU role selections (sub-item 0x54).
    pub role_selections: Vec<RoleSelection>,
    /// SOP class extended negotiation (sub-item 0x56), carried opaquely.
    pub extended_negotiations: Vec<ExtendedNegotiation>,
    /// User identity negotiation (sub-item 0x58), if present.
    pub user_identity: Option<UserIdentity>,
    /// Unrecognized sub-items, preserved as `(item_type, bytes)`.
    pub others: Vec<(u8, Bytes)>,
}

impl Default for UserInfo {
    fn default() -> Self {
        Self {
            max_pdu_length: DEFAULT_MAX_PDU_LENGTH,
            implementation_class_uid: crate::uids::IMPLEMENTATION_CLASS_UID.to_string(),
            implementation_version_name: Some(crate::uids::IMPLEMENTATION_VERSION_NAME.to_string()),
            max_async_ops: None,
            role_selections: Vec::new(),
            extended_negotiations: Vec::new(),
            user_identity: None,
            others: Vec::new(),
        }
    }
}

/// SCP/SCU role selection for one SOP class (sub-item 0x54).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleSelection {
    /// SOP class the roles apply to.
    pub sop_class_uid: String,
    /// Whether the proposer will act as SCU.
    pub scu_role: bool,
    /// Whether the proposer will act as SCP.
    pub scp_role: bool,
}

/// SOP class extended negotiation payload (sub-item 0x56).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtendedNegotiation {
    /// SOP class the information applies to.
    pub sop_class_uid: String,
    /// Service-class application information, opaque to the upper layer.
    pub data: Bytes,
}

/// User identity negotiation payload (sub-item 0x58).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserIdentity {
    /// Identity type code (1 = username, 2 = username+passcode, ...).
    pub identity_type: u8,
    /// Whether a positive server response was requested.
    pub positive_response_requested: bool,
    /// Primary field (for example the username), opaque bytes.
    pub primary_field: Bytes,
    /// Secondary field (for example the passcode), opaque bytes.
    pub secondary_field: Bytes,
}

/// A-ASSOCIATE-RJ payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssociateRj {
    /// Whether the rejection is permanent or transient.
    pub result: RejectResult,
    /// Which layer rejected.
    pub source: RejectSource,
    /// Reason, interpreted in the context of `source`.
    pub reason: RejectReason,
}

/// Result field of an A-ASSOCIATE-RJ.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectResult {
    /// Retrying will not help.
    Permanent,
    /// The peer may retry later.
    Transient,
}

/// Source field of an A-ASSOCIATE-RJ.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectSource {
    /// DICOM UL service-user.
    ServiceUser,
    /// DICOM UL service-provider, ACSE related function.
    ServiceProviderAcse,
    /// DICOM UL service-provider, presentation related function.
    ServiceProviderPresentation,
}

/// Reason field of an A-ASSOCIATE-RJ.
///
/// Wire values overlap between sources; decoding therefore requires the
/// source, which is why conversion lives on [`AssociateRj`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// No reason given (service-user or ACSE).
    NoReasonGiven,
    /// The proposed application context name is not supported.
    ApplicationContextNameNotSupported,
    /// The calling AE title is not recognized.
    CallingAeTitleNotRecognized,
    /// The called AE title is not recognized.
    CalledAeTitleNotRecognized,
    /// The protocol version is not supported (ACSE).
    ProtocolVersionNotSupported,
    /// Temporary congestion (presentation layer).
    TemporaryCongestion,
    /// Local limit exceeded (presentation layer).
    LocalLimitExceeded,
    /// A reserved code, preserved verbatim.
    Reserved(u8),
}

impl AssociateRj {
    pub(crate) fn from_wire(result: u8, source: u8, reason: u8) -> Result<Self, ProtocolError> {
        let result = match result {
            1 => RejectResult::Permanent,
            2 => RejectResult::Transient,
            other => {
                return Err(ProtocolError::InvalidEnumValue {
                    field: "reject result",
                    value: other,
                });
            }
        };
        let source = match source {
            1 => RejectSource::ServiceUser,
            2 => RejectSource::ServiceProviderAcse,
            3 => RejectSource::ServiceProviderPresentation,
            other => {
                return Err(ProtocolError::InvalidEnumValue {
                    field: "reject source",
                    value: other,
                });
            }
        };
        let reason = match (source, reason) {
            (RejectSource::ServiceUser, 1) | (RejectSource::ServiceProviderAcse, 1) => {
                RejectReason::NoReasonGiven
            }
            (RejectSource::ServiceUser, 2) => RejectReason::ApplicationContextNameNotSupported,
            (RejectSource::ServiceUser, 3) => RejectReason::CallingAeTitleNotRecognized,
            (RejectSource::ServiceUser, 7) => RejectReason::CalledAeTitleNotRecognized,
            (RejectSource::ServiceProviderAcse, 2) => RejectReason::ProtocolVersionNotSupported,
            (RejectSource::ServiceProviderPresentation, 1) => RejectReason::TemporaryCongestion,
            (RejectSource::ServiceProviderPresentation, 2) => RejectReason::LocalLimitExceeded,
            (_, other) => RejectReason::Reserved(other),
        };
        Ok(Self {
            result,
            source,
            reason,
        })
    }

    pub(crate) fn to_wire(self) -> (u8, u8, u8) {
        let result = match self.result {
            RejectResult::Permanent => 1,
            RejectResult::Transient => 2,
        };
        let source = match self.source {
            RejectSource::ServiceUser => 1,
            RejectSource::ServiceProviderAcse => 2,
            RejectSource::ServiceProviderPresentation => 3,
        };
        let reason = match self.reason {
            RejectReason::NoReasonGiven => 1,
            RejectReason::ApplicationContextNameNotSupported => 2,
            RejectReason::CallingAeTitleNotRecognized => 3,
            RejectReason::CalledAeTitleNotRecognized => 7,
            RejectReason::ProtocolVersionNotSupported => 2,
            RejectReason::TemporaryCongestion => 1,
            RejectReason::LocalLimitExceeded => 2,
            RejectReason::Reserved(code) => code,
        };
        (result, source, reason)
    }
}

/// A-ABORT payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Abort {
    /// Which side initiated the abort.
    pub source: AbortSource,
    /// Diagnostic reason; only significant for provider aborts.
    pub reason: AbortReason,
}

/// Source field of an A-ABORT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortSource {
    /// DICOM UL service-user initiated.
    ServiceUser,
    /// DICOM UL service-provider initiated.
    ServiceProvider,
}

/// Reason field of an A-ABORT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    /// Reason not specified.
    NotSpecified,
    /// Unrecognized PDU.
    UnrecognizedPdu,
    /// Unexpected PDU.
    UnexpectedPdu,
    /// Unrecognized PDU parameter.
    UnrecognizedPduParameter,
    /// Unexpected PDU parameter.
    UnexpectedPduParameter,
    /// Invalid PDU parameter value.
    InvalidPduParameterValue,
    /// A reserved code, preserved verbatim.
    Reserved(u8),
}

impl Abort {
    pub(crate) fn from_wire(source: u8, reason: u8) -> Result<Self, ProtocolError> {
        let source = match source {
            0 => AbortSource::ServiceUser,
            2 => AbortSource::ServiceProvider,
            other => {
                return Err(ProtocolError::InvalidEnumValue {
                    field: "abort source",
                    value: other,
                });
            }
        };
        let reason = match reason {
            0 => AbortReason::NotSpecified,
            1 => AbortReason::UnrecognizedPdu,
            2 => AbortReason::UnexpectedPdu,
            4 => AbortReason::UnrecognizedPduParameter,
            5 => AbortReason::UnexpectedPduParameter,
            6 => AbortReason::InvalidPduParameterValue,
            other => AbortReason::Reserved(other),
        };
        Ok(Self { source, reason })
    }

    pub(crate) fn to_wire(self) -> (u8, u8) {
        let source = match self.source {
            AbortSource::ServiceUser => 0,
            AbortSource::ServiceProvider => 2,
        };
        let reason = match self.reason {
            AbortReason::NotSpecified => 0,
            AbortReason::UnrecognizedPdu => 1,
            AbortReason::UnexpectedPdu => 2,
            AbortReason::UnrecognizedPduParameter => 4,
            AbortReason::UnexpectedPduParameter => 5,
            AbortReason::InvalidPduParameterValue => 6,
            AbortReason::Reserved(code) => code,
        };
        (source, reason)
    }
}

/// P-DATA-TF payload: an ordered run of presentation data values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PDataTf {
    /// PDVs in wire order.
    pub pdvs: Vec<Pdv>,
}

impl PDataTf {
    /// Total body length this PDU will occupy on the wire.
    #[must_use]
    pub fn body_len(&self) -> usize {
        self.pdvs.iter().map(Pdv::encoded_len).sum()
    }
}

/// One presentation data value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pdv {
    /// Presentation context id the fragment belongs to.
    pub context_id: u8,
    /// Whether the fragment carries command (true) or dataset bytes.
    pub is_command: bool,
    /// Whether this is the final fragment of its command or dataset.
    pub is_last: bool,
    /// Fragment payload.
    pub data: Bytes,
}

impl Pdv {
    /// Wire length of this PDV including its 6-byte overhead.
    #[must_use]
    pub fn encoded_len(&self) -> usize { self.data.len() + PDV_HEADER_LEN }

    /// The message control header byte for this PDV.
    #[must_use]
    pub fn control_header(&self) -> u8 {
        u8::from(self.is_command) | (u8::from(self.is_last) << 1)
    }
}
