//! DIMSE messages: command sets, status codes, and dataset payloads.
//!
//! A [`DimseMessage`] couples a decoded command set with an optional dataset
//! payload and the presentation context it travels on. Dataset bytes are
//! opaque to the engine; interpretation belongs to the host application and
//! the transcoding collaborator.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::ProtocolError;

pub mod command;
mod file_meta;

pub use command::{CommandSet, DATA_SET_ABSENT, DATA_SET_PRESENT, tags};
pub use file_meta::FileMetaInformation;


/// DIMSE command field values (PS 3.7 §9/§10).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandField {
    /// C-STORE-RQ (0x0001).
    CStoreRq,
    /// C-STORE-RSP (0x8001).
    CStoreRsp,
    /// C-GET-RQ (0x0010).
    CGetRq,
    /// C-GET-RSP (0x8010).
    CGetRsp,
    /// C-FIND-RQ (0x0020).
    CFindRq,
    /// C-FIND-RSP (0x8020).
    CFindRsp,
    /// C-MOVE-RQ (0x0021).
    CMoveRq,
    /// C-MOVE-RSP (0x8021).
    CMoveRsp,
    /// C-ECHO-RQ (0x0030).
    CEchoRq,
    /// C-ECHO-RSP (0x8030).
    CEchoRsp,
    /// N-EVENT-REPORT-RQ (0x0100).
    NEventReportRq,
    /// N-EVENT-REPORT-RSP (0x8100).
    NEventReportRsp,
    /// N-GET-RQ (0x0110).
    NGetRq,
    /// N-GET-RSP (0x8110).
    NGetRsp,
    /// N-SET-RQ (0x0120).
    NSetRq,
    /// N-SET-RSP (0x8120).
    NSetRsp,
    /// N-ACTION-RQ (0x0130).
    NActionRq,
    /// N-ACTION-RSP (0x8130).
    NActionRsp,
    /// N-CREATE-RQ (0x0140).
    NCreateRq,
    /// N-CREATE-RSP (0x8140).
    NCreateRsp,
    /// N-DELETE-RQ (0x0150).
    NDeleteRq,
    /// N-DELETE-RSP (0x8150).
    NDeleteRsp,
    /// C-CANCEL-RQ (0x0FFF).
    CCancelRq,
}

impl CommandField {
    /// Decode a wire value.
    #[must_use]
    pub fn from_wire(value: u16) -> Option<Self> {
        Some(match value {
            0x0001 => Self::CStoreRq,
            0x8001 => Self::CStoreRsp,
            0x0010 => Self::CGetRq,
            0x8010 => Self::CGetRsp,
            0x0020 => Self::CFindRq,
            0x8020 => Self::CFindRsp,
            0x0021 => Self::CMoveRq,
            0x8021 => Self::CMoveRsp,
            0x0030 => Self::CEchoRq,
            0x8030 => Self::CEchoRsp,
            0x0100 => Self::NEventReportRq,
            0x8100 => Self::NEventReportRsp,
            0x0110 => Self::NGetRq,
            0x8110 => Self::NGetRsp,
            0x0120 => Self::NSetRq,
            0x8120 => Self::NSetRsp,
            0x0130 => Self::NActionRq,
            0x8130 => Self::NActionRsp,
            0x0140 => Self::NCreateRq,
            0x8140 => Self::NCreateRsp,
            0x0150 => Self::NDeleteRq,
            0x8150 => Self::NDeleteRsp,
            0x0FFF => Self::CCancelRq,
            _ => return None,
        })
    }

    /// The wire value of this command field.
    #[must_use]
    pub fn to_wire(self) -> u16 {
        match self {
            Self::CStoreRq => 0x0001,
            Self::CStoreRsp => 0x8001,
            Self::CGetRq => 0x0010,
            Self::CGetRsp => 0x8010,
            Self::CFindRq => 0x0020,
            Self::CFindRsp => 0x8020,
            Self::CMoveRq => 0x0021,
            Self::CMoveRsp => 0x8021,
            Self::CEchoRq => 0x0030,
            Self::CEchoRsp => 0x8030,
            Self::NEventReportRq => 0x0100,
            Self::NEventReportRsp => 0x8100,
            Self::NGetRq => 0x0110,
            Self::NGetRsp => 0x8110,
            Self::NSetRq => 0x0120,
            Self::NSetRsp => 0x8120,
            Self::NActionRq => 0x0130,
            Self::NActionRsp => 0x8130,
            Self::NCreateRq => 0x0140,
            Self::NCreateRsp => 0x8140,
            Self::NDeleteRq => 0x0150,
            Self::NDeleteRsp => 0x8150,
            Self::CCancelRq => 0x0FFF,
        }
    }

    /// Whether this is a request (invoking) command.
    #[must_use]
    pub fn is_request(self) -> bool { self.to_wire() & 0x8000 == 0 }

    /// Whether this is a response command.
    #[must_use]
    pub fn is_response(self) -> bool { !self.is_request() }

    /// The response field answering this request, if it is a request.
    ///
    /// C-CANCEL-RQ has no paired response.
    #[must_use]
    pub fn response(self) -> Option<Self> {
        if self == Self::CCancelRq || self.is_response() {
            return None;
        }
        Self::from_wire(self.to_wire() | 0x8000)
    }
}

/// DIMSE priority values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Priority {
    /// Priority 0x0002.
    Low,
    /// Priority 0x0000.
    #[default]
    Medium,
    /// Priority 0x0001.
    High,
}

impl Priority {
    /// The wire value of this priority.
    #[must_use]
    pub fn to_wire(self) -> u16 {
        match self {
            Self::Low => 0x0002,
            Self::Medium => 0x0000,
            Self::High => 0x0001,
        }
    }
}

/// Classification of a DIMSE status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusState {
    /// The operation completed.
    Success,
    /// More responses follow.
    Pending,
    /// Completed with caveats.
    Warning,
    /// The operation failed.
    Failure,
    /// The operation was cancelled.
    Cancel,
}

/// A DIMSE status code (PS 3.7 Annex C).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status(pub u16);

impl Status {
    /// Success.
    pub const SUCCESS: Self = Self(0x0000);
    /// Pending, all optional keys supported.
    pub const PENDING: Self = Self(0xFF00);
    /// Pending, some optional keys unsupported.
    pub const PENDING_WARNING: Self = Self(0xFF01);
    /// Cancelled.
    pub const CANCEL: Self = Self(0xFE00);
    /// Failure: SOP class not supported.
    pub const SOP_CLASS_NOT_SUPPORTED: Self = Self(0x0122);
    /// Failure: processing failure.
    pub const PROCESSING_FAILURE: Self = Self(0x0110);

    /// Classify this code per the Annex C ranges.
    #[must_use]
    pub fn state(self) -> StatusState {
        match self.0 {
            0x0000 => StatusState::Success,
            0xFF00 | 0xFF01 => StatusState::Pending,
            0xFE00 => StatusState::Cancel,
            0x0001 | 0x0107 | 0x0116 => StatusState::Warning,
            code if (0xB000..0xC000).contains(&code) => StatusState::Warning,
            _ => StatusState::Failure,
        }
    }

    /// Whether more responses follow this one.
    #[must_use]
    pub fn is_pending(self) -> bool { self.state() == StatusState::Pending }
}

/// An opaque dataset payload with its encoding.
#[derive(Clone, Debug)]
pub struct Dataset {
    transfer_syntax: String,
    payload: DatasetPayload,
}

#[derive(Clone, Debug)]
enum DatasetPayload {
    Memory(Bytes),
    Spilled(Arc<crate::store::SpilledObject>),
}

impl Dataset {
    /// Wrap in-memory dataset bytes encoded with `transfer_syntax`.
    #[must_use]
    pub fn in_memory(transfer_syntax: impl Into<String>, data: Bytes) -> Self {
        Self {
            transfer_syntax: transfer_syntax.into(),
            payload: DatasetPayload::Memory(data),
        }
    }

    pub(crate) fn spilled(
        transfer_syntax: impl Into<String>,
        object: Arc<crate::store::SpilledObject>,
    ) -> Self {
        Self {
            transfer_syntax: transfer_syntax.into(),
            payload: DatasetPayload::Spilled(object),
        }
    }

    /// The transfer syntax the payload is encoded with.
    #[must_use]
    pub fn transfer_syntax(&self) -> &str { &self.transfer_syntax }

    /// Borrow the bytes when the payload is held in memory.
    #[must_use]
    pub fn bytes(&self) -> Option<&Bytes> {
        match &self.payload {
            DatasetPayload::Memory(data) => Some(data),
            DatasetPayload::Spilled(_) => None,
        }
    }

    /// Path of the backing file when the payload was spilled to disk.
    #[must_use]
    pub fn spill_path(&self) -> Option<&std::path::Path> {
        match &self.payload {
            DatasetPayload::Memory(_) => None,
            DatasetPayload::Spilled(object) => Some(object.path()),
        }
    }

    /// Read the payload, touching disk when it was spilled.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the spill file.
    pub async fn read(&self) -> std::io::Result<Bytes> {
        match &self.payload {
            DatasetPayload::Memory(data) => Ok(data.clone()),
            DatasetPayload::Spilled(object) => object.read_dataset().await,
        }
    }
}

/// One DIMSE message: a command set, an optional dataset, and the
/// presentation context it belongs to.
#[derive(Clone, Debug)]
pub struct DimseMessage {
    /// The group-0000 command set.
    pub command: CommandSet,
    /// The dataset payload, when the command declares one.
    pub dataset: Option<Dataset>,
    /// Presentation context id the message is bound to; zero until a
    /// context is resolved.
    pub context_id: u8,
}

impl DimseMessage {
    /// Build a message from a freshly decoded command set.
    #[must_use]
    pub fn from_command(command: CommandSet, context_id: u8) -> Self {
        Self {
            command,
            dataset: None,
            context_id,
        }
    }

    /// A C-ECHO request for the verification SOP class.
    #[must_use]
    pub fn echo_request(message_id: u16) -> Self {
        let mut command = CommandSet::new();
        command.put_str(tags::AFFECTED_SOP_CLASS_UID, crate::uids::VERIFICATION_SOP_CLASS);
        command.put_u16(tags::COMMAND_FIELD, CommandField::CEchoRq.to_wire());
        command.put_u16(tags::MESSAGE_ID, message_id);
        command.put_u16(tags::COMMAND_DATA_SET_TYPE, DATA_SET_ABSENT);
        Self {
            command,
            dataset: None,
            context_id: 0,
        }
    }

    /// A C-STORE request carrying `dataset`.
    #[must_use]
    pub fn store_request(
        message_id: u16,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        priority: Priority,
        dataset: Dataset,
    ) -> Self {
        let mut command = CommandSet::new();
        command.put_str(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid);
        command.put_u16(tags::COMMAND_FIELD, CommandField::CStoreRq.to_wire());
        command.put_u16(tags::MESSAGE_ID, message_id);
        command.put_u16(tags::PRIORITY, priority.to_wire());
        command.put_u16(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT);
        command.put_str(tags::AFFECTED_SOP_INSTANCE_UID, sop_instance_uid);
        Self {
            command,
            dataset: Some(dataset),
            context_id: 0,
        }
    }

    /// A C-FIND request with `identifier` as the query dataset.
    #[must_use]
    pub fn find_request(
        message_id: u16,
        sop_class_uid: &str,
        priority: Priority,
        identifier: Dataset,
    ) -> Self {
        let mut command = CommandSet::new();
        command.put_str(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid);
        command.put_u16(tags::COMMAND_FIELD, CommandField::CFindRq.to_wire());
        command.put_u16(tags::MESSAGE_ID, message_id);
        command.put_u16(tags::PRIORITY, priority.to_wire());
        command.put_u16(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT);
        Self {
            command,
            dataset: Some(identifier),
            context_id: 0,
        }
    }

    /// A C-MOVE request directing matches to `destination`.
    #[must_use]
    pub fn move_request(
        message_id: u16,
        sop_class_uid: &str,
        destination: &str,
        priority: Priority,
        identifier: Dataset,
    ) -> Self {
        let mut command = CommandSet::new();
        command.put_str(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid);
        command.put_u16(tags::COMMAND_FIELD, CommandField::CMoveRq.to_wire());
        command.put_u16(tags::MESSAGE_ID, message_id);
        command.put_str(tags::MOVE_DESTINATION, destination);
        command.put_u16(tags::PRIORITY, priority.to_wire());
        command.put_u16(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT);
        Self {
            command,
            dataset: Some(identifier),
            context_id: 0,
        }
    }

    /// The response answering `request` with `status`.
    ///
    /// Mirrors the request's message id, affected SOP class and instance,
    /// and presentation context. Returns `None` for commands without a
    /// paired response.
    #[must_use]
    pub fn response_to(request: &Self, status: Status, dataset: Option<Dataset>) -> Option<Self> {
        let field = request.command_field().ok()?.response()?;
        let mut command = CommandSet::new();
        if let Some(uid) = request.command.get_str(tags::AFFECTED_SOP_CLASS_UID) {
            command.put_str(tags::AFFECTED_SOP_CLASS_UID, &uid);
        }
        command.put_u16(tags::COMMAND_FIELD, field.to_wire());
        command.put_u16(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            request.message_id().unwrap_or_default(),
        );
        command.put_u16(
            tags::COMMAND_DATA_SET_TYPE,
            if dataset.is_some() {
                DATA_SET_PRESENT
            } else {
                DATA_SET_ABSENT
            },
        );
        command.put_u16(tags::STATUS, status.0);
        if let Some(uid) = request.command.get_str(tags::AFFECTED_SOP_INSTANCE_UID) {
            command.put_str(tags::AFFECTED_SOP_INSTANCE_UID, &uid);
        }
        Some(Self {
            command,
            dataset,
            context_id: request.context_id,
        })
    }

    /// The command field, or a protocol error when missing or unassigned.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedCommandSet`] when the element is
    /// absent or holds an unassigned value.
    pub fn command_field(&self) -> Result<CommandField, ProtocolError> {
        self.command
            .get_u16(tags::COMMAND_FIELD)
            .and_then(CommandField::from_wire)
            .ok_or(ProtocolError::MalformedCommandSet {
                reason: "missing or unassigned command field",
            })
    }

    /// MessageID of a request.
    #[must_use]
    pub fn message_id(&self) -> Option<u16> { self.command.get_u16(tags::MESSAGE_ID) }

    /// MessageIDBeingRespondedTo of a response.
    #[must_use]
    pub fn request_message_id(&self) -> Option<u16> {
        self.command.get_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO)
    }

    /// Status of a response.
    #[must_use]
    pub fn status(&self) -> Option<Status> {
        self.command.get_u16(tags::STATUS).map(Status)
    }

    /// AffectedSOPClassUID, which doubles as the SOP class for routing.
    #[must_use]
    pub fn sop_class_uid(&self) -> Option<String> {
        self.command
            .get_str(tags::AFFECTED_SOP_CLASS_UID)
            .or_else(|| self.command.get_str(tags::REQUESTED_SOP_CLASS_UID))
    }

    /// AffectedSOPInstanceUID, when present.
    #[must_use]
    pub fn sop_instance_uid(&self) -> Option<String> {
        self.command.get_str(tags::AFFECTED_SOP_INSTANCE_UID)
    }

    /// Whether the command set declares that a dataset follows.
    #[must_use]
    pub fn declares_dataset(&self) -> bool {
        self.command
            .get_u16(tags::COMMAND_DATA_SET_TYPE)
            .is_some_and(|value| value != DATA_SET_ABSENT)
    }

    /// Sub-operation progress of a C-MOVE or C-GET response.
    #[must_use]
    pub fn sub_operations(&self) -> SubOperations {
        SubOperations {
            remaining: self.command.get_u16(tags::REMAINING_SUBOPERATIONS),
            completed: self.command.get_u16(tags::COMPLETED_SUBOPERATIONS),
            failed: self.command.get_u16(tags::FAILED_SUBOPERATIONS),
            warnings: self.command.get_u16(tags::WARNING_SUBOPERATIONS),
        }
    }

    /// Record sub-operation progress on a C-MOVE or C-GET response.
    pub fn set_sub_operations(&mut self, counts: SubOperations) {
        let pairs = [
            (tags::REMAINING_SUBOPERATIONS, counts.remaining),
            (tags::COMPLETED_SUBOPERATIONS, counts.completed),
            (tags::FAILED_SUBOPERATIONS, counts.failed),
            (tags::WARNING_SUBOPERATIONS, counts.warnings),
        ];
        for (tag, value) in pairs {
            match value {
                Some(count) => self.command.put_u16(tag, count),
                None => {
                    self.command.remove(tag);
                }
            }
        }
    }

    /// Originator fields of a C-STORE triggered by a C-MOVE.
    #[must_use]
    pub fn move_originator(&self) -> Option<(String, u16)> {
        let ae_title = self.command.get_str(tags::MOVE_ORIGINATOR_AE_TITLE)?;
        let message_id = self.command.get_u16(tags::MOVE_ORIGINATOR_MESSAGE_ID)?;
        Some((ae_title, message_id))
    }
}

/// Sub-operation counters carried by C-MOVE and C-GET responses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubOperations {
    /// (0000,1020) operations still to run; only on pending responses.
    pub remaining: Option<u16>,
    /// (0000,1021) operations completed.
    pub completed: Option<u16>,
    /// (0000,1022) operations failed.
    pub failed: Option<u16>,
    /// (0000,1023) operations completed with warnings.
    pub warnings: Option<u16>,
}
