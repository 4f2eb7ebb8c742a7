//! DIMSE command set encoding.
//!
//! Command sets are flat group-0000 datasets, always encoded implicit VR
//! little endian (PS 3.7 §6.3.1) regardless of the presentation context's
//! accepted transfer syntax. The group length element (0000,0000) is
//! recomputed on every encode so callers never maintain it by hand.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Command set element tags, as `(group << 16) | element`.
pub mod tags {
    /// (0000,0000) UL CommandGroupLength.
    pub const COMMAND_GROUP_LENGTH: u32 = 0x0000_0000;
    /// (0000,0002) UI AffectedSOPClassUID.
    pub const AFFECTED_SOP_CLASS_UID: u32 = 0x0000_0002;
    /// (0000,0003) UI RequestedSOPClassUID.
    pub const REQUESTED_SOP_CLASS_UID: u32 = 0x0000_0003;
    /// (0000,0100) US CommandField.
    pub const COMMAND_FIELD: u32 = 0x0000_0100;
    /// (0000,0110) US MessageID.
    pub const MESSAGE_ID: u32 = 0x0000_0110;
    /// (0000,0120) US MessageIDBeingRespondedTo.
    pub const MESSAGE_ID_BEING_RESPONDED_TO: u32 = 0x0000_0120;
    /// (0000,0600) AE MoveDestination.
    pub const MOVE_DESTINATION: u32 = 0x0000_0600;
    /// (0000,0700) US Priority.
    pub const PRIORITY: u32 = 0x0000_0700;
    /// (0000,0800) US CommandDataSetType.
    pub const COMMAND_DATA_SET_TYPE: u32 = 0x0000_0800;
    /// (0000,0900) US Status.
    pub const STATUS: u32 = 0x0000_0900;
    /// (0000,1000) UI AffectedSOPInstanceUID.
    pub const AFFECTED_SOP_INSTANCE_UID: u32 = 0x0000_1000;
    /// (0000,1001) UI RequestedSOPInstanceUID.
    pub const REQUESTED_SOP_INSTANCE_UID: u32 = 0x0000_1001;
    /// (0000,1002) US EventTypeID.
    pub const EVENT_TYPE_ID: u32 = 0x0000_1002;
    /// (0000,1008) US ActionTypeID.
    pub const ACTION_TYPE_ID: u32 = 0x0000_1008;
    /// (0000,1020) US NumberOfRemainingSuboperations.
    pub const REMAINING_SUBOPERATIONS: u32 = 0x0000_1020;
    /// (0000,1021) US NumberOfCompletedSuboperations.
    pub const COMPLETED_SUBOPERATIONS: u32 = 0x0000_1021;
    /// (0000,1022) US NumberOfFailedSuboperations.
    pub const FAILED_SUBOPERATIONS: u32 = 0x0000_1022;
    /// (0000,1023) US NumberOfWarningSuboperations.
    pub const WARNING_SUBOPERATIONS: u32 = 0x0000_1023;
    /// (0000,1030) AE MoveOriginatorApplicationEntityTitle.
    pub const MOVE_ORIGINATOR_AE_TITLE: u32 = 0x0000_1030;
    /// (0000,1031) US MoveOriginatorMessageID.
    pub const MOVE_ORIGINATOR_MESSAGE_ID: u32 = 0x0000_1031;
}

/// CommandDataSetType value meaning "no dataset follows".
pub const DATA_SET_ABSENT: u16 = 0x0101;
/// CommandDataSetType value meaning "a dataset follows".
pub const DATA_SET_PRESENT: u16 = 0x0001;

/// A flat group-0000 command dataset keyed by element tag.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandSet {
    elements: BTreeMap<u32, Bytes>,
}

impl CommandSet {
    /// An empty command set.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Decode an implicit-VR little-endian command stream.
    ///
    /// A stored group length element is accepted but discarded; it is
    /// derived data and recomputed on encode.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedCommandSet`] when an element header
    /// is truncated or a value length overruns the stream.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = Bytes::copy_from_slice(data);
        let mut elements = BTreeMap::new();
        while buf.has_remaining() {
            if buf.remaining() < 8 {
                return Err(ProtocolError::MalformedCommandSet {
                    reason: "truncated element header",
                });
            }
            let group = buf.get_u16_le();
            let element = buf.get_u16_le();
            let length = buf.get_u32_le() as usize;
            if length > buf.remaining() {
                return Err(ProtocolError::MalformedCommandSet {
                    reason: "element length overruns command stream",
                });
            }
            let tag = (u32::from(group) << 16) | u32::from(element);
            let value = buf.copy_to_bytes(length);
            if tag != tags::COMMAND_GROUP_LENGTH {
                elements.insert(tag, value);
            }
        }
        Ok(Self { elements })
    }

    /// Encode to implicit-VR little-endian bytes, group length first.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(128);
        for (tag, value) in &self.elements {
            if *tag == tags::COMMAND_GROUP_LENGTH {
                continue;
            }
            put_element(&mut body, *tag, value);
        }
        let mut out = BytesMut::with_capacity(body.len() + 12);
        put_element(
            &mut out,
            tags::COMMAND_GROUP_LENGTH,
            &(body.len() as u32).to_le_bytes(),
        );
        out.extend_from_slice(&body);
        out.freeze()
    }

    /// Raw value bytes of an element.
    #[must_use]
    pub fn get(&self, tag: u32) -> Option<&Bytes> { self.elements.get(&tag) }

    /// Read an element as an unsigned short.
    #[must_use]
    pub fn get_u16(&self, tag: u32) -> Option<u16> {
        let value = self.elements.get(&tag)?;
        if value.len() < 2 {
            return None;
        }
        Some(u16::from_le_bytes([value[0], value[1]]))
    }

    /// Read an element as a trimmed string (UI, AE, and friends).
    #[must_use]
    pub fn get_str(&self, tag: u32) -> Option<String> {
        let value = self.elements.get(&tag)?;
        Some(
            String::from_utf8_lossy(value)
                .trim_matches(|c: char| c == ' ' || c == '\0')
                .to_string(),
        )
    }

    /// Store an unsigned short element.
    pub fn put_u16(&mut self, tag: u32, value: u16) {
        self.elements
            .insert(tag, Bytes::copy_from_slice(&value.to_le_bytes()));
    }

    /// Store a string element, padded to even length.
    ///
    /// UI values pad with NUL per PS 3.5; everything else pads with space.
    pub fn put_str(&mut self, tag: u32, value: &str) {
        let pad = if is_uid_tag(tag) { 0u8 } else { b' ' };
        let mut bytes = BytesMut::from(value.as_bytes());
        if bytes.len() % 2 != 0 {
            bytes.put_u8(pad);
        }
        self.elements.insert(tag, bytes.freeze());
    }

    /// Remove an element, returning whether it was present.
    pub fn remove(&mut self, tag: u32) -> bool { self.elements.remove(&tag).is_some() }

    /// Whether the element is present.
    #[must_use]
    pub fn contains(&self, tag: u32) -> bool { self.elements.contains_key(&tag) }

    /// Number of elements, excluding the derived group length.
    #[must_use]
    pub fn len(&self) -> usize { self.elements.len() }

    /// Whether the set holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.elements.is_empty() }
}

fn put_element(out: &mut BytesMut, tag: u32, value: &[u8]) {
    out.put_u16_le((tag >> 16) as u16);
    out.put_u16_le(tag as u16);
    out.put_u32_le(value.len() as u32);
    out.put_slice(value);
}

fn is_uid_tag(tag: u32) -> bool {
    matches!(
        tag,
        tags::AFFECTED_SOP_CLASS_UID
            | tags::REQUESTED_SOP_CLASS_UID
            | tags::AFFECTED_SOP_INSTANCE_UID
            | tags::REQUESTED_SOP_INSTANCE_UID
    )
}
