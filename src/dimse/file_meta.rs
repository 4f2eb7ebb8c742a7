//! File meta information synthesis for received C-STORE objects.
//!
//! The engine never parses full datasets, but a stored object must carry a
//! PS 3.10 file meta group describing what was received and over which
//! association. The group-0002 encoding is fixed (explicit VR little
//! endian), so it is produced here rather than through the dataset codec
//! collaborator.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    association::{Association, PresentationContext},
    dimse::{CommandSet, tags},
};

/// DICM magic following the 128-byte preamble.
const MAGIC: &[u8; 4] = b"DICM";

/// File meta information for one received composite object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileMetaInformation {
    /// (0002,0002) media storage SOP class; the context's abstract syntax.
    pub media_storage_sop_class_uid: String,
    /// (0002,0003) media storage SOP instance; the command's affected UID.
    pub media_storage_sop_instance_uid: String,
    /// (0002,0010) the context's accepted transfer syntax.
    pub transfer_syntax_uid: String,
    /// (0002,0012) the remote implementation class UID.
    pub implementation_class_uid: String,
    /// (0002,0013) the remote implementation version name.
    pub implementation_version_name: Option<String>,
    /// (0002,0016) the calling AE title of the association.
    pub source_application_entity_title: String,
}

impl FileMetaInformation {
    /// Synthesize meta information for an incoming C-STORE request.
    #[must_use]
    pub fn for_store_request(
        command: &CommandSet,
        context: &PresentationContext,
        association: &Association,
    ) -> Self {
        Self {
            media_storage_sop_class_uid: context.abstract_syntax.clone(),
            media_storage_sop_instance_uid: command
                .get_str(tags::AFFECTED_SOP_INSTANCE_UID)
                .unwrap_or_default(),
            transfer_syntax_uid: context
                .accepted_transfer_syntax
                .clone()
                .unwrap_or_else(|| crate::uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string()),
            implementation_class_uid: association.remote_implementation_class_uid.clone(),
            implementation_version_name: association.remote_implementation_version_name.clone(),
            source_application_entity_title: association.calling_ae_title.clone(),
        }
    }

    /// Encode the preamble, magic, and group 0002 in explicit VR LE.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut group = BytesMut::with_capacity(256);
        // (0002,0001) OB FileMetaInformationVersion.
        group.put_slice(&[0x02, 0x00, 0x01, 0x00]);
        group.put_slice(b"OB");
        group.put_u16_le(0); // reserved for long-form VRs
        group.put_u32_le(2);
        group.put_slice(&[0x00, 0x01]);
        put_short_element(&mut group, 0x0002, b"UI", &self.media_storage_sop_class_uid, 0);
        put_short_element(&mut group, 0x0003, b"UI", &self.media_storage_sop_instance_uid, 0);
        put_short_element(&mut group, 0x0010, b"UI", &self.transfer_syntax_uid, 0);
        put_short_element(&mut group, 0x0012, b"UI", &self.implementation_class_uid, 0);
        if let Some(version) = &self.implementation_version_name {
            put_short_element(&mut group, 0x0013, b"SH", version, b' ');
        }
        if !self.source_application_entity_title.is_empty() {
            put_short_element(&mut group, 0x0016, b"AE", &self.source_application_entity_title, b' ');
        }

        let mut out = BytesMut::with_capacity(132 + 12 + group.len());
        out.put_bytes(0, 128);
        out.put_slice(MAGIC);
        // (0002,0000) UL FileMetaInformationGroupLength.
        out.put_slice(&[0x02, 0x00, 0x00, 0x00]);
        out.put_slice(b"UL");
        out.put_u16_le(4);
        out.put_u32_le(group.len() as u32);
        out.extend_from_slice(&group);
        out.freeze()
    }
}

/// Write one short-form explicit VR element of group 0002.
fn put_short_element(out: &mut BytesMut, element: u16, vr: &[u8; 2], value: &str, pad: u8) {
    let len = value.len() + value.len() % 2;
    out.put_u16_le(0x0002);
    out.put_u16_le(element);
    out.put_slice(vr);
    out.put_u16_le(len as u16);
    out.put_slice(value.as_bytes());
    if value.len() % 2 != 0 {
        out.put_u8(pad);
    }
}
