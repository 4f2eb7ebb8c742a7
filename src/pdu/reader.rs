//! PDU framing and decoding.
//!
//! [`read_pdu`] frames one PDU from an async byte source; [`decode_pdu`]
//! interprets a framed [`RawPdu`]. Decoding is strict about container
//! arithmetic (every TLV length is checked against its container) but
//! lenient about content: unknown top-level items and presentation context
//! sub-items are skipped, and unknown user-info sub-items are preserved
//! verbatim for forward compatibility.

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{
    Abort,
    AssociateAc,
    AssociateRj,
    AssociateRq,
    ContextResult,
    ContextResultReason,
    ExtendedNegotiation,
    MAX_PDU_LENGTH_CAP,
    PDataTf,
    Pdu,
    Pdv,
    ProposedContext,
    RawPdu,
    RoleSelection,
    UserIdentity,
    UserInfo,
};
use crate::{
    error::{Error, ProtocolError},
    uids::trim_ae_title,
};

/// Frame a single PDU from `source`.
///
/// Returns `Ok(None)` when the stream ends cleanly before any header byte
/// arrives; the engine treats this as a silent close. An EOF in the middle
/// of a frame is a transport error.
///
/// # Errors
///
/// Returns [`Error::Protocol`] when the length field exceeds the absolute
/// cap and [`Error::Transport`] for I/O failures, including mid-frame EOF.
pub async fn read_pdu<R>(source: &mut R) -> Result<Option<RawPdu>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; super::PDU_HEADER_LEN];
    match source.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Transport(e)),
    }

    let pdu_type = header[0];
    let length = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
    if length > MAX_PDU_LENGTH_CAP {
        return Err(ProtocolError::PduTooLarge {
            length,
            max: MAX_PDU_LENGTH_CAP,
        }
        .into());
    }

    let mut body = vec![0u8; length as usize];
    source.read_exact(&mut body).await.map_err(Error::Transport)?;
    Ok(Some(RawPdu {
        pdu_type,
        body: Bytes::from(body),
    }))
}

/// Interpret a framed PDU.
///
/// Unassigned type bytes decode to [`Pdu::Unknown`]; the reader loop decides
/// whether that is the tolerated 0xFF no-op or an abort-worthy violation.
///
/// # Errors
///
/// Returns [`ProtocolError`] for any structural violation of PS 3.8.
pub fn decode_pdu(raw: RawPdu) -> Result<Pdu, ProtocolError> {
    let mut body = raw.body;
    match raw.pdu_type {
        0x01 => decode_associate_rq(&mut body).map(Pdu::AssociateRq),
        0x02 => decode_associate_ac(&mut body).map(Pdu::AssociateAc),
        0x03 => {
            take_fixed(&mut body, 1, "reserved")?;
            let result = take_u8(&mut body, "result")?;
            let source = take_u8(&mut body, "source")?;
            let reason = take_u8(&mut body, "reason")?;
            AssociateRj::from_wire(result, source, reason).map(Pdu::AssociateRj)
        }
        0x04 => decode_p_data(&mut body).map(Pdu::PDataTf),
        0x05 => Ok(Pdu::ReleaseRq),
        0x06 => Ok(Pdu::ReleaseRp),
        0x07 => {
            take_fixed(&mut body, 2, "reserved")?;
            let source = take_u8(&mut body, "abort source")?;
            let reason = take_u8(&mut body, "abort reason")?;
            Abort::from_wire(source, reason).map(Pdu::Abort)
        }
        pdu_type => Ok(Pdu::Unknown { pdu_type, body }),
    }
}

/// Accumulator for the variable items shared by A-ASSOCIATE-RQ and -AC.
#[derive(Default)]
struct AssociateItems {
    application_context_name: Option<String>,
    proposed: Vec<ProposedContext>,
    results: Vec<ContextResult>,
    user_info: Option<UserInfo>,
}

fn decode_associate_rq(body: &mut Bytes) -> Result<AssociateRq, ProtocolError> {
    let (protocol_version, called_ae_title, calling_ae_title) = take_associate_header(body)?;
    let items = take_associate_items(body)?;
    if items.proposed.is_empty() {
        return Err(ProtocolError::MissingItem {
            item: "presentation context",
        });
    }
    Ok(AssociateRq {
        protocol_version,
        called_ae_title,
        calling_ae_title,
        application_context_name: items.application_context_name.ok_or(
            ProtocolError::MissingItem {
                item: "application context",
            },
        )?,
        presentation_contexts: items.proposed,
        user_info: items.user_info.ok_or(ProtocolError::MissingItem {
            item: "user information",
        })?,
    })
}

fn decode_associate_ac(body: &mut Bytes) -> Result<AssociateAc, ProtocolError> {
    let (protocol_version, called_ae_title, calling_ae_title) = take_associate_header(body)?;
    let items = take_associate_items(body)?;
    if items.results.is_empty() {
        return Err(ProtocolError::MissingItem {
            item: "presentation context result",
        });
    }
    Ok(AssociateAc {
        protocol_version,
        called_ae_title,
        calling_ae_title,
        application_context_name: items.application_context_name.ok_or(
            ProtocolError::MissingItem {
                item: "application context",
            },
        )?,
        presentation_contexts: items.results,
        user_info: items.user_info.ok_or(ProtocolError::MissingItem {
            item: "user information",
        })?,
    })
}

fn take_associate_header(body: &mut Bytes) -> Result<(u16, String, String), ProtocolError> {
    let protocol_version = take_u16(body, "protocol version")?;
    take_fixed(body, 2, "reserved")?;
    let called = take_fixed(body, 16, "called AE title")?;
    let calling = take_fixed(body, 16, "calling AE title")?;
    take_fixed(body, 32, "reserved")?;
    Ok((
        protocol_version,
        trim_ae_title(&called),
        trim_ae_title(&calling),
    ))
}

fn take_associate_items(body: &mut Bytes) -> Result<AssociateItems, ProtocolError> {
    let mut items = AssociateItems::default();
    while body.has_remaining() {
        let (item_type, mut item) = take_tlv(body)?;
        match item_type {
            0x10 => {
                items.application_context_name = Some(take_remaining_string(&mut item));
            }
            0x20 => items.proposed.push(decode_proposed_context(&mut item)?),
            0x21 => items.results.push(decode_context_result(&mut item)?),
            0x50 => items.user_info = Some(decode_user_info(&mut item)?),
            other => {
                log::debug!("skipping unknown association item {other:#04x} ({} bytes)", item.len());
            }
        }
    }
    Ok(items)
}

fn decode_proposed_context(item: &mut Bytes) -> Result<ProposedContext, ProtocolError> {
    let id = take_u8(item, "presentation context id")?;
    take_fixed(item, 3, "reserved")?;
    let mut abstract_syntax = None;
    let mut transfer_syntaxes = Vec::new();
    while item.has_remaining() {
        let (sub_type, mut sub) = take_tlv(item)?;
        match sub_type {
            0x30 => abstract_syntax = Some(take_remaining_string(&mut sub)),
            0x40 => transfer_syntaxes.push(take_remaining_string(&mut sub)),
            other => {
                log::debug!("skipping unknown presentation context sub-item {other:#04x}");
            }
        }
    }
    if transfer_syntaxes.is_empty() {
        return Err(ProtocolError::MissingItem {
            item: "transfer syntax sub-item",
        });
    }
    Ok(ProposedContext {
        id,
        abstract_syntax: abstract_syntax.ok_or(ProtocolError::MissingItem {
            item: "abstract syntax sub-item",
        })?,
        transfer_syntaxes,
    })
}

fn decode_context_result(item: &mut Bytes) -> Result<ContextResult, ProtocolError> {
    let id = take_u8(item, "presentation context id")?;
    take_fixed(item, 1, "reserved")?;
    let result = ContextResultReason::from_wire(take_u8(item, "result/reason")?)?;
    take_fixed(item, 1, "reserved")?;
    let mut transfer_syntax = None;
    while item.has_remaining() {
        let (sub_type, mut sub) = take_tlv(item)?;
        if sub_type == 0x40 {
            transfer_syntax = Some(take_remaining_string(&mut sub));
        } else {
            log::debug!("skipping unknown context result sub-item {sub_type:#04x}");
        }
    }
    if result == ContextResultReason::Acceptance && transfer_syntax.is_none() {
        return Err(ProtocolError::MissingItem {
            item: "transfer syntax sub-item",
        });
    }
    // The sub-item is present but not significant on rejected contexts.
    if result != ContextResultReason::Acceptance {
        transfer_syntax = None;
    }
    Ok(ContextResult {
        id,
        result,
        transfer_syntax,
    })
}

fn decode_user_info(item: &mut Bytes) -> Result<UserInfo, ProtocolError> {
    let mut info = UserInfo {
        max_pdu_length: 0,
        implementation_class_uid: String::new(),
        implementation_version_name: None,
        max_async_ops: None,
        role_selections: Vec::new(),
        extended_negotiations: Vec::new(),
        user_identity: None,
        others: Vec::new(),
    };
    let mut max_length_seen = false;
    while item.has_remaining() {
        let (sub_type, mut sub) = take_tlv(item)?;
        match sub_type {
            0x51 => {
                info.max_pdu_length = take_u32(&mut sub, "maximum length received")?;
                max_length_seen = true;
            }
            0x52 => info.implementation_class_uid = take_remaining_string(&mut sub),
            0x53 => {
                let invoked = take_u16(&mut sub, "max operations invoked")?;
                let performed = take_u16(&mut sub, "max operations performed")?;
                info.max_async_ops = Some((invoked, performed));
            }
            0x54 => {
                let uid_len = take_u16(&mut sub, "role selection UID length")? as usize;
                let uid = take_checked(&mut sub, uid_len, sub_type)?;
                info.role_selections.push(RoleSelection {
                    sop_class_uid: trim_uid(&uid),
                    scu_role: take_u8(&mut sub, "SCU role")? != 0,
                    scp_role: take_u8(&mut sub, "SCP role")? != 0,
                });
            }
            0x55 => info.implementation_version_name = Some(take_remaining_string(&mut sub)),
            0x56 => {
                let uid_len = take_u16(&mut sub, "extended negotiation UID length")? as usize;
                let uid = take_checked(&mut sub, uid_len, sub_type)?;
                info.extended_negotiations.push(ExtendedNegotiation {
                    sop_class_uid: trim_uid(&uid),
                    data: sub.copy_to_bytes(sub.remaining()),
                });
            }
            0x58 => {
                let identity_type = take_u8(&mut sub, "user identity type")?;
                let positive_response_requested = take_u8(&mut sub, "response requested")? != 0;
                let primary_len = take_u16(&mut sub, "primary field length")? as usize;
                let primary_field = take_checked(&mut sub, primary_len, sub_type)?;
                let secondary_len = take_u16(&mut sub, "secondary field length")? as usize;
                let secondary_field = take_checked(&mut sub, secondary_len, sub_type)?;
                info.user_identity = Some(UserIdentity {
                    identity_type,
                    positive_response_requested,
                    primary_field,
                    secondary_field,
                });
            }
            other => {
                info.others.push((other, sub.copy_to_bytes(sub.remaining())));
            }
        }
    }
    // The max-length sub-item is mandatory in RQ and AC user info.
    if !max_length_seen {
        return Err(ProtocolError::MissingItem {
            item: "maximum length sub-item",
        });
    }
    Ok(info)
}

fn decode_p_data(body: &mut Bytes) -> Result<PDataTf, ProtocolError> {
    let mut pdvs = Vec::new();
    while body.has_remaining() {
        let length = take_u32(body, "PDV item length")?;
        if length < 2 {
            return Err(ProtocolError::PdvTooShort { length });
        }
        if (length as usize) > body.remaining() {
            return Err(ProtocolError::SubItemOverflow {
                item_type: 0x04,
                length,
                remaining: body.remaining(),
            });
        }
        let context_id = take_u8(body, "presentation context id")?;
        let header = take_u8(body, "message control header")?;
        if header & !0x03 != 0 {
            return Err(ProtocolError::ReservedPdvBits { header });
        }
        let data = body.copy_to_bytes(length as usize - 2);
        pdvs.push(Pdv {
            context_id,
            is_command: header & 0x01 != 0,
            is_last: header & 0x02 != 0,
            data,
        });
    }
    Ok(PDataTf { pdvs })
}

fn take_u8(buf: &mut Bytes, field: &'static str) -> Result<u8, ProtocolError> {
    if buf.remaining() < 1 {
        return Err(ProtocolError::TruncatedPdu { field });
    }
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut Bytes, field: &'static str) -> Result<u16, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::TruncatedPdu { field });
    }
    Ok(buf.get_u16())
}

fn take_u32(buf: &mut Bytes, field: &'static str) -> Result<u32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::TruncatedPdu { field });
    }
    Ok(buf.get_u32())
}

fn take_fixed(buf: &mut Bytes, len: usize, field: &'static str) -> Result<Bytes, ProtocolError> {
    if buf.remaining() < len {
        return Err(ProtocolError::TruncatedPdu { field });
    }
    Ok(buf.copy_to_bytes(len))
}

/// Read one `[type, reserved, length:u16]` header and split off its payload.
fn take_tlv(buf: &mut Bytes) -> Result<(u8, Bytes), ProtocolError> {
    let item_type = take_u8(buf, "item type")?;
    take_fixed(buf, 1, "reserved")?;
    let length = take_u16(buf, "item length")?;
    let payload = take_checked(buf, length as usize, item_type)?;
    Ok((item_type, payload))
}

fn take_checked(buf: &mut Bytes, len: usize, item_type: u8) -> Result<Bytes, ProtocolError> {
    if buf.remaining() < len {
        return Err(ProtocolError::SubItemOverflow {
            item_type,
            length: len as u32,
            remaining: buf.remaining(),
        });
    }
    Ok(buf.copy_to_bytes(len))
}

fn take_remaining_string(buf: &mut Bytes) -> String {
    let bytes = buf.copy_to_bytes(buf.remaining());
    trim_uid(&bytes)
}

/// UIDs and names are ASCII, occasionally NUL padded to even length.
fn trim_uid(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string()
}
