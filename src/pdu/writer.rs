//! PDU encoding.
//!
//! [`encode_pdu`] serializes any [`Pdu`] into its PS 3.8 wire form. Item and
//! sub-item lengths are backfilled after their payloads are written, which
//! keeps the layout code free of length bookkeeping.

use bytes::{BufMut, BytesMut};

use super::{AssociateAc, AssociateRq, PDataTf, Pdu, UserInfo};
use crate::uids::pad_ae_title;

/// Serialize a PDU, including its 6-byte header.
#[must_use]
pub fn encode_pdu(pdu: &Pdu) -> BytesMut {
    let mut out = BytesMut::with_capacity(64);
    out.put_u8(pdu.pdu_type());
    out.put_u8(0);
    out.put_u32(0); // length, backfilled below
    match pdu {
        Pdu::AssociateRq(rq) => encode_associate_rq(rq, &mut out),
        Pdu::AssociateAc(ac) => encode_associate_ac(ac, &mut out),
        Pdu::AssociateRj(rj) => {
            let (result, source, reason) = rj.to_wire();
            out.put_u8(0);
            out.put_u8(result);
            out.put_u8(source);
            out.put_u8(reason);
        }
        Pdu::PDataTf(data) => encode_p_data(data, &mut out),
        Pdu::ReleaseRq | Pdu::ReleaseRp => out.put_u32(0),
        Pdu::Abort(abort) => {
            let (source, reason) = abort.to_wire();
            out.put_u16(0);
            out.put_u8(source);
            out.put_u8(reason);
        }
        Pdu::Unknown { body, .. } => out.put_slice(body),
    }
    let body_len = (out.len() - super::PDU_HEADER_LEN) as u32;
    out[2..6].copy_from_slice(&body_len.to_be_bytes());
    out
}

fn encode_associate_rq(rq: &AssociateRq, out: &mut BytesMut) {
    encode_associate_header(
        rq.protocol_version,
        &rq.called_ae_title,
        &rq.calling_ae_title,
        out,
    );
    put_item(out, 0x10, |b| b.put_slice(rq.application_context_name.as_bytes()));
    for pc in &rq.presentation_contexts {
        put_item(out, 0x20, |b| {
            b.put_u8(pc.id);
            b.put_bytes(0, 3);
            put_item(b, 0x30, |s| s.put_slice(pc.abstract_syntax.as_bytes()));
            for ts in &pc.transfer_syntaxes {
                put_item(b, 0x40, |s| s.put_slice(ts.as_bytes()));
            }
        });
    }
    encode_user_info(&rq.user_info, out);
}

fn encode_associate_ac(ac: &AssociateAc, out: &mut BytesMut) {
    encode_associate_header(
        ac.protocol_version,
        &ac.called_ae_title,
        &ac.calling_ae_title,
        out,
    );
    put_item(out, 0x10, |b| b.put_slice(ac.application_context_name.as_bytes()));
    for pc in &ac.presentation_contexts {
        put_item(out, 0x21, |b| {
            b.put_u8(pc.id);
            b.put_u8(0);
            b.put_u8(pc.result.to_wire());
            b.put_u8(0);
            // A transfer syntax sub-item is always present; its value is
            // only significant when the context was accepted.
            let ts = pc.transfer_syntax.as_deref().unwrap_or("");
            put_item(b, 0x40, |s| s.put_slice(ts.as_bytes()));
        });
    }
    encode_user_info(&ac.user_info, out);
}

fn encode_associate_header(
    protocol_version: u16,
    called: &str,
    calling: &str,
    out: &mut BytesMut,
) {
    out.put_u16(protocol_version);
    out.put_u16(0);
    out.put_slice(&pad_ae_title(called));
    out.put_slice(&pad_ae_title(calling));
    out.put_bytes(0, 32);
}

fn encode_user_info(info: &UserInfo, out: &mut BytesMut) {
    put_item(out, 0x50, |b| {
        put_item(b, 0x51, |s| s.put_u32(info.max_pdu_length));
        put_item(b, 0x52, |s| s.put_slice(info.implementation_class_uid.as_bytes()));
        if let Some((invoked, performed)) = info.max_async_ops {
            put_item(b, 0x53, |s| {
                s.put_u16(invoked);
                s.put_u16(performed);
            });
        }
        for role in &info.role_selections {
            put_item(b, 0x54, |s| {
                s.put_u16(role.sop_class_uid.len() as u16);
                s.put_slice(role.sop_class_uid.as_bytes());
                s.put_u8(u8::from(role.scu_role));
                s.put_u8(u8::from(role.scp_role));
            });
        }
        if let Some(version) = &info.implementation_version_name {
            put_item(b, 0x55, |s| s.put_slice(version.as_bytes()));
        }
        for ext in &info.extended_negotiations {
            put_item(b, 0x56, |s| {
                s.put_u16(ext.sop_class_uid.len() as u16);
                s.put_slice(ext.sop_class_uid.as_bytes());
                s.put_slice(&ext.data);
            });
        }
        if let Some(identity) = &info.user_identity {
            put_item(b, 0x58, |s| {
                s.put_u8(identity.identity_type);
                s.put_u8(u8::from(identity.positive_response_requested));
                s.put_u16(identity.primary_field.len() as u16);
                s.put_slice(&identity.primary_field);
                s.put_u16(identity.secondary_field.len() as u16);
                s.put_slice(&identity.secondary_field);
            });
        }
        for (item_type, data) in &info.others {
            put_item(b, *item_type, |s| s.put_slice(data));
        }
    });
}

fn encode_p_data(data: &PDataTf, out: &mut BytesMut) {
    for pdv in &data.pdvs {
        out.put_u32(pdv.data.len() as u32 + 2);
        out.put_u8(pdv.context_id);
        out.put_u8(pdv.control_header());
        out.put_slice(&pdv.data);
    }
}

/// Write one `[type, reserved, length:u16]` item, backfilling the length.
fn put_item(out: &mut BytesMut, item_type: u8, write: impl FnOnce(&mut BytesMut)) {
    out.put_u8(item_type);
    out.put_u8(0);
    let len_at = out.len();
    out.put_u16(0);
    write(out);
    let length = (out.len() - len_at - 2) as u16;
    out[len_at..len_at + 2].copy_from_slice(&length.to_be_bytes());
}
