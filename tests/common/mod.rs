//! Shared helpers for driving one end of a connection by hand.
//!
//! The engine under test owns one half of a `tokio::io::duplex` pipe; these
//! helpers speak raw PDUs on the other half so tests can count and inspect
//! exactly what crosses the wire.

#![allow(dead_code)]

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

use dimserve::{
    CommandSet,
    DimseMessage,
    dimse::tags,
    pdu::{
        AssociateRq,
        PDataTf,
        Pdu,
        PduCodec,
        Pdv,
        ProposedContext,
        UserInfo,
    },
    uids,
};

/// A hand-driven peer on the raw side of the pipe.
pub struct RawPeer {
    framed: Framed<DuplexStream, PduCodec>,
    /// Every PDU sent or received, for wire-level assertions.
    pub wire_log: Vec<&'static str>,
}

impl RawPeer {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            framed: Framed::new(stream, PduCodec::new(0, false)),
            wire_log: Vec::new(),
        }
    }

    pub async fn send(&mut self, pdu: Pdu) {
        self.wire_log.push(pdu.name());
        self.framed.send(pdu).await.expect("raw peer send");
    }

    /// Receive the next PDU, panicking on EOF or decode failure.
    pub async fn recv(&mut self) -> Pdu {
        let pdu = self
            .framed
            .next()
            .await
            .expect("peer closed unexpectedly")
            .expect("raw peer decode");
        self.wire_log.push(pdu.name());
        pdu
    }

    /// Expect the stream to end.
    pub async fn recv_eof(&mut self) {
        assert!(self.framed.next().await.is_none(), "expected EOF");
    }

    /// Collect P-DATA PDUs until a PDV with the last-fragment bit for the
    /// given mode passes, returning the PDUs seen.
    pub async fn recv_message_pdus(&mut self, command: bool) -> Vec<PDataTf> {
        let mut pdus = Vec::new();
        loop {
            let pdu = self.recv().await;
            let Pdu::PDataTf(data) = pdu else {
                panic!("expected P-DATA-TF, got {}", pdu.name());
            };
            let done = data
                .pdvs
                .iter()
                .any(|pdv| pdv.is_command == command && pdv.is_last);
            pdus.push(data);
            if done {
                return pdus;
            }
        }
    }
}

/// A default association request proposing the given contexts.
pub fn associate_rq(contexts: Vec<ProposedContext>) -> Pdu {
    Pdu::AssociateRq(AssociateRq {
        protocol_version: uids::PROTOCOL_VERSION,
        called_ae_title: "STORESCP".to_string(),
        calling_ae_title: "STORESCU".to_string(),
        application_context_name: uids::APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: contexts,
        user_info: UserInfo::default(),
    })
}

pub fn verification_context(id: u8) -> ProposedContext {
    ProposedContext {
        id,
        abstract_syntax: uids::VERIFICATION_SOP_CLASS.to_string(),
        transfer_syntaxes: vec![uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string()],
    }
}

pub fn secondary_capture_context(id: u8) -> ProposedContext {
    ProposedContext {
        id,
        abstract_syntax: SECONDARY_CAPTURE.to_string(),
        transfer_syntaxes: vec![uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string()],
    }
}

pub const SECONDARY_CAPTURE: &str = "1.2.840.10008.5.1.4.1.1.7";

/// Wrap one complete command set in a single-PDV P-DATA PDU.
pub fn command_pdu(context_id: u8, command: &CommandSet) -> Pdu {
    Pdu::PDataTf(PDataTf {
        pdvs: vec![Pdv {
            context_id,
            is_command: true,
            is_last: true,
            data: command.encode(),
        }],
    })
}

/// One dataset fragment.
pub fn data_pdu(context_id: u8, data: Bytes, is_last: bool) -> Pdu {
    Pdu::PDataTf(PDataTf {
        pdvs: vec![Pdv {
            context_id,
            is_command: false,
            is_last,
            data,
        }],
    })
}

/// Reassemble the command set from a run of P-DATA PDUs.
pub fn decode_command(pdus: &[PDataTf]) -> CommandSet {
    let bytes: Vec<u8> = pdus
        .iter()
        .flat_map(|pdu| pdu.pdvs.iter())
        .filter(|pdv| pdv.is_command)
        .flat_map(|pdv| pdv.data.iter().copied())
        .collect();
    CommandSet::decode(&bytes).expect("command decode")
}

/// Concatenate the dataset bytes from a run of P-DATA PDUs.
pub fn collect_dataset(pdus: &[PDataTf]) -> Vec<u8> {
    pdus.iter()
        .flat_map(|pdu| pdu.pdvs.iter())
        .filter(|pdv| !pdv.is_command)
        .flat_map(|pdv| pdv.data.iter().copied())
        .collect()
}

/// A C-ECHO response command answering `message_id`.
pub fn echo_response(message_id: u16, status: u16) -> CommandSet {
    let mut command = CommandSet::new();
    command.put_str(tags::AFFECTED_SOP_CLASS_UID, uids::VERIFICATION_SOP_CLASS);
    command.put_u16(tags::COMMAND_FIELD, 0x8030);
    command.put_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id);
    command.put_u16(tags::COMMAND_DATA_SET_TYPE, dimserve::dimse::DATA_SET_ABSENT);
    command.put_u16(tags::STATUS, status);
    command
}

/// The command set of a C-ECHO request.
pub fn echo_request_command(message_id: u16) -> CommandSet {
    DimseMessage::echo_request(message_id).command
}
