//! Slicing and reassembly tests for the PDV layer.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rstest::rstest;

use super::*;
use crate::{
    association::{AcceptAllPolicy, Association},
    dimse::{
        CommandField,
        CommandSet,
        DATA_SET_ABSENT,
        DATA_SET_PRESENT,
        FileMetaInformation,
        tags,
    },
    error::{Error, StoreError},
    pdu::{AssociateRq, PDV_HEADER_LEN, Pdu, Pdv, ProposedContext, UserInfo},
    store::{StoreSink, StoreSinkProvider, TempFileStoreProvider},
    uids,
};

fn collect_pdvs(pdus: &[Pdu]) -> Vec<&Pdv> {
    pdus.iter()
        .filter_map(|pdu| match pdu {
            Pdu::PDataTf(data) => Some(data.pdvs.iter()),
            _ => None,
        })
        .flatten()
        .collect()
}

#[rstest]
#[case::single_pdv(64, 10, 1)]
#[case::boundary_fill(64, 58, 1)]
#[case::two_pdus(64, 100, 2)]
#[case::many_pdus(64, 1000, 18)]
fn writer_slices_payloads_under_the_cap(
    #[case] pdu_max: u32,
    #[case] payload_len: usize,
    #[case] expected_pdus: usize,
) {
    let payload = vec![0x5A_u8; payload_len];
    let mut writer = PdvWriter::new(Vec::new(), 1, pdu_max, 1 << 20, 1 << 20);
    futures::executor::block_on(async {
        writer.write(&payload).await.expect("write");
        writer.flush(true).await.expect("flush");
    });
    assert_eq!(writer.bytes_written(), payload_len as u64);
    let pdus = writer.into_sink();
    assert_eq!(pdus.len(), expected_pdus);

    // Invariant: no PDU body exceeds the negotiated maximum.
    for pdu in &pdus {
        if let Pdu::PDataTf(data) = pdu {
            assert!(data.body_len() <= pdu_max as usize);
        }
    }

    // Invariant: concatenated PDV payloads equal the input bytes.
    let pdvs = collect_pdvs(&pdus);
    let total: Vec<u8> = pdvs.iter().flat_map(|pdv| pdv.data.iter().copied()).collect();
    assert_eq!(total, payload);

    // Invariant: exactly the final PDV carries the last-fragment bit.
    let last_flags: Vec<bool> = pdvs.iter().map(|pdv| pdv.is_last).collect();
    assert_eq!(last_flags.iter().filter(|l| **l).count(), 1);
    assert_eq!(last_flags.last(), Some(&true));
}

#[tokio::test]
async fn writer_closes_the_command_chain_before_dataset_fragments() {
    let command = vec![0x11_u8; 40];
    let dataset = vec![0x22_u8; 150];
    let mut writer = PdvWriter::new(Vec::new(), 5, 64, 1 << 20, 1 << 20);
    writer.write(&command).await.expect("command bytes");
    writer.set_command(false).await.expect("mode switch");
    writer.write(&dataset).await.expect("dataset bytes");
    writer.flush(true).await.expect("final flush");

    let pdus = writer.into_sink();
    let pdvs = collect_pdvs(&pdus);
    let command_pdvs: Vec<_> = pdvs.iter().take_while(|pdv| pdv.is_command).collect();
    assert!(!command_pdvs.is_empty());
    assert!(command_pdvs.last().is_some_and(|pdv| pdv.is_last));
    // Command fragments strictly precede dataset fragments.
    let data_pdvs = &pdvs[command_pdvs.len()..];
    assert!(data_pdvs.iter().all(|pdv| !pdv.is_command));
    assert!(data_pdvs.last().is_some_and(|pdv| pdv.is_last));
    assert!(pdvs.iter().all(|pdv| pdv.context_id == 5));
}

#[tokio::test]
async fn writer_ignores_the_negotiated_cap_when_it_is_zero() {
    let payload = vec![0_u8; 4000];
    let mut writer = PdvWriter::new(Vec::new(), 1, 0, 1 << 20, 2048);
    writer.set_command(false).await.expect("switch to data");
    writer.write(&payload).await.expect("write");
    writer.flush(true).await.expect("flush");
    let pdus = writer.into_sink();
    // Bounded only by the data buffer cap.
    assert_eq!(pdus.len(), 2);
    for pdu in &pdus {
        if let Pdu::PDataTf(data) = pdu {
            assert!(data.body_len() <= 2048);
        }
    }
}

#[tokio::test]
async fn writer_reserves_pdv_header_space() {
    let pdu_max = 64_u32;
    let payload = vec![9_u8; 200];
    let mut writer = PdvWriter::new(Vec::new(), 1, pdu_max, 1 << 20, 1 << 20);
    writer.write(&payload).await.expect("write");
    writer.flush(true).await.expect("flush");
    for pdv in collect_pdvs(&writer.into_sink()) {
        assert!(pdv.data.len() + PDV_HEADER_LEN <= pdu_max as usize);
    }
}

fn test_association() -> Arc<Association> {
    let rq = AssociateRq {
        protocol_version: uids::PROTOCOL_VERSION,
        called_ae_title: "SCP".to_string(),
        calling_ae_title: "SCU".to_string(),
        application_context_name: uids::APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![ProposedContext {
            id: 1,
            abstract_syntax: "1.2.840.10008.5.1.4.1.1.7".to_string(),
            transfer_syntaxes: vec![uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string()],
        }],
        user_info: UserInfo::default(),
    };
    let mut association = Association::from_request(&rq);
    association.accept_contexts(&AcceptAllPolicy);
    Arc::new(association)
}

fn command_pdv(command: &CommandSet, is_last: bool) -> Pdv {
    Pdv {
        context_id: 1,
        is_command: true,
        is_last,
        data: command.encode(),
    }
}

fn echo_command() -> CommandSet {
    let mut command = CommandSet::new();
    command.put_u16(tags::COMMAND_FIELD, CommandField::CEchoRq.to_wire());
    command.put_u16(tags::MESSAGE_ID, 7);
    command.put_u16(tags::COMMAND_DATA_SET_TYPE, DATA_SET_ABSENT);
    command
}

fn store_command() -> CommandSet {
    let mut command = CommandSet::new();
    command.put_str(tags::AFFECTED_SOP_CLASS_UID, "1.2.840.10008.5.1.4.1.1.7");
    command.put_u16(tags::COMMAND_FIELD, CommandField::CStoreRq.to_wire());
    command.put_u16(tags::MESSAGE_ID, 9);
    command.put_u16(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT);
    command.put_str(tags::AFFECTED_SOP_INSTANCE_UID, "1.2.3.4.5");
    command
}

fn temp_provider() -> Arc<dyn StoreSinkProvider> { Arc::new(TempFileStoreProvider::default()) }

#[tokio::test]
async fn command_without_dataset_completes_immediately() {
    let mut reassembler = Reassembler::new(test_association(), temp_provider());
    let outcome = reassembler
        .push(command_pdv(&echo_command(), true))
        .await
        .expect("push");
    let ReassemblyOutcome::Complete(incoming) = outcome else {
        panic!("expected a complete message");
    };
    assert_eq!(incoming.message.command_field(), Ok(CommandField::CEchoRq));
    assert_eq!(incoming.message.message_id(), Some(7));
    assert!(incoming.message.dataset.is_none());
}

#[tokio::test]
async fn split_command_reassembles_across_pdvs() {
    let wire = echo_command().encode();
    let (head, tail) = wire.split_at(10);
    let mut reassembler = Reassembler::new(test_association(), temp_provider());
    let first = reassembler
        .push(Pdv {
            context_id: 1,
            is_command: true,
            is_last: false,
            data: Bytes::copy_from_slice(head),
        })
        .await
        .expect("first fragment");
    assert!(matches!(first, ReassemblyOutcome::Pending));
    let second = reassembler
        .push(Pdv {
            context_id: 1,
            is_command: true,
            is_last: true,
            data: Bytes::copy_from_slice(tail),
        })
        .await
        .expect("second fragment");
    assert!(matches!(second, ReassemblyOutcome::Complete(_)));
}

#[tokio::test]
async fn store_dataset_streams_through_the_temp_file_sink() {
    let mut reassembler = Reassembler::new(test_association(), temp_provider());
    let outcome = reassembler
        .push(command_pdv(&store_command(), true))
        .await
        .expect("command");
    assert!(matches!(outcome, ReassemblyOutcome::Pending));

    let chunk = vec![0xAB_u8; 500];
    for _ in 0..3 {
        let outcome = reassembler
            .push(Pdv {
                context_id: 1,
                is_command: false,
                is_last: false,
                data: Bytes::from(chunk.clone()),
            })
            .await
            .expect("dataset fragment");
        assert!(matches!(outcome, ReassemblyOutcome::Pending));
    }
    let outcome = reassembler
        .push(Pdv {
            context_id: 1,
            is_command: false,
            is_last: true,
            data: Bytes::from(chunk.clone()),
        })
        .await
        .expect("last fragment");

    let ReassemblyOutcome::Complete(incoming) = outcome else {
        panic!("expected a complete store request");
    };
    let file = incoming.file.expect("staged file");
    assert_eq!(file.meta.media_storage_sop_instance_uid, "1.2.3.4.5");
    assert_eq!(file.meta.source_application_entity_title, "SCU");
    let dataset = incoming.message.dataset.expect("attached dataset");
    let bytes = dataset.read().await.expect("read spill file");
    assert_eq!(bytes.len(), 2000);
    assert!(bytes.iter().all(|b| *b == 0xAB));
}

#[tokio::test]
async fn dataset_fragment_while_command_open_is_a_protocol_error() {
    let wire = echo_command().encode();
    let mut reassembler = Reassembler::new(test_association(), temp_provider());
    reassembler
        .push(Pdv {
            context_id: 1,
            is_command: true,
            is_last: false,
            data: wire.slice(..4),
        })
        .await
        .expect("open command chain");
    let err = reassembler
        .push(Pdv {
            context_id: 1,
            is_command: false,
            is_last: true,
            data: Bytes::from_static(&[0, 0]),
        })
        .await
        .expect_err("interleaved fragment");
    assert!(matches!(err, Error::Protocol(_)));
}

/// Sink provider whose writes fail, for exercising the non-fatal path.
struct FailingProvider;

struct FailingSink;

#[async_trait]
impl StoreSink for FailingSink {
    async fn write(&mut self, _bytes: &[u8]) -> Result<(), StoreError> {
        Err(StoreError::Io(std::io::Error::other("disk full")))
    }

    async fn finalize(self: Box<Self>) -> Result<Option<crate::store::DicomFile>, StoreError> {
        unreachable!("writes never succeed")
    }
}

#[async_trait]
impl StoreSinkProvider for FailingProvider {
    async fn create_sink(
        &self,
        _meta: FileMetaInformation,
    ) -> Result<Box<dyn StoreSink>, StoreError> {
        Ok(Box::new(FailingSink))
    }
}

#[tokio::test]
async fn store_sink_failure_reports_without_poisoning_the_stream() {
    let mut reassembler = Reassembler::new(test_association(), Arc::new(FailingProvider));
    reassembler
        .push(command_pdv(&store_command(), true))
        .await
        .expect("command");
    let outcome = reassembler
        .push(Pdv {
            context_id: 1,
            is_command: false,
            is_last: false,
            data: Bytes::from_static(&[1, 2, 3]),
        })
        .await
        .expect("write failure is not fatal");
    assert!(matches!(outcome, ReassemblyOutcome::StoreFailed { .. }));

    // Remaining fragments of the doomed dataset are swallowed.
    let outcome = reassembler
        .push(Pdv {
            context_id: 1,
            is_command: false,
            is_last: true,
            data: Bytes::from_static(&[4, 5]),
        })
        .await
        .expect("discarded fragment");
    assert!(matches!(outcome, ReassemblyOutcome::Pending));

    // The next command starts a fresh message.
    let outcome = reassembler
        .push(command_pdv(&echo_command(), true))
        .await
        .expect("next message");
    assert!(matches!(outcome, ReassemblyOutcome::Complete(_)));
}
