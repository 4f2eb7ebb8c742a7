//! Large C-STORE transfers: spill-to-disk reception and outbound
//! fragmentation under the negotiated PDU cap.

mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;

use common::{
    RawPeer,
    SECONDARY_CAPTURE,
    associate_rq,
    command_pdu,
    data_pdu,
    decode_command,
    secondary_capture_context,
};
use dimserve::{
    AssociationRequest,
    CStoreProvider,
    CommandField,
    CommandSet,
    Dataset,
    DicomFile,
    DimseMessage,
    Priority,
    ProviderHandler,
    ServiceHandlers,
    ServiceOptions,
    Status,
    UpperLayerService,
    dimse::tags,
    pdu::{Pdu, UserInfo},
    uids,
};

const DATASET_LEN: usize = 12 * 1024 * 1024;

fn big_dataset() -> Vec<u8> {
    (0..DATASET_LEN).map(|i| (i % 251) as u8).collect()
}

fn store_command(message_id: u16) -> CommandSet {
    let mut command = CommandSet::new();
    command.put_str(tags::AFFECTED_SOP_CLASS_UID, SECONDARY_CAPTURE);
    command.put_u16(tags::COMMAND_FIELD, CommandField::CStoreRq.to_wire());
    command.put_u16(tags::MESSAGE_ID, message_id);
    command.put_u16(tags::PRIORITY, Priority::Medium.to_wire());
    command.put_u16(tags::COMMAND_DATA_SET_TYPE, dimserve::dimse::DATA_SET_PRESENT);
    command.put_str(tags::AFFECTED_SOP_INSTANCE_UID, "1.2.3.4.5.6.7");
    command
}

struct CapturingStore {
    file: Mutex<Option<oneshot::Sender<DicomFile>>>,
}

#[async_trait]
impl CStoreProvider for CapturingStore {
    async fn on_c_store_request(&self, request: &DimseMessage, file: Option<DicomFile>) -> Status {
        assert_eq!(request.command_field(), Ok(CommandField::CStoreRq));
        let file = file.expect("spilled file");
        // The temp file must still exist while the upcall runs.
        assert!(file.path().is_some_and(std::path::Path::exists));
        if let Some(tx) = self.file.lock().expect("lock").take() {
            let _ = tx.send(file);
        }
        Status::SUCCESS
    }
}

struct AcceptAll;

#[async_trait]
impl ProviderHandler for AcceptAll {}

#[tokio::test]
async fn large_store_spills_through_the_temp_file_sink() {
    let (near, far) = tokio::io::duplex(256 * 1024);
    let (file_tx, file_rx) = oneshot::channel();
    let mut handlers = ServiceHandlers::new();
    handlers.provider = Some(Arc::new(AcceptAll));
    handlers.store = Some(Arc::new(CapturingStore {
        file: Mutex::new(Some(file_tx)),
    }));
    let (service, _handle) = UpperLayerService::new(ServiceOptions::default(), handlers);
    let server = tokio::spawn(service.run(far));

    let mut peer = RawPeer::new(near);
    peer.send(associate_rq(vec![secondary_capture_context(1)])).await;
    let Pdu::AssociateAc(_) = peer.recv().await else {
        panic!("expected A-ASSOCIATE-AC");
    };

    peer.send(command_pdu(1, &store_command(1))).await;
    let dataset = big_dataset();
    let fragment = 16_000;
    let mut sent = 0;
    while sent < dataset.len() {
        let end = (sent + fragment).min(dataset.len());
        peer.send(data_pdu(
            1,
            Bytes::copy_from_slice(&dataset[sent..end]),
            end == dataset.len(),
        ))
        .await;
        sent = end;
    }

    let response = peer.recv_message_pdus(true).await;
    let command = decode_command(&response);
    assert_eq!(command.get_u16(tags::COMMAND_FIELD), Some(0x8001));
    assert_eq!(command.get_u16(tags::STATUS), Some(0x0000));

    let file = file_rx.await.expect("file captured");
    assert_eq!(file.meta.media_storage_sop_instance_uid, "1.2.3.4.5.6.7");
    assert_eq!(file.meta.media_storage_sop_class_uid, SECONDARY_CAPTURE);
    assert_eq!(file.meta.transfer_syntax_uid, uids::IMPLICIT_VR_LITTLE_ENDIAN);
    assert_eq!(file.meta.source_application_entity_title, "STORESCU");
    let received = file.dataset.read().await.expect("read spill file");
    assert_eq!(received.len(), DATASET_LEN);
    assert_eq!(&received[..], &dataset[..]);

    peer.send(Pdu::ReleaseRq).await;
    assert!(matches!(peer.recv().await, Pdu::ReleaseRp));
    server.await.expect("server task").expect("clean close");
}

#[tokio::test]
async fn outbound_store_fragments_under_the_negotiated_cap() {
    let (near, far) = tokio::io::duplex(256 * 1024);
    let (service, handle) =
        UpperLayerService::new(ServiceOptions::default(), ServiceHandlers::new());
    let client = tokio::spawn(service.run(far));

    let mut peer = RawPeer::new(near);
    handle
        .request_association(AssociationRequest {
            calling_ae_title: "STORESCU".to_string(),
            called_ae_title: "STORESCP".to_string(),
            presentation_contexts: vec![secondary_capture_context(1)],
            max_async_ops: None,
        })
        .await
        .expect("request association");
    let Pdu::AssociateRq(rq) = peer.recv().await else {
        panic!("expected A-ASSOCIATE-RQ");
    };
    let ac = {
        let mut association = dimserve::Association::from_request(&rq);
        association.accept_contexts(&dimserve::AcceptAllPolicy);
        // Advertise the default 16 KiB receive window back to the engine.
        Pdu::AssociateAc(association.to_accept_pdu(UserInfo::default()))
    };
    peer.send(ac).await;

    let dataset = big_dataset();
    let (response_tx, response_rx) = oneshot::channel();
    let mut response_tx = Some(response_tx);
    handle.send_request(
        DimseMessage::store_request(
            1,
            SECONDARY_CAPTURE,
            "1.2.3.4.5.6.7",
            Priority::Medium,
            Dataset::in_memory(uids::IMPLICIT_VR_LITTLE_ENDIAN, Bytes::from(dataset.clone())),
        ),
        move |response| {
            if let Some(tx) = response_tx.take() {
                let _ = tx.send(response.status());
            }
        },
    );

    let pdus = peer.recv_message_pdus(false).await;
    // 12 MiB under a 16384-byte cap needs at least 768 data PDUs.
    assert!(pdus.len() >= 768, "only {} PDUs", pdus.len());
    for pdu in &pdus {
        assert!(pdu.body_len() <= 16_384);
    }
    let data_pdvs: Vec<_> = pdus
        .iter()
        .flat_map(|pdu| pdu.pdvs.iter())
        .filter(|pdv| !pdv.is_command)
        .collect();
    assert!(data_pdvs.last().is_some_and(|pdv| pdv.is_last));
    assert_eq!(
        data_pdvs.iter().filter(|pdv| pdv.is_last).count(),
        1,
        "exactly one final data fragment"
    );
    assert_eq!(common::collect_dataset(&pdus), dataset);

    // Answer so the pending entry retires, then shut down.
    let mut response = CommandSet::new();
    response.put_str(tags::AFFECTED_SOP_CLASS_UID, SECONDARY_CAPTURE);
    response.put_u16(tags::COMMAND_FIELD, 0x8001);
    response.put_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, 1);
    response.put_u16(tags::COMMAND_DATA_SET_TYPE, dimserve::dimse::DATA_SET_ABSENT);
    response.put_u16(tags::STATUS, 0x0000);
    peer.send(command_pdu(1, &response)).await;
    assert_eq!(response_rx.await.expect("status"), Some(Status::SUCCESS));

    handle.release().await.expect("release");
    assert!(matches!(peer.recv().await, Pdu::ReleaseRq));
    peer.send(Pdu::ReleaseRp).await;
    client.await.expect("client task").expect("clean close");
}
