//! Bounded PDU queue behaviour: submitters wait, order is preserved.

use bytes::Bytes;
use tokio::sync::mpsc;

use dimserve::{pdu::Pdu, pdv::PdvWriter};

fn pdv_payloads(pdu: &Pdu) -> Vec<Bytes> {
    match pdu {
        Pdu::PDataTf(data) => data.pdvs.iter().map(|pdv| pdv.data.clone()).collect(),
        _ => panic!("expected P-DATA-TF"),
    }
}

/// With a queue bound of two, a writer producing ten PDUs blocks until the
/// consumer drains; every PDU still arrives, in FIFO order.
#[tokio::test]
async fn submitters_wait_on_a_full_queue_without_losing_order() {
    let (pdu_tx, mut pdu_rx) = mpsc::channel::<Pdu>(2);

    // Ten PDUs of one full PDV each under a 64-byte cap.
    let payload_unit = 64 - 6;
    let total = payload_unit * 10;
    let payload: Vec<u8> = (0..total).map(|i| (i % 239) as u8).collect();

    let producer = tokio::spawn({
        let payload = payload.clone();
        async move {
            let mut writer = PdvWriter::new(pdu_tx, 1, 64, 1 << 20, 1 << 20);
            writer.write(&payload).await.expect("write");
            writer.flush(true).await.expect("flush");
        }
    });

    // The producer cannot finish while the queue (capacity 2) is full.
    tokio::task::yield_now().await;
    assert!(!producer.is_finished());

    let mut received = Vec::new();
    let mut pdu_count = 0;
    while let Some(pdu) = pdu_rx.recv().await {
        pdu_count += 1;
        for data in pdv_payloads(&pdu) {
            received.extend_from_slice(&data);
        }
    }
    producer.await.expect("producer");

    assert_eq!(pdu_count, 10);
    assert_eq!(received, payload);
}

/// The consumer never observes more than the bound in flight.
#[tokio::test]
async fn the_queue_never_holds_more_than_its_bound() {
    let (pdu_tx, mut pdu_rx) = mpsc::channel::<Pdu>(2);
    let producer = tokio::spawn(async move {
        let mut writer = PdvWriter::new(pdu_tx, 1, 64, 1 << 20, 1 << 20);
        for chunk in 0..10 {
            let bytes = vec![chunk as u8; 58];
            writer.write(&bytes).await.expect("write");
        }
        writer.flush(true).await.expect("flush");
    });

    let mut drained = 0;
    loop {
        // Queue occupancy is bounded by the channel capacity.
        assert!(pdu_rx.len() <= 2);
        match pdu_rx.recv().await {
            Some(pdu) => {
                assert!(matches!(pdu, Pdu::PDataTf(_)));
                drained += 1;
            }
            None => break,
        }
    }
    assert_eq!(drained, 10);
    producer.await.expect("producer");
}

/// Dropping the consumer surfaces `Closed` to the submitter instead of
/// wedging it.
#[tokio::test]
async fn a_closed_queue_fails_the_submitter() {
    let (pdu_tx, pdu_rx) = mpsc::channel::<Pdu>(1);
    drop(pdu_rx);
    let mut writer = PdvWriter::new(pdu_tx, 1, 64, 1 << 20, 1 << 20);
    writer.write(&[0u8; 200]).await.expect_err("queue is gone");
    // A fresh writer with a live queue still works.
    let (pdu_tx, mut pdu_rx) = mpsc::channel::<Pdu>(1);
    let mut writer = PdvWriter::new(pdu_tx, 1, 64, 1 << 20, 1 << 20);
    writer.write(&[0u8; 10]).await.expect("write");
    writer.flush(true).await.expect("flush");
    let pdu = pdu_rx.recv().await.expect("one PDU");
    let payloads = pdv_payloads(&pdu);
    assert_eq!(payloads.len(), 1);
    assert!(matches!(
        &pdu,
        Pdu::PDataTf(data) if data.pdvs[0].is_last
    ));
}
