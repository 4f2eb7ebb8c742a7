//! Malformed and unexpected traffic: aborts, tolerated no-ops, teardown.

mod common;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use common::{RawPeer, associate_rq, command_pdu, decode_command, verification_context};
use dimserve::{
    CEchoProvider,
    DimseMessage,
    Error,
    ProviderHandler,
    ServiceHandlers,
    ServiceOptions,
    Status,
    UpperLayerService,
    dimse::tags,
    pdu::{AbortSource, Pdu},
};

#[derive(Default)]
struct CountingProvider {
    closed: AtomicUsize,
    aborted: AtomicUsize,
}

#[async_trait]
impl ProviderHandler for CountingProvider {
    async fn on_abort(
        &self,
        _source: dimserve::pdu::AbortSource,
        _reason: dimserve::pdu::AbortReason,
    ) {
        self.aborted.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_connection_closed(&self, _error: Option<&Error>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct EchoOk;

#[async_trait]
impl CEchoProvider for EchoOk {
    async fn on_c_echo_request(&self, _request: &DimseMessage) -> Status { Status::SUCCESS }
}

fn server_with(provider: Arc<CountingProvider>) -> (UpperLayerService, dimserve::ServiceHandle) {
    let mut handlers = ServiceHandlers::new();
    handlers.provider = Some(provider);
    handlers.echo = Some(Arc::new(EchoOk));
    UpperLayerService::new(ServiceOptions::default(), handlers)
}

/// An unassigned PDU type is answered with an abort and a single close.
#[tokio::test]
async fn unknown_pdu_type_aborts_the_association() {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let provider = Arc::new(CountingProvider::default());
    let (service, _handle) = server_with(provider.clone());
    let server = tokio::spawn(service.run(far));

    let mut peer = RawPeer::new(near);
    peer.send(associate_rq(vec![verification_context(1)])).await;
    assert!(matches!(peer.recv().await, Pdu::AssociateAc(_)));

    peer.send(Pdu::Unknown {
        pdu_type: 0x7F,
        body: Bytes::from_static(&[1, 2, 3]),
    })
    .await;

    let Pdu::Abort(abort) = peer.recv().await else {
        panic!("expected A-ABORT");
    };
    assert_eq!(abort.source, AbortSource::ServiceUser);
    peer.recv_eof().await;

    let error = server.await.expect("server task").expect_err("faulted close");
    assert!(matches!(error, Error::Protocol(_)));
    assert_eq!(provider.closed.load(Ordering::SeqCst), 1);
}

/// PDU type 0xFF is a tolerated no-op; traffic continues.
#[tokio::test]
async fn pdu_type_ff_is_ignored() {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let provider = Arc::new(CountingProvider::default());
    let (service, _handle) = server_with(provider.clone());
    let server = tokio::spawn(service.run(far));

    let mut peer = RawPeer::new(near);
    peer.send(associate_rq(vec![verification_context(1)])).await;
    assert!(matches!(peer.recv().await, Pdu::AssociateAc(_)));

    peer.send(Pdu::Unknown {
        pdu_type: 0xFF,
        body: Bytes::new(),
    })
    .await;
    peer.send(command_pdu(1, &common::echo_request_command(5))).await;

    let response = peer.recv_message_pdus(true).await;
    let command = decode_command(&response);
    assert_eq!(command.get_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO), Some(5));

    peer.send(Pdu::ReleaseRq).await;
    assert!(matches!(peer.recv().await, Pdu::ReleaseRp));
    server.await.expect("server task").expect("clean close");
}

/// A peer abort upcalls and closes without a response on the wire.
#[tokio::test]
async fn peer_abort_tears_down_silently() {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let provider = Arc::new(CountingProvider::default());
    let (service, _handle) = server_with(provider.clone());
    let server = tokio::spawn(service.run(far));

    let mut peer = RawPeer::new(near);
    peer.send(associate_rq(vec![verification_context(1)])).await;
    assert!(matches!(peer.recv().await, Pdu::AssociateAc(_)));

    peer.send(Pdu::Abort(dimserve::pdu::Abort {
        source: dimserve::pdu::AbortSource::ServiceUser,
        reason: dimserve::pdu::AbortReason::NotSpecified,
    }))
    .await;
    peer.recv_eof().await;

    server.await.expect("server task").expect("abort is not an error");
    assert_eq!(provider.aborted.load(Ordering::SeqCst), 1);
    assert_eq!(provider.closed.load(Ordering::SeqCst), 1);
}

/// A half-written PDU followed by EOF is a transport fault, closed without
/// an abort.
#[tokio::test]
async fn mid_frame_eof_is_a_transport_error() {
    let (mut near, far) = tokio::io::duplex(64 * 1024);
    let provider = Arc::new(CountingProvider::default());
    let (service, _handle) = server_with(provider.clone());
    let server = tokio::spawn(service.run(far));

    // Four bytes of a six-byte PDU header, then EOF.
    near.write_all(&[0x01, 0x00, 0x00, 0x00]).await.expect("partial header");
    drop(near);

    let error = server.await.expect("server task").expect_err("faulted close");
    assert!(matches!(error, Error::Transport(_)));
    assert_eq!(provider.closed.load(Ordering::SeqCst), 1);
}

/// A clean EOF before any traffic closes silently with no error.
#[tokio::test]
async fn clean_eof_closes_silently() {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let provider = Arc::new(CountingProvider::default());
    let (service, _handle) = server_with(provider.clone());
    let server = tokio::spawn(service.run(far));

    drop(near);
    server.await.expect("server task").expect("clean close");
    assert_eq!(provider.closed.load(Ordering::SeqCst), 1);
}
