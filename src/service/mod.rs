//! The upper-layer service engine.
//!
//! One [`UpperLayerService`] drives one connection. Its [`run`] future owns
//! the byte stream and multiplexes three cooperative loops:
//!
//! - the **reader**, which frames PDUs, walks the association state
//!   machine, reassembles DIMSE messages, and dispatches upcalls;
//! - the **message pump**, which drains the DIMSE send queue one message
//!   at a time, enforcing the asynchronous-operations window;
//! - the **PDU writer**, which drains the bounded PDU queue onto the wire.
//!
//! The bounded PDU queue is the engine's backpressure: submitters (the
//! pump's PDV writer, the handle's handshake operations) wait for queue
//! space, which bounds sender-side memory no matter how large a message
//! is. Mutable session state lives in a single mutex that is never held
//! across an await; all upcalls run outside it.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    sync::{Notify, mpsc},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};

use crate::{
    association::{Association, ContextPolicy, ContextVerdict, PresentationContext},
    dimse::{CommandField, DimseMessage, Status, command},
    error::{Error, ProtocolError, protocol_error_of},
    pdu::{Abort, AbortReason, AbortSource, Pdu, PduCodec, UserInfo},
    pdv::{IncomingDimse, PdvWriter, Reassembler, ReassemblyOutcome},
    store::{StoreSinkProvider, TempFileStoreProvider},
    transcode::{DatasetCodec, IdentityCodec},
    uids,
};

mod handle;
mod handlers;
mod options;

pub use handle::{AssociationRequest, ServiceHandle};
pub use handlers::{
    AssociationVerdict,
    CEchoProvider,
    CFindProvider,
    CMoveProvider,
    CStoreProvider,
    NServiceProvider,
    ProviderHandler,
    ProviderResponse,
    ResponseStream,
    ServiceHandlers,
    UserHandler,
    response_channel,
};
pub use options::ServiceOptions;

/// Callback receiving every response to one outstanding request.
pub type ResponseCallback = Box<dyn FnMut(DimseMessage) + Send + 'static>;

/// Where the session is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Connected, no association traffic yet.
    Idle,
    /// A-ASSOCIATE-RQ sent, awaiting the peer's answer.
    RequestSent,
    /// Association established; DIMSE traffic flows.
    Associated,
    /// A-RELEASE-RQ sent, awaiting A-RELEASE-RP.
    Releasing,
    /// Torn down; sends are dropped and reads stop.
    Closed,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::RequestSent => "awaiting association accept",
            Self::Associated => "associated",
            Self::Releasing => "releasing",
            Self::Closed => "closed",
        }
    }
}

/// One message queued for transmission.
pub(crate) struct OutgoingMessage {
    pub(crate) message: DimseMessage,
    pub(crate) kind: OutgoingKind,
}

pub(crate) enum OutgoingKind {
    /// Tracked in `pending` and counted against the async-ops window.
    Request { on_response: ResponseCallback },
    /// Fire-and-forget.
    Response,
}

pub(crate) struct SessionState {
    pub(crate) phase: Phase,
    /// Established association, read-only once set.
    pub(crate) association: Option<Arc<Association>>,
    /// Requestor-side proposal awaiting the peer's AC.
    pub(crate) proposed: Option<Association>,
    /// Outstanding requests by message id.
    pub(crate) pending: HashMap<u16, ResponseCallback>,
    pub(crate) log_id: String,
    close_error: Option<Error>,
    closed_upcalled: bool,
}

pub(crate) struct Shared {
    pub(crate) options: ServiceOptions,
    pub(crate) handlers: ServiceHandlers,
    pub(crate) store: Arc<dyn StoreSinkProvider>,
    pub(crate) codec: Arc<dyn DatasetCodec>,
    pub(crate) state: Mutex<SessionState>,
    pub(crate) pdu_tx: mpsc::Sender<Pdu>,
    pub(crate) msg_tx: mpsc::UnboundedSender<OutgoingMessage>,
    /// Woken whenever a pending entry is retired, freeing an async-op slot.
    pub(crate) pending_changed: Notify,
    pub(crate) shutdown: CancellationToken,
}

impl Shared {
    pub(crate) fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn log_id(&self) -> String { self.state().log_id.clone() }

    /// Flip the session to `Closed`. Idempotent; the first caller's error
    /// wins and later calls are no-ops.
    pub(crate) fn begin_close(&self, error: Option<Error>) {
        {
            let mut state = self.state();
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Closed;
            state.close_error = error;
        }
        self.shutdown.cancel();
        self.pending_changed.notify_waiters();
    }

    fn is_closing(&self) -> bool { self.state().phase == Phase::Closed }

    /// Local user info advertised in RQ and AC PDUs.
    pub(crate) fn local_user_info(&self, max_async_ops: Option<(u16, u16)>) -> UserInfo {
        UserInfo {
            max_pdu_length: self.options.max_receive_pdu_length,
            implementation_class_uid: self.options.implementation_class_uid.clone(),
            implementation_version_name: Some(self.options.implementation_version_name.clone()),
            max_async_ops,
            ..UserInfo::default()
        }
    }

    /// Queue a response message for the pump.
    pub(crate) fn enqueue_response(&self, message: DimseMessage) {
        if self
            .msg_tx
            .send(OutgoingMessage {
                message,
                kind: OutgoingKind::Response,
            })
            .is_err()
        {
            log::debug!("{}: dropping response, connection closed", self.log_id());
        }
    }
}

/// Applies a [`ProviderHandler`]'s context verdicts during negotiation.
struct ProviderPolicy<'a>(&'a dyn ProviderHandler);

impl ContextPolicy for ProviderPolicy<'_> {
    fn evaluate(&self, proposed: &PresentationContext) -> ContextVerdict {
        self.0.evaluate_context(proposed)
    }
}

/// The service engine for one connection.
///
/// Construct with [`UpperLayerService::new`], register handlers, then hand
/// the byte stream to [`run`](Self::run). The returned [`ServiceHandle`]
/// is the application's way in: association control and DIMSE sends.
pub struct UpperLayerService {
    shared: Arc<Shared>,
    pdu_rx: mpsc::Receiver<Pdu>,
    msg_rx: mpsc::UnboundedReceiver<OutgoingMessage>,
}

impl UpperLayerService {
    /// Create an engine and its handle.
    #[must_use]
    pub fn new(options: ServiceOptions, handlers: ServiceHandlers) -> (Self, ServiceHandle) {
        Self::with_collaborators(
            options,
            handlers,
            Arc::new(TempFileStoreProvider::default()),
            Arc::new(IdentityCodec),
        )
    }

    /// Create an engine with explicit store and codec collaborators.
    #[must_use]
    pub fn with_collaborators(
        options: ServiceOptions,
        handlers: ServiceHandlers,
        store: Arc<dyn StoreSinkProvider>,
        codec: Arc<dyn DatasetCodec>,
    ) -> (Self, ServiceHandle) {
        let (pdu_tx, pdu_rx) = mpsc::channel(options.max_pdus_in_queue.max(1));
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let log_id = options.log_name.clone();
        let shared = Arc::new(Shared {
            options,
            handlers,
            store,
            codec,
            state: Mutex::new(SessionState {
                phase: Phase::Idle,
                association: None,
                proposed: None,
                pending: HashMap::new(),
                log_id,
                close_error: None,
                closed_upcalled: false,
            }),
            pdu_tx,
            msg_tx,
            pending_changed: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        let handle = ServiceHandle::new(shared.clone());
        (
            Self {
                shared,
                pdu_rx,
                msg_rx,
            },
            handle,
        )
    }

    /// Drive the connection until it closes.
    ///
    /// Returns when the session reaches `Closed`: after a release
    /// handshake, an abort from either side, a clean EOF, or a failure.
    /// The matching `on_connection_closed` upcall fires exactly once
    /// before this returns.
    ///
    /// # Errors
    ///
    /// Returns the error that closed the connection, if any.
    pub async fn run<S>(self, stream: S) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let Self {
            shared,
            pdu_rx,
            msg_rx,
        } = self;
        let codec = PduCodec::new(
            shared.options.max_receive_pdu_length,
            shared.options.strict_pdu_length,
        );
        let (read_half, write_half) = tokio::io::split(stream);
        let framed_read = FramedRead::new(read_half, codec.clone());
        let framed_write = FramedWrite::new(write_half, codec);

        tokio::join!(
            read_loop(&shared, framed_read),
            pump_loop(&shared, msg_rx),
            write_loop(&shared, pdu_rx, framed_write),
        );

        match finish(&shared).await {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Deliver the close upcall exactly once and surface the close error.
async fn finish(shared: &Arc<Shared>) -> Option<Error> {
    let error = {
        let mut state = shared.state();
        if state.closed_upcalled {
            return None;
        }
        state.closed_upcalled = true;
        state.phase = Phase::Closed;
        state.close_error.take()
    };
    if let Some(provider) = &shared.handlers.provider {
        provider.on_connection_closed(error.as_ref()).await;
    }
    if let Some(user) = &shared.handlers.user {
        user.on_connection_closed(error.as_ref()).await;
    }
    error
}

async fn read_loop<S>(shared: &Arc<Shared>, mut framed: FramedRead<ReadHalf<S>, PduCodec>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut reassembler = None;
    loop {
        let item = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break,
            item = framed.next() => item,
        };
        match item {
            // Clean EOF at a frame boundary: silent close.
            None => {
                shared.begin_close(None);
                break;
            }
            Some(Err(error)) => {
                if let Some(protocol) = protocol_error_of(&error) {
                    let protocol = protocol.clone();
                    abort_and_close(shared, protocol).await;
                } else if shared.is_closing() {
                    log::debug!("{}: read error after close: {error}", shared.log_id());
                    shared.begin_close(None);
                } else {
                    log::warn!("{}: transport failed: {error}", shared.log_id());
                    shared.begin_close(Some(Error::Transport(error)));
                }
                break;
            }
            Some(Ok(pdu)) => {
                if let Err(error) = dispatch_pdu(shared, &mut reassembler, pdu).await {
                    match error {
                        Error::Protocol(protocol) => abort_and_close(shared, protocol).await,
                        other => {
                            log::warn!("{}: receive failed: {other}", shared.log_id());
                            shared.begin_close(Some(other));
                        }
                    }
                    break;
                }
                if shared.is_closing() {
                    break;
                }
            }
        }
    }
}

/// Answer a protocol violation with an abort, then close.
async fn abort_and_close(shared: &Arc<Shared>, error: ProtocolError) {
    log::warn!("{}: aborting association: {error}", shared.log_id());
    let abort = Pdu::Abort(Abort {
        source: AbortSource::ServiceUser,
        reason: AbortReason::NotSpecified,
    });
    // Queue the abort before cancelling so the writer drains it.
    let _ = shared.pdu_tx.send(abort).await;
    shared.begin_close(Some(error.into()));
}

async fn dispatch_pdu(
    shared: &Arc<Shared>,
    reassembler: &mut Option<Reassembler>,
    pdu: Pdu,
) -> Result<(), Error> {
    let phase = shared.state().phase;
    match pdu {
        Pdu::AssociateRq(rq) => {
            if phase != Phase::Idle {
                return Err(unexpected(0x01, phase));
            }
            let Some(provider) = shared.handlers.provider.clone() else {
                return Err(unexpected(0x01, phase));
            };
            let mut association = Association::from_request(&rq);
            association.accept_contexts(&ProviderPolicy(provider.as_ref()));
            match provider.on_association_request(&association).await {
                AssociationVerdict::Accept => {
                    // Echo the proposed asynchronous-operations window; the
                    // pump serializes sends, so any window is honoured.
                    let ac = association
                        .to_accept_pdu(shared.local_user_info(rq.user_info.max_async_ops));
                    let association = Arc::new(association);
                    {
                        let mut state = shared.state();
                        state.phase = Phase::Associated;
                        state.association = Some(association.clone());
                        if shared.options.use_remote_ae_for_log_name {
                            state.log_id = association.calling_ae_title.clone();
                        }
                    }
                    *reassembler =
                        Some(Reassembler::new(association.clone(), shared.store.clone()));
                    log::debug!(
                        "{}: association accepted for {} -> {}",
                        shared.log_id(),
                        association.calling_ae_title,
                        association.called_ae_title
                    );
                    send_pdu(shared, Pdu::AssociateAc(ac)).await
                }
                AssociationVerdict::Reject {
                    result,
                    source,
                    reason,
                } => {
                    log::debug!("{}: rejecting association: {reason:?}", shared.log_id());
                    send_pdu(
                        shared,
                        Pdu::AssociateRj(crate::pdu::AssociateRj {
                            result,
                            source,
                            reason,
                        }),
                    )
                    .await?;
                    shared.begin_close(None);
                    Ok(())
                }
            }
        }
        Pdu::AssociateAc(ac) => {
            if phase != Phase::RequestSent {
                return Err(unexpected(0x02, phase));
            }
            let association = {
                let mut state = shared.state();
                let Some(mut proposed) = state.proposed.take() else {
                    return Err(unexpected(0x02, phase));
                };
                proposed.apply_acceptance(&ac);
                let association = Arc::new(proposed);
                state.phase = Phase::Associated;
                state.association = Some(association.clone());
                if shared.options.use_remote_ae_for_log_name {
                    state.log_id = association.called_ae_title.clone();
                }
                association
            };
            *reassembler = Some(Reassembler::new(association.clone(), shared.store.clone()));
            if let Some(user) = &shared.handlers.user {
                user.on_association_accept(&association).await;
            }
            Ok(())
        }
        Pdu::AssociateRj(rj) => {
            if phase != Phase::RequestSent {
                return Err(unexpected(0x03, phase));
            }
            if let Some(user) = &shared.handlers.user {
                user.on_association_reject(rj.result, rj.source, rj.reason).await;
            }
            shared.begin_close(None);
            Ok(())
        }
        Pdu::PDataTf(data) => {
            if phase != Phase::Associated && phase != Phase::Releasing {
                return Err(unexpected(0x04, phase));
            }
            let Some(reassembler) = reassembler.as_mut() else {
                return Err(unexpected(0x04, phase));
            };
            for pdv in data.pdvs {
                if shared.options.log_data_pdus {
                    log::debug!(
                        "{}: PDV ctx={} command={} last={} {} bytes",
                        shared.log_id(),
                        pdv.context_id,
                        pdv.is_command,
                        pdv.is_last,
                        pdv.data.len()
                    );
                }
                match reassembler.push(pdv).await? {
                    ReassemblyOutcome::Pending => {}
                    ReassemblyOutcome::Complete(incoming) => {
                        dispatch_message(shared, incoming).await?;
                    }
                    ReassemblyOutcome::StoreFailed {
                        request,
                        filename,
                        error,
                    } => {
                        shared
                            .store
                            .on_store_exception(filename.as_deref(), &error)
                            .await;
                        let error = Error::Store(error);
                        if let Some(store) = &shared.handlers.store {
                            store
                                .on_c_store_exception(filename.as_deref(), &error)
                                .await;
                        }
                        respond(shared, &request, Status::PROCESSING_FAILURE, None);
                    }
                }
            }
            Ok(())
        }
        Pdu::ReleaseRq => {
            if phase != Phase::Associated {
                return Err(unexpected(0x05, phase));
            }
            if let Some(provider) = &shared.handlers.provider {
                provider.on_release_request().await;
            }
            send_pdu(shared, Pdu::ReleaseRp).await?;
            shared.begin_close(None);
            Ok(())
        }
        Pdu::ReleaseRp => {
            if phase != Phase::Releasing {
                return Err(unexpected(0x06, phase));
            }
            if let Some(user) = &shared.handlers.user {
                user.on_release_response().await;
            }
            shared.begin_close(None);
            Ok(())
        }
        Pdu::Abort(abort) => {
            log::debug!(
                "{}: peer aborted: {:?} / {:?}",
                shared.log_id(),
                abort.source,
                abort.reason
            );
            if let Some(provider) = &shared.handlers.provider {
                provider.on_abort(abort.source, abort.reason).await;
            }
            if let Some(user) = &shared.handlers.user {
                user.on_abort(abort.source, abort.reason).await;
            }
            shared.begin_close(None);
            Ok(())
        }
        Pdu::Unknown { pdu_type: 0xFF, .. } => {
            // Observed from some peers as a keep-alive; no PS 3.8 meaning.
            log::debug!("{}: ignoring PDU type 0xFF", shared.log_id());
            Ok(())
        }
        Pdu::Unknown { pdu_type, .. } => Err(ProtocolError::UnknownPduType { pdu_type }.into()),
    }
}

fn unexpected(pdu: u8, phase: Phase) -> Error {
    ProtocolError::UnexpectedPdu {
        pdu,
        phase: phase.name(),
    }
    .into()
}

async fn send_pdu(shared: &Arc<Shared>, pdu: Pdu) -> Result<(), Error> {
    shared.pdu_tx.send(pdu).await.map_err(|_| Error::Closed)
}

/// Route one complete inbound message to its handler or pending request.
async fn dispatch_message(shared: &Arc<Shared>, incoming: IncomingDimse) -> Result<(), Error> {
    let IncomingDimse { message, file } = incoming;
    let field = message.command_field()?;
    if shared.options.log_dimse {
        log::debug!(
            "{}: received {field:?} id={:?} status={:?}",
            shared.log_id(),
            message.message_id().or_else(|| message.request_message_id()),
            message.status().map(|s| s.0)
        );
    }
    if field.is_response() {
        route_response(shared, message);
        return Ok(());
    }
    match field {
        CommandField::CEchoRq => {
            let Some(echo) = shared.handlers.echo.clone() else {
                return Err(unimplemented(field));
            };
            let status = echo.on_c_echo_request(&message).await;
            respond(shared, &message, status, None);
        }
        CommandField::CStoreRq => {
            let Some(store) = shared.handlers.store.clone() else {
                return Err(unimplemented(field));
            };
            let status = store.on_c_store_request(&message, file).await;
            respond(shared, &message, status, None);
        }
        CommandField::CFindRq => {
            let Some(find) = shared.handlers.find.clone() else {
                return Err(unimplemented(field));
            };
            let stream = find.on_c_find_request(&message).await;
            stream_responses(shared, &message, stream).await;
        }
        CommandField::CMoveRq => {
            let Some(mover) = shared.handlers.move_.clone() else {
                return Err(unimplemented(field));
            };
            let stream = mover.on_c_move_request(&message).await;
            stream_responses(shared, &message, stream).await;
        }
        CommandField::CCancelRq => {
            // Handlers run to completion before the next message is read,
            // so there is never an operation left to interrupt here.
            log::debug!(
                "{}: C-CANCEL-RQ for message {:?} with no operation in flight",
                shared.log_id(),
                message.request_message_id()
            );
        }
        CommandField::NActionRq
        | CommandField::NCreateRq
        | CommandField::NDeleteRq
        | CommandField::NEventReportRq
        | CommandField::NGetRq
        | CommandField::NSetRq => {
            let Some(n_service) = shared.handlers.n_service.clone() else {
                return Err(unimplemented(field));
            };
            let answer = match field {
                CommandField::NActionRq => n_service.on_n_action_request(&message).await,
                CommandField::NCreateRq => n_service.on_n_create_request(&message).await,
                CommandField::NDeleteRq => n_service.on_n_delete_request(&message).await,
                CommandField::NEventReportRq => {
                    n_service.on_n_event_report_request(&message).await
                }
                CommandField::NGetRq => n_service.on_n_get_request(&message).await,
                _ => n_service.on_n_set_request(&message).await,
            };
            let Some(answer) = answer else {
                return Err(unimplemented(field));
            };
            respond(shared, &message, answer.status, answer.dataset);
        }
        other => return Err(unimplemented(other)),
    }
    Ok(())
}

fn unimplemented(field: CommandField) -> Error {
    ProtocolError::UnimplementedService {
        command_field: field.to_wire(),
    }
    .into()
}

/// Queue the response answering `request`.
fn respond(
    shared: &Arc<Shared>,
    request: &DimseMessage,
    status: Status,
    dataset: Option<crate::dimse::Dataset>,
) {
    match DimseMessage::response_to(request, status, dataset) {
        Some(response) => shared.enqueue_response(response),
        None => log::warn!(
            "{}: no response form for command {:?}",
            shared.log_id(),
            request.command_field()
        ),
    }
}

/// Send a provider's response sequence until its terminal status.
async fn stream_responses(
    shared: &Arc<Shared>,
    request: &DimseMessage,
    mut stream: ResponseStream,
) {
    while let Some(item) = stream.next().await {
        let terminal = !item.status.is_pending();
        respond(shared, request, item.status, item.dataset);
        if terminal {
            return;
        }
    }
    // The provider ran dry without a terminal status; close the operation
    // for it so the peer is not left waiting.
    respond(shared, request, Status::SUCCESS, None);
}

/// Hand a response to its pending request's callback.
///
/// The pending entry is retired only on a non-pending status; C-FIND and
/// C-MOVE requests observe every pending response through the same
/// callback.
fn route_response(shared: &Arc<Shared>, message: DimseMessage) {
    let Some(id) = message.request_message_id() else {
        log::warn!("{}: response without a request message id", shared.log_id());
        return;
    };
    let terminal = message.status().is_none_or(|status| !status.is_pending());
    let callback = shared.state().pending.remove(&id);
    let Some(mut callback) = callback else {
        log::warn!("{}: response for unknown message id {id}", shared.log_id());
        return;
    };
    callback(message);
    if terminal {
        shared.pending_changed.notify_waiters();
    } else {
        shared.state().pending.insert(id, callback);
    }
}

/// Drain the DIMSE send queue, one message at a time.
async fn pump_loop(shared: &Arc<Shared>, mut msg_rx: mpsc::UnboundedReceiver<OutgoingMessage>) {
    loop {
        let outgoing = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break,
            outgoing = msg_rx.recv() => match outgoing {
                Some(outgoing) => outgoing,
                None => break,
            },
        };
        match send_message(shared, outgoing).await {
            Ok(()) => {}
            Err(Error::Closed) => break,
            Err(error) => {
                log::warn!("{}: send failed: {error}", shared.log_id());
                shared.begin_close(Some(error));
                break;
            }
        }
    }
}

/// Transmit one DIMSE message: resolve its context, prepare the dataset,
/// register pending state, and stream it through a PDV writer.
async fn send_message(shared: &Arc<Shared>, outgoing: OutgoingMessage) -> Result<(), Error> {
    let OutgoingMessage { mut message, kind } = outgoing;
    let mut on_response = match kind {
        OutgoingKind::Request { on_response } => Some(on_response),
        OutgoingKind::Response => None,
    };

    let association = {
        let state = shared.state();
        match state.phase {
            Phase::Associated => state.association.clone(),
            _ => None,
        }
    };
    let Some(association) = association else {
        log::debug!(
            "{}: dropping outgoing message, no association",
            shared.log_id()
        );
        return Ok(());
    };

    if on_response.is_some() {
        wait_for_async_slot(shared, &association).await?;
    }

    // Resolve the presentation context; C-STORE prefers a context whose
    // accepted transfer syntax matches the dataset's current encoding.
    let sop_class = message.sop_class_uid().unwrap_or_default();
    let is_store = message.command_field() == Ok(CommandField::CStoreRq);
    let preferred = message
        .dataset
        .as_ref()
        .filter(|_| is_store)
        .map(|dataset| dataset.transfer_syntax().to_string());
    let Some(context) = association
        .find_acceptable_context(&sop_class, preferred.as_deref(), message.context_id)
        .cloned()
    else {
        log::warn!(
            "{}: no acceptable presentation context for {sop_class}",
            shared.log_id()
        );
        reject_locally(&message, on_response, Status::SOP_CLASS_NOT_SUPPORTED);
        return Ok(());
    };
    message.context_id = context.id;
    let accepted_syntax = context
        .accepted_transfer_syntax
        .clone()
        .unwrap_or_else(|| uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string());

    // Prepare the dataset: transcode to the accepted syntax if necessary
    // and strip deprecated group length elements (PS 3.5 §7.2).
    let payload = match &message.dataset {
        None => None,
        Some(dataset) => {
            let raw = match dataset.read().await {
                Ok(raw) => raw,
                Err(error) => {
                    log::warn!("{}: dataset unreadable: {error}", shared.log_id());
                    reject_locally(&message, on_response, Status::PROCESSING_FAILURE);
                    return Ok(());
                }
            };
            let current = dataset.transfer_syntax();
            let converted = if current == accepted_syntax {
                Ok(raw)
            } else {
                shared.codec.transcode(raw, current, &accepted_syntax)
            };
            let prepared =
                converted.and_then(|data| shared.codec.strip_group_lengths(data, &accepted_syntax));
            match prepared {
                Ok(data) => Some(data),
                Err(error) => {
                    log::warn!("{}: dataset not sendable: {error}", shared.log_id());
                    reject_locally(&message, on_response, Status::PROCESSING_FAILURE);
                    return Ok(());
                }
            }
        }
    };

    message.command.put_u16(
        command::tags::COMMAND_DATA_SET_TYPE,
        if payload.is_some() {
            command::DATA_SET_PRESENT
        } else {
            command::DATA_SET_ABSENT
        },
    );

    if let Some(on_response) = on_response.take() {
        let Some(id) = message.message_id() else {
            log::warn!("{}: request without a message id, dropped", shared.log_id());
            return Ok(());
        };
        shared.state().pending.insert(id, on_response);
    }

    if shared.options.log_dimse {
        log::debug!(
            "{}: sending {:?} id={:?} on context {}",
            shared.log_id(),
            message.command_field(),
            message.message_id().or_else(|| message.request_message_id()),
            message.context_id
        );
    }

    let mut writer = PdvWriter::new(
        shared.pdu_tx.clone(),
        message.context_id,
        association.max_pdu_length,
        shared.options.max_command_buffer,
        shared.options.max_data_buffer,
    );
    writer.write(&message.command.encode()).await?;
    if let Some(data) = payload {
        writer.set_command(false).await?;
        writer.write(&data).await?;
    }
    writer.flush(true).await
}

/// Block until the async-ops window has room for one more request.
async fn wait_for_async_slot(shared: &Arc<Shared>, association: &Association) -> Result<(), Error> {
    let cap = association.max_async_ops_invoked as usize;
    if cap == 0 {
        return Ok(());
    }
    loop {
        let notified = shared.pending_changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        {
            let state = shared.state();
            if state.phase == Phase::Closed {
                return Err(Error::Closed);
            }
            if state.pending.len() < cap {
                return Ok(());
            }
        }
        tokio::select! {
            () = &mut notified => {}
            () = shared.shutdown.cancelled() => return Err(Error::Closed),
        }
    }
}

/// Resolve a request locally with a synthetic response; responses that
/// cannot be sent are logged and dropped.
fn reject_locally(message: &DimseMessage, on_response: Option<ResponseCallback>, status: Status) {
    if let Some(mut on_response) = on_response {
        if let Some(synthetic) = DimseMessage::response_to(message, status, None) {
            on_response(synthetic);
        }
    }
}

/// Drain the PDU queue onto the wire, FIFO.
async fn write_loop<S>(
    shared: &Arc<Shared>,
    mut pdu_rx: mpsc::Receiver<Pdu>,
    mut framed: FramedWrite<WriteHalf<S>, PduCodec>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    loop {
        tokio::select! {
            biased;
            pdu = pdu_rx.recv() => {
                let Some(pdu) = pdu else { break };
                if write_one(shared, &mut framed, pdu).await.is_err() {
                    break;
                }
            }
            () = shared.shutdown.cancelled() => {
                // Write out anything queued ahead of the close request,
                // typically a final abort, reject, or release response.
                while let Ok(pdu) = pdu_rx.try_recv() {
                    if write_one(shared, &mut framed, pdu).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    // Dropping the receiver unblocks any submitter still awaiting space.
}

async fn write_one<S>(
    shared: &Arc<Shared>,
    framed: &mut FramedWrite<WriteHalf<S>, PduCodec>,
    pdu: Pdu,
) -> Result<(), ()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    if shared.options.log_data_pdus || !matches!(pdu, Pdu::PDataTf(_)) {
        log::debug!("{}: writing {}", shared.log_id(), pdu.name());
    }
    match framed.send(pdu).await {
        Ok(()) => Ok(()),
        Err(error) => {
            if shared.is_closing() {
                log::debug!("{}: write error after close: {error}", shared.log_id());
                shared.begin_close(None);
            } else {
                log::warn!("{}: transport failed: {error}", shared.log_id());
                shared.begin_close(Some(Error::Transport(error)));
            }
            Err(())
        }
    }
}
