//! Role upcalls.
//!
//! The engine carries no inheritance hierarchy of service classes; a host
//! registers exactly the capabilities it implements as optional handlers in
//! a [`ServiceHandlers`] bag. A DIMSE request arriving with no matching
//! handler is a protocol violation answered with an abort.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{
    association::{Association, ContextPolicy, ContextVerdict, PresentationContext},
    dimse::{Dataset, DimseMessage, Status},
    error::Error,
    pdu::{AbortReason, AbortSource, RejectReason, RejectResult, RejectSource},
    store::DicomFile,
};

/// Verdict on an incoming association request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssociationVerdict {
    /// Accept; negotiated contexts are sent back in the AC.
    Accept,
    /// Reject with the given wire fields.
    Reject {
        /// Permanent or transient.
        result: RejectResult,
        /// Rejecting layer.
        source: RejectSource,
        /// Reason code.
        reason: RejectReason,
    },
}

/// One streamed provider response (C-FIND, C-MOVE).
#[derive(Clone, Debug)]
pub struct ProviderResponse {
    /// Response status; `Pending` keeps the stream open.
    pub status: Status,
    /// Dataset carried by this response, typically a match identifier.
    pub dataset: Option<Dataset>,
}

impl ProviderResponse {
    /// A pending response carrying one match.
    #[must_use]
    pub fn pending(dataset: Dataset) -> Self {
        Self {
            status: Status::PENDING,
            dataset: Some(dataset),
        }
    }

    /// A terminal response with no dataset.
    #[must_use]
    pub fn terminal(status: Status) -> Self {
        Self {
            status,
            dataset: None,
        }
    }
}

/// Lazy sequence of responses produced by a find/move provider.
///
/// The engine sends each element in order and stops after the first
/// non-pending status, whether or not the stream is exhausted.
pub type ResponseStream = BoxStream<'static, ProviderResponse>;

/// Build a channel-backed [`ResponseStream`].
///
/// Handlers that produce matches from another task send them through the
/// returned sender; the channel is bounded, so producers wait while the
/// engine drains responses onto the wire. Dropping the sender ends the
/// stream.
#[must_use]
pub fn response_channel(
    capacity: usize,
) -> (tokio::sync::mpsc::Sender<ProviderResponse>, ResponseStream) {
    let (tx, rx) = tokio::sync::mpsc::channel(capacity);
    (tx, Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
}

/// Acceptor-side (server) lifecycle upcalls.
#[async_trait]
pub trait ProviderHandler: Send + Sync {
    /// Decide the fate of one proposed presentation context.
    ///
    /// The default accepts everything with the first proposed transfer
    /// syntax; override to apply a SOP class table.
    fn evaluate_context(&self, proposed: &PresentationContext) -> ContextVerdict {
        crate::association::AcceptAllPolicy.evaluate(proposed)
    }

    /// An A-ASSOCIATE-RQ arrived; decide whether to accept.
    async fn on_association_request(&self, association: &Association) -> AssociationVerdict {
        let _ = association;
        AssociationVerdict::Accept
    }

    /// The peer requested release; the engine answers and closes.
    async fn on_release_request(&self) {}

    /// The peer aborted the association.
    async fn on_abort(&self, source: AbortSource, reason: AbortReason) {
        let _ = (source, reason);
    }

    /// The connection closed; called exactly once.
    async fn on_connection_closed(&self, error: Option<&Error>) { let _ = error; }
}

/// Requestor-side (client) lifecycle upcalls.
#[async_trait]
pub trait UserHandler: Send + Sync {
    /// The peer accepted the association.
    async fn on_association_accept(&self, association: &Association) { let _ = association; }

    /// The peer rejected the association.
    async fn on_association_reject(
        &self,
        result: RejectResult,
        source: RejectSource,
        reason: RejectReason,
    ) {
        let _ = (result, source, reason);
    }

    /// The peer answered our release request; the connection closes next.
    async fn on_release_response(&self) {}

    /// The peer aborted the association.
    async fn on_abort(&self, source: AbortSource, reason: AbortReason) {
        let _ = (source, reason);
    }

    /// The connection closed; called exactly once.
    async fn on_connection_closed(&self, error: Option<&Error>) { let _ = error; }
}

/// Verification (C-ECHO) provider.
#[async_trait]
pub trait CEchoProvider: Send + Sync {
    /// Answer one C-ECHO request.
    async fn on_c_echo_request(&self, request: &DimseMessage) -> Status;
}

/// Storage (C-STORE) provider.
#[async_trait]
pub trait CStoreProvider: Send + Sync {
    /// Handle one received object.
    ///
    /// `file` is the staged object from the store sink, unless the sink
    /// provider opted out of producing one.
    async fn on_c_store_request(&self, request: &DimseMessage, file: Option<DicomFile>) -> Status;

    /// Reception failed before the request could be handled.
    async fn on_c_store_exception(&self, filename: Option<&Path>, error: &Error) {
        let _ = (filename, error);
    }
}

/// Query (C-FIND) provider.
#[async_trait]
pub trait CFindProvider: Send + Sync {
    /// Produce the response sequence for one query.
    async fn on_c_find_request(&self, request: &DimseMessage) -> ResponseStream;
}

/// Retrieve (C-MOVE) provider.
#[async_trait]
pub trait CMoveProvider: Send + Sync {
    /// Produce the response sequence for one retrieve.
    async fn on_c_move_request(&self, request: &DimseMessage) -> ResponseStream;
}

/// Normalized service provider, one handler per N verb.
///
/// Defaults return `None`, which the engine treats as an unimplemented
/// role: the association is aborted.
#[async_trait]
pub trait NServiceProvider: Send + Sync {
    /// N-ACTION.
    async fn on_n_action_request(&self, request: &DimseMessage) -> Option<ProviderResponse> {
        let _ = request;
        None
    }

    /// N-CREATE.
    async fn on_n_create_request(&self, request: &DimseMessage) -> Option<ProviderResponse> {
        let _ = request;
        None
    }

    /// N-DELETE.
    async fn on_n_delete_request(&self, request: &DimseMessage) -> Option<ProviderResponse> {
        let _ = request;
        None
    }

    /// N-EVENT-REPORT.
    async fn on_n_event_report_request(&self, request: &DimseMessage) -> Option<ProviderResponse> {
        let _ = request;
        None
    }

    /// N-GET.
    async fn on_n_get_request(&self, request: &DimseMessage) -> Option<ProviderResponse> {
        let _ = request;
        None
    }

    /// N-SET.
    async fn on_n_set_request(&self, request: &DimseMessage) -> Option<ProviderResponse> {
        let _ = request;
        None
    }
}

/// The capability set registered for one connection.
#[derive(Clone, Default)]
pub struct ServiceHandlers {
    /// Acceptor lifecycle; present on servers.
    pub provider: Option<Arc<dyn ProviderHandler>>,
    /// Requestor lifecycle; present on clients.
    pub user: Option<Arc<dyn UserHandler>>,
    /// C-ECHO.
    pub echo: Option<Arc<dyn CEchoProvider>>,
    /// C-STORE.
    pub store: Option<Arc<dyn CStoreProvider>>,
    /// C-FIND.
    pub find: Option<Arc<dyn CFindProvider>>,
    /// C-MOVE.
    pub move_: Option<Arc<dyn CMoveProvider>>,
    /// N services.
    pub n_service: Option<Arc<dyn NServiceProvider>>,
}

impl ServiceHandlers {
    /// An empty capability set.
    #[must_use]
    pub fn new() -> Self { Self::default() }
}
