//! Application-facing handle for one connection.
//!
//! Cloneable; producers on any task use it to start or end associations
//! and to queue DIMSE traffic. Queueing is non-blocking: messages travel
//! through the engine's send queue and all waiting (async-ops window, PDU
//! backpressure) happens inside the engine's pump.

use std::sync::Arc;

use crate::{
    association::Association,
    dimse::DimseMessage,
    error::Error,
    pdu::{
        Abort,
        AbortReason,
        AbortSource,
        AssociateRq,
        Pdu,
        ProposedContext,
    },
    uids,
};

use super::{OutgoingKind, OutgoingMessage, Phase, Shared};

/// Parameters for an outgoing association proposal.
#[derive(Clone, Debug)]
pub struct AssociationRequest {
    /// Our AE title.
    pub calling_ae_title: String,
    /// The peer's AE title.
    pub called_ae_title: String,
    /// Presentation contexts to propose; ids must be odd and unique.
    pub presentation_contexts: Vec<ProposedContext>,
    /// Asynchronous operations window to propose, `(invoked, performed)`.
    pub max_async_ops: Option<(u16, u16)>,
}

/// Cloneable handle over a running [`UpperLayerService`](super::UpperLayerService).
#[derive(Clone)]
pub struct ServiceHandle {
    shared: Arc<Shared>,
}

impl ServiceHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self { Self { shared } }

    /// Propose an association (requestor role).
    ///
    /// Sends the A-ASSOCIATE-RQ; the outcome arrives through the
    /// [`UserHandler`](super::UserHandler) upcalls.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] when the connection is closed or an
    /// association was already proposed or established.
    pub async fn request_association(&self, request: AssociationRequest) -> Result<(), Error> {
        let rq = AssociateRq {
            protocol_version: uids::PROTOCOL_VERSION,
            called_ae_title: request.called_ae_title.clone(),
            calling_ae_title: request.calling_ae_title.clone(),
            application_context_name: uids::APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: request.presentation_contexts.clone(),
            user_info: self.shared.local_user_info(request.max_async_ops),
        };
        {
            let mut state = self.shared.state();
            if state.phase != Phase::Idle {
                return Err(Error::Closed);
            }
            state.phase = Phase::RequestSent;
            state.proposed = Some(Association::from_proposal(
                &request.calling_ae_title,
                &request.called_ae_title,
                &request.presentation_contexts,
            ));
        }
        self.send_pdu(Pdu::AssociateRq(rq)).await
    }

    /// Queue a DIMSE request.
    ///
    /// `on_response` observes every response carrying the request's
    /// message id; the request stays pending until a non-pending status
    /// arrives. A request that cannot be placed on any accepted context is
    /// answered locally with `SOPClassNotSupported`. After close the
    /// message is silently dropped.
    pub fn send_request(
        &self,
        message: DimseMessage,
        on_response: impl FnMut(DimseMessage) + Send + 'static,
    ) {
        let outgoing = OutgoingMessage {
            message,
            kind: OutgoingKind::Request {
                on_response: Box::new(on_response),
            },
        };
        if self.shared.msg_tx.send(outgoing).is_err() {
            log::debug!(
                "{}: dropping request, connection closed",
                self.shared.log_id()
            );
        }
    }

    /// Queue a DIMSE response. After close the message is silently dropped.
    pub fn send_response(&self, message: DimseMessage) {
        self.shared.enqueue_response(message);
    }

    /// Request an orderly release (requestor role).
    ///
    /// The peer's A-RELEASE-RP closes the connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] when no association is established.
    pub async fn release(&self) -> Result<(), Error> {
        {
            let mut state = self.shared.state();
            if state.phase != Phase::Associated {
                return Err(Error::Closed);
            }
            state.phase = Phase::Releasing;
        }
        self.send_pdu(Pdu::ReleaseRq).await
    }

    /// Abort the association and close.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] when the connection is already closed.
    pub async fn abort(&self, source: AbortSource, reason: AbortReason) -> Result<(), Error> {
        if self.shared.state().phase == Phase::Closed {
            return Err(Error::Closed);
        }
        self.send_pdu(Pdu::Abort(Abort { source, reason })).await?;
        self.shared.begin_close(None);
        Ok(())
    }

    /// The established association, once negotiation completed.
    #[must_use]
    pub fn association(&self) -> Option<Arc<Association>> {
        self.shared.state().association.clone()
    }

    /// Whether the connection is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool { self.shared.state().phase != Phase::Closed }

    async fn send_pdu(&self, pdu: Pdu) -> Result<(), Error> {
        self.shared.pdu_tx.send(pdu).await.map_err(|_| Error::Closed)
    }
}
