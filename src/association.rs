//! Negotiated association state.
//!
//! An [`Association`] is built from an A-ASSOCIATE-RQ (acceptor side) or
//! from local proposal options (requestor side), finalized during the
//! handshake, and read-only afterwards. Context acceptance is delegated to
//! a [`ContextPolicy`] so service hosts decide which abstract syntaxes they
//! speak without the engine hard-coding a SOP class table.

use std::collections::BTreeMap;

use crate::{
    pdu::{
        AssociateAc,
        AssociateRq,
        ContextResult,
        ContextResultReason,
        ProposedContext,
        UserInfo,
    },
    uids,
};

/// Negotiation state of one presentation context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextState {
    /// Proposed; no verdict yet.
    Proposed,
    /// Accepted with a chosen transfer syntax.
    Accepted,
    /// Rejected by the acceptor's user.
    UserRejected,
    /// Rejected without a stated reason.
    NoReason,
    /// The abstract syntax is not supported.
    AbstractSyntaxNotSupported,
    /// None of the proposed transfer syntaxes is supported.
    TransferSyntaxesNotSupported,
}

impl ContextState {
    fn to_result_reason(self) -> ContextResultReason {
        match self {
            Self::Accepted => ContextResultReason::Acceptance,
            Self::UserRejected => ContextResultReason::UserRejection,
            Self::Proposed | Self::NoReason => ContextResultReason::NoReason,
            Self::AbstractSyntaxNotSupported => ContextResultReason::AbstractSyntaxNotSupported,
            Self::TransferSyntaxesNotSupported => {
                ContextResultReason::TransferSyntaxesNotSupported
            }
        }
    }

    fn from_result_reason(reason: ContextResultReason) -> Self {
        match reason {
            ContextResultReason::Acceptance => Self::Accepted,
            ContextResultReason::UserRejection => Self::UserRejected,
            ContextResultReason::NoReason => Self::NoReason,
            ContextResultReason::AbstractSyntaxNotSupported => Self::AbstractSyntaxNotSupported,
            ContextResultReason::TransferSyntaxesNotSupported => {
                Self::TransferSyntaxesNotSupported
            }
        }
    }
}

/// One presentation context and its negotiation outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresentationContext {
    /// Context id; odd per PS 3.8.
    pub id: u8,
    /// Abstract syntax (SOP class) UID.
    pub abstract_syntax: String,
    /// Transfer syntaxes proposed for this context.
    pub proposed_transfer_syntaxes: Vec<String>,
    /// The accepted transfer syntax, once negotiated.
    pub accepted_transfer_syntax: Option<String>,
    /// Negotiation state.
    pub result: ContextState,
}

impl PresentationContext {
    /// Whether the context may carry traffic.
    #[must_use]
    pub fn is_accepted(&self) -> bool { self.result == ContextState::Accepted }
}

/// Verdict of a [`ContextPolicy`] for one proposed context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContextVerdict {
    /// Accept with the chosen transfer syntax.
    Accept {
        /// Transfer syntax to accept; must be one of the proposed ones.
        transfer_syntax: String,
    },
    /// Reject with the given state.
    Reject(ContextState),
}

/// Abstract-syntax acceptance policy applied while answering an RQ.
pub trait ContextPolicy: Send + Sync {
    /// Decide the fate of one proposed context.
    fn evaluate(&self, proposed: &PresentationContext) -> ContextVerdict;
}

/// Policy that accepts every abstract syntax with its first proposed
/// transfer syntax, preferring implicit VR little endian when offered.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAllPolicy;

impl ContextPolicy for AcceptAllPolicy {
    fn evaluate(&self, proposed: &PresentationContext) -> ContextVerdict {
        let transfer_syntax = proposed
            .proposed_transfer_syntaxes
            .iter()
            .find(|ts| ts.as_str() == uids::IMPLICIT_VR_LITTLE_ENDIAN)
            .or_else(|| proposed.proposed_transfer_syntaxes.first());
        match transfer_syntax {
            Some(ts) => ContextVerdict::Accept {
                transfer_syntax: ts.clone(),
            },
            None => ContextVerdict::Reject(ContextState::TransferSyntaxesNotSupported),
        }
    }
}

/// Parameters negotiated for one association.
///
/// Mutated only during the handshake; the engine shares it read-only for
/// the rest of the connection.
#[derive(Clone, Debug)]
pub struct Association {
    /// AE title of the association requestor.
    pub calling_ae_title: String,
    /// AE title of the association acceptor.
    pub called_ae_title: String,
    /// Largest P-DATA-TF body the peer will receive; zero means no stated
    /// limit and outgoing PDUs are bounded only by the local buffer caps.
    pub max_pdu_length: u32,
    /// Cap on simultaneously invoked (unanswered) operations; zero means
    /// unbounded.
    pub max_async_ops_invoked: u16,
    /// Cap on operations this node performs concurrently; zero means
    /// unbounded. Informational; the engine dispatches serially.
    pub max_async_ops_performed: u16,
    /// Implementation class UID the peer advertised.
    pub remote_implementation_class_uid: String,
    /// Implementation version name the peer advertised.
    pub remote_implementation_version_name: Option<String>,
    contexts: BTreeMap<u8, PresentationContext>,
}

impl Association {
    /// Build the acceptor-side view from a received A-ASSOCIATE-RQ.
    #[must_use]
    pub fn from_request(rq: &AssociateRq) -> Self {
        let contexts = rq
            .presentation_contexts
            .iter()
            .map(|pc| {
                (pc.id, PresentationContext {
                    id: pc.id,
                    abstract_syntax: pc.abstract_syntax.clone(),
                    proposed_transfer_syntaxes: pc.transfer_syntaxes.clone(),
                    accepted_transfer_syntax: None,
                    result: ContextState::Proposed,
                })
            })
            .collect();
        Self {
            calling_ae_title: rq.calling_ae_title.clone(),
            called_ae_title: rq.called_ae_title.clone(),
            max_pdu_length: rq.user_info.max_pdu_length,
            max_async_ops_invoked: rq.user_info.max_async_ops.map_or(0, |(invoked, _)| invoked),
            max_async_ops_performed: rq
                .user_info
                .max_async_ops
                .map_or(0, |(_, performed)| performed),
            remote_implementation_class_uid: rq.user_info.implementation_class_uid.clone(),
            remote_implementation_version_name: rq.user_info.implementation_version_name.clone(),
            contexts,
        }
    }

    /// Build the requestor-side view from proposed contexts.
    ///
    /// Peer-derived fields hold placeholders until
    /// [`apply_acceptance`](Self::apply_acceptance) merges the AC.
    #[must_use]
    pub fn from_proposal(
        calling_ae_title: &str,
        called_ae_title: &str,
        proposed: &[ProposedContext],
    ) -> Self {
        let contexts = proposed
            .iter()
            .map(|pc| {
                (pc.id, PresentationContext {
                    id: pc.id,
                    abstract_syntax: pc.abstract_syntax.clone(),
                    proposed_transfer_syntaxes: pc.transfer_syntaxes.clone(),
                    accepted_transfer_syntax: None,
                    result: ContextState::Proposed,
                })
            })
            .collect();
        Self {
            calling_ae_title: calling_ae_title.to_string(),
            called_ae_title: called_ae_title.to_string(),
            max_pdu_length: 0,
            max_async_ops_invoked: 0,
            max_async_ops_performed: 0,
            remote_implementation_class_uid: String::new(),
            remote_implementation_version_name: None,
            contexts,
        }
    }

    /// Apply an acceptance policy to every still-proposed context.
    pub fn accept_contexts(&mut self, policy: &dyn ContextPolicy) {
        for context in self.contexts.values_mut() {
            if context.result != ContextState::Proposed {
                continue;
            }
            match policy.evaluate(context) {
                ContextVerdict::Accept { transfer_syntax } => {
                    context.result = ContextState::Accepted;
                    context.accepted_transfer_syntax = Some(transfer_syntax);
                }
                ContextVerdict::Reject(state) => context.result = state,
            }
        }
    }

    /// Merge the peer's A-ASSOCIATE-AC into a proposed association.
    pub fn apply_acceptance(&mut self, ac: &AssociateAc) {
        self.max_pdu_length = ac.user_info.max_pdu_length;
        self.max_async_ops_invoked = ac.user_info.max_async_ops.map_or(0, |(invoked, _)| invoked);
        self.max_async_ops_performed = ac
            .user_info
            .max_async_ops
            .map_or(0, |(_, performed)| performed);
        self.remote_implementation_class_uid = ac.user_info.implementation_class_uid.clone();
        self.remote_implementation_version_name =
            ac.user_info.implementation_version_name.clone();
        for result in &ac.presentation_contexts {
            let Some(context) = self.contexts.get_mut(&result.id) else {
                log::warn!(
                    "peer answered unproposed presentation context {}; ignoring",
                    result.id
                );
                continue;
            };
            context.result = ContextState::from_result_reason(result.result);
            context.accepted_transfer_syntax = result.transfer_syntax.clone();
        }
        // Contexts the peer did not answer cannot carry traffic.
        for context in self.contexts.values_mut() {
            if context.result == ContextState::Proposed {
                context.result = ContextState::NoReason;
            }
        }
    }

    /// Build the A-ASSOCIATE-AC answering this association's request.
    ///
    /// Contexts still flagged `Proposed` are rejected with `NoReason`, both
    /// in the PDU and in this association.
    #[must_use]
    pub fn to_accept_pdu(&mut self, user_info: UserInfo) -> AssociateAc {
        let mut results = Vec::with_capacity(self.contexts.len());
        for context in self.contexts.values_mut() {
            if context.result == ContextState::Proposed {
                context.result = ContextState::NoReason;
            }
            results.push(ContextResult {
                id: context.id,
                result: context.result.to_result_reason(),
                transfer_syntax: context.accepted_transfer_syntax.clone(),
            });
        }
        AssociateAc {
            protocol_version: uids::PROTOCOL_VERSION,
            called_ae_title: self.called_ae_title.clone(),
            calling_ae_title: self.calling_ae_title.clone(),
            application_context_name: uids::APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: results,
            user_info,
        }
    }

    /// Look up a context by id.
    #[must_use]
    pub fn context(&self, id: u8) -> Option<&PresentationContext> { self.contexts.get(&id) }

    /// Iterate over all contexts in id order.
    pub fn contexts(&self) -> impl Iterator<Item = &PresentationContext> {
        self.contexts.values()
    }

    /// Find an accepted context able to carry a message.
    ///
    /// Preference order: an accepted context for `sop_class_uid` whose
    /// accepted transfer syntax equals `preferred_transfer_syntax` (the
    /// C-STORE rule), then any accepted context for the SOP class, then the
    /// message's explicitly assigned context when it was accepted.
    #[must_use]
    pub fn find_acceptable_context(
        &self,
        sop_class_uid: &str,
        preferred_transfer_syntax: Option<&str>,
        assigned_id: u8,
    ) -> Option<&PresentationContext> {
        let matching = || {
            self.contexts
                .values()
                .filter(|pc| pc.is_accepted() && pc.abstract_syntax == sop_class_uid)
        };
        if let Some(preferred) = preferred_transfer_syntax {
            if let Some(exact) = matching()
                .find(|pc| pc.accepted_transfer_syntax.as_deref() == Some(preferred))
            {
                return Some(exact);
            }
        }
        matching()
            .next()
            .or_else(|| self.contexts.get(&assigned_id).filter(|pc| pc.is_accepted()))
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;

    fn proposed(id: u8, abstract_syntax: &str, transfer_syntaxes: &[&str]) -> ProposedContext {
        ProposedContext {
            id,
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntaxes: transfer_syntaxes.iter().map(ToString::to_string).collect(),
        }
    }

    #[fixture]
    fn negotiated() -> Association {
        let rq = AssociateRq {
            protocol_version: uids::PROTOCOL_VERSION,
            called_ae_title: "SCP".to_string(),
            calling_ae_title: "SCU".to_string(),
            application_context_name: uids::APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![
                proposed(1, uids::VERIFICATION_SOP_CLASS, &[uids::IMPLICIT_VR_LITTLE_ENDIAN]),
                proposed(3, "1.2.840.10008.5.1.4.1.1.7", &[uids::EXPLICIT_VR_LITTLE_ENDIAN]),
                proposed(5, "1.2.840.10008.5.1.4.1.1.7", &[uids::IMPLICIT_VR_LITTLE_ENDIAN]),
            ],
            user_info: UserInfo::default(),
        };
        let mut association = Association::from_request(&rq);
        association.accept_contexts(&AcceptAllPolicy);
        association
    }

    #[rstest]
    fn policy_accepts_each_proposed_context(negotiated: Association) {
        assert!(negotiated.contexts().all(PresentationContext::is_accepted));
        assert_eq!(
            negotiated.context(3).and_then(|pc| pc.accepted_transfer_syntax.as_deref()),
            Some(uids::EXPLICIT_VR_LITTLE_ENDIAN)
        );
    }

    #[test]
    fn unanswered_contexts_are_rejected_in_the_accept_pdu() {
        // No policy ran, so every context is still flagged Proposed.
        let rq = AssociateRq {
            protocol_version: uids::PROTOCOL_VERSION,
            called_ae_title: "SCP".to_string(),
            calling_ae_title: "SCU".to_string(),
            application_context_name: uids::APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![proposed(
                7,
                "1.2.840.10008.5.1.4.1.2.2.1",
                &[uids::IMPLICIT_VR_LITTLE_ENDIAN],
            )],
            user_info: UserInfo::default(),
        };
        let mut undecided = Association::from_request(&rq);
        let ac = undecided.to_accept_pdu(UserInfo::default());
        assert_eq!(ac.presentation_contexts[0].result, ContextResultReason::NoReason);
        assert_eq!(undecided.context(7).map(|pc| pc.result), Some(ContextState::NoReason));
    }

    #[rstest]
    fn store_prefers_exact_transfer_syntax_match(negotiated: Association) {
        let found = negotiated
            .find_acceptable_context(
                "1.2.840.10008.5.1.4.1.1.7",
                Some(uids::IMPLICIT_VR_LITTLE_ENDIAN),
                0,
            )
            .expect("context for the SOP class");
        assert_eq!(found.id, 5);
    }

    #[rstest]
    fn store_falls_back_to_any_context_for_the_sop_class(negotiated: Association) {
        let found = negotiated
            .find_acceptable_context("1.2.840.10008.5.1.4.1.1.7", Some("1.2.840.10008.1.2.4.50"), 0)
            .expect("context for the SOP class");
        assert_eq!(found.id, 3);
    }

    #[rstest]
    fn unknown_sop_class_falls_back_to_the_assigned_context(negotiated: Association) {
        let found = negotiated.find_acceptable_context("1.9.9.9", None, 1);
        assert_eq!(found.map(|pc| pc.id), Some(1));
        assert!(negotiated.find_acceptable_context("1.9.9.9", None, 0).is_none());
    }

    #[test]
    fn acceptance_merges_peer_results_and_user_info() {
        let mut association = Association::from_proposal("SCU", "SCP", &[
            proposed(1, uids::VERIFICATION_SOP_CLASS, &[uids::IMPLICIT_VR_LITTLE_ENDIAN]),
            proposed(3, "1.2.840.10008.5.1.4.1.1.7", &[uids::EXPLICIT_VR_LITTLE_ENDIAN]),
        ]);
        let ac = AssociateAc {
            protocol_version: uids::PROTOCOL_VERSION,
            called_ae_title: "SCP".to_string(),
            calling_ae_title: "SCU".to_string(),
            application_context_name: uids::APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![ContextResult {
                id: 1,
                result: ContextResultReason::Acceptance,
                transfer_syntax: Some(uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string()),
            }],
            user_info: UserInfo {
                max_pdu_length: 32_768,
                max_async_ops: Some((2, 1)),
                ..UserInfo::default()
            },
        };
        association.apply_acceptance(&ac);
        assert_eq!(association.max_pdu_length, 32_768);
        assert_eq!(association.max_async_ops_invoked, 2);
        assert!(association.context(1).is_some_and(PresentationContext::is_accepted));
        // The unanswered context must not carry traffic.
        assert_eq!(association.context(3).map(|pc| pc.result), Some(ContextState::NoReason));
    }
}
