//! Receive-side routing.
//!
//! The [`Router`] decides what happens to every inbound envelope. Filters run
//! in a fixed order and the first mismatch drops the message:
//!
//! 1. recipient scope / addressing
//! 2. self-origin suppression for the "others" family
//! 3. group isolation
//! 4. session requirement for `*_WITH_PLAYERS`
//! 5. reply actions go to the correlation layer
//! 6. handler lookup
//!
//! Nothing the router decides is ever reported back to the sender.

use crate::host::{LinkHost, ReceiverHandle, ReceiverKind};
use crate::node::NodeIdentity;
use crate::payload::{CorrelatedPayload, RESPONSE_ACTION, STREAM_ACTION};
use crate::registry::{HandlerRegistry, LinkHandler};
use crate::target::RecipientScope;
use crate::transport::InboundFrame;
use std::fmt;

/// Why an inbound message was not dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// A broadcast meant for the other tier.
    WrongSide,
    /// An addressed message for a receiver this node does not hold.
    NotAddressed,
    /// An "others" broadcast that originated here.
    SelfOrigin,
    /// Both groups are set and differ.
    GroupMismatch,
    /// A `*_WITH_PLAYERS` broadcast while no session is active.
    NoActiveSessions,
    /// No handler for `(origin plugin, action)`.
    NoHandler,
    /// The payload lacks a valid correlation prefix or reply body.
    MalformedPayload,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::WrongSide => "wrong side",
            DropReason::NotAddressed => "not addressed to this node",
            DropReason::SelfOrigin => "self origin",
            DropReason::GroupMismatch => "group mismatch",
            DropReason::NoActiveSessions => "no active sessions",
            DropReason::NoHandler => "no handler",
            DropReason::MalformedPayload => "malformed payload",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of routing one inbound message.
pub enum RouteDecision {
    /// Run `handler` with the decoded payload.
    Dispatch {
        handler: LinkHandler,
        payload: CorrelatedPayload,
        receiver: Option<ReceiverHandle>,
    },
    /// Resolve the pending request `id`.
    Complete { id: u64, value: bool },
    /// Hand an interim line to the stream callbacks of `id`.
    Stream { id: u64, message: String },
    Drop(DropReason),
}

impl fmt::Debug for RouteDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteDecision::Dispatch { payload, receiver, .. } => f
                .debug_struct("Dispatch")
                .field("request_id", &payload.request_id)
                .field("receiver", receiver)
                .finish_non_exhaustive(),
            RouteDecision::Complete { id, value } => f
                .debug_struct("Complete")
                .field("id", id)
                .field("value", value)
                .finish(),
            RouteDecision::Stream { id, message } => f
                .debug_struct("Stream")
                .field("id", id)
                .field("message", message)
                .finish(),
            RouteDecision::Drop(reason) => f.debug_tuple("Drop").field(reason).finish(),
        }
    }
}

/// Inbound filter chain plus the handler table of one node.
#[derive(Debug)]
pub struct Router {
    identity: NodeIdentity,
    registry: HandlerRegistry,
}

impl Router {
    pub fn new(identity: NodeIdentity) -> Self {
        Self {
            identity,
            registry: HandlerRegistry::new(),
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Routes one inbound frame.
    ///
    /// # Arguments
    ///
    /// * `frame` - The decoded frame as handed over by a transport
    /// * `host` - Used to resolve hints and to check for active sessions
    ///
    /// # Returns
    ///
    /// The decision for this frame. Handlers are cloned out of the registry so
    /// no map guard is held while they run.
    pub fn route(&self, frame: &InboundFrame, host: &dyn LinkHost) -> RouteDecision {
        let envelope = &frame.envelope;
        let target = envelope.target();

        let receiver = match target.recipient_scope() {
            RecipientScope::Addressed => {
                if !target.reaches(self.identity.side()) {
                    return RouteDecision::Drop(DropReason::WrongSide);
                }
                match self.resolve_hint(&frame.target_hint, host) {
                    Ok(receiver) => receiver,
                    Err(reason) => return RouteDecision::Drop(reason),
                }
            }
            _ if !target.reaches(self.identity.side()) => {
                return RouteDecision::Drop(DropReason::WrongSide);
            }
            _ => None,
        };

        if target.excludes_origin() && envelope.origin_node() == self.identity.name() {
            return RouteDecision::Drop(DropReason::SelfOrigin);
        }

        if !groups_compatible(self.identity.group(), &frame.group) {
            return RouteDecision::Drop(DropReason::GroupMismatch);
        }

        if target.requires_sessions() && !host.has_active_sessions() {
            return RouteDecision::Drop(DropReason::NoActiveSessions);
        }

        let payload = match CorrelatedPayload::decode(envelope.payload()) {
            Ok(payload) => payload,
            Err(_) => return RouteDecision::Drop(DropReason::MalformedPayload),
        };

        match envelope.action() {
            RESPONSE_ACTION => match payload.response_value() {
                Ok(value) => RouteDecision::Complete {
                    id: payload.request_id,
                    value,
                },
                Err(_) => RouteDecision::Drop(DropReason::MalformedPayload),
            },
            STREAM_ACTION => match payload.stream_text() {
                Ok(message) => RouteDecision::Stream {
                    id: payload.request_id,
                    message: message.to_string(),
                },
                Err(_) => RouteDecision::Drop(DropReason::MalformedPayload),
            },
            action => match self.registry.lookup(envelope.origin_plugin(), action) {
                Some(handler) => RouteDecision::Dispatch {
                    handler,
                    payload,
                    receiver,
                },
                None => RouteDecision::Drop(DropReason::NoHandler),
            },
        }
    }

    /// Empty hints are topology-routed and accepted as-is.
    fn resolve_hint(
        &self,
        hint: &str,
        host: &dyn LinkHost,
    ) -> Result<Option<ReceiverHandle>, DropReason> {
        if hint.is_empty() {
            return Ok(None);
        }
        if hint == self.identity.name() {
            return Ok(Some(ReceiverHandle::new(hint, ReceiverKind::Node)));
        }
        host.resolve_local_receiver(hint)
            .map(Some)
            .ok_or(DropReason::NotAddressed)
    }
}

/// An empty group on either side opts out of isolation.
pub fn groups_compatible(local: &str, remote: &str) -> bool {
    local.is_empty() || remote.is_empty() || local == remote
}
