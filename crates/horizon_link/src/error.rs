//! Error taxonomy for the link core.
//!
//! Errors fall into two groups. Send-side errors (directionality, a missing
//! hint, configuration) are returned straight to the caller that issued the
//! send. Receive-side errors (version mismatch, malformed input) never travel
//! back to the sender; the receiving transport logs them and drops the single
//! message.

use crate::node::NodeSide;
use crate::target::Target;

/// Errors produced by the link core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// The envelope was written by a peer speaking a different format version.
    #[error("protocol version mismatch: received {received}, supported {supported} (peer must be upgraded to the same link version)")]
    ProtocolVersionMismatch { received: u32, supported: u32 },
    /// The buffer could not be decoded as an envelope or frame.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    /// The target may not be issued from this side of the network.
    #[error("target {target} cannot be sent from a {side} node")]
    DirectionalityViolation { target: Target, side: NodeSide },
    /// No route exists for the message.
    #[error("unroutable target: {0}")]
    UnroutableTarget(String),
    /// Connection, publish or encode failure inside a transport.
    #[error("transport failure: {0}")]
    TransportFailure(String),
    /// The pending request outlived its time-to-live without completing.
    #[error("request {id:#018x} expired before a response arrived")]
    RequestExpired { id: u64 },
    /// A registered handler reported a failure.
    #[error("handler execution error: {0}")]
    HandlerExecution(String),
    /// Invalid settings supplied at start-up.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl LinkError {
    /// Whether the error only concerns a single inbound message and should be
    /// logged and dropped rather than propagated.
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            LinkError::ProtocolVersionMismatch { .. } | LinkError::MalformedEnvelope(_)
        )
    }
}
