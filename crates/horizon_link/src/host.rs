//! The embedding process, as seen by the link.
//!
//! The link core never looks up players, connections or servers itself. It asks
//! its [`LinkHost`] instead: who am I, is this name something I hold locally,
//! do I currently host anyone, and where should background work run.

use crate::node::NodeIdentity;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::fmt;

/// What a resolved receiver name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiverKind {
    /// The local node itself.
    Node,
    /// A user session hosted by this node.
    Session,
    /// A carrier connection owned by this node.
    Connection,
}

/// A local receiver resolved from a target hint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiverHandle {
    pub name: String,
    pub kind: ReceiverKind,
}

impl ReceiverHandle {
    pub fn new(name: impl Into<String>, kind: ReceiverKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

impl fmt::Display for ReceiverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.name, self.kind)
    }
}

/// Services the link core needs from the process embedding it.
///
/// Implementations must be cheap to call from any task; they are consulted on
/// every inbound message.
pub trait LinkHost: Send + Sync + 'static {
    /// The identity this process uses on the link.
    fn identity(&self) -> &NodeIdentity;

    /// Resolves a hint string to a receiver held by this process.
    ///
    /// # Arguments
    ///
    /// * `name` - A node name, session name or connection name taken from a
    ///   target hint
    ///
    /// # Returns
    ///
    /// `Some(handle)` when the name refers to something local, `None` otherwise.
    fn resolve_local_receiver(&self, name: &str) -> Option<ReceiverHandle>;

    /// Whether at least one user session is currently active on this node.
    fn has_active_sessions(&self) -> bool;

    /// Runs background work, such as an outbound publish, off the caller's path.
    fn schedule(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(task);
    }
}

/// A host backed by an in-memory session table.
///
/// Used by the standalone node binary and by tests; game servers and proxies
/// embedding the link normally implement [`LinkHost`] over their own player and
/// connection registries.
#[derive(Debug)]
pub struct StandaloneHost {
    identity: NodeIdentity,
    receivers: DashMap<String, ReceiverKind>,
}

impl StandaloneHost {
    pub fn new(identity: NodeIdentity) -> Self {
        Self {
            identity,
            receivers: DashMap::new(),
        }
    }

    pub fn add_session(&self, name: impl Into<String>) {
        self.receivers.insert(name.into(), ReceiverKind::Session);
    }

    pub fn add_connection(&self, name: impl Into<String>) {
        self.receivers.insert(name.into(), ReceiverKind::Connection);
    }

    /// Forgets a session or connection. Returns whether it was known.
    pub fn remove(&self, name: &str) -> bool {
        self.receivers.remove(name).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.receivers
            .iter()
            .filter(|entry| *entry.value() == ReceiverKind::Session)
            .count()
    }
}

impl LinkHost for StandaloneHost {
    fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    fn resolve_local_receiver(&self, name: &str) -> Option<ReceiverHandle> {
        if name == self.identity.name() {
            return Some(ReceiverHandle::new(name, ReceiverKind::Node));
        }
        self.receivers
            .get(name)
            .map(|entry| ReceiverHandle::new(name, *entry.value()))
    }

    fn has_active_sessions(&self) -> bool {
        self.session_count() > 0
    }
}
