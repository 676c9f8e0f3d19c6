//! Routing targets.
//!
//! Each [`Target`] is a fixed routing intent with fixed delivery rules. The
//! metadata methods on this type are the single source of truth used by the
//! resolver (send side), the router (receive side) and the relay transport.

use crate::error::LinkError;
use crate::node::NodeSide;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Routing intent carried on every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Target {
    /// Every game server currently hosting at least one player. Never queued.
    AllWithPlayers,
    /// Every game server; held until a carrier can take it.
    AllQueue,
    /// Like `AllWithPlayers`, minus the origin node.
    OthersWithPlayers,
    /// Like `AllQueue`, minus the origin node.
    OthersQueue,
    /// The counterpart of the connection named by the hint.
    Current,
    /// A named game server. Proxy to server only.
    Server,
    /// The proxy holding the hinted user session. Server to proxy only.
    Proxy,
    /// Every proxy-tier node.
    AllProxies,
    /// Every proxy-tier node except the origin.
    OtherProxies,
}

/// Which nodes a target is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientScope {
    /// Broadcast to game servers.
    Servers,
    /// Broadcast to proxy-tier nodes.
    Proxies,
    /// Delivered to exactly the node (or connection) named by the hint.
    Addressed,
}

impl Target {
    pub const ALL: [Target; 9] = [
        Target::AllWithPlayers,
        Target::AllQueue,
        Target::OthersWithPlayers,
        Target::OthersQueue,
        Target::Current,
        Target::Server,
        Target::Proxy,
        Target::AllProxies,
        Target::OtherProxies,
    ];

    /// Wire name of the target.
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::AllWithPlayers => "ALL_WITH_PLAYERS",
            Target::AllQueue => "ALL_QUEUE",
            Target::OthersWithPlayers => "OTHERS_WITH_PLAYERS",
            Target::OthersQueue => "OTHERS_QUEUE",
            Target::Current => "CURRENT",
            Target::Server => "SERVER",
            Target::Proxy => "PROXY",
            Target::AllProxies => "ALL_PROXIES",
            Target::OtherProxies => "OTHER_PROXIES",
        }
    }

    /// Whether a node on `side` may issue this target.
    pub fn allowed_from(&self, side: NodeSide) -> bool {
        match self {
            Target::Server | Target::OtherProxies => side == NodeSide::Proxy,
            Target::Proxy => side == NodeSide::Server,
            _ => true,
        }
    }

    pub fn recipient_scope(&self) -> RecipientScope {
        match self {
            Target::AllWithPlayers
            | Target::AllQueue
            | Target::OthersWithPlayers
            | Target::OthersQueue => RecipientScope::Servers,
            Target::AllProxies | Target::OtherProxies => RecipientScope::Proxies,
            Target::Current | Target::Server | Target::Proxy => RecipientScope::Addressed,
        }
    }

    /// Whether a receiver of the given side takes part in this target at all.
    ///
    /// Addressed targets are decided by their hint instead.
    pub fn reaches(&self, side: NodeSide) -> bool {
        match (self.recipient_scope(), self) {
            (RecipientScope::Servers, _) | (_, Target::Server) => side == NodeSide::Server,
            (RecipientScope::Proxies, _) | (_, Target::Proxy) => side == NodeSide::Proxy,
            _ => true,
        }
    }

    pub fn requires_hint(&self) -> bool {
        self.recipient_scope() == RecipientScope::Addressed
    }

    /// The "others" family: never delivered back to the origin node.
    pub fn excludes_origin(&self) -> bool {
        matches!(
            self,
            Target::OthersWithPlayers | Target::OthersQueue | Target::OtherProxies
        )
    }

    /// Only delivered to nodes currently holding a user session.
    pub fn requires_sessions(&self) -> bool {
        matches!(self, Target::AllWithPlayers | Target::OthersWithPlayers)
    }

    /// Buffered when a recipient cannot take data yet.
    pub fn queues_when_unreachable(&self) -> bool {
        matches!(self, Target::AllQueue | Target::OthersQueue)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Target::ALL
            .iter()
            .copied()
            .find(|target| target.as_str() == s)
            .ok_or_else(|| LinkError::MalformedEnvelope(format!("unknown target '{s}'")))
    }
}
