//! Node identity: who is speaking on the link and from which side.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix reserving a separate name space for proxy-tier nodes.
///
/// Game servers and proxies may share a broker, so a proxy called `lobby`
/// must never collide with a game server called `lobby`.
pub const PROXY_NODE_PREFIX: &str = "proxy:";

/// Which tier of the network a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeSide {
    /// A game-server process hosting players.
    Server,
    /// A proxy/gateway process fronting one or more game servers.
    Proxy,
}

impl NodeSide {
    /// Infers the side of a node from its name.
    pub fn of_node(name: &str) -> Self {
        if name.starts_with(PROXY_NODE_PREFIX) {
            NodeSide::Proxy
        } else {
            NodeSide::Server
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeSide::Server => "server",
            NodeSide::Proxy => "proxy",
        }
    }
}

impl fmt::Display for NodeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "server" => Ok(NodeSide::Server),
            "proxy" => Ok(NodeSide::Proxy),
            other => Err(format!("unknown node side '{other}' (expected 'server' or 'proxy')")),
        }
    }
}

/// The identity a process uses on the link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    name: String,
    side: NodeSide,
    group: String,
}

impl NodeIdentity {
    /// Identity of a game server.
    pub fn server(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            side: NodeSide::Server,
            group: group.into(),
        }
    }

    /// Identity of a proxy-tier node. The reserved prefix is added when missing.
    pub fn proxy(name: impl Into<String>, group: impl Into<String>) -> Self {
        let name = name.into();
        let name = if name.starts_with(PROXY_NODE_PREFIX) {
            name
        } else {
            format!("{PROXY_NODE_PREFIX}{name}")
        };
        Self {
            name,
            side: NodeSide::Proxy,
            group: group.into(),
        }
    }

    pub fn new(side: NodeSide, name: impl Into<String>, group: impl Into<String>) -> Self {
        match side {
            NodeSide::Server => Self::server(name, group),
            NodeSide::Proxy => Self::proxy(name, group),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn side(&self) -> NodeSide {
        self.side
    }

    /// Isolation group; empty means "exchange with everyone".
    pub fn group(&self) -> &str {
        &self.group
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{} ({})", self.name, self.side)
        } else {
            write!(f, "{} ({}, group '{}')", self.name, self.side, self.group)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_names_get_reserved_prefix_once() {
        let proxy = NodeIdentity::proxy("velocity-1", "");
        assert_eq!(proxy.name(), "proxy:velocity-1");
        assert_eq!(NodeIdentity::proxy("proxy:velocity-1", "").name(), "proxy:velocity-1");
        assert_eq!(NodeSide::of_node(proxy.name()), NodeSide::Proxy);
    }

    #[test]
    fn server_names_are_left_untouched() {
        let server = NodeIdentity::server("survival-1", "eu");
        assert_eq!(server.name(), "survival-1");
        assert_eq!(server.group(), "eu");
        assert_eq!(NodeSide::of_node(server.name()), NodeSide::Server);
    }

    #[test]
    fn side_parses_case_insensitively() {
        assert_eq!("Proxy".parse::<NodeSide>().unwrap(), NodeSide::Proxy);
        assert_eq!("server".parse::<NodeSide>().unwrap(), NodeSide::Server);
        assert!("gateway".parse::<NodeSide>().is_err());
    }
}
