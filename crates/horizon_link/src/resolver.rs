//! Send-side target resolution.
//!
//! Turns a [`Target`] plus an optional hint into a [`Delivery`] that every
//! transport understands. All misuse that can be detected at the call site is
//! rejected here, before a request id is allocated or a transport is touched.

use crate::error::LinkError;
use crate::node::NodeIdentity;
use crate::target::{RecipientScope, Target};

/// Concrete delivery behaviour for one outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Fan out to every node of `scope`.
    Broadcast {
        scope: RecipientScope,
        /// Only nodes with an active user session take part.
        require_sessions: bool,
        /// Hold the message while no carrier can take it.
        queue_unreachable: bool,
        /// Never deliver back to the origin node.
        exclude_origin: bool,
    },
    /// Unicast to a named node or the node holding a named session.
    Direct { hint: String },
    /// The counterpart of the connection named by `hint`.
    Current { hint: String },
}

impl Delivery {
    /// The hint carried on the wire; empty for broadcasts.
    pub fn hint(&self) -> &str {
        match self {
            Delivery::Broadcast { .. } => "",
            Delivery::Direct { hint } | Delivery::Current { hint } => hint.as_str(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Delivery::Broadcast { .. })
    }
}

/// Resolves `target` for a message sent by `sender`.
///
/// # Arguments
///
/// * `target` - The routing intent
/// * `hint` - Receiver hint; required for `CURRENT`, `SERVER` and `PROXY`,
///   ignored for broadcasts
/// * `sender` - Identity of the sending node
///
/// # Errors
///
/// * [`LinkError::DirectionalityViolation`] when the target may not be issued
///   from the sender's side
/// * [`LinkError::UnroutableTarget`] when an addressed target has no hint
pub fn resolve(target: Target, hint: Option<&str>, sender: &NodeIdentity) -> Result<Delivery, LinkError> {
    if !target.allowed_from(sender.side()) {
        return Err(LinkError::DirectionalityViolation {
            target,
            side: sender.side(),
        });
    }

    match target.recipient_scope() {
        RecipientScope::Addressed => {
            let hint = hint
                .map(str::trim)
                .filter(|hint| !hint.is_empty())
                .ok_or_else(|| {
                    LinkError::UnroutableTarget(format!("target {target} requires a receiver hint"))
                })?
                .to_string();
            Ok(match target {
                Target::Current => Delivery::Current { hint },
                _ => Delivery::Direct { hint },
            })
        }
        scope => Ok(Delivery::Broadcast {
            scope,
            require_sessions: target.requires_sessions(),
            queue_unreachable: target.queues_when_unreachable(),
            exclude_origin: target.excludes_origin(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeSide;

    #[test]
    fn server_cannot_address_a_server() {
        let sender = NodeIdentity::server("survival-1", "");
        assert_eq!(
            resolve(Target::Server, Some("survival-2"), &sender),
            Err(LinkError::DirectionalityViolation {
                target: Target::Server,
                side: NodeSide::Server,
            })
        );
    }

    #[test]
    fn proxy_cannot_address_a_proxy_by_session() {
        let sender = NodeIdentity::proxy("edge", "");
        assert!(matches!(
            resolve(Target::Proxy, Some("alice"), &sender),
            Err(LinkError::DirectionalityViolation { .. })
        ));
    }

    #[test]
    fn addressed_targets_need_a_hint() {
        let proxy = NodeIdentity::proxy("edge", "");
        assert!(matches!(
            resolve(Target::Server, None, &proxy),
            Err(LinkError::UnroutableTarget(_))
        ));
        assert!(matches!(
            resolve(Target::Current, Some("  "), &proxy),
            Err(LinkError::UnroutableTarget(_))
        ));
        assert_eq!(
            resolve(Target::Server, Some("survival-1"), &proxy),
            Ok(Delivery::Direct {
                hint: "survival-1".to_string()
            })
        );
    }

    #[test]
    fn broadcasts_carry_their_flags() {
        let server = NodeIdentity::server("survival-1", "alpha");
        let delivery = resolve(Target::OthersQueue, Some("ignored"), &server).unwrap();
        assert_eq!(
            delivery,
            Delivery::Broadcast {
                scope: RecipientScope::Servers,
                require_sessions: false,
                queue_unreachable: true,
                exclude_origin: true,
            }
        );
        assert_eq!(delivery.hint(), "");

        let delivery = resolve(Target::AllWithPlayers, None, &server).unwrap();
        assert!(matches!(
            delivery,
            Delivery::Broadcast {
                require_sessions: true,
                queue_unreachable: false,
                ..
            }
        ));
    }
}
