//! In-band relay transport.
//!
//! The relay has no network connection of its own. It writes envelopes onto
//! connections the host already maintains between a proxy and its game servers
//! (one [`Carrier`] per connection) and relies on that topology for routing:
//!
//! * a game server sends everything to its proxy over any carrier;
//! * a proxy delivers server-scope broadcasts to each carrier and forwards
//!   server-scope broadcasts it receives from one server to the others.
//!
//! Broadcasts that may be queued are held in a bounded FIFO backlog while no
//! carrier exists and flushed, in order, to the first carrier that attaches.
//! A carrier that refuses data gets its own deferred FIFO, flushed on
//! [`RelayTransport::notify_ready`]. Overflow drops the oldest frame.
//!
//! Relay frames carry no hint. When a proxy forwards a request from one server
//! to the others it remembers the sender's carrier under the request id, and
//! responses or stream lines for that id are passed back to it until the
//! route expires. Replies to the proxy's own requests are routed locally.

use super::{Outbound, Transport, TransportContext, TransportKind};
use crate::config::RelaySettings;
use crate::correlation::is_expired;
use crate::envelope::Envelope;
use crate::error::LinkError;
use crate::node::NodeSide;
use crate::payload::{is_reply_action, CorrelatedPayload, NO_REPLY};
use crate::resolver::Delivery;
use crate::target::RecipientScope;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A host connection able to carry relay frames.
///
/// Implementations must not block and must not call back into the relay from
/// [`deliver`](Carrier::deliver); it runs while the relay holds its queue lock.
pub trait Carrier: Send + Sync {
    /// Unique name of the connection. On a proxy this is the name of the game
    /// server at the other end.
    fn name(&self) -> &str;

    /// Writes one frame. Returns `false` when the connection cannot take data now.
    fn deliver(&self, frame: Bytes) -> bool;

    /// Whether the far end currently hosts at least one user session.
    fn has_sessions(&self) -> bool {
        true
    }

    /// Whether the user session `session` travels over this connection.
    fn hosts_session(&self, _session: &str) -> bool {
        false
    }
}

struct CarrierSlot {
    carrier: Arc<dyn Carrier>,
    deferred: VecDeque<Bytes>,
}

/// Carrier a forwarded request came in on.
struct ReplyRoute {
    carrier: String,
    created_at: Instant,
}

#[derive(Default)]
struct RelayState {
    carriers: Vec<CarrierSlot>,
    backlog: VecDeque<Bytes>,
    reply_routes: HashMap<u64, ReplyRoute>,
    closed: bool,
}

/// Connection-bound transport for hosts that already link proxies and servers.
pub struct RelayTransport {
    context: TransportContext,
    capacity: usize,
    reply_route_ttl: Duration,
    state: Mutex<RelayState>,
}

impl fmt::Debug for RelayTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RelayTransport")
            .field("node", &self.context.identity().name())
            .field("carriers", &state.carriers.len())
            .field("backlog", &state.backlog.len())
            .field("reply_routes", &state.reply_routes.len())
            .finish()
    }
}

impl RelayTransport {
    pub fn new(context: TransportContext, settings: &RelaySettings) -> Self {
        Self {
            context,
            capacity: settings.queue_capacity.max(1),
            reply_route_ttl: settings.reply_route_ttl(),
            state: Mutex::new(RelayState::default()),
        }
    }

    /// Adds (or replaces) a carrier and flushes the backlog onto it.
    ///
    /// A replacement inherits the frames deferred on the carrier it replaces;
    /// they are written before the backlog.
    pub fn attach_carrier(&self, carrier: Arc<dyn Carrier>) {
        let name = carrier.name().to_string();
        let mut state = self.state.lock();
        let backlog: Vec<Bytes> = state.backlog.drain(..).collect();
        let flushed = backlog.len();

        let existing = state
            .carriers
            .iter()
            .position(|slot| slot.carrier.name() == name);
        let inherited = match existing {
            Some(index) => std::mem::take(&mut state.carriers[index].deferred),
            None => VecDeque::new(),
        };
        let migrated = inherited.len();

        let mut slot = CarrierSlot {
            carrier,
            deferred: VecDeque::new(),
        };
        for frame in inherited.into_iter().chain(backlog) {
            self.deliver_or_defer(&mut slot, frame);
        }

        match existing {
            Some(index) => state.carriers[index] = slot,
            None => state.carriers.push(slot),
        }
        drop(state);

        info!(carrier = %name, flushed, migrated, "🔗 Relay carrier attached");
    }

    /// Removes a carrier. Frames deferred on it are dropped and counted.
    pub fn detach_carrier(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        let Some(index) = state.carriers.iter().position(|slot| slot.carrier.name() == name) else {
            return false;
        };
        let slot = state.carriers.remove(index);
        drop(state);

        if !slot.deferred.is_empty() {
            for _ in 0..slot.deferred.len() {
                self.context.stats().record_dropped();
            }
            debug!(
                carrier = name,
                dropped = slot.deferred.len(),
                "Dropping frames deferred on detached carrier"
            );
        }
        info!(carrier = name, "Relay carrier detached");
        true
    }

    /// Retries frames deferred on `name` after it reported it can take data again.
    ///
    /// Returns how many frames were written.
    pub fn notify_ready(&self, name: &str) -> usize {
        let mut state = self.state.lock();
        let Some(slot) = state.carriers.iter_mut().find(|slot| slot.carrier.name() == name) else {
            return 0;
        };

        let mut written = 0;
        while let Some(frame) = slot.deferred.pop_front() {
            if !slot.carrier.deliver(frame.clone()) {
                slot.deferred.push_front(frame);
                break;
            }
            written += 1;
        }
        written
    }

    /// Handles bytes the host read from carrier `via`.
    ///
    /// Returns `false` once the bus stopped listening.
    pub fn receive(&self, via: &str, data: &[u8]) -> bool {
        let stats = self.context.stats();
        stats.record_received();
        let envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.context.reject(&e);
                return true;
            }
        };

        let target = envelope.target();
        if self.side() == NodeSide::Proxy {
            if target.recipient_scope() == RecipientScope::Servers {
                let request_id = request_id_of(&envelope);
                if request_id != NO_REPLY && !is_reply_action(envelope.action()) {
                    self.remember_reply_route(request_id, via);
                }
                self.forward(
                    via,
                    target.excludes_origin(),
                    target.requires_sessions(),
                    target.queues_when_unreachable(),
                    Bytes::copy_from_slice(data),
                );
                return true;
            }
            if is_reply_action(envelope.action())
                && self.pass_back_reply(via, request_id_of(&envelope), Bytes::copy_from_slice(data))
            {
                return true;
            }
        }

        self.context.push_relayed(via, envelope)
    }

    pub fn carrier_count(&self) -> usize {
        self.state.lock().carriers.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.state.lock().backlog.len()
    }

    /// Frames waiting on carrier `name`.
    pub fn deferred_len(&self, name: &str) -> usize {
        self.state
            .lock()
            .carriers
            .iter()
            .find(|slot| slot.carrier.name() == name)
            .map_or(0, |slot| slot.deferred.len())
    }

    /// Forwarded requests whose replies are still passed back.
    pub fn reply_route_count(&self) -> usize {
        self.state.lock().reply_routes.len()
    }

    fn side(&self) -> NodeSide {
        self.context.identity().side()
    }

    fn remember_reply_route(&self, request_id: u64, via: &str) {
        let now = Instant::now();
        let ttl = self.reply_route_ttl;
        let mut state = self.state.lock();
        state
            .reply_routes
            .retain(|_, route| !is_expired(now, route.created_at, ttl));
        state.reply_routes.insert(
            request_id,
            ReplyRoute {
                carrier: via.to_string(),
                created_at: now,
            },
        );
    }

    /// Proxy side: hands a reply to the server that sent the request.
    ///
    /// Returns `false` when no live route exists and the reply is for this node.
    /// Routes stay until they expire since several servers may answer.
    fn pass_back_reply(&self, via: &str, request_id: u64, frame: Bytes) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        let route = state
            .reply_routes
            .get(&request_id)
            .map(|route| (route.carrier.clone(), is_expired(now, route.created_at, self.reply_route_ttl)));
        let carrier = match route {
            Some((carrier, false)) => carrier,
            Some((_, true)) => {
                state.reply_routes.remove(&request_id);
                return false;
            }
            None => return false,
        };

        match state.carriers.iter_mut().find(|slot| slot.carrier.name() == carrier) {
            Some(slot) => {
                self.deliver_or_defer(slot, frame);
                debug!(source = via, carrier = %carrier, request_id, "Passed reply back");
            }
            None => {
                debug!(carrier = %carrier, request_id, "Requesting carrier is gone, dropping reply");
                self.context.stats().record_dropped();
            }
        }
        true
    }

    /// Proxy side: pass a server broadcast on to the other servers.
    fn forward(&self, source: &str, exclude_source: bool, require_sessions: bool, queue: bool, frame: Bytes) {
        let mut state = self.state.lock();
        let mut delivered = 0;
        for slot in state.carriers.iter_mut() {
            if exclude_source && slot.carrier.name() == source {
                continue;
            }
            if require_sessions && !slot.carrier.has_sessions() {
                continue;
            }
            if queue {
                self.deliver_or_defer(slot, frame.clone());
                delivered += 1;
            } else if slot.carrier.deliver(frame.clone()) {
                delivered += 1;
            }
        }
        debug!(source, delivered, "Forwarded relay broadcast");
    }

    fn deliver_or_defer(&self, slot: &mut CarrierSlot, frame: Bytes) {
        if !slot.deferred.is_empty() || !slot.carrier.deliver(frame.clone()) {
            push_bounded(&mut slot.deferred, frame, self.capacity, &self.context);
        }
    }

    fn send_broadcast(
        &self,
        state: &mut RelayState,
        scope: RecipientScope,
        require_sessions: bool,
        queue: bool,
        exclude_origin: bool,
        frame: Bytes,
    ) -> Result<(), LinkError> {
        match (self.side(), scope) {
            (NodeSide::Proxy, RecipientScope::Proxies) => {
                if !exclude_origin {
                    self.context.loop_back(&frame);
                }
                Ok(())
            }
            (NodeSide::Proxy, _) => {
                if state.carriers.is_empty() {
                    if !queue {
                        return Err(LinkError::TransportFailure(
                            "no carrier connection available".to_string(),
                        ));
                    }
                    push_bounded(&mut state.backlog, frame, self.capacity, &self.context);
                    return Ok(());
                }
                let mut reached = 0;
                for slot in state.carriers.iter_mut() {
                    if require_sessions && !slot.carrier.has_sessions() {
                        continue;
                    }
                    if queue {
                        self.deliver_or_defer(slot, frame.clone());
                        reached += 1;
                    } else if slot.carrier.deliver(frame.clone()) {
                        reached += 1;
                    }
                }
                debug!(reached, "Relayed broadcast to carriers");
                Ok(())
            }
            (NodeSide::Server, _) => match state.carriers.first_mut() {
                Some(slot) if queue => {
                    self.deliver_or_defer(slot, frame);
                    Ok(())
                }
                Some(slot) => {
                    if slot.carrier.deliver(frame) {
                        Ok(())
                    } else {
                        Err(LinkError::TransportFailure(format!(
                            "carrier {} cannot take data",
                            slot.carrier.name()
                        )))
                    }
                }
                None if queue => {
                    push_bounded(&mut state.backlog, frame, self.capacity, &self.context);
                    Ok(())
                }
                None => Err(LinkError::TransportFailure(
                    "no carrier connection available".to_string(),
                )),
            },
        }
    }

    fn send_addressed(&self, state: &mut RelayState, hint: &str, frame: Bytes) -> Result<(), LinkError> {
        let named = state
            .carriers
            .iter()
            .position(|slot| slot.carrier.name() == hint || slot.carrier.hosts_session(hint));
        // A server reaches every session through its single upstream proxy.
        let index = match (named, self.side()) {
            (Some(index), _) => index,
            (None, NodeSide::Server) if !state.carriers.is_empty() => 0,
            (None, _) => {
                return Err(LinkError::UnroutableTarget(format!(
                    "no carrier for '{hint}'"
                )))
            }
        };

        let slot = &state.carriers[index];
        if slot.carrier.deliver(frame) {
            Ok(())
        } else {
            Err(LinkError::TransportFailure(format!(
                "carrier {} cannot take data",
                slot.carrier.name()
            )))
        }
    }
}

fn request_id_of(envelope: &Envelope) -> u64 {
    CorrelatedPayload::decode(envelope.payload()).map_or(NO_REPLY, |payload| payload.request_id)
}

/// Appends `frame`, dropping the oldest entry when full.
fn push_bounded(queue: &mut VecDeque<Bytes>, frame: Bytes, capacity: usize, context: &TransportContext) {
    if queue.len() >= capacity {
        queue.pop_front();
        warn!(capacity, "Relay queue full, dropping oldest frame");
        context.stats().record_dropped();
    }
    queue.push_back(frame);
}

#[async_trait]
impl Transport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    async fn send(&self, outbound: Outbound) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LinkError::TransportFailure("relay transport is closed".to_string()));
        }
        match &outbound.delivery {
            Delivery::Broadcast {
                scope,
                require_sessions,
                queue_unreachable,
                exclude_origin,
            } => self.send_broadcast(
                &mut state,
                *scope,
                *require_sessions,
                *queue_unreachable,
                *exclude_origin,
                outbound.envelope,
            ),
            Delivery::Direct { hint } | Delivery::Current { hint } => {
                self.send_addressed(&mut state, hint, outbound.envelope)
            }
        }
    }

    async fn close(&self) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            state.carriers.clear();
            state.backlog.clear();
            state.reply_routes.clear();
            info!("Relay transport closed");
        }
        Ok(())
    }
}
