//! Transports move opaque frames between nodes.
//!
//! A transport never interprets envelopes beyond decoding them for the router.
//! Outbound it receives an already resolved [`Outbound`]; inbound it pushes
//! [`InboundFrame`]s through the [`TransportContext`] it was started with.
//!
//! Implementations:
//!
//! * [`RelayTransport`] rides on existing per-session connections and queues
//!   broadcasts while no connection exists
//! * [`MqttTransport`] and [`PulsarTransport`] publish a [`RoutingFrame`] on a
//!   single shared topic that every node subscribes to
//! * [`MemoryTransport`] does the same over an in-process [`MemoryBroker`]

pub mod memory;
pub mod mqtt;
pub mod pulsar;
pub mod relay;

pub use memory::{MemoryBroker, MemoryTransport};
pub use mqtt::MqttTransport;
pub use pulsar::PulsarTransport;
pub use relay::{Carrier, RelayTransport};

use crate::config::TransportSettings;
use crate::envelope::Envelope;
use crate::error::LinkError;
use crate::frame::RoutingFrame;
use crate::host::LinkHost;
use crate::node::NodeIdentity;
use crate::resolver::Delivery;
use crate::stats::LinkStats;
use crate::target::Target;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Relay,
    Mqtt,
    Pulsar,
    Memory,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Relay => "relay",
            TransportKind::Mqtt => "mqtt",
            TransportKind::Pulsar => "pulsar",
            TransportKind::Memory => "memory",
        })
    }
}

/// One resolved outbound message.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub target: Target,
    pub delivery: Delivery,
    /// Sender's isolation group.
    pub group: String,
    /// The encoded envelope.
    pub envelope: Bytes,
}

impl Outbound {
    /// The pub/sub frame for this message.
    pub fn to_frame(&self) -> RoutingFrame {
        RoutingFrame::new(self.group.clone(), self.delivery.hint(), self.envelope.clone())
    }
}

/// A decoded inbound message waiting for the router.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub envelope: Envelope,
    /// Sender's group, empty when the transport carries none.
    pub group: String,
    /// Receiver hint, empty for broadcasts and topology-routed frames.
    pub target_hint: String,
    /// The carrier connection the frame arrived on, for connection-bound transports.
    pub via: Option<String>,
}

/// Capability set shared by every transport.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Hands one message to the underlying channel.
    ///
    /// An error means the message was dropped; the core never retries it.
    async fn send(&self, outbound: Outbound) -> Result<(), LinkError>;

    /// Releases connections and background tasks. Idempotent.
    async fn close(&self) -> Result<(), LinkError>;
}

/// Everything a transport needs from the bus it serves.
#[derive(Clone)]
pub struct TransportContext {
    identity: NodeIdentity,
    inbound: mpsc::Sender<InboundFrame>,
    stats: Arc<LinkStats>,
    host: Arc<dyn LinkHost>,
}

impl fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportContext")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl TransportContext {
    pub fn new(
        identity: NodeIdentity,
        inbound: mpsc::Sender<InboundFrame>,
        stats: Arc<LinkStats>,
        host: Arc<dyn LinkHost>,
    ) -> Self {
        Self {
            identity,
            inbound,
            stats,
            host,
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn stats(&self) -> &Arc<LinkStats> {
        &self.stats
    }

    pub fn host(&self) -> &Arc<dyn LinkHost> {
        &self.host
    }

    /// Decodes a pub/sub frame and queues it for routing, waiting for room.
    ///
    /// Undecodable frames are logged and dropped. Returns `false` once the bus
    /// has stopped listening.
    pub async fn accept_routed(&self, data: &[u8]) -> bool {
        self.stats.record_received();
        match decode_routed(data) {
            Ok(frame) => self.inbound.send(frame).await.is_ok(),
            Err(e) => {
                self.reject(&e);
                true
            }
        }
    }

    /// Queues an envelope that arrived on a carrier connection.
    ///
    /// Never waits: when the bus is saturated the frame is dropped.
    pub fn accept_relayed(&self, via: &str, data: &[u8]) -> bool {
        self.stats.record_received();
        match Envelope::decode(data) {
            Ok(envelope) => self.push_relayed(via, envelope),
            Err(e) => {
                self.reject(&e);
                true
            }
        }
    }

    pub(crate) fn push_relayed(&self, via: &str, envelope: Envelope) -> bool {
        let frame = InboundFrame {
            envelope,
            group: String::new(),
            target_hint: String::new(),
            via: Some(via.to_string()),
        };
        match self.inbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(carrier = via, "Inbound queue full, dropping relayed frame");
                self.stats.record_dropped();
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Feeds an outbound envelope straight back into this node.
    pub(crate) fn loop_back(&self, envelope: &Bytes) {
        match Envelope::decode(envelope) {
            Ok(envelope) => {
                let frame = InboundFrame {
                    envelope,
                    group: String::new(),
                    target_hint: String::new(),
                    via: None,
                };
                if self.inbound.try_send(frame).is_err() {
                    debug!("Inbound queue unavailable, dropping looped-back frame");
                    self.stats.record_dropped();
                }
            }
            Err(e) => self.reject(&e),
        }
    }

    pub(crate) fn reject(&self, error: &LinkError) {
        warn!(error = %error, "Dropping undecodable frame");
        self.stats.record_decode_failure();
    }
}

/// Decodes the outer pub/sub frame and the envelope inside it.
pub fn decode_routed(data: &[u8]) -> Result<InboundFrame, LinkError> {
    let frame = RoutingFrame::decode(data)?;
    let envelope = Envelope::decode(&frame.envelope)?;
    Ok(InboundFrame {
        envelope,
        group: frame.group,
        target_hint: frame.target_hint,
        via: None,
    })
}

/// Starts the broker transport selected by `settings`.
///
/// The relay transport is not built here: its carriers come from the host, so it
/// is created through [`LinkBus::relay`](crate::LinkBus::relay).
pub async fn connect(
    settings: &TransportSettings,
    context: TransportContext,
) -> Result<Arc<dyn Transport>, LinkError> {
    match settings {
        TransportSettings::Relay(_) => Err(LinkError::Configuration(
            "the relay transport is attached through LinkBus::relay".to_string(),
        )),
        TransportSettings::Mqtt(mqtt) => Ok(Arc::new(MqttTransport::start(mqtt.clone(), context)?)),
        TransportSettings::Pulsar(pulsar) => {
            Ok(Arc::new(PulsarTransport::start(pulsar.clone(), context)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::StandaloneHost;

    fn context(capacity: usize) -> (TransportContext, mpsc::Receiver<InboundFrame>) {
        let identity = NodeIdentity::server("survival-1", "");
        let (tx, rx) = mpsc::channel(capacity);
        let host = Arc::new(StandaloneHost::new(identity.clone()));
        (TransportContext::new(identity, tx, Arc::new(LinkStats::new()), host), rx)
    }

    #[tokio::test]
    async fn routed_frames_are_decoded_with_their_metadata() {
        let (ctx, mut rx) = context(4);
        let envelope = Envelope::new(Target::Server, "proxy:edge", "core", "kick", Bytes::new());
        let frame = RoutingFrame::new("alpha", "survival-1", envelope.encode());

        assert!(ctx.accept_routed(&frame.encode()).await);
        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.envelope, envelope);
        assert_eq!(inbound.group, "alpha");
        assert_eq!(inbound.target_hint, "survival-1");
        assert_eq!(inbound.via, None);
    }

    #[tokio::test]
    async fn garbage_is_counted_and_skipped() {
        let (ctx, mut rx) = context(4);
        assert!(ctx.accept_routed(b"\x00\x00").await);
        assert!(ctx.accept_relayed("conn-1", b"nonsense"));
        assert_eq!(ctx.stats().snapshot().decode_failures, 2);
        assert_eq!(ctx.stats().snapshot().frames_received, 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn saturated_relay_input_drops_instead_of_blocking() {
        let (ctx, _rx) = context(1);
        let envelope = Envelope::new(Target::AllQueue, "lobby", "chat", "say", Bytes::new()).encode();
        assert!(ctx.accept_relayed("conn-1", &envelope));
        assert!(ctx.accept_relayed("conn-1", &envelope));
        assert_eq!(ctx.stats().snapshot().messages_dropped, 1);
    }

    #[tokio::test]
    async fn closed_bus_stops_the_reader() {
        let (ctx, rx) = context(1);
        drop(rx);
        let frame = RoutingFrame::new(
            "",
            "",
            Envelope::new(Target::AllQueue, "lobby", "chat", "say", Bytes::new()).encode(),
        );
        assert!(!ctx.accept_routed(&frame.encode()).await);
    }
}
