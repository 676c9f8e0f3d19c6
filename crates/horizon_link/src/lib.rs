//! # Horizon Link
//!
//! Cross-process messaging between Horizon game servers and the proxy tier in
//! front of them. Nodes exchange versioned [`Envelope`]s over one of several
//! interchangeable transports and get request/response semantics on top of
//! fire-and-forget delivery.
//!
//! ## Core Features
//!
//! - **Transport Agnostic**: the same router and correlation layer run over the
//!   in-band relay, an MQTT broker, a Pulsar broker or an in-process broker
//! - **Typed Routing Targets**: every [`Target`] carries its own directional
//!   legality and delivery rule, checked before anything reaches the wire
//! - **Group Isolation**: nodes in different non-empty groups never see each
//!   other's messages
//! - **Correlated Requests**: awaitable boolean completions plus any number of
//!   streaming text callbacks per request, with bounded lifetimes
//! - **No Global State**: one explicitly constructed [`LinkBus`] per process
//!
//! ## Architecture Overview
//!
//! ### Envelope and frames
//! [`Envelope`] is the transport-independent message record. Broker transports
//! wrap it in a [`RoutingFrame`] carrying the sender's group and an optional
//! receiver hint; the relay transport sends the bare envelope because its
//! carriers already encode the topology.
//!
//! ### Routing
//! On the way out, [`resolve`] turns a target and hint into a [`Delivery`] or a
//! synchronous error. On the way in, the [`Router`] applies scope, self-origin,
//! group and session filters before looking up the `(plugin, action)` handler.
//!
//! ### Correlation
//! The [`Correlator`] keeps pending requests in an expiring table. Responses
//! and stream lines are reserved actions that never reach user handlers.
//!
//! ## Quick Start Example
//!
//! ```rust,no_run
//! use horizon_link::*;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), LinkError> {
//! let host = Arc::new(StandaloneHost::new(NodeIdentity::server("survival-1", "alpha")));
//! let bus = LinkBus::from_settings(host, &LinkSettings::default()).await?;
//!
//! bus.register_handler("pluginX", "ping", |ctx| {
//!     println!("{} says {}", ctx.origin_node(), ctx.body_str()?);
//!     ctx.respond(true)
//! });
//!
//! let request = bus.send_request("pluginX", "ping", Target::AllQueue, None, "hello")?;
//! let answered = bus.await_completion(request).await?;
//! # let _ = answered;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod host;
pub mod node;
pub mod payload;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod router;
pub mod stats;
pub mod target;
pub mod transport;
mod wire;

pub use bus::{LinkBus, MessageContext};
pub use config::{
    CorrelationSettings, LinkSettings, MqttSettings, PulsarSettings, RelaySettings,
    TransportSettings,
};
pub use correlation::{
    Clock, Correlator, ManualClock, RequestHandle, StreamCallback, SystemClock,
    DEFAULT_COMPLETION_TTL, DEFAULT_STREAM_TTL,
};
pub use envelope::{Envelope, ENVELOPE_VERSION};
pub use error::LinkError;
pub use frame::RoutingFrame;
pub use host::{LinkHost, ReceiverHandle, ReceiverKind, StandaloneHost};
pub use node::{NodeIdentity, NodeSide, PROXY_NODE_PREFIX};
pub use payload::{CorrelatedPayload, NO_REPLY, RESPONSE_ACTION, STREAM_ACTION};
pub use registry::{HandlerKey, HandlerRegistry, LinkHandler};
pub use resolver::{resolve, Delivery};
pub use retry::{ReconnectSchedule, RetryPolicy};
pub use router::{groups_compatible, DropReason, RouteDecision, Router};
pub use stats::{LinkStats, LinkStatsSnapshot};
pub use target::{RecipientScope, Target};
pub use transport::{
    Carrier, InboundFrame, MemoryBroker, MemoryTransport, MqttTransport, Outbound,
    PulsarTransport, RelayTransport, Transport, TransportContext, TransportKind,
};
