//! The per-process link bus.
//!
//! A [`LinkBus`] owns everything one node needs to talk to its peers: its
//! identity, the router and handler table, the correlation layer, counters and
//! exactly one transport. There is no global state; hosts pass the bus (or an
//! `Arc` of it) to whatever needs to send.
//!
//! ```text
//! caller ──send_request──▶ resolver ──▶ correlator ──▶ envelope ──▶ transport
//!                                                                      │
//! handler ◀── router ◀── dispatcher task ◀── mpsc ◀── transport ◀──────┘
//!                 └──▶ correlator (responses, stream lines)
//! ```

use crate::config::{CorrelationSettings, LinkSettings, RelaySettings, TransportSettings};
use crate::correlation::{Clock, Correlator, RequestHandle, SystemClock};
use crate::envelope::Envelope;
use crate::error::LinkError;
use crate::host::{LinkHost, ReceiverHandle};
use crate::node::NodeIdentity;
use crate::payload::{CorrelatedPayload, NO_REPLY, RESPONSE_ACTION, STREAM_ACTION};
use crate::registry::LinkHandler;
use crate::resolver::{self, Delivery};
use crate::router::{RouteDecision, Router};
use crate::stats::{LinkStats, LinkStatsSnapshot};
use crate::target::Target;
use crate::transport::{
    self, InboundFrame, Outbound, RelayTransport, Transport, TransportContext, TransportKind,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// State shared between the bus handle, the dispatcher task and handler contexts.
struct BusCore {
    identity: NodeIdentity,
    host: Arc<dyn LinkHost>,
    router: Router,
    correlator: Correlator,
    stats: Arc<LinkStats>,
    transport: Arc<dyn Transport>,
}

impl BusCore {
    /// Encodes and hands a resolved message to the transport in the background.
    fn publish(&self, target: Target, delivery: Delivery, plugin: &str, action: &str, payload: Bytes) {
        let envelope = Envelope::new(target, self.identity.name(), plugin, action, payload);
        let outbound = Outbound {
            target,
            delivery,
            group: self.identity.group().to_string(),
            envelope: envelope.encode(),
        };

        let transport = Arc::clone(&self.transport);
        let stats = Arc::clone(&self.stats);
        let plugin = plugin.to_string();
        let action = action.to_string();
        self.host.schedule(Box::pin(async move {
            match transport.send(outbound).await {
                Ok(()) => stats.record_sent(),
                Err(e) => {
                    warn!(
                        transport = %transport.kind(),
                        %target,
                        plugin = %plugin,
                        action = %action,
                        error = %e,
                        "Dropping outbound message"
                    );
                    stats.record_send_failure();
                }
            }
        }));
    }

    fn send(
        &self,
        plugin: &str,
        action: &str,
        target: Target,
        hint: Option<&str>,
        request_id: u64,
        body: Bytes,
    ) -> Result<(), LinkError> {
        let delivery = resolver::resolve(target, hint, &self.identity)?;
        let payload = CorrelatedPayload::new(request_id, body).encode();
        self.publish(target, delivery, plugin, action, payload);
        Ok(())
    }

    /// Routes one inbound frame.
    ///
    /// Responses and stream lines are settled right here, in arrival order.
    /// Handlers run on the blocking pool, so a slow handler never holds up
    /// other deliveries.
    fn handle_inbound(self: &Arc<Self>, frame: InboundFrame) {
        match self.router.route(&frame, self.host.as_ref()) {
            RouteDecision::Dispatch {
                handler,
                payload,
                receiver,
            } => {
                let core = Arc::clone(self);
                tokio::task::spawn_blocking(move || {
                    core.run_handler(&handler, &frame, &payload, receiver.as_ref())
                });
            }
            RouteDecision::Complete { id, value } => {
                if self.correlator.complete(id, value) {
                    self.stats.record_completion();
                }
            }
            RouteDecision::Stream { id, message } => {
                if self.correlator.deliver(id, &message) > 0 {
                    self.stats.record_stream_delivery();
                }
            }
            RouteDecision::Drop(reason) => {
                debug!(
                    %reason,
                    target = %frame.envelope.target(),
                    origin = %frame.envelope.origin_node(),
                    plugin = %frame.envelope.origin_plugin(),
                    action = %frame.envelope.action(),
                    group = %frame.group,
                    hint = %frame.target_hint,
                    "Dropping inbound message"
                );
                self.stats.record_dropped();
            }
        }
    }

    fn run_handler(
        &self,
        handler: &LinkHandler,
        frame: &InboundFrame,
        payload: &CorrelatedPayload,
        receiver: Option<&ReceiverHandle>,
    ) {
        let context = MessageContext {
            core: self,
            envelope: &frame.envelope,
            payload,
            receiver,
            via: frame.via.as_deref(),
        };
        match handler(&context) {
            Ok(()) => self.stats.record_dispatched(),
            Err(e) => {
                warn!(
                    plugin = %frame.envelope.origin_plugin(),
                    action = %frame.envelope.action(),
                    origin = %frame.envelope.origin_node(),
                    error = %e,
                    "Link handler failed"
                );
                self.stats.record_handler_failure();
            }
        }
    }
}

/// What a handler sees of the message it is handling.
pub struct MessageContext<'a> {
    core: &'a BusCore,
    envelope: &'a Envelope,
    payload: &'a CorrelatedPayload,
    receiver: Option<&'a ReceiverHandle>,
    via: Option<&'a str>,
}

impl fmt::Debug for MessageContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageContext")
            .field("envelope", self.envelope)
            .field("request_id", &self.payload.request_id)
            .field("receiver", &self.receiver)
            .field("via", &self.via)
            .finish()
    }
}

impl<'a> MessageContext<'a> {
    pub fn envelope(&self) -> &'a Envelope {
        self.envelope
    }

    pub fn origin_node(&self) -> &'a str {
        self.envelope.origin_node()
    }

    pub fn origin_plugin(&self) -> &'a str {
        self.envelope.origin_plugin()
    }

    pub fn action(&self) -> &'a str {
        self.envelope.action()
    }

    /// The handler-defined body, without the correlation prefix.
    pub fn body(&self) -> &'a [u8] {
        &self.payload.body
    }

    pub fn body_str(&self) -> Result<&'a str, LinkError> {
        std::str::from_utf8(&self.payload.body)
            .map_err(|_| LinkError::HandlerExecution("message body is not valid UTF-8".to_string()))
    }

    pub fn request_id(&self) -> u64 {
        self.payload.request_id
    }

    /// Whether the sender is waiting for [`respond`](Self::respond).
    pub fn expects_reply(&self) -> bool {
        self.payload.request_id != NO_REPLY
    }

    /// The local receiver the message was addressed to, if any.
    pub fn receiver(&self) -> Option<&'a ReceiverHandle> {
        self.receiver
    }

    /// The carrier connection the message arrived on, for the relay transport.
    pub fn via(&self) -> Option<&'a str> {
        self.via
    }

    /// The bus identity of the node handling the message.
    pub fn local_identity(&self) -> &'a NodeIdentity {
        &self.core.identity
    }

    /// Counters of the handling bus.
    pub fn stats(&self) -> LinkStatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Sends the terminal response for this request.
    ///
    /// A no-op for fire-and-forget messages.
    pub fn respond(&self, value: bool) -> Result<(), LinkError> {
        self.reply(RESPONSE_ACTION, CorrelatedPayload::response(self.request_id(), value))
    }

    /// Sends an interim text line for this request.
    pub fn stream(&self, line: &str) -> Result<(), LinkError> {
        self.reply(STREAM_ACTION, CorrelatedPayload::stream_line(self.request_id(), line))
    }

    /// Sends a new message of this node's own through the handling bus.
    pub fn send(
        &self,
        plugin: &str,
        action: &str,
        target: Target,
        hint: Option<&str>,
        body: impl Into<Bytes>,
    ) -> Result<(), LinkError> {
        self.core.send(plugin, action, target, hint, NO_REPLY, body.into())
    }

    fn reply(&self, action: &str, reply: CorrelatedPayload) -> Result<(), LinkError> {
        if !self.expects_reply() {
            debug!(action, origin = %self.origin_node(), "Message expects no reply");
            return Ok(());
        }
        let hint = self.via.unwrap_or_else(|| self.envelope.origin_node());
        let delivery = resolver::resolve(Target::Current, Some(hint), &self.core.identity)?;
        self.core.publish(
            Target::Current,
            delivery,
            self.envelope.origin_plugin(),
            action,
            reply.encode(),
        );
        Ok(())
    }
}

/// Per-process entry point of the link.
pub struct LinkBus {
    core: Arc<BusCore>,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for LinkBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkBus")
            .field("identity", &self.core.identity)
            .field("transport", &self.core.transport.kind())
            .field("router", &self.core.router)
            .field("correlator", &self.core.correlator)
            .finish()
    }
}

/// Channel and context created before the transport exists.
struct Wiring {
    context: TransportContext,
    inbound: mpsc::Receiver<InboundFrame>,
    stats: Arc<LinkStats>,
}

impl LinkBus {
    /// Creates a bus around the transport built by `connector`.
    ///
    /// # Arguments
    ///
    /// * `host` - The embedding process
    /// * `correlation` - Request lifetimes and dispatcher queue size
    /// * `connector` - Builds the transport from the context it must report to
    ///
    /// # Returns
    ///
    /// A running bus, or the error raised by `connector` or by invalid settings.
    pub async fn connect<F, Fut>(
        host: Arc<dyn LinkHost>,
        correlation: &CorrelationSettings,
        connector: F,
    ) -> Result<Self, LinkError>
    where
        F: FnOnce(TransportContext) -> Fut,
        Fut: Future<Output = Result<Arc<dyn Transport>, LinkError>>,
    {
        Self::connect_with_clock(host, correlation, Arc::new(SystemClock), connector).await
    }

    /// Like [`connect`](Self::connect), with an explicit time source for expiry.
    pub async fn connect_with_clock<F, Fut>(
        host: Arc<dyn LinkHost>,
        correlation: &CorrelationSettings,
        clock: Arc<dyn Clock>,
        connector: F,
    ) -> Result<Self, LinkError>
    where
        F: FnOnce(TransportContext) -> Fut,
        Fut: Future<Output = Result<Arc<dyn Transport>, LinkError>>,
    {
        correlation.validate()?;
        let wiring = Self::wire(&host, correlation);
        let transport = connector(wiring.context).await?;
        Ok(Self::assemble(host, correlation, clock, wiring.stats, transport, wiring.inbound))
    }

    /// Creates a bus over the broker transport named in `settings`.
    pub async fn from_settings(host: Arc<dyn LinkHost>, settings: &LinkSettings) -> Result<Self, LinkError> {
        settings.validate()?;
        if let TransportSettings::Relay(_) = settings.transport {
            return Err(LinkError::Configuration(
                "relay transport needs host carriers; create it with LinkBus::relay".to_string(),
            ));
        }
        let transport_settings = settings.transport.clone();
        Self::connect(host, &settings.correlation, |context| async move {
            transport::connect(&transport_settings, context).await
        })
        .await
    }

    /// Creates a bus over the in-band relay transport.
    ///
    /// The returned [`RelayTransport`] is how the host attaches and detaches
    /// carrier connections and feeds their inbound data.
    pub fn relay(
        host: Arc<dyn LinkHost>,
        correlation: &CorrelationSettings,
        settings: &RelaySettings,
    ) -> Result<(Self, Arc<RelayTransport>), LinkError> {
        correlation.validate()?;
        TransportSettings::Relay(settings.clone()).validate()?;
        let wiring = Self::wire(&host, correlation);
        let relay = Arc::new(RelayTransport::new(wiring.context, settings));
        let bus = Self::assemble(
            host,
            correlation,
            Arc::new(SystemClock),
            wiring.stats,
            Arc::clone(&relay) as Arc<dyn Transport>,
            wiring.inbound,
        );
        Ok((bus, relay))
    }

    fn wire(host: &Arc<dyn LinkHost>, correlation: &CorrelationSettings) -> Wiring {
        let (tx, inbound) = mpsc::channel(correlation.inbound_queue_capacity);
        let stats = Arc::new(LinkStats::new());
        let context = TransportContext::new(
            host.identity().clone(),
            tx,
            Arc::clone(&stats),
            Arc::clone(host),
        );
        Wiring {
            context,
            inbound,
            stats,
        }
    }

    fn assemble(
        host: Arc<dyn LinkHost>,
        correlation: &CorrelationSettings,
        clock: Arc<dyn Clock>,
        stats: Arc<LinkStats>,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<InboundFrame>,
    ) -> Self {
        let identity = host.identity().clone();
        let core = Arc::new(BusCore {
            router: Router::new(identity.clone()),
            correlator: Correlator::new(clock, correlation.completion_ttl(), correlation.stream_ttl()),
            identity,
            host,
            stats,
            transport,
        });

        let shutdown = CancellationToken::new();
        let dispatcher = tokio::spawn(run_dispatcher(Arc::clone(&core), inbound, shutdown.clone()));

        info!(
            "🔗 Link bus up for {} node {} (group '{}') over {}",
            core.identity.side(),
            core.identity.name(),
            core.identity.group(),
            core.transport.kind()
        );

        Self {
            core,
            shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.core.identity
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.core.transport.kind()
    }

    pub fn stats(&self) -> LinkStatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Pending completions, including ones not yet swept after expiry.
    pub fn pending_requests(&self) -> usize {
        self.core.correlator.pending_completions()
    }

    /// Registers the handler for `(plugin, action)`, replacing any previous one.
    pub fn register_handler<F>(&self, plugin: &str, action: &str, handler: F)
    where
        F: Fn(&MessageContext<'_>) -> Result<(), LinkError> + Send + Sync + 'static,
    {
        self.core.router.registry().register(plugin, action, Arc::new(handler));
    }

    pub fn unregister_handler(&self, plugin: &str, action: &str) -> bool {
        self.core.router.registry().unregister(plugin, action)
    }

    /// Removes every handler registered for `plugin`.
    pub fn unregister_plugin(&self, plugin: &str) -> usize {
        self.core.router.registry().unregister_plugin(plugin)
    }

    /// Sends a fire-and-forget message.
    ///
    /// # Errors
    ///
    /// Only errors detectable at the call site are returned: directionality
    /// violations and missing hints. Transport failures are logged and counted.
    pub fn send(
        &self,
        plugin: &str,
        action: &str,
        target: Target,
        hint: Option<&str>,
        body: impl Into<Bytes>,
    ) -> Result<(), LinkError> {
        self.core.send(plugin, action, target, hint, NO_REPLY, body.into())
    }

    /// Sends a message that expects a reply and returns its handle.
    ///
    /// The target is resolved before a request id is allocated, so a rejected
    /// send leaves no pending entry behind.
    pub fn send_request(
        &self,
        plugin: &str,
        action: &str,
        target: Target,
        hint: Option<&str>,
        body: impl Into<Bytes>,
    ) -> Result<RequestHandle, LinkError> {
        let delivery = resolver::resolve(target, hint, &self.core.identity)?;
        let request = self.core.correlator.begin_request();
        let payload = CorrelatedPayload::new(request.id(), body.into()).encode();
        self.core.publish(target, delivery, plugin, action, payload);
        Ok(request)
    }

    /// Attaches a callback receiving interim stream lines for `request`.
    pub fn on_stream<F>(&self, request: &RequestHandle, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.core.correlator.register_stream(request.id(), Arc::new(callback));
    }

    /// Waits for the terminal response of `request`.
    ///
    /// Resolves to [`LinkError::RequestExpired`] when the request outlives its
    /// time-to-live.
    pub async fn await_completion(&self, request: RequestHandle) -> Result<bool, LinkError> {
        let result = request.wait().await;
        if let Err(LinkError::RequestExpired { id }) = &result {
            debug!(request_id = id, "Request expired without a response");
            self.core.stats.record_expired();
        }
        result
    }

    /// Routes a frame as if a transport had just received it.
    pub fn handle_inbound(&self, frame: InboundFrame) {
        self.core.handle_inbound(frame);
    }

    /// Stops the dispatcher and closes the transport.
    ///
    /// Pending requests are left to expire on their own.
    pub async fn close(&self) -> Result<(), LinkError> {
        self.shutdown.cancel();
        let result = self.core.transport.close().await;

        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                warn!(error = %e, "Link dispatcher ended abnormally");
            }
        }

        info!("🔌 Link bus for {} closed", self.core.identity.name());
        result
    }
}

impl Drop for LinkBus {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_dispatcher(
    core: Arc<BusCore>,
    mut inbound: mpsc::Receiver<InboundFrame>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = inbound.recv() => match frame {
                Some(frame) => core.handle_inbound(frame),
                None => break,
            },
        }
    }
    debug!(node = %core.identity.name(), "Link dispatcher stopped");
}
