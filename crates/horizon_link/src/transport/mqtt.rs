//! MQTT broker transport.
//!
//! Every node publishes [`RoutingFrame`](crate::RoutingFrame)s on one shared
//! topic and subscribes to the same topic; filtering happens in the router. A
//! supervisor task owns the client, drives the event loop and reconnects with
//! exponential backoff.

use super::{Outbound, Transport, TransportContext, TransportKind};
use crate::config::MqttSettings;
use crate::error::LinkError;
use crate::retry::ReconnectSchedule;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Largest frame accepted or produced, in bytes.
const MAX_PACKET_SIZE: usize = 4 * 1024 * 1024;

/// Requests buffered between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 256;

/// MQTT client ids are limited to 23 characters by conservative brokers.
fn normalize_client_id<S: AsRef<str>>(input: S) -> String {
    const MAX_LEN: usize = 23;
    input
        .as_ref()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .take(MAX_LEN)
        .collect()
}

fn client_id(settings: &MqttSettings, node: &str) -> String {
    match settings.client_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => normalize_client_id(id),
        _ => {
            let short = Uuid::new_v4().simple().to_string();
            // Node name is cut so the unique suffix always fits.
            let prefix: String = node.chars().take(14).collect();
            normalize_client_id(format!("{}-{}", prefix, &short[..8]))
        }
    }
}

fn build_client(settings: &MqttSettings, client_id: &str) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(client_id, settings.host.clone(), settings.port);
    if let Some(username) = &settings.username {
        options.set_credentials(username.clone(), settings.password.clone().unwrap_or_default());
    }
    options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs.max(5)));
    options.set_clean_session(settings.clean_session);
    options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
    AsyncClient::new(options, REQUEST_CAPACITY)
}

/// Broker transport over MQTT.
pub struct MqttTransport {
    topic: String,
    client: Arc<ArcSwapOption<AsyncClient>>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Starts the connection supervisor and returns immediately.
    ///
    /// Sends fail with [`LinkError::TransportFailure`] until the first
    /// connection is acknowledged. Must be called inside a Tokio runtime.
    pub fn start(settings: MqttSettings, context: TransportContext) -> Result<Self, LinkError> {
        settings.validate()?;
        let client = Arc::new(ArcSwapOption::from(None));
        let cancel = CancellationToken::new();
        let topic = settings.topic.clone();

        let supervisor = Supervisor {
            client_id: client_id(&settings, context.identity().name()),
            settings,
            context,
            client: Arc::clone(&client),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(supervisor.run());

        Ok(Self {
            topic,
            client,
            cancel,
            supervisor: Mutex::new(Some(handle)),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.client.load().is_some()
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mqtt
    }

    async fn send(&self, outbound: Outbound) -> Result<(), LinkError> {
        let client = self
            .client
            .load_full()
            .ok_or_else(|| LinkError::TransportFailure("mqtt broker not connected".to_string()))?;
        client
            .publish(
                self.topic.as_str(),
                QoS::AtLeastOnce,
                false,
                outbound.to_frame().encode().to_vec(),
            )
            .await
            .map_err(|e| LinkError::TransportFailure(format!("mqtt publish failed: {}", e)))
    }

    async fn close(&self) -> Result<(), LinkError> {
        self.cancel.cancel();
        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                warn!(error = %e, "MQTT supervisor ended abnormally");
            }
        }
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Supervisor {
    settings: MqttSettings,
    client_id: String,
    context: TransportContext,
    client: Arc<ArcSwapOption<AsyncClient>>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self) {
        let mut schedule = ReconnectSchedule::new(self.settings.retry);

        while !self.cancel.is_cancelled() {
            let Some(attempt) = schedule.begin_attempt() else {
                warn!(
                    max_attempts = ?self.settings.retry.max_attempts,
                    "MQTT supervisor exhausted retry attempts"
                );
                break;
            };
            info!(
                attempt,
                host = %self.settings.host,
                port = self.settings.port,
                client_id = %self.client_id,
                "🔌 Connecting to MQTT broker"
            );

            let (client, event_loop) = build_client(&self.settings, &self.client_id);
            if self.drive(client, event_loop).await {
                schedule.connected();
            }
            if self.cancel.is_cancelled() {
                break;
            }

            let Some(delay) = schedule.next_delay() else {
                warn!(attempts = schedule.attempts(), "MQTT reconnect schedule exhausted");
                break;
            };
            info!(attempt, delay_ms = delay.as_millis() as u64, "MQTT reconnect backoff");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.client.store(None);
        info!("MQTT supervisor stopped");
    }

    /// Polls one connection until it fails or the transport is closed.
    ///
    /// Returns whether the broker ever acknowledged the connection.
    async fn drive(&self, client: AsyncClient, mut event_loop: EventLoop) -> bool {
        let mut seen_active = false;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.client.store(None);
                    let _ = client.try_disconnect();
                    break;
                }
                polled = event_loop.poll() => match polled {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        seen_active = true;
                        info!(topic = %self.settings.topic, "✅ MQTT connection established");
                        // The broker may drop subscriptions on reconnect, so always resubscribe.
                        if let Err(e) = client.subscribe(self.settings.topic.as_str(), QoS::AtLeastOnce).await {
                            warn!(error = %e, "Failed to subscribe to link topic");
                        }
                        self.client.store(Some(Arc::new(client.clone())));
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if publish.topic != self.settings.topic {
                            continue;
                        }
                        if !self.context.accept_routed(&publish.payload).await {
                            debug!("Bus stopped listening, shutting down MQTT transport");
                            self.cancel.cancel();
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("MQTT broker sent disconnect");
                        self.client.store(None);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "MQTT connection lost");
                        self.client.store(None);
                        break;
                    }
                },
            }
        }
        seen_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::host::StandaloneHost;
    use crate::node::NodeIdentity;
    use crate::resolver::resolve;
    use crate::retry::RetryPolicy;
    use crate::stats::LinkStats;
    use crate::target::Target;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn context() -> TransportContext {
        let identity = NodeIdentity::proxy("edge-1", "alpha");
        let (tx, _rx) = mpsc::channel(4);
        let host = Arc::new(StandaloneHost::new(identity.clone()));
        TransportContext::new(identity, tx, Arc::new(LinkStats::new()), host)
    }

    #[test]
    fn client_ids_are_broker_safe() {
        assert_eq!(normalize_client_id("proxy:edge 1"), "proxy-edge-1");
        assert_eq!(normalize_client_id("x".repeat(40)).len(), 23);

        let generated = client_id(&MqttSettings::default(), "proxy:a-very-long-node-name");
        assert!(generated.len() <= 23);
        assert!(generated.starts_with("proxy-a-very-l"));

        let settings = MqttSettings {
            client_id: Some("fixed".to_string()),
            ..Default::default()
        };
        assert_eq!(client_id(&settings, "ignored"), "fixed");
    }

    #[tokio::test]
    async fn sends_fail_until_connected_and_close_stops_the_supervisor() {
        let settings = MqttSettings {
            port: 1,
            retry: RetryPolicy {
                initial_interval_ms: 10,
                ..RetryPolicy::with_max_attempts(2)
            },
            ..Default::default()
        };
        let ctx = context();
        let identity = ctx.identity().clone();
        let transport = MqttTransport::start(settings, ctx).unwrap();
        assert!(!transport.is_connected());

        let envelope = Envelope::new(Target::AllQueue, identity.name(), "chat", "say", Bytes::new());
        let result = transport
            .send(Outbound {
                target: Target::AllQueue,
                delivery: resolve(Target::AllQueue, None, &identity).unwrap(),
                group: identity.group().to_string(),
                envelope: envelope.encode(),
            })
            .await;
        assert!(matches!(result, Err(LinkError::TransportFailure(_))));

        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }

    #[test]
    fn invalid_settings_are_rejected_up_front() {
        let settings = MqttSettings {
            topic: "link/#".to_string(),
            ..Default::default()
        };
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let _guard = rt.enter();
        assert!(matches!(
            MqttTransport::start(settings, context()),
            Err(LinkError::Configuration(_))
        ));
    }
}
