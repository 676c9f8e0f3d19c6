//! Pulsar broker transport.
//!
//! Same shape as the MQTT transport: one shared topic, one exclusive
//! subscription per node so every node receives every frame. The subscription
//! is named after the node and is non-durable, so the broker deletes it with
//! its consumer and keeps no backlog for nodes that went away. A supervisor
//! owns the client session and rebuilds it when the consumer or a send
//! receipt reports a broken connection.

use super::{Outbound, Transport, TransportContext, TransportKind};
use crate::config::PulsarSettings;
use crate::error::LinkError;
use crate::retry::ReconnectSchedule;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex as SyncMutex;
use pulsar::{
    consumer::{Consumer, ConsumerOptions},
    producer,
    producer::MultiTopicProducer,
    Authentication, ConnectionRetryOptions, Pulsar, SerializeMessage, SubType, TokioExecutor,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type SharedProducer = Arc<ArcSwapOption<Mutex<MultiTopicProducer<TokioExecutor>>>>;

/// One encoded routing frame on its way to the broker.
struct LinkMessage(Vec<u8>);

impl SerializeMessage for LinkMessage {
    fn serialize_message(input: Self) -> Result<producer::Message, pulsar::Error> {
        Ok(producer::Message {
            payload: input.0,
            ..Default::default()
        })
    }
}

/// Subscription of one node on the link topic. Stable across restarts.
fn subscription_name(prefix: &str, node: &str) -> String {
    let node: String = node
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("{prefix}-{node}")
}

/// Broker transport over Apache Pulsar.
pub struct PulsarTransport {
    topic: String,
    producer: SharedProducer,
    reconnect: mpsc::Sender<String>,
    cancel: CancellationToken,
    supervisor: SyncMutex<Option<JoinHandle<()>>>,
}

impl PulsarTransport {
    /// Starts the session supervisor and returns immediately.
    ///
    /// Sends fail with [`LinkError::TransportFailure`] until a producer is
    /// available. Must be called inside a Tokio runtime.
    pub fn start(settings: PulsarSettings, context: TransportContext) -> Result<Self, LinkError> {
        settings.validate()?;
        let producer: SharedProducer = Arc::new(ArcSwapOption::from(None));
        let cancel = CancellationToken::new();
        let (reconnect_tx, reconnect_rx) = mpsc::channel(8);
        let topic = settings.topic.clone();

        let subscription = subscription_name(&settings.subscription_prefix, context.identity().name());

        let supervisor = Supervisor {
            settings,
            subscription,
            context,
            producer: Arc::clone(&producer),
            reconnect_rx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(supervisor.run());

        Ok(Self {
            topic,
            producer,
            reconnect: reconnect_tx,
            cancel,
            supervisor: SyncMutex::new(Some(handle)),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.producer.load().is_some()
    }
}

#[async_trait]
impl Transport for PulsarTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Pulsar
    }

    async fn send(&self, outbound: Outbound) -> Result<(), LinkError> {
        let producer = self
            .producer
            .load_full()
            .ok_or_else(|| LinkError::TransportFailure("pulsar broker not connected".to_string()))?;
        let message = LinkMessage(outbound.to_frame().encode().to_vec());

        let receipt = {
            let mut locked = producer.lock().await;
            locked.send_non_blocking(self.topic.as_str(), message).await
        };
        let result = match receipt {
            Ok(receipt) => receipt.await.map(|_| ()),
            Err(e) => Err(e),
        };
        result.map_err(|e| {
            let _ = self.reconnect.try_send(e.to_string());
            LinkError::TransportFailure(format!("pulsar send failed: {}", e))
        })
    }

    async fn close(&self) -> Result<(), LinkError> {
        self.cancel.cancel();
        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                warn!(error = %e, "Pulsar supervisor ended abnormally");
            }
        }
        Ok(())
    }
}

impl Drop for PulsarTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Supervisor {
    settings: PulsarSettings,
    subscription: String,
    context: TransportContext,
    producer: SharedProducer,
    reconnect_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(mut self) {
        let mut schedule = ReconnectSchedule::new(self.settings.retry);

        while !self.cancel.is_cancelled() {
            let Some(attempt) = schedule.begin_attempt() else {
                warn!(
                    max_attempts = ?self.settings.retry.max_attempts,
                    "Pulsar supervisor exhausted retry attempts"
                );
                break;
            };
            info!(attempt, url = %self.settings.service_url, "🔌 Connecting to Pulsar broker");

            let session = tokio::select! {
                _ = self.cancel.cancelled() => break,
                session = self.open_session() => session,
            };

            match session {
                Ok((client, consumer)) => {
                    schedule.connected();
                    let producer = client.producer().build_multi_topic();
                    self.producer.store(Some(Arc::new(Mutex::new(producer))));
                    info!(
                        topic = %self.settings.topic,
                        subscription = %self.subscription,
                        "✅ Pulsar session established"
                    );

                    let reason = self.consume(consumer).await;
                    self.producer.store(None);
                    match reason {
                        Some(reason) => warn!(reason = %reason, "Pulsar session lost"),
                        None => break,
                    }
                }
                Err(e) => warn!(attempt, error = %e, "Failed to open Pulsar session"),
            }

            let Some(delay) = schedule.next_delay() else {
                warn!(attempts = schedule.attempts(), "Pulsar reconnect schedule exhausted");
                break;
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.producer.store(None);
        info!("Pulsar supervisor stopped");
    }

    async fn open_session(
        &self,
    ) -> Result<(Pulsar<TokioExecutor>, Consumer<Vec<u8>, TokioExecutor>), pulsar::Error> {
        let mut builder = Pulsar::builder(self.settings.service_url.as_str(), TokioExecutor)
            .with_connection_retry_options(ConnectionRetryOptions::default());
        if let Some(token) = &self.settings.auth_token {
            builder = builder.with_auth(Authentication {
                name: "token".to_string(),
                data: token.clone().into_bytes(),
            });
        }
        let client: Pulsar<TokioExecutor> = builder.build().await?;

        let consumer = client
            .consumer()
            .with_topic(self.settings.topic.as_str())
            .with_subscription(self.subscription.as_str())
            .with_subscription_type(SubType::Exclusive)
            .with_options(ConsumerOptions::default().durable(false))
            .build::<Vec<u8>>()
            .await?;
        Ok((client, consumer))
    }

    /// Feeds received frames to the bus until the session breaks.
    ///
    /// Returns the failure reason, or `None` when the transport is shutting down.
    async fn consume(&mut self, mut consumer: Consumer<Vec<u8>, TokioExecutor>) -> Option<String> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                // A closed channel means the transport handle is gone.
                reason = self.reconnect_rx.recv() => return reason,
                next = consumer.next() => {
                    let message = match next {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return Some(format!("consumer error: {}", e)),
                        None => return Some("consumer stream ended".to_string()),
                    };
                    if let Err(e) = consumer.ack(&message).await {
                        debug!(error = %e, "Pulsar ack failed");
                    }
                    if !self.context.accept_routed(&message.payload.data).await {
                        debug!("Bus stopped listening, shutting down Pulsar transport");
                        self.cancel.cancel();
                        return None;
                    }
                }
            }
        }
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

    fn context() -> TransportContext {
        let identity = NodeIdentity::server("survival-1", "alpha");
        let (tx, _rx) = mpsc::channel(4);
        let host = Arc::new(StandaloneHost::new(identity.clone()));
        TransportContext::new(identity, tx, Arc::new(LinkStats::new()), host)
    }

    #[tokio::test]
    async fn sends_fail_until_a_producer_exists() {
        let settings = PulsarSettings {
            service_url: "pulsar://127.0.0.1:1".to_string(),
            retry: RetryPolicy::with_max_attempts(1),
            ..Default::default()
        };
        let ctx = context();
        let identity = ctx.identity().clone();
        let transport = PulsarTransport::start(settings, ctx).unwrap();
        assert!(!transport.is_connected());

        let envelope = Envelope::new(Target::AllQueue, identity.name(), "core", "kick", Bytes::new());
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
    }

    #[test]
    fn subscription_is_stable_per_node() {
        assert_eq!(
            subscription_name("horizon-link", "proxy:edge"),
            "horizon-link-proxy-edge"
        );
        assert_eq!(
            subscription_name("horizon-link", "survival-1"),
            subscription_name("horizon-link", "survival-1")
        );
    }

    #[test]
    fn rejects_non_pulsar_urls() {
        let settings = PulsarSettings {
            service_url: "http://127.0.0.1:8080".to_string(),
            ..Default::default()
        };
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let _guard = rt.enter();
        assert!(matches!(
            PulsarTransport::start(settings, context()),
            Err(LinkError::Configuration(_))
        ));
    }
}
