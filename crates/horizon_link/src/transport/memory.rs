//! In-process broker.
//!
//! [`MemoryBroker`] behaves like a single pub/sub topic: every connected
//! [`MemoryTransport`] sees every published [`RoutingFrame`](crate::RoutingFrame),
//! including its own. Useful for embedding several nodes in one process and for
//! exercising the broker code path without a network.

use super::{Outbound, Transport, TransportContext, TransportKind};
use crate::error::LinkError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct MemoryBroker {
    topic: broadcast::Sender<Bytes>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MemoryBroker {
    /// Creates a broker buffering up to `capacity` frames per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (topic, _) = broadcast::channel(capacity.max(1));
        Self { topic }
    }

    /// Subscribes a node to the topic.
    ///
    /// The subscription exists as soon as this returns, so no frame published
    /// afterwards is missed.
    pub fn connect(&self, context: TransportContext) -> Arc<MemoryTransport> {
        let mut subscription = self.topic.subscribe();
        let cancel = CancellationToken::new();
        let reader_cancel = cancel.clone();
        let node = context.identity().name().to_string();

        let reader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    frame = subscription.recv() => match frame {
                        Ok(frame) => {
                            if !context.accept_routed(&frame).await {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(node = %node, skipped, "Memory subscriber lagged, frames lost");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!(node = %node, "Memory subscriber stopped");
        });

        Arc::new(MemoryTransport {
            topic: self.topic.clone(),
            cancel,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.topic.receiver_count()
    }
}

/// One node's connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryTransport {
    topic: broadcast::Sender<Bytes>,
    cancel: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    async fn send(&self, outbound: Outbound) -> Result<(), LinkError> {
        if self.cancel.is_cancelled() {
            return Err(LinkError::TransportFailure("memory transport is closed".to_string()));
        }
        self.topic
            .send(outbound.to_frame().encode())
            .map(|_| ())
            .map_err(|_| LinkError::TransportFailure("memory broker has no subscribers".to_string()))
    }

    async fn close(&self) -> Result<(), LinkError> {
        self.cancel.cancel();
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                warn!(error = %e, "Memory subscriber ended abnormally");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::host::StandaloneHost;
    use crate::node::NodeIdentity;
    use crate::resolver::resolve;
    use crate::stats::LinkStats;
    use crate::target::Target;
    use crate::transport::InboundFrame;
    use tokio::sync::mpsc;

    fn node(
        broker: &MemoryBroker,
        name: &str,
    ) -> (Arc<MemoryTransport>, mpsc::Receiver<InboundFrame>, NodeIdentity) {
        let identity = NodeIdentity::server(name, "alpha");
        let (tx, rx) = mpsc::channel(8);
        let host = Arc::new(StandaloneHost::new(identity.clone()));
        let context = TransportContext::new(identity.clone(), tx, Arc::new(LinkStats::new()), host);
        (broker.connect(context), rx, identity)
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_frame() {
        let broker = MemoryBroker::default();
        let (a, mut a_rx, a_id) = node(&broker, "survival-1");
        let (_b, mut b_rx, _) = node(&broker, "survival-2");
        assert_eq!(broker.subscriber_count(), 2);

        let envelope = Envelope::new(Target::AllQueue, a_id.name(), "pluginX", "ping", Bytes::new());
        a.send(Outbound {
            target: Target::AllQueue,
            delivery: resolve(Target::AllQueue, None, &a_id).unwrap(),
            group: a_id.group().to_string(),
            envelope: envelope.encode(),
        })
        .await
        .unwrap();

        for rx in [&mut a_rx, &mut b_rx] {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.envelope, envelope);
            assert_eq!(frame.group, "alpha");
        }
    }

    #[tokio::test]
    async fn closed_transport_leaves_the_topic() {
        let broker = MemoryBroker::default();
        let (a, _rx, a_id) = node(&broker, "survival-1");
        a.close().await.unwrap();
        assert_eq!(broker.subscriber_count(), 0);

        let result = a
            .send(Outbound {
                target: Target::AllQueue,
                delivery: resolve(Target::AllQueue, None, &a_id).unwrap(),
                group: String::new(),
                envelope: Bytes::new(),
            })
            .await;
        assert!(matches!(result, Err(LinkError::TransportFailure(_))));
    }
}
