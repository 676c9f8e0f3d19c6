//! Built-in `horizon_link` plugin answering link health checks.

use horizon_link::{LinkBus, LinkError, MessageContext, Target};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

pub const PLUGIN: &str = "horizon_link";
pub const PING: &str = "ping";
pub const STATUS: &str = "status";

/// Registers the diagnostic handlers on `bus`.
pub fn register(bus: &LinkBus) {
    bus.register_handler(PLUGIN, PING, handle_ping);
    bus.register_handler(PLUGIN, STATUS, handle_status);
}

fn handle_ping(ctx: &MessageContext<'_>) -> Result<(), LinkError> {
    info!("🏓 Ping from {}", ctx.origin_node());
    ctx.respond(true)
}

/// Streams the local counters as one JSON line, then confirms.
fn handle_status(ctx: &MessageContext<'_>) -> Result<(), LinkError> {
    let snapshot = serde_json::to_string(&ctx.stats())
        .map_err(|e| LinkError::HandlerExecution(format!("cannot encode stats: {e}")))?;
    ctx.stream(&format!("{} {}", ctx.local_identity().name(), snapshot))?;
    ctx.respond(true)
}

/// Sends one ping and logs how it went.
///
/// Waits at most `wait` for the answer; expiry is logged, not returned.
pub async fn ping(
    bus: &LinkBus,
    target: Target,
    hint: Option<&str>,
    wait: Duration,
) -> Result<(), LinkError> {
    let request = bus.send_request(PLUGIN, PING, target, hint, Vec::<u8>::new())?;
    let id = request.id();
    info!(request_id = id, %target, hint = hint.unwrap_or(""), "🏓 Ping sent");

    match timeout(wait, bus.await_completion(request)).await {
        Ok(Ok(answer)) => info!(request_id = id, answer, "🏓 Ping answered"),
        Ok(Err(e)) => warn!(request_id = id, error = %e, "Ping got no answer"),
        Err(_) => warn!(request_id = id, "Ping still unanswered, giving up waiting"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use horizon_link::{
        CorrelationSettings, MemoryBroker, NodeIdentity, StandaloneHost, Transport,
    };
    use parking_lot::Mutex;
    use std::sync::Arc;

    async fn node(broker: &MemoryBroker, identity: NodeIdentity) -> LinkBus {
        let host = Arc::new(StandaloneHost::new(identity));
        let broker = broker.clone();
        let bus = LinkBus::connect(host, &CorrelationSettings::default(), move |context| async move {
            Ok(broker.connect(context) as Arc<dyn Transport>)
        })
        .await
        .unwrap();
        register(&bus);
        bus
    }

    #[tokio::test]
    async fn status_streams_counters_then_confirms() {
        let broker = MemoryBroker::default();
        let proxy = node(&broker, NodeIdentity::proxy("edge", "")).await;
        let _server = node(&broker, NodeIdentity::server("lobby", "")).await;

        let request = proxy
            .send_request(PLUGIN, STATUS, Target::Server, Some("lobby"), Vec::<u8>::new())
            .unwrap();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        proxy.on_stream(&request, move |line| sink.lock().push(line.to_string()));

        let answered = timeout(Duration::from_secs(5), proxy.await_completion(request))
            .await
            .unwrap();
        assert_eq!(answered, Ok(true));

        timeout(Duration::from_secs(5), async {
            while lines.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let line = lines.lock()[0].clone();
        assert!(line.starts_with("lobby {"));
        assert!(line.contains("\"messages_dispatched\""));
    }

    #[tokio::test]
    async fn ping_never_fails_on_silence() {
        let broker = MemoryBroker::default();
        let lonely = node(&broker, NodeIdentity::server("lonely", "")).await;
        let result = ping(&lonely, Target::OthersQueue, None, Duration::from_millis(50)).await;
        assert!(result.is_ok());
    }
}
