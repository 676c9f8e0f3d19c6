//! Proxy and game servers linked through the in-band relay.

use bytes::Bytes;
use horizon_link::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// One direction of a proxy/server connection.
struct ChannelCarrier {
    name: String,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl Carrier for ChannelCarrier {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&self, frame: Bytes) -> bool {
        self.tx.send(frame).is_ok()
    }
}

/// Keeps every frame it is given.
#[derive(Default)]
struct RecordingCarrier {
    frames: Mutex<Vec<Bytes>>,
}

impl Carrier for RecordingCarrier {
    fn name(&self) -> &str {
        "proxy:edge"
    }

    fn deliver(&self, frame: Bytes) -> bool {
        self.frames.lock().push(frame);
        true
    }
}

fn relay_node(identity: NodeIdentity) -> (LinkBus, Arc<RelayTransport>) {
    let host = Arc::new(StandaloneHost::new(identity));
    LinkBus::relay(host, &CorrelationSettings::default(), &RelaySettings::default()).unwrap()
}

/// Wires `a` and `b` together. `a` names its end after `b` and vice versa.
fn link(a: (&str, &Arc<RelayTransport>), b: (&str, &Arc<RelayTransport>)) {
    let (to_b, mut b_inbox) = mpsc::unbounded_channel::<Bytes>();
    let (to_a, mut a_inbox) = mpsc::unbounded_channel::<Bytes>();

    a.1.attach_carrier(Arc::new(ChannelCarrier {
        name: b.0.to_string(),
        tx: to_b,
    }));
    b.1.attach_carrier(Arc::new(ChannelCarrier {
        name: a.0.to_string(),
        tx: to_a,
    }));

    let (a_name, b_relay) = (a.0.to_string(), Arc::clone(b.1));
    tokio::spawn(async move {
        while let Some(frame) = b_inbox.recv().await {
            b_relay.receive(&a_name, &frame);
        }
    });
    let (b_name, a_relay) = (b.0.to_string(), Arc::clone(a.1));
    tokio::spawn(async move {
        while let Some(frame) = a_inbox.recv().await {
            a_relay.receive(&b_name, &frame);
        }
    });
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn queued_broadcasts_flush_in_order_once() {
    let (server, relay) = relay_node(NodeIdentity::server("survival-1", ""));

    for body in ["first", "second", "third"] {
        server.send("chat", "say", Target::AllQueue, None, body).unwrap();
        let expected = relay.backlog_len() + 1;
        eventually(|| relay.backlog_len() == expected).await;
    }

    let carrier = Arc::new(RecordingCarrier::default());
    relay.attach_carrier(carrier.clone());
    assert_eq!(relay.backlog_len(), 0);

    let bodies: Vec<String> = carrier
        .frames
        .lock()
        .iter()
        .map(|frame| {
            let envelope = Envelope::decode(frame).unwrap();
            let payload = CorrelatedPayload::decode(envelope.payload()).unwrap();
            String::from_utf8(payload.body.to_vec()).unwrap()
        })
        .collect();
    assert_eq!(bodies, vec!["first", "second", "third"]);

    // A second carrier gets nothing from the already flushed backlog.
    let late = Arc::new(RecordingCarrier::default());
    relay.attach_carrier(late.clone());
    assert!(late.frames.lock().is_empty());
}

#[tokio::test]
async fn unqueued_broadcast_without_carrier_is_dropped() {
    let (server, relay) = relay_node(NodeIdentity::server("survival-1", ""));
    server.send("events", "announce", Target::AllWithPlayers, None, "").unwrap();
    eventually(|| server.stats().send_failures == 1).await;
    assert_eq!(relay.backlog_len(), 0);
}

#[tokio::test]
async fn proxy_request_is_answered_over_the_carrier() {
    let (proxy, proxy_relay) = relay_node(NodeIdentity::proxy("edge", ""));
    let (server, server_relay) = relay_node(NodeIdentity::server("survival-1", ""));
    link(("proxy:edge", &proxy_relay), ("survival-1", &server_relay));

    server.register_handler("pluginX", "ping", |ctx| {
        assert_eq!(ctx.via(), Some("proxy:edge"));
        ctx.stream(&format!("hello from {}", ctx.local_identity().name()))?;
        ctx.respond(true)
    });

    let request = proxy
        .send_request("pluginX", "ping", Target::AllQueue, None, "hello")
        .unwrap();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    proxy.on_stream(&request, move |line| sink.lock().push(line.to_string()));

    let answered = timeout(Duration::from_secs(5), proxy.await_completion(request))
        .await
        .unwrap();
    assert_eq!(answered, Ok(true));
    eventually(|| lines.lock().len() == 1).await;
    assert_eq!(lines.lock()[0], "hello from survival-1");
}

#[tokio::test]
async fn proxy_forwards_server_broadcasts_to_the_other_servers() {
    let (_proxy, proxy_relay) = relay_node(NodeIdentity::proxy("edge", ""));
    let (s1, s1_relay) = relay_node(NodeIdentity::server("survival-1", ""));
    let (s2, s2_relay) = relay_node(NodeIdentity::server("survival-2", ""));
    link(("proxy:edge", &proxy_relay), ("survival-1", &s1_relay));
    link(("proxy:edge", &proxy_relay), ("survival-2", &s2_relay));

    let own = Arc::new(AtomicUsize::new(0));
    let peer = Arc::new(AtomicUsize::new(0));
    let counter = own.clone();
    s1.register_handler("party", "invite", move |_ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let counter = peer.clone();
    s2.register_handler("party", "invite", move |_ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    s1.send("party", "invite", Target::OthersQueue, None, "").unwrap();

    eventually(|| peer.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(own.load(Ordering::SeqCst), 0);
    assert_eq!(s1.stats().frames_received, 0);
}

#[tokio::test]
async fn server_request_is_answered_by_a_peer_server_through_the_proxy() {
    let (proxy, proxy_relay) = relay_node(NodeIdentity::proxy("edge", ""));
    let (s1, s1_relay) = relay_node(NodeIdentity::server("survival-1", ""));
    let (s2, s2_relay) = relay_node(NodeIdentity::server("survival-2", ""));
    link(("proxy:edge", &proxy_relay), ("survival-1", &s1_relay));
    link(("proxy:edge", &proxy_relay), ("survival-2", &s2_relay));

    s2.register_handler("pluginX", "ping", |ctx| {
        ctx.stream("pong")?;
        ctx.respond(true)
    });

    let request = s1
        .send_request("pluginX", "ping", Target::OthersQueue, None, "")
        .unwrap();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    s1.on_stream(&request, move |line| sink.lock().push(line.to_string()));

    let answered = timeout(Duration::from_secs(5), s1.await_completion(request))
        .await
        .unwrap();
    assert_eq!(answered, Ok(true));
    eventually(|| lines.lock().len() == 1).await;
    assert_eq!(proxy_relay.reply_route_count(), 1);
    // The proxy relays the replies without routing them itself.
    let relayed = proxy.stats();
    assert_eq!(relayed.frames_received, 3);
    assert_eq!(relayed.completions, 0);
    assert_eq!(relayed.stream_deliveries, 0);
    assert_eq!(relayed.messages_dropped, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_handler_does_not_hold_up_other_requests() {
    let (proxy, proxy_relay) = relay_node(NodeIdentity::proxy("edge", ""));
    let (server, server_relay) = relay_node(NodeIdentity::server("survival-1", ""));
    link(("proxy:edge", &proxy_relay), ("survival-1", &server_relay));

    let released = Arc::new(AtomicUsize::new(0));
    let gate = released.clone();
    server.register_handler("world", "save", move |ctx| {
        while gate.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
        ctx.respond(true)
    });
    server.register_handler("world", "status", |ctx| ctx.respond(true));

    let save = proxy
        .send_request("world", "save", Target::Server, Some("survival-1"), "")
        .unwrap();
    let status = proxy
        .send_request("world", "status", Target::Server, Some("survival-1"), "")
        .unwrap();

    let answered = timeout(Duration::from_secs(5), proxy.await_completion(status))
        .await
        .unwrap();
    assert_eq!(answered, Ok(true));

    released.store(1, Ordering::SeqCst);
    let saved = timeout(Duration::from_secs(5), proxy.await_completion(save))
        .await
        .unwrap();
    assert_eq!(saved, Ok(true));
}

#[tokio::test]
async fn garbage_on_a_carrier_is_counted() {
    let (server, relay) = relay_node(NodeIdentity::server("survival-1", ""));
    assert!(relay.receive("proxy:edge", b"not an envelope"));
    assert_eq!(server.stats().decode_failures, 1);
}
