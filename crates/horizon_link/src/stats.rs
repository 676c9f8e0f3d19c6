use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters for one bus.
#[derive(Debug, Default)]
pub struct LinkStats {
    messages_sent: AtomicU64,
    send_failures: AtomicU64,
    frames_received: AtomicU64,
    decode_failures: AtomicU64,
    messages_dispatched: AtomicU64,
    messages_dropped: AtomicU64,
    handler_failures: AtomicU64,
    completions: AtomicU64,
    stream_deliveries: AtomicU64,
    requests_expired: AtomicU64,
}

/// Point-in-time copy of [`LinkStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatsSnapshot {
    pub messages_sent: u64,
    pub send_failures: u64,
    pub frames_received: u64,
    pub decode_failures: u64,
    pub messages_dispatched: u64,
    pub messages_dropped: u64,
    pub handler_failures: u64,
    pub completions: u64,
    pub stream_deliveries: u64,
    pub requests_expired: u64,
}

impl LinkStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatched(&self) {
        self.messages_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self) {
        self.completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_delivery(&self) {
        self.stream_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired(&self) {
        self.requests_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LinkStatsSnapshot {
        LinkStatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            stream_deliveries: self.stream_deliveries.load(Ordering::Relaxed),
            requests_expired: self.requests_expired.load(Ordering::Relaxed),
        }
    }
}
