//! Request/response correlation.
//!
//! The [`Correlator`] turns fire-and-forget envelopes into awaitable,
//! multi-valued operations. It keeps two expiring tables keyed by request id:
//!
//! * **completions**: a single-value slot resolved at most once by a
//!   terminal response;
//! * **streams**: callbacks invoked for every interim text line.
//!
//! Both tables expire entries on an absolute time-to-live counted from
//! creation, independent of activity. Expiry is lazy: stale entries are swept
//! on every insert and checked on every access; there is no background task.
//! Evicting a completion drops its slot, which resolves the waiting
//! [`RequestHandle`] with [`LinkError::RequestExpired`].

use crate::error::LinkError;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

/// Lifetime of a boolean completion slot.
pub const DEFAULT_COMPLETION_TTL: Duration = Duration::from_secs(60);

/// Lifetime of a stream registration; console-style output can trail on for a while.
pub const DEFAULT_STREAM_TTL: Duration = Duration::from_secs(30 * 60);

/// Eviction policy shared by both tables.
pub fn is_expired(now: Instant, created_at: Instant, ttl: Duration) -> bool {
    now.saturating_duration_since(created_at) >= ttl
}

/// Time source for expiry decisions.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

/// Callback receiving interim stream lines.
pub type StreamCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct PendingCompletion {
    created_at: Instant,
    ttl: Duration,
    slot: oneshot::Sender<bool>,
}

struct PendingStream {
    created_at: Instant,
    ttl: Duration,
    callbacks: Vec<StreamCallback>,
}

/// Awaitable side of a pending request.
pub struct RequestHandle {
    id: u64,
    ttl: Duration,
    created_at: Instant,
    clock: Arc<dyn Clock>,
    receiver: oneshot::Receiver<bool>,
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("ttl", &self.ttl)
            .field("remaining", &self.remaining())
            .finish()
    }
}

impl RequestHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Time left before the request expires, measured on the correlator's clock.
    pub fn remaining(&self) -> Duration {
        let age = self.clock.now().saturating_duration_since(self.created_at);
        self.ttl.saturating_sub(age)
    }

    /// Waits for the terminal response.
    ///
    /// Resolves to [`LinkError::RequestExpired`] when no response arrives
    /// before the request's time-to-live runs out (counted from creation, not
    /// from this call), or when the pending entry was evicted or replaced.
    pub async fn wait(self) -> Result<bool, LinkError> {
        let id = self.id;
        let remaining = self.remaining();
        match tokio::time::timeout(remaining, self.receiver).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) | Err(_) => Err(LinkError::RequestExpired { id }),
        }
    }
}

/// Pending-request bookkeeping for one bus.
pub struct Correlator {
    clock: Arc<dyn Clock>,
    completion_ttl: Duration,
    stream_ttl: Duration,
    completions: DashMap<u64, PendingCompletion>,
    streams: DashMap<u64, PendingStream>,
}

impl fmt::Debug for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("clock", &self.clock)
            .field("completion_ttl", &self.completion_ttl)
            .field("stream_ttl", &self.stream_ttl)
            .field("pending_completions", &self.completions.len())
            .field("pending_streams", &self.streams.len())
            .finish()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), DEFAULT_COMPLETION_TTL, DEFAULT_STREAM_TTL)
    }
}

impl Correlator {
    pub fn new(clock: Arc<dyn Clock>, completion_ttl: Duration, stream_ttl: Duration) -> Self {
        Self {
            clock,
            completion_ttl,
            stream_ttl,
            completions: DashMap::new(),
            streams: DashMap::new(),
        }
    }

    /// Allocates a request id and its completion slot with the default TTL.
    pub fn begin_request(&self) -> RequestHandle {
        self.begin_request_with_ttl(self.completion_ttl)
    }

    /// Allocates a request id and its completion slot.
    ///
    /// Ids are random 64-bit values. A collision with a live request replaces
    /// the older entry, whose waiter then sees `RequestExpired`.
    pub fn begin_request_with_ttl(&self, ttl: Duration) -> RequestHandle {
        let now = self.clock.now();
        self.sweep(now);

        let id = next_request_id();
        let (slot, receiver) = oneshot::channel();
        if self
            .completions
            .insert(id, PendingCompletion { created_at: now, ttl, slot })
            .is_some()
        {
            debug!(request_id = id, "Request id collision, replacing older pending request");
        }
        RequestHandle {
            id,
            ttl,
            created_at: now,
            clock: Arc::clone(&self.clock),
            receiver,
        }
    }

    /// Attaches a stream callback with the default stream TTL.
    pub fn register_stream(&self, id: u64, callback: StreamCallback) {
        self.register_stream_with_ttl(id, callback, self.stream_ttl);
    }

    /// Attaches a stream callback to `id`.
    ///
    /// The first registration for an id starts its stream TTL; later ones join
    /// the existing entry.
    pub fn register_stream_with_ttl(&self, id: u64, callback: StreamCallback, ttl: Duration) {
        let now = self.clock.now();
        self.sweep(now);

        self.streams
            .entry(id)
            .or_insert_with(|| PendingStream {
                created_at: now,
                ttl,
                callbacks: Vec::new(),
            })
            .callbacks
            .push(callback);
    }

    /// Resolves the completion slot for `id`.
    ///
    /// Returns `false` (and logs at debug level) when the id is unknown,
    /// already completed or expired.
    pub fn complete(&self, id: u64, value: bool) -> bool {
        let now = self.clock.now();
        let Some((_, pending)) = self.completions.remove(&id) else {
            debug!(request_id = id, "No pending request to complete");
            return false;
        };

        if is_expired(now, pending.created_at, pending.ttl) {
            debug!(request_id = id, "Pending request expired before its response arrived");
            return false;
        }

        if pending.slot.send(value).is_err() {
            debug!(request_id = id, "Requester stopped waiting before completion");
        }
        true
    }

    /// Hands an interim line to every stream callback registered for `id`.
    ///
    /// Returns the number of callbacks invoked.
    pub fn deliver(&self, id: u64, message: &str) -> usize {
        let now = self.clock.now();
        let callbacks = match self.streams.get(&id) {
            Some(entry) if !is_expired(now, entry.created_at, entry.ttl) => entry.callbacks.clone(),
            Some(entry) => {
                drop(entry);
                self.streams.remove(&id);
                debug!(request_id = id, "Stream registration expired");
                return 0;
            }
            None => {
                debug!(request_id = id, "No stream callback registered");
                return 0;
            }
        };

        // Guard released before running user code.
        for callback in &callbacks {
            callback(message);
        }
        callbacks.len()
    }

    /// Whether a live completion slot exists for `id`.
    pub fn is_pending(&self, id: u64) -> bool {
        let now = self.clock.now();
        self.completions
            .get(&id)
            .is_some_and(|entry| !is_expired(now, entry.created_at, entry.ttl))
    }

    /// Whether a live stream registration exists for `id`.
    pub fn has_stream(&self, id: u64) -> bool {
        let now = self.clock.now();
        self.streams
            .get(&id)
            .is_some_and(|entry| !is_expired(now, entry.created_at, entry.ttl))
    }

    /// Drops every expired entry now. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.sweep(self.clock.now())
    }

    pub fn pending_completions(&self) -> usize {
        self.completions.len()
    }

    pub fn pending_streams(&self) -> usize {
        self.streams.len()
    }

    fn sweep(&self, now: Instant) -> usize {
        let before = self.completions.len() + self.streams.len();
        self.completions
            .retain(|_, pending| !is_expired(now, pending.created_at, pending.ttl));
        self.streams
            .retain(|_, pending| !is_expired(now, pending.created_at, pending.ttl));
        let removed = before.saturating_sub(self.completions.len() + self.streams.len());
        if removed > 0 {
            debug!(removed, "Evicted expired pending requests");
        }
        removed
    }
}

fn next_request_id() -> u64 {
    loop {
        let id = rand::random::<u64>();
        if id != crate::payload::NO_REPLY {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn correlator_with(clock: Arc<ManualClock>) -> Correlator {
        Correlator::new(clock, Duration::from_secs(1), Duration::from_secs(10))
    }

    #[test]
    fn expiry_policy_is_inclusive_of_ttl() {
        let start = Instant::now();
        let ttl = Duration::from_secs(1);
        assert!(!is_expired(start, start, ttl));
        assert!(!is_expired(start + Duration::from_millis(999), start, ttl));
        assert!(is_expired(start + ttl, start, ttl));
    }

    #[tokio::test]
    async fn completion_resolves_waiter() {
        let correlator = Correlator::default();
        let handle = correlator.begin_request();
        assert!(correlator.is_pending(handle.id()));
        assert!(correlator.complete(handle.id(), true));
        assert_eq!(handle.wait().await, Ok(true));
    }

    #[tokio::test]
    async fn second_completion_is_ignored() {
        let correlator = Correlator::default();
        let handle = correlator.begin_request();
        let id = handle.id();
        assert!(correlator.complete(id, true));
        assert!(!correlator.complete(id, false));
        assert_eq!(handle.wait().await, Ok(true));
    }

    #[tokio::test]
    async fn expired_request_is_not_found() {
        let clock = Arc::new(ManualClock::new());
        let correlator = correlator_with(clock.clone());
        let handle = correlator.begin_request();
        let id = handle.id();

        clock.advance(Duration::from_secs(1));
        assert!(!correlator.is_pending(id));
        assert!(!correlator.complete(id, true));
        assert_eq!(handle.wait().await, Err(LinkError::RequestExpired { id }));
    }

    #[tokio::test]
    async fn eviction_on_insert_fails_the_abandoned_waiter() {
        let clock = Arc::new(ManualClock::new());
        let correlator = correlator_with(clock.clone());
        let abandoned = correlator.begin_request();
        let abandoned_id = abandoned.id();

        clock.advance(Duration::from_secs(2));
        let _fresh = correlator.begin_request();
        assert_eq!(correlator.pending_completions(), 1);
        assert_eq!(
            abandoned.wait().await,
            Err(LinkError::RequestExpired { id: abandoned_id })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_is_bounded_by_ttl() {
        let correlator = Correlator::default();
        let handle = correlator.begin_request_with_ttl(Duration::from_millis(50));
        let id = handle.id();
        assert_eq!(handle.wait().await, Err(LinkError::RequestExpired { id }));
    }

    #[tokio::test(start_paused = true)]
    async fn late_waiter_only_gets_the_remaining_ttl() {
        let clock = Arc::new(ManualClock::new());
        let correlator = correlator_with(clock.clone());
        let handle = correlator.begin_request();
        let id = handle.id();

        clock.advance(Duration::from_millis(900));
        assert_eq!(handle.remaining(), Duration::from_millis(100));

        let started = tokio::time::Instant::now();
        assert_eq!(handle.wait().await, Err(LinkError::RequestExpired { id }));
        assert!(started.elapsed() <= Duration::from_millis(100));
    }

    #[test]
    fn stream_callbacks_run_on_every_line() {
        let correlator = Correlator::default();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        correlator.register_stream(42, Arc::new(move |line: &str| sink.lock().push(line.to_string())));
        let counter = Arc::new(AtomicUsize::new(0));
        let count = counter.clone();
        correlator.register_stream(
            42,
            Arc::new(move |_: &str| {
                count.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(correlator.deliver(42, "line one"), 2);
        assert_eq!(correlator.deliver(42, "line two"), 2);
        assert_eq!(*seen.lock(), vec!["line one", "line two"]);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(correlator.has_stream(42));
    }

    #[test]
    fn delivery_without_callbacks_is_a_no_op() {
        let correlator = Correlator::default();
        assert_eq!(correlator.deliver(7, "nobody listens"), 0);
    }

    #[test]
    fn streams_outlive_completions() {
        let clock = Arc::new(ManualClock::new());
        let correlator = correlator_with(clock.clone());
        let handle = correlator.begin_request();
        correlator.register_stream(handle.id(), Arc::new(|_: &str| {}));

        clock.advance(Duration::from_secs(5));
        assert!(!correlator.is_pending(handle.id()));
        assert_eq!(correlator.deliver(handle.id(), "still here"), 1);

        clock.advance(Duration::from_secs(5));
        assert_eq!(correlator.deliver(handle.id(), "too late"), 0);
        assert!(!correlator.has_stream(handle.id()));
    }

    #[test]
    fn purge_counts_removed_entries() {
        let clock = Arc::new(ManualClock::new());
        let correlator = correlator_with(clock.clone());
        let _a = correlator.begin_request();
        let _b = correlator.begin_request();
        correlator.register_stream(1, Arc::new(|_: &str| {}));

        clock.advance(Duration::from_secs(1));
        assert_eq!(correlator.purge_expired(), 2);
        clock.advance(Duration::from_secs(9));
        assert_eq!(correlator.purge_expired(), 1);
        assert_eq!(correlator.pending_streams(), 0);
    }

    #[test]
    fn ids_are_never_the_no_reply_marker() {
        let correlator = Correlator::default();
        for _ in 0..64 {
            assert_ne!(correlator.begin_request().id(), crate::payload::NO_REPLY);
        }
    }
}
