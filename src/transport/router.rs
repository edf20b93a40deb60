//! Message admission: deduplication and an ordered filter chain
//!
//! The router sits in front of every publish and every inbound delivery.
//! Deduplication is an in-memory id cache with coarse eviction (oldest 25%
//! when full) and periodic TTL pruning; filters are side-effect-free
//! predicates evaluated in descending priority order.

use crate::domain_types::{DedupCacheSize, MaxMessageBytes};
use crate::messages::TransportEnvelope;
use crate::transport::TransportError;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Outcome of a single filter evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    /// The message passes this filter
    Admit,
    /// The message is dropped; the reason lands in the error and logs
    Drop { reason: String },
}

/// A side-effect-free admission predicate
///
/// Filters are idempotent: evaluating the same message twice yields the
/// same decision.
pub trait MessageFilter: Send + Sync {
    /// Stable identifier, reported when a message is dropped
    fn id(&self) -> &str;

    /// Evaluation order: higher priority runs first
    fn priority(&self) -> i32;

    /// Decides whether the message may pass
    fn evaluate(&self, topic: &str, envelope: &TransportEnvelope) -> FilterDecision;
}

/// Drops envelopes whose TTL has elapsed
#[derive(Debug, Default)]
pub struct TtlFilter;

impl MessageFilter for TtlFilter {
    fn id(&self) -> &str {
        "ttl"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn evaluate(&self, _topic: &str, envelope: &TransportEnvelope) -> FilterDecision {
        if envelope.is_expired() {
            FilterDecision::Drop {
                reason: format!("expired {}ms ttl", envelope.ttl),
            }
        } else {
            FilterDecision::Admit
        }
    }
}

/// Drops envelopes from blocked senders
#[derive(Debug, Default)]
pub struct SenderFilter {
    blocked: RwLock<HashSet<String>>,
}

impl SenderFilter {
    /// Creates a filter with an initial blocked set
    #[must_use]
    pub fn new(blocked: HashSet<String>) -> Self {
        Self {
            blocked: RwLock::new(blocked),
        }
    }

    /// Adds a sender to the blocked set
    pub fn block(&self, sender: &str) {
        if let Ok(mut blocked) = self.blocked.write() {
            blocked.insert(sender.to_string());
        }
    }

    /// Removes a sender from the blocked set
    pub fn unblock(&self, sender: &str) {
        if let Ok(mut blocked) = self.blocked.write() {
            blocked.remove(sender);
        }
    }
}

impl MessageFilter for SenderFilter {
    fn id(&self) -> &str {
        "sender"
    }

    fn priority(&self) -> i32 {
        75
    }

    fn evaluate(&self, _topic: &str, envelope: &TransportEnvelope) -> FilterDecision {
        let blocked = self
            .blocked
            .read()
            .map(|set| set.contains(&envelope.sender))
            .unwrap_or(false);
        if blocked {
            FilterDecision::Drop {
                reason: format!("blocked sender {}", envelope.sender),
            }
        } else {
            FilterDecision::Admit
        }
    }
}

/// Drops envelopes whose total byte size exceeds the configured maximum
#[derive(Debug)]
pub struct SizeFilter {
    max_bytes: usize,
}

impl SizeFilter {
    /// Creates a filter with the given size cap
    #[must_use]
    pub fn new(max_bytes: MaxMessageBytes) -> Self {
        Self {
            max_bytes: max_bytes.as_usize(),
        }
    }
}

impl MessageFilter for SizeFilter {
    fn id(&self) -> &str {
        "size"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn evaluate(&self, _topic: &str, envelope: &TransportEnvelope) -> FilterDecision {
        let size = envelope.byte_size();
        if size > self.max_bytes {
            FilterDecision::Drop {
                reason: format!("{size} bytes exceeds {} max", self.max_bytes),
            }
        } else {
            FilterDecision::Admit
        }
    }
}

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Dedup cache capacity
    pub cache_size: DedupCacheSize,
    /// Dedup entry lifetime
    pub entry_ttl: Duration,
    /// Size cap enforced by the default size filter
    pub max_message_bytes: MaxMessageBytes,
    /// Senders blocked by the default sender filter
    pub blocked_senders: HashSet<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cache_size: DedupCacheSize::default(),
            entry_ttl: Duration::from_secs(600),
            max_message_bytes: MaxMessageBytes::default(),
            blocked_senders: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct DedupEntry {
    inserted_at: Instant,
    #[allow(dead_code)]
    sender: String,
    #[allow(dead_code)]
    topic: String,
}

/// Thread-safe admission stage: dedup cache plus filter chain
///
/// The dedup map and the filter list are guarded by separate locks; both
/// critical sections are short and never held across awaits.
pub struct MessageRouter {
    config: RouterConfig,
    seen: Mutex<HashMap<String, DedupEntry>>,
    filters: RwLock<Vec<Arc<dyn MessageFilter>>>,
    routed: AtomicU64,
    duplicates: AtomicU64,
    dropped: AtomicU64,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl MessageRouter {
    /// Creates a router with the default TTL, sender, and size filters
    #[must_use]
    pub fn new(config: RouterConfig) -> Self {
        let mut filters: Vec<Arc<dyn MessageFilter>> = vec![
            Arc::new(TtlFilter),
            Arc::new(SenderFilter::new(config.blocked_senders.clone())),
            Arc::new(SizeFilter::new(config.max_message_bytes)),
        ];
        filters.sort_by_key(|f| std::cmp::Reverse(f.priority()));
        Self {
            config,
            seen: Mutex::new(HashMap::new()),
            filters: RwLock::new(filters),
            routed: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            shutdown: Mutex::new(None),
        }
    }

    /// The configuration this router was built with
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Installs an additional filter, keeping priority order
    pub fn add_filter(&self, filter: Arc<dyn MessageFilter>) {
        if let Ok(mut filters) = self.filters.write() {
            filters.push(filter);
            filters.sort_by_key(|f| std::cmp::Reverse(f.priority()));
        }
    }

    /// Admits or rejects one message
    ///
    /// A previously seen id is a [`TransportError::DuplicateMessage`]; a
    /// filter rejection is a [`TransportError::MessageFiltered`]. Neither
    /// aborts the caller's broadcast loop.
    pub fn admit(&self, topic: &str, envelope: &TransportEnvelope) -> Result<(), TransportError> {
        self.insert_or_reject(topic, envelope)?;

        let filters = self
            .filters
            .read()
            .map(|f| f.clone())
            .unwrap_or_default();
        for filter in &filters {
            if let FilterDecision::Drop { reason } = filter.evaluate(topic, envelope) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    message_id = %envelope.id,
                    filter = filter.id(),
                    %reason,
                    "message dropped by filter"
                );
                return Err(TransportError::MessageFiltered {
                    filter_id: filter.id().to_string(),
                });
            }
        }

        self.routed.fetch_add(1, Ordering::Relaxed);
        trace!(message_id = %envelope.id, %topic, "message admitted");
        Ok(())
    }

    fn insert_or_reject(
        &self,
        topic: &str,
        envelope: &TransportEnvelope,
    ) -> Result<(), TransportError> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| TransportError::NotRunning)?;
        if seen.contains_key(&envelope.id) {
            drop(seen);
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::DuplicateMessage {
                message_id: envelope.id.clone(),
            });
        }
        if seen.len() >= self.config.cache_size.as_usize() {
            Self::evict_oldest_quarter(&mut seen);
        }
        seen.insert(
            envelope.id.clone(),
            DedupEntry {
                inserted_at: Instant::now(),
                sender: envelope.sender.clone(),
                topic: topic.to_string(),
            },
        );
        Ok(())
    }

    // Coarse eviction: drop the oldest 25% by insertion time. Not LRU;
    // amortized O(N log N) is acceptable at the default cache size.
    fn evict_oldest_quarter(seen: &mut HashMap<String, DedupEntry>) {
        let mut by_age: Vec<(String, Instant)> = seen
            .iter()
            .map(|(id, entry)| (id.clone(), entry.inserted_at))
            .collect();
        by_age.sort_by_key(|(_, at)| *at);
        let evict = (by_age.len() / 4).max(1);
        for (id, _) in by_age.into_iter().take(evict) {
            seen.remove(&id);
        }
        debug!(evicted = evict, "dedup cache evicted oldest entries");
    }

    /// Starts the background pruning task (runs at a quarter of entry TTL)
    pub fn start(self: &Arc<Self>) {
        let (tx, mut rx) = watch::channel(false);
        if let Ok(mut guard) = self.shutdown.lock() {
            *guard = Some(tx);
        }
        let router = Arc::clone(self);
        let period = self.config.entry_ttl / 4;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(50)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => router.prune_expired(),
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Stops the background pruning task
    pub fn stop(&self) {
        if let Ok(mut guard) = self.shutdown.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(true);
            }
        }
    }

    /// Removes entries older than the configured TTL
    pub fn prune_expired(&self) {
        let ttl = self.config.entry_ttl;
        if let Ok(mut seen) = self.seen.lock() {
            let before = seen.len();
            seen.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
            let pruned = before - seen.len();
            if pruned > 0 {
                debug!(pruned, "dedup cache pruned expired entries");
            }
        }
    }

    /// Messages admitted so far
    #[must_use]
    pub fn routed_count(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    /// Messages rejected as duplicates so far
    #[must_use]
    pub fn duplicate_count(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Messages rejected by filters so far
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Current number of dedup entries
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }
}
