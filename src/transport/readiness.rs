//! Transport readiness probing with bounded retry
//!
//! A single check passes iff the transport manager is running, the overlay
//! host is up, and transport metrics can be queried. `wait_for_ready`
//! retries the check on an interval, bounded both by attempt count and by
//! wall-clock budget, and fires registered callbacks once on success.

use crate::domain_types::{MaxRetries, RetryDelayMs};
use crate::transport::pubsub::GossipOverlay;
use crate::transport::Transport;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Callback fired when the transport becomes ready
pub type ReadyCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Errors from readiness waiting
#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("another readiness wait is already in progress")]
    AlreadyWaiting,

    #[error("transport not ready after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("transport not ready within {waited_ms}ms")]
    TimedOut { waited_ms: u64 },
}

/// Readiness checker configuration
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    /// Maximum number of probe attempts
    pub max_retries: MaxRetries,
    /// Delay between probe attempts
    pub retry_interval: RetryDelayMs,
    /// Overall wall-clock budget for one wait
    pub max_wait_time: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_retries: MaxRetries::default(),
            retry_interval: RetryDelayMs::default(),
            max_wait_time: Duration::from_secs(60),
        }
    }
}

/// Probes transport and overlay health before startup proceeds
pub struct ReadinessChecker {
    transport: Arc<dyn Transport>,
    overlay: Arc<dyn GossipOverlay>,
    config: ReadinessConfig,
    callbacks: Mutex<Vec<ReadyCallback>>,
    waiting: AtomicBool,
}

impl ReadinessChecker {
    /// Creates a checker over the given transport and overlay
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        overlay: Arc<dyn GossipOverlay>,
        config: ReadinessConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            overlay,
            config,
            callbacks: Mutex::new(Vec::new()),
            waiting: AtomicBool::new(false),
        })
    }

    /// Registers a callback to fire once readiness is observed
    pub fn on_ready(&self, callback: ReadyCallback) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push(callback);
        }
    }

    /// One readiness probe
    ///
    /// Requires a running transport manager, a live overlay host, and a
    /// queryable metrics surface.
    #[must_use]
    pub fn check_once(&self) -> bool {
        if !self.transport.is_running() {
            debug!("readiness: transport manager not running");
            return false;
        }
        if !self.overlay.is_running() {
            debug!("readiness: overlay host not running");
            return false;
        }
        match self.transport.metrics() {
            Ok(metrics) => {
                debug!(
                    subscriptions = metrics.subscriptions,
                    peers = metrics.connected_peers,
                    "readiness probe passed"
                );
                true
            }
            Err(err) => {
                debug!(error = %err, "readiness: metrics unavailable");
                false
            }
        }
    }

    /// Waits until ready, retrying up to the configured bounds
    ///
    /// Returns the number of failed attempts before success. Concurrent
    /// waits are rejected; the guard resets on every exit path.
    pub async fn wait_for_ready(&self) -> Result<u32, ReadinessError> {
        if self
            .waiting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ReadinessError::AlreadyWaiting);
        }
        let result = tokio::time::timeout(self.config.max_wait_time, self.retry_loop()).await;
        self.waiting.store(false, Ordering::SeqCst);

        match result {
            Ok(Ok(retries)) => {
                self.fire_callbacks();
                Ok(retries)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ReadinessError::TimedOut {
                waited_ms: u64::try_from(self.config.max_wait_time.as_millis())
                    .unwrap_or(u64::MAX),
            }),
        }
    }

    async fn retry_loop(&self) -> Result<u32, ReadinessError> {
        let max_retries = self.config.max_retries.as_u32();
        for attempt in 0..max_retries {
            if self.check_once() {
                info!(retries = attempt, "transport is ready");
                return Ok(attempt);
            }
            warn!(
                attempt = attempt + 1,
                max = max_retries,
                "transport not ready, retrying"
            );
            tokio::time::sleep(self.config.retry_interval.as_duration()).await;
        }
        Err(ReadinessError::RetriesExhausted {
            attempts: max_retries,
        })
    }

    // Callbacks run in their own tasks; a panic in one is contained there.
    fn fire_callbacks(&self) {
        let callbacks: Vec<ReadyCallback> = self
            .callbacks
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        for callback in callbacks {
            tokio::spawn(async move {
                callback().await;
            });
        }
    }
}
