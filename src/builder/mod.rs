//! Block builder: session tracking, matching dispatch, result broadcast
//!
//! One builder owns its sessions outright. All state transitions happen
//! under a single reader/writer lock; the matching computation itself runs
//! outside the lock so a slow algorithm never blocks bid admission. The
//! two-phase dispatch (mark `matching` under the lock, run the engine
//! after releasing it) is what makes quorum- and deadline-triggered
//! matching race-free.

pub mod matching;
pub mod session;

pub use matching::{MatchingAlgorithm, MatchingEngine, MatchingError, WinningBid};
pub use session::{BidAdmission, IntentSession, SessionError, SessionState};

use crate::domain_types::{
    BidCollectionWindowMs, BuilderId, MaxConcurrentIntents, MinBidsRequired,
};
use crate::lifecycle::{Component, LifecycleError};
use crate::messages::{now_millis, BidMessage, Intent, MatchResult, MatchStatus};
use crate::transport::{intent_broadcast_topics, Transport, TransportError};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, instrument, warn};

/// Deadline scan interval
const DEADLINE_TICK: Duration = Duration::from_secs(2);
/// Stale-session sweep interval
const CLEANUP_TICK: Duration = Duration::from_secs(60);
/// Grace period past the deadline before a session is deleted
const CLEANUP_GRACE: Duration = Duration::from_secs(300);

/// Block builder errors
///
/// Per-message session problems (unknown intent, closed session) are
/// dropped with a warning rather than surfaced; only control-plane
/// failures reach the caller.
#[derive(Debug, Error)]
pub enum BuilderError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Builder configuration
#[derive(Debug, Clone)]
pub struct BlockBuilderConfig {
    /// Identifier stamped on published results
    pub builder_id: BuilderId,
    /// Winner selection algorithm
    pub matching_algorithm: MatchingAlgorithm,
    /// Settlement mode tag recorded in result metadata
    pub settlement_mode: String,
    /// Bid collection window per session
    pub bid_collection_window: BidCollectionWindowMs,
    /// Active-session capacity
    pub max_concurrent_intents: MaxConcurrentIntents,
    /// Quorum that triggers immediate matching
    pub min_bids_required: MinBidsRequired,
    /// Extra `intent.broadcast.<subtype>` topics to follow
    pub intent_subtopics: Vec<String>,
}

impl BlockBuilderConfig {
    /// A builder config with defaults for everything but the id
    pub fn new(builder_id: BuilderId) -> Self {
        Self {
            builder_id,
            matching_algorithm: MatchingAlgorithm::default(),
            settlement_mode: "simulated".to_string(),
            bid_collection_window: BidCollectionWindowMs::default(),
            max_concurrent_intents: MaxConcurrentIntents::default(),
            min_bids_required: MinBidsRequired::default(),
            intent_subtopics: Vec::new(),
        }
    }
}

/// Builder operational status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderStatus {
    /// Created but not started
    Idle,
    /// Serving sessions
    Running,
    /// Active-session capacity reached; new intents are shed
    Busy,
    /// Stopped
    Stopped,
}

/// Builder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuilderMetrics {
    /// Intents observed on the broadcast topics
    pub intents_seen: u64,
    /// Sessions opened
    pub sessions_opened: u64,
    /// Bids appended to sessions
    pub bids_received: u64,
    /// Bids that overwrote an earlier bid from the same agent
    pub bids_updated: u64,
    /// Bids dropped for unknown or closed sessions
    pub bids_dropped: u64,
    /// Sessions completed with a winner
    pub matches_completed: u64,
    /// Sessions that failed in the matching engine
    pub matches_failed: u64,
    /// Sessions closed with `no_match`
    pub no_matches: u64,
    /// Match results observed on the results topic (any builder's)
    pub results_observed: u64,
    /// Stale sessions deleted by the cleanup sweep
    pub sessions_pruned: u64,
}

/// Why a matching dispatch was attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchReason {
    Quorum,
    Deadline,
}

struct BuilderState {
    active: HashMap<String, IntentSession>,
    completed: HashMap<String, MatchResult>,
    status: BuilderStatus,
    metrics: BuilderMetrics,
}

struct BuilderShared {
    config: BlockBuilderConfig,
    transport: Arc<dyn Transport>,
    engine: MatchingEngine,
    state: RwLock<BuilderState>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

/// The actor running intent sessions and publishing match results
#[derive(Clone)]
pub struct BlockBuilder {
    shared: Arc<BuilderShared>,
}

impl BlockBuilder {
    /// Creates a builder over the given transport
    #[must_use]
    pub fn new(config: BlockBuilderConfig, transport: Arc<dyn Transport>) -> Self {
        let engine = MatchingEngine::new(config.matching_algorithm);
        Self {
            shared: Arc::new(BuilderShared {
                config,
                transport,
                engine,
                state: RwLock::new(BuilderState {
                    active: HashMap::new(),
                    completed: HashMap::new(),
                    status: BuilderStatus::Idle,
                    metrics: BuilderMetrics::default(),
                }),
                shutdown: Mutex::new(None),
            }),
        }
    }

    /// The configured builder id
    #[must_use]
    pub fn builder_id(&self) -> &BuilderId {
        &self.shared.config.builder_id
    }

    /// Subscribes to intents, bids, and results, and spawns the tickers
    #[instrument(skip(self), fields(builder_id = %self.shared.config.builder_id))]
    pub async fn start(&self) -> Result<(), BuilderError> {
        let shared = &self.shared;

        for topic in intent_broadcast_topics(&shared.config.intent_subtopics) {
            let for_intents = Arc::clone(shared);
            shared
                .transport
                .subscribe_intents(
                    &topic,
                    Arc::new(move |intent: Intent| {
                        let shared = Arc::clone(&for_intents);
                        async move {
                            shared.on_intent(intent).await;
                            Ok(())
                        }
                        .boxed()
                    }),
                )
                .await?;
        }

        let for_bids = Arc::clone(shared);
        shared
            .transport
            .subscribe_bids(Arc::new(move |bid: BidMessage| {
                let shared = Arc::clone(&for_bids);
                async move {
                    shared.on_bid(bid).await;
                    Ok(())
                }
                .boxed()
            }))
            .await?;

        // Results feed only the counters; correctness never depends on it.
        let for_results = Arc::clone(shared);
        shared
            .transport
            .subscribe_matches(Arc::new(move |_result: MatchResult| {
                let shared = Arc::clone(&for_results);
                async move {
                    shared.state.write().await.metrics.results_observed += 1;
                    Ok(())
                }
                .boxed()
            }))
            .await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        if let Ok(mut guard) = shared.shutdown.lock() {
            *guard = Some(shutdown_tx);
        }
        Self::spawn_deadline_ticker(Arc::clone(shared), shutdown_rx.clone());
        Self::spawn_cleanup_ticker(Arc::clone(shared), shutdown_rx);

        shared.state.write().await.status = BuilderStatus::Running;
        info!("block builder started");
        Ok(())
    }

    /// Stops the tickers and marks the builder stopped
    pub async fn stop(&self) {
        if let Ok(mut guard) = self.shared.shutdown.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(true);
            }
        }
        self.shared.state.write().await.status = BuilderStatus::Stopped;
        info!(builder_id = %self.shared.config.builder_id, "block builder stopped");
    }

    /// Current status
    pub async fn status(&self) -> BuilderStatus {
        self.shared.state.read().await.status
    }

    /// Counter snapshot
    pub async fn metrics(&self) -> BuilderMetrics {
        self.shared.state.read().await.metrics
    }

    /// Number of active (non-pruned) sessions
    pub async fn active_session_count(&self) -> usize {
        self.shared.state.read().await.active.len()
    }

    /// State of a tracked session, if present
    pub async fn session_state(&self, intent_id: &str) -> Option<SessionState> {
        self.shared
            .state
            .read()
            .await
            .active
            .get(intent_id)
            .map(IntentSession::state)
    }

    /// Recorded result for an intent, if matching has concluded
    pub async fn completed_match(&self, intent_id: &str) -> Option<MatchResult> {
        self.shared
            .state
            .read()
            .await
            .completed
            .get(intent_id)
            .cloned()
    }

    fn spawn_deadline_ticker(shared: Arc<BuilderShared>, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DEADLINE_TICK);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let due: Vec<String> = {
                            let state = shared.state.read().await;
                            state
                                .active
                                .iter()
                                .filter(|(_, s)| {
                                    s.state() == SessionState::Collecting && s.deadline_elapsed()
                                })
                                .map(|(id, _)| id.clone())
                                .collect()
                        };
                        for intent_id in due {
                            shared
                                .clone()
                                .dispatch_matching(intent_id, DispatchReason::Deadline)
                                .await;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_cleanup_ticker(shared: Arc<BuilderShared>, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_TICK);
            loop {
                tokio::select! {
                    _ = ticker.tick() => shared.prune_stale_sessions().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

impl BuilderShared {
    /// Handles one intent broadcast
    async fn on_intent(&self, intent: Intent) {
        let mut state = self.state.write().await;
        state.metrics.intents_seen += 1;

        if state.active.contains_key(&intent.id) {
            debug!(intent_id = %intent.id, "intent already has an active session");
            return;
        }
        let max = self.config.max_concurrent_intents.as_usize();
        if state.active.len() >= max {
            state.status = BuilderStatus::Busy;
            warn!(intent_id = %intent.id, max, "session capacity reached, shedding intent");
            return;
        }

        let session = IntentSession::new(intent.clone(), self.config.bid_collection_window);
        state.active.insert(intent.id.clone(), session);
        state.metrics.sessions_opened += 1;
        info!(
            intent_id = %intent.id,
            intent_type = %intent.intent_type,
            active = state.active.len(),
            "session opened"
        );
    }

    /// Handles one bid submission
    async fn on_bid(self: &Arc<Self>, bid: BidMessage) {
        let quorum_reached = {
            let mut state = self.state.write().await;
            let Some(session) = state.active.get_mut(&bid.intent_id) else {
                debug!(intent_id = %bid.intent_id, agent_id = %bid.agent_id, "bid for unknown session");
                state.metrics.bids_dropped += 1;
                return;
            };
            match session.add_or_update_bid(bid.clone()) {
                Ok(BidAdmission::Added) => state.metrics.bids_received += 1,
                Ok(BidAdmission::Updated) => {
                    state.metrics.bids_updated += 1;
                    debug!(
                        intent_id = %bid.intent_id,
                        agent_id = %bid.agent_id,
                        "bid updated in place"
                    );
                }
                Err(err) => {
                    warn!(
                        intent_id = %bid.intent_id,
                        agent_id = %bid.agent_id,
                        error = %err,
                        "bid rejected"
                    );
                    state.metrics.bids_dropped += 1;
                    return;
                }
            }
            let session = &state.active[&bid.intent_id];
            session.bids().len() >= self.config.min_bids_required.as_usize()
        };

        if quorum_reached {
            let shared = Arc::clone(self);
            let intent_id = bid.intent_id.clone();
            tokio::spawn(async move {
                shared.dispatch_matching(intent_id, DispatchReason::Quorum).await;
            });
        }
    }

    /// Two-phase matching dispatch
    ///
    /// Phase one re-checks the session under the write lock and atomically
    /// transitions it to `matching`; phase two runs the engine with the
    /// lock released. A session can therefore be dispatched at most once
    /// even when quorum and deadline race.
    async fn dispatch_matching(self: Arc<Self>, intent_id: String, reason: DispatchReason) {
        let (intent, bids) = {
            let mut state = self.state.write().await;
            let Some(session) = state.active.get_mut(&intent_id) else {
                return;
            };
            if session.state() != SessionState::Collecting {
                return;
            }
            if reason == DispatchReason::Quorum
                && session.bids().len() < self.config.min_bids_required.as_usize()
            {
                return;
            }
            if !session.begin_matching() {
                return;
            }
            (session.intent().clone(), session.bids().to_vec())
        };

        debug!(intent_id = %intent_id, ?reason, bids = bids.len(), "matching dispatched");
        self.run_matching(&intent_id, &intent, bids).await;
    }

    /// Runs the engine and records the outcome
    async fn run_matching(&self, intent_id: &str, intent: &Intent, bids: Vec<BidMessage>) {
        let algorithm = self.engine.algorithm().as_str();

        let result = if bids.len() < self.config.min_bids_required.as_usize() {
            let mut metadata = HashMap::new();
            metadata.insert("reason".to_string(), "insufficient_bids".to_string());
            metadata.insert("algorithm".to_string(), algorithm.to_string());
            MatchResult {
                intent_id: intent_id.to_string(),
                winning_agent: String::new(),
                winning_bid: String::new(),
                total_bids: bids.len(),
                matched_at: now_millis(),
                status: MatchStatus::NoMatch,
                metadata,
                block_builder_id: self.config.builder_id.clone().into_inner(),
            }
        } else {
            match self.engine.select_winner(&bids) {
                Ok(winner) => {
                    let mut metadata = HashMap::new();
                    metadata.insert("algorithm".to_string(), algorithm.to_string());
                    metadata.insert("agent_type".to_string(), winner.bid.agent_type.clone());
                    metadata.insert("intent_type".to_string(), intent.intent_type.clone());
                    metadata
                        .insert("settlement_mode".to_string(), self.config.settlement_mode.clone());
                    MatchResult {
                        intent_id: intent_id.to_string(),
                        winning_agent: winner.bid.agent_id.clone(),
                        winning_bid: winner.bid.bid_amount.clone(),
                        total_bids: bids.len(),
                        matched_at: now_millis(),
                        status: MatchStatus::Matched,
                        metadata,
                        block_builder_id: self.config.builder_id.clone().into_inner(),
                    }
                }
                Err(err) => {
                    let mut metadata = HashMap::new();
                    metadata.insert("error".to_string(), err.to_string());
                    metadata.insert("algorithm".to_string(), algorithm.to_string());
                    MatchResult {
                        intent_id: intent_id.to_string(),
                        winning_agent: String::new(),
                        winning_bid: String::new(),
                        total_bids: bids.len(),
                        matched_at: now_millis(),
                        status: MatchStatus::MatchFailed,
                        metadata,
                        block_builder_id: self.config.builder_id.clone().into_inner(),
                    }
                }
            }
        };

        self.record_outcome(intent_id, result.clone()).await;

        if let Err(err) = self.transport.publish_match_result(&result).await {
            error!(
                intent_id = %intent_id,
                code = err.code(),
                error = %err,
                "failed to broadcast match result"
            );
        }
    }

    /// Applies the terminal transition and moves the result to the
    /// completed map, atomically under the builder lock
    async fn record_outcome(&self, intent_id: &str, result: MatchResult) {
        let mut state = self.state.write().await;
        match result.status {
            MatchStatus::Matched => {
                if let Some(mut session) = state.active.remove(intent_id) {
                    if let Err(err) = session.complete(result.clone()) {
                        error!(intent_id = %intent_id, error = %err, "completion rejected");
                    }
                }
                state.metrics.matches_completed += 1;
                info!(
                    intent_id = %intent_id,
                    winning_agent = %result.winning_agent,
                    winning_bid = %result.winning_bid,
                    total_bids = result.total_bids,
                    "session matched"
                );
            }
            MatchStatus::NoMatch | MatchStatus::MatchFailed => {
                if let Some(session) = state.active.get_mut(intent_id) {
                    if let Err(err) = session.expire(Some(result.clone())) {
                        error!(intent_id = %intent_id, error = %err, "expiry rejected");
                    }
                }
                if result.status == MatchStatus::NoMatch {
                    state.metrics.no_matches += 1;
                } else {
                    state.metrics.matches_failed += 1;
                }
                warn!(
                    intent_id = %intent_id,
                    status = %result.status,
                    total_bids = result.total_bids,
                    "session closed without a winner"
                );
            }
        }
        state.completed.insert(intent_id.to_string(), result);
        self.recompute_busy(&mut state);
    }

    /// Deletes sessions that escaped the deadline tick or finished expiring
    async fn prune_stale_sessions(&self) {
        let mut state = self.state.write().await;
        let before = state.active.len();
        state.active.retain(|intent_id, session| {
            let stale = match session.state() {
                SessionState::Collecting | SessionState::Expired => {
                    session.past_deadline_by(CLEANUP_GRACE)
                }
                SessionState::Matching | SessionState::Completed => false,
            };
            if stale {
                debug!(intent_id = %intent_id, state = %session.state(), "pruning stale session");
            }
            !stale
        });
        let pruned = before - state.active.len();
        if pruned > 0 {
            state.metrics.sessions_pruned += u64::try_from(pruned).unwrap_or(u64::MAX);
            self.recompute_busy(&mut state);
            info!(pruned, "stale sessions deleted");
        }
    }

    fn recompute_busy(&self, state: &mut BuilderState) {
        if state.status == BuilderStatus::Busy
            && state.active.len() < self.config.max_concurrent_intents.as_usize()
        {
            state.status = BuilderStatus::Running;
        }
    }
}

#[async_trait]
impl Component for BlockBuilder {
    fn id(&self) -> String {
        self.shared.config.builder_id.clone().into_inner()
    }

    async fn start(&self) -> Result<(), LifecycleError> {
        BlockBuilder::start(self)
            .await
            .map_err(|err| LifecycleError::StartFailed {
                component: self.id(),
                reason: err.to_string(),
            })
    }

    async fn stop(&self) -> Result<(), LifecycleError> {
        BlockBuilder::stop(self).await;
        Ok(())
    }
}
