//! Service agent: intent pipeline, bid decisions, win tracking
//!
//! Two bounded channels sit between the overlay and the bid engine: an
//! ingress queue fed by the subscription handler and a processing queue
//! fed by the filter stage. Both shed on overflow so a slow agent never
//! blocks the pub/sub delivery loop.

pub mod bidding;
pub mod filter;

pub use bidding::{BidDecision, BidDecline, BidEngine, BidStrategy, BidStrategyKind};
pub use filter::{FilterRejection, IntentFilterConfig};

use crate::domain_types::{AgentId, MaxConcurrentIntents};
use crate::lifecycle::{Component, LifecycleError};
use crate::messages::{now_millis, BidMessage, Intent, MatchResult};
use crate::transport::{intent_broadcast_topics, Transport, TransportError};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, instrument, warn};

/// Ingress queue capacity (overlay handler to filter stage)
const INGRESS_CAPACITY: usize = 1000;
/// Processing queue capacity (filter stage to bid engine)
const PROCESSING_CAPACITY: usize = 100;
/// Status log interval
const STATUS_TICK: Duration = Duration::from_secs(30);

/// Service agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Service agent configuration
#[derive(Debug, Clone)]
pub struct ServiceAgentConfig {
    /// Identifier used on bids and matched against results
    pub agent_id: AgentId,
    /// Agent type tag, e.g. `trading`
    pub agent_type: String,
    /// Declared capabilities
    pub capabilities: Vec<String>,
    /// Declared specializations
    pub specializations: Vec<String>,
    /// Bid strategy parameters
    pub bid_strategy: BidStrategy,
    /// Cap on concurrently tracked intents
    pub max_concurrent_intents: MaxConcurrentIntents,
    /// Smallest admissible bid amount
    pub min_bid_amount: f64,
    /// Largest admissible bid amount
    pub max_bid_amount: f64,
    /// Intent admission filter
    pub intent_filter: IntentFilterConfig,
    /// Extra `intent.broadcast.<subtype>` topics to follow
    pub intent_subtopics: Vec<String>,
}

impl ServiceAgentConfig {
    /// An agent config with defaults for everything but identity and type
    pub fn new(agent_id: AgentId, agent_type: &str) -> Self {
        Self {
            agent_id,
            agent_type: agent_type.to_string(),
            capabilities: Vec::new(),
            specializations: Vec::new(),
            bid_strategy: BidStrategy::default(),
            max_concurrent_intents: MaxConcurrentIntents::default(),
            min_bid_amount: 0.01,
            max_bid_amount: 1_000_000.0,
            intent_filter: IntentFilterConfig::default(),
            intent_subtopics: Vec::new(),
        }
    }
}

/// Agent counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentMetrics {
    /// Intents delivered by the overlay
    pub intents_received: u64,
    /// Intents rejected by the filter
    pub intents_filtered: u64,
    /// Intents dropped because a queue was full
    pub intents_shed: u64,
    /// Bids published
    pub bids_submitted: u64,
    /// Matches won
    pub bids_won: u64,
}

struct AgentShared {
    config: ServiceAgentConfig,
    transport: Arc<dyn Transport>,
    engine: BidEngine,
    tracked: RwLock<HashSet<String>>,
    wins: RwLock<Vec<String>>,
    running: AtomicBool,
    intents_received: AtomicU64,
    intents_filtered: AtomicU64,
    intents_shed: AtomicU64,
    bids_submitted: AtomicU64,
    bids_won: AtomicU64,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

/// The actor evaluating intents and submitting bids
#[derive(Clone)]
pub struct ServiceAgent {
    shared: Arc<AgentShared>,
}

impl ServiceAgent {
    /// Creates an agent over the given transport
    #[must_use]
    pub fn new(config: ServiceAgentConfig, transport: Arc<dyn Transport>) -> Self {
        let engine = BidEngine::new(
            config.agent_type.clone(),
            config.capabilities.clone(),
            config.specializations.clone(),
            config.bid_strategy.clone(),
            config.min_bid_amount,
            config.max_bid_amount,
        );
        Self {
            shared: Arc::new(AgentShared {
                config,
                transport,
                engine,
                tracked: RwLock::new(HashSet::new()),
                wins: RwLock::new(Vec::new()),
                running: AtomicBool::new(false),
                intents_received: AtomicU64::new(0),
                intents_filtered: AtomicU64::new(0),
                intents_shed: AtomicU64::new(0),
                bids_submitted: AtomicU64::new(0),
                bids_won: AtomicU64::new(0),
                shutdown: Mutex::new(None),
            }),
        }
    }

    /// The configured agent id
    #[must_use]
    pub fn agent_id(&self) -> &AgentId {
        &self.shared.config.agent_id
    }

    /// Whether the agent has started
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Counter snapshot
    #[must_use]
    pub fn metrics(&self) -> AgentMetrics {
        let shared = &self.shared;
        AgentMetrics {
            intents_received: shared.intents_received.load(Ordering::Relaxed),
            intents_filtered: shared.intents_filtered.load(Ordering::Relaxed),
            intents_shed: shared.intents_shed.load(Ordering::Relaxed),
            bids_submitted: shared.bids_submitted.load(Ordering::Relaxed),
            bids_won: shared.bids_won.load(Ordering::Relaxed),
        }
    }

    /// Intent ids of matches this agent won, in observation order
    pub async fn wins(&self) -> Vec<String> {
        self.shared.wins.read().await.clone()
    }

    /// Number of intents currently tracked (bid outstanding)
    pub async fn tracked_intents(&self) -> usize {
        self.shared.tracked.read().await.len()
    }

    /// Subscribes to intents and matches, wires the pipeline, starts tickers
    #[instrument(skip(self), fields(agent_id = %self.shared.config.agent_id))]
    pub async fn start(&self) -> Result<(), AgentError> {
        let shared = &self.shared;
        if shared.running.swap(true, Ordering::SeqCst) {
            return Err(AgentError::AlreadyRunning);
        }

        let (ingress_tx, ingress_rx) = mpsc::channel::<Intent>(INGRESS_CAPACITY);
        let (processing_tx, processing_rx) = mpsc::channel::<Intent>(PROCESSING_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        if let Ok(mut guard) = shared.shutdown.lock() {
            *guard = Some(shutdown_tx);
        }

        for topic in intent_broadcast_topics(&shared.config.intent_subtopics) {
            let shared_for_topic = Arc::clone(shared);
            let ingress = ingress_tx.clone();
            shared
                .transport
                .subscribe_intents(
                    &topic,
                    Arc::new(move |intent: Intent| {
                        let shared = Arc::clone(&shared_for_topic);
                        let ingress = ingress.clone();
                        async move {
                            shared.intents_received.fetch_add(1, Ordering::Relaxed);
                            if ingress.try_send(intent).is_err() {
                                shared.intents_shed.fetch_add(1, Ordering::Relaxed);
                                warn!("ingress queue full, shedding intent");
                            }
                            Ok(())
                        }
                        .boxed()
                    }),
                )
                .await?;
        }

        let for_matches = Arc::clone(shared);
        shared
            .transport
            .subscribe_matches(Arc::new(move |result: MatchResult| {
                let shared = Arc::clone(&for_matches);
                async move {
                    shared.on_match_result(result).await;
                    Ok(())
                }
                .boxed()
            }))
            .await?;

        Self::spawn_filter_stage(Arc::clone(shared), ingress_rx, processing_tx, shutdown_rx.clone());
        Self::spawn_decision_stage(Arc::clone(shared), processing_rx, shutdown_rx.clone());
        Self::spawn_status_ticker(Arc::clone(shared), shutdown_rx);

        info!("service agent started");
        Ok(())
    }

    /// Stops the pipeline tasks
    pub fn stop(&self) {
        if let Ok(mut guard) = self.shared.shutdown.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(true);
            }
        }
        self.shared.running.store(false, Ordering::SeqCst);
        info!(agent_id = %self.shared.config.agent_id, "service agent stopped");
    }

    fn spawn_filter_stage(
        shared: Arc<AgentShared>,
        mut ingress: mpsc::Receiver<Intent>,
        processing: mpsc::Sender<Intent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    intent = ingress.recv() => {
                        let Some(intent) = intent else { break };
                        match shared.config.intent_filter.accepts(&intent) {
                            Ok(()) => {
                                if processing.try_send(intent).is_err() {
                                    shared.intents_shed.fetch_add(1, Ordering::Relaxed);
                                    warn!("processing queue full, shedding intent");
                                }
                            }
                            Err(rejection) => {
                                shared.intents_filtered.fetch_add(1, Ordering::Relaxed);
                                debug!(reason = %rejection, "intent filtered");
                            }
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

    fn spawn_decision_stage(
        shared: Arc<AgentShared>,
        mut processing: mpsc::Receiver<Intent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    intent = processing.recv() => {
                        let Some(intent) = intent else { break };
                        shared.decide_and_bid(intent).await;
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

    fn spawn_status_ticker(shared: Arc<AgentShared>, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_TICK);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let tracked = shared.tracked.read().await.len();
                        info!(
                            agent_id = %shared.config.agent_id,
                            tracked,
                            received = shared.intents_received.load(Ordering::Relaxed),
                            submitted = shared.bids_submitted.load(Ordering::Relaxed),
                            won = shared.bids_won.load(Ordering::Relaxed),
                            "agent status"
                        );
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
}

impl AgentShared {
    /// Evaluates one filtered intent and publishes the bid if positive
    async fn decide_and_bid(&self, intent: Intent) {
        {
            let tracked = self.tracked.read().await;
            if tracked.len() >= self.config.max_concurrent_intents.as_usize() {
                warn!(
                    intent_id = %intent.id,
                    max = self.config.max_concurrent_intents.as_usize(),
                    "tracked-intent capacity reached, skipping"
                );
                return;
            }
            if tracked.contains(&intent.id) {
                debug!(intent_id = %intent.id, "already bid on this intent");
                return;
            }
        }

        let decision = match self.engine.evaluate(&intent) {
            Ok(decision) => decision,
            Err(decline) => {
                debug!(intent_id = %intent.id, reason = %decline, "declined to bid");
                return;
            }
        };

        let mut metadata = HashMap::new();
        metadata.insert(
            "confidence".to_string(),
            format!("{:.2}", decision.confidence),
        );
        metadata.insert(
            "strategy".to_string(),
            self.engine.strategy().kind.as_str().to_string(),
        );
        let bid = BidMessage {
            intent_id: intent.id.clone(),
            agent_id: self.config.agent_id.clone().into_inner(),
            bid_amount: decision.amount.clone(),
            capabilities: self.config.capabilities.clone(),
            timestamp: now_millis(),
            agent_type: self.config.agent_type.clone(),
            metadata,
            signature: Vec::new(),
        };

        match self.transport.publish_bid(&bid).await {
            Ok(()) => {
                self.bids_submitted.fetch_add(1, Ordering::Relaxed);
                self.tracked.write().await.insert(intent.id.clone());
                info!(
                    intent_id = %intent.id,
                    amount = %decision.amount,
                    confidence = decision.confidence,
                    "bid submitted"
                );
            }
            Err(err) => {
                warn!(
                    intent_id = %intent.id,
                    code = err.code(),
                    error = %err,
                    "bid publish failed"
                );
            }
        }
    }

    /// Updates the win counter and drops the intent from tracking
    async fn on_match_result(&self, result: MatchResult) {
        let agent_id = self.config.agent_id.clone().into_inner();
        if result.winning_agent == agent_id {
            self.bids_won.fetch_add(1, Ordering::Relaxed);
            self.wins.write().await.push(result.intent_id.clone());
            info!(
                intent_id = %result.intent_id,
                winning_bid = %result.winning_bid,
                "won the match"
            );
        }
        self.tracked.write().await.remove(&result.intent_id);
    }
}

#[async_trait]
impl Component for ServiceAgent {
    fn id(&self) -> String {
        self.shared.config.agent_id.clone().into_inner()
    }

    async fn start(&self) -> Result<(), LifecycleError> {
        ServiceAgent::start(self)
            .await
            .map_err(|err| LifecycleError::StartFailed {
                component: self.id(),
                reason: err.to_string(),
            })
    }

    async fn stop(&self) -> Result<(), LifecycleError> {
        ServiceAgent::stop(self);
        Ok(())
    }
}
