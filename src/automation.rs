//! Phased, retrying startup orchestration
//!
//! Five ordered phases bring the auction core online only after the
//! transport is demonstrably healthy:
//!
//! 1. wait for transport readiness
//! 2. instantiate and register components (agents at priority 1,
//!    builders at 2)
//! 3. start service agents (long-lived, not bound to the startup deadline)
//! 4. start block builders under the component-start timeout
//! 5. start the base periodic tasks
//!
//! Any phase failure tears down partial state and retries the whole cycle
//! with backoff, up to the configured retry budget. Terminal failures land
//! on the init-errors channel.

use crate::agent::ServiceAgent;
use crate::builder::BlockBuilder;
use crate::config::{AsyncInitConfig, NodeConfig};
use crate::lifecycle::LifecycleManager;
use crate::transport::{ReadinessChecker, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{error, info, instrument, warn};

/// Priority group for service agents
const PRIORITY_AGENTS: u32 = 1;
/// Priority group for block builders
const PRIORITY_BUILDERS: u32 = 2;
/// Base status-report interval
const BASE_STATUS_TICK: Duration = Duration::from_secs(60);
/// Capacity of the terminal init-error channel
const INIT_ERROR_CAPACITY: usize = 16;

/// Automation errors
#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("automation is disabled by configuration")]
    Disabled,

    #[error("initialization already in progress")]
    AlreadyInitializing,

    #[error("phase {phase} failed: {reason}")]
    PhaseFailed { phase: &'static str, reason: String },

    #[error("initialization failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Per-phase completion flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitPhases {
    /// Phase 1 passed
    pub transport_ready: bool,
    /// Phase 2 passed
    pub components_registered: bool,
    /// Phase 3 passed
    pub agents_started: bool,
    /// Phase 4 passed
    pub builders_started: bool,
    /// Phase 5 passed
    pub background_started: bool,
}

/// Point-in-time initialization status
#[derive(Debug, Clone, Default)]
pub struct InitStatus {
    /// Whether the full cycle has completed
    pub is_initialized: bool,
    /// Whether a cycle is currently running
    pub is_initializing: bool,
    /// Failed cycles so far
    pub retry_count: u32,
    /// Most recent failure, if any
    pub last_error: Option<String>,
    /// Per-phase flags of the current or last cycle
    pub phases: InitPhases,
}

/// Orchestrates phased startup of agents and builders
pub struct AsyncAutomationManager {
    config: NodeConfig,
    init: AsyncInitConfig,
    transport: Arc<dyn Transport>,
    readiness: Arc<ReadinessChecker>,
    lifecycle: LifecycleManager,
    status: RwLock<InitStatus>,
    initializing: AtomicBool,
    agents: RwLock<Vec<ServiceAgent>>,
    builders: RwLock<Vec<BlockBuilder>>,
    init_errors_tx: mpsc::Sender<String>,
    init_errors_rx: Mutex<Option<mpsc::Receiver<String>>>,
    base_shutdown: std::sync::Mutex<Option<watch::Sender<bool>>>,
}

impl AsyncAutomationManager {
    /// Creates a manager over the given transport and readiness checker
    #[must_use]
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        readiness: Arc<ReadinessChecker>,
    ) -> Arc<Self> {
        let init = config.automation.async_init.clone();
        let (init_errors_tx, init_errors_rx) = mpsc::channel(INIT_ERROR_CAPACITY);
        Arc::new(Self {
            config,
            init,
            transport,
            readiness,
            lifecycle: LifecycleManager::new(),
            status: RwLock::new(InitStatus::default()),
            initializing: AtomicBool::new(false),
            agents: RwLock::new(Vec::new()),
            builders: RwLock::new(Vec::new()),
            init_errors_tx,
            init_errors_rx: Mutex::new(Some(init_errors_rx)),
            base_shutdown: std::sync::Mutex::new(None),
        })
    }

    /// Current initialization status
    pub async fn status(&self) -> InitStatus {
        self.status.read().await.clone()
    }

    /// Running service agents
    pub async fn agents(&self) -> Vec<ServiceAgent> {
        self.agents.read().await.clone()
    }

    /// Running block builders
    pub async fn builders(&self) -> Vec<BlockBuilder> {
        self.builders.read().await.clone()
    }

    /// Takes the receiver of terminal initialization errors
    pub async fn take_init_errors(&self) -> Option<mpsc::Receiver<String>> {
        self.init_errors_rx.lock().await.take()
    }

    /// Runs the full initialization cycle, retrying per policy
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), AutomationError> {
        if !self.config.automation.enabled || !self.init.enabled {
            return Err(AutomationError::Disabled);
        }
        if self.initializing.swap(true, Ordering::SeqCst) {
            return Err(AutomationError::AlreadyInitializing);
        }
        self.status.write().await.is_initializing = true;

        let max_attempts = self.init.max_init_retries.as_u32() + 1;
        let mut last_error = String::new();
        for attempt in 0..max_attempts {
            match self.run_phases().await {
                Ok(()) => {
                    let mut status = self.status.write().await;
                    status.is_initialized = true;
                    status.is_initializing = false;
                    self.initializing.store(false, Ordering::SeqCst);
                    info!(retries = status.retry_count, "initialization complete");
                    return Ok(());
                }
                Err(err) => {
                    last_error = err.to_string();
                    warn!(
                        attempt = attempt + 1,
                        max = max_attempts,
                        error = %err,
                        "initialization cycle failed"
                    );
                    self.cleanup_partial().await;
                    {
                        let mut status = self.status.write().await;
                        status.retry_count += 1;
                        status.last_error = Some(last_error.clone());
                    }
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(self.init.retry_backoff_interval.as_duration()).await;
                    }
                }
            }
        }

        self.status.write().await.is_initializing = false;
        self.initializing.store(false, Ordering::SeqCst);
        let terminal = AutomationError::RetriesExhausted {
            attempts: max_attempts,
            last_error: last_error.clone(),
        };
        error!(error = %terminal, "initialization abandoned");
        if self.init_errors_tx.try_send(terminal.to_string()).is_err() {
            warn!("init-error channel full, terminal error dropped");
        }
        Err(terminal)
    }

    async fn run_phases(&self) -> Result<(), AutomationError> {
        self.status.write().await.phases = InitPhases::default();

        // Phase 1: the overlay and transport must be jointly healthy.
        tokio::time::timeout(
            self.init.transport_ready_timeout(),
            self.readiness.wait_for_ready(),
        )
        .await
        .map_err(|_| AutomationError::PhaseFailed {
            phase: "transport_readiness",
            reason: "timed out".to_string(),
        })?
        .map_err(|err| AutomationError::PhaseFailed {
            phase: "transport_readiness",
            reason: err.to_string(),
        })?;
        self.status.write().await.phases.transport_ready = true;

        // Phase 2: instantiate components and register them by priority.
        self.register_components()
            .await
            .map_err(|reason| AutomationError::PhaseFailed {
                phase: "component_registration",
                reason,
            })?;
        self.status.write().await.phases.components_registered = true;

        // Phase 3: agents are long-lived and start without a deadline.
        self.lifecycle
            .start_priority(PRIORITY_AGENTS)
            .await
            .map_err(|err| AutomationError::PhaseFailed {
                phase: "agent_startup",
                reason: err.to_string(),
            })?;
        self.status.write().await.phases.agents_started = true;

        // Phase 4: builders start under the component budget.
        tokio::time::timeout(
            self.init.component_start_timeout(),
            self.lifecycle.start_priority(PRIORITY_BUILDERS),
        )
        .await
        .map_err(|_| AutomationError::PhaseFailed {
            phase: "builder_startup",
            reason: "timed out".to_string(),
        })?
        .map_err(|err| AutomationError::PhaseFailed {
            phase: "builder_startup",
            reason: err.to_string(),
        })?;
        self.status.write().await.phases.builders_started = true;

        // Phase 5: base periodic tasks.
        self.start_base_tasks();
        self.status.write().await.phases.background_started = true;
        Ok(())
    }

    async fn register_components(&self) -> Result<(), String> {
        let mut agents = self.agents.write().await;
        let mut builders = self.builders.write().await;

        for entry in &self.config.agents {
            let agent_config = entry.to_agent_config().map_err(|err| err.to_string())?;
            let agent = ServiceAgent::new(agent_config, Arc::clone(&self.transport));
            self.lifecycle
                .register(Arc::new(agent.clone()), PRIORITY_AGENTS)
                .await
                .map_err(|err| err.to_string())?;
            agents.push(agent);
        }

        if self.config.builders.enabled {
            for entry in &self.config.builders.configs {
                let builder_config = entry.to_builder_config().map_err(|err| err.to_string())?;
                let builder = BlockBuilder::new(builder_config, Arc::clone(&self.transport));
                self.lifecycle
                    .register(Arc::new(builder.clone()), PRIORITY_BUILDERS)
                    .await
                    .map_err(|err| err.to_string())?;
                builders.push(builder);
            }
        }

        info!(
            agents = agents.len(),
            builders = builders.len(),
            "components registered"
        );
        Ok(())
    }

    fn start_base_tasks(&self) {
        let (tx, mut rx) = watch::channel(false);
        if let Ok(mut guard) = self.base_shutdown.lock() {
            if let Some(previous) = guard.replace(tx) {
                let _ = previous.send(true);
            }
        }
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BASE_STATUS_TICK);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match transport.metrics() {
                            Ok(metrics) => info!(
                                published = metrics.messages_published,
                                received = metrics.messages_received,
                                duplicates = metrics.duplicates_dropped,
                                subscriptions = metrics.subscriptions,
                                "transport status"
                            ),
                            Err(err) => warn!(error = %err, "transport metrics unavailable"),
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Stops and forgets all lifecycle-managed components
    async fn cleanup_partial(&self) {
        if let Ok(mut guard) = self.base_shutdown.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(true);
            }
        }
        self.lifecycle.clear().await;
        self.agents.write().await.clear();
        self.builders.write().await.clear();
    }

    /// Tears everything down
    pub async fn shutdown(&self) {
        info!("automation manager shutting down");
        self.cleanup_partial().await;
        let mut status = self.status.write().await;
        status.is_initialized = false;
        status.is_initializing = false;
    }

    /// State of a lifecycle-managed component, by id
    pub async fn component_state(
        &self,
        id: &str,
    ) -> Option<crate::lifecycle::ComponentState> {
        self.lifecycle.component_state(id).await
    }
}
