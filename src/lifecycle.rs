//! Priority-ordered component lifecycle management
//!
//! Components register with a priority; `start_all` brings them up in
//! ascending priority groups (insertion order within a group) and halts on
//! the first failure. `stop_all` walks the reverse order, logging but
//! continuing past individual errors.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("component {component} failed to start: {reason}")]
    StartFailed { component: String, reason: String },

    #[error("component {component} failed to stop: {reason}")]
    StopFailed { component: String, reason: String },

    #[error("component {component} is already registered")]
    AlreadyRegistered { component: String },
}

/// State of a managed component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    /// Registered, not yet started
    Pending,
    /// Start in progress
    Starting,
    /// Started successfully
    Running,
    /// Stop in progress
    Stopping,
    /// Stopped
    Stopped,
    /// Start or stop failed
    Error,
}

/// A startable/stoppable component
#[async_trait]
pub trait Component: Send + Sync {
    /// Stable component identifier
    fn id(&self) -> String;

    /// Brings the component online
    async fn start(&self) -> Result<(), LifecycleError>;

    /// Takes the component offline
    async fn stop(&self) -> Result<(), LifecycleError>;
}

struct ComponentEntry {
    component: Arc<dyn Component>,
    priority: u32,
    state: ComponentState,
}

/// Ordered start/stop of registered components
#[derive(Default)]
pub struct LifecycleManager {
    entries: RwLock<Vec<ComponentEntry>>,
}

impl LifecycleManager {
    /// Creates an empty manager
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a component at the given priority
    pub async fn register(
        &self,
        component: Arc<dyn Component>,
        priority: u32,
    ) -> Result<(), LifecycleError> {
        let mut entries = self.entries.write().await;
        let id = component.id();
        if entries.iter().any(|entry| entry.component.id() == id) {
            return Err(LifecycleError::AlreadyRegistered { component: id });
        }
        entries.push(ComponentEntry {
            component,
            priority,
            state: ComponentState::Pending,
        });
        Ok(())
    }

    /// Number of registered components
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether no components are registered
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// State of a component by id
    pub async fn component_state(&self, id: &str) -> Option<ComponentState> {
        self.entries
            .read()
            .await
            .iter()
            .find(|entry| entry.component.id() == id)
            .map(|entry| entry.state)
    }

    /// Starts every pending component, lowest priority group first
    ///
    /// Halts and reports on the first failure; already-started components
    /// stay up.
    pub async fn start_all(&self) -> Result<(), LifecycleError> {
        let priorities: Vec<u32> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .map(|entry| entry.priority)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        };
        for priority in priorities {
            self.start_priority(priority).await?;
        }
        Ok(())
    }

    /// Starts the pending components of one priority group, insertion order
    pub async fn start_priority(&self, priority: u32) -> Result<(), LifecycleError> {
        let targets: Vec<(usize, Arc<dyn Component>)> = {
            let mut entries = self.entries.write().await;
            let mut targets = Vec::new();
            for (index, entry) in entries.iter_mut().enumerate() {
                if entry.priority == priority && entry.state == ComponentState::Pending {
                    entry.state = ComponentState::Starting;
                    targets.push((index, Arc::clone(&entry.component)));
                }
            }
            targets
        };

        for (index, component) in targets {
            let id = component.id();
            info!(component = %id, priority, "starting component");
            match component.start().await {
                Ok(()) => {
                    self.set_state(index, ComponentState::Running).await;
                }
                Err(err) => {
                    error!(component = %id, error = %err, "component start failed");
                    self.set_state(index, ComponentState::Error).await;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Stops every running component in reverse start order
    ///
    /// Individual failures are logged and do not stop the walk.
    pub async fn stop_all(&self) {
        let targets: Vec<(usize, Arc<dyn Component>)> = {
            let mut entries = self.entries.write().await;
            let mut targets: Vec<(usize, u32, Arc<dyn Component>)> = Vec::new();
            for (index, entry) in entries.iter_mut().enumerate() {
                if entry.state == ComponentState::Running {
                    entry.state = ComponentState::Stopping;
                    targets.push((index, entry.priority, Arc::clone(&entry.component)));
                }
            }
            // Reverse of start order: highest priority group first, then
            // reverse insertion order within the group.
            targets.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));
            targets
                .into_iter()
                .map(|(index, _, component)| (index, component))
                .collect()
        };

        for (index, component) in targets {
            let id = component.id();
            match component.stop().await {
                Ok(()) => {
                    info!(component = %id, "component stopped");
                    self.set_state(index, ComponentState::Stopped).await;
                }
                Err(err) => {
                    warn!(component = %id, error = %err, "component stop failed, continuing");
                    self.set_state(index, ComponentState::Error).await;
                }
            }
        }
    }

    /// Stops everything and forgets all registrations
    pub async fn clear(&self) {
        self.stop_all().await;
        self.entries.write().await.clear();
    }

    async fn set_state(&self, index: usize, state: ComponentState) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(index) {
            entry.state = state;
        }
    }
}
