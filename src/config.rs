//! Node configuration surface
//!
//! Loaded from a YAML file; every section has working defaults so an empty
//! file yields a runnable single-node configuration. Validation happens at
//! load time and again when entries are converted into runtime configs.

use crate::agent::{BidStrategy, IntentFilterConfig, ServiceAgentConfig};
use crate::builder::{BlockBuilderConfig, MatchingAlgorithm};
use crate::domain_types::{
    AgentId, BidCollectionWindowMs, BuilderId, DedupCacheSize, MaxConcurrentIntents,
    MaxMessageBytes, MaxRetries, MinBidsRequired, RetryDelayMs,
};
use crate::transport::{GossipParams, RouterConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file i/o failed at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse failed: {source}")]
    Parse {
        #[from]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Top-level node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Directory for the identity key and other node-local state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Automation and async-init settings
    #[serde(default)]
    pub automation: AutomationConfig,
    /// Transport and gossip settings
    #[serde(default)]
    pub transport: TransportConfig,
    /// Service agents to run on this node
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
    /// Block builders to run on this node
    #[serde(default)]
    pub builders: BuildersConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            automation: AutomationConfig::default(),
            transport: TransportConfig::default(),
            agents: Vec::new(),
            builders: BuildersConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Loads and validates a YAML config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation beyond what serde enforces
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut agent_ids = HashSet::new();
        for entry in &self.agents {
            if !agent_ids.insert(&entry.agent_id) {
                return Err(invalid("agents.agent_id", format!("duplicate id {}", entry.agent_id)));
            }
            entry.validate()?;
        }
        let mut builder_ids = HashSet::new();
        for entry in &self.builders.configs {
            if !builder_ids.insert(&entry.builder_id) {
                return Err(invalid(
                    "builders.configs.builder_id",
                    format!("duplicate id {}", entry.builder_id),
                ));
            }
            entry.validate()?;
        }
        Ok(())
    }
}

/// Automation section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutomationConfig {
    /// Master switch for the automation manager
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether initialization runs at node startup
    #[serde(default = "default_true")]
    pub auto_start: bool,
    /// Default log level when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Phased-init settings
    #[serde(default)]
    pub async_init: AsyncInitConfig,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_start: true,
            log_level: default_log_level(),
            async_init: AsyncInitConfig::default(),
        }
    }
}

/// Async initialization section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AsyncInitConfig {
    /// Whether phased init with retries is used
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Budget for the transport-readiness phase, milliseconds
    #[serde(default = "default_transport_ready_timeout_ms")]
    pub transport_ready_timeout_ms: u64,
    /// Budget for starting each builder group, milliseconds
    #[serde(default = "default_component_start_timeout_ms")]
    pub component_start_timeout_ms: u64,
    /// Full-cycle retry budget
    #[serde(default)]
    pub max_init_retries: MaxRetries,
    /// Backoff between init cycles, milliseconds
    #[serde(default)]
    pub retry_backoff_interval: RetryDelayMs,
}

fn default_transport_ready_timeout_ms() -> u64 {
    60_000
}

fn default_component_start_timeout_ms() -> u64 {
    30_000
}

impl Default for AsyncInitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            transport_ready_timeout_ms: default_transport_ready_timeout_ms(),
            component_start_timeout_ms: default_component_start_timeout_ms(),
            max_init_retries: MaxRetries::default(),
            retry_backoff_interval: RetryDelayMs::default(),
        }
    }
}

impl AsyncInitConfig {
    /// Budget for the transport-readiness phase
    #[must_use]
    pub fn transport_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_ready_timeout_ms)
    }

    /// Budget for starting the builder group
    #[must_use]
    pub fn component_start_timeout(&self) -> Duration {
        Duration::from_millis(self.component_start_timeout_ms)
    }
}

/// Transport section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    /// Serialized message size cap
    #[serde(default)]
    pub max_message_bytes: MaxMessageBytes,
    /// Dedup cache capacity
    #[serde(default)]
    pub dedup_cache_size: DedupCacheSize,
    /// Dedup entry lifetime, seconds
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
    /// Senders dropped by the router's sender filter
    #[serde(default)]
    pub blocked_senders: Vec<String>,
    /// Gossip mesh parameters
    #[serde(default)]
    pub gossip: GossipConfig,
}

fn default_dedup_ttl_secs() -> u64 {
    600
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: MaxMessageBytes::default(),
            dedup_cache_size: DedupCacheSize::default(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
            blocked_senders: Vec::new(),
            gossip: GossipConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Router settings derived from this section
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            cache_size: self.dedup_cache_size,
            entry_ttl: Duration::from_secs(self.dedup_ttl_secs),
            max_message_bytes: self.max_message_bytes,
            blocked_senders: self.blocked_senders.iter().cloned().collect(),
        }
    }

    /// Gossip parameters derived from this section
    #[must_use]
    pub fn gossip_params(&self) -> GossipParams {
        GossipParams {
            heartbeat_interval: Duration::from_millis(self.gossip.heartbeat_ms),
            mesh_degree: self.gossip.mesh_degree,
            mesh_degree_low: self.gossip.mesh_degree_low,
            mesh_degree_high: self.gossip.mesh_degree_high,
            fanout_ttl: Duration::from_secs(self.gossip.fanout_ttl_secs),
            sign_messages: self.gossip.sign_messages,
            strict_verify: self.gossip.strict_verify,
        }
    }
}

/// Gossip mesh subsection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GossipConfig {
    /// Mesh heartbeat interval, milliseconds
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Target mesh degree (D)
    #[serde(default = "default_mesh_degree")]
    pub mesh_degree: usize,
    /// Lower mesh degree bound
    #[serde(default = "default_mesh_degree_low")]
    pub mesh_degree_low: usize,
    /// Upper mesh degree bound
    #[serde(default = "default_mesh_degree_high")]
    pub mesh_degree_high: usize,
    /// Fanout retention, seconds
    #[serde(default = "default_fanout_ttl_secs")]
    pub fanout_ttl_secs: u64,
    /// Sign outgoing envelopes
    #[serde(default = "default_true")]
    pub sign_messages: bool,
    /// Reject inbound envelopes that fail signature verification
    #[serde(default)]
    pub strict_verify: bool,
}

fn default_heartbeat_ms() -> u64 {
    1000
}

fn default_mesh_degree() -> usize {
    6
}

fn default_mesh_degree_low() -> usize {
    4
}

fn default_mesh_degree_high() -> usize {
    12
}

fn default_fanout_ttl_secs() -> u64 {
    60
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: default_heartbeat_ms(),
            mesh_degree: default_mesh_degree(),
            mesh_degree_low: default_mesh_degree_low(),
            mesh_degree_high: default_mesh_degree_high(),
            fanout_ttl_secs: default_fanout_ttl_secs(),
            sign_messages: true,
            strict_verify: false,
        }
    }
}

/// One service agent entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentEntry {
    /// Agent identifier
    pub agent_id: String,
    /// Agent type tag
    pub agent_type: String,
    /// Declared capabilities
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Declared specializations
    #[serde(default)]
    pub specializations: Vec<String>,
    /// Bid strategy parameters
    #[serde(default)]
    pub bid_strategy: BidStrategy,
    /// Cap on concurrently tracked intents
    #[serde(default)]
    pub max_concurrent_intents: MaxConcurrentIntents,
    /// Smallest admissible bid amount
    #[serde(default = "default_min_bid_amount")]
    pub min_bid_amount: f64,
    /// Largest admissible bid amount
    #[serde(default = "default_max_bid_amount")]
    pub max_bid_amount: f64,
    /// Intent admission filter
    #[serde(default)]
    pub intent_filter: IntentFilterConfig,
    /// Extra intent broadcast subtopics to follow
    #[serde(default)]
    pub subtopics: Vec<String>,
}

fn default_min_bid_amount() -> f64 {
    0.01
}

fn default_max_bid_amount() -> f64 {
    1_000_000.0
}

impl AgentEntry {
    fn validate(&self) -> Result<(), ConfigError> {
        AgentId::try_new(self.agent_id.clone())
            .map_err(|err| invalid("agents.agent_id", err.to_string()))?;
        if self.agent_type.is_empty() {
            return Err(invalid("agents.agent_type", "must not be empty"));
        }
        if self.min_bid_amount > self.max_bid_amount {
            return Err(invalid(
                "agents.min_bid_amount",
                "must not exceed max_bid_amount",
            ));
        }
        Ok(())
    }

    /// Converts the entry into a runtime agent config
    pub fn to_agent_config(&self) -> Result<ServiceAgentConfig, ConfigError> {
        let agent_id = AgentId::try_new(self.agent_id.clone())
            .map_err(|err| invalid("agents.agent_id", err.to_string()))?;
        Ok(ServiceAgentConfig {
            agent_id,
            agent_type: self.agent_type.clone(),
            capabilities: self.capabilities.clone(),
            specializations: self.specializations.clone(),
            bid_strategy: self.bid_strategy.clone(),
            max_concurrent_intents: self.max_concurrent_intents,
            min_bid_amount: self.min_bid_amount,
            max_bid_amount: self.max_bid_amount,
            intent_filter: self.intent_filter.clone(),
            intent_subtopics: self.subtopics.clone(),
        })
    }
}

/// Builders section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildersConfig {
    /// Whether builders run on this node
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether builders start with the automation manager
    #[serde(default = "default_true")]
    pub auto_start: bool,
    /// Builder entries
    #[serde(default)]
    pub configs: Vec<BuilderEntry>,
}

impl Default for BuildersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_start: true,
            configs: Vec::new(),
        }
    }
}

/// One block builder entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuilderEntry {
    /// Builder identifier
    pub builder_id: String,
    /// Matching algorithm name
    #[serde(default = "default_matching_algorithm")]
    pub matching_algorithm: String,
    /// Settlement mode tag
    #[serde(default = "default_settlement_mode")]
    pub settlement_mode: String,
    /// Bid collection window, milliseconds
    #[serde(default)]
    pub bid_collection_window: BidCollectionWindowMs,
    /// Active-session cap
    #[serde(default)]
    pub max_concurrent_intents: MaxConcurrentIntents,
    /// Quorum for immediate matching
    #[serde(default)]
    pub min_bids_required: MinBidsRequired,
    /// Extra intent broadcast subtopics to follow
    #[serde(default)]
    pub subtopics: Vec<String>,
}

fn default_matching_algorithm() -> String {
    "highest_bid".to_string()
}

fn default_settlement_mode() -> String {
    "simulated".to_string()
}

impl BuilderEntry {
    fn validate(&self) -> Result<(), ConfigError> {
        BuilderId::try_new(self.builder_id.clone())
            .map_err(|err| invalid("builders.configs.builder_id", err.to_string()))?;
        Ok(())
    }

    /// Converts the entry into a runtime builder config
    pub fn to_builder_config(&self) -> Result<BlockBuilderConfig, ConfigError> {
        let builder_id = BuilderId::try_new(self.builder_id.clone())
            .map_err(|err| invalid("builders.configs.builder_id", err.to_string()))?;
        Ok(BlockBuilderConfig {
            builder_id,
            matching_algorithm: MatchingAlgorithm::from_name(&self.matching_algorithm),
            settlement_mode: self.settlement_mode.clone(),
            bid_collection_window: self.bid_collection_window,
            max_concurrent_intents: self.max_concurrent_intents,
            min_bids_required: self.min_bids_required,
            intent_subtopics: self.subtopics.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::BidStrategyKind;

    #[test]
    fn empty_yaml_yields_runnable_defaults() {
        let config: NodeConfig = serde_yaml::from_str("{}").unwrap();
        config.validate().unwrap();
        assert!(config.automation.enabled);
        assert!(config.automation.async_init.enabled);
        assert_eq!(config.automation.async_init.max_init_retries.as_u32(), 5);
        assert_eq!(config.transport.gossip.mesh_degree, 6);
        assert!(config.agents.is_empty());
        assert!(config.builders.configs.is_empty());
    }

    #[test]
    fn full_config_round_trips() {
        let yaml = r#"
data_dir: /tmp/intentmesh
automation:
  enabled: true
  auto_start: true
  log_level: debug
  async_init:
    enabled: true
    transport_ready_timeout_ms: 10000
    max_init_retries: 3
    retry_backoff_interval: 500
transport:
  dedup_ttl_secs: 120
  gossip:
    mesh_degree: 8
    strict_verify: true
agents:
  - agent_id: agent-1
    agent_type: trading
    capabilities: [trade, swap]
    bid_strategy:
      type: aggressive
      base_fee: 12.5
      profit_margin: 0.2
    intent_filter:
      allowed_types: [trade]
      min_priority: 3
builders:
  enabled: true
  configs:
    - builder_id: builder-1
      matching_algorithm: reputation_weighted
      bid_collection_window: 5000
      min_bids_required: 2
"#;
        let config: NodeConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        let agent = config.agents[0].to_agent_config().unwrap();
        assert_eq!(agent.agent_type, "trading");
        assert_eq!(agent.bid_strategy.kind, BidStrategyKind::Aggressive);
        assert_eq!(agent.intent_filter.min_priority, Some(3));

        let builder = config.builders.configs[0].to_builder_config().unwrap();
        assert_eq!(
            builder.matching_algorithm,
            MatchingAlgorithm::ReputationWeighted
        );
        assert_eq!(builder.min_bids_required.as_usize(), 2);
    }

    #[test]
    fn duplicate_agent_ids_are_rejected() {
        let yaml = r#"
agents:
  - agent_id: agent-1
    agent_type: trading
  - agent_id: agent-1
    agent_type: compute
"#;
        let config: NodeConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn bid_bounds_must_be_ordered() {
        let yaml = r#"
agents:
  - agent_id: agent-1
    agent_type: trading
    min_bid_amount: 100.0
    max_bid_amount: 1.0
"#;
        let config: NodeConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
