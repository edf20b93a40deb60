//! # intentmesh - decentralized intent-broadcast and auction core
//!
//! Participants broadcast *intents* (requests for service) over a gossip
//! overlay; *service agents* evaluate them and submit bids; *block
//! builders* collect bids per intent over a bounded window, run a matching
//! algorithm, and publish the result.
//!
//! ## Architecture
//!
//! ```text
//! overlay -> pub/sub engine -> message router -> transport manager
//!                                                   |         |
//!                                            service agent  block builder
//!                                              (bids)        (sessions,
//!                                                             matching)
//! ```
//!
//! - [`transport`]: codec, topic registry, dedup/filter router, pub/sub
//!   fan-out, the lazy binding wrapper, and the readiness checker
//! - [`builder`]: per-intent sessions and the matching engine
//! - [`agent`]: the intent filter pipeline and bid-decision engine
//! - [`automation`]: phased, retrying startup over the [`lifecycle`]
//!   manager
//!
//! The P2P host itself (discovery, mesh maintenance) stays behind the
//! [`transport::GossipOverlay`] trait; [`transport::LoopbackHub`] provides
//! an in-process overlay for tests and single-node runs.

pub mod agent;
pub mod automation;
pub mod builder;
pub mod commitment;
pub mod config;
pub mod domain_types;
pub mod identity;
pub mod lifecycle;
pub mod messages;
pub mod observability;
pub mod transport;

pub use agent::{ServiceAgent, ServiceAgentConfig};
pub use automation::{AsyncAutomationManager, AutomationError, InitStatus};
pub use builder::{BlockBuilder, BlockBuilderConfig, MatchingAlgorithm};
pub use config::{ConfigError, NodeConfig};
pub use identity::IdentityKey;
pub use lifecycle::{Component, ComponentState, LifecycleError, LifecycleManager};
pub use messages::{BidMessage, Intent, IntentTag, MatchResult, MatchStatus, TransportEnvelope};
pub use transport::{
    Transport, TransportError, TransportManager, TransportManagerConfig, TransportMetrics,
};
