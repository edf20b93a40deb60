//! Phased async initialization: retries, ordering, terminal failure

use intentmesh::automation::AsyncAutomationManager;
use intentmesh::config::{
    AgentEntry, AsyncInitConfig, AutomationConfig, BuilderEntry, BuildersConfig, NodeConfig,
};
use intentmesh::domain_types::{
    BidCollectionWindowMs, MaxConcurrentIntents, MaxRetries, MinBidsRequired, RetryDelayMs,
};
use intentmesh::lifecycle::ComponentState;
use intentmesh::transport::{
    GossipOverlay, LoopbackHub, LoopbackOverlay, ReadinessChecker, ReadinessConfig, Transport,
    TransportManager, TransportManagerConfig,
};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    overlay: Arc<LoopbackOverlay>,
    manager: Arc<TransportManager>,
    automation: Arc<AsyncAutomationManager>,
}

fn test_config() -> NodeConfig {
    NodeConfig {
        automation: AutomationConfig {
            enabled: true,
            auto_start: true,
            log_level: "debug".to_string(),
            async_init: AsyncInitConfig {
                enabled: true,
                transport_ready_timeout_ms: 2_000,
                component_start_timeout_ms: 2_000,
                max_init_retries: MaxRetries::try_new(5).unwrap(),
                retry_backoff_interval: RetryDelayMs::try_new(100).unwrap(),
            },
        },
        agents: vec![AgentEntry {
            agent_id: "agent-1".to_string(),
            agent_type: "trading".to_string(),
            capabilities: vec!["trade".to_string()],
            specializations: Vec::new(),
            bid_strategy: intentmesh::agent::BidStrategy::default(),
            max_concurrent_intents: MaxConcurrentIntents::try_new(10).unwrap(),
            min_bid_amount: 0.01,
            max_bid_amount: 1_000.0,
            intent_filter: intentmesh::agent::IntentFilterConfig::default(),
            subtopics: Vec::new(),
        }],
        builders: BuildersConfig {
            enabled: true,
            auto_start: true,
            configs: vec![BuilderEntry {
                builder_id: "builder-1".to_string(),
                matching_algorithm: "highest_bid".to_string(),
                settlement_mode: "simulated".to_string(),
                bid_collection_window: BidCollectionWindowMs::try_new(1_000).unwrap(),
                max_concurrent_intents: MaxConcurrentIntents::try_new(10).unwrap(),
                min_bids_required: MinBidsRequired::try_new(1).unwrap(),
                subtopics: Vec::new(),
            }],
        },
        ..NodeConfig::default()
    }
}

fn fixture(config: NodeConfig, max_readiness_retries: u32) -> Fixture {
    let hub = LoopbackHub::new();
    let overlay = hub.attach("automation-peer");
    let manager = TransportManager::new(
        Arc::clone(&overlay) as Arc<dyn GossipOverlay>,
        b"automation-key".to_vec(),
        TransportManagerConfig::default(),
    );
    manager.start();

    let readiness = ReadinessChecker::new(
        Arc::clone(&manager) as Arc<dyn Transport>,
        Arc::clone(&overlay) as Arc<dyn GossipOverlay>,
        ReadinessConfig {
            max_retries: MaxRetries::try_new(max_readiness_retries).unwrap(),
            retry_interval: RetryDelayMs::try_new(10).unwrap(),
            max_wait_time: Duration::from_secs(1),
        },
    );
    let automation = AsyncAutomationManager::new(
        config,
        Arc::clone(&manager) as Arc<dyn Transport>,
        readiness,
    );
    Fixture {
        overlay,
        manager,
        automation,
    }
}

#[tokio::test]
async fn init_retries_until_the_overlay_comes_up() {
    let fixture = fixture(test_config(), 1);
    // Two full cycles fail before the host appears.
    fixture.overlay.set_running(false);

    let overlay = Arc::clone(&fixture.overlay);
    let automation = Arc::clone(&fixture.automation);
    tokio::spawn(async move {
        loop {
            if automation.status().await.retry_count >= 2 {
                overlay.set_running(true);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    fixture.automation.initialize().await.unwrap();

    let status = fixture.automation.status().await;
    assert!(status.is_initialized);
    assert!(!status.is_initializing);
    assert_eq!(status.retry_count, 2);
    assert!(status.phases.transport_ready);
    assert!(status.phases.components_registered);
    assert!(status.phases.agents_started);
    assert!(status.phases.builders_started);
    assert!(status.phases.background_started);

    // Agents (priority 1) and builders (priority 2) are both running.
    assert_eq!(
        fixture.automation.component_state("agent-1").await,
        Some(ComponentState::Running)
    );
    assert_eq!(
        fixture.automation.component_state("builder-1").await,
        Some(ComponentState::Running)
    );
    let agents = fixture.automation.agents().await;
    assert_eq!(agents.len(), 1);
    assert!(agents[0].is_running());
}

#[tokio::test]
async fn exhausted_retries_surface_on_the_error_channel() {
    let mut config = test_config();
    config.automation.async_init.max_init_retries = MaxRetries::try_new(1).unwrap();
    config.automation.async_init.retry_backoff_interval = RetryDelayMs::try_new(10).unwrap();
    let fixture = fixture(config, 1);
    fixture.overlay.set_running(false);

    let mut errors = fixture.automation.take_init_errors().await.unwrap();
    let result = fixture.automation.initialize().await;
    assert!(result.is_err());

    let status = fixture.automation.status().await;
    assert!(!status.is_initialized);
    assert!(!status.is_initializing);
    assert_eq!(status.retry_count, 2);
    assert!(status.last_error.is_some());

    let terminal = errors.try_recv().unwrap();
    assert!(terminal.contains("initialization failed"));
}

#[tokio::test]
async fn disabled_automation_refuses_to_initialize() {
    let mut config = test_config();
    config.automation.enabled = false;
    let fixture = fixture(config, 1);
    assert!(fixture.automation.initialize().await.is_err());
}

#[tokio::test]
async fn shutdown_stops_components_and_resets_state() {
    let fixture = fixture(test_config(), 3);
    fixture.automation.initialize().await.unwrap();
    assert!(fixture.automation.status().await.is_initialized);

    fixture.automation.shutdown().await;
    let status = fixture.automation.status().await;
    assert!(!status.is_initialized);
    assert_eq!(fixture.automation.agents().await.len(), 0);
    assert_eq!(fixture.automation.builders().await.len(), 0);

    fixture.manager.stop().await;
    assert!(!fixture.manager.is_running());
}
