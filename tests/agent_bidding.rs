//! Service agent pipeline: filter, bid decision, win tracking

use futures::FutureExt;
use intentmesh::agent::{
    BidStrategy, BidStrategyKind, IntentFilterConfig, ServiceAgent, ServiceAgentConfig,
};
use intentmesh::builder::{BlockBuilder, BlockBuilderConfig, MatchingAlgorithm};
use intentmesh::domain_types::{
    AgentId, BidCollectionWindowMs, BuilderId, MaxConcurrentIntents, MinBidsRequired,
};
use intentmesh::messages::{BidMessage, Intent, IntentTag, MatchResult, MatchStatus};
use intentmesh::transport::{LoopbackHub, Transport, TransportManager, TransportManagerConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn node(hub: &Arc<LoopbackHub>, peer: &str) -> Arc<TransportManager> {
    let manager = TransportManager::new(
        hub.attach(peer),
        format!("{peer}-key").into_bytes(),
        TransportManagerConfig::default(),
    );
    manager.start();
    manager
}

fn agent_config(id: &str) -> ServiceAgentConfig {
    ServiceAgentConfig {
        agent_id: AgentId::try_new(id.to_string()).unwrap(),
        agent_type: "trading".to_string(),
        capabilities: vec!["trade".to_string(), "swap".to_string()],
        specializations: vec!["trade-execution".to_string()],
        bid_strategy: BidStrategy {
            kind: BidStrategyKind::Balanced,
            base_fee: 10.0,
            profit_margin: 0.15,
            risk_factor: 0.0,
        },
        max_concurrent_intents: MaxConcurrentIntents::try_new(50).unwrap(),
        min_bid_amount: 0.01,
        max_bid_amount: 100_000.0,
        intent_filter: IntentFilterConfig {
            allowed_types: vec!["trade".to_string()],
            ..IntentFilterConfig::default()
        },
        intent_subtopics: Vec::new(),
    }
}

fn intent(id: &str, intent_type: &str) -> Intent {
    Intent {
        id: id.to_string(),
        intent_type: intent_type.to_string(),
        sender: "requester".to_string(),
        payload: b"order".to_vec(),
        priority: 5,
        ttl_ms: 60_000,
        max_duration_secs: 0,
        tags: vec![IntentTag {
            name: "execution-fee".to_string(),
            price: Some("5.00".to_string()),
            tradable: true,
        }],
        signature: Vec::new(),
    }
}

async fn wait_until<F>(budget: Duration, mut probe: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + budget;
    while !probe() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {budget:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn matching_intent_produces_a_published_bid() {
    let hub = LoopbackHub::new();
    let agent_node = node(&hub, "agent-node");
    let requester_node = node(&hub, "requester-node");

    let agent = ServiceAgent::new(
        agent_config("agent-1"),
        Arc::clone(&agent_node) as Arc<dyn Transport>,
    );
    agent.start().await.unwrap();

    let bids: Arc<Mutex<Vec<BidMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&bids);
    requester_node
        .subscribe_bids(Arc::new(move |bid: BidMessage| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(bid);
                Ok(())
            }
            .boxed()
        }))
        .await
        .unwrap();

    requester_node.publish_intent(&intent("I1", "trade")).await.unwrap();

    wait_until(Duration::from_secs(2), || !bids.lock().unwrap().is_empty()).await;
    let bid = bids.lock().unwrap()[0].clone();
    assert_eq!(bid.intent_id, "I1");
    assert_eq!(bid.agent_id, "agent-1");
    assert_eq!(bid.agent_type, "trading");
    assert!(bid.bid_amount.parse::<f64>().unwrap() > 0.0);
    assert!(bid.metadata.contains_key("confidence"));

    assert_eq!(agent.metrics().bids_submitted, 1);
    assert_eq!(agent.tracked_intents().await, 1);
}

#[tokio::test]
async fn filtered_intents_never_reach_the_bid_engine() {
    let hub = LoopbackHub::new();
    let agent_node = node(&hub, "agent-node");
    let requester_node = node(&hub, "requester-node");

    let agent = ServiceAgent::new(
        agent_config("agent-1"),
        Arc::clone(&agent_node) as Arc<dyn Transport>,
    );
    agent.start().await.unwrap();

    // "storage" fails the allowed-types filter.
    requester_node.publish_intent(&intent("I2", "storage")).await.unwrap();

    wait_until(Duration::from_secs(2), || {
        agent.metrics().intents_filtered == 1
    })
    .await;
    assert_eq!(agent.metrics().bids_submitted, 0);
    assert_eq!(agent.tracked_intents().await, 0);
}

#[tokio::test]
async fn match_results_update_wins_and_tracking() {
    let hub = LoopbackHub::new();
    let agent_node = node(&hub, "agent-node");
    let requester_node = node(&hub, "requester-node");

    let agent = ServiceAgent::new(
        agent_config("agent-1"),
        Arc::clone(&agent_node) as Arc<dyn Transport>,
    );
    agent.start().await.unwrap();

    requester_node.publish_intent(&intent("I3", "trade")).await.unwrap();
    wait_until(Duration::from_secs(2), || agent.metrics().bids_submitted == 1).await;

    // A win for this agent.
    requester_node
        .publish_match_result(&MatchResult {
            intent_id: "I3".to_string(),
            winning_agent: "agent-1".to_string(),
            winning_bid: "25.36".to_string(),
            total_bids: 3,
            matched_at: intentmesh::messages::now_millis(),
            status: MatchStatus::Matched,
            metadata: std::collections::HashMap::new(),
            block_builder_id: "builder-9".to_string(),
        })
        .await
        .unwrap();

    wait_until(Duration::from_secs(2), || agent.metrics().bids_won == 1).await;
    assert_eq!(agent.wins().await, vec!["I3".to_string()]);
    assert_eq!(agent.tracked_intents().await, 0);

    // A loss elsewhere still clears tracking but never counts as a win.
    requester_node.publish_intent(&intent("I4", "trade")).await.unwrap();
    wait_until(Duration::from_secs(2), || agent.metrics().bids_submitted == 2).await;
    requester_node
        .publish_match_result(&MatchResult {
            intent_id: "I4".to_string(),
            winning_agent: "someone-else".to_string(),
            winning_bid: "10".to_string(),
            total_bids: 2,
            matched_at: intentmesh::messages::now_millis(),
            status: MatchStatus::Matched,
            metadata: std::collections::HashMap::new(),
            block_builder_id: "builder-9".to_string(),
        })
        .await
        .unwrap();
    wait_until(Duration::from_secs(2), || {
        // tracked set drains once the loss is observed
        agent.metrics().bids_won == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(agent.tracked_intents().await, 0);
}

#[tokio::test]
async fn agent_and_builder_complete_a_full_auction_round() {
    let hub = LoopbackHub::new();
    let agent_node = node(&hub, "agent-node");
    let builder_node = node(&hub, "builder-node");
    let requester_node = node(&hub, "requester-node");

    let agent = ServiceAgent::new(
        agent_config("agent-1"),
        Arc::clone(&agent_node) as Arc<dyn Transport>,
    );
    agent.start().await.unwrap();

    let builder = BlockBuilder::new(
        BlockBuilderConfig {
            builder_id: BuilderId::try_new("builder-1".to_string()).unwrap(),
            matching_algorithm: MatchingAlgorithm::HighestBid,
            settlement_mode: "simulated".to_string(),
            bid_collection_window: BidCollectionWindowMs::try_new(5_000).unwrap(),
            max_concurrent_intents: MaxConcurrentIntents::try_new(10).unwrap(),
            min_bids_required: MinBidsRequired::try_new(1).unwrap(),
            intent_subtopics: Vec::new(),
        },
        Arc::clone(&builder_node) as Arc<dyn Transport>,
    );
    builder.start().await.unwrap();

    requester_node.publish_intent(&intent("I5", "trade")).await.unwrap();

    // intent -> agent bid -> builder match -> agent win observation
    wait_until(Duration::from_secs(3), || agent.metrics().bids_won == 1).await;
    let result = builder.completed_match("I5").await.unwrap();
    assert_eq!(result.status, MatchStatus::Matched);
    assert_eq!(result.winning_agent, "agent-1");
    assert_eq!(result.total_bids, 1);
    assert_eq!(agent.wins().await, vec!["I5".to_string()]);
}
