//! End-to-end block builder session scenarios over the loopback overlay

use intentmesh::builder::{
    BlockBuilder, BlockBuilderConfig, MatchingAlgorithm, SessionState,
};
use intentmesh::domain_types::{
    BidCollectionWindowMs, BuilderId, MaxConcurrentIntents, MinBidsRequired,
};
use intentmesh::messages::{now_millis, BidMessage, Intent, MatchResult, MatchStatus};
use intentmesh::transport::{LoopbackHub, Transport, TransportManager, TransportManagerConfig};
use std::collections::HashMap;
use std::sync::Arc;
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

fn builder_config(
    id: &str,
    algorithm: MatchingAlgorithm,
    window_ms: u64,
    min_bids: usize,
) -> BlockBuilderConfig {
    BlockBuilderConfig {
        builder_id: BuilderId::try_new(id.to_string()).unwrap(),
        matching_algorithm: algorithm,
        settlement_mode: "simulated".to_string(),
        bid_collection_window: BidCollectionWindowMs::try_new(window_ms).unwrap(),
        max_concurrent_intents: MaxConcurrentIntents::try_new(100).unwrap(),
        min_bids_required: MinBidsRequired::try_new(min_bids).unwrap(),
        intent_subtopics: Vec::new(),
    }
}

fn intent(id: &str) -> Intent {
    Intent {
        id: id.to_string(),
        intent_type: "trade".to_string(),
        sender: "requester".to_string(),
        payload: b"order book entry".to_vec(),
        priority: 5,
        ttl_ms: 60_000,
        max_duration_secs: 0,
        tags: Vec::new(),
        signature: Vec::new(),
    }
}

fn bid(intent_id: &str, agent: &str, amount: &str) -> BidMessage {
    BidMessage {
        intent_id: intent_id.to_string(),
        agent_id: agent.to_string(),
        bid_amount: amount.to_string(),
        capabilities: vec!["trade".to_string()],
        timestamp: now_millis(),
        agent_type: "trading".to_string(),
        metadata: HashMap::new(),
        signature: Vec::new(),
    }
}

async fn wait_for_result(
    builder: &BlockBuilder,
    intent_id: &str,
    budget: Duration,
) -> MatchResult {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if let Some(result) = builder.completed_match(intent_id).await {
            return result;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no result for {intent_id} within {budget:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn highest_bid_happy_path_matches_on_quorum() {
    let hub = LoopbackHub::new();
    let builder_node = node(&hub, "builder-node");
    let bidder_node = node(&hub, "bidder-node");

    let builder = BlockBuilder::new(
        builder_config("builder-1", MatchingAlgorithm::HighestBid, 5_000, 2),
        Arc::clone(&builder_node) as Arc<dyn Transport>,
    );
    builder.start().await.unwrap();

    bidder_node.publish_intent(&intent("I1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(builder.session_state("I1").await, Some(SessionState::Collecting));

    bidder_node.publish_bid(&bid("I1", "agent-a", "100")).await.unwrap();
    bidder_node.publish_bid(&bid("I1", "agent-b", "250")).await.unwrap();

    // Quorum triggers matching well before the 5s deadline.
    let result = wait_for_result(&builder, "I1", Duration::from_secs(2)).await;
    assert_eq!(result.status, MatchStatus::Matched);
    assert_eq!(result.winning_agent, "agent-b");
    assert_eq!(result.winning_bid, "250");
    assert_eq!(result.total_bids, 2);
    assert_eq!(result.block_builder_id, "builder-1");
    assert_eq!(result.metadata.get("algorithm").unwrap(), "highest_bid");

    // The session moved out of the active set on completion.
    assert_eq!(builder.session_state("I1").await, None);
    assert_eq!(builder.metrics().await.matches_completed, 1);
}

#[tokio::test]
async fn repeat_bid_from_one_agent_keeps_a_single_entry() {
    let hub = LoopbackHub::new();
    let builder_node = node(&hub, "builder-node");
    let bidder_node = node(&hub, "bidder-node");

    let builder = BlockBuilder::new(
        builder_config("builder-1", MatchingAlgorithm::HighestBid, 5_000, 2),
        Arc::clone(&builder_node) as Arc<dyn Transport>,
    );
    builder.start().await.unwrap();

    bidder_node.publish_intent(&intent("I2")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // agent-a revises its bid before quorum; the session keeps one entry
    // with the latest amount.
    bidder_node.publish_bid(&bid("I2", "agent-a", "100")).await.unwrap();
    bidder_node.publish_bid(&bid("I2", "agent-a", "300")).await.unwrap();
    bidder_node.publish_bid(&bid("I2", "agent-b", "50")).await.unwrap();

    let result = wait_for_result(&builder, "I2", Duration::from_secs(2)).await;
    assert_eq!(result.status, MatchStatus::Matched);
    assert_eq!(result.winning_agent, "agent-a");
    assert_eq!(result.winning_bid, "300");
    assert_eq!(result.total_bids, 2);

    let metrics = builder.metrics().await;
    assert_eq!(metrics.bids_received, 2);
    assert_eq!(metrics.bids_updated, 1);
}

#[tokio::test]
async fn deadline_without_quorum_expires_with_no_match() {
    let hub = LoopbackHub::new();
    let builder_node = node(&hub, "builder-node");
    let bidder_node = node(&hub, "bidder-node");

    let builder = BlockBuilder::new(
        builder_config("builder-1", MatchingAlgorithm::HighestBid, 300, 3),
        Arc::clone(&builder_node) as Arc<dyn Transport>,
    );
    builder.start().await.unwrap();

    bidder_node.publish_intent(&intent("I3")).await.unwrap();

    // The deadline scan runs every 2s; the empty session expires there.
    let result = wait_for_result(&builder, "I3", Duration::from_secs(5)).await;
    assert_eq!(result.status, MatchStatus::NoMatch);
    assert_eq!(result.total_bids, 0);
    assert_eq!(result.metadata.get("reason").unwrap(), "insufficient_bids");
    assert_eq!(builder.session_state("I3").await, Some(SessionState::Expired));
    assert_eq!(builder.metrics().await.no_matches, 1);
}

#[tokio::test]
async fn random_algorithm_never_selects_unparseable_bids() {
    let hub = LoopbackHub::new();
    let builder_node = node(&hub, "builder-node");
    let bidder_node = node(&hub, "bidder-node");

    let builder = BlockBuilder::new(
        builder_config("builder-1", MatchingAlgorithm::Random, 5_000, 3),
        Arc::clone(&builder_node) as Arc<dyn Transport>,
    );
    builder.start().await.unwrap();

    for round in 0..8 {
        let intent_id = format!("I4-{round}");
        bidder_node.publish_intent(&intent(&intent_id)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        bidder_node.publish_bid(&bid(&intent_id, "agent-100", "100")).await.unwrap();
        bidder_node.publish_bid(&bid(&intent_id, "agent-foo", "foo")).await.unwrap();
        bidder_node.publish_bid(&bid(&intent_id, "agent-200", "200")).await.unwrap();

        let result = wait_for_result(&builder, &intent_id, Duration::from_secs(2)).await;
        assert_eq!(result.status, MatchStatus::Matched);
        assert_ne!(result.winning_agent, "agent-foo");
        assert!(["agent-100", "agent-200"].contains(&result.winning_agent.as_str()));
    }
}

#[tokio::test]
async fn all_unparseable_bids_fail_matching_and_expire_the_session() {
    let hub = LoopbackHub::new();
    let builder_node = node(&hub, "builder-node");
    let bidder_node = node(&hub, "bidder-node");

    let builder = BlockBuilder::new(
        builder_config("builder-1", MatchingAlgorithm::HighestBid, 5_000, 1),
        Arc::clone(&builder_node) as Arc<dyn Transport>,
    );
    builder.start().await.unwrap();

    bidder_node.publish_intent(&intent("I5")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    bidder_node.publish_bid(&bid("I5", "agent-x", "garbage")).await.unwrap();

    let result = wait_for_result(&builder, "I5", Duration::from_secs(2)).await;
    assert_eq!(result.status, MatchStatus::MatchFailed);
    assert!(result.metadata.contains_key("error"));
    assert_eq!(builder.session_state("I5").await, Some(SessionState::Expired));
    assert_eq!(builder.metrics().await.matches_failed, 1);
}

#[tokio::test]
async fn duplicate_intent_broadcast_yields_one_session() {
    let hub = LoopbackHub::new();
    let builder_node = node(&hub, "builder-node");
    let bidder_node = node(&hub, "bidder-node");

    let builder = BlockBuilder::new(
        builder_config("builder-1", MatchingAlgorithm::HighestBid, 5_000, 2),
        Arc::clone(&builder_node) as Arc<dyn Transport>,
    );
    builder.start().await.unwrap();

    bidder_node.publish_intent(&intent("I6")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    bidder_node.publish_intent(&intent("I6")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(builder.active_session_count().await, 1);
    assert_eq!(builder.metrics().await.sessions_opened, 1);
    assert!(builder.metrics().await.intents_seen >= 1);
}

#[tokio::test]
async fn capacity_overflow_sheds_intents_and_reports_busy() {
    use intentmesh::builder::BuilderStatus;

    let hub = LoopbackHub::new();
    let builder_node = node(&hub, "builder-node");
    let bidder_node = node(&hub, "bidder-node");

    let mut config = builder_config("builder-1", MatchingAlgorithm::HighestBid, 5_000, 2);
    config.max_concurrent_intents = MaxConcurrentIntents::try_new(1).unwrap();
    let builder = BlockBuilder::new(config, Arc::clone(&builder_node) as Arc<dyn Transport>);
    builder.start().await.unwrap();

    bidder_node.publish_intent(&intent("I7")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    bidder_node.publish_intent(&intent("I8")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(builder.active_session_count().await, 1);
    assert_eq!(builder.status().await, BuilderStatus::Busy);
    assert_eq!(builder.session_state("I8").await, None);
}
