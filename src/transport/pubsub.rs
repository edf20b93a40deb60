//! Gossip overlay adapter with per-topic handler fan-out
//!
//! One physical overlay subscription exists per topic. Incoming messages
//! are wrapped as `pubsub` envelopes and dispatched in order to every
//! registered handler; a handler error or panic never prevents delivery to
//! the remaining handlers. Messages originating from the local peer are
//! suppressed before any handler sees them.
//!
//! The overlay itself sits behind [`GossipOverlay`]. Deployments bind a
//! gossipsub-backed host there; [`LoopbackOverlay`] provides an in-process
//! implementation for tests and single-node runs.

use crate::domain_types::TopicName;
use crate::messages::{now_millis, TransportEnvelope, MSG_TYPE_PUBSUB};
use crate::transport::codec::MessageCodec;
use crate::transport::{EnvelopeHandler, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, trace, warn};

/// Channel depth between an overlay and the engine's reader task
const OVERLAY_CHANNEL_CAPACITY: usize = 1024;

/// Gossip mesh parameters handed to the bound overlay implementation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipParams {
    /// Heartbeat interval of the mesh maintenance loop
    pub heartbeat_interval: Duration,
    /// Target mesh degree (D)
    pub mesh_degree: usize,
    /// Lower mesh degree bound (`D_lo`)
    pub mesh_degree_low: usize,
    /// Upper mesh degree bound (`D_hi`)
    pub mesh_degree_high: usize,
    /// How long fanout state is retained for topics we publish to
    pub fanout_ttl: Duration,
    /// Whether outgoing envelopes are signed
    pub sign_messages: bool,
    /// Whether inbound signature verification failures reject the message
    pub strict_verify: bool,
}

impl Default for GossipParams {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            mesh_degree: 6,
            mesh_degree_low: 4,
            mesh_degree_high: 12,
            fanout_ttl: Duration::from_secs(60),
            sign_messages: true,
            strict_verify: false,
        }
    }
}

/// A raw message delivered by the overlay
#[derive(Debug, Clone)]
pub struct OverlayMessage {
    /// Topic the message arrived on
    pub topic: String,
    /// Peer id of the originating node
    pub source: String,
    /// Raw wire bytes, shared without copying across subscribers
    pub data: Bytes,
}

/// Interface to the underlying gossip host
///
/// The P2P host, peer discovery, and mesh maintenance live behind this
/// trait; the auction core never touches them directly.
#[async_trait]
pub trait GossipOverlay: Send + Sync {
    /// Peer id of the local node
    fn local_peer(&self) -> String;

    /// Whether the overlay host is up
    fn is_running(&self) -> bool;

    /// Number of currently connected peers
    fn peer_count(&self) -> usize;

    /// Joins a topic, returning the message stream for it
    async fn join(&self, topic: &str) -> Result<mpsc::Receiver<OverlayMessage>, TransportError>;

    /// Leaves a topic, ending its message stream
    async fn leave(&self, topic: &str) -> Result<(), TransportError>;

    /// Publishes raw bytes on a topic, joining lazily if needed
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError>;
}

/// Shared in-process message fabric connecting [`LoopbackOverlay`] peers
///
/// Every attached overlay sees every publish on a topic, including its
/// own; self-suppression is the engine's responsibility, which keeps the
/// loopback faithful to a real gossip mesh.
#[derive(Debug, Default)]
pub struct LoopbackHub {
    topics: DashMap<String, Vec<(String, mpsc::Sender<OverlayMessage>)>>,
}

impl LoopbackHub {
    /// Creates an empty hub
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attaches a new peer to the hub
    #[must_use]
    pub fn attach(self: &Arc<Self>, peer_id: &str) -> Arc<LoopbackOverlay> {
        Arc::new(LoopbackOverlay {
            peer_id: peer_id.to_string(),
            hub: Arc::clone(self),
            running: AtomicBool::new(true),
        })
    }

    fn join(&self, topic: &str, peer_id: &str) -> mpsc::Receiver<OverlayMessage> {
        let (tx, rx) = mpsc::channel(OVERLAY_CHANNEL_CAPACITY);
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push((peer_id.to_string(), tx));
        rx
    }

    fn leave(&self, topic: &str, peer_id: &str) {
        if let Some(mut entry) = self.topics.get_mut(topic) {
            entry.retain(|(peer, _)| peer != peer_id);
        }
    }

    fn publish(&self, topic: &str, source: &str, data: &[u8]) {
        let Some(mut entry) = self.topics.get_mut(topic) else {
            return;
        };
        entry.retain(|(_, tx)| !tx.is_closed());
        let data = Bytes::copy_from_slice(data);
        for (peer, tx) in entry.iter() {
            let message = OverlayMessage {
                topic: topic.to_string(),
                source: source.to_string(),
                data: data.clone(),
            };
            if tx.try_send(message).is_err() {
                warn!(%topic, peer = %peer, "loopback delivery dropped, receiver full");
            }
        }
    }

    /// Number of peers attached to a topic
    #[must_use]
    pub fn topic_peer_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |entry| entry.len())
    }
}

/// In-process [`GossipOverlay`] backed by a shared [`LoopbackHub`]
#[derive(Debug)]
pub struct LoopbackOverlay {
    peer_id: String,
    hub: Arc<LoopbackHub>,
    running: AtomicBool,
}

impl LoopbackOverlay {
    /// Toggles the simulated host state; used by readiness tests
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

#[async_trait]
impl GossipOverlay for LoopbackOverlay {
    fn local_peer(&self) -> String {
        self.peer_id.clone()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn peer_count(&self) -> usize {
        // Peers other than ourselves that share at least one topic.
        let mut peers = std::collections::HashSet::new();
        for entry in &self.hub.topics {
            for (peer, _) in entry.value() {
                if peer != &self.peer_id {
                    peers.insert(peer.clone());
                }
            }
        }
        peers.len()
    }

    async fn join(&self, topic: &str) -> Result<mpsc::Receiver<OverlayMessage>, TransportError> {
        if !self.is_running() {
            return Err(TransportError::NotRunning);
        }
        Ok(self.hub.join(topic, &self.peer_id))
    }

    async fn leave(&self, topic: &str) -> Result<(), TransportError> {
        self.hub.leave(topic, &self.peer_id);
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_running() {
            return Err(TransportError::NotRunning);
        }
        self.hub.publish(topic, &self.peer_id, &data);
        Ok(())
    }
}

struct TopicSubscription {
    handlers: Arc<RwLock<Vec<EnvelopeHandler>>>,
    shutdown: watch::Sender<bool>,
}

/// Pub/sub engine: one physical subscription per topic, many handlers
pub struct PubSubEngine {
    overlay: Arc<dyn GossipOverlay>,
    params: GossipParams,
    subscriptions: Arc<RwLock<HashMap<String, TopicSubscription>>>,
    running: AtomicBool,
    received: Arc<AtomicU64>,
    physical_subs: AtomicUsize,
}

impl PubSubEngine {
    /// Creates an engine over the given overlay
    #[must_use]
    pub fn new(overlay: Arc<dyn GossipOverlay>, params: GossipParams) -> Self {
        Self {
            overlay,
            params,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            running: AtomicBool::new(false),
            received: Arc::new(AtomicU64::new(0)),
            physical_subs: AtomicUsize::new(0),
        }
    }

    /// The gossip parameters this engine was built with
    #[must_use]
    pub fn params(&self) -> &GossipParams {
        &self.params
    }

    /// Peer id of the local node
    #[must_use]
    pub fn local_peer(&self) -> String {
        self.overlay.local_peer()
    }

    /// Overlay peer count
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.overlay.peer_count()
    }

    /// Whether the engine has been started
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Envelopes delivered to handlers so far
    #[must_use]
    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Number of physical topic subscriptions
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Lock-free view of the physical subscription count
    #[must_use]
    pub fn physical_subscriptions(&self) -> usize {
        self.physical_subs.load(Ordering::Relaxed)
    }

    /// Marks the engine as running
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Stops the engine and cancels every subscription
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut subscriptions = self.subscriptions.write().await;
        self.physical_subs.store(0, Ordering::Relaxed);
        for (topic, subscription) in subscriptions.drain() {
            let _ = subscription.shutdown.send(true);
            if let Err(err) = self.overlay.leave(&topic).await {
                warn!(%topic, error = %err, "overlay leave failed during stop");
            }
        }
    }

    /// Publishes raw bytes on a topic
    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_running() {
            return Err(TransportError::NotRunning);
        }
        TopicName::try_new(topic.to_string()).map_err(|_| TransportError::InvalidTopic {
            name: topic.to_string(),
        })?;
        self.overlay
            .publish(topic, data)
            .await
            .map_err(|err| match err {
                TransportError::NotRunning => TransportError::NotRunning,
                other => TransportError::PublishFailed {
                    topic: topic.to_string(),
                    reason: other.to_string(),
                },
            })
    }

    /// Registers a handler for a topic
    ///
    /// The first subscription to a topic joins it on the overlay and spawns
    /// the reader task; later subscriptions only append to the handler
    /// list, which is append-only for the life of the subscription.
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: EnvelopeHandler,
    ) -> Result<(), TransportError> {
        TopicName::try_new(topic.to_string()).map_err(|_| TransportError::InvalidTopic {
            name: topic.to_string(),
        })?;

        let mut subscriptions = self.subscriptions.write().await;
        if let Some(existing) = subscriptions.get(topic) {
            existing.handlers.write().await.push(handler);
            debug!(%topic, "handler appended to existing subscription");
            return Ok(());
        }

        let receiver = self.overlay.join(topic).await?;
        let handlers = Arc::new(RwLock::new(vec![handler]));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        subscriptions.insert(
            topic.to_string(),
            TopicSubscription {
                handlers: Arc::clone(&handlers),
                shutdown: shutdown_tx,
            },
        );
        self.physical_subs.store(subscriptions.len(), Ordering::Relaxed);
        drop(subscriptions);

        self.spawn_reader(topic.to_string(), receiver, handlers, shutdown_rx);
        debug!(%topic, "physical subscription established");
        Ok(())
    }

    /// Cancels the physical subscription for a topic
    ///
    /// A later `subscribe` re-establishes it.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut subscriptions = self.subscriptions.write().await;
        let Some(subscription) = subscriptions.remove(topic) else {
            return Err(TransportError::NotSubscribed {
                topic: topic.to_string(),
            });
        };
        self.physical_subs.store(subscriptions.len(), Ordering::Relaxed);
        drop(subscriptions);
        let _ = subscription.shutdown.send(true);
        self.overlay.leave(topic).await
    }

    fn spawn_reader(
        &self,
        topic: String,
        mut receiver: mpsc::Receiver<OverlayMessage>,
        handlers: Arc<RwLock<Vec<EnvelopeHandler>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let local_peer = self.overlay.local_peer();
        let received = Arc::clone(&self.received);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = receiver.recv() => {
                        let Some(message) = message else { break };
                        if message.source == local_peer {
                            trace!(%topic, "suppressed self-originated message");
                            continue;
                        }
                        received.fetch_add(1, Ordering::Relaxed);
                        let envelope = wrap_overlay_message(&message);
                        dispatch(&topic, envelope, &handlers).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(%topic, "subscription reader exited");
        });
    }
}

/// Wraps a raw overlay delivery as a `pubsub` envelope
///
/// Downstream decoders re-parse the payload into the real envelope.
fn wrap_overlay_message(message: &OverlayMessage) -> TransportEnvelope {
    let timestamp = now_millis();
    let mut metadata = HashMap::new();
    metadata.insert("topic".to_string(), message.topic.clone());
    TransportEnvelope {
        id: MessageCodec::message_id(MSG_TYPE_PUBSUB, &message.source, timestamp, &message.data),
        message_type: MSG_TYPE_PUBSUB.to_string(),
        payload: message.data.to_vec(),
        timestamp,
        sender: message.source.clone(),
        metadata,
        signature: Vec::new(),
        priority: 0,
        ttl: 0,
    }
}

/// Fans an envelope out to every handler in registration order
///
/// Handler errors are logged; a panic is contained by the barrier and the
/// remaining handlers still run.
async fn dispatch(
    topic: &str,
    envelope: TransportEnvelope,
    handlers: &Arc<RwLock<Vec<EnvelopeHandler>>>,
) {
    let snapshot: Vec<EnvelopeHandler> = handlers.read().await.clone();
    for (index, handler) in snapshot.iter().enumerate() {
        let outcome = AssertUnwindSafe(handler(envelope.clone()))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(%topic, handler = index, error = %err, "handler returned error");
            }
            Err(_) => {
                error!(%topic, handler = index, "handler panicked; delivery continues");
            }
        }
    }
}
