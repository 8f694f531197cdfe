//! In-process signal fan-out for tests and single-process sessions.
//!
//! Uses one tokio broadcast channel per connected runtime. Every submitted
//! signal is fanned out to all connected peers, including the sender, which
//! receives it flagged as a local echo.
//!
//! ```text
//! LocalRuntime A ──submit──┐
//!                          ▼
//!                   LocalSignalHub ── peers: client_id → Sender<RuntimeEvent>
//!                          │
//!          ┌───────────────┼───────────────┐
//!          ▼               ▼               ▼
//!      A (local)      B (remote)      C (remote)
//! ```
//!
//! With targeting enabled the hub behaves like a transport that routes
//! `targetClientId` signals to their recipient only; without it every peer
//! sees every signal and has to filter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, RwLock};
use uuid::Uuid;

use crate::error::LiveError;
use crate::protocol::StateSyncEvent;
use crate::runtime::{InboundSignal, RuntimeEvent, SignalRuntime};

/// Statistics for monitoring hub traffic.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub signals_sent: u64,
    pub signals_delivered: u64,
    pub active_peers: usize,
}

/// Lock-free counters, read via [`LocalSignalHub::stats`].
struct AtomicHubStats {
    signals_sent: AtomicU64,
    signals_delivered: AtomicU64,
}

impl AtomicHubStats {
    fn new() -> Self {
        Self {
            signals_sent: AtomicU64::new(0),
            signals_delivered: AtomicU64::new(0),
        }
    }
}

/// Record of one submitted signal.
#[derive(Debug, Clone)]
pub struct SentSignal {
    pub sender: String,
    pub event_type: String,
    pub content: StateSyncEvent,
}

/// Shared signal bus for every runtime of one session.
pub struct LocalSignalHub {
    /// Connected peers in this session
    peers: RwLock<HashMap<String, broadcast::Sender<RuntimeEvent>>>,

    /// Route targeted signals to their recipient only
    targeting: bool,

    /// Events buffered per runtime before lagging subscribers drop
    capacity: usize,

    /// Every submitted signal, in submission order
    sent: RwLock<Vec<SentSignal>>,

    atomic_stats: AtomicHubStats,
}

impl LocalSignalHub {
    /// Create a hub without per-client targeting.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self::build(capacity, false))
    }

    /// Create a hub that delivers targeted signals to their recipient only.
    pub fn with_targeting(capacity: usize) -> Arc<Self> {
        Arc::new(Self::build(capacity, true))
    }

    fn build(capacity: usize, targeting: bool) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            targeting,
            capacity,
            sent: RwLock::new(Vec::new()),
            atomic_stats: AtomicHubStats::new(),
        }
    }

    /// Create a runtime attached to this hub (initially disconnected).
    pub fn runtime(self: &Arc<Self>) -> Arc<LocalRuntime> {
        Arc::new(LocalRuntime::new(self.clone()))
    }

    async fn add_peer(&self, client_id: String, events: broadcast::Sender<RuntimeEvent>) {
        self.peers.write().await.insert(client_id, events);
    }

    async fn remove_peer(&self, client_id: &str) -> bool {
        self.peers.write().await.remove(client_id).is_some()
    }

    /// Fan a signal out to every connected peer.
    ///
    /// Returns the number of runtimes the signal was delivered to.
    async fn deliver(&self, sender: &str, event_type: &str, content: StateSyncEvent) -> Result<usize, LiveError> {
        let body = content.encode()?;
        let target = content.target_client_id.clone();

        self.sent.write().await.push(SentSignal {
            sender: sender.to_string(),
            event_type: event_type.to_string(),
            content,
        });
        self.atomic_stats.signals_sent.fetch_add(1, Ordering::Relaxed);

        let peers = self.peers.read().await;
        let mut delivered = 0;
        for (peer_id, events) in peers.iter() {
            let local = peer_id == sender;
            if self.targeting && !local {
                if let Some(target) = &target {
                    if target != peer_id {
                        continue;
                    }
                }
            }
            let signal = InboundSignal {
                client_id: Some(sender.to_string()),
                event_type: event_type.to_string(),
                content: body.clone(),
                local,
            };
            // A runtime with no subscribers simply drops the signal
            if events.send(RuntimeEvent::Signal(signal)).is_ok() {
                delivered += 1;
            }
        }
        self.atomic_stats
            .signals_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);

        Ok(delivered)
    }

    pub fn supports_targeting(&self) -> bool {
        self.targeting
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, client_id: &str) -> bool {
        self.peers.read().await.contains_key(client_id)
    }

    /// All signals submitted so far.
    pub async fn sent_signals(&self) -> Vec<SentSignal> {
        self.sent.read().await.clone()
    }

    /// Signals of one type submitted by one sender.
    pub async fn sent_by(&self, sender: &str, event_type: &str) -> Vec<SentSignal> {
        self.sent
            .read()
            .await
            .iter()
            .filter(|s| s.sender == sender && s.event_type == event_type)
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            signals_sent: self.atomic_stats.signals_sent.load(Ordering::Relaxed),
            signals_delivered: self.atomic_stats.signals_delivered.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }
}

/// A [`SignalRuntime`] backed by a [`LocalSignalHub`].
///
/// Every `connect()` assigns a fresh client id, the same way a real runtime
/// rotates ids on reconnect.
pub struct LocalRuntime {
    hub: Arc<LocalSignalHub>,
    events: broadcast::Sender<RuntimeEvent>,
    client_id: watch::Sender<Option<String>>,
    fail_signals: AtomicBool,
}

impl LocalRuntime {
    fn new(hub: Arc<LocalSignalHub>) -> Self {
        let (events, _) = broadcast::channel(hub.capacity.max(1));
        let (client_id, _) = watch::channel(None);
        Self {
            hub,
            events,
            client_id,
            fail_signals: AtomicBool::new(false),
        }
    }

    /// Join the hub under a new client id.
    pub async fn connect(&self) -> String {
        self.connect_as(Uuid::new_v4().to_string()).await
    }

    /// Join the hub under an explicit client id.
    pub async fn connect_as(&self, client_id: impl Into<String>) -> String {
        let client_id = client_id.into();
        if let Some(previous) = self.client_id.send_replace(Some(client_id.clone())) {
            self.hub.remove_peer(&previous).await;
        }
        self.hub.add_peer(client_id.clone(), self.events.clone()).await;
        let _ = self.events.send(RuntimeEvent::Connected(client_id.clone()));
        client_id
    }

    /// Leave the hub. Returns the client id that was dropped.
    pub async fn disconnect(&self) -> Option<String> {
        let previous = self.client_id.send_replace(None)?;
        self.hub.remove_peer(&previous).await;
        let _ = self.events.send(RuntimeEvent::Disconnected);
        Some(previous)
    }

    /// Drop the connection and rejoin under a new client id.
    pub async fn reconnect(&self) -> String {
        self.disconnect().await;
        self.connect().await
    }

    /// Make every subsequent `submit_signal` fail.
    pub fn set_fail_signals(&self, fail: bool) {
        self.fail_signals.store(fail, Ordering::Release);
    }

    pub fn hub(&self) -> &Arc<LocalSignalHub> {
        &self.hub
    }
}

#[async_trait]
impl SignalRuntime for LocalRuntime {
    fn client_id(&self) -> Option<String> {
        self.client_id.borrow().clone()
    }

    fn connected(&self) -> bool {
        self.client_id.borrow().is_some()
    }

    fn supports_targeting(&self) -> bool {
        self.hub.supports_targeting()
    }

    async fn submit_signal(&self, event_type: &str, content: StateSyncEvent) -> Result<(), LiveError> {
        if self.fail_signals.load(Ordering::Acquire) {
            return Err(LiveError::Signal("signal submission failed".into()));
        }
        let sender = self
            .client_id()
            .ok_or_else(|| LiveError::Signal("runtime is not connected".into()))?;
        self.hub.deliver(&sender, event_type, content).await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }
}
