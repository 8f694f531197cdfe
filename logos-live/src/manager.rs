//! Live object manager: one per session.
//!
//! Owns the event store and the runtime subscription, filters incoming
//! signals, and hands accepted updates to the container synchronizer.
//!
//! ```text
//! SignalRuntime ──RuntimeEvent──► dispatcher task
//!                                   │ Signal     ─► on_received_signal ─► store ─► synchronizer
//!                                   │ Connected  ─► synchronizer.on_connected
//!                                   └ Disconnected
//! ```
//!
//! Runtime events are handled one at a time in arrival order, so a client-id
//! migration always finishes before the next signal is looked at.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::clock::{MonotonicClock, TimestampProvider};
use crate::config::SyncConfig;
use crate::error::LiveError;
use crate::host::SessionHost;
use crate::protocol::{EventType, LiveEvent, ManagerEvent, StateSyncEvent};
use crate::runtime::{InboundSignal, RuntimeEvent, SignalRuntime};
use crate::store::SharedEventStore;
use crate::synchronizer::{ContainerSynchronizer, ObjectHandlers};

/// Builder for [`LiveObjectManager`].
pub struct ManagerBuilder {
    runtime: Arc<dyn SignalRuntime>,
    config: SyncConfig,
    host: Option<Arc<dyn SessionHost>>,
    clock: Option<Arc<dyn TimestampProvider>>,
}

impl ManagerBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Session host to register client ids with.
    pub fn host(mut self, host: Arc<dyn SessionHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Timestamp source; defaults to [`MonotonicClock`].
    pub fn clock(mut self, clock: Arc<dyn TimestampProvider>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Create the manager. The dispatcher starts with
    /// [`LiveObjectManager::start`] or the first registration.
    pub fn build(self) -> LiveObjectManager {
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let store = SharedEventStore::new(events.clone());
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));

        LiveObjectManager {
            inner: Arc::new(ManagerInner {
                runtime: self.runtime,
                host: self.host,
                clock,
                can_send_background_updates: Arc::new(AtomicBool::new(
                    self.config.can_send_background_updates,
                )),
                config: self.config,
                store,
                events,
                synchronizer: OnceLock::new(),
                dispatcher: Mutex::new(None),
            }),
        }
    }
}

struct ManagerInner {
    runtime: Arc<dyn SignalRuntime>,
    host: Option<Arc<dyn SessionHost>>,
    clock: Arc<dyn TimestampProvider>,
    config: SyncConfig,
    can_send_background_updates: Arc<AtomicBool>,
    store: SharedEventStore,
    events: broadcast::Sender<ManagerEvent>,
    synchronizer: OnceLock<Arc<ContainerSynchronizer>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Ok(mut dispatcher) = self.dispatcher.try_lock() {
            if let Some(handle) = dispatcher.take() {
                handle.abort();
            }
        }
    }
}

/// Cache and router for every live object in a session.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LiveObjectManager {
    inner: Arc<ManagerInner>,
}

impl LiveObjectManager {
    /// Manager bound to `runtime` with the given configuration.
    pub fn new(runtime: Arc<dyn SignalRuntime>, config: SyncConfig) -> Self {
        Self::builder(runtime).config(config).build()
    }

    /// Start configuring a manager for `runtime`.
    pub fn builder(runtime: Arc<dyn SignalRuntime>) -> ManagerBuilder {
        ManagerBuilder {
            runtime,
            config: SyncConfig::default(),
            host: None,
            clock: None,
        }
    }

    // ─── Lifecycle ──────────────────────────────────────────────────

    /// Subscribe to the runtime. Calling it again is a no-op.
    pub async fn start(&self) {
        let mut dispatcher = self.inner.dispatcher.lock().await;
        if dispatcher.is_some() {
            return;
        }

        let events = self.inner.runtime.subscribe();
        let manager = Arc::downgrade(&self.inner);
        *dispatcher = Some(tokio::spawn(dispatch_loop(manager, events)));
        log::info!("Live object manager started");
    }

    /// Unsubscribe from the runtime and drop all cached events.
    pub async fn stop(&self) {
        if let Some(handle) = self.inner.dispatcher.lock().await.take() {
            handle.abort();
        }
        self.inner.store.clear().await;
        log::info!("Live object manager stopped");
    }

    /// Whether the dispatcher task is alive.
    pub async fn is_running(&self) -> bool {
        self.inner.dispatcher.lock().await.is_some()
    }

    fn synchronizer_or_init(&self) -> Arc<ContainerSynchronizer> {
        let inner = &self.inner;
        inner
            .synchronizer
            .get_or_init(|| {
                ContainerSynchronizer::new(
                    inner.runtime.clone(),
                    inner.host.clone(),
                    inner.clock.clone(),
                    inner.store.clone(),
                    inner.config.background_update_interval,
                    inner.config.throttle_delay,
                    inner.can_send_background_updates.clone(),
                )
            })
            .clone()
    }

    /// The session's synchronizer, once an object has been registered.
    pub fn synchronizer(&self) -> Option<Arc<ContainerSynchronizer>> {
        self.inner.synchronizer.get().cloned()
    }

    async fn handle_runtime_event(&self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::Signal(signal) => self.on_received_signal(signal).await,
            RuntimeEvent::Connected(client_id) => {
                if let Some(sync) = self.synchronizer() {
                    sync.on_connected(&client_id).await;
                }
            }
            RuntimeEvent::Disconnected => log::debug!("Runtime disconnected"),
        }
    }

    // ─── Objects ────────────────────────────────────────────────────

    /// Register a live object, seed its initial state and announce it.
    ///
    /// Starts the manager if needed and waits for the runtime to connect.
    pub async fn register_object(
        &self,
        id: &str,
        initial_state: Value,
        handlers: Arc<dyn ObjectHandlers>,
        enable_background_updates: bool,
    ) -> Result<(), LiveError> {
        self.start().await;
        let sync = self.synchronizer_or_init();
        sync.register_object(id, handlers, enable_background_updates)
            .await?;

        let client_id = match self.inner.runtime.wait_for_client_id().await {
            Ok(client_id) => client_id,
            Err(e) => {
                sync.unregister_object(id).await;
                return Err(e);
            }
        };
        self.inner
            .store
            .update_event_locally_in_store(id, LiveEvent::initial(client_id.clone(), initial_state))
            .await;
        sync.announce_registration(id, &client_id).await;

        log::debug!("Registered live object {id}");
        Ok(())
    }

    /// Returns `false` if `id` wasn't registered.
    pub async fn unregister_object(&self, id: &str) -> bool {
        match self.synchronizer() {
            Some(sync) => sync.unregister_object(id).await,
            None => false,
        }
    }

    /// Send new state for `object_id` now and cache it as the local state.
    pub async fn send_event_for_object(&self, object_id: &str, data: Value) -> Result<LiveEvent<Value>, LiveError> {
        let sync = self
            .synchronizer()
            .ok_or_else(|| LiveError::NotRegistered(object_id.to_string()))?;
        let event = sync.send_event_for_object(object_id, data).await?;
        self.inner
            .store
            .update_event_locally_in_store(object_id, event.clone())
            .await;
        Ok(event)
    }

    /// Like [`send_event_for_object`](Self::send_event_for_object), coalesced
    /// with other sends inside the throttle window.
    pub async fn send_throttled_event_for_object(
        &self,
        object_id: &str,
        data: Value,
    ) -> Result<LiveEvent<Value>, LiveError> {
        let sync = self
            .synchronizer()
            .ok_or_else(|| LiveError::NotRegistered(object_id.to_string()))?;
        let event = sync.send_throttled_event_for_object(object_id, data).await?;
        self.inner
            .store
            .update_event_locally_in_store(object_id, event.clone())
            .await;
        Ok(event)
    }

    // ─── Incoming ───────────────────────────────────────────────────

    /// Filter, store and dispatch one runtime signal.
    ///
    /// Local echoes, anonymous signals, non state-sync traffic and anything
    /// that fails to decode are dropped silently.
    pub async fn on_received_signal(&self, signal: InboundSignal) {
        if signal.local {
            return;
        }
        let Some(sender) = signal.client_id else {
            return;
        };
        let Some(evt_type) = EventType::parse(&signal.event_type) else {
            return;
        };
        let content = match StateSyncEvent::decode(&signal.content) {
            Ok(content) if content.name == evt_type => content,
            Ok(_) | Err(_) => return,
        };

        if !self.inner.runtime.supports_targeting() {
            if let Some(target) = &content.target_client_id {
                if self.inner.runtime.client_id().as_deref() != Some(target.as_str()) {
                    return;
                }
            }
        }

        let sync = self.synchronizer();
        for (object_id, update) in content.data {
            let event = LiveEvent {
                client_id: sender.clone(),
                timestamp: update.timestamp,
                name: evt_type,
                data: update.data,
                target_client_id: content.target_client_id.clone(),
            };
            if !self
                .inner
                .store
                .update_event_locally_in_store(&object_id, event.clone())
                .await
            {
                continue;
            }
            if let Some(sync) = &sync {
                sync.on_receive_update(&object_id, event.clone(), false).await;
            }
            // No subscribers is fine
            let _ = self.inner.events.send(ManagerEvent::Update {
                object_id,
                event,
                local: false,
            });
        }

        // Answer a newcomer with our current state, addressed to it
        if evt_type == EventType::Connect {
            if let Some(sync) = sync {
                tokio::spawn(async move {
                    sync.on_send_background_updates(Some(&sender)).await;
                });
            }
        }
    }

    // ─── Store access ───────────────────────────────────────────────

    /// Move cached events from `old_client_id` to `new_client_id`.
    pub async fn client_id_did_change(&self, old_client_id: &str, new_client_id: &str) -> usize {
        self.inner
            .store
            .client_id_did_change(old_client_id, new_client_id)
            .await
    }

    /// Most recent event for `object_id` from any sender.
    pub async fn latest_event_for_object(&self, object_id: &str) -> Option<LiveEvent<Value>> {
        self.inner.store.latest_event_for_object(object_id).await
    }

    /// Latest event `client_id` sent for `object_id`.
    pub async fn latest_event_for_object_client(&self, object_id: &str, client_id: &str) -> Option<LiveEvent<Value>> {
        self.inner
            .store
            .latest_event_for_object_client(object_id, client_id)
            .await
    }

    /// Every sender's latest event for `object_id`, newest first.
    pub async fn events_for_object(&self, object_id: &str) -> Vec<LiveEvent<Value>> {
        self.inner.store.events_for_object(object_id).await
    }

    /// Accepted remote updates and first-seen senders.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    // ─── Settings ───────────────────────────────────────────────────

    /// Turn periodic and connect-reply broadcasts on or off.
    pub fn set_can_send_background_updates(&self, enabled: bool) {
        self.inner
            .can_send_background_updates
            .store(enabled, Ordering::Release);
    }

    /// Get the current background-update switch.
    pub fn can_send_background_updates(&self) -> bool {
        self.inner.can_send_background_updates.load(Ordering::Acquire)
    }

    pub fn runtime(&self) -> &Arc<dyn SignalRuntime> {
        &self.inner.runtime
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }
}

async fn dispatch_loop(manager: Weak<ManagerInner>, mut events: broadcast::Receiver<RuntimeEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(inner) = manager.upgrade() else {
                    break;
                };
                LiveObjectManager { inner }.handle_runtime_event(event).await;
            }
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("Live object manager lagged, {skipped} runtime events dropped");
                // One of them may have been a Connected
                let Some(inner) = manager.upgrade() else {
                    break;
                };
                if let Some(sync) = inner.synchronizer.get().cloned() {
                    sync.resync_client_id().await;
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{LocalRuntime, LocalSignalHub};
    use crate::clock::ManualClock;
    use crate::protocol::{ObjectUpdate, StateSyncEventContent};
    use crate::synchronizer::UpdateDecision;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct Recorder {
        seen: std::sync::Mutex<Vec<LiveEvent<Value>>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<LiveEvent<Value>> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ObjectHandlers for Recorder {
        async fn update_state(&self, event: &LiveEvent<Value>, _sender_id: &str, _local: bool) -> UpdateDecision {
            self.seen.lock().unwrap().push(event.clone());
            UpdateDecision::Applied
        }

        async fn local_user_can_send(&self, _connecting: bool) -> bool {
            true
        }
    }

    fn manager(runtime: Arc<LocalRuntime>) -> LiveObjectManager {
        LiveObjectManager::builder(runtime)
            .config(SyncConfig::default().with_background_interval(Duration::from_secs(60)))
            .clock(Arc::new(ManualClock::new(10)))
            .build()
    }

    fn remote_signal(sender: &str, name: EventType, updates: &[(&str, Value, u64)], target: Option<&str>) -> InboundSignal {
        let content: StateSyncEventContent = updates
            .iter()
            .map(|(id, data, ts)| (id.to_string(), ObjectUpdate::new(data.clone(), *ts)))
            .collect();
        let mut event = LiveEvent::new(sender, 99, name, content);
        event.target_client_id = target.map(str::to_string);
        InboundSignal {
            client_id: Some(sender.to_string()),
            event_type: name.as_str().to_string(),
            content: event.encode().unwrap(),
            local: false,
        }
    }

    #[tokio::test]
    async fn test_register_seeds_initial_state() {
        let hub = LocalSignalHub::new(64);
        let runtime = hub.runtime();
        let me = runtime.connect_as("me").await;
        let manager = manager(runtime);

        manager
            .register_object("obj", json!({"n": 0}), Recorder::new(), true)
            .await
            .unwrap();

        let seeded = manager.latest_event_for_object_client("obj", &me).await.unwrap();
        assert_eq!(seeded.timestamp, 0);
        assert_eq!(seeded.data, json!({"n": 0}));
        assert!(manager.is_running().await);
        assert_eq!(hub.sent_by(&me, "connect").await.len(), 1);
    }

    #[tokio::test]
    async fn test_register_waits_for_connection() {
        let hub = LocalSignalHub::new(64);
        let runtime = hub.runtime();
        let manager = manager(runtime.clone());

        let registering = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .register_object("obj", json!(1), Recorder::new(), true)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!registering.is_finished());

        let me = runtime.connect_as("late").await;
        registering.await.unwrap().unwrap();
        assert!(manager.latest_event_for_object_client("obj", &me).await.is_some());
    }

    #[tokio::test]
    async fn test_received_signal_filters() {
        let hub = LocalSignalHub::new(64);
        let runtime = hub.runtime();
        runtime.connect_as("me").await;
        let manager = manager(runtime);
        let recorder = Recorder::new();
        manager
            .register_object("obj", json!(0), recorder.clone(), true)
            .await
            .unwrap();

        // Local echo
        let mut local = remote_signal("peer", EventType::Update, &[("obj", json!(1), 5)], None);
        local.local = true;
        manager.on_received_signal(local).await;

        // No sender
        let mut anonymous = remote_signal("peer", EventType::Update, &[("obj", json!(1), 5)], None);
        anonymous.client_id = None;
        manager.on_received_signal(anonymous).await;

        // Malformed body
        manager
            .on_received_signal(InboundSignal {
                client_id: Some("peer".into()),
                event_type: "update".into(),
                content: json!({"data": "nope"}),
                local: false,
            })
            .await;

        // Addressed to someone else
        manager
            .on_received_signal(remote_signal("peer", EventType::Update, &[("obj", json!(1), 5)], Some("other")))
            .await;

        assert!(recorder.seen().is_empty());
        assert!(manager.latest_event_for_object_client("obj", "peer").await.is_none());

        // Addressed to us
        manager
            .on_received_signal(remote_signal("peer", EventType::Update, &[("obj", json!(2), 6)], Some("me")))
            .await;
        assert_eq!(recorder.seen().len(), 1);
        assert_eq!(recorder.seen()[0].data, json!(2));
    }

    #[tokio::test]
    async fn test_stale_update_not_dispatched() {
        let hub = LocalSignalHub::new(64);
        let runtime = hub.runtime();
        runtime.connect_as("me").await;
        let manager = manager(runtime);
        let recorder = Recorder::new();
        manager
            .register_object("obj", json!(0), recorder.clone(), true)
            .await
            .unwrap();
        let mut updates = manager.subscribe();

        manager
            .on_received_signal(remote_signal("peer", EventType::Update, &[("obj", json!("new"), 50)], None))
            .await;
        manager
            .on_received_signal(remote_signal("peer", EventType::Update, &[("obj", json!("old"), 40)], None))
            .await;
        manager
            .on_received_signal(remote_signal("peer", EventType::Connect, &[("obj", json!("init"), 0)], None))
            .await;

        assert_eq!(recorder.seen().len(), 1);
        assert_eq!(
            manager.latest_event_for_object_client("obj", "peer").await.unwrap().data,
            json!("new")
        );

        let mut accepted = Vec::new();
        while let Ok(event) = updates.try_recv() {
            if let ManagerEvent::Update { event, .. } = event {
                accepted.push(event);
            }
        }
        assert_eq!(accepted.len(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_object_still_cached() {
        let hub = LocalSignalHub::new(64);
        let runtime = hub.runtime();
        runtime.connect_as("me").await;
        let manager = manager(runtime);
        manager.start().await;

        manager
            .on_received_signal(remote_signal("peer", EventType::Update, &[("later", json!("x"), 8)], None))
            .await;
        assert_eq!(manager.events_for_object("later").await.len(), 1);

        // A late registration replays the cached event
        let recorder = Recorder::new();
        manager
            .register_object("later", json!("mine"), recorder.clone(), true)
            .await
            .unwrap();
        assert_eq!(recorder.seen().len(), 1);
        assert_eq!(recorder.seen()[0].client_id, "peer");
    }

    #[tokio::test]
    async fn test_send_before_register_fails() {
        let hub = LocalSignalHub::new(64);
        let runtime = hub.runtime();
        runtime.connect_as("me").await;
        let manager = manager(runtime);

        assert_eq!(
            manager.send_event_for_object("obj", json!(1)).await.unwrap_err(),
            LiveError::NotRegistered("obj".into())
        );
        assert_eq!(
            manager
                .send_throttled_event_for_object("obj", json!(1))
                .await
                .unwrap_err(),
            LiveError::NotRegistered("obj".into())
        );
    }

    #[tokio::test]
    async fn test_send_caches_local_state() {
        let hub = LocalSignalHub::new(64);
        let runtime = hub.runtime();
        let me = runtime.connect_as("me").await;
        let manager = manager(runtime);
        manager
            .register_object("obj", json!(0), Recorder::new(), true)
            .await
            .unwrap();

        let sent = manager.send_event_for_object("obj", json!(5)).await.unwrap();
        assert_eq!(sent.timestamp, 10);
        let cached = manager.latest_event_for_object_client("obj", &me).await.unwrap();
        assert_eq!(cached, sent);

        let throttled = manager
            .send_throttled_event_for_object("obj", json!(6))
            .await
            .unwrap();
        assert_eq!(throttled.data, json!(6));
        assert_eq!(
            manager.latest_event_for_object_client("obj", &me).await.unwrap().data,
            json!(6)
        );
    }

    #[tokio::test]
    async fn test_stop_clears_store() {
        let hub = LocalSignalHub::new(64);
        let runtime = hub.runtime();
        runtime.connect_as("me").await;
        let manager = manager(runtime);
        manager
            .register_object("obj", json!(0), Recorder::new(), true)
            .await
            .unwrap();

        manager.stop().await;
        assert!(!manager.is_running().await);
        assert!(manager.latest_event_for_object("obj").await.is_none());
    }

    #[tokio::test]
    async fn test_background_switch() {
        let hub = LocalSignalHub::new(64);
        let manager = LiveObjectManager::new(hub.runtime(), SyncConfig::default().with_background_updates(false));
        assert!(!manager.can_send_background_updates());
        manager.set_can_send_background_updates(true);
        assert!(manager.can_send_background_updates());
    }
}
