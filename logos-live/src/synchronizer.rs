//! Container synchronizer: the registry of live objects for one session.
//!
//! ```text
//!  register ──► objects + connected_keys ──► BackgroundTimer (ref-counted)
//!                       │                          │ every interval
//!                       ▼                          ▼
//!               send_group_event ◄──── on_send_background_updates
//!                       │
//!                       ▼
//!               send_event_updates ──► SignalRuntime::submit_signal
//! ```
//!
//! Group sends read each object's cached local-client state from the event
//! store and batch every eligible object into one signal. Objects are
//! evaluated one after another in registration order.
//!
//! Failures on the timer and connect paths are logged and swallowed so the
//! synchronizer keeps running; the explicit one-shot sends return them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::clock::TimestampProvider;
use crate::error::LiveError;
use crate::host::SessionHost;
use crate::protocol::{EventType, LiveEvent, ObjectUpdate, StateSyncEvent, StateSyncEventContent};
use crate::queue::{FlushFn, ThrottledEventQueue};
use crate::runtime::SignalRuntime;
use crate::store::SharedEventStore;

/// What an object did with an incoming update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateDecision {
    /// State applied.
    Applied,
    /// State applied, and it should also count as the local user's state.
    /// It is re-stored under the local client id; the next background send
    /// re-broadcasts it.
    AppliedAndEchoLocally,
    /// Update ignored.
    Rejected,
}

/// Callbacks a registered object supplies.
#[async_trait]
pub trait ObjectHandlers: Send + Sync {
    /// Apply an update received from `sender_id`.
    async fn update_state(&self, event: &LiveEvent<Value>, sender_id: &str, local: bool) -> UpdateDecision;

    /// Whether the local user may send state for this object right now.
    /// `connecting` is true for the initial connect announcement.
    async fn local_user_can_send(&self, connecting: bool) -> bool;

    /// Re-stamp cached state with the current time on background sends.
    fn should_update_timestamp_periodically(&self) -> bool {
        false
    }
}

/// Which keys a group send included and which it skipped.
#[derive(Debug, Clone, Default)]
pub struct GroupSendOutcome {
    pub sent: Vec<String>,
    pub skipped: Vec<String>,
    /// The submitted envelope, `None` if nothing was eligible
    pub event: Option<StateSyncEvent>,
}

/// Reference-counted handle to the single background interval task.
pub struct BackgroundTimer {
    ref_count: usize,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTimer {
    /// Stopped timer with no references.
    pub fn new() -> Self {
        Self {
            ref_count: 0,
            handle: None,
        }
    }

    /// Take a reference; `start` runs only on the 0 → 1 transition.
    ///
    /// Returns whether the timer was started.
    pub fn retain(&mut self, start: impl FnOnce() -> JoinHandle<()>) -> bool {
        self.ref_count += 1;
        if self.handle.is_none() {
            self.handle = Some(start());
            return true;
        }
        false
    }

    /// Drop a reference; the task is aborted when the count reaches 0.
    ///
    /// Returns whether the timer was stopped.
    pub fn release(&mut self) -> bool {
        self.ref_count = self.ref_count.saturating_sub(1);
        if self.ref_count == 0 {
            if let Some(handle) = self.handle.take() {
                handle.abort();
                return true;
            }
        }
        false
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Number of objects holding the timer.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }
}

impl Default for BackgroundTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

struct RegisteredObject {
    handlers: Arc<dyn ObjectHandlers>,
    background_updates: bool,
}

struct SyncState {
    objects: HashMap<String, RegisteredObject>,
    /// Registration order; group sends walk it front to back
    connected_keys: Vec<String>,
    /// Client id the last connect announcement was sent for
    connected_client_id: Option<String>,
    timer: BackgroundTimer,
}

/// Per-session registry and broadcaster of live-object state.
pub struct ContainerSynchronizer {
    runtime: Arc<dyn SignalRuntime>,
    host: Option<Arc<dyn SessionHost>>,
    clock: Arc<dyn TimestampProvider>,
    store: SharedEventStore,
    background_interval: Duration,
    can_send_background_updates: Arc<AtomicBool>,
    state: Mutex<SyncState>,
    queue: ThrottledEventQueue,
    weak_self: Weak<ContainerSynchronizer>,
}

impl ContainerSynchronizer {
    pub(crate) fn new(
        runtime: Arc<dyn SignalRuntime>,
        host: Option<Arc<dyn SessionHost>>,
        clock: Arc<dyn TimestampProvider>,
        store: SharedEventStore,
        background_interval: Duration,
        throttle_delay: Duration,
        can_send_background_updates: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<ContainerSynchronizer>| Self {
            runtime,
            host,
            clock,
            store,
            background_interval,
            can_send_background_updates,
            state: Mutex::new(SyncState {
                objects: HashMap::new(),
                connected_keys: Vec::new(),
                connected_client_id: None,
                timer: BackgroundTimer::new(),
            }),
            queue: ThrottledEventQueue::new(throttle_delay, Self::queue_flush(weak.clone())),
            weak_self: weak.clone(),
        })
    }

    fn queue_flush(sync: Weak<ContainerSynchronizer>) -> FlushFn {
        Arc::new(move |updates: HashMap<String, Value>| {
            let sync = sync.clone();
            async move {
                let sync = sync.upgrade().ok_or(LiveError::QueueClosed)?;
                let content: StateSyncEventContent = updates
                    .into_iter()
                    .map(|(object_id, data)| (object_id, ObjectUpdate::new(data, sync.clock.timestamp())))
                    .collect();
                sync.send_event_updates(content, EventType::Update, None).await
            }
            .boxed()
        })
    }

    // ─── Registration ───────────────────────────────────────────────

    /// Register an object and replay whatever the store already holds for it.
    ///
    /// Objects registered with `background_updates` hold a reference on the
    /// background timer and take part in periodic sends.
    pub async fn register_object(
        &self,
        id: &str,
        handlers: Arc<dyn ObjectHandlers>,
        background_updates: bool,
    ) -> Result<(), LiveError> {
        {
            let mut state = self.state.lock().await;
            if state.objects.contains_key(id) {
                return Err(LiveError::AlreadyRegistered(id.to_string()));
            }
            state.connected_keys.push(id.to_string());
            state.objects.insert(
                id.to_string(),
                RegisteredObject {
                    handlers,
                    background_updates,
                },
            );
            if background_updates {
                let sync = self.weak_self.clone();
                let period = self.background_interval;
                if state.timer.retain(|| spawn_background_timer(sync, period)) {
                    log::debug!("Background updates started ({period:?})");
                }
            }
        }

        // Oldest first so objects see cached state in the order it happened
        let local_client_id = self.runtime.client_id();
        for event in self.store.events_for_object(id).await.into_iter().rev() {
            let local = local_client_id.as_deref() == Some(event.client_id.as_str());
            self.on_receive_update(id, event, local).await;
        }

        Ok(())
    }

    /// Announce a newly registered and seeded object.
    ///
    /// Runs the full connect flow if `client_id` hasn't been announced yet;
    /// otherwise sends a connect event for this object alone.
    pub async fn announce_registration(&self, id: &str, client_id: &str) {
        if self.on_connected(client_id).await {
            return;
        }
        if let Err(e) = self
            .send_group_event(&[id.to_string()], EventType::Connect, None)
            .await
        {
            log::warn!("Failed to announce live object {id}: {e}");
        }
    }

    /// Remove an object. Returns `false` if it wasn't registered.
    pub async fn unregister_object(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(object) = state.objects.remove(id) else {
            return false;
        };
        state.connected_keys.retain(|key| key != id);
        if object.background_updates && state.timer.release() {
            log::debug!("Background updates stopped");
        }
        true
    }

    async fn registered_handlers(&self, id: &str) -> Option<Arc<dyn ObjectHandlers>> {
        self.state
            .lock()
            .await
            .objects
            .get(id)
            .map(|object| object.handlers.clone())
    }

    // ─── Sending ────────────────────────────────────────────────────

    /// Periodic (or targeted) re-broadcast of every background-enabled object.
    ///
    /// Never fails: errors are logged.
    pub async fn on_send_background_updates(&self, target_client_id: Option<&str>) -> Option<GroupSendOutcome> {
        self.resync_client_id().await;
        if !self.can_send_background_updates.load(Ordering::Acquire) {
            log::debug!("Background updates disabled, skipping send");
            return None;
        }
        if !self.runtime.connected() {
            return None;
        }

        let keys = {
            let state = self.state.lock().await;
            let keys: Vec<String> = state
                .connected_keys
                .iter()
                .filter(|key| state.objects.get(*key).is_some_and(|o| o.background_updates))
                .cloned()
                .collect();
            keys
        };

        match self.send_group_event(&keys, EventType::Update, target_client_id).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                log::warn!("Background update failed: {e}");
                None
            }
        }
    }

    /// Send new state for one object immediately.
    pub async fn send_event_for_object(&self, object_id: &str, data: Value) -> Result<LiveEvent<Value>, LiveError> {
        self.ensure_can_send(object_id).await?;

        let mut content = StateSyncEventContent::new();
        content.insert(
            object_id.to_string(),
            ObjectUpdate::new(data, self.clock.timestamp()),
        );
        let sent = self
            .send_event_updates(content, EventType::Update, None)
            .await?
            .ok_or_else(|| LiveError::Signal(format!("nothing sent for {object_id}")))?;
        sent.slice(object_id)
            .ok_or_else(|| LiveError::Signal(format!("nothing sent for {object_id}")))
    }

    /// Send new state for one object through the throttled queue.
    pub async fn send_throttled_event_for_object(
        &self,
        object_id: &str,
        data: Value,
    ) -> Result<LiveEvent<Value>, LiveError> {
        self.ensure_can_send(object_id).await?;
        self.queue.send_with_queue(object_id, data).await
    }

    async fn ensure_can_send(&self, object_id: &str) -> Result<(), LiveError> {
        let handlers = self
            .registered_handlers(object_id)
            .await
            .ok_or_else(|| LiveError::NotRegistered(object_id.to_string()))?;
        if !handlers.local_user_can_send(false).await {
            return Err(LiveError::NotAllowed(object_id.to_string()));
        }
        Ok(())
    }

    /// Stamp and submit a batch. Returns `None` when `updates` is empty.
    ///
    /// Connect events are stamped with timestamp `0`.
    pub async fn send_event_updates(
        &self,
        updates: StateSyncEventContent,
        evt_type: EventType,
        target_client_id: Option<&str>,
    ) -> Result<Option<StateSyncEvent>, LiveError> {
        if updates.is_empty() {
            return Ok(None);
        }

        let client_id = self.runtime.wait_for_client_id().await?;
        let timestamp = match evt_type {
            EventType::Connect => 0,
            EventType::Update => self.clock.timestamp(),
        };
        let mut event = LiveEvent::new(client_id, timestamp, evt_type, updates);
        event.target_client_id = target_client_id.map(str::to_string);

        self.runtime.submit_signal(evt_type.as_str(), event.clone()).await?;
        Ok(Some(event))
    }

    /// Batch the cached local state of `keys` into one signal.
    pub async fn send_group_event(
        &self,
        keys: &[String],
        evt_type: EventType,
        target_client_id: Option<&str>,
    ) -> Result<GroupSendOutcome, LiveError> {
        let connecting = evt_type == EventType::Connect;
        let client_id = self.runtime.client_id();
        let mut outcome = GroupSendOutcome::default();
        let mut content = StateSyncEventContent::new();

        for key in keys {
            let Some(handlers) = self.registered_handlers(key).await else {
                outcome.skipped.push(key.clone());
                continue;
            };
            if !handlers.local_user_can_send(connecting).await {
                outcome.skipped.push(key.clone());
                continue;
            }
            let cached = match &client_id {
                Some(client_id) => self.store.latest_event_for_object_client(key, client_id).await,
                None => None,
            };
            let Some(cached) = cached else {
                outcome.skipped.push(key.clone());
                continue;
            };

            let timestamp = if connecting {
                // Initial state must never clobber a peer's real state
                0
            } else if handlers.should_update_timestamp_periodically() {
                self.clock.timestamp()
            } else {
                cached.timestamp
            };
            content.insert(key.clone(), ObjectUpdate::new(cached.data, timestamp));
            outcome.sent.push(key.clone());
        }

        if !outcome.skipped.is_empty() {
            log::debug!("{evt_type} group send skipped {:?}", outcome.skipped);
        }
        outcome.event = self
            .send_event_updates(content, evt_type, target_client_id)
            .await?;
        Ok(outcome)
    }

    // ─── Runtime notifications ──────────────────────────────────────

    /// Handle the runtime connecting under `client_id`.
    ///
    /// Returns `false` if this id was already announced.
    pub async fn on_connected(&self, client_id: &str) -> bool {
        let (previous, keys) = {
            let mut state = self.state.lock().await;
            if state.connected_client_id.as_deref() == Some(client_id) {
                return false;
            }
            let previous = state.connected_client_id.replace(client_id.to_string());
            (previous, state.connected_keys.clone())
        };

        if let Some(previous) = previous {
            let moved = self.store.client_id_did_change(&previous, client_id).await;
            log::debug!("Client id changed {previous} -> {client_id}, moved {moved} cached events");
        }

        if let Some(host) = &self.host {
            if let Err(e) = host.register_client_id(client_id).await {
                log::warn!("Failed to register client id {client_id} with host: {e}");
            }
        }

        match self.send_group_event(&keys, EventType::Connect, None).await {
            Ok(outcome) => log::info!(
                "Connected as {client_id}, announced {} live objects",
                outcome.sent.len()
            ),
            Err(e) => log::warn!("Connect announcement for {client_id} failed: {e}"),
        }
        true
    }

    /// Run the connect flow if the runtime's client id moved on without a
    /// matching [`on_connected`](Self::on_connected) call, e.g. when the
    /// `Connected` notification was lost to a lagging receiver.
    ///
    /// Only applies once some id has been announced. Returns whether the
    /// connect flow ran.
    pub async fn resync_client_id(&self) -> bool {
        let Some(current) = self.runtime.client_id() else {
            return false;
        };
        let announced = self.state.lock().await.connected_client_id.clone();
        match announced {
            Some(announced) if announced != current => {
                log::warn!("Missed reconnect {announced} -> {current}, resyncing");
                self.on_connected(&current).await
            }
            _ => false,
        }
    }

    /// Deliver an accepted update to its object.
    ///
    /// Unknown objects are ignored.
    pub async fn on_receive_update(&self, object_id: &str, event: LiveEvent<Value>, local: bool) -> Option<UpdateDecision> {
        let handlers = self.registered_handlers(object_id).await?;
        let sender = event.client_id.clone();
        let decision = handlers.update_state(&event, &sender, local).await;

        if decision == UpdateDecision::AppliedAndEchoLocally {
            if let Some(local_client_id) = self.runtime.client_id() {
                let mut echo = event;
                echo.client_id = local_client_id;
                self.store.update_event_locally_in_store(object_id, echo).await;
            }
        }
        Some(decision)
    }

    // ─── Introspection ──────────────────────────────────────────────

    /// Whether `id` is currently registered.
    pub async fn is_registered(&self, id: &str) -> bool {
        self.state.lock().await.objects.contains_key(id)
    }

    /// Registered object ids, in registration order.
    pub async fn connected_keys(&self) -> Vec<String> {
        self.state.lock().await.connected_keys.clone()
    }

    /// Client id of the last connect announcement.
    pub async fn connected_client_id(&self) -> Option<String> {
        self.state.lock().await.connected_client_id.clone()
    }

    /// Whether the background interval task is alive.
    pub async fn background_timer_running(&self) -> bool {
        self.state.lock().await.timer.is_running()
    }

    /// Whether throttled sends are waiting for the flush timer.
    pub async fn throttle_pending(&self) -> bool {
        self.queue.is_pending().await
    }
}

/// Spawn the interval task. Each tick runs its send in its own task, so a
/// slow send never delays the next tick.
fn spawn_background_timer(sync: Weak<ContainerSynchronizer>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(sync) = sync.upgrade() else {
                break;
            };
            tokio::spawn(async move {
                sync.on_send_background_updates(None).await;
            });
        }
    })
}
