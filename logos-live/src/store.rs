//! Latest-event cache, per live object and per sender.
//!
//! ```text
//! object_id ──► client_id ──► LiveEvent (newest seen)
//! ```
//!
//! Only the newest event per (object, client) pair is kept; older events are
//! discarded, never merged. All writes go through
//! [`SharedEventStore::update_event_locally_in_store`], the single place the
//! newness rule is enforced.
//!
//! Newness: a later timestamp always wins. On an exact tie the arriving
//! event wins (arrival order), except that timestamp `0` (initial state)
//! only ever fills an empty slot.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use crate::protocol::{LiveEvent, ManagerEvent};

/// Outcome of offering an event to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreUpdate {
    /// First event for this (object, client) pair
    Joined,
    /// Replaced an older event
    Updated,
    /// Rejected as not newer than what is stored
    Stale,
}

impl StoreUpdate {
    /// Whether the event was stored.
    pub fn is_accepted(&self) -> bool {
        !matches!(self, StoreUpdate::Stale)
    }
}

/// Whether `incoming` should replace `current`.
pub fn is_newer_event<T, U>(current: Option<&LiveEvent<T>>, incoming: &LiveEvent<U>) -> bool {
    match current {
        None => true,
        Some(_) if incoming.timestamp == 0 => false,
        Some(current) => incoming.timestamp >= current.timestamp,
    }
}

/// In-memory event table.
#[derive(Debug, Default)]
pub struct EventStore {
    objects: HashMap<String, HashMap<String, LiveEvent<Value>>>,
}

impl EventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `event` if it is newer than what is stored for its sender.
    pub fn update_event(&mut self, object_id: &str, event: LiveEvent<Value>) -> StoreUpdate {
        let clients = self.objects.entry(object_id.to_string()).or_default();
        let current = clients.get(&event.client_id);
        if !is_newer_event(current, &event) {
            return StoreUpdate::Stale;
        }
        let outcome = if current.is_some() {
            StoreUpdate::Updated
        } else {
            StoreUpdate::Joined
        };
        clients.insert(event.client_id.clone(), event);
        outcome
    }

    /// Latest event `client_id` sent for `object_id`.
    pub fn latest_event_for_object_client(&self, object_id: &str, client_id: &str) -> Option<&LiveEvent<Value>> {
        self.objects.get(object_id)?.get(client_id)
    }

    /// Most recent event across all senders.
    pub fn latest_event_for_object(&self, object_id: &str) -> Option<&LiveEvent<Value>> {
        self.objects
            .get(object_id)?
            .values()
            .max_by_key(|event| event.timestamp)
    }

    /// All senders' events, newest first.
    pub fn events_for_object(&self, object_id: &str) -> Vec<LiveEvent<Value>> {
        let mut events: Vec<_> = self
            .objects
            .get(object_id)
            .map(|clients| clients.values().cloned().collect())
            .unwrap_or_default();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events
    }

    /// Move every entry stored under `old_client_id` to `new_client_id`.
    ///
    /// Returns the number of objects whose entry moved.
    pub fn client_id_did_change(&mut self, old_client_id: &str, new_client_id: &str) -> usize {
        if old_client_id == new_client_id {
            return 0;
        }
        let mut moved = 0;
        for clients in self.objects.values_mut() {
            if let Some(mut event) = clients.remove(old_client_id) {
                event.client_id = new_client_id.to_string();
                clients.insert(new_client_id.to_string(), event);
                moved += 1;
            }
        }
        moved
    }

    /// Drop every cached event.
    pub fn clear(&mut self) {
        self.objects.clear();
    }

    /// Number of objects with at least one cached event.
    pub fn object_count(&self) -> usize {
        self.objects.values().filter(|c| !c.is_empty()).count()
    }
}

/// Cloneable handle to the session's single [`EventStore`].
///
/// Owned by the object manager and lent to its synchronizer. Accepted first
/// events for a sender are announced as [`ManagerEvent::Joined`].
#[derive(Clone)]
pub struct SharedEventStore {
    store: Arc<Mutex<EventStore>>,
    events: broadcast::Sender<ManagerEvent>,
}

impl SharedEventStore {
    /// Empty store announcing first events on `events`.
    pub fn new(events: broadcast::Sender<ManagerEvent>) -> Self {
        Self {
            store: Arc::new(Mutex::new(EventStore::new())),
            events,
        }
    }

    /// Store `event` if newer. Returns whether it was accepted.
    pub async fn update_event_locally_in_store(&self, object_id: &str, event: LiveEvent<Value>) -> bool {
        let joined = event.clone();
        let outcome = self.store.lock().await.update_event(object_id, event);
        if outcome == StoreUpdate::Joined {
            // No subscribers is fine
            let _ = self.events.send(ManagerEvent::Joined {
                object_id: object_id.to_string(),
                event: joined,
            });
        }
        outcome.is_accepted()
    }

    /// See [`EventStore::latest_event_for_object_client`].
    pub async fn latest_event_for_object_client(&self, object_id: &str, client_id: &str) -> Option<LiveEvent<Value>> {
        self.store
            .lock()
            .await
            .latest_event_for_object_client(object_id, client_id)
            .cloned()
    }

    /// Most recent event across all senders.
    pub async fn latest_event_for_object(&self, object_id: &str) -> Option<LiveEvent<Value>> {
        self.store.lock().await.latest_event_for_object(object_id).cloned()
    }

    /// All senders' events, newest first.
    pub async fn events_for_object(&self, object_id: &str) -> Vec<LiveEvent<Value>> {
        self.store.lock().await.events_for_object(object_id)
    }

    /// Re-key the local client's entries after a reconnect.
    pub async fn client_id_did_change(&self, old_client_id: &str, new_client_id: &str) -> usize {
        self.store
            .lock()
            .await
            .client_id_did_change(old_client_id, new_client_id)
    }

    /// Drop every cached event.
    pub async fn clear(&self) {
        self.store.lock().await.clear();
    }

    /// Get the number of objects with cached events.
    pub async fn object_count(&self) -> usize {
        self.store.lock().await.object_count()
    }
}
