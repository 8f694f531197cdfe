//! A single shared value, last writer wins.
//!
//! Built on [`LiveObjectSynchronizer`]. Every accepted update (local or
//! remote) is echoed into the local cache, so whoever is connected keeps
//! re-broadcasting the newest value to late joiners.
//!
//! Ordering: higher timestamp wins; equal non-zero timestamps are broken by
//! the larger client id. Initial (timestamp 0) values never replace the
//! current one.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};

use crate::error::LiveError;
use crate::handle::{LiveObjectHandlers, LiveObjectSynchronizer};
use crate::host::{LiveRole, RoleVerifier};
use crate::manager::LiveObjectManager;
use crate::protocol::LiveEvent;
use crate::synchronizer::UpdateDecision;

/// Timestamp and writer of the value currently held.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Version {
    timestamp: u64,
    client_id: String,
}

impl Version {
    fn is_superseded_by(&self, timestamp: u64, client_id: &str) -> bool {
        if timestamp == 0 {
            return false;
        }
        timestamp > self.timestamp || (timestamp == self.timestamp && client_id >= self.client_id.as_str())
    }
}

struct Shared<T> {
    value: watch::Sender<T>,
    version: Mutex<Version>,
    allowed_roles: RwLock<Vec<LiveRole>>,
    verifier: Option<Arc<RoleVerifier>>,
    manager: LiveObjectManager,
}

impl<T: PartialEq> Shared<T> {
    async fn client_allowed(&self, client_id: &str) -> bool {
        let allowed_roles = self.allowed_roles.read().await.clone();
        if allowed_roles.is_empty() {
            return true;
        }
        let Some(verifier) = &self.verifier else {
            return true;
        };
        match verifier.verify_roles_allowed(client_id, &allowed_roles).await {
            Ok(allowed) => allowed,
            Err(e) => {
                log::warn!("Role check for {client_id} failed: {e}");
                false
            }
        }
    }

    /// Apply `value` if it is newer than what we hold. Watchers are only
    /// woken when the value itself changes.
    async fn apply(&self, value: T, timestamp: u64, client_id: &str) -> bool {
        let mut version = self.version.lock().await;
        if !version.is_superseded_by(timestamp, client_id) {
            return false;
        }
        *version = Version {
            timestamp,
            client_id: client_id.to_string(),
        };
        self.value.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
        true
    }
}

struct StateHandlers<T> {
    shared: Arc<Shared<T>>,
}

#[async_trait]
impl<T> LiveObjectHandlers<T> for StateHandlers<T>
where
    T: PartialEq + Send + Sync + 'static,
{
    async fn update_state(&self, event: LiveEvent<T>, sender_id: &str, local: bool) -> UpdateDecision {
        if !local && !self.shared.client_allowed(sender_id).await {
            log::debug!("Ignoring state from {sender_id}: role not allowed");
            return UpdateDecision::Rejected;
        }
        if self.shared.apply(event.data, event.timestamp, &event.client_id).await {
            UpdateDecision::AppliedAndEchoLocally
        } else {
            UpdateDecision::Rejected
        }
    }

    async fn local_user_can_send(&self, _connecting: bool) -> bool {
        match self.shared.manager.runtime().client_id() {
            Some(client_id) => self.shared.client_allowed(&client_id).await,
            None => false,
        }
    }
}

/// Shared value of type `T`, optionally writable only by some roles.
pub struct LiveState<T> {
    sync: LiveObjectSynchronizer<T>,
    shared: Arc<Shared<T>>,
}

impl<T> LiveState<T>
where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
{
    /// `verifier` enforces `allowed_roles`; without one every client may write.
    pub fn new(id: impl Into<String>, manager: LiveObjectManager, initial: T, verifier: Option<Arc<RoleVerifier>>) -> Self {
        let (value, _) = watch::channel(initial);
        Self {
            sync: LiveObjectSynchronizer::new(id, manager.clone()),
            shared: Arc::new(Shared {
                value,
                version: Mutex::new(Version {
                    timestamp: 0,
                    client_id: String::new(),
                }),
                allowed_roles: RwLock::new(Vec::new()),
                verifier,
                manager,
            }),
        }
    }

    /// Register and announce the current value. An empty `allowed_roles`
    /// lets anyone write.
    pub async fn initialize(&self, allowed_roles: Vec<LiveRole>) -> Result<(), LiveError> {
        *self.shared.allowed_roles.write().await = allowed_roles;
        let initial = self.state();
        self.sync
            .start(
                &initial,
                StateHandlers {
                    shared: self.shared.clone(),
                },
                true,
            )
            .await
    }

    /// Broadcast a new value and apply it locally.
    pub async fn set(&self, value: T) -> Result<(), LiveError> {
        let sent = self.sync.send_event(&value).await?;
        if !self
            .shared
            .apply(value, sent.timestamp, &sent.client_id)
            .await
        {
            log::debug!("Local value for {} superseded before it applied", self.sync.id());
        }
        Ok(())
    }

    /// Current value.
    pub fn state(&self) -> T {
        self.shared.value.borrow().clone()
    }

    /// Watch value changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.shared.value.subscribe()
    }

    pub async fn allowed_roles(&self) -> Vec<LiveRole> {
        self.shared.allowed_roles.read().await.clone()
    }

    pub fn id(&self) -> &str {
        self.sync.id()
    }

    /// Stop syncing. Returns `false` if already disposed.
    pub async fn dispose(&self) -> bool {
        self.sync.dispose().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::LocalSignalHub;
    use crate::config::SyncConfig;
    use crate::host::{LocalSessionHost, SessionHost};
    use crate::runtime::InboundSignal;
    use serde_json::{json, Value};

    fn remote(sender: &str, value: Value, timestamp: u64) -> InboundSignal {
        InboundSignal {
            client_id: Some(sender.into()),
            event_type: "update".into(),
            content: json!({
                "clientId": sender,
                "timestamp": timestamp,
                "name": "update",
                "data": { "mode": { "data": value, "timestamp": timestamp } }
            }),
            local: false,
        }
    }

    #[test]
    fn test_version_ordering() {
        let v = Version {
            timestamp: 10,
            client_id: "b".into(),
        };
        assert!(v.is_superseded_by(11, "a"));
        assert!(!v.is_superseded_by(9, "z"));
        assert!(v.is_superseded_by(10, "c"));
        assert!(!v.is_superseded_by(10, "a"));
        assert!(!v.is_superseded_by(0, "z"));
    }

    #[tokio::test]
    async fn test_set_and_remote_last_writer_wins() {
        let hub = LocalSignalHub::new(64);
        let runtime = hub.runtime();
        let me = runtime.connect_as("me").await;
        let manager = LiveObjectManager::new(runtime, SyncConfig::default());
        let state = LiveState::new("mode", manager.clone(), "idle".to_string(), None);
        state.initialize(Vec::new()).await.unwrap();
        let watcher = state.subscribe();

        state.set("edit".to_string()).await.unwrap();
        assert_eq!(state.state(), "edit");
        assert!(watcher.has_changed().unwrap());

        // Older remote value loses
        manager.on_received_signal(remote("peer", json!("stale"), 5)).await;
        assert_eq!(state.state(), "edit");

        // Newer remote value wins and becomes our echoed local state
        manager.on_received_signal(remote("peer", json!("view"), u64::MAX - 1)).await;
        assert_eq!(state.state(), "view");
        let echoed = manager.latest_event_for_object_client("mode", &me).await.unwrap();
        assert_eq!(echoed.data, json!("view"));
    }

    #[tokio::test]
    async fn test_tie_with_same_value_keeps_watchers_quiet() {
        let hub = LocalSignalHub::new(64);
        let runtime = hub.runtime();
        runtime.connect_as("me").await;
        let manager = LiveObjectManager::new(runtime, SyncConfig::default());
        let state = LiveState::new("mode", manager.clone(), "idle".to_string(), None);
        state.initialize(Vec::new()).await.unwrap();
        let mut watcher = state.subscribe();

        manager.on_received_signal(remote("peer", json!("view"), 100)).await;
        assert!(watcher.has_changed().unwrap());
        watcher.borrow_and_update();

        // Another peer echoing the same value wins the tie but changes nothing
        manager.on_received_signal(remote("zed", json!("view"), 100)).await;
        assert!(!watcher.has_changed().unwrap());

        manager.on_received_signal(remote("zz", json!("edit"), 100)).await;
        assert!(watcher.has_changed().unwrap());
        assert_eq!(state.state(), "edit");
    }

    #[tokio::test]
    async fn test_roles_gate_writes() {
        let hub = LocalSignalHub::new(64);
        let runtime = hub.runtime();
        let me = runtime.connect_as("me").await;

        let host = Arc::new(LocalSessionHost::new(vec![LiveRole::Attendee]));
        host.set_roles("presenter", vec![LiveRole::Presenter]).await;
        let verifier = Arc::new(RoleVerifier::new(host.clone()));

        let manager = LiveObjectManager::builder(runtime)
            .host(host.clone())
            .build();
        let state = LiveState::new("mode", manager.clone(), 0u32, Some(verifier));
        state.initialize(vec![LiveRole::Presenter]).await.unwrap();
        assert!(host.registered_client_ids().await.contains(&me));

        // Attendees can't write
        assert_eq!(
            state.set(1).await.unwrap_err(),
            LiveError::NotAllowed("mode".into())
        );

        // Nor are their remote writes applied
        host.set_roles("attendee", vec![LiveRole::Attendee]).await;
        manager.on_received_signal(remote("attendee", json!(7), 100)).await;
        assert_eq!(state.state(), 0);

        manager.on_received_signal(remote("presenter", json!(8), 100)).await;
        assert_eq!(state.state(), 8);
        assert_eq!(state.allowed_roles().await, vec![LiveRole::Presenter]);
        assert_eq!(host.client_roles(&me).await.unwrap(), Some(vec![LiveRole::Attendee]));
    }
}
