//! Typed per-object handle over the object manager.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::LiveError;
use crate::manager::LiveObjectManager;
use crate::protocol::LiveEvent;
use crate::synchronizer::ObjectHandlers;
pub use crate::synchronizer::UpdateDecision;

/// Callbacks for a live object whose state is a `T`.
#[async_trait]
pub trait LiveObjectHandlers<T: Send + 'static>: Send + Sync + 'static {
    /// Apply state received from `sender_id`.
    async fn update_state(&self, event: LiveEvent<T>, sender_id: &str, local: bool) -> UpdateDecision;

    async fn local_user_can_send(&self, _connecting: bool) -> bool {
        true
    }

    fn should_update_timestamp_periodically(&self) -> bool {
        false
    }
}

/// Bridges typed handlers to the untyped registry.
struct TypedHandlers<T, H> {
    handlers: H,
    _state: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, H> ObjectHandlers for TypedHandlers<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: LiveObjectHandlers<T>,
{
    async fn update_state(&self, event: &LiveEvent<Value>, sender_id: &str, local: bool) -> UpdateDecision {
        match event.typed::<T>() {
            Ok(typed) => self.handlers.update_state(typed, sender_id, local).await,
            // Peer-controlled input: reject without logging
            Err(_) => UpdateDecision::Rejected,
        }
    }

    async fn local_user_can_send(&self, connecting: bool) -> bool {
        self.handlers.local_user_can_send(connecting).await
    }

    fn should_update_timestamp_periodically(&self) -> bool {
        self.handlers.should_update_timestamp_periodically()
    }
}

/// One live object's view of the manager, with `T` as its state type.
pub struct LiveObjectSynchronizer<T> {
    id: String,
    manager: LiveObjectManager,
    _state: PhantomData<fn() -> T>,
}

impl<T> Clone for LiveObjectSynchronizer<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            manager: self.manager.clone(),
            _state: PhantomData,
        }
    }
}

impl<T> LiveObjectSynchronizer<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(id: impl Into<String>, manager: LiveObjectManager) -> Self {
        Self {
            id: id.into(),
            manager,
            _state: PhantomData,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn manager(&self) -> &LiveObjectManager {
        &self.manager
    }

    /// Register with the manager and announce `initial_state`.
    pub async fn start<H>(&self, initial_state: &T, handlers: H, enable_background_updates: bool) -> Result<(), LiveError>
    where
        H: LiveObjectHandlers<T>,
    {
        let initial = serde_json::to_value(initial_state)?;
        let handlers = Arc::new(TypedHandlers {
            handlers,
            _state: PhantomData,
        });
        self.manager
            .register_object(&self.id, initial, handlers, enable_background_updates)
            .await
    }

    /// Unregister. Cached events stay in the manager's store.
    pub async fn dispose(&self) -> bool {
        self.manager.unregister_object(&self.id).await
    }

    /// Send `data` now; it also becomes the cached local state.
    pub async fn send_event(&self, data: &T) -> Result<LiveEvent<T>, LiveError> {
        let data = serde_json::to_value(data)?;
        self.manager
            .send_event_for_object(&self.id, data)
            .await?
            .typed()
    }

    /// Send `data` with the next throttled batch.
    pub async fn send_throttled_event(&self, data: &T) -> Result<LiveEvent<T>, LiveError> {
        let data = serde_json::to_value(data)?;
        self.manager
            .send_throttled_event_for_object(&self.id, data)
            .await?
            .typed()
    }

    /// Newest event from any sender. Events that don't decode as `T` are skipped.
    pub async fn latest_event(&self) -> Option<LiveEvent<T>> {
        self.manager
            .latest_event_for_object(&self.id)
            .await?
            .typed()
            .ok()
    }

    /// Latest event from `client_id`, if it decodes as `T`.
    pub async fn latest_event_for_client(&self, client_id: &str) -> Option<LiveEvent<T>> {
        self.manager
            .latest_event_for_object_client(&self.id, client_id)
            .await?
            .typed()
            .ok()
    }

    /// Every sender's latest event, newest first.
    pub async fn events(&self) -> Vec<LiveEvent<T>> {
        self.manager
            .events_for_object(&self.id)
            .await
            .iter()
            .filter_map(|event| event.typed().ok())
            .collect()
    }
}
