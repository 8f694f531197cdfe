//! Wire protocol for live-object state signals.
//!
//! One signal batches the state of any subset of registered objects:
//! ```text
//! {
//!   "clientId": "abc123",
//!   "timestamp": 1699999999000,
//!   "name": "update",
//!   "data": {
//!     "timer-obj":    { "data": {"running": true},     "timestamp": 1699999999000 },
//!     "presence-obj": { "data": {"status": "online"},  "timestamp": 0 }
//!   }
//! }
//! ```
//!
//! Signals are JSON so that payloads stay opaque to the transport and can be
//! validated structurally on receipt. A timestamp of `0` always means
//! "initial state".

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LiveError;

/// Signal kinds used by the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// Regular state update (explicit send or background refresh)
    Update,
    /// Initial announcement sent once per client id, always at timestamp 0
    Connect,
}

impl EventType {
    /// Wire name, also used as the signal type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Update => "update",
            EventType::Connect => "connect",
        }
    }

    /// Parse a signal type. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "update" => Some(EventType::Update),
            "connect" => Some(EventType::Connect),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observation of state from one sender at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveEvent<T> {
    pub client_id: String,
    /// Logical milliseconds; `0` marks initial state.
    pub timestamp: u64,
    pub name: EventType,
    pub data: T,
    /// Intended recipient of a targeted signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_client_id: Option<String>,
}

impl<T> LiveEvent<T> {
    pub fn new(client_id: impl Into<String>, timestamp: u64, name: EventType, data: T) -> Self {
        Self {
            client_id: client_id.into(),
            timestamp,
            name,
            data,
            target_client_id: None,
        }
    }

    /// Create the timestamp-0 event used to seed an object's initial state.
    pub fn initial(client_id: impl Into<String>, data: T) -> Self {
        Self::new(client_id, 0, EventType::Update, data)
    }

    /// Same event with a different payload.
    pub fn with_data<U>(&self, data: U) -> LiveEvent<U> {
        LiveEvent {
            client_id: self.client_id.clone(),
            timestamp: self.timestamp,
            name: self.name,
            data,
            target_client_id: self.target_client_id.clone(),
        }
    }

    /// Whether this event carries initial (loseable) state.
    pub fn is_initial(&self) -> bool {
        self.timestamp == 0
    }
}

impl LiveEvent<Value> {
    /// Decode the untyped payload into `T`.
    pub fn typed<T: for<'de> Deserialize<'de>>(&self) -> Result<LiveEvent<T>, LiveError> {
        let data = serde_json::from_value(self.data.clone())?;
        Ok(self.with_data(data))
    }
}

/// Per-object slot inside a batched signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectUpdate {
    pub data: Value,
    pub timestamp: u64,
}

impl ObjectUpdate {
    pub fn new(data: Value, timestamp: u64) -> Self {
        Self { data, timestamp }
    }
}

/// Payload of one broadcast signal: object id → latest state.
pub type StateSyncEventContent = HashMap<String, ObjectUpdate>;

/// A batched state-sync signal as it travels on the wire.
pub type StateSyncEvent = LiveEvent<StateSyncEventContent>;

impl StateSyncEvent {
    /// Serialize to the JSON signal body.
    pub fn encode(&self) -> Result<Value, LiveError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Structurally validate an untrusted signal body.
    ///
    /// The body must be a `LiveEvent` whose `data` is an object of
    /// `{ data, timestamp }` slots; anything else is rejected.
    pub fn decode(content: &Value) -> Result<Self, LiveError> {
        if !content.get("data").is_some_and(Value::is_object) {
            return Err(LiveError::Serialization(
                "signal data must be an object".into(),
            ));
        }
        Ok(serde_json::from_value(content.clone())?)
    }

    /// Extract one object's slice of a batched signal.
    pub fn slice(&self, object_id: &str) -> Option<LiveEvent<Value>> {
        self.data.get(object_id).map(|update| LiveEvent {
            client_id: self.client_id.clone(),
            timestamp: update.timestamp,
            name: self.name,
            data: update.data.clone(),
            target_client_id: self.target_client_id.clone(),
        })
    }
}

/// Notifications emitted by the object manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// A newer remote event was accepted and applied.
    Update {
        object_id: String,
        event: LiveEvent<Value>,
        local: bool,
    },
    /// First event seen for an (object, client) pair.
    Joined {
        object_id: String,
        event: LiveEvent<Value>,
    },
}

impl ManagerEvent {
    pub fn object_id(&self) -> &str {
        match self {
            ManagerEvent::Update { object_id, .. } => object_id,
            ManagerEvent::Joined { object_id, .. } => object_id,
        }
    }

    pub fn event(&self) -> &LiveEvent<Value> {
        match self {
            ManagerEvent::Update { event, .. } => event,
            ManagerEvent::Joined { event, .. } => event,
        }
    }
}
