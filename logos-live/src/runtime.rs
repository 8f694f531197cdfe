//! The signal runtime the synchronizer sits on.
//!
//! A runtime delivers best-effort, non-persisted signals between the
//! participants of one session and reports the local connection identity.
//! The document runtime behind it (attachment, persistence, op log) is not
//! visible here.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::error::LiveError;
use crate::protocol::StateSyncEvent;

/// A signal as received from the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundSignal {
    /// Sender as stamped by the runtime (not by the payload)
    pub client_id: Option<String>,
    /// Signal type, `"update"` or `"connect"` for state-sync traffic
    pub event_type: String,
    /// Untrusted JSON body
    pub content: Value,
    /// Whether this is the echo of a signal we submitted
    pub local: bool,
}

/// Lifecycle and traffic notifications from a runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    Signal(InboundSignal),
    /// Connected under a (possibly new) client id
    Connected(String),
    Disconnected,
}

/// Narrow view of the collaborative runtime used for live objects.
#[async_trait]
pub trait SignalRuntime: Send + Sync {
    /// Client id of the current connection, if any.
    fn client_id(&self) -> Option<String>;

    fn connected(&self) -> bool;

    /// Whether the transport delivers targeted signals only to their
    /// recipient. When `false` every peer receives them and filters.
    fn supports_targeting(&self) -> bool {
        false
    }

    /// Submit a signal to every connected participant.
    async fn submit_signal(&self, event_type: &str, content: StateSyncEvent) -> Result<(), LiveError>;

    /// Subscribe to signals and connection changes.
    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent>;

    /// Resolve the client id, suspending until the runtime connects.
    async fn wait_for_client_id(&self) -> Result<String, LiveError> {
        // Subscribe before checking so a connect in between is not missed
        let mut events = self.subscribe();
        loop {
            if let Some(client_id) = self.client_id() {
                return Ok(client_id);
            }
            match events.recv().await {
                Ok(RuntimeEvent::Connected(client_id)) => return Ok(client_id),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Err(LiveError::RuntimeClosed),
            }
        }
    }
}
