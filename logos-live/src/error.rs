//! Error type shared by every live-object operation.

use thiserror::Error;

/// Errors surfaced by the live-object synchronization layer.
///
/// `Clone` so that a single failed throttled flush can be delivered to
/// every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LiveError {
    /// `register_object` was called twice for the same id.
    #[error("live object {0} is already registered")]
    AlreadyRegistered(String),

    /// A send was attempted for an id that has no registration.
    #[error("live object {0} is not registered")]
    NotRegistered(String),

    /// The local user does not meet the requirements to send for this object.
    #[error("local user doesn't meet the requirements to send an event for live object {0}")]
    NotAllowed(String),

    /// The signal runtime failed to submit a signal.
    #[error("signal error: {0}")]
    Signal(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// The session host rejected or failed a request.
    #[error("session host error: {0}")]
    Host(String),

    /// The runtime's event stream closed while waiting on it.
    #[error("signal runtime closed")]
    RuntimeClosed,

    /// A throttled flush was dropped before it resolved.
    #[error("throttled event queue closed before flushing")]
    QueueClosed,
}

impl From<serde_json::Error> for LiveError {
    fn from(e: serde_json::Error) -> Self {
        LiveError::Serialization(e.to_string())
    }
}
