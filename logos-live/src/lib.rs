//! # logos-live: Live object state synchronization
//!
//! Keeps small pieces of ephemeral shared state (cursors, timers, presence,
//! "who is presenting") consistent across the participants of a session by
//! broadcasting best-effort signals. Nothing is persisted: a late joiner
//! learns current state from peers re-broadcasting it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  typed T   ┌────────────────────────┐
//! │  LiveState  │ ─────────► │ LiveObjectSynchronizer │  (one per object)
//! └─────────────┘            └───────────┬────────────┘
//!                                        │ serde_json::Value
//!                                        ▼
//!                            ┌────────────────────────┐
//!                            │   LiveObjectManager    │  (one per session)
//!                            │   EventStore cache     │
//!                            └───────────┬────────────┘
//!                                        ▼
//!                            ┌────────────────────────┐
//!                            │  ContainerSynchronizer │  background timer,
//!                            │  registry + batching   │  throttled queue
//!                            └───────────┬────────────┘
//!                                        │ StateSyncEvent (JSON)
//!                                        ▼
//!                            ┌────────────────────────┐
//!                            │     SignalRuntime      │  LocalSignalHub in-process
//!                            └────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Signal envelope and per-object slots
//! - [`store`]: Latest event per (object, client), newness rule
//! - [`synchronizer`]: Registry, group sends, background timer
//! - [`queue`]: Throttled, coalescing sends
//! - [`manager`]: Session-wide router and cache
//! - [`handle`]: Typed per-object API
//! - [`live_state`]: Last-writer-wins shared value
//! - [`runtime`] / [`broadcast`]: Signal runtime seam and in-process hub
//! - [`host`]: Session host and role checks
//!
//! ## Ordering
//!
//! | Incoming vs cached            | Result   |
//! |-------------------------------|----------|
//! | nothing cached                | accepted |
//! | timestamp 0                   | rejected |
//! | timestamp ≥ cached            | accepted |
//! | timestamp < cached            | rejected |

pub mod broadcast;
pub mod clock;
pub mod config;
pub mod error;
pub mod handle;
pub mod host;
pub mod live_state;
pub mod manager;
pub mod protocol;
pub mod queue;
pub mod runtime;
pub mod store;
pub mod synchronizer;

// Re-exports for convenience
pub use broadcast::{HubStats, LocalRuntime, LocalSignalHub, SentSignal};
pub use clock::{ManualClock, MonotonicClock, TimestampProvider};
pub use config::SyncConfig;
pub use error::LiveError;
pub use handle::{LiveObjectHandlers, LiveObjectSynchronizer};
pub use host::{LiveRole, LocalSessionHost, RoleVerifier, SessionHost};
pub use live_state::LiveState;
pub use manager::{LiveObjectManager, ManagerBuilder};
pub use protocol::{
    EventType, LiveEvent, ManagerEvent, ObjectUpdate, StateSyncEvent, StateSyncEventContent,
};
pub use runtime::{InboundSignal, RuntimeEvent, SignalRuntime};
pub use store::{EventStore, SharedEventStore, StoreUpdate};
pub use synchronizer::{ContainerSynchronizer, GroupSendOutcome, ObjectHandlers, UpdateDecision};
