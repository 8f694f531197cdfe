//! Coalescing queue for high-frequency sends.
//!
//! Sends for the same object that arrive within `delay` of the first one are
//! merged (last write wins) and go out together in one batched signal. Every
//! caller receives its object's slice of that signal, or the error that
//! sending it produced.
//!
//! At most one flush timer is outstanding; it is tracked by a single
//! `Option<JoinHandle>` and cleared as soon as it fires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::LiveError;
use crate::protocol::{LiveEvent, StateSyncEvent};

/// Future returned by a [`FlushFn`].
pub type FlushFuture = BoxFuture<'static, Result<Option<StateSyncEvent>, LiveError>>;

/// Sends one coalesced batch. Returns the envelope that went out, if any.
pub type FlushFn = Arc<dyn Fn(HashMap<String, Value>) -> FlushFuture + Send + Sync>;

type Waiter = oneshot::Sender<Result<LiveEvent<Value>, LiveError>>;

#[derive(Default)]
struct PendingBatch {
    updates: HashMap<String, Value>,
    waiters: Vec<(String, Waiter)>,
    timer: Option<JoinHandle<()>>,
}

/// Throttled, batching sender.
pub struct ThrottledEventQueue {
    delay: Duration,
    flush: FlushFn,
    pending: Arc<Mutex<PendingBatch>>,
}

impl ThrottledEventQueue {
    pub fn new(delay: Duration, flush: FlushFn) -> Self {
        Self {
            delay,
            flush,
            pending: Arc::new(Mutex::new(PendingBatch::default())),
        }
    }

    /// Queue `data` for `object_id` and wait for the batch it lands in.
    pub async fn send_with_queue(&self, object_id: &str, data: Value) -> Result<LiveEvent<Value>, LiveError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.updates.insert(object_id.to_string(), data);
            pending.waiters.push((object_id.to_string(), tx));
            if pending.timer.is_none() {
                pending.timer = Some(self.spawn_flush());
            }
        }
        rx.await.map_err(|_| LiveError::QueueClosed)?
    }

    fn spawn_flush(&self) -> JoinHandle<()> {
        let delay = self.delay;
        let flush = self.flush.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let (updates, waiters) = {
                let mut pending = pending.lock().await;
                pending.timer = None;
                (
                    std::mem::take(&mut pending.updates),
                    std::mem::take(&mut pending.waiters),
                )
            };
            if waiters.is_empty() {
                return;
            }

            match flush(updates).await {
                Ok(sent) => {
                    for (object_id, waiter) in waiters {
                        let slice = sent
                            .as_ref()
                            .and_then(|evt| evt.slice(&object_id))
                            .ok_or_else(|| {
                                LiveError::Signal(format!("throttled batch did not include {object_id}"))
                            });
                        let _ = waiter.send(slice);
                    }
                }
                Err(err) => {
                    log::debug!("Throttled flush failed for {} waiters: {err}", waiters.len());
                    for (_, waiter) in waiters {
                        let _ = waiter.send(Err(err.clone()));
                    }
                }
            }
        })
    }

    /// Whether a flush timer is currently outstanding.
    pub async fn is_pending(&self) -> bool {
        self.pending.lock().await.timer.is_some()
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Drop for ThrottledEventQueue {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.try_lock() {
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
        }
    }
}
