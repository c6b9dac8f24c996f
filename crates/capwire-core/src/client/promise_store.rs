//! Client-side correlation of requests with their eventual responses.
//!
//! Requests and responses share one connection with no ordering guarantee
//! between distinct ids, so each request gets its own one-shot slot keyed by a
//! fresh promise id. The receive loop settles slots as `set-promise` envelopes
//! arrive; callers await only their own slot.

use crate::config::ProtocolConfig;
use crate::error::ErrorInfo;
use crate::{CapwireError, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

type Outcome = std::result::Result<Value, CapwireError>;

#[derive(Default)]
struct StoreState {
    pending: HashMap<String, oneshot::Sender<Outcome>>,
    /// Ids whose caller dropped its handle before a response arrived.
    abandoned: Tombstones,
    /// Set once the connection is gone; no new promises after that.
    closed: Option<String>,
}

/// Bounded memory of abandoned ids; the oldest are forgotten first.
#[derive(Default)]
struct Tombstones {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl Tombstones {
    fn insert(&mut self, id: String) {
        while self.order.len() >= ProtocolConfig::MAX_ABANDONED_PROMISES {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.clone());
        self.order.push_back(id);
    }

    /// Forget `id`, returning whether it was remembered.
    fn remove(&mut self, id: &str) -> bool {
        self.ids.remove(id)
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.order.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Outstanding requests of one connection.
///
/// Cloning yields another handle to the same store.
#[derive(Clone, Default)]
pub struct PromiseStore {
    state: Arc<Mutex<StoreState>>,
}

impl PromiseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh promise id and its pending slot.
    ///
    /// Fails with `ConnectionClosed` once [`cancel_all`](Self::cancel_all) ran.
    pub fn create(&self) -> Result<PendingPromise> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(CapwireError::connection_closed(reason.clone()));
        }

        let mut id = Uuid::new_v4().to_string();
        while state.pending.contains_key(&id) {
            id = Uuid::new_v4().to_string();
        }

        let (tx, rx) = oneshot::channel();
        state.pending.insert(id.clone(), tx);

        Ok(PendingPromise {
            id,
            rx,
            store: Arc::downgrade(&self.state),
        })
    }

    /// Settle `id` with a success value. Returns whether it had any effect.
    pub fn complete(&self, id: &str, value: Value) -> bool {
        self.settle(id, Ok(value))
    }

    /// Settle `id` with a server-reported failure. Returns whether it had any effect.
    pub fn fail(&self, id: &str, error_info: ErrorInfo) -> bool {
        self.settle(id, Err(error_info.into()))
    }

    fn settle(&self, id: &str, outcome: Outcome) -> bool {
        let mut state = self.lock();
        let sender = state.pending.remove(id);
        match sender {
            Some(tx) => {
                drop(state);
                if tx.send(outcome).is_err() {
                    debug!("Promise [{}] settled after its caller stopped waiting", id);
                }
                true
            }
            None if state.abandoned.remove(id) => {
                debug!("Ignoring late response for abandoned promise [{}]", id);
                false
            }
            None => {
                // Also reached by late responses whose tombstone was evicted.
                warn!("Ignoring settle of unknown or already settled promise [{}]", id);
                false
            }
        }
    }

    /// Fail every pending promise with `ConnectionClosed` and refuse new ones.
    ///
    /// Returns how many promises were cancelled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, oneshot::Sender<Outcome>)> = {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.to_string());
            }
            state.abandoned.clear();
            state.pending.drain().collect()
        };

        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(CapwireError::connection_closed(reason)));
        }
        if count > 0 {
            debug!("Cancelled {} pending promise(s): {}", count, reason);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }
}

/// One outstanding request, awaited by its caller.
///
/// Dropping it before it settles withdraws the slot; a response arriving
/// afterwards is ignored.
pub struct PendingPromise {
    id: String,
    rx: oneshot::Receiver<Outcome>,
    store: Weak<Mutex<StoreState>>,
}

impl PendingPromise {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Suspend until settled and decode the value as `T`.
    pub async fn await_result<T: DeserializeOwned>(mut self) -> Result<T> {
        let outcome = (&mut self.rx)
            .await
            .map_err(|_| CapwireError::connection_closed("promise store dropped"))?;
        let value = outcome?;
        serde_json::from_value(value).map_err(|e| {
            CapwireError::protocol(format!(
                "result of [{}] does not match the expected type: {}",
                self.id, e
            ))
        })
    }
}

impl Drop for PendingPromise {
    fn drop(&mut self) {
        if let Some(state) = self.store.upgrade() {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.pending.remove(&self.id).is_some() && state.closed.is_none() {
                state.abandoned.insert(self.id.clone());
            }
        }
    }
}

impl std::fmt::Debug for PendingPromise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingPromise").field("id", &self.id).finish()
    }
}
