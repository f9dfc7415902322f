//! In-flight request table keyed by rid.
//!
//! A slot is inserted when a request is sent and removed exactly once: when a
//! reply carrying its rid arrives, when the exchange fails, or when the
//! caller gives up on a timeout.

use grenache_common::protocol::error::{GrenacheError, Result};
use grenache_common::protocol::Reply;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

type Slot = oneshot::Sender<Result<Reply>>;

#[derive(Default)]
pub struct PendingRequests {
    slots: Mutex<HashMap<String, Slot>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `rid` and returns the receiver its outcome will arrive on.
    ///
    /// # Errors
    ///
    /// [`GrenacheError::RequestGeneric`] if `rid` is already in flight.
    pub fn insert(&self, rid: &str) -> Result<oneshot::Receiver<Result<Reply>>> {
        let mut slots = self.lock();
        if slots.contains_key(rid) {
            return Err(GrenacheError::RequestGeneric(format!(
                "request {} is already in flight",
                rid
            )));
        }

        let (tx, rx) = oneshot::channel();
        slots.insert(rid.to_string(), tx);
        Ok(rx)
    }

    /// Resolves the slot for `rid`. Returns false when no such slot exists.
    pub fn complete(&self, rid: &str, outcome: Result<Reply>) -> bool {
        match self.lock().remove(rid) {
            Some(slot) => {
                let _ = slot.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drops the slot for `rid` without resolving it.
    pub fn remove(&self, rid: &str) {
        self.lock().remove(rid);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
