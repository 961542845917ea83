//! # Execution Registry
//!
//! Process-wide map of running attack executions keyed by execution id.
//!
//! ```text
//!   start ──► begin_start(id) ──► [launch sidecars] ──► insert(id) ──► ticket dropped
//!                  │
//!   stop ─────► cancel_pending(id) ─── marks the ticket; start finishes what it launched
//!         └──► remove(id) ──► finish execution
//! ```
//!
//! Entries are wrapped in an async mutex so that `status` and `stop` on the
//! same execution observe a consistent view. The map lock itself is a
//! `std::sync::RwLock` held only for map operations, never across awaits.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

type Pending = Arc<RwLock<HashMap<Uuid, watch::Sender<bool>>>>;

/// Running executions of type `T`.
pub struct ExecutionRegistry<T> {
    entries: RwLock<HashMap<Uuid, Arc<Mutex<T>>>>,
    pending: Pending,
}

impl<T> Default for ExecutionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> Error {
    Error::Internal(format!("lock poisoned: {}", e))
}

impl<T> ExecutionRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            pending: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers a running execution.
    pub fn insert(&self, id: Uuid, execution: T) -> Result<Arc<Mutex<T>>> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        if entries.contains_key(&id) {
            return Err(Error::Internal(format!("execution {id} is already running")));
        }
        let entry = Arc::new(Mutex::new(execution));
        entries.insert(id, Arc::clone(&entry));
        Ok(entry)
    }

    pub fn get(&self, id: &Uuid) -> Result<Option<Arc<Mutex<T>>>> {
        Ok(self.entries.read().map_err(poisoned)?.get(id).cloned())
    }

    pub fn remove(&self, id: &Uuid) -> Result<Option<Arc<Mutex<T>>>> {
        Ok(self.entries.write().map_err(poisoned)?.remove(id))
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(id))
            .unwrap_or(false)
    }

    pub fn ids(&self) -> Result<Vec<Uuid>> {
        Ok(self.entries.read().map_err(poisoned)?.keys().copied().collect())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every entry.
    pub fn drain(&self) -> Result<Vec<(Uuid, Arc<Mutex<T>>)>> {
        Ok(self.entries.write().map_err(poisoned)?.drain().collect())
    }

    // =========================================================================
    // Pending starts
    // =========================================================================

    /// Marks a start of `id` as in flight.
    ///
    /// The returned ticket observes [`Self::cancel_pending`] until dropped.
    pub fn begin_start(&self, id: Uuid) -> Result<StartTicket> {
        let (tx, rx) = watch::channel(false);
        self.pending.write().map_err(poisoned)?.insert(id, tx);
        Ok(StartTicket {
            id,
            cancelled: rx,
            pending: Arc::clone(&self.pending),
        })
    }

    /// Cancels an in-flight start. Returns true if one was pending.
    pub fn cancel_pending(&self, id: &Uuid) -> Result<bool> {
        let pending = self.pending.read().map_err(poisoned)?;
        match pending.get(id) {
            Some(tx) => {
                tx.send_replace(true);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Number of starts in flight.
    pub fn pending_len(&self) -> usize {
        self.pending.read().map(|p| p.len()).unwrap_or(0)
    }
}

/// Handle of an in-flight start.
#[derive(Debug)]
pub struct StartTicket {
    id: Uuid,
    cancelled: watch::Receiver<bool>,
    pending: Pending,
}

impl StartTicket {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }
}

impl Drop for StartTicket {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.write() {
            pending.remove(&self.id);
        }
    }
}
