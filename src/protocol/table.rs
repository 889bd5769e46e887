//! In-flight command registry.
//!
//! One `RwLock` guards both the entry map and the closed flag. Registration and removal
//! take the write lock; delivery takes the read lock. Shutdown flips the closed flag
//! and signals every entry inside one write-locked section, so a concurrent
//! registration is either signalled or rejected, never stranded.
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, warn};

use super::event::Event;

/// What a pending command can be woken with.
#[derive(Debug)]
pub(crate) enum Delivery {
    Event(Event),
    Shutdown,
}

#[derive(Debug, Default)]
struct Entries {
    closed: bool,
    waiting: HashMap<u32, Sender<Delivery>>,
}

#[derive(Debug, Default)]
pub(crate) struct RequestTable {
    entries: RwLock<Entries>,
}

/// Table registration returned when the table has already been closed.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Closed;

impl RequestTable {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `invoke_id`. The caller holds the id's lease, so it is not live elsewhere.
    pub(crate) fn register(self: &Arc<Self>, invoke_id: u32) -> Result<PendingRequest, Closed> {
        let mut entries = self.write();
        if entries.closed {
            return Err(Closed);
        }

        let (tx, rx) = channel::unbounded();
        if entries.waiting.insert(invoke_id, tx).is_some() {
            warn!("invoke id {invoke_id} was still registered; replacing stale entry");
        }
        Ok(PendingRequest {
            invoke_id,
            completion: rx,
            table: Arc::clone(self),
        })
    }

    /// Hands `event` to the command waiting on its invoke id. Returns the event back if
    /// nobody is waiting for it.
    pub(crate) fn deliver(&self, event: Event) -> Result<(), Event> {
        let entries = self.read();
        match entries.waiting.get(&event.invoke_id) {
            Some(waiter) => {
                // The entry is removed before its receiver drops, so this cannot fail
                // while the read lock is held.
                if waiter.send(Delivery::Event(event)).is_err() {
                    debug!("pending command dropped its receiver");
                }
                Ok(())
            }
            None => Err(event),
        }
    }

    /// Rejects further registrations and wakes every waiting command. Returns how many
    /// were signalled.
    pub(crate) fn close(&self) -> usize {
        let mut entries = self.write();
        entries.closed = true;
        for (invoke_id, waiter) in &entries.waiting {
            if waiter.send(Delivery::Shutdown).is_err() {
                debug!("pending command {invoke_id} already gone");
            }
        }
        entries.waiting.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.read().waiting.len()
    }

    fn remove(&self, invoke_id: u32) {
        self.write().waiting.remove(&invoke_id);
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A registered command. Dropping it removes the table entry.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    invoke_id: u32,
    completion: Receiver<Delivery>,
    table: Arc<RequestTable>,
}

impl PendingRequest {
    pub(crate) fn completion(&self) -> &Receiver<Delivery> {
        &self.completion
    }

    pub(crate) fn invoke_id(&self) -> u32 {
        self.invoke_id
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.table.remove(self.invoke_id);
    }
}
