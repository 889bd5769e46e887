//! Invoke-id allocation.
//!
//! Ids are handed out from a fixed range and come back through [`IdLease`], which
//! releases on drop. Freed ids join the back of the free list, so the most recently
//! released id is the last to be reissued and a late response for it cannot be mistaken
//! for the answer to a fresh command.
use std::{
    collections::{HashSet, VecDeque},
    ops::RangeInclusive,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use log::error;
use thiserror::Error;

/// The protocol's invoke id column holds four digits; zero is reserved for notifications.
pub const DEFAULT_INVOKE_IDS: RangeInclusive<u32> = 1..=9999;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("all {0} invoke ids are in use")]
    Exhausted(usize),

    #[error("invoke id {0} is not currently held")]
    NotHeld(u32),
}

/// What [`InvokeIdPool::acquire`] does when every id is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Exhaustion {
    #[default]
    Fail,
    /// Wait up to the given time for an id to come back.
    Wait(Duration),
}

#[derive(Debug)]
struct Ids {
    free: VecDeque<u32>,
    held: HashSet<u32>,
}

#[derive(Debug)]
pub struct InvokeIdPool {
    ids: Mutex<Ids>,
    returned: Condvar,
    capacity: usize,
    exhaustion: Exhaustion,
}

impl InvokeIdPool {
    pub fn new(range: RangeInclusive<u32>, exhaustion: Exhaustion) -> Arc<Self> {
        let free: VecDeque<u32> = range.collect();
        Arc::new(Self {
            capacity: free.len(),
            ids: Mutex::new(Ids {
                free,
                held: HashSet::new(),
            }),
            returned: Condvar::new(),
            exhaustion,
        })
    }

    pub fn acquire(self: &Arc<Self>) -> Result<IdLease, PoolError> {
        let mut ids = self.lock();
        let deadline = match self.exhaustion {
            Exhaustion::Fail => None,
            Exhaustion::Wait(limit) => Some(Instant::now() + limit),
        };

        loop {
            if let Some(id) = ids.free.pop_front() {
                ids.held.insert(id);
                return Ok(IdLease {
                    id,
                    pool: Arc::clone(self),
                });
            }

            let Some(deadline) = deadline else {
                return Err(PoolError::Exhausted(self.capacity));
            };
            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::Exhausted(self.capacity));
            }
            ids = self
                .returned
                .wait_timeout(ids, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Returns `id` to the pool. Releasing an id that is not held is rejected and
    /// leaves the pool untouched.
    pub fn release(&self, id: u32) -> Result<(), PoolError> {
        let mut ids = self.lock();
        if !ids.held.remove(&id) {
            return Err(PoolError::NotHeld(id));
        }
        ids.free.push_back(id);
        drop(ids);
        self.returned.notify_one();
        Ok(())
    }

    pub fn in_use(&self) -> usize {
        self.lock().held.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, Ids> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An invoke id held until drop.
#[derive(Debug)]
pub struct IdLease {
    id: u32,
    pool: Arc<InvokeIdPool>,
}

impl IdLease {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for IdLease {
    fn drop(&mut self) {
        if let Err(e) = self.pool.release(self.id) {
            error!("invoke id lease out of sync with pool: {e}");
        }
    }
}
