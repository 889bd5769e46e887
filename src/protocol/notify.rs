//! Bounded delivery of unsolicited server events.
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use log::warn;

use super::event::Event;

pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 128;

/// What the session does when subscribers fall behind and the queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Overflow {
    /// Wait for room. Reading from the connection stalls until subscribers catch up,
    /// though a stop request still gets through.
    #[default]
    Block,
    /// Discard the newest notification and count it.
    DropNewest,
}

/// Session-side end of the queue.
#[derive(Debug)]
pub(crate) struct NotificationSink {
    tx: Sender<Event>,
    overflow: Overflow,
    dropped: Arc<AtomicU64>,
}

/// Outcome of offering a notification to the sink.
#[derive(Debug)]
pub(crate) enum Offer {
    Delivered,
    Dropped,
    /// The queue is full and the policy is to wait; the caller decides how.
    Full(Event),
    /// Every subscriber handle is gone.
    Unobserved,
}

pub(crate) fn queue(capacity: usize, overflow: Overflow) -> (NotificationSink, Notifications) {
    let (tx, rx) = channel::bounded(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        NotificationSink {
            tx,
            overflow,
            dropped: Arc::clone(&dropped),
        },
        Notifications { rx, dropped },
    )
}

impl NotificationSink {
    pub(crate) fn offer(&self, event: Event) -> Offer {
        match self.tx.try_send(event) {
            Ok(()) => Offer::Delivered,
            Err(TrySendError::Disconnected(_)) => Offer::Unobserved,
            Err(TrySendError::Full(event)) => match self.overflow {
                Overflow::Block => Offer::Full(event),
                Overflow::DropNewest => {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!("notification queue full, dropped {event} ({total} so far)");
                    Offer::Dropped
                }
            },
        }
    }

    /// Sender used to wait on a full queue alongside other channels.
    pub(crate) fn sender(&self) -> &Sender<Event> {
        &self.tx
    }
}

/// Subscriber handle for server notifications.
///
/// Handles are cheap to clone; every clone reads from the same queue, so each
/// notification is seen by exactly one of them. Once the session shuts down the queue
/// drains and then reports closure.
#[derive(Debug, Clone)]
pub struct Notifications {
    rx: Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl Notifications {
    /// Blocks for the next notification; `None` once the session has shut down.
    pub fn recv(&self) -> Option<Event> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Event, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<Event, TryRecvError> {
        self.rx.try_recv()
    }

    /// Underlying channel, for use in `crossbeam::select!`.
    pub fn receiver(&self) -> &Receiver<Event> {
        &self.rx
    }

    /// Number of notifications discarded under [`Overflow::DropNewest`].
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn iter(&self) -> channel::Iter<'_, Event> {
        self.rx.iter()
    }
}

impl<'a> IntoIterator for &'a Notifications {
    type Item = Event;
    type IntoIter = channel::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.rx.iter()
    }
}
