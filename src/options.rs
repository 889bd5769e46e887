//! Session configuration.
use std::{ops::RangeInclusive, time::Duration};

use crate::protocol::{
    Exhaustion, Framing, Overflow,
    frame::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RECORD_LEN},
    notify::DEFAULT_NOTIFICATION_CAPACITY,
    pool::DEFAULT_INVOKE_IDS,
};

const DEFAULT_EVENT_QUEUE: usize = 128;
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CLIENT_NAME: &str = "apc";

/// Tunables for a [`Client`](crate::Client).
///
/// Defaults match the server's behavior: 4 KiB reads, four-digit invoke ids, and no
/// read or command deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Deadline for each read from the connection; expiry closes the session.
    pub read_timeout: Option<Duration>,
    /// How long to wait for the session-start notification.
    pub handshake_timeout: Option<Duration>,
    /// Default deadline for every command.
    pub command_timeout: Option<Duration>,
    pub chunk_size: usize,
    pub framing: Framing,
    pub max_record_len: usize,
    pub event_queue_capacity: usize,
    pub notification_capacity: usize,
    pub overflow: Overflow,
    pub invoke_ids: RangeInclusive<u32>,
    pub exhaustion: Exhaustion,
    /// Name stamped into the client column of every command.
    pub client_name: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            read_timeout: None,
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            command_timeout: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            framing: Framing::default(),
            max_record_len: DEFAULT_MAX_RECORD_LEN,
            event_queue_capacity: DEFAULT_EVENT_QUEUE,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
            overflow: Overflow::default(),
            invoke_ids: DEFAULT_INVOKE_IDS,
            exhaustion: Exhaustion::default(),
            client_name: DEFAULT_CLIENT_NAME.to_string(),
        }
    }
}

impl ClientOptions {
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_max_record_len(mut self, len: usize) -> Self {
        self.max_record_len = len;
        self
    }

    pub fn with_notification_capacity(mut self, capacity: usize, overflow: Overflow) -> Self {
        self.notification_capacity = capacity;
        self.overflow = overflow;
        self
    }

    pub fn with_invoke_ids(mut self, range: RangeInclusive<u32>, exhaustion: Exhaustion) -> Self {
        self.invoke_ids = range;
        self.exhaustion = exhaustion;
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }
}
