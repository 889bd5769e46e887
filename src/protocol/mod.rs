//! Agent-control wire protocol engine.
//!
//! This module implements everything between the encrypted byte stream and a caller
//! waiting for the answer to a command: framing, event decoding, command encoding,
//! invoke-id correlation, and the session's connection lifecycle.
//!
//! # Overview
//!
//! The server speaks a stateful, text based protocol over one long-lived connection.
//! Commands sent by the client are answered asynchronously, and the server interleaves
//! unsolicited notifications (incoming calls, forced line release) with those answers
//! on the same stream. Every command carries a short-lived invoke id which the server
//! echoes back; it is the only thing tying an answer to its question.
//!
//! Data flows one way through the engine:
//!
//! ```text
//! bytes -> FrameReader -> record -> Event::decode -> session loop -+-> Notifications
//!                                                                  '-> RequestTable -> caller
//! ```
//!
//! # Key Components
//!
//! - [`Event`]: A decoded server record.
//! - [`Command`]: An outgoing command and its wire encoding.
//! - [`FrameReader`]: Cuts the stream into records, in one of two [`Framing`] modes.
//! - [`InvokeIdPool`]: Hands out invoke ids as RAII [`IdLease`]s.
//! - [`Transport`]: Abstraction over the duplex stream (TCP or legacy TLS).
//! - [`Notifications`]: Subscriber side of the bounded notification queue.
//!
//! # Binary Format
//!
//! Records are single-byte Windows-1251 text. A fixed 55 character header (keyword, type,
//! client, process id, invoke id, segment count) is followed by `RS`-prefixed data
//! segments and a terminator: `ETX` for a final record, `ETB` for a continued one.
//!
//! # Concurrency
//!
//! One reader thread feeds a bounded queue; one session thread drains it. Callers block
//! on their own thread until the session hands them the terminal event for their invoke
//! id, or until shutdown wakes them with [`ConnectionClosed`](crate::Error::ConnectionClosed).
//!
//! # See Also
//!
//! - [`Client`](crate::Client): Owns the threads and exposes command invocation.
//! - [`agent`](crate::agent): Agent operations built on top of the engine.
pub(crate) mod command;
pub(crate) mod event;
pub(crate) mod frame;
pub(crate) mod notify;
pub(crate) mod pool;
pub(crate) mod session;
pub(crate) mod table;
mod thread;
mod transport;

pub(crate) use session::{Control, Inbound, Session, StateCell, read_events};
pub(crate) use table::{Delivery, PendingRequest, RequestTable};
pub(crate) use thread::Worker;
pub(crate) use transport::CommandWriter;

pub use command::{Command, EncodeError, Origin};
pub use event::{
    DecodeError, ETB, ETX, Event, EventKind, MessageType, Payload, RS, SESSION_START,
    STARTUP_FLAG,
};
pub use frame::{FrameReader, Framing};
pub use notify::{Notifications, Overflow};
pub use pool::{Exhaustion, IdLease, InvokeIdPool, PoolError};
pub use session::{ConnectionState, ShutdownReason};
pub use transport::{TlsTransport, Transport, TransportError};
