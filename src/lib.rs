//! Client for the Proactive Contact agent-control protocol.
//!
//! A [`Client`] holds one session with the dialer: it performs the startup handshake,
//! correlates answers with the commands that asked for them, and forwards unsolicited
//! notifications to subscribers. Agent operations live in [`agent`]; the wire engine
//! underneath is in [`protocol`].
pub mod agent;
pub mod cli;
mod client;
mod error;
mod options;
pub mod protocol;
#[cfg(test)]
mod test_support;

pub use client::{Cancellation, Client, Reply, Security};
pub use error::{Error, HandshakeError};
pub use options::ClientOptions;
pub use protocol::{ConnectionState, Notifications, ShutdownReason};
