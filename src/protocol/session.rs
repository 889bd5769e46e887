//! Background reader and the coordinating session loop.
//!
//! The reader thread owns the read half of the connection: it cuts records, decodes
//! them, and queues events in arrival order. When the stream fails it queues one final
//! [`Inbound::Closed`] and exits.
//!
//! The session thread consumes that queue. Notifications go to subscribers, everything
//! else is matched against pending commands by invoke id. A stop request or a reader
//! failure ends the loop and runs the shutdown sequence exactly once.
use std::{
    fmt, io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crossbeam::channel::{Receiver, Sender};
use log::{debug, error, info, trace, warn};

use super::{
    event::{Event, EventKind},
    frame::FrameReader,
    notify::{NotificationSink, Offer},
    table::RequestTable,
    transport::Transport,
};

/// Connection lifecycle as seen by every thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
}

/// One-way Open to Closed flag.
#[derive(Debug, Default)]
pub(crate) struct StateCell {
    closed: AtomicBool,
}

impl StateCell {
    pub(crate) fn get(&self) -> ConnectionState {
        if self.closed.load(Ordering::SeqCst) {
            ConnectionState::Closed
        } else {
            ConnectionState::Open
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.get() == ConnectionState::Closed
    }

    /// Returns whether this call performed the transition.
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}

/// Messages from the reader thread.
#[derive(Debug)]
pub(crate) enum Inbound {
    Event(Event),
    Closed(io::Error),
}

#[derive(Debug)]
pub(crate) enum Control {
    Stop,
}

/// Why the session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// A stop was requested.
    Stopped,
    /// The connection failed.
    Failed(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Stopped => write!(f, "stopped"),
            ShutdownReason::Failed(cause) => write!(f, "connection failed: {cause}"),
        }
    }
}

pub(crate) fn read_events<T: Transport>(
    mut frames: FrameReader<T>,
    events: Sender<Inbound>,
    state: Arc<StateCell>,
) {
    loop {
        let record = match frames.read_record() {
            Ok(record) => record,
            Err(e) => {
                if state.is_closed() {
                    debug!("reader stopping: {e}");
                } else if e.kind() == io::ErrorKind::UnexpectedEof {
                    error!("EOF received: {e}");
                } else {
                    error!("stream error: {e}");
                }
                if events.send(Inbound::Closed(e)).is_err() {
                    debug!("session already gone");
                }
                return;
            }
        };

        trace!("event received: {record:?}");
        match Event::decode(&record) {
            Ok(event) => {
                info!(
                    "event decoded: keyword={} type={} client={} process_id={} invoke_id={} segments={} incomplete={}",
                    event.keyword,
                    event.message_type.as_char(),
                    event.client,
                    event.process_id,
                    event.invoke_id,
                    event.segments,
                    event.incomplete
                );
                if events.send(Inbound::Event(event)).is_err() {
                    debug!("event queue closed, reader stopping");
                    return;
                }
            }
            Err(e) => error!("failed to decode event: {e}"),
        }
    }
}

pub(crate) struct Session {
    pub(crate) events: Receiver<Inbound>,
    pub(crate) control: Receiver<Control>,
    pub(crate) sink: NotificationSink,
    pub(crate) table: Arc<RequestTable>,
    pub(crate) state: Arc<StateCell>,
    pub(crate) connection: Box<dyn Transport>,
}

impl Session {
    pub(crate) fn run(self) -> ShutdownReason {
        let reason = loop {
            crossbeam::select! {
                recv(self.events) -> msg => match msg {
                    Ok(Inbound::Event(event)) => {
                        if let Some(reason) = self.route(event) {
                            break reason;
                        }
                    }
                    Ok(Inbound::Closed(e)) => break ShutdownReason::Failed(e.to_string()),
                    Err(_) => break ShutdownReason::Failed("reader exited".to_string()),
                },
                recv(self.control) -> _ => break ShutdownReason::Stopped,
            }
        };

        self.shutdown(&reason);
        reason
    }

    fn route(&self, event: Event) -> Option<ShutdownReason> {
        match event.kind() {
            EventKind::Notification => self.notify(event),
            EventKind::Response => {
                match self.table.deliver(event) {
                    Ok(()) => {}
                    Err(event) => warn!("no pending command for {event}, dropping"),
                }
                None
            }
        }
    }

    fn notify(&self, event: Event) -> Option<ShutdownReason> {
        match self.sink.offer(event) {
            Offer::Delivered | Offer::Dropped => None,
            Offer::Unobserved => {
                debug!("no notification subscribers left");
                None
            }
            Offer::Full(event) => {
                debug!("notification queue full, waiting for subscribers");
                crossbeam::select! {
                    send(self.sink.sender(), event) -> sent => {
                        if sent.is_err() {
                            debug!("no notification subscribers left");
                        }
                        None
                    }
                    recv(self.control) -> _ => Some(ShutdownReason::Stopped),
                }
            }
        }
    }

    fn shutdown(self, reason: &ShutdownReason) {
        let Session {
            events,
            control: _,
            sink,
            table,
            state,
            connection,
        } = self;

        state.close();
        if let Err(e) = connection.shutdown() {
            warn!("failed to close connection: {e}");
        }
        drop(sink);
        drop(events);
        let released = table.close();
        info!("session {reason}; released {released} pending commands");
    }
}
