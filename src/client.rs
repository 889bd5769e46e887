//! Session client.
//!
//! A [`Client`] owns one connection for its whole life. Construction dials (or adopts) a
//! transport, starts the reader thread, and waits for the server's session-start
//! notification; only then does it start the session loop and hand the client back.
//! If the greeting is wrong or missing, the connection is closed, the reader is joined,
//! and construction fails.
//!
//! Commands run on the caller's thread. Several threads may share one client and issue
//! commands at the same time; each caller only ever sees the events carrying its own
//! invoke id.
//!
//! # Example
//! ```no_run
//! use apc::{Client, ClientOptions, Security, protocol::Command};
//!
//! let client = Client::connect("pds.example:22700", Security::Tls, ClientOptions::default())?;
//! let reply = client.invoke(&Command::new("AGTListJobs").arg("A"))?;
//! for record in &reply.data {
//!     println!("{:?}", record.payload);
//! }
//! client.close();
//! # Ok::<(), apc::Error>(())
//! ```
use std::{
    net::TcpStream,
    sync::{Arc, Mutex, OnceLock, PoisonError},
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::{
    ClientOptions,
    error::{Error, HandshakeError},
    protocol::{
        Command, CommandWriter, ConnectionState, Control, Delivery, Event, FrameReader,
        Inbound, InvokeIdPool, MessageType, Notifications, Origin, PendingRequest,
        RequestTable, Session, ShutdownReason, StateCell, TlsTransport, Transport,
        TransportError, Worker,
        notify, read_events,
    },
};

/// How [`Client::connect`] reaches the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Security {
    /// TLS with legacy versions allowed and verification disabled.
    #[default]
    Tls,
    /// Plain TCP, for servers behind a TLS-terminating proxy and for tests.
    Plain,
}

/// The outcome of one command: its terminal event plus any data records the server sent
/// under the same invoke id before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub event: Event,
    pub data: Vec<Event>,
}

impl Reply {
    /// Turns a busy or error-coded answer into [`Error::Rejected`].
    pub fn accepted(self) -> Result<Self, Error> {
        if !self.event.is_error() {
            return Ok(self);
        }
        let code = match self.event.payload.status() {
            Some(code) if !code.is_empty() => code.to_string(),
            _ if self.event.message_type == MessageType::Busy => "busy".to_string(),
            _ => String::new(),
        };
        Err(Error::Rejected {
            keyword: self.event.keyword,
            code,
        })
    }
}

/// Cancels commands waiting on it. Clones share one trigger.
#[derive(Debug, Clone)]
pub struct Cancellation {
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    fired: Receiver<()>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            trigger: Arc::new(Mutex::new(Some(tx))),
            fired: rx,
        }
    }

    /// Wakes every command waiting on this token, now and in the future.
    pub fn cancel(&self) {
        self.trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

#[derive(Debug, Default)]
struct Workers {
    reader: Option<Worker<()>>,
    session: Option<Worker<ShutdownReason>>,
}

/// A live agent session.
pub struct Client {
    pool: Arc<InvokeIdPool>,
    table: Arc<RequestTable>,
    state: Arc<StateCell>,
    writer: CommandWriter,
    notifications: Notifications,
    control: Sender<Control>,
    command_timeout: Option<Duration>,
    workers: Mutex<Workers>,
    reason: OnceLock<ShutdownReason>,
}

impl Client {
    /// Dials `addr` (`host:port`) and opens a session.
    pub fn connect(addr: &str, security: Security, options: ClientOptions) -> Result<Self, Error> {
        info!("connecting to {addr} ({security:?})");
        match security {
            Security::Tls => Self::with_transport(TlsTransport::connect(addr)?, options),
            Security::Plain => Self::with_transport(TcpStream::connect(addr)?, options),
        }
    }

    /// Opens a session over an already established connection.
    pub fn with_transport<T: Transport>(transport: T, options: ClientOptions) -> Result<Self, Error> {
        let mut reader_stream = transport.try_clone()?;
        reader_stream.set_read_timeout(options.read_timeout)?;
        let writer_stream = transport.try_clone()?;
        let connection: Box<dyn Transport> = Box::new(transport);

        let state = Arc::new(StateCell::default());
        let (inbound_tx, inbound_rx) = channel::bounded(options.event_queue_capacity.max(1));
        let frames = FrameReader::new(
            reader_stream,
            options.framing,
            options.chunk_size,
            options.max_record_len,
        );
        let reader_state = Arc::clone(&state);
        let reader = Worker::spawn("apc-reader", move || {
            read_events(frames, inbound_tx, reader_state)
        })?;

        if let Err(e) = handshake(&inbound_rx, options.handshake_timeout) {
            error!("server cannot accept new clients: {e}");
            state.close();
            if let Err(e) = connection.shutdown() {
                warn!("failed to close connection: {e}");
            }
            drop(inbound_rx);
            reader.join();
            return Err(e.into());
        }
        info!("session started");

        let table = RequestTable::new();
        let (sink, notifications) =
            notify::queue(options.notification_capacity, options.overflow);
        let (control, control_rx) = channel::unbounded();
        let session = Session {
            events: inbound_rx,
            control: control_rx,
            sink,
            table: Arc::clone(&table),
            state: Arc::clone(&state),
            connection,
        };
        let session = Worker::spawn("apc-session", move || session.run())?;

        Ok(Self {
            pool: InvokeIdPool::new(options.invoke_ids, options.exhaustion),
            table,
            state,
            writer: CommandWriter::new(writer_stream, Origin::new(options.client_name)),
            notifications,
            control,
            command_timeout: options.command_timeout,
            workers: Mutex::new(Workers {
                reader: Some(reader),
                session: Some(session),
            }),
            reason: OnceLock::new(),
        })
    }

    /// Sends `command` and waits for its answer, bounded by the configured command
    /// timeout if there is one.
    pub fn invoke(&self, command: &Command) -> Result<Reply, Error> {
        self.exchange(command, self.command_timeout, None)
    }

    pub fn invoke_timeout(&self, command: &Command, timeout: Duration) -> Result<Reply, Error> {
        self.exchange(command, Some(timeout), None)
    }

    pub fn invoke_cancellable(
        &self,
        command: &Command,
        cancel: &Cancellation,
    ) -> Result<Reply, Error> {
        self.exchange(command, self.command_timeout, Some(cancel))
    }

    /// Subscriber handle for unsolicited events.
    pub fn notifications(&self) -> Notifications {
        self.notifications.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Invoke ids currently held by in-flight commands.
    pub fn in_flight(&self) -> usize {
        self.pool.in_use()
    }

    /// Asks the session loop to shut down. Returns immediately.
    pub fn stop(&self) {
        if self.control.send(Control::Stop).is_err() {
            debug!("session loop already finished");
        }
    }

    /// Waits for the session loop and the reader to finish, and reports why the session
    /// ended.
    pub fn wait(&self) -> ShutdownReason {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = workers.session.take() {
            let reason = session
                .join()
                .unwrap_or_else(|| ShutdownReason::Failed("session loop panicked".to_string()));
            let _ = self.reason.set(reason);
        }
        if let Some(reader) = workers.reader.take() {
            reader.join();
        }
        self.reason
            .get()
            .cloned()
            .unwrap_or_else(|| ShutdownReason::Failed("session loop panicked".to_string()))
    }

    /// Stops the session and waits for it.
    pub fn close(self) -> ShutdownReason {
        self.stop();
        self.wait()
    }

    fn exchange(
        &self,
        command: &Command,
        timeout: Option<Duration>,
        cancel: Option<&Cancellation>,
    ) -> Result<Reply, Error> {
        if self.state.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if cancel.is_some_and(Cancellation::is_cancelled) {
            return Err(Error::Cancelled);
        }

        let lease = self.pool.acquire()?;
        let pending = self
            .table
            .register(lease.id())
            .map_err(|_| Error::ConnectionClosed)?;

        let reply = match self.writer.write_command(command, lease.id()) {
            Ok(()) => await_reply(&pending, timeout, cancel),
            Err(TransportError::Encode(e)) => Err(Error::Encode(e)),
            Err(TransportError::Io(e)) => {
                if !self.state.is_closed() {
                    error!("failed to send {}: {e}", command.keyword());
                    self.stop();
                }
                Err(Error::ConnectionClosed)
            }
        };

        // Entry first, then the id, so the id is never free while still routable.
        drop(pending);
        drop(lease);
        reply
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
        self.wait();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state.get())
            .field("in_flight", &self.pool.in_use())
            .finish_non_exhaustive()
    }
}

fn handshake(events: &Receiver<Inbound>, timeout: Option<Duration>) -> Result<(), HandshakeError> {
    let first = match timeout {
        Some(limit) => events
            .recv_timeout(limit)
            .map_err(|_| HandshakeError::Timeout(limit))?,
        None => events
            .recv()
            .map_err(|_| HandshakeError::Closed("reader exited".to_string()))?,
    };

    match first {
        Inbound::Event(event) if event.is_start() => Ok(()),
        Inbound::Event(event) => Err(HandshakeError::Unexpected(event.to_string())),
        Inbound::Closed(e) => Err(HandshakeError::Closed(e.to_string())),
    }
}

fn await_reply(
    pending: &PendingRequest,
    timeout: Option<Duration>,
    cancel: Option<&Cancellation>,
) -> Result<Reply, Error> {
    let deadline = timeout.map(|limit| Instant::now() + limit);
    let idle = channel::never();
    let cancelled = cancel.map_or(&idle, |c| &c.fired);
    let mut data = Vec::new();

    loop {
        let expired = deadline.map_or_else(channel::never, channel::at);
        crossbeam::select! {
            recv(pending.completion()) -> delivery => match delivery {
                Ok(Delivery::Event(event)) => match event.message_type {
                    MessageType::Data => data.push(event),
                    kind if kind.is_terminal() => return Ok(Reply { event, data }),
                    _ => debug!("invoke {} acknowledged by {event}", pending.invoke_id()),
                },
                Ok(Delivery::Shutdown) | Err(_) => return Err(Error::ConnectionClosed),
            },
            recv(cancelled) -> _ => return Err(Error::Cancelled),
            recv(expired) -> _ => {
                return Err(Error::Timeout(timeout.unwrap_or_default()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Barrier},
        thread,
    };

    use super::*;
    use crate::{
        protocol::{ETB, ETX, Exhaustion, Framing, Overflow},
        test_support::{FakeServer, Received, Script},
    };

    fn spawn_invokes(client: &Arc<Client>, count: usize) -> Vec<thread::JoinHandle<Result<Reply, Error>>> {
        let barrier = Arc::new(Barrier::new(count));
        (0..count)
            .map(|i| {
                let client = Arc::clone(client);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    client.invoke(&Command::new(format!("AGTCmd{i}")))
                })
            })
            .collect()
    }

    #[test]
    fn client_handshake_accepts_session_start() {
        let server = FakeServer::start(|mut script: Script| script.drain());
        let client = server.client();

        assert_eq!(client.state(), ConnectionState::Open);
        assert_eq!(client.close(), ShutdownReason::Stopped);
    }

    #[test]
    fn client_handshake_rejects_other_first_event() {
        let (tx, rx) = channel::bounded(1);
        let server = FakeServer::start_raw(move |mut script: Script| {
            script.notify("ERROR", &["E70000"]);
            // The client must hang up without sending anything.
            tx.send(script.next_command().is_none()).unwrap();
        });

        match server.connect(FakeServer::options()).unwrap_err() {
            Error::Handshake(HandshakeError::Unexpected(event)) => assert!(event.starts_with("ERROR")),
            other => panic!("expected handshake failure, got {other:?}"),
        }
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn client_handshake_fails_on_hangup() {
        let server = FakeServer::start_raw(|script: Script| drop(script));

        assert!(matches!(
            server.connect(FakeServer::options()).unwrap_err(),
            Error::Handshake(HandshakeError::Closed(_))
        ));
    }

    #[test]
    fn client_handshake_times_out() {
        let server = FakeServer::start_raw(|mut script: Script| script.drain());
        let options = ClientOptions::default().with_handshake_timeout(Some(Duration::from_millis(100)));

        assert!(matches!(
            server.connect(options).unwrap_err(),
            Error::Handshake(HandshakeError::Timeout(_))
        ));
    }

    #[test]
    fn client_handshake_skips_malformed_greeting() {
        let server = FakeServer::start_raw(|mut script: Script| {
            script.send_raw(b"not a record\x03");
            script.greet();
            script.serve_rest();
        });

        let client = server.client();
        client.invoke(&Command::new("AGTLogoff")).unwrap();
    }

    #[test]
    fn client_concurrent_commands_get_their_own_answers() {
        const N: usize = 16;
        let server = FakeServer::start(|mut script: Script| {
            let mut received: Vec<Received> = (0..N).map(|_| script.expect_command()).collect();
            received.reverse();
            for command in &received {
                let echo = format!("ECHO,{}", command.keyword);
                script.respond(command, 'R', &[echo.as_str()], ETX);
            }
            script.serve_rest();
        });

        let client = Arc::new(server.client());
        for (i, handle) in spawn_invokes(&client, N).into_iter().enumerate() {
            let reply = handle.join().unwrap().unwrap();
            let expected = format!("AGTCmd{i}");
            assert_eq!(reply.event.keyword, expected);
            assert_eq!(reply.event.payload.field("ECHO"), Some(expected.as_str()));
        }
        assert_eq!(client.in_flight(), 0);
    }

    #[test]
    fn client_shutdown_releases_pending_commands() {
        const K: usize = 8;
        let (seen_tx, seen_rx) = channel::bounded(1);
        let server = FakeServer::start(move |mut script: Script| {
            for _ in 0..K {
                script.expect_command();
            }
            seen_tx.send(()).unwrap();
            script.drain();
        });

        let client = Arc::new(server.client());
        let handles = spawn_invokes(&client, K);
        seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(client.in_flight(), K);

        client.stop();
        let started = Instant::now();
        for handle in handles {
            assert!(matches!(handle.join().unwrap(), Err(Error::ConnectionClosed)));
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(client.in_flight(), 0);
        assert_eq!(client.wait(), ShutdownReason::Stopped);
        assert!(client.is_closed());
    }

    /// TCP connection whose reads work but whose writes always fail.
    struct BrokenWrites(TcpStream);

    impl std::io::Read for BrokenWrites {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            std::io::Read::read(&mut self.0, buf)
        }
    }

    impl std::io::Write for BrokenWrites {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Transport for BrokenWrites {
        fn try_clone(&self) -> std::io::Result<Self> {
            Ok(Self(self.0.try_clone()?))
        }

        fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
            Transport::set_read_timeout(&mut self.0, timeout)
        }

        fn shutdown(&self) -> std::io::Result<()> {
            Transport::shutdown(&self.0)
        }
    }

    #[test]
    fn client_write_failure_closes_session() {
        let server = FakeServer::start(|mut script: Script| script.drain());
        let stream = TcpStream::connect(server.addr()).unwrap();
        let client = Client::with_transport(BrokenWrites(stream), FakeServer::options()).unwrap();

        assert!(matches!(
            client.invoke(&Command::new("AGTLogon")),
            Err(Error::ConnectionClosed)
        ));
        assert_eq!(client.wait(), ShutdownReason::Stopped);
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(client.in_flight(), 0);
        assert!(matches!(
            client.invoke(&Command::new("AGTLogoff")),
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn client_encode_error_keeps_session_open() {
        let server = FakeServer::start(|mut script: Script| script.serve_rest());
        let client = server.client();

        assert!(matches!(
            client.invoke(&Command::new("AGTLogon").arg("a\u{1e}b")),
            Err(Error::Encode(_))
        ));
        assert_eq!(client.state(), ConnectionState::Open);
        client.invoke(&Command::new("AGTLogoff")).unwrap();
    }

    #[test]
    fn client_commands_after_shutdown_fail_fast() {
        let server = FakeServer::start(|mut script: Script| script.drain());
        let client = server.client();
        client.stop();
        client.wait();

        assert!(matches!(
            client.invoke(&Command::new("AGTLogoff")),
            Err(Error::ConnectionClosed)
        ));
        assert_eq!(client.in_flight(), 0);
        assert!(client.notifications().recv().is_none());
    }

    #[test]
    fn client_server_hangup_fails_pending_commands() {
        let server = FakeServer::start(|mut script: Script| {
            script.expect_command();
        });

        let client = server.client();
        assert!(matches!(
            client.invoke(&Command::new("AGTLogon")),
            Err(Error::ConnectionClosed)
        ));
        assert!(matches!(client.wait(), ShutdownReason::Failed(_)));
        assert_eq!(client.in_flight(), 0);
    }

    #[test]
    fn client_read_timeout_closes_session() {
        let server = FakeServer::start(|mut script: Script| script.drain());
        let options = FakeServer::options().with_read_timeout(Duration::from_millis(100));
        let client = server.connect(options).unwrap();

        assert!(matches!(client.wait(), ShutdownReason::Failed(_)));
        assert!(client.is_closed());
    }

    #[test]
    fn client_timeout_releases_invoke_id() {
        let (late_tx, late_rx) = channel::bounded::<Received>(1);
        let server = FakeServer::start(move |mut script: Script| {
            let first = script.expect_command();
            late_tx.send(first.clone()).unwrap();
            let second = script.expect_command();
            // Answer the abandoned command late; nobody is waiting for it any more.
            script.respond(&first, 'R', &["M00000"], ETX);
            script.respond(&second, 'R', &["M00000"], ETX);
            script.serve_rest();
        });

        let options = FakeServer::options().with_invoke_ids(1..=2, Exhaustion::Fail);
        let client = server.connect(options).unwrap();
        assert!(matches!(
            client.invoke_timeout(&Command::new("AGTSlow"), Duration::from_millis(50)),
            Err(Error::Timeout(_))
        ));
        assert_eq!(client.in_flight(), 0);
        late_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let reply = client.invoke(&Command::new("AGTFast")).unwrap();
        assert_eq!(reply.event.keyword, "AGTFast");
    }

    #[test]
    fn client_cancellation_releases_invoke_id() {
        let (seen_tx, seen_rx) = channel::bounded(1);
        let server = FakeServer::start(move |mut script: Script| {
            script.expect_command();
            seen_tx.send(()).unwrap();
            script.serve_rest();
        });

        let client = Arc::new(server.client());
        let cancel = Cancellation::new();
        let waiter = {
            let client = Arc::clone(&client);
            let cancel = cancel.clone();
            thread::spawn(move || client.invoke_cancellable(&Command::new("AGTSlow"), &cancel))
        };

        seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        cancel.cancel();
        assert!(matches!(waiter.join().unwrap(), Err(Error::Cancelled)));
        assert_eq!(client.in_flight(), 0);

        assert!(matches!(
            client.invoke_cancellable(&Command::new("AGTSlow"), &cancel),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn client_exhausted_ids_fail_immediately() {
        let (seen_tx, seen_rx) = channel::bounded(1);
        let server = FakeServer::start(move |mut script: Script| {
            script.expect_command();
            seen_tx.send(()).unwrap();
            script.drain();
        });

        let options = FakeServer::options().with_invoke_ids(1..=1, Exhaustion::Fail);
        let client = Arc::new(server.connect(options).unwrap());
        let blocked = {
            let client = Arc::clone(&client);
            thread::spawn(move || client.invoke(&Command::new("AGTSlow")))
        };
        seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(matches!(
            client.invoke(&Command::new("AGTLogoff")),
            Err(Error::Exhausted(_))
        ));
        client.stop();
        assert!(matches!(blocked.join().unwrap(), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn client_malformed_record_does_not_stop_session() {
        let server = FakeServer::start(|mut script: Script| {
            script.send_raw(b"AGTBroken\x03");
            script.notify("AGTCallNotify", &["CURPHONE,1"]);
            script.serve_rest();
        });

        let client = server.client();
        let notifications = client.notifications();
        let event = notifications.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.keyword, "AGTCallNotify");
        assert!(notifications.try_recv().is_err());
        client.invoke(&Command::new("AGTLogoff")).unwrap();
    }

    #[test]
    fn client_collects_multipart_answer() {
        let server = FakeServer::start(|mut script: Script| {
            let command = script.expect_command();
            script.respond(&command, 'P', &["M00001"], ETX);
            script.respond(&command, 'D', &["JOB,outbound1"], ETB);
            script.respond(&command, 'D', &["JOB,outbound2"], ETX);
            script.respond(&command, 'R', &["M00000"], ETX);
            script.serve_rest();
        });

        let reply = server.client().invoke(&Command::new("AGTListJobs")).unwrap();
        assert_eq!(reply.data.len(), 2);
        assert!(reply.data[0].incomplete);
        assert_eq!(reply.event.payload.status(), Some("M00000"));
    }

    #[test]
    fn client_chunk_boundary_framing_drops_split_records() {
        let server = FakeServer::start(|mut script: Script| {
            let command = script.expect_command();
            let raw = crate::protocol::event::tests::record(&command.keyword, 'R', command.invoke_id, &["M00000"], ETX);
            let (head, tail) = raw.as_bytes().split_at(10);
            script.send_raw(head);
            thread::sleep(Duration::from_millis(50));
            script.send_raw(tail);
            script.drain();
        });

        let options = FakeServer::options().with_framing(Framing::ChunkBoundary);
        let client = server.connect(options).unwrap();
        assert!(matches!(
            client.invoke_timeout(&Command::new("AGTLogoff"), Duration::from_millis(300)),
            Err(Error::Timeout(_))
        ));
    }

    #[test]
    fn client_drop_newest_keeps_reading() {
        let server = FakeServer::start(|mut script: Script| {
            for _ in 0..4 {
                script.notify("AGTCallNotify", &["CURPHONE,1"]);
            }
            script.serve_rest();
        });

        let options = FakeServer::options().with_notification_capacity(1, Overflow::DropNewest);
        let client = server.connect(options).unwrap();
        client.invoke(&Command::new("AGTLogoff")).unwrap();

        let notifications = client.notifications();
        assert_eq!(notifications.dropped(), 3);
        assert!(notifications.try_recv().is_ok());
    }
}
