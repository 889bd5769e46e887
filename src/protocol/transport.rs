use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use log::{debug, info};
use native_tls::{Protocol, TlsConnector, TlsStream};
use thiserror::Error;

use super::command::{Command, EncodeError, Origin};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode command: {0}")]
    Encode(#[from] EncodeError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

/// A duplex byte stream that can be split between a reading and a writing thread.
pub trait Transport: Read + Write + Send + Sync + 'static {
    /// Another handle to the same connection.
    fn try_clone(&self) -> io::Result<Self>
    where
        Self: Sized;

    /// Bounds each subsequent read on this handle.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Closes both directions; blocked reads on any handle return.
    fn shutdown(&self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn try_clone(&self) -> io::Result<Self> {
        TcpStream::try_clone(self)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        match TcpStream::shutdown(self, Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// How long a TLS read holds the stream before letting a writer in.
const TLS_POLL: Duration = Duration::from_millis(20);

/// TLS session shared between the reader and writer threads.
///
/// A TLS stream cannot be split, so handles share it behind a mutex. The underlying
/// socket uses a short read timeout; a reader that finds no data drops the lock and
/// tries again until its own deadline passes.
///
/// While the reader is idle it holds the lock for up to 20 ms at a time, so a
/// write can wait that long before it reaches the socket. Every command on a TLS
/// session pays up to one poll interval of extra latency.
#[derive(Debug)]
pub struct TlsTransport {
    stream: Arc<Mutex<TlsStream<TcpStream>>>,
    socket: TcpStream,
    read_timeout: Option<Duration>,
}

impl TlsTransport {
    /// Dials `addr` and runs the TLS handshake.
    ///
    /// The server only speaks TLS 1.0 and presents a certificate nobody can verify, so
    /// legacy versions are allowed and certificate and hostname checks are off.
    pub fn connect(addr: &str) -> io::Result<Self> {
        let connector = TlsConnector::builder()
            .min_protocol_version(Some(Protocol::Tlsv10))
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .use_sni(false)
            .build()
            .map_err(io::Error::other)?;

        let socket = TcpStream::connect(addr)?;
        let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
        let stream = connector
            .connect(host, socket.try_clone()?)
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;
        socket.set_read_timeout(Some(TLS_POLL))?;
        info!("TLS session established with {addr}");

        Ok(Self {
            stream: Arc::new(Mutex::new(stream)),
            socket,
            read_timeout: None,
        })
    }

    fn lock(&self) -> MutexGuard<'_, TlsStream<TcpStream>> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Read for TlsTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let started = Instant::now();
        loop {
            match self.lock().read(buf) {
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                other => return other,
            }
            if self
                .read_timeout
                .is_some_and(|limit| started.elapsed() >= limit)
            {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "read deadline expired",
                ));
            }
        }
    }
}

impl Write for TlsTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().flush()
    }
}

impl Transport for TlsTransport {
    fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            stream: Arc::clone(&self.stream),
            socket: self.socket.try_clone()?,
            read_timeout: self.read_timeout,
        })
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.read_timeout = timeout;
        Ok(())
    }

    fn shutdown(&self) -> io::Result<()> {
        match self.socket.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Serializes outgoing commands onto the connection.
///
/// Each command is encoded before the lock is taken and written with a single
/// `write_all`, so concurrent callers never interleave partial records.
pub(crate) struct CommandWriter {
    stream: Mutex<Box<dyn Write + Send>>,
    origin: Origin,
}

impl CommandWriter {
    pub(crate) fn new(stream: impl Write + Send + 'static, origin: Origin) -> Self {
        Self {
            stream: Mutex::new(Box::new(stream)),
            origin,
        }
    }

    pub(crate) fn write_command(
        &self,
        command: &Command,
        invoke_id: u32,
    ) -> Result<(), TransportError> {
        let record = command.encode(invoke_id, &self.origin)?;
        debug!("sending {} invoke={invoke_id}", command.keyword());

        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        stream.write_all(&record)?;
        stream.flush()?;
        Ok(())
    }
}

impl fmt::Debug for CommandWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandWriter")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}
