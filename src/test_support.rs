//! Scripted loopback server for session tests.
use std::{
    io::Write,
    net::{SocketAddr, TcpListener, TcpStream},
    thread::{self, JoinHandle},
    time::Duration,
};

use encoding_rs::WINDOWS_1251;

use crate::{
    Client, ClientOptions, Error, Security,
    protocol::{
        ETX, FrameReader, Framing, RS, SESSION_START, STARTUP_FLAG, event::tests::record,
    },
};

/// A command as the server sees it.
#[derive(Debug, Clone)]
pub(crate) struct Received {
    pub(crate) keyword: String,
    pub(crate) invoke_id: u32,
    pub(crate) args: Vec<String>,
}

/// Server side of one connection.
pub(crate) struct Script {
    stream: TcpStream,
    frames: FrameReader<TcpStream>,
}

impl Script {
    fn new(stream: TcpStream) -> Self {
        let frames = FrameReader::new(stream.try_clone().unwrap(), Framing::Reassemble, 4096, 64 * 1024);
        Self { stream, frames }
    }

    pub(crate) fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    pub(crate) fn send(&mut self, raw: &str) {
        let (bytes, _, _) = WINDOWS_1251.encode(raw);
        self.send_raw(&bytes);
    }

    pub(crate) fn greet(&mut self) {
        self.notify(SESSION_START, &[STARTUP_FLAG]);
    }

    pub(crate) fn notify(&mut self, keyword: &str, segments: &[&str]) {
        self.send(&record(keyword, 'N', 0, segments, ETX));
    }

    pub(crate) fn respond(&mut self, to: &Received, kind: char, segments: &[&str], terminator: u8) {
        self.send(&record(&to.keyword, kind, to.invoke_id, segments, terminator));
    }

    /// Reads the next command, or `None` once the client hangs up.
    pub(crate) fn next_command(&mut self) -> Option<Received> {
        let raw = self.frames.read_record().ok()?;
        let body: String = raw.chars().take(raw.chars().count() - 1).collect();
        let header: Vec<char> = body.chars().take(55).collect();
        let column = |from: usize, to: usize| header[from..to].iter().collect::<String>();

        assert_eq!(header[20], 'C', "client sent a non-command record: {raw:?}");
        let rest: String = body.chars().skip(55).collect();
        let args = rest
            .split(char::from(RS))
            .skip(1)
            .map(str::to_string)
            .collect();

        Some(Received {
            keyword: column(0, 20).trim_end().to_string(),
            invoke_id: column(47, 51).trim().parse().unwrap(),
            args,
        })
    }

    pub(crate) fn expect_command(&mut self) -> Received {
        self.next_command().expect("client closed before sending a command")
    }

    /// Answers every further command with success until the client hangs up.
    pub(crate) fn serve_rest(&mut self) {
        while let Some(command) = self.next_command() {
            self.respond(&command, 'R', &["M00000"], ETX);
        }
    }

    /// Reads and discards until the client hangs up.
    pub(crate) fn drain(&mut self) {
        while self.next_command().is_some() {}
    }
}

pub(crate) struct FakeServer {
    addr: SocketAddr,
    handle: Option<JoinHandle<()>>,
}

impl FakeServer {
    /// Greets the client with the session-start notification, then runs `script`.
    pub(crate) fn start<F>(script: F) -> Self
    where
        F: FnOnce(Script) + Send + 'static,
    {
        Self::start_raw(move |mut s: Script| {
            s.greet();
            script(s);
        })
    }

    /// Runs `script` on the accepted connection without greeting.
    pub(crate) fn start_raw<F>(script: F) -> Self
    where
        F: FnOnce(Script) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            script(Script::new(stream));
        });
        Self {
            addr,
            handle: Some(handle),
        }
    }

    pub(crate) fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub(crate) fn options() -> ClientOptions {
        ClientOptions::default().with_handshake_timeout(Some(Duration::from_secs(5)))
    }

    pub(crate) fn connect(&self, options: ClientOptions) -> Result<Client, Error> {
        Client::connect(&self.addr(), Security::Plain, options)
    }

    pub(crate) fn client(&self) -> Client {
        self.connect(Self::options()).unwrap()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take()
            && let Err(panic) = handle.join()
            && !thread::panicking()
        {
            std::panic::resume_unwind(panic);
        }
    }
}
