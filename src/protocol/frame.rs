//! Record framing over the raw byte stream.
//!
//! The server terminates each record with a single control byte, [`ETX`] for a final
//! record and [`ETB`] for one that further records continue. Bytes arrive in the
//! server's Windows-1251 codepage and are transcoded after a record is cut; both
//! terminators are ASCII so cutting on raw bytes is safe.
//!
//! # Framing modes
//!
//! - [`Framing::Reassemble`] buffers across reads and cuts on every terminator.
//! - [`Framing::ChunkBoundary`] treats a read as a record only when the chunk itself ends
//!   in a terminator, and discards chunks that do not.
use std::io::{self, Read};

use encoding_rs::WINDOWS_1251;
use log::{error, trace, warn};

use super::event::{ETB, ETX};

/// Default read size, the largest record the server emits in one write.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;
/// Default cap on a buffered, still unterminated record.
pub const DEFAULT_MAX_RECORD_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Framing {
    /// Buffer partial records across reads.
    #[default]
    Reassemble,
    /// A chunk is a record only if it ends in a terminator; otherwise it is dropped.
    ChunkBoundary,
}

/// Cuts a byte stream into transcoded text records.
pub struct FrameReader<R: Read> {
    stream: R,
    framing: Framing,
    chunk: Vec<u8>,
    pending: Vec<u8>,
    ready: std::collections::VecDeque<String>,
    max_record_len: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(stream: R, framing: Framing, chunk_size: usize, max_record_len: usize) -> Self {
        Self {
            stream,
            framing,
            chunk: vec![0; chunk_size.max(1)],
            pending: Vec::new(),
            ready: std::collections::VecDeque::new(),
            max_record_len,
        }
    }

    /// Returns the next complete record.
    ///
    /// A clean end of stream is reported as [`io::ErrorKind::UnexpectedEof`]; the session
    /// has no other way to end than being closed.
    pub fn read_record(&mut self) -> io::Result<String> {
        loop {
            if let Some(record) = self.ready.pop_front() {
                return Ok(record);
            }

            let n = self.stream.read(&mut self.chunk)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                ));
            }
            trace!("read {n} bytes");

            match self.framing {
                Framing::ChunkBoundary => self.cut_chunk(n),
                Framing::Reassemble => self.cut_buffered(n),
            }
        }
    }

    fn cut_chunk(&mut self, n: usize) {
        let chunk = &self.chunk[..n];
        if matches!(chunk.last(), Some(&ETX) | Some(&ETB)) {
            self.ready.push_back(transcode(chunk));
        } else {
            warn!("discarding {n} bytes that do not end in a record terminator");
        }
    }

    fn cut_buffered(&mut self, n: usize) {
        let mut start = 0;
        for (i, byte) in self.chunk[..n].iter().enumerate() {
            if *byte == ETX || *byte == ETB {
                self.pending.extend_from_slice(&self.chunk[start..=i]);
                self.ready.push_back(transcode(&self.pending));
                self.pending.clear();
                start = i + 1;
            }
        }
        self.pending.extend_from_slice(&self.chunk[start..n]);

        if self.pending.len() > self.max_record_len {
            error!(
                "discarding unterminated record of {} bytes, limit is {}",
                self.pending.len(),
                self.max_record_len
            );
            self.pending.clear();
        }
    }
}

fn transcode(bytes: &[u8]) -> String {
    let (text, _) = WINDOWS_1251.decode_without_bom_handling(bytes);
    text.into_owned()
}
