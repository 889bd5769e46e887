//! Inbound event records.
//!
//! Every record the server sends shares one fixed-width header followed by zero or more
//! data segments:
//!
//! ```text
//! | keyword (20) | type (1) | client (20) | process id (6) | invoke id (4) | segments (4) |
//! RS segment RS segment ... ETX|ETB
//! ```
//!
//! Widths are counted in characters of the transcoded text. Blank numeric fields decode
//! as zero, which is what notifications carry in the invoke id column.
//!
//! # Payloads
//!
//! A record with a single bare segment carries a status flag or message code
//! (`M00000`, `E70002`, `AGENT_STARTUP`). A record whose segments are all `NAME,VALUE`
//! pairs carries a field map. Mixing the two shapes is rejected.
use std::{collections::BTreeMap, fmt};

use thiserror::Error;

/// End of text; terminates a final record.
pub const ETX: u8 = 0x03;
/// End of transmission block; terminates a record that more records continue.
pub const ETB: u8 = 0x17;
/// Record separator; introduces every data segment.
pub const RS: u8 = 0x1E;

pub(crate) const KEYWORD_WIDTH: usize = 20;
pub(crate) const TYPE_WIDTH: usize = 1;
pub(crate) const CLIENT_WIDTH: usize = 20;
pub(crate) const PROCESS_WIDTH: usize = 6;
pub(crate) const INVOKE_WIDTH: usize = 4;
pub(crate) const SEGMENTS_WIDTH: usize = 4;
pub(crate) const HEADER_WIDTH: usize =
    KEYWORD_WIDTH + TYPE_WIDTH + CLIENT_WIDTH + PROCESS_WIDTH + INVOKE_WIDTH + SEGMENTS_WIDTH;

/// Keyword of the notification the server sends once a session is accepted.
pub const SESSION_START: &str = "AGTSTART";
/// Status flag carried by [`SESSION_START`].
pub const STARTUP_FLAG: &str = "AGENT_STARTUP";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record is {len} characters, shorter than the {HEADER_WIDTH} character header")]
    TooShort { len: usize },

    #[error("record does not end with ETX or ETB")]
    MissingTerminator,

    #[error("unknown message type '{0}'")]
    MessageType(char),

    #[error("invalid {field} field '{value}'")]
    Numeric { field: &'static str, value: String },

    #[error("data section does not start with a record separator")]
    MissingSeparator,

    #[error("header declares {declared} segments, record carries {actual}")]
    SegmentCount { declared: u32, actual: usize },

    #[error("segment '{0}' is not a NAME,VALUE pair")]
    Field(String),
}

/// Wire message type letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Command,
    Pending,
    Data,
    Response,
    Busy,
    Notification,
}

impl MessageType {
    pub const fn as_char(self) -> char {
        match self {
            MessageType::Command => 'C',
            MessageType::Pending => 'P',
            MessageType::Data => 'D',
            MessageType::Response => 'R',
            MessageType::Busy => 'B',
            MessageType::Notification => 'N',
        }
    }

    /// Whether this type ends the exchange started by a command.
    pub const fn is_terminal(self) -> bool {
        matches!(self, MessageType::Response | MessageType::Busy)
    }
}

impl TryFrom<char> for MessageType {
    type Error = DecodeError;

    fn try_from(value: char) -> Result<Self, Self::Error> {
        match value {
            'C' => Ok(MessageType::Command),
            'P' => Ok(MessageType::Pending),
            'D' => Ok(MessageType::Data),
            'R' => Ok(MessageType::Response),
            'B' => Ok(MessageType::Busy),
            'N' => Ok(MessageType::Notification),
            c => Err(DecodeError::MessageType(c)),
        }
    }
}

/// Routing class of an event: notifications go to subscribers, everything else is
/// matched against a pending command by invoke id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Notification,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Status(String),
    Fields(BTreeMap<String, String>),
}

impl Payload {
    pub fn status(&self) -> Option<&str> {
        match self {
            Payload::Status(s) => Some(s),
            Payload::Fields(_) => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        match self {
            Payload::Fields(fields) => fields.get(name).map(String::as_str),
            Payload::Status(_) => None,
        }
    }
}

/// A decoded server record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub keyword: String,
    pub message_type: MessageType,
    pub client: String,
    pub process_id: String,
    pub invoke_id: u32,
    pub segments: u32,
    pub incomplete: bool,
    pub payload: Payload,
}

impl Event {
    pub const fn kind(&self) -> EventKind {
        match self.message_type {
            MessageType::Notification => EventKind::Notification,
            _ => EventKind::Response,
        }
    }

    /// True for the session-start notification that opens every connection.
    pub fn is_start(&self) -> bool {
        self.kind() == EventKind::Notification
            && self.keyword == SESSION_START
            && self.payload.status() == Some(STARTUP_FLAG)
    }

    /// Message codes starting with `E` report a failed command.
    pub fn is_error(&self) -> bool {
        self.message_type == MessageType::Busy
            || self.payload.status().is_some_and(|s| s.starts_with('E'))
    }

    /// Decodes one complete record, terminator included.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let (body, incomplete) = match raw.as_bytes().last() {
            Some(&ETX) => (&raw[..raw.len() - 1], false),
            Some(&ETB) => (&raw[..raw.len() - 1], true),
            _ => return Err(DecodeError::MissingTerminator),
        };

        let len = body.chars().count();
        if len < HEADER_WIDTH {
            return Err(DecodeError::TooShort { len });
        }

        let mut cursor = Columns::new(body);
        let keyword = cursor.take(KEYWORD_WIDTH).trim_end().to_string();
        let type_column = cursor.take(TYPE_WIDTH);
        let message_type = type_column
            .chars()
            .next()
            .map(MessageType::try_from)
            .unwrap_or(Err(DecodeError::MessageType(' ')))?;
        let client = cursor.take(CLIENT_WIDTH).trim().to_string();
        let process_id = cursor.take(PROCESS_WIDTH).trim().to_string();
        let invoke_id = numeric("invoke id", cursor.take(INVOKE_WIDTH))?;
        let segments = numeric("segment count", cursor.take(SEGMENTS_WIDTH))?;

        let data = cursor.rest();
        let parts: Vec<&str> = if data.is_empty() {
            Vec::new()
        } else if let Some(stripped) = data.strip_prefix(char::from(RS)) {
            stripped.split(char::from(RS)).collect()
        } else {
            return Err(DecodeError::MissingSeparator);
        };

        if segments as usize != parts.len() {
            return Err(DecodeError::SegmentCount {
                declared: segments,
                actual: parts.len(),
            });
        }

        Ok(Self {
            keyword,
            message_type,
            client,
            process_id,
            invoke_id,
            segments,
            incomplete,
            payload: payload(&parts)?,
        })
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] invoke={} segments={}",
            self.keyword,
            self.message_type.as_char(),
            self.invoke_id,
            self.segments
        )?;
        if self.incomplete {
            write!(f, " (incomplete)")?;
        }
        Ok(())
    }
}

/// Character-counted cursor over the fixed-width header.
struct Columns<'a> {
    rest: &'a str,
}

impl<'a> Columns<'a> {
    fn new(rest: &'a str) -> Self {
        Self { rest }
    }

    fn take(&mut self, width: usize) -> &'a str {
        let split = self
            .rest
            .char_indices()
            .nth(width)
            .map_or(self.rest.len(), |(i, _)| i);
        let (head, tail) = self.rest.split_at(split);
        self.rest = tail;
        head
    }

    fn rest(self) -> &'a str {
        self.rest
    }
}

fn numeric(field: &'static str, column: &str) -> Result<u32, DecodeError> {
    let value = column.trim();
    if value.is_empty() {
        return Ok(0);
    }
    value.parse().map_err(|_| DecodeError::Numeric {
        field,
        value: value.to_string(),
    })
}

fn payload(parts: &[&str]) -> Result<Payload, DecodeError> {
    match parts {
        [] => Ok(Payload::Status(String::new())),
        [single] if !single.contains(',') => Ok(Payload::Status(single.to_string())),
        _ => parts
            .iter()
            .map(|part| {
                part.split_once(',')
                    .map(|(name, value)| (name.trim().to_string(), value.to_string()))
                    .ok_or_else(|| DecodeError::Field(part.to_string()))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(Payload::Fields),
    }
}
