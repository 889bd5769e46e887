use std::borrow::Cow;

use encoding_rs::WINDOWS_1251;
use thiserror::Error;

use super::event::{
    CLIENT_WIDTH, ETX, INVOKE_WIDTH, KEYWORD_WIDTH, MessageType, PROCESS_WIDTH, RS,
    SEGMENTS_WIDTH,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{field} '{value}' exceeds {width} characters")]
    TooWide {
        field: &'static str,
        value: String,
        width: usize,
    },

    #[error("argument contains a reserved control character: {0:?}")]
    ControlCharacter(String),

    #[error("'{0}' cannot be represented in the server codepage")]
    Unmappable(String),
}

/// Identity stamped into the header of every outgoing command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub client: String,
    pub process_id: u32,
}

impl Origin {
    pub fn new(client: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            process_id: std::process::id() % 1_000_000,
        }
    }
}

/// An outgoing command: a keyword plus ordered argument segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    keyword: Cow<'static, str>,
    args: Vec<String>,
}

impl Command {
    pub fn new(keyword: impl Into<Cow<'static, str>>) -> Self {
        Self {
            keyword: keyword.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl ToString) -> Self {
        self.args.push(value.to_string());
        self
    }

    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Serializes the command under `invoke_id` into server codepage bytes.
    pub fn encode(&self, invoke_id: u32, origin: &Origin) -> Result<Vec<u8>, EncodeError> {
        let keyword = column("keyword", &self.keyword, KEYWORD_WIDTH)?;
        let client = column("client", &origin.client, CLIENT_WIDTH)?;
        let process_text = origin.process_id.to_string();
        let process = column("process id", &process_text, PROCESS_WIDTH)?;
        let invoke_text = invoke_id.to_string();
        let invoke = column("invoke id", &invoke_text, INVOKE_WIDTH)?;
        let count_text = self.args.len().to_string();
        let count = column("segment count", &count_text, SEGMENTS_WIDTH)?;

        let mut text = format!(
            "{keyword:<kw$}{kind}{client:<cw$}{process:<pw$}{invoke:<iw$}{count:<sw$}",
            kind = MessageType::Command.as_char(),
            kw = KEYWORD_WIDTH,
            cw = CLIENT_WIDTH,
            pw = PROCESS_WIDTH,
            iw = INVOKE_WIDTH,
            sw = SEGMENTS_WIDTH,
        );
        for arg in &self.args {
            if arg.bytes().any(|b| b == RS || b == ETX || b == super::event::ETB) {
                return Err(EncodeError::ControlCharacter(arg.clone()));
            }
            text.push(char::from(RS));
            text.push_str(arg);
        }
        text.push(char::from(ETX));

        let (bytes, _, unmappable) = WINDOWS_1251.encode(&text);
        if unmappable {
            return Err(EncodeError::Unmappable(text));
        }
        Ok(bytes.into_owned())
    }
}

fn column<'a>(field: &'static str, value: &'a str, width: usize) -> Result<&'a str, EncodeError> {
    if value.chars().count() > width {
        return Err(EncodeError::TooWide {
            field,
            value: value.to_string(),
            width,
        });
    }
    Ok(value)
}
