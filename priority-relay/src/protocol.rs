//! Text wire protocol spoken between the relay and its clients.
//!
//! Records are separated by `&&` and fields by `||`. Inbound records look like
//! `<priority>||<body>`; outbound envelopes look like
//! `<prefix>||<sender>||<body>||<HH:MM:SS.ffffff>&&`.

use std::fmt;

use thiserror::Error;

pub const RECORD_SEPARATOR: &str = "&&";
pub const FIELD_SEPARATOR: &str = "||";
pub const QUIT_COMMAND: &str = "!quit";
pub const RETIRE_COMMAND: &str = "!rm";
/// Prefix carried by retire envelopes in place of a priority.
pub const RETIRE_MARKER: &str = "!";
pub const TIMESTAMP_FORMAT: &str = "%H:%M:%S%.6f";

const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("record has no priority field: {0:?}")]
    MissingPriority(String),
    #[error("priority is not an integer: {0:?}")]
    InvalidPriority(String),
    #[error("record has an empty body")]
    EmptyBody,
    #[error("retire command without a timestamp")]
    MissingRetireTimestamp,
    #[error("malformed envelope: {0:?}")]
    MalformedEnvelope(String),
}

/// A classified inbound record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message { priority: i64, body: String },
    Retire { timestamp: String },
    Quit,
}

/// What an envelope carries in its first field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    Priority(i64),
    Retire,
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::Priority(priority) => write!(f, "{priority}"),
            Prefix::Retire => f.write_str(RETIRE_MARKER),
        }
    }
}

/// A timestamped, attributed message unit as it travels to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    prefix: Prefix,
    sender: String,
    body: String,
    timestamp: String,
}

impl Envelope {
    pub fn message(
        sender: impl Into<String>,
        priority: i64,
        body: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            prefix: Prefix::Priority(priority),
            sender: sender.into(),
            body: body.into(),
            timestamp: timestamp.into(),
        }
    }

    /// Builds the envelope announcing that `target` has been retired.
    pub fn retire(sender: impl Into<String>, target: &str, timestamp: impl Into<String>) -> Self {
        Self {
            prefix: Prefix::Retire,
            sender: sender.into(),
            body: format!("{RETIRE_COMMAND} {target}"),
            timestamp: timestamp.into(),
        }
    }

    pub fn prefix(&self) -> Prefix {
        self.prefix
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// Timestamp referenced by a retire envelope, `None` for regular messages.
    pub fn retired_timestamp(&self) -> Option<&str> {
        match self.prefix {
            Prefix::Retire => retire_target(&self.body),
            Prefix::Priority(_) => None,
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{prefix}{FIELD_SEPARATOR}{sender}{FIELD_SEPARATOR}{body}{FIELD_SEPARATOR}{timestamp}{RECORD_SEPARATOR}",
            prefix = self.prefix,
            sender = self.sender,
            body = self.body,
            timestamp = self.timestamp,
        )
    }

    /// Parses one outbound record (without its trailing separator).
    ///
    /// The body keeps any `||` it contains: the first two fields and the last
    /// one are fixed, everything in between is body.
    pub fn decode(record: &str) -> Result<Self, ProtocolError> {
        let record = record
            .strip_suffix(RECORD_SEPARATOR)
            .unwrap_or(record)
            .trim_end_matches(LINE_ENDINGS);
        let malformed = || ProtocolError::MalformedEnvelope(record.to_string());

        let (prefix, rest) = record.split_once(FIELD_SEPARATOR).ok_or_else(malformed)?;
        let (sender, rest) = rest.split_once(FIELD_SEPARATOR).ok_or_else(malformed)?;
        let (body, timestamp) = rest.rsplit_once(FIELD_SEPARATOR).ok_or_else(malformed)?;

        let prefix = if prefix == RETIRE_MARKER {
            Prefix::Retire
        } else {
            Prefix::Priority(prefix.trim().parse().map_err(|_| malformed())?)
        };

        Ok(Self {
            prefix,
            sender: sender.to_string(),
            body: body.to_string(),
            timestamp: timestamp.to_string(),
        })
    }
}

/// Splits decoded text into records, dropping empty ones.
pub fn split_records(text: &str) -> Vec<String> {
    text.split(RECORD_SEPARATOR)
        .map(|record| record.trim_end_matches(LINE_ENDINGS))
        .filter(|record| !record.is_empty())
        .map(str::to_string)
        .collect()
}

/// Classifies one inbound record.
///
/// `!quit` anywhere in the record wins over everything else. A retire command
/// may arrive bare (`!rm <ts>`) or as the body of a prioritized record.
pub fn parse_record(record: &str) -> Result<Inbound, ProtocolError> {
    if record.contains(QUIT_COMMAND) {
        return Ok(Inbound::Quit);
    }

    if let Some(rest) = strip_retire_command(record) {
        return parse_retire(rest);
    }

    let (priority, body) = record
        .split_once(FIELD_SEPARATOR)
        .ok_or_else(|| ProtocolError::MissingPriority(record.to_string()))?;

    if let Some(rest) = strip_retire_command(body) {
        return parse_retire(rest);
    }

    let priority = priority
        .trim()
        .parse::<i64>()
        .map_err(|_| ProtocolError::InvalidPriority(priority.to_string()))?;

    if body.is_empty() {
        return Err(ProtocolError::EmptyBody);
    }

    Ok(Inbound::Message {
        priority,
        body: body.to_string(),
    })
}

/// Turns a handshake payload into a display name.
pub fn sanitize_name(raw: &str) -> String {
    raw.trim_start_matches(|c: char| c == ',' || c == '|' || c.is_ascii_digit() || c.is_control())
        .trim_end_matches(LINE_ENDINGS)
        .to_string()
}

fn strip_retire_command(text: &str) -> Option<&str> {
    let rest = text.trim_start().strip_prefix(RETIRE_COMMAND)?;
    (rest.is_empty() || rest.starts_with(char::is_whitespace)).then_some(rest)
}

fn parse_retire(rest: &str) -> Result<Inbound, ProtocolError> {
    rest.split_whitespace()
        .next()
        .map(|timestamp| Inbound::Retire {
            timestamp: timestamp.to_string(),
        })
        .ok_or(ProtocolError::MissingRetireTimestamp)
}

fn retire_target(body: &str) -> Option<&str> {
    strip_retire_command(body)?.split_whitespace().next()
}

/// Reassembles records out of raw reads.
///
/// A read that fills the whole buffer may have cut a record short, so the
/// text after its last separator is held back and prefixed to the next read.
/// The same goes for a read that ends inside a UTF-8 sequence. Any other read
/// ends on a record boundary.
#[derive(Debug, Default)]
pub struct RecordDecoder {
    pending: Vec<u8>,
    partial: String,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes one read. `filled` tells whether the read used the entire
    /// buffer, in which case more of the last record is probably on its way.
    pub fn decode(&mut self, chunk: &[u8], filled: bool) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let text = self.take_utf8();
        self.partial.push_str(&text);

        let complete = if filled || !self.pending.is_empty() {
            let Some(end) = self.partial.rfind(RECORD_SEPARATOR) else {
                return Vec::new();
            };
            let tail = self.partial.split_off(end + RECORD_SEPARATOR.len());
            std::mem::replace(&mut self.partial, tail)
        } else {
            std::mem::take(&mut self.partial)
        };

        split_records(&complete)
    }

    /// Flushes whatever is held back, for when the stream has ended.
    pub fn finish(&mut self) -> Vec<String> {
        let mut text = std::mem::take(&mut self.partial);
        text.push_str(&String::from_utf8_lossy(&self.pending));
        self.pending.clear();
        split_records(&text)
    }

    /// Takes the valid UTF-8 prefix of `pending`, leaving an incomplete
    /// trailing sequence in place. Invalid bytes become U+FFFD.
    fn take_utf8(&mut self) -> String {
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            Err(err) if err.error_len().is_none() => {
                let tail = self.pending.split_off(err.valid_up_to());
                let head = std::mem::replace(&mut self.pending, tail);
                String::from_utf8(head)
                    .unwrap_or_else(|err| String::from_utf8_lossy(err.as_bytes()).into_owned())
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                text
            }
        }
    }
}
