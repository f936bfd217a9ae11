//! Nimbus Frame Types
//!
//! This module defines the line-oriented frames exchanged between clients and
//! the server, and their encoding/parsing.

use std::str::FromStr;

use super::command::Command;
use super::error::{NimbusError, Result};

/// Request identifier, unique and monotonically increasing within one client.
pub type RequestId = u64;

/// Wire token for acknowledgment frames.
pub const ACK_TOKEN: &str = "ACK";
/// Wire token for result frames.
pub const RESULT_TOKEN: &str = "RESULT";

/// Outcome of a completed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// Command completed; the payload is its JSON result (possibly empty).
    Success,
    /// Command failed; the payload is the failure text.
    Failure,
}

impl ResultStatus {
    fn as_wire(&self) -> &'static str {
        match self {
            ResultStatus::Success => "0",
            ResultStatus::Failure => "1",
        }
    }

    fn from_wire(s: &str) -> Result<Self> {
        match s {
            "0" => Ok(ResultStatus::Success),
            "1" => Ok(ResultStatus::Failure),
            other => Err(NimbusError::Protocol(format!(
                "invalid result status '{}'",
                other
            ))),
        }
    }

    /// `true` for [`ResultStatus::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, ResultStatus::Success)
    }
}

/// A request sent from a client to the server.
///
/// # Request Flow
///
/// 1. Client allocates the next id and encodes the frame as one line
/// 2. Server parses the id and acks immediately, before any processing
/// 3. Server parses command + args and dispatches the handler
/// 4. Server sends the matching [`ReplyFrame::Result`] and the connection
///    closes
///
/// # Example
///
/// ```
/// use nimbus_common::{Command, RequestFrame};
///
/// let frame = RequestFrame::new(3, Command::QueryRegion, vec!["eu-west-1".into()]);
/// let line = frame.encode().unwrap();
/// assert_eq!(line, "3 QUERY_REGION eu-west-1\n");
///
/// let parsed = RequestFrame::parse(line.trim_end()).unwrap();
/// assert_eq!(parsed, frame);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    /// Correlation id matching the eventual ack and result to this request
    pub id: RequestId,
    /// The command to execute
    pub command: Command,
    /// Positional string arguments, command-specific
    pub args: Vec<String>,
}

impl RequestFrame {
    /// Creates a request frame.
    pub fn new(id: RequestId, command: Command, args: Vec<String>) -> Self {
        Self { id, command, args }
    }

    /// Encodes the frame as a newline-terminated line.
    ///
    /// # Errors
    ///
    /// Returns [`NimbusError::InvalidRequest`] if any argument contains
    /// whitespace that would break word-based parsing, or the line
    /// terminator itself. Keeping the terminator out of messages is the
    /// serializer's responsibility.
    pub fn encode(&self) -> Result<String> {
        for arg in &self.args {
            if arg.is_empty() || arg.chars().any(|c| c.is_ascii_whitespace()) {
                return Err(NimbusError::InvalidRequest(format!(
                    "argument '{}' is empty or contains whitespace",
                    arg
                )));
            }
        }

        let mut line = format!("{} {}", self.id, self.command.as_str());
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line.push('\n');
        Ok(line)
    }

    /// Parses a complete request line (without buffering concerns; partial
    /// reads are handled by the transport).
    ///
    /// # Errors
    ///
    /// - [`NimbusError::Protocol`] if the line is empty or the id is not an
    ///   integer — fatal for the connection, since the server cannot even
    ///   address a failure reply
    /// - [`NimbusError::UnknownCommand`] for a well-formed id with a command
    ///   outside the closed set — reported back as a status-1 result
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_ascii_whitespace();

        let id_word = words
            .next()
            .ok_or_else(|| NimbusError::Protocol("empty request line".to_string()))?;
        let id: RequestId = id_word.parse().map_err(|_| {
            NimbusError::Protocol(format!("invalid request id '{}'", id_word))
        })?;

        let command_word = words.next().ok_or_else(|| {
            NimbusError::InvalidRequest(format!("request {} carries no command", id))
        })?;
        let command = Command::from_str(command_word)?;

        let args = words.map(str::to_string).collect();

        Ok(Self { id, command, args })
    }

    /// Parses only the request id from a line, so a malformed command can
    /// still be acked and answered with a failure result.
    pub fn parse_id(line: &str) -> Result<RequestId> {
        let id_word = line
            .split_ascii_whitespace()
            .next()
            .ok_or_else(|| NimbusError::Protocol("empty request line".to_string()))?;
        id_word.parse().map_err(|_| {
            NimbusError::Protocol(format!("invalid request id '{}'", id_word))
        })
    }
}

/// A reply sent from the server to a client.
///
/// Every request produces exactly two replies on its connection, in order:
/// an [`ReplyFrame::Ack`] as soon as the request line is received, then a
/// [`ReplyFrame::Result`] once the command finishes. A result observed before
/// its ack is a fatal protocol violation for that connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyFrame {
    /// The server received the request and started processing it.
    Ack { id: RequestId },
    /// The request finished.
    Result {
        id: RequestId,
        status: ResultStatus,
        /// JSON result on success (possibly empty), error text on failure.
        /// Never contains the line terminator.
        payload: String,
    },
}

impl ReplyFrame {
    /// Creates an ack frame for the given request.
    pub fn ack(id: RequestId) -> Self {
        ReplyFrame::Ack { id }
    }

    /// Creates a successful result frame.
    pub fn success(id: RequestId, payload: impl Into<String>) -> Self {
        ReplyFrame::Result {
            id,
            status: ResultStatus::Success,
            payload: payload.into(),
        }
    }

    /// Creates a failure result frame carrying the error text.
    ///
    /// Newlines in the error text are flattened so the frame stays a single
    /// line.
    pub fn failure(id: RequestId, error: impl Into<String>) -> Self {
        ReplyFrame::Result {
            id,
            status: ResultStatus::Failure,
            payload: error.into().replace('\n', " "),
        }
    }

    /// The request id this reply corresponds to.
    pub fn id(&self) -> RequestId {
        match self {
            ReplyFrame::Ack { id } => *id,
            ReplyFrame::Result { id, .. } => *id,
        }
    }

    /// Encodes the frame as a newline-terminated line.
    ///
    /// # Errors
    ///
    /// Returns [`NimbusError::Protocol`] if the payload contains the line
    /// terminator. JSON payloads produced with `serde_json::to_string` never
    /// do.
    pub fn encode(&self) -> Result<String> {
        match self {
            ReplyFrame::Ack { id } => Ok(format!("{} {}\n", id, ACK_TOKEN)),
            ReplyFrame::Result { id, status, payload } => {
                if payload.contains('\n') {
                    return Err(NimbusError::Protocol(
                        "result payload contains the line terminator".to_string(),
                    ));
                }
                if payload.is_empty() {
                    Ok(format!("{} {} {}\n", id, RESULT_TOKEN, status.as_wire()))
                } else {
                    Ok(format!(
                        "{} {} {} {}\n",
                        id,
                        RESULT_TOKEN,
                        status.as_wire(),
                        payload
                    ))
                }
            }
        }
    }

    /// Parses a complete reply line.
    ///
    /// # Errors
    ///
    /// Returns [`NimbusError::Protocol`] for a malformed id, an unrecognized
    /// frame kind, or a result with a bad status — all fatal for the
    /// connection they arrive on.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches('\n');
        let mut words = line.splitn(4, ' ');

        let id_word = words
            .next()
            .filter(|w| !w.is_empty())
            .ok_or_else(|| NimbusError::Protocol("empty reply line".to_string()))?;
        let id: RequestId = id_word.parse().map_err(|_| {
            NimbusError::Protocol(format!("invalid reply id '{}'", id_word))
        })?;

        let kind = words.next().unwrap_or("");
        match kind {
            ACK_TOKEN => Ok(ReplyFrame::Ack { id }),
            RESULT_TOKEN => {
                let status_word = words.next().ok_or_else(|| {
                    NimbusError::Protocol(format!("result for request {} has no status", id))
                })?;
                let status = ResultStatus::from_wire(status_word)?;
                let payload = words.next().unwrap_or("").to_string();
                Ok(ReplyFrame::Result { id, status, payload })
            }
            other => Err(NimbusError::Protocol(format!(
                "unrecognized frame kind '{}' for request {}",
                other, id
            ))),
        }
    }
}
