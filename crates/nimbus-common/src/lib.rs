//! Nimbus Common Protocol Types
//!
//! This crate provides the wire protocol shared by the nimbus server daemon
//! and its clients.
//!
//! # Overview
//!
//! Nimbus is a cloud-resource helper split into a long-running server that
//! mirrors remote resource state into a local cache, and short-lived clients
//! that send it commands. This crate contains the pieces both sides agree on:
//!
//! - **Commands**: the closed set of operations the server accepts
//! - **Frames**: line-oriented request/ack/result encoding and parsing
//! - **Errors**: the shared error taxonomy
//!
//! # Wire Protocol
//!
//! Every message is a single newline-terminated ASCII line over localhost TCP:
//!
//! ```text
//! request: <id> <command> <arg1> <arg2> ...\n
//! ack:     <id> ACK\n
//! result:  <id> RESULT <status> <json-payload>\n
//! ```
//!
//! The server acks a request as soon as the full line arrives, before any
//! processing, and sends the result once the command completes. Status `0`
//! means success and the payload is a JSON document (possibly empty); status
//! `1` means failure and the payload is the error text. Each connection
//! carries exactly one request/response exchange.
//!
//! # Example
//!
//! ```
//! use nimbus_common::{Command, RequestFrame, ReplyFrame};
//!
//! let request = RequestFrame::new(7, Command::StartInstance,
//!     vec!["us-east-1".into(), "i-123".into()]);
//! let line = request.encode().unwrap();
//! assert_eq!(line, "7 START_INSTANCE us-east-1 i-123\n");
//!
//! let ack = ReplyFrame::parse("7 ACK").unwrap();
//! assert_eq!(ack, ReplyFrame::Ack { id: 7 });
//! ```

pub mod protocol;

pub use protocol::*;
