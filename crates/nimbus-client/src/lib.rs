//! Nimbus RPC clients.
//!
//! Two clients over the same line protocol, selected at construction rather
//! than by a runtime mode flag:
//!
//! - [`BlockingClient`] opens a std TCP socket, writes one request, and
//!   blocks the calling thread until the result arrives.
//! - [`CallbackClient`] writes the request on a tokio socket and returns
//!   immediately; a spawned task invokes the caller's handler when the
//!   result arrives.
//!
//! Each connection carries exactly one request/response pair; concurrency
//! comes from opening multiple connections. Both clients share the frame
//! ordering rules enforced by [`PendingMap`]: duplicate or stray ACKs are
//! logged and ignored, while a RESULT arriving before its ACK kills the
//! connection.

pub mod blocking;
pub mod callback;
pub mod pending;

pub use blocking::BlockingClient;
pub use callback::CallbackClient;
pub use pending::{AckOutcome, PendingMap};

use serde_json::Value;

use nimbus_common::{Result, ResultStatus};

/// Turns a result frame's status and payload into the `(success, value)`
/// pair handed to callers.
///
/// A successful result carries JSON (an empty payload stands for `{}`); a
/// failed one carries plain error text, passed through as a JSON string.
pub(crate) fn decode_result_payload(status: ResultStatus, payload: &str) -> Result<(bool, Value)> {
    if status.is_success() {
        let value = if payload.is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(payload)?
        };
        Ok((true, value))
    } else {
        Ok((false, Value::String(payload.to_string())))
    }
}
