//! Blocking client.
//!
//! Synchronous transport for callers without an async runtime, such as
//! shell integrations that fire one request and print the answer. One
//! socket per request; the calling thread drives the read loop itself.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

use serde_json::Value;
use tracing::{debug, warn};

use nimbus_common::{Command, NimbusError, ReplyFrame, RequestFrame, Result};

use crate::decode_result_payload;
use crate::pending::{AckOutcome, PendingMap};

/// Client that blocks the calling thread until the result arrives.
///
/// # Example
///
/// ```no_run
/// use nimbus_client::BlockingClient;
/// use nimbus_common::Command;
///
/// let client = BlockingClient::new("127.0.0.1:7007");
/// let (ok, state) =
///     client.send_blocking(Command::QueryRegion, vec!["eu-west-1".into()])?;
/// # Ok::<(), nimbus_common::NimbusError>(())
/// ```
pub struct BlockingClient {
    server_addr: String,
    pending: PendingMap,
}

impl BlockingClient {
    /// Creates a client targeting the given server address. No connection is
    /// made until a request is sent.
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            pending: PendingMap::new(),
        }
    }

    /// Sends one request and blocks until its result arrives.
    ///
    /// Returns `(true, json)` for a successful result and `(false, text)`
    /// for a status-1 result carrying the remote error text. There is no
    /// protocol-level timeout; callers wanting one should wrap this in their
    /// own watchdog.
    ///
    /// # Errors
    ///
    /// - [`NimbusError::Connection`] when the server is unreachable or the
    ///   connection drops before the result. Distinct from a status-1
    ///   result, which is a completed exchange.
    /// - [`NimbusError::Protocol`] when the server breaks frame ordering.
    pub fn send_blocking(&self, command: Command, args: Vec<String>) -> Result<(bool, Value)> {
        let id = self.pending.allocate();
        let frame = RequestFrame::new(id, command, args);
        let line = frame.encode()?;

        let mut stream = TcpStream::connect(&self.server_addr).map_err(|e| {
            NimbusError::Connection(format!(
                "failed to connect to {}: {}",
                self.server_addr, e
            ))
        })?;
        stream.write_all(line.as_bytes())?;
        stream.flush()?;
        debug!("sent request {}: {}", id, line.trim_end());

        let mut reader = BufReader::new(stream);
        let mut reply_line = String::new();
        loop {
            reply_line.clear();
            let read = reader.read_line(&mut reply_line)?;
            if read == 0 {
                return Err(NimbusError::Connection(format!(
                    "connection closed before the result for request {}",
                    id
                )));
            }

            match ReplyFrame::parse(&reply_line)? {
                ReplyFrame::Ack { id: ack_id } => match self.pending.record_ack(ack_id) {
                    AckOutcome::Acked => debug!("request {} acknowledged", ack_id),
                    AckOutcome::UnknownId => {
                        warn!("ack for unknown request id {}", ack_id)
                    }
                    AckOutcome::AlreadyAcked => {
                        warn!("duplicate ack for request id {}", ack_id)
                    }
                },
                ReplyFrame::Result {
                    id: result_id,
                    status,
                    payload,
                } => {
                    self.pending.complete(result_id)?;
                    debug!("request {} completed with status {:?}", result_id, status);
                    return decode_result_payload(status, &payload);
                }
            }
        }
    }
}
