//! Callback client.
//!
//! Asynchronous transport for callers that want to fire a request and get
//! on with other work. `send` connects and writes the request before
//! returning, so connection refusal surfaces to the caller; a spawned task
//! then owns the socket and invokes the handler when the result arrives.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use nimbus_common::{Command, NimbusError, ReplyFrame, RequestFrame, RequestId, Result};

use crate::decode_result_payload;
use crate::pending::{AckOutcome, PendingMap};

/// Handler invoked with `(success, payload)` once a request completes.
pub type ResultHandler = Box<dyn FnOnce(bool, Value) + Send>;

/// Client that delivers results through a handler instead of blocking.
///
/// Cheap to clone; clones share the pending map, so ids stay unique across
/// every request sent through this client and its clones.
#[derive(Clone)]
pub struct CallbackClient {
    server_addr: String,
    pending: Arc<PendingMap>,
}

impl CallbackClient {
    /// Creates a client targeting the given server address. No connection is
    /// made until a request is sent.
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            pending: Arc::new(PendingMap::new()),
        }
    }

    /// Sends one request and returns its id as soon as the write completes.
    ///
    /// The handler runs on a spawned task once the result arrives, with the
    /// same `(success, payload)` semantics as
    /// [`BlockingClient::send_blocking`](crate::BlockingClient::send_blocking).
    /// A protocol violation on the reply stream is logged and the handler is
    /// never invoked.
    ///
    /// # Errors
    ///
    /// Returns [`NimbusError::Connection`] when the server is unreachable or
    /// the request cannot be written.
    pub async fn send(
        &self,
        command: Command,
        args: Vec<String>,
        handler: ResultHandler,
    ) -> Result<RequestId> {
        let id = self.pending.allocate();
        let frame = RequestFrame::new(id, command, args);
        let line = frame.encode()?;

        // Connect and write before returning, so an unreachable server is
        // the caller's error rather than a swallowed task failure.
        let mut stream = TcpStream::connect(&self.server_addr).await.map_err(|e| {
            NimbusError::Connection(format!(
                "failed to connect to {}: {}",
                self.server_addr, e
            ))
        })?;
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await?;
        debug!("sent request {}: {}", id, line.trim_end());

        let pending = self.pending.clone();
        tokio::spawn(async move {
            if let Err(e) = read_replies(stream, id, pending, handler).await {
                error!("reply stream for request {} failed: {}", id, e);
            }
        });

        Ok(id)
    }
}

/// Drives one connection's reply stream to completion.
async fn read_replies(
    stream: TcpStream,
    id: RequestId,
    pending: Arc<PendingMap>,
    handler: ResultHandler,
) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut reply_line = String::new();
    loop {
        reply_line.clear();
        let read = reader.read_line(&mut reply_line).await?;
        if read == 0 {
            return Err(NimbusError::Connection(format!(
                "connection closed before the result for request {}",
                id
            )));
        }

        match ReplyFrame::parse(&reply_line)? {
            ReplyFrame::Ack { id: ack_id } => match pending.record_ack(ack_id) {
                AckOutcome::Acked => debug!("request {} acknowledged", ack_id),
                AckOutcome::UnknownId => warn!("ack for unknown request id {}", ack_id),
                AckOutcome::AlreadyAcked => {
                    warn!("duplicate ack for request id {}", ack_id)
                }
            },
            ReplyFrame::Result {
                id: result_id,
                status,
                payload,
            } => {
                pending.complete(result_id)?;
                let (success, value) = decode_result_payload(status, &payload)?;
                debug!("request {} completed, success={}", result_id, success);
                handler(success, value);
                return Ok(());
            }
        }
    }
}
