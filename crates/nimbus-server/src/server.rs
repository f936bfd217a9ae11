//! Request Server
//!
//! Accepts localhost TCP connections and runs the ack/result protocol over
//! each one. Every accepted connection is an independent tokio task, and the
//! command itself executes on the blocking pool, so a handler waiting tens
//! of seconds on the provider never stalls the accept loop or other
//! in-flight requests.
//!
//! # Per-connection lifecycle
//!
//! 1. Buffer partial reads until the line terminator arrives.
//! 2. Parse the request id and immediately write `<id> ACK` — receipt
//!    acknowledgment is decoupled from processing latency.
//! 3. Parse the command and dispatch it.
//! 4. Write `<id> RESULT <status> <payload>` and close.
//!
//! A line whose id cannot be parsed is a fatal protocol violation for that
//! connection: logged and closed, no reply, no retry. Once an id is known,
//! every failure — unknown command, bad arity, handler error — still
//! produces a status-1 result; nothing a client sends crashes the server.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use nimbus_common::{NimbusError, ReplyFrame, RequestFrame, Result};

use crate::dispatcher::Dispatcher;

/// Fixed localhost port the daemon listens on.
pub const DEFAULT_PORT: u16 = 7007;

/// The nimbus request server.
pub struct RequestServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    shutdown: watch::Receiver<bool>,
}

impl RequestServer {
    /// Binds the server to the given address.
    ///
    /// `shutdown` is flipped to `true` by the refresh scheduler once it has
    /// exited; the accept loop then stops taking new connections.
    pub async fn bind(
        bind_addr: &str,
        dispatcher: Arc<Dispatcher>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| NimbusError::Connection(format!("failed to bind {}: {}", bind_addr, e)))?;

        info!("request server listening on {}", bind_addr);
        Ok(Self {
            listener,
            dispatcher,
            shutdown,
        })
    }

    /// The actual bound address (useful with port 0).
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| NimbusError::Connection(format!("failed to get local addr: {}", e)))
    }

    /// Accepts connections until the shutdown flag flips.
    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = accepted.map_err(|e| {
                        NimbusError::Connection(format!("failed to accept connection: {}", e))
                    })?;
                    debug!("connection established from {}", peer_addr);

                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, dispatcher).await {
                            warn!("connection from {} closed with error: {}", peer_addr, e);
                        }
                    });
                }
                changed = self.shutdown.changed() => {
                    // A dropped sender counts as shutdown too.
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("request server stopping: shutdown signaled");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Runs one request/response exchange over a freshly accepted connection.
async fn handle_connection(stream: TcpStream, dispatcher: Arc<Dispatcher>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    let read = reader.read_line(&mut line).await?;
    if read == 0 {
        // Peer connected and went away without a request.
        debug!("connection closed by peer before a request arrived");
        return Ok(());
    }

    let line = line.trim_end_matches('\n');
    debug!("received request line: {}", line);

    // The id alone decides whether a failure can be answered at all.
    let id = RequestFrame::parse_id(line)?;

    // Ack before any command work.
    write_half
        .write_all(ReplyFrame::ack(id).encode()?.as_bytes())
        .await?;
    write_half.flush().await?;

    let reply = match RequestFrame::parse(line) {
        Ok(frame) => {
            let result = tokio::task::spawn_blocking(move || dispatcher.dispatch(&frame)).await;
            match result {
                Ok(Ok(payload)) => ReplyFrame::success(id, payload),
                Ok(Err(e)) => ReplyFrame::failure(id, e.to_string()),
                Err(e) => {
                    // A panicking handler still produces a failure result.
                    error!("handler for request {} panicked: {}", id, e);
                    ReplyFrame::failure(id, format!("handler failed: {}", e))
                }
            }
        }
        Err(e) => ReplyFrame::failure(id, e.to_string()),
    };

    debug!("completed request id {}", id);
    write_half.write_all(reply.encode()?.as_bytes()).await?;
    write_half.flush().await?;
    Ok(())
}
