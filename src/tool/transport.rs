//! Newline-delimited JSON-RPC transport.
//!
//! The transport is generic over the byte streams so the same code drives a
//! child process's stdio and the in-memory pipes used in tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::error::{TransportError, TransportResult};
use super::protocol::{
    codes, methods, Incoming, IncomingMessage, NotificationEnvelope, ReplyEnvelope,
    RequestEnvelope,
};

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<TransportResult<Value>>>>>;
type SharedWriter = Arc<AsyncMutex<BufWriter<Box<dyn AsyncWrite + Send + Unpin>>>>;

/// JSON-RPC peer over a pair of byte streams.
///
/// A background task reads one message per line and routes responses to
/// the waiting caller by request id. Requests initiated by the other side
/// are answered from the same task.
pub struct RpcTransport {
    /// Writer for outgoing frames.
    writer: SharedWriter,

    /// Map of pending request IDs to response channels.
    pending: PendingMap,

    /// Handle to the background reader task.
    reader_task: JoinHandle<()>,
}

impl RpcTransport {
    /// Start a transport over the given streams.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let boxed: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        let writer: SharedWriter = Arc::new(AsyncMutex::new(BufWriter::new(boxed)));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let reader_task = Self::spawn_reader_task(reader, pending.clone(), writer.clone());

        Self {
            writer,
            pending,
            reader_task,
        }
    }

    /// Spawn the background task that reads messages from the peer.
    fn spawn_reader_task<R>(
        reader: R,
        pending: PendingMap,
        writer: SharedWriter,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let frame = line.trim();
                        if frame.is_empty() {
                            continue;
                        }
                        trace!(frame, "received frame");
                        match serde_json::from_str::<IncomingMessage>(frame) {
                            Ok(message) => {
                                Self::dispatch(message.classify(), &pending, &writer).await
                            }
                            // Servers occasionally print banners on stdout
                            Err(e) => debug!(error = %e, "ignoring non-protocol line from tool"),
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "tool read error");
                        break;
                    }
                }
            }

            // Peer gone - fail every waiting request
            let drained: Vec<_> = lock(&pending).drain().collect();
            for (_, tx) in drained {
                let _ = tx.send(Err(TransportError::ProcessExited));
            }
            debug!("tool output closed");
        })
    }

    async fn dispatch(incoming: Incoming, pending: &PendingMap, writer: &SharedWriter) {
        match incoming {
            Incoming::Response { id, outcome } => {
                let waiter = lock(pending).remove(&id);
                match waiter {
                    Some(tx) => {
                        let outcome =
                            outcome.map_err(|e| TransportError::rpc(e.code, e.message));
                        let _ = tx.send(outcome);
                    }
                    None => debug!(%id, "response for unknown request"),
                }
            }
            Incoming::Request { id, method } => {
                let reply = if method == methods::PING {
                    ReplyEnvelope::result(id, Value::Object(Default::default()))
                } else {
                    debug!(%method, "rejecting request from tool");
                    ReplyEnvelope::error(
                        id,
                        codes::METHOD_NOT_FOUND,
                        format!("method not supported by client: {}", method),
                    )
                };
                if let Err(e) = write_frame(writer, &reply).await {
                    warn!(error = %e, "failed to answer tool request");
                }
            }
            Incoming::Notification { method } => debug!(%method, "tool notification"),
            Incoming::Invalid => debug!("ignoring message without id or method"),
        }
    }

    /// Send a request and wait for its result.
    ///
    /// No deadline is applied here; callers that need one wrap the future.
    pub async fn request<R>(&self, method: &str, params: Option<Value>) -> TransportResult<R>
    where
        R: DeserializeOwned,
    {
        let id = uuid::Uuid::new_v4().to_string();
        let request = RequestEnvelope::new(id.clone(), method, params);

        // Register response channel
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), tx);
        let _cleanup = PendingGuard {
            pending: &self.pending,
            id: &id,
        };

        write_frame(&self.writer, &request).await?;

        let result = rx.await??;
        serde_json::from_value(result).map_err(TransportError::DeserializeFailed)
    }

    /// Send a notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> TransportResult<()> {
        write_frame(&self.writer, &NotificationEnvelope::new(method, params)).await
    }

    /// Check if the peer is still sending.
    pub fn is_alive(&self) -> bool {
        !self.reader_task.is_finished()
    }

    /// Close the outgoing stream so the peer sees EOF.
    pub async fn close(&self) -> TransportResult<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.map_err(TransportError::WriteFailed)
    }
}

impl Drop for RpcTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Removes a pending entry when the request future finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn write_frame<T: Serialize>(writer: &SharedWriter, frame: &T) -> TransportResult<()> {
    let line = serde_json::to_string(frame).map_err(TransportError::SerializeFailed)? + "\n";
    let mut writer = writer.lock().await;
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(TransportError::WriteFailed)?;
    writer.flush().await.map_err(TransportError::WriteFailed)
}
