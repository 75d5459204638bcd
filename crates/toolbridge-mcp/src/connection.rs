//! Request/response correlation over a framed byte stream.
//!
//! One [`RpcConnection`] per live server. Requests get monotonically
//! increasing ids and a slot in the pending table; the reader task hands
//! decoded frames to [`RpcConnection::dispatch`], which resolves the slot
//! with the matching id. Outgoing frames go through a writer task, so a
//! peer that stops reading stalls only that task, never a caller.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use toolbridge_core::{BridgeError, Result};
use tracing::{debug, warn};

use crate::framing::{encode_frame, FrameDecoder, Framing};
use crate::types::{IncomingMessage, JsonRpcNotification, JsonRpcRequest};

/// An encoded frame queued for the writer task. `ack` receives the outcome
/// of the write when the sender wants it.
struct OutboundFrame {
    bytes: Vec<u8>,
    ack: Option<oneshot::Sender<std::io::Result<()>>>,
}

struct PendingRequest {
    method: String,
    responder: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<u64, PendingRequest>,
    /// Set once by `fail_all`; no new requests are accepted afterwards.
    terminated: Option<String>,
}

pub struct RpcConnection {
    label: String,
    framing: Framing,
    /// `None` once the write side has been closed
    outbound: Mutex<Option<mpsc::UnboundedSender<OutboundFrame>>>,
    next_id: AtomicU64,
    pending: Mutex<PendingTable>,
}

/// Removes the pending entry when the awaiting request finishes, whatever
/// the outcome, including the caller dropping the future.
struct PendingGuard<'a> {
    connection: &'a RpcConnection,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.connection.table().entries.remove(&self.id);
    }
}

impl std::fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConnection")
            .field("label", &self.label)
            .field("framing", &self.framing)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl RpcConnection {
    /// Must be called from within a Tokio runtime: the writer task is
    /// spawned here.
    pub fn new(
        label: impl Into<String>,
        framing: Framing,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let label = label.into();
        let (outbound, frames) = mpsc::unbounded_channel();
        spawn_writer(label.clone(), writer, frames);

        Self {
            label,
            framing,
            outbound: Mutex::new(Some(outbound)),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(PendingTable::default()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn pending_count(&self) -> usize {
        self.table().entries.len()
    }

    pub fn is_terminated(&self) -> bool {
        self.table().terminated.is_some()
    }

    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a request and wait for its response, a timeout, or cancellation.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();

        let id = {
            let mut table = self.table();
            if table.terminated.is_some() {
                return Err(BridgeError::TransportClosed);
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            table.entries.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    responder: tx,
                },
            );
            id
        };
        let _guard = PendingGuard {
            connection: self,
            id,
        };

        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(BridgeError::RequestCancelled {
                method: method.to_string(),
            });
        }

        let request = JsonRpcRequest::new(id, method, params);
        let message = serde_json::to_value(&request)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.enqueue(&message, Some(ack_tx))
            .map_err(|e| send_failure(method, e.to_string()))?;

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let expired = sleep_until(deadline);
        tokio::pin!(cancelled, expired);

        // The write itself is bounded by the deadline and the token too.
        tokio::select! {
            written = ack_rx => match written {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(send_failure(method, e.to_string())),
                Err(_) => return Err(send_failure(method, "writer closed".to_string())),
            },
            _ = &mut expired => return Err(self.timeout_error(id, method, timeout)),
            _ = &mut cancelled => return Err(self.cancel_error(id, method)),
        }

        tokio::select! {
            outcome = rx => match outcome {
                Ok(result) => result,
                // Responder dropped without an answer: the table was torn down.
                Err(_) => Err(BridgeError::TransportClosed),
            },
            _ = &mut expired => Err(self.timeout_error(id, method, timeout)),
            _ = &mut cancelled => Err(self.cancel_error(id, method)),
        }
    }

    fn timeout_error(&self, id: u64, method: &str, timeout: Duration) -> BridgeError {
        debug!("[{}] request {} '{}' timed out", self.label, id, method);
        BridgeError::RequestTimeout {
            method: method.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    fn cancel_error(&self, id: u64, method: &str) -> BridgeError {
        debug!("[{}] request {} '{}' cancelled", self.label, id, method);
        BridgeError::RequestCancelled {
            method: method.to_string(),
        }
    }

    /// Queue a notification. No id is allocated and no response is awaited;
    /// returns once the frame is queued, write errors are only logged.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.is_terminated() {
            return Err(BridgeError::TransportClosed);
        }

        let notification = JsonRpcNotification::new(method, params);
        let message = serde_json::to_value(&notification)?;
        self.enqueue(&message, None)
            .map_err(|e| send_failure(method, e.to_string()))
    }

    fn enqueue(
        &self,
        message: &Value,
        ack: Option<oneshot::Sender<std::io::Result<()>>>,
    ) -> Result<()> {
        let bytes = encode_frame(self.framing, message)?;

        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = outbound.as_ref().ok_or(BridgeError::TransportClosed)?;

        debug!("[{}] -> {}", self.label, message);
        sender
            .send(OutboundFrame { bytes, ack })
            .map_err(|_| BridgeError::TransportClosed)
    }

    /// Close the write side. Frames already queued are still written, then
    /// the stream is shut down; neither is waited for, so a stalled peer
    /// cannot block the caller. Further sends fail.
    pub fn close_writer(&self) {
        let closed = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if closed.is_some() {
            debug!("[{}] closing writer", self.label);
        }
    }

    /// Route one decoded frame.
    pub fn dispatch(&self, message: Value) {
        match IncomingMessage::classify(message) {
            IncomingMessage::Response { id, result, error } => {
                let Some(pending) = self.table().entries.remove(&id) else {
                    debug!("[{}] dropping response for unknown request {}", self.label, id);
                    return;
                };

                let outcome = match error {
                    Some(error) => Err(BridgeError::RemoteError {
                        message: error.message,
                        code: error.code,
                    }),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                debug!("[{}] <- response {} for '{}'", self.label, id, pending.method);
                // The requester may have just given up; nothing to do then.
                let _ = pending.responder.send(outcome);
            }
            IncomingMessage::ServerMessage { method, id } => {
                debug!("[{}] ignoring server message '{}' (id {:?})", self.label, method, id);
            }
            IncomingMessage::Unrecognized(value) => {
                debug!("[{}] ignoring unrecognized message: {}", self.label, value);
            }
        }
    }

    /// Reject every pending request with `ProcessTerminated` and refuse new
    /// ones. Only the first call has an effect; returns how many requests
    /// were rejected.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<(u64, PendingRequest)> = {
            let mut table = self.table();
            if table.terminated.is_some() {
                return 0;
            }
            table.terminated = Some(reason.to_string());
            table.entries.drain().collect()
        };

        let count = drained.len();
        for (id, pending) in drained {
            debug!(
                "[{}] failing request {} '{}': {}",
                self.label, id, pending.method, reason
            );
            let _ = pending
                .responder
                .send(Err(BridgeError::ProcessTerminated(reason.to_string())));
        }
        if count > 0 {
            warn!("[{}] rejected {} pending request(s): {}", self.label, count, reason);
        }
        count
    }
}

fn send_failure(method: &str, message: String) -> BridgeError {
    BridgeError::SendFailure {
        method: method.to_string(),
        message,
    }
}

/// Write queued frames in order until the connection closes its side of the
/// queue, then shut the stream down. A failed write drops the queue, which
/// fails every frame still waiting for an acknowledgement.
fn spawn_writer<W>(
    label: String,
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<OutboundFrame>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let written = write_frame(&mut writer, &frame.bytes).await;
            let failure = written.as_ref().err().map(ToString::to_string);
            if let Some(ack) = frame.ack {
                let _ = ack.send(written);
            }
            if let Some(e) = failure {
                warn!("[{}] error writing to server: {}", label, e);
                return;
            }
        }

        if let Err(e) = writer.shutdown().await {
            debug!("[{}] error closing writer: {}", label, e);
        }
    })
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Read frames from `reader` until EOF or a read error, dispatching each one
/// to `connection`. Malformed frames are logged and skipped.
pub fn spawn_reader<R>(connection: Arc<RpcConnection>, reader: R) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut reader = reader;
        let mut decoder = FrameDecoder::new(connection.framing());
        let mut chunk = vec![0u8; 8192];

        loop {
            let read = match reader.read(&mut chunk).await {
                Ok(0) => {
                    debug!("[{}] server output closed", connection.label());
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("[{}] error reading server output: {}", connection.label(), e);
                    connection.fail_all(&format!("error reading server output: {}", e));
                    break;
                }
            };

            decoder.feed(&chunk[..read]);
            while let Some(frame) = decoder.next_frame() {
                match frame {
                    Ok(message) => connection.dispatch(message),
                    Err(e) => warn!("[{}] skipping frame: {}", connection.label(), e),
                }
            }
        }

        if decoder.buffered() > 0 {
            debug!(
                "[{}] discarding {} trailing byte(s) of incomplete frame",
                connection.label(),
                decoder.buffered()
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader, DuplexStream};

    /// A connection whose peer side is handed back to the test.
    fn connected(framing: Framing) -> (Arc<RpcConnection>, DuplexStream, DuplexStream) {
        let (client_write, server_read) = duplex(64 * 1024);
        let (server_write, client_read) = duplex(64 * 1024);
        let connection = Arc::new(RpcConnection::new("test", framing, client_write));
        spawn_reader(connection.clone(), client_read);
        (connection, server_read, server_write)
    }

    async fn read_request(reader: &mut BufReader<DuplexStream>) -> Value {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn reply(writer: &mut DuplexStream, message: Value) {
        let frame = encode_frame(Framing::Line, &message).unwrap();
        writer.write_all(&frame).await.unwrap();
    }

    #[tokio::test]
    async fn test_request_resolves_with_result() {
        let (connection, server_read, mut server_write) = connected(Framing::Line);
        let mut server_read = BufReader::new(server_read);

        let server = tokio::spawn(async move {
            let request = read_request(&mut server_read).await;
            assert_eq!(request["jsonrpc"], "2.0");
            assert_eq!(request["id"], 1);
            assert_eq!(request["method"], "ping");
            assert_eq!(request["params"], json!({"x": 1}));
            reply(&mut server_write, json!({"jsonrpc": "2.0", "id": 1, "result": {"pong": true}})).await;
            (server_read, server_write)
        });

        let result = connection
            .request("ping", Some(json!({"x": 1})), Duration::from_secs(5), None)
            .await
            .unwrap();
        assert_eq!(result, json!({"pong": true}));
        assert_eq!(connection.pending_count(), 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_error_carries_code() {
        let (connection, server_read, mut server_write) = connected(Framing::Line);
        let mut server_read = BufReader::new(server_read);

        tokio::spawn(async move {
            let request = read_request(&mut server_read).await;
            reply(
                &mut server_write,
                json!({"jsonrpc": "2.0", "id": request["id"], "error": {"code": -32601, "message": "no such method"}}),
            )
            .await;
            (server_read, server_write)
        });

        let err = connection
            .request("missing", None, Duration::from_secs(5), None)
            .await
            .unwrap_err();
        match err {
            BridgeError::RemoteError { message, code } => {
                assert_eq!(message, "no such method");
                assert_eq!(code, Some(-32601));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (connection, server_read, mut server_write) = connected(Framing::Line);
        let mut server_read = BufReader::new(server_read);

        tokio::spawn(async move {
            let first = read_request(&mut server_read).await;
            let second = read_request(&mut server_read).await;
            for request in [second, first] {
                reply(
                    &mut server_write,
                    json!({"jsonrpc": "2.0", "id": request["id"], "result": request["method"]}),
                )
                .await;
            }
            (server_read, server_write)
        });

        let (a, b) = tokio::join!(
            connection.request("a", None, Duration::from_secs(5), None),
            connection.request("b", None, Duration::from_secs(5), None),
        );
        assert_eq!(a.unwrap(), json!("a"));
        assert_eq!(b.unwrap(), json!("b"));
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry() {
        let (connection, _server_read, _server_write) = connected(Framing::Line);

        let started = std::time::Instant::now();
        let err = connection
            .request("slow", None, Duration::from_millis(50), None)
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, BridgeError::RequestTimeout { ref method, .. } if method == "slow"));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let (connection, _server_read, _server_write) = connected(Framing::Line);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = connection
            .request("long", None, Duration::from_secs(30), Some(&token))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::RequestCancelled { ref method } if method == "long"));
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_already_cancelled_is_not_sent() {
        let (connection, server_read, _server_write) = connected(Framing::Line);
        let token = CancellationToken::new();
        token.cancel();

        let err = connection
            .request("never", None, Duration::from_secs(30), Some(&token))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::RequestCancelled { .. }));
        assert_eq!(connection.pending_count(), 0);

        // Nothing was written: the next frame on the wire is the notification.
        connection.notify("marker", None).await.unwrap();
        let mut server_read = BufReader::new(server_read);
        let first = read_request(&mut server_read).await;
        assert_eq!(first["method"], "marker");
        assert!(first.get("id").is_none());
    }

    #[tokio::test]
    async fn test_fail_all_drains_pending() {
        let (connection, _server_read, _server_write) = connected(Framing::Line);

        let mut waiters = Vec::new();
        for i in 0..3 {
            let connection = connection.clone();
            waiters.push(tokio::spawn(async move {
                connection
                    .request(&format!("m{}", i), None, Duration::from_secs(30), None)
                    .await
            }));
        }

        while connection.pending_count() < 3 {
            tokio::task::yield_now().await;
        }

        assert_eq!(connection.fail_all("exit code 1"), 3);
        assert_eq!(connection.fail_all("again"), 0);

        for waiter in waiters {
            let err = waiter.await.unwrap().unwrap_err();
            assert!(matches!(err, BridgeError::ProcessTerminated(ref reason) if reason == "exit code 1"));
        }
        assert_eq!(connection.pending_count(), 0);

        let err = connection
            .request("late", None, Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::TransportClosed));
        assert!(connection.notify("late", None).await.is_err());
    }

    #[tokio::test]
    async fn test_send_failure_removes_entry() {
        let (connection, _server_read, _server_write) = connected(Framing::Line);
        connection.close_writer();

        let err = connection
            .request("ping", None, Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::SendFailure { .. }));
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_header_framing_round_trip() {
        let (connection, mut server_read, mut server_write) = connected(Framing::Header);

        tokio::spawn(async move {
            let mut decoder = FrameDecoder::new(Framing::Header);
            let mut buf = [0u8; 256];
            let request = loop {
                let n = server_read.read(&mut buf).await.unwrap();
                decoder.feed(&buf[..n]);
                if let Some(frame) = decoder.next_frame() {
                    break frame.unwrap();
                }
            };
            let response = json!({"jsonrpc": "2.0", "id": request["id"], "result": "ü"});
            let frame = encode_frame(Framing::Header, &response).unwrap();
            // Dribble the reply one byte at a time.
            for byte in frame {
                server_write.write_all(&[byte]).await.unwrap();
            }
            (server_read, server_write)
        });

        let result = connection
            .request("hello", None, Duration::from_secs(5), None)
            .await
            .unwrap();
        assert_eq!(result, json!("ü"));
    }

    #[tokio::test]
    async fn test_stalled_peer_does_not_block_callers() {
        // A tiny pipe whose far end is never read fills after the first frame.
        let (client_write, _server_read) = duplex(64);
        let (_server_write, client_read) = duplex(64);
        let connection = Arc::new(RpcConnection::new("stalled", Framing::Line, client_write));
        spawn_reader(connection.clone(), client_read);
        let params = json!({"blob": "x".repeat(4096)});

        let started = std::time::Instant::now();
        let err = connection
            .request("tools/call", Some(params.clone()), Duration::from_millis(50), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::RequestTimeout { timeout_ms: 50, .. }));
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
        assert_eq!(connection.pending_count(), 0);

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let blocked = {
            let connection = connection.clone();
            tokio::spawn(async move {
                connection
                    .request("tools/call", Some(params), Duration::from_secs(30), Some(&token))
                    .await
            })
        };
        let err = tokio::time::timeout(Duration::from_secs(2), blocked)
            .await
            .expect("cancelled request should return promptly")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BridgeError::RequestCancelled { .. }));

        // Closing the write side does not wait behind the stuck write.
        connection.close_writer();
        let err = connection
            .request("ping", None, Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::SendFailure { .. }));
        assert!(connection.notify("exit", None).await.is_err());
        assert_eq!(connection.pending_count(), 0);
    }
}
