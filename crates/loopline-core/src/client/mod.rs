//! Client library.
//!
//! [`IpcClient`] multiplexes concurrent requests over one connection: each
//! request gets a fresh `request_id`, and a background reader task routes
//! every response to the caller waiting on that id. Frames go out through a
//! single writer task, so a caller that gives up never leaves half a frame
//! on the wire. When the connection drops, every waiting caller gets
//! `ConnectionLost` instead of hanging.
//!
//! [`ClientPool`] adds lazy reconnection and bounded retries for idempotent
//! requests.

mod pool;
mod retry;

pub use pool::ClientPool;
pub use retry::{retry_async, RetryConfig, RetryStats};

use crate::config::ClientConfig;
use crate::discovery;
use crate::error::{IpcError, Result};
use crate::protocol::{Framer, Request, Response};
use crate::transport::{self, Address, BoxedStream};
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

type Waiter = oneshot::Sender<Result<Response>>;

/// Encoded requests waiting for the writer task.
const OUTBOUND_QUEUE: usize = 32;

/// Callers waiting for a response, keyed by `request_id`.
#[derive(Default)]
struct Pending {
    waiters: HashMap<String, Waiter>,
    /// Set once the connection is gone; no new waiters are accepted.
    closed: Option<String>,
}

#[derive(Default)]
struct PendingMap(StdMutex<Pending>);

impl PendingMap {
    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: &str, waiter: Waiter) -> Result<()> {
        let mut pending = self.lock();
        if let Some(reason) = &pending.closed {
            return Err(IpcError::connection_lost(reason.clone()));
        }
        if pending.waiters.contains_key(id) {
            return Err(IpcError::BadRequest {
                message: format!("request_id {} is already in flight", id),
            });
        }
        pending.waiters.insert(id.to_string(), waiter);
        Ok(())
    }

    fn take(&self, id: &str) -> Option<Waiter> {
        self.lock().waiters.remove(id)
    }

    /// Fail every waiter and refuse new ones.
    fn close(&self, reason: String) {
        let waiters = {
            let mut pending = self.lock();
            pending.closed = Some(reason.clone());
            std::mem::take(&mut pending.waiters)
        };
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(IpcError::connection_lost(reason.clone())));
        }
    }

    fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }
}

/// Removes a waiter if the caller gives up (timeout or cancellation).
struct WaiterGuard<'a> {
    pending: &'a PendingMap,
    id: &'a str,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.pending.take(self.id);
    }
}

/// A connection to a loopline server.
pub struct IpcClient {
    address: Address,
    framer: Framer,
    outbound: mpsc::Sender<Bytes>,
    pending: Arc<PendingMap>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    default_timeout: Duration,
}

impl IpcClient {
    /// Connect to a server at `address`.
    pub async fn connect(address: &Address) -> Result<Self> {
        let stream = transport::connect(address).await?;
        debug!("IPC client connected to {}", address);
        Ok(Self::from_stream(address.clone(), stream))
    }

    /// Connect to the server published in `runtime_dir`'s discovery file.
    pub async fn connect_discovered(runtime_dir: &Path) -> Result<Self> {
        let info = discovery::discover(runtime_dir)?.ok_or_else(|| {
            IpcError::connection_lost(format!(
                "No running server found in {}",
                runtime_dir.display()
            ))
        })?;
        Self::connect(&info.address()).await
    }

    fn from_stream(address: Address, stream: BoxedStream) -> Self {
        let framer = Framer::default();
        let (read_half, write_half) = tokio::io::split(stream);
        let pending = Arc::new(PendingMap::default());
        let reader = tokio::spawn(read_responses(framer, read_half, pending.clone()));
        let (outbound, frames) = mpsc::channel(OUTBOUND_QUEUE);
        let writer = tokio::spawn(write_requests(write_half, frames, pending.clone()));

        Self {
            address,
            framer,
            outbound,
            pending,
            reader,
            writer,
            default_timeout: ClientConfig::DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// True once the connection has been lost.
    pub fn is_closed(&self) -> bool {
        self.pending.is_closed()
    }

    /// Send `request` and wait up to `timeout` for its response.
    ///
    /// The timeout covers the whole exchange: queueing the frame behind other
    /// requests, writing it, and waiting for the reply. Generates a
    /// `request_id` if the request has none, and forwards the timeout to the
    /// server as the request's processing budget. Any
    /// response the server sends, error statuses included, is returned as
    /// `Ok`; see [`call`](Self::call) for typed errors.
    pub async fn send(&self, mut request: Request, timeout: Duration) -> Result<Response> {
        let request_id = request
            .request_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        if request.timeout.is_none() {
            request.timeout = Some(timeout.as_secs_f64());
        }
        let frame = self.framer.encode(&request)?;

        let deadline = tokio::time::Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(&request_id, tx)?;
        let _guard = WaiterGuard {
            pending: &self.pending,
            id: &request_id,
        };

        let exchange = async {
            self.outbound
                .send(frame)
                .await
                .map_err(|_| IpcError::connection_lost("Connection writer has stopped"))?;
            rx.await.map_err(|_| {
                IpcError::connection_lost("Connection closed before a response arrived")
            })?
        };

        match tokio::time::timeout_at(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => Err(IpcError::Timeout(timeout)),
        }
    }

    /// Send `request` with the default timeout and unwrap the payload.
    ///
    /// Non-2xx responses become [`IpcError::Remote`].
    pub async fn call(&self, request: Request) -> Result<Value> {
        self.send(request, self.default_timeout).await?.into_result()
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.call(Request::get(path)).await
    }

    pub async fn post(&self, path: &str, data: Value) -> Result<Value> {
        self.call(Request::post(path, data)).await
    }

    pub async fn put(&self, path: &str, data: Value) -> Result<Value> {
        self.call(Request::put(path, data)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.call(Request::delete(path)).await
    }
}

impl std::fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcClient")
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Write queued frames in order. A failed write poisons the connection.
async fn write_requests(
    mut writer: WriteHalf<BoxedStream>,
    mut frames: mpsc::Receiver<Bytes>,
    pending: Arc<PendingMap>,
) {
    while let Some(frame) = frames.recv().await {
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            debug!("IPC client writer stopped: {}", e);
            pending.close(format!("Failed to send request: {}", e));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_responses(framer: Framer, mut reader: ReadHalf<BoxedStream>, pending: Arc<PendingMap>) {
    let reason = loop {
        match framer.read_message::<Response, _>(&mut reader).await {
            Ok(Some(response)) => {
                let waiter = response.request_id.as_deref().and_then(|id| pending.take(id));
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(response));
                    }
                    None => match &response.error {
                        Some(error) => warn!(
                            "Server sent uncorrelated error {}: {}",
                            error.error_code, error.error_message
                        ),
                        None => debug!(
                            "Dropping response for unknown request {:?}",
                            response.request_id
                        ),
                    },
                }
            }
            Ok(None) => break "Server closed the connection".to_string(),
            Err(e) => break format!("Connection failed: {}", e),
        }
    };

    debug!("IPC client reader stopped: {}", reason);
    pending.close(reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Method;
    use serde_json::json;
    use tokio::io::{duplex, DuplexStream};

    /// Client wired to an in-memory peer the test drives by hand.
    fn pair() -> (IpcClient, DuplexStream) {
        let (client_side, server_side) = duplex(64 * 1024);
        let client = IpcClient::from_stream(
            Address::UnixSocket("/test.sock".into()),
            Box::new(client_side),
        );
        (client, server_side)
    }

    #[tokio::test]
    async fn test_responses_correlated_out_of_order() {
        let (client, mut server) = pair();
        let client = Arc::new(client);
        let framer = Framer::default();

        let a = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .send(Request::get("/api/v1/a").with_request_id("a"), Duration::from_secs(5))
                    .await
            }
        });
        let first: Request = framer.read_message(&mut server).await.unwrap().unwrap();
        assert_eq!(first.request_id.as_deref(), Some("a"));
        assert_eq!(first.method, Method::Get);
        assert!(first.timeout.is_some());

        let b = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .send(Request::get("/api/v1/b").with_request_id("b"), Duration::from_secs(5))
                    .await
            }
        });
        let second: Request = framer.read_message(&mut server).await.unwrap().unwrap();
        assert_eq!(second.request_id.as_deref(), Some("b"));

        // Answer in reverse order
        framer
            .write_message(
                &mut server,
                &Response::ok(json!("B")).with_request_id(Some("b".into())),
            )
            .await
            .unwrap();
        framer
            .write_message(
                &mut server,
                &Response::ok(json!("A")).with_request_id(Some("a".into())),
            )
            .await
            .unwrap();

        assert_eq!(a.await.unwrap().unwrap().data, Some(json!("A")));
        assert_eq!(b.await.unwrap().unwrap().data, Some(json!("B")));
    }

    #[tokio::test]
    async fn test_generates_unique_request_ids() {
        let (client, mut server) = pair();
        let client = Arc::new(client);
        let framer = Framer::default();

        for _ in 0..2 {
            let client = client.clone();
            tokio::spawn(async move {
                let _ = client.send(Request::get("/api/v1/x"), Duration::from_secs(5)).await;
            });
        }
        let one: Request = framer.read_message(&mut server).await.unwrap().unwrap();
        let two: Request = framer.read_message(&mut server).await.unwrap().unwrap();
        assert!(one.request_id.is_some());
        assert_ne!(one.request_id, two.request_id);
    }

    #[tokio::test]
    async fn test_timeout_is_distinct_error() {
        let (client, _server) = pair();
        let err = client
            .send(Request::get("/api/v1/slow"), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Timeout(_)));
        assert!(client.pending.lock().waiters.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_covers_blocked_write() {
        // Tiny buffer and a peer that never reads: the frame can't be flushed.
        let (client_side, _server) = duplex(64);
        let client = Arc::new(IpcClient::from_stream(
            Address::UnixSocket("/test.sock".into()),
            Box::new(client_side),
        ));
        let big = json!({ "blob": "x".repeat(10 * 1024) });

        let first = tokio::spawn({
            let client = client.clone();
            let big = big.clone();
            async move {
                client
                    .send(Request::post("/api/v1/upload", big), Duration::from_millis(100))
                    .await
            }
        });
        let second = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .send(Request::post("/api/v1/upload", big), Duration::from_millis(100))
                    .await
            }
        });

        for task in [first, second] {
            let result = tokio::time::timeout(Duration::from_secs(2), task)
                .await
                .expect("send outlived its timeout")
                .unwrap();
            assert!(matches!(result, Err(IpcError::Timeout(_))));
        }
        assert!(client.pending.lock().waiters.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_send_keeps_framing_intact() {
        let (client, mut server) = pair();
        let client = Arc::new(client);
        let framer = Framer::default();

        // Cancel a send right away; its frame must still go out whole.
        let abandoned = client.send(
            Request::post("/api/v1/a", json!({ "blob": "y".repeat(4096) }))
                .with_request_id("gone"),
            Duration::from_secs(5),
        );
        let _ = tokio::time::timeout(Duration::from_millis(1), abandoned).await;

        let next = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .send(Request::get("/api/v1/b").with_request_id("b"), Duration::from_secs(5))
                    .await
            }
        });

        let mut seen = Vec::new();
        while !seen.iter().any(|id: &String| id == "b") {
            let request: Request = framer.read_message(&mut server).await.unwrap().unwrap();
            seen.push(request.request_id.clone().unwrap());
            framer
                .write_message(
                    &mut server,
                    &Response::ok(json!(null)).with_request_id(request.request_id),
                )
                .await
                .unwrap();
        }

        assert_eq!(next.await.unwrap().unwrap().status_code, 200);
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending() {
        let (client, mut server) = pair();
        let client = Arc::new(client);
        let framer = Framer::default();

        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.send(Request::get("/api/v1/x"), Duration::from_secs(30)).await }
        });
        let _: Request = framer.read_message(&mut server).await.unwrap().unwrap();
        drop(server);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, IpcError::ConnectionLost { .. }));
        assert!(client.is_closed());

        let err = client
            .send(Request::get("/api/v1/x"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::ConnectionLost { .. }));
    }

    #[tokio::test]
    async fn test_call_maps_error_status_to_remote() {
        let (client, mut server) = pair();
        let client = Arc::new(client);
        let framer = Framer::default();

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.get("/api/v2/unknown").await }
        });
        let request: Request = framer.read_message(&mut server).await.unwrap().unwrap();
        let not_found = IpcError::NotFound {
            path: request.path.clone(),
        };
        framer
            .write_message(
                &mut server,
                &Response::from_error(&not_found).with_request_id(request.request_id),
            )
            .await
            .unwrap();

        match call.await.unwrap() {
            Err(IpcError::Remote { status_code, error }) => {
                assert_eq!(status_code, 404);
                assert_eq!(error.error_code, "NOT_FOUND");
            }
            other => panic!("Expected Remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_request_id_rejected() {
        let (client, _server) = pair();
        let client = Arc::new(client);

        let first = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .send(Request::get("/api/v1/x").with_request_id("dup"), Duration::from_millis(300))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = client
            .send(Request::get("/api/v1/x").with_request_id("dup"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::BadRequest { .. }));
        let _ = first.await;
    }

    #[tokio::test]
    async fn test_connect_discovered_without_server() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let err = IpcClient::connect_discovered(temp_dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::ConnectionLost { .. }));
    }
}
