//! Reconnecting client handle.

use super::retry::{retry_async, RetryConfig};
use super::IpcClient;
use crate::config::ClientConfig;
use crate::discovery;
use crate::error::{IpcError, Result};
use crate::protocol::{Request, Response};
use crate::transport::Address;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Where the pool finds its server.
#[derive(Debug, Clone)]
enum Target {
    Fixed(Address),
    /// Re-read the discovery file on every reconnect, so a restarted server
    /// on a new address is found.
    Discovered(PathBuf),
}

/// A lazily connected client that reconnects after connection loss.
///
/// Idempotent (`GET`) requests are retried according to the pool's
/// [`RetryConfig`] when the failure is transient: a lost connection, a
/// timeout, or a `SERVICE_UNAVAILABLE` reply. All other methods are sent
/// once, so a mutation is never applied twice.
#[derive(Debug)]
pub struct ClientPool {
    target: Target,
    retry: RetryConfig,
    request_timeout: Duration,
    current: Mutex<Option<Arc<IpcClient>>>,
}

impl ClientPool {
    pub fn new(address: Address) -> Self {
        Self::with_target(Target::Fixed(address))
    }

    /// Pool that locates the server through `runtime_dir`'s discovery file.
    pub fn discovered(runtime_dir: impl AsRef<Path>) -> Self {
        Self::with_target(Target::Discovered(runtime_dir.as_ref().to_path_buf()))
    }

    fn with_target(target: Target) -> Self {
        Self {
            target,
            retry: RetryConfig::default(),
            request_timeout: ClientConfig::DEFAULT_REQUEST_TIMEOUT,
            current: Mutex::new(None),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// The live client, connecting first if needed.
    pub async fn client(&self) -> Result<Arc<IpcClient>> {
        let mut current = self.current.lock().await;
        if let Some(client) = current.as_ref() {
            if !client.is_closed() {
                return Ok(client.clone());
            }
            debug!("Dropping closed connection to {}", client.address());
        }

        let address = self.resolve_address()?;
        let client = Arc::new(
            IpcClient::connect(&address)
                .await?
                .with_default_timeout(self.request_timeout),
        );
        *current = Some(client.clone());
        Ok(client)
    }

    /// Forget the current connection; the next request reconnects.
    pub async fn invalidate(&self) {
        self.current.lock().await.take();
    }

    fn resolve_address(&self) -> Result<Address> {
        match &self.target {
            Target::Fixed(address) => Ok(address.clone()),
            Target::Discovered(runtime_dir) => discovery::discover(runtime_dir)?
                .map(|info| info.address())
                .ok_or_else(|| {
                    IpcError::connection_lost(format!(
                        "No running server found in {}",
                        runtime_dir.display()
                    ))
                }),
        }
    }

    /// Send a request, reconnecting and retrying idempotent ones.
    ///
    /// A `SERVICE_UNAVAILABLE` reply that survives the retries comes back as
    /// [`IpcError::Remote`]; other error statuses are returned as responses.
    pub async fn send(&self, request: Request) -> Result<Response> {
        let retry = if request.method.is_idempotent() {
            self.retry.clone()
        } else {
            RetryConfig::none()
        };

        let request = &request;
        let (result, stats) = retry_async(
            &retry,
            || async move {
                let client = self.client().await?;
                let result = client.send(request.clone(), self.request_timeout).await;
                if matches!(result, Err(IpcError::ConnectionLost { .. })) {
                    self.invalidate().await;
                }
                unavailable_as_error(result?)
            },
            IpcError::is_retryable,
        )
        .await;

        if stats.attempts > 1 {
            debug!(
                "{} {} took {} attempts",
                request.method.as_str(),
                request.path,
                stats.attempts
            );
        }
        result
    }

    /// Send a request and unwrap the payload.
    pub async fn call(&self, request: Request) -> Result<Value> {
        self.send(request).await?.into_result()
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.call(Request::get(path)).await
    }

    pub async fn post(&self, path: &str, data: Value) -> Result<Value> {
        self.call(Request::post(path, data)).await
    }
}

/// Surface a `SERVICE_UNAVAILABLE` reply as an error so it can be retried.
fn unavailable_as_error(response: Response) -> Result<Response> {
    match response.error {
        Some(error) if response.status_code == 503 => Err(IpcError::Remote {
            status_code: response.status_code,
            error,
        }),
        error => Ok(Response { error, ..response }),
    }
}
