//! IPC server.
//!
//! Binds the platform transport, publishes the discovery file, and serves
//! every accepted connection in its own task.
//!
//! # Per-connection pipeline
//!
//! - A reader task pulls frames off the stream and hands them to the
//!   connection loop over a channel
//! - Each decoded request runs through the middleware chain and router in
//!   its own task, so requests on one connection proceed concurrently
//! - A writer task serializes responses back in completion order; clients
//!   correlate by `request_id`
//!
//! # Shutdown
//!
//! [`IpcServerHandle::shutdown`] stops accepting, tells connections to stop
//! reading, waits up to the drain timeout for in-flight requests, aborts
//! whatever is left, and only then removes the socket file and discovery file.

use crate::config::ServerConfig;
use crate::connection::{ConnectionGuard, ConnectionManager, ConnectionRecord};
use crate::discovery::DiscoveryInfo;
use crate::error::{IpcError, Result};
use crate::middleware::{
    AuthPolicy, Authentication, Middleware, MiddlewareChain, RateLimit, RequestContext,
    RequestLogging,
};
use crate::peer::{PeerIdentity, PeerResolver, ProcessInspector};
use crate::platform;
use crate::protocol::{Framer, Request, Response};
use crate::router::Router;
use crate::transport::{self, Accepted, Address, BoxedStream, IpcListener};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Frames read ahead of the connection loop.
const INBOUND_QUEUE: usize = 16;
/// Responses waiting for the writer.
const OUTBOUND_QUEUE: usize = 64;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
/// Budget for telling a rejected peer why before hanging up.
const REJECT_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Collects routes, middleware and options before the server starts.
pub struct IpcServerBuilder {
    config: ServerConfig,
    router: Router,
    layers: Vec<Arc<dyn Middleware>>,
    inspector: Option<Arc<dyn ProcessInspector>>,
    connections: Arc<ConnectionManager>,
}

impl IpcServerBuilder {
    /// The connection table the server will use. Available before `build` so
    /// route handlers can capture it.
    pub fn connections(&self) -> Arc<ConnectionManager> {
        self.connections.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    /// Add a middleware stage after the built-in authentication, rate limit
    /// and logging stages.
    pub fn layer(mut self, stage: impl Middleware) -> Self {
        self.layers.push(Arc::new(stage));
        self
    }

    /// Replace the OS process table lookup used for the allow-list.
    pub fn process_inspector(mut self, inspector: Arc<dyn ProcessInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    /// Validate the configuration and assemble the middleware chain.
    pub fn build(self) -> Result<IpcServer> {
        self.config.validate()?;

        let policy = AuthPolicy::from_config(&self.config.auth, platform::current_user()?)?;
        let rate_limit = Arc::new(RateLimit::new(&self.config.rate_limit)?);

        let mut chain = MiddlewareChain::new();
        chain
            .push(Authentication::new(policy))
            .push_shared(rate_limit.clone())
            .push(RequestLogging);
        for stage in self.layers {
            chain.push_shared(stage);
        }
        debug!("Middleware chain: {:?}", chain);

        let mut router = self.router;
        router.configure(&self.config);

        let resolver = match self.inspector {
            Some(inspector) => PeerResolver::new(inspector),
            None => PeerResolver::default(),
        };

        Ok(IpcServer {
            shared: Arc::new(Shared {
                framer: Framer::new(self.config.max_frame_size),
                config: self.config,
                router,
                chain,
                connections: self.connections,
                resolver,
                rate_limit,
            }),
        })
    }
}

/// State shared by the accept loop and every connection task. Immutable
/// after startup apart from the connection table and rate-limit buckets.
struct Shared {
    config: ServerConfig,
    framer: Framer,
    router: Router,
    chain: MiddlewareChain,
    connections: Arc<ConnectionManager>,
    resolver: PeerResolver,
    rate_limit: Arc<RateLimit>,
}

/// A configured, not yet listening server.
pub struct IpcServer {
    shared: Arc<Shared>,
}

impl IpcServer {
    pub fn builder(config: ServerConfig) -> IpcServerBuilder {
        let connections = Arc::new(ConnectionManager::new(config.max_connections));
        IpcServerBuilder {
            config,
            router: Router::new(),
            layers: Vec::new(),
            inspector: None,
            connections,
        }
    }

    /// Bind the transport, publish the discovery file, and start accepting.
    ///
    /// Fails if the address is held by a live server or the runtime
    /// directory can't be made private.
    pub async fn start(self) -> Result<IpcServerHandle> {
        let config = &self.shared.config;
        let runtime_dir = match &config.runtime_dir {
            Some(dir) => dir.clone(),
            None => platform::runtime_dir()?,
        };
        platform::ensure_runtime_dir(&runtime_dir)?;

        let address = config
            .address
            .as_deref()
            .map(Address::parse)
            .unwrap_or_else(|| platform::default_address(&runtime_dir));

        let listener = IpcListener::bind(&address, config.accept_backlog).await?;
        let started_at = Utc::now();

        let discovery_path = if config.publish_discovery {
            let path = platform::discovery_path(&runtime_dir);
            if let Err(e) = DiscoveryInfo::for_current_process(&address, started_at).write(&path) {
                drop(listener);
                let _ = transport::remove_address(&address);
                return Err(e);
            }
            Some(path)
        } else {
            None
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let accept_task = tokio::spawn(accept_loop(listener, self.shared.clone(), stop_rx));

        info!("IPC server started on {}", address);
        Ok(IpcServerHandle {
            address,
            runtime_dir,
            discovery_path,
            started_at,
            connections: self.shared.connections.clone(),
            drain_timeout: self.shared.config.drain_timeout(),
            stop_tx: Some(stop_tx),
            accept_task: Some(accept_task),
        })
    }
}

/// Outcome of a graceful shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every connection finished within the drain timeout.
    pub drained: bool,
    /// Connections force-closed after the drain timeout.
    pub aborted_connections: usize,
    pub elapsed: Duration,
}

/// Handle to a running server. Dropping it stops the server without draining.
pub struct IpcServerHandle {
    address: Address,
    runtime_dir: PathBuf,
    discovery_path: Option<PathBuf>,
    started_at: DateTime<Utc>,
    connections: Arc<ConnectionManager>,
    drain_timeout: Duration,
    stop_tx: Option<oneshot::Sender<()>>,
    accept_task: Option<JoinHandle<JoinSet<()>>>,
}

impl IpcServerHandle {
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    pub fn discovery_path(&self) -> Option<&Path> {
        self.discovery_path.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Stop accepting, drain in-flight requests, then release the address.
    pub async fn shutdown(mut self) -> Result<ShutdownReport> {
        let started = Instant::now();
        info!("IPC server shutting down");

        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        let mut tasks = match self.accept_task.take() {
            Some(task) => task
                .await
                .map_err(|e| IpcError::Internal(format!("Accept loop failed: {}", e)))?,
            None => JoinSet::new(),
        };

        self.connections.begin_shutdown();
        let drained = self.connections.wait_for_drain(self.drain_timeout).await;

        let mut aborted_connections = 0;
        if !drained {
            aborted_connections = self.connections.active_count();
            warn!(
                "Drain timeout of {:?} elapsed, force-closing {} connection(s)",
                self.drain_timeout, aborted_connections
            );
            tasks.abort_all();
        }
        while tasks.join_next().await.is_some() {}

        self.release();

        let report = ShutdownReport {
            drained,
            aborted_connections,
            elapsed: started.elapsed(),
        };
        info!("IPC server stopped in {:?}", report.elapsed);
        Ok(report)
    }

    fn release(&mut self) {
        if let Err(e) = transport::remove_address(&self.address) {
            warn!("Failed to remove {}: {}", self.address, e);
        }
        if let Some(path) = self.discovery_path.take() {
            if let Err(e) = DiscoveryInfo::remove_if_owned(&path, std::process::id()) {
                warn!("Failed to remove discovery file: {}", e);
            }
        }
    }
}

impl Drop for IpcServerHandle {
    fn drop(&mut self) {
        let Some(task) = self.accept_task.take() else {
            return;
        };
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        self.connections.begin_shutdown();
        // Aborting the accept loop drops its JoinSet, which aborts every
        // connection task.
        task.abort();
        self.release();
    }
}

async fn accept_loop(
    mut listener: IpcListener,
    shared: Arc<Shared>,
    mut stop_rx: oneshot::Receiver<()>,
) -> JoinSet<()> {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                info!("No longer accepting connections on {}", listener.address());
                break;
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("Connection task panicked: {}", e);
                    }
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok(accepted) => {
                        let connections = &shared.connections;
                        if connections.active_count() >= connections.max_connections() {
                            warn!(
                                "Rejecting connection: at max capacity ({})",
                                connections.max_connections()
                            );
                            let err = IpcError::Unavailable {
                                message: "Server is at connection capacity".to_string(),
                            };
                            tasks.spawn(reject(shared.framer, accepted.stream, err));
                            continue;
                        }
                        tasks.spawn(serve_connection(shared.clone(), accepted));
                    }
                    Err(e) => {
                        error!("IPC accept error: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }
    }

    tasks
}

async fn serve_connection(shared: Arc<Shared>, accepted: Accepted) {
    let Accepted {
        stream,
        credentials,
    } = accepted;

    let peer = match shared.resolver.resolve(credentials).await {
        Ok(peer) => peer,
        Err(e) => {
            warn!("Rejecting connection: {}", e);
            reject(shared.framer, stream, e).await;
            return;
        }
    };

    let guard = match shared.connections.register(peer.clone()) {
        Ok(guard) => guard,
        Err(e) => {
            warn!("Rejecting connection from pid {}: {}", peer.pid, e);
            reject(shared.framer, stream, e).await;
            return;
        }
    };

    info!(
        connection_id = guard.id(),
        peer_pid = peer.pid,
        peer_uid = %peer.user,
        peer_name = peer.process_name.as_deref().unwrap_or("-"),
        "Connection accepted"
    );

    match run_connection(&shared, stream, &guard, peer).await {
        Ok(()) => debug!("Connection {} closed", guard.id()),
        Err(e) => debug!("Connection {} ended: {}", guard.id(), e),
    }

    shared.rate_limit.forget_idle();
}

/// Send one error frame to a peer we won't serve, then close.
async fn reject(framer: Framer, mut stream: BoxedStream, err: IpcError) {
    let response = Response::from_error(&err);
    let farewell = async {
        framer.write_message(&mut stream, &response).await?;
        stream.shutdown().await?;
        Ok::<_, IpcError>(())
    };
    match tokio::time::timeout(REJECT_WRITE_TIMEOUT, farewell).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Could not notify rejected peer: {}", e),
        Err(_) => debug!("Rejected peer did not take the error frame in time"),
    }
}

/// Keeps the connection's in-flight counter honest even if the request task
/// is aborted.
struct InFlight(Arc<ConnectionRecord>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.end_request();
    }
}

async fn run_connection(
    shared: &Arc<Shared>,
    stream: BoxedStream,
    guard: &ConnectionGuard,
    peer: PeerIdentity,
) -> Result<()> {
    let record = guard.record().clone();
    let (read_half, write_half) = tokio::io::split(stream);

    let (frame_tx, mut frame_rx) = mpsc::channel(INBOUND_QUEUE);
    let reader = tokio::spawn(read_frames(shared.framer, read_half, frame_tx));

    let (response_tx, response_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let writer = tokio::spawn(write_responses(shared.framer, write_half, response_rx));

    let mut shutdown_rx = shared.connections.subscribe_shutdown();
    let idle_timeout = shared.config.idle_timeout();
    let mut last_frame = tokio::time::Instant::now();
    let mut in_flight: JoinSet<()> = JoinSet::new();
    let mut reading = !*shutdown_rx.borrow();
    let mut outcome = Ok(());

    while reading || !in_flight.is_empty() {
        // Only an idle connection with nothing in flight times out.
        let idle_deadline = idle_timeout
            .filter(|_| in_flight.is_empty())
            .map(|limit| last_frame + limit);
        let idle = async move {
            match idle_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            frame = frame_rx.recv(), if reading => match frame {
                Some(Ok(payload)) => {
                    last_frame = tokio::time::Instant::now();
                    record.touch();
                    match decode_request(&shared.framer, &payload) {
                        Ok(request) => {
                            record.begin_request();
                            let ctx = RequestContext {
                                peer: peer.clone(),
                                connection: record.clone(),
                            };
                            in_flight.spawn(handle_request(
                                shared.clone(),
                                ctx,
                                request,
                                response_tx.clone(),
                            ));
                        }
                        Err(Rejected::BadRequest(response)) => {
                            let _ = response_tx.send(response).await;
                        }
                        Err(Rejected::Fatal(e)) => {
                            warn!("Closing connection {}: {}", guard.id(), e);
                            let _ = response_tx.send(Response::from_error(&e)).await;
                            in_flight.abort_all();
                            outcome = Err(e);
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    if e.is_protocol_error() {
                        warn!("Closing connection {}: {}", guard.id(), e);
                        let _ = response_tx.send(Response::from_error(&e)).await;
                    }
                    in_flight.abort_all();
                    outcome = Err(e);
                    break;
                }
                None => reading = false,
            },
            changed = shutdown_rx.changed(), if reading => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Connection {} draining for shutdown", guard.id());
                    reading = false;
                }
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            _ = idle, if reading => {
                info!("Closing idle connection {}", guard.id());
                reading = false;
            }
        }
    }

    while in_flight.join_next().await.is_some() {}
    reader.abort();
    drop(response_tx);
    match writer.await {
        Ok(Err(e)) if outcome.is_ok() => outcome = Err(e),
        _ => {}
    }
    outcome
}

enum Rejected {
    /// Answer with this response and keep the connection.
    BadRequest(Response),
    /// Close the connection.
    Fatal(IpcError),
}

/// Parse a frame payload into a request.
///
/// A payload that isn't JSON breaks the framing contract and closes the
/// connection. Valid JSON that isn't a request shape is a `BAD_REQUEST`,
/// echoing `request_id` when one can be found.
fn decode_request(framer: &Framer, payload: &[u8]) -> std::result::Result<Request, Rejected> {
    let value: Value = framer.decode(payload).map_err(Rejected::Fatal)?;
    let request_id = value
        .get("request_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    serde_json::from_value(value).map_err(|e| {
        let err = IpcError::BadRequest {
            message: format!("Invalid request: {}", e),
        };
        Rejected::BadRequest(Response::from_error(&err).with_request_id(request_id))
    })
}

async fn handle_request(
    shared: Arc<Shared>,
    ctx: RequestContext,
    request: Request,
    responses: mpsc::Sender<Response>,
) {
    let _in_flight = InFlight(ctx.connection.clone());
    let started = Instant::now();
    let request_id = request.request_id.clone();

    let mut response = shared.chain.run(&ctx, request, &shared.router).await;
    response.request_id = request_id;
    response.processing_time = Some(started.elapsed().as_secs_f64() * 1000.0);

    if responses.send(response).await.is_err() {
        debug!("Connection closed before response could be sent");
    }
}

async fn read_frames<R>(
    framer: Framer,
    mut reader: R,
    frames: mpsc::Sender<Result<Vec<u8>>>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match framer.read_frame(&mut reader).await {
            Ok(Some(payload)) => {
                if frames.send(Ok(payload)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = frames.send(Err(e)).await;
                break;
            }
        }
    }
}

async fn write_responses<W>(
    framer: Framer,
    mut writer: W,
    mut responses: mpsc::Receiver<Response>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = responses.recv().await {
        let frame = match framer.encode(&response) {
            Ok(frame) => frame,
            Err(e @ IpcError::FrameTooLarge { .. }) => {
                warn!("Response too large to send: {}", e);
                framer.encode(
                    &Response::from_error(&e).with_request_id(response.request_id.clone()),
                )?
            }
            Err(e) => return Err(e),
        };
        writer.write_all(&frame).await?;
        writer.flush().await?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}
