//! Loopline Core - local IPC for a desktop backend daemon.
//!
//! This crate replaces a localhost HTTP API with an authenticated local
//! channel: Unix domain sockets on Linux and macOS, named pipes on Windows.
//! Messages are length-prefixed JSON frames carrying HTTP-like requests and
//! responses, so handlers keep their familiar `GET /api/v1/...` shape.
//!
//! The server side is [`IpcServer`]: it binds the per-user endpoint,
//! publishes a discovery file, resolves each peer's identity, and runs every
//! request through a [`MiddlewareChain`] (authentication, rate limiting,
//! logging) before the [`Router`] dispatches it. The client side is
//! [`IpcClient`], with [`ClientPool`] for reconnection and retries.
//!
//! # Example
//!
//! ```rust,ignore
//! use loopline_core::{IpcClient, IpcServer, Response, Router, ServerConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> loopline_core::Result<()> {
//!     let mut router = Router::new();
//!     router.get("/api/v1/health", |_req, _params| async {
//!         Ok(Response::ok(json!({ "status": "healthy" })))
//!     })?;
//!
//!     let server = IpcServer::builder(ServerConfig::default())
//!         .router(router)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let client = IpcClient::connect(server.address()).await?;
//!     let health = client.get("/api/v1/health").await?;
//!     println!("{}", health);
//!
//!     server.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod middleware;
pub mod peer;
pub mod platform;
pub mod protocol;
pub mod router;
pub mod server;
pub mod transport;

// Re-export commonly used types
pub use client::{ClientPool, IpcClient, RetryConfig};
pub use config::{AuthConfig, ClientConfig, ProtocolConfig, RateLimitConfig, ServerConfig};
pub use connection::{ConnectionId, ConnectionManager, ConnectionSnapshot, ConnectionState};
pub use discovery::DiscoveryInfo;
pub use error::{ErrorCode, ErrorType, IpcError, Result};
pub use middleware::{Middleware, MiddlewareChain, Next, RequestContext};
pub use peer::{PeerIdentity, UserId};
pub use protocol::{ErrorBody, Framer, Method, Request, Response};
pub use router::{DataShape, FieldType, HandlerError, HandlerResult, PathParams, Router};
pub use server::{IpcServer, IpcServerBuilder, IpcServerHandle, ShutdownReport};
pub use transport::{Address, TransportKind};
