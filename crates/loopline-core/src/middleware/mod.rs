//! Middleware chain.
//!
//! Each stage sees the request before the router does and may answer it
//! directly (an auth or rate-limit rejection) or pass it on with
//! [`Next::run`]. The chain is built once at startup and shared read-only by
//! every connection task.
//!
//! Default order: [`Authentication`] → [`RateLimit`] → [`RequestLogging`].

mod auth;
mod logging;
mod rate_limit;

pub use auth::{AuthPolicy, Authentication};
pub use logging::RequestLogging;
pub use rate_limit::RateLimit;

use crate::connection::ConnectionRecord;
use crate::peer::PeerIdentity;
use crate::protocol::{Request, Response};
use async_trait::async_trait;
use std::sync::Arc;

/// Per-request context handed to middleware and handlers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub peer: PeerIdentity,
    pub connection: Arc<ConnectionRecord>,
}

/// Terminal stage of the chain (the router, in practice).
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn call(&self, ctx: &RequestContext, request: Request) -> Response;
}

/// A cross-cutting request interceptor.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &RequestContext, request: Request, next: Next<'_>) -> Response;
}

/// The remainder of the chain after the current stage.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: &RequestContext, request: Request) -> Response {
        match self.chain.split_first() {
            Some((stage, rest)) => {
                let next = Next {
                    chain: rest,
                    endpoint: self.endpoint,
                };
                stage.handle(ctx, request, next).await
            }
            None => self.endpoint.call(ctx, request).await,
        }
    }
}

/// Ordered list of middleware stages.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    stages: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage; it runs after every stage already added.
    pub fn push(&mut self, stage: impl Middleware) -> &mut Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Append a stage the caller keeps a handle to.
    pub fn push_shared(&mut self, stage: Arc<dyn Middleware>) -> &mut Self {
        self.stages.push(stage);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Run `request` through every stage and then `endpoint`.
    pub async fn run(
        &self,
        ctx: &RequestContext,
        request: Request,
        endpoint: &dyn Endpoint,
    ) -> Response {
        Next {
            chain: &self.stages,
            endpoint,
        }
        .run(ctx, request)
        .await
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::connection::ConnectionManager;
    use crate::peer::UserId;

    pub(crate) fn context(uid: u32, pid: u32, name: Option<&str>) -> RequestContext {
        let peer = PeerIdentity {
            user: UserId::from_uid(uid),
            pid,
            process_name: name.map(str::to_string),
            executable: None,
        };
        let manager = Arc::new(ConnectionManager::new(8));
        let connection = manager.register(peer.clone()).unwrap().record().clone();
        RequestContext { peer, connection }
    }

    /// Endpoint that answers 200 and counts calls.
    #[derive(Default)]
    pub(crate) struct CountingEndpoint {
        pub(crate) calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Endpoint for CountingEndpoint {
        async fn call(&self, _ctx: &RequestContext, request: Request) -> Response {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Response::ok(serde_json::json!({ "path": request.path }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::sync::Mutex;

    struct Tag {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Middleware for Tag {
        fn name(&self) -> &'static str {
            self.label
        }

        async fn handle(&self, ctx: &RequestContext, request: Request, next: Next<'_>) -> Response {
            self.log.lock().unwrap().push(self.label);
            next.run(ctx, request).await
        }
    }

    struct Reject;

    #[async_trait]
    impl Middleware for Reject {
        fn name(&self) -> &'static str {
            "reject"
        }

        async fn handle(&self, _ctx: &RequestContext, _request: Request, _next: Next<'_>) -> Response {
            Response::from_error(&crate::error::IpcError::Forbidden {
                reason: "test".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::new();
        chain
            .push(Tag {
                label: "first",
                log: log.clone(),
            })
            .push(Tag {
                label: "second",
                log: log.clone(),
            });

        let endpoint = CountingEndpoint::default();
        let ctx = context(1000, 1, None);
        let response = chain.run(&ctx, Request::get("/api/v1/health"), &endpoint).await;

        assert!(response.is_success());
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(chain.names(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_endpoint() {
        let mut chain = MiddlewareChain::new();
        chain.push(Reject);

        let endpoint = CountingEndpoint::default();
        let ctx = context(1000, 1, None);
        let response = chain.run(&ctx, Request::get("/api/v1/health"), &endpoint).await;

        assert_eq!(response.status_code, 403);
        assert_eq!(endpoint.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_chain_reaches_endpoint() {
        let chain = MiddlewareChain::new();
        let endpoint = CountingEndpoint::default();
        let ctx = context(1000, 1, None);
        chain.run(&ctx, Request::get("/api/v1/x"), &endpoint).await;
        assert_eq!(endpoint.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
