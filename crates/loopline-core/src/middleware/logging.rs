//! One structured event per request. Payloads are never logged.

use super::{Middleware, Next, RequestContext};
use crate::protocol::{Request, Response};
use async_trait::async_trait;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct RequestLogging;

#[async_trait]
impl Middleware for RequestLogging {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn handle(&self, ctx: &RequestContext, request: Request, next: Next<'_>) -> Response {
        let started = Instant::now();
        let method = request.method;
        let path = request.path.clone();
        let request_id = request.request_id.clone();

        let response = next.run(ctx, request).await;

        let latency_us = started.elapsed().as_micros() as u64;
        let peer_name = ctx.peer.process_name.as_deref().unwrap_or("-");
        if response.status_code >= 400 {
            warn!(
                %method,
                %path,
                request_id = request_id.as_deref().unwrap_or("-"),
                peer_uid = %ctx.peer.user,
                peer_pid = ctx.peer.pid,
                peer_name,
                status = response.status_code,
                latency_us,
                "request failed"
            );
        } else {
            info!(
                %method,
                %path,
                request_id = request_id.as_deref().unwrap_or("-"),
                peer_uid = %ctx.peer.user,
                peer_pid = ctx.peer.pid,
                peer_name,
                status = response.status_code,
                latency_us,
                "request handled"
            );
        }
        response
    }
}
