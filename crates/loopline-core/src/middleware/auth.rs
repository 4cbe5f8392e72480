//! Same-user trust plus process allow-list.

use super::{Middleware, Next, RequestContext};
use crate::config::AuthConfig;
use crate::error::{IpcError, Result};
use crate::peer::{PeerIdentity, UserId};
use crate::protocol::{Request, Response};
use async_trait::async_trait;
use regex::Regex;
use tracing::warn;

/// Which peers may talk to the server.
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    server_user: UserId,
    require_same_user: bool,
    allowed_processes: Vec<Regex>,
}

impl AuthPolicy {
    /// Compile the allow-list. An invalid pattern is a configuration error.
    pub fn from_config(config: &AuthConfig, server_user: UserId) -> Result<Self> {
        let allowed_processes = config
            .allowed_processes
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| IpcError::Config {
                    message: format!("Invalid allowed_processes pattern {:?}: {}", pattern, e),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            server_user,
            require_same_user: config.require_same_user,
            allowed_processes,
        })
    }

    pub fn server_user(&self) -> &UserId {
        &self.server_user
    }

    /// Decide whether `peer` may make requests.
    ///
    /// A peer under another user, or a process the allow-list doesn't
    /// recognize, is `FORBIDDEN`.
    pub fn check(&self, peer: &PeerIdentity) -> Result<()> {
        if self.require_same_user && peer.user != self.server_user {
            return Err(IpcError::Forbidden {
                reason: format!("peer user {} does not match server user", peer.user),
            });
        }

        if self.allowed_processes.is_empty() {
            return Ok(());
        }

        let executable = peer
            .executable
            .as_ref()
            .map(|path| path.to_string_lossy().into_owned());
        let candidates = peer.process_name.iter().chain(executable.iter());

        for candidate in candidates {
            if self.allowed_processes.iter().any(|re| re.is_match(candidate)) {
                return Ok(());
            }
        }

        Err(IpcError::Forbidden {
            reason: match &peer.process_name {
                Some(name) => format!("process {:?} is not on the allow-list", name),
                None => format!("process {} could not be identified", peer.pid),
            },
        })
    }
}

/// First stage of the chain.
#[derive(Debug)]
pub struct Authentication {
    policy: AuthPolicy,
}

impl Authentication {
    pub fn new(policy: AuthPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Middleware for Authentication {
    fn name(&self) -> &'static str {
        "authentication"
    }

    async fn handle(&self, ctx: &RequestContext, request: Request, next: Next<'_>) -> Response {
        if let Err(e) = self.policy.check(&ctx.peer) {
            warn!(
                peer_pid = ctx.peer.pid,
                peer_uid = %ctx.peer.user,
                path = %request.path,
                "Rejected request: {}",
                e
            );
            return Response::from_error(&e);
        }
        next.run(ctx, request).await
    }
}
