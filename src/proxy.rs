mod forward;
mod gate;
mod handlers;
mod response;
mod rewrite;
mod types;


use std::sync::Arc;

use rama::{
    Service,
    error::BoxError,
    http::{Body, Method, Request, Response, StatusCode},
};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    config::Config, credentials::CredentialCache, routing::RoutingTable, upstream::Transport,
};

pub use forward::build_request;
pub use gate::FrontDoor;
pub use rewrite::Rewriter;
pub use types::{RequestContext, RewriteOutcome, TargetError, UpstreamTarget};

/// Terminal failures of the per-request pipeline, each with its own status.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("authentication required")]
    Unauthorized,
    #[error("method {0} is not proxied")]
    MethodNotAllowed(Method),
    #[error("no repository configured for host '{0}'")]
    UnknownHost(String),
    #[error("no backend credentials cached for host '{0}'")]
    MissingCredentials(String),
    #[error("forwarding to backend failed: {0:#}")]
    Forward(anyhow::Error),
    #[error("rewriting backend response failed: {0:#}")]
    Rewrite(anyhow::Error),
    #[error("internal error: {0:#}")]
    Internal(anyhow::Error),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::UnknownHost(_) => StatusCode::NOT_FOUND,
            Self::MissingCredentials(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Forward(_) => StatusCode::BAD_GATEWAY,
            Self::Rewrite(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn outcome(&self) -> RewriteOutcome {
        match self {
            Self::Forward(_) | Self::Rewrite(_) | Self::Internal(_) => RewriteOutcome::Error,
            _ => RewriteOutcome::Local,
        }
    }

    pub fn into_response(self) -> Response<Body> {
        let status = self.status();
        match self {
            Self::Unauthorized => response::respond_unauthorized(),
            Self::MethodNotAllowed(_) => response::respond_text(status, "method not allowed"),
            Self::UnknownHost(_) => response::respond_text(status, "unknown host"),
            Self::MissingCredentials(_) => {
                response::respond_text(status, "backend credentials unavailable")
            }
            Self::Forward(_) => response::respond_text(status, "upstream error"),
            Self::Rewrite(_) | Self::Internal(_) => {
                response::respond_text(status, "internal proxy error")
            }
        }
    }
}

/// Main proxy service
#[derive(Clone)]
pub struct CaProxy {
    routes: Arc<RoutingTable>,
    cache: Arc<CredentialCache>,
    transport: Arc<dyn Transport>,
    rewriter: Arc<Rewriter>,
    front_door: Arc<FrontDoor>,
    health_check_path: Arc<str>,
}

impl CaProxy {
    pub fn new(
        config: &Config,
        routes: Arc<RoutingTable>,
        cache: Arc<CredentialCache>,
        transport: Arc<dyn Transport>,
        front_door: FrontDoor,
    ) -> Self {
        Self {
            routes,
            cache,
            transport,
            rewriter: Arc::new(Rewriter::new(&config.upstream)),
            front_door: Arc::new(front_door),
            health_check_path: Arc::from(config.server.health_check_path.as_str()),
        }
    }

    async fn handle(
        &self,
        req: Request<Body>,
        ctx: &mut RequestContext,
    ) -> Result<Response<Body>, ProxyError> {
        if ctx.method == Method::GET && ctx.path() == &*self.health_check_path {
            ctx.outcome = RewriteOutcome::Local;
            return handlers::handle_health(&self.cache).map_err(ProxyError::Internal);
        }

        if !self.front_door.authorize(req.headers()) {
            return Err(ProxyError::Unauthorized);
        }

        if ctx.method == Method::CONNECT || ctx.method == Method::TRACE {
            return Err(ProxyError::MethodNotAllowed(ctx.method.clone()));
        }

        let descriptor = self
            .routes
            .resolve(&ctx.host)
            .ok_or_else(|| ProxyError::UnknownHost(ctx.host.clone()))?;

        let backend = self
            .cache
            .resolve(&ctx.host, &descriptor.domain)
            .ok_or_else(|| ProxyError::MissingCredentials(ctx.host.clone()))?;

        let response = forward::forward(self.transport.as_ref(), req, &backend, &ctx.target)
            .await
            .map_err(ProxyError::Forward)?;

        self.rewriter
            .apply(response, ctx, &backend.target)
            .await
            .map_err(ProxyError::Rewrite)
    }
}

impl Service<Request<Body>> for CaProxy {
    type Output = Response<Body>;
    type Error = BoxError;

    async fn serve(&self, req: Request<Body>) -> Result<Self::Output, Self::Error> {
        let mut ctx = RequestContext::from_request(&req);

        let response = match self.handle(req, &mut ctx).await {
            Ok(resp) => resp,
            Err(err) => {
                ctx.outcome = err.outcome();
                if err.outcome() == RewriteOutcome::Error {
                    warn!(
                        method = %ctx.method,
                        host = %ctx.host,
                        path = %ctx.path(),
                        error = %err,
                        "request failed"
                    );
                }
                err.into_response()
            }
        };

        info!(
            method = %ctx.method,
            host = %ctx.host,
            path = %ctx.path(),
            response_code = response.status().as_u16(),
            duration_ms = ctx.start.elapsed().as_millis(),
            outcome = %ctx.outcome,
            "request handled"
        );

        Ok(response)
    }
}
