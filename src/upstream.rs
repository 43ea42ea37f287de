use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rama::{
    Service,
    http::{Body, Request, Response, client::EasyHttpWebClient, layer::trace::TraceLayer},
    layer::Layer,
};

/// Outbound HTTP transport to the backend registry.
///
/// One attempt per call; failures surface to the caller unchanged.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request<Body>) -> Result<Response<Body>>;
}

/// Rama-based upstream HTTP client.
#[derive(Debug, Clone, Default)]
pub struct UpstreamClient {
    timeout: Option<Duration>,
}

impl UpstreamClient {
    pub fn new(timeout: Option<Duration>) -> Self {
        match timeout {
            Some(timeout) => tracing::info!(
                timeout_secs = timeout.as_secs(),
                "upstream client initialized with request timeout"
            ),
            None => tracing::info!("upstream client initialized without request timeout"),
        }
        Self { timeout }
    }
}

#[async_trait]
impl Transport for UpstreamClient {
    async fn send(&self, request: Request<Body>) -> Result<Response<Body>> {
        let client = (TraceLayer::new_for_http(),).into_layer(EasyHttpWebClient::default());
        let uri = request.uri().clone();

        let response = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, client.serve(request))
                .await
                .map_err(|_| anyhow!("upstream request to {uri} timed out after {limit:?}"))?,
            None => client.serve(request).await,
        };

        response.map_err(|err| anyhow!("upstream request to {uri} failed: {err}"))
    }
}
