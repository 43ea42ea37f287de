//! Outbound request construction.

use anyhow::{Context, Result, anyhow};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use rama::http::{
    Body, Request, Response,
    header::{self, HeaderMap, HeaderName, HeaderValue},
};

use crate::credentials::{BearerToken, ResolvedBackend};
use crate::upstream::Transport;

/// Username paired with the bearer token in backend Basic auth.
const BACKEND_USERNAME: &str = "aws";

/// Dispatches the inbound request to the backend. The inbound body is streamed
/// through untouched.
pub async fn forward(
    transport: &dyn Transport,
    req: Request<Body>,
    backend: &ResolvedBackend,
    target: &str,
) -> Result<Response<Body>> {
    let outbound = build_request(req, backend, target)?;
    tracing::debug!(
        method = %outbound.method(),
        uri = %outbound.uri(),
        "forwarding request to backend"
    );
    transport.send(outbound).await
}

pub fn build_request(
    req: Request<Body>,
    backend: &ResolvedBackend,
    target: &str,
) -> Result<Request<Body>> {
    let (parts, body) = req.into_parts();
    let uri = backend
        .target
        .join(target)
        .with_context(|| format!("constructing upstream url for {}", backend.target))?;

    let mut builder = Request::builder().method(parts.method).uri(uri);
    {
        let h = builder
            .headers_mut()
            .ok_or_else(|| anyhow!("failed to get headers for request build"))?;
        copy_request_headers(&parts.headers, h);
        h.insert(
            header::HOST,
            HeaderValue::from_str(backend.target.authority())
                .context("backend authority is not a valid Host header")?,
        );
        h.insert(header::AUTHORIZATION, backend_authorization(&backend.token)?);
    }

    builder.body(body).context("building upstream request")
}

fn backend_authorization(token: &BearerToken) -> Result<HeaderValue> {
    let encoded = B64.encode(format!("{BACKEND_USERNAME}:{}", token.expose()));
    let mut value = HeaderValue::from_str(&format!("Basic {encoded}"))
        .context("encoding backend authorization")?;
    value.set_sensitive(true);
    Ok(value)
}

fn copy_request_headers(source: &HeaderMap, target: &mut HeaderMap) {
    for (name, value) in source.iter() {
        if is_hop_header(name) || name == header::HOST || name == header::AUTHORIZATION {
            continue;
        }
        target.append(name, value.clone());
    }
}

fn is_hop_header(name: &HeaderName) -> bool {
    name == header::CONNECTION
        || name == header::PROXY_AUTHENTICATE
        || name == header::PROXY_AUTHORIZATION
        || name == header::TE
        || name == header::TRAILER
        || name == header::TRANSFER_ENCODING
        || name == header::UPGRADE
        || name.as_str() == "keep-alive"
}
