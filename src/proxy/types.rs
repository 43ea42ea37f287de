use std::time::Instant;

use anyhow::{Context, Result};
use rama::http::{Body, Method, Request, Uri, header};
use thiserror::Error;

/// What the response rewriter did to a response, for request logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteOutcome {
    Pass,
    Redirect,
    Body,
    Local,
    Error,
}

impl std::fmt::Display for RewriteOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RewriteOutcome::Pass => write!(f, "pass"),
            RewriteOutcome::Redirect => write!(f, "redirect"),
            RewriteOutcome::Body => write!(f, "body"),
            RewriteOutcome::Local => write!(f, "local"),
            RewriteOutcome::Error => write!(f, "error"),
        }
    }
}

/// Per-request state captured on entry and consumed by the response rewriter.
///
/// Owned by a single request's call chain; never shared between requests.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub start: Instant,
    pub method: Method,
    /// Public scheme the client used (`http` unless `X-Forwarded-Proto: https`).
    pub scheme: &'static str,
    /// Inbound `Host` exactly as sent, port included.
    pub host: String,
    /// Inbound request-target (path and query).
    pub target: String,
    pub user_agent: Option<String>,
    pub outcome: RewriteOutcome,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            start: Instant::now(),
            method: Method::GET,
            scheme: "http",
            host: String::new(),
            target: "/".to_string(),
            user_agent: None,
            outcome: RewriteOutcome::Pass,
        }
    }
}

impl RequestContext {
    pub fn from_request(req: &Request<Body>) -> Self {
        let headers = req.headers();

        let scheme = match headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
        {
            Some(proto) if proto.trim().eq_ignore_ascii_case("https") => "https",
            _ => "http",
        };

        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
            .unwrap_or_default();

        let target = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Self {
            start: Instant::now(),
            method: req.method().clone(),
            scheme,
            host,
            target,
            user_agent,
            outcome: RewriteOutcome::Pass,
        }
    }

    /// `scheme://host/`, the prefix rewritten bodies point at.
    pub fn public_origin(&self) -> String {
        format!("{}://{}/", self.scheme, self.host)
    }

    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or("/")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("backend url {0} does not use https")]
    NotHttps(String),
    #[error("backend url {url} is invalid: {reason}")]
    Invalid { url: String, reason: String },
}

/// A resolved backend base URL: an HTTPS origin plus a path prefix without a trailing `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    base: Uri,
}

impl UpstreamTarget {
    pub fn parse(raw: &str) -> Result<Self, TargetError> {
        let invalid = |reason: &str| TargetError::Invalid {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let uri: Uri = raw.trim().parse().map_err(|_| invalid("not a valid URI"))?;
        match uri.scheme_str() {
            Some("https") => {}
            Some(_) => return Err(TargetError::NotHttps(raw.to_string())),
            None => return Err(invalid("missing scheme")),
        }
        if uri.host().is_none_or(str::is_empty) {
            return Err(invalid("missing host"));
        }
        if uri.query().is_some() {
            return Err(invalid("unexpected query string"));
        }

        let base_path = uri.path().trim_end_matches('/').to_string();
        let mut parts = uri.into_parts();
        parts.path_and_query = Some(
            if base_path.is_empty() { "/" } else { base_path.as_str() }
                .parse()
                .map_err(|_| invalid("invalid path"))?,
        );
        let base = Uri::from_parts(parts).map_err(|_| invalid("cannot rebuild URI"))?;
        Ok(Self { base })
    }

    /// Backend hostname, without port.
    pub fn host(&self) -> &str {
        self.base.host().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.base.port_u16().unwrap_or(443)
    }

    /// `host[:port]` as it must appear in the outbound `Host` header.
    pub fn authority(&self) -> &str {
        self.base.authority().map(|a| a.as_str()).unwrap_or_default()
    }

    /// Path prefix of the repository (`/pypi/libs`), empty for a bare origin.
    pub fn base_path(&self) -> &str {
        self.base.path().trim_end_matches('/')
    }

    /// Joins an inbound request-target onto the base; a leading `/` is stripped exactly once.
    pub fn join(&self, path_and_query: &str) -> Result<Uri> {
        let relative = path_and_query.strip_prefix('/').unwrap_or(path_and_query);
        let full_path = format!("{}/{}", self.base_path(), relative);

        let mut parts = self.base.clone().into_parts();
        parts.path_and_query = Some(
            full_path
                .parse()
                .with_context(|| format!("parse combined path '{full_path}'"))?,
        );

        Uri::from_parts(parts).with_context(|| format!("joining upstream path {path_and_query}"))
    }
}

impl std::fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = self.base.scheme_str().unwrap_or("https");
        write!(f, "{scheme}://{}{}", self.authority(), self.base_path())
    }
}
