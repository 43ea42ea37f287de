//! Response rewriting: redirect targets and package-manager metadata bodies.
//!
//! Rewrites only touch URLs on the backend host contacted for this request,
//! so one tenant's origin never leaks into another tenant's responses.

use std::io::Read;

use anyhow::{Context, Result, anyhow};
use flate2::read::GzDecoder;
use rama::http::{
    Body, HeaderMap, Method, Response, StatusCode,
    body::util::BodyExt,
    header::{self, HeaderValue},
};
use url::Url;

use super::types::{RequestContext, RewriteOutcome, UpstreamTarget};
use crate::config::UpstreamConfig;

/// Decides which responses are rewritten and performs the rewrite.
#[derive(Debug, Clone)]
pub struct Rewriter {
    user_agents: Vec<String>,
    content_types: Vec<String>,
    max_decoded_bytes: u64,
}

impl Rewriter {
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            user_agents: config.rewrite_user_agents.clone(),
            content_types: config.rewrite_content_types.clone(),
            max_decoded_bytes: config.max_decoded_body_bytes,
        }
    }

    /// The rewrite gate: a known package-manager client asking for a JSON index document.
    pub fn wants_body_rewrite(&self, ctx: &RequestContext, headers: &HeaderMap) -> bool {
        let Some(user_agent) = ctx.user_agent.as_deref() else {
            return false;
        };
        if !self.user_agents.iter().any(|p| user_agent.starts_with(p.as_str())) {
            return false;
        }

        headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| self.content_types.iter().any(|t| ct.contains(t.as_str())))
    }

    pub async fn apply(
        &self,
        response: Response<Body>,
        ctx: &mut RequestContext,
        target: &UpstreamTarget,
    ) -> Result<Response<Body>> {
        let (mut parts, body) = response.into_parts();

        if matches!(parts.status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND)
            && rewrite_location(&mut parts.headers, ctx, target)?
        {
            ctx.outcome = RewriteOutcome::Redirect;
        }

        if !has_body(&ctx.method, parts.status) || !self.wants_body_rewrite(ctx, &parts.headers)
        {
            return Ok(Response::from_parts(parts, body));
        }

        let gzip = match content_encoding(&parts.headers) {
            None => false,
            Some(enc) if enc.eq_ignore_ascii_case("gzip") => true,
            Some(enc) => {
                tracing::debug!(encoding = %enc, "unsupported content encoding, body left as is");
                return Ok(Response::from_parts(parts, body));
            }
        };

        let raw = body
            .collect()
            .await
            .context("reading backend response body")?
            .to_bytes();

        let decoded = if gzip {
            let decoded = gunzip_limited(&raw, self.max_decoded_bytes)?;
            parts.headers.remove(header::CONTENT_ENCODING);
            decoded
        } else {
            raw.to_vec()
        };

        let (rewritten, replaced) =
            replace_backend_origin(&decoded, target, ctx.public_origin().as_bytes());

        parts.headers.remove(header::TRANSFER_ENCODING);
        parts
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
        ctx.outcome = RewriteOutcome::Body;

        tracing::debug!(replaced, bytes = rewritten.len(), "rewrote metadata body");
        Ok(Response::from_parts(parts, Body::from(rewritten)))
    }
}

/// HEAD answers and 1xx/204/304 statuses carry no payload; their
/// `Content-Length` is passed through as sent by the backend.
fn has_body(method: &Method, status: StatusCode) -> bool {
    *method != Method::HEAD
        && !status.is_informational()
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::NOT_MODIFIED
}

fn gunzip_limited(raw: &[u8], limit: u64) -> Result<Vec<u8>> {
    let mut decoded = Vec::new();
    GzDecoder::new(raw)
        .take(limit.saturating_add(1))
        .read_to_end(&mut decoded)
        .context("decoding gzip response body")?;
    if decoded.len() as u64 > limit {
        return Err(anyhow!("decoded response body exceeds {limit} bytes"));
    }
    Ok(decoded)
}

fn content_encoding(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("identity"))
        .map(str::to_string)
}

/// Points a backend-host `Location` back at the public origin.
///
/// Returns whether the header changed. Relative locations and other hosts are
/// left byte-identical.
fn rewrite_location(
    headers: &mut HeaderMap,
    ctx: &RequestContext,
    target: &UpstreamTarget,
) -> Result<bool> {
    let Some(value) = headers.get(header::LOCATION) else {
        return Ok(false);
    };
    let raw = value
        .to_str()
        .map_err(|_| anyhow!("redirect location is not valid ASCII"))?;

    let location = match Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => return Ok(false),
        Err(err) => return Err(anyhow!("malformed redirect location {raw}: {err}")),
    };

    let same_host = location
        .host_str()
        .is_some_and(|h| h.eq_ignore_ascii_case(target.host()))
        && location.port_or_known_default() == Some(target.port());
    if !same_host {
        return Ok(false);
    }

    let path = strip_base_path(location.path(), target.base_path());
    let mut public = format!("{}://{}{}", ctx.scheme, ctx.host, path);
    if let Some(query) = location.query() {
        public.push('?');
        public.push_str(query);
    }
    if let Some(fragment) = location.fragment() {
        public.push('#');
        public.push_str(fragment);
    }

    let value = HeaderValue::from_str(&public)
        .with_context(|| format!("rewritten location {public} is not a valid header"))?;
    headers.insert(header::LOCATION, value);
    Ok(true)
}

fn strip_base_path<'a>(path: &'a str, base_path: &str) -> &'a str {
    if base_path.is_empty() {
        return path;
    }
    match path.strip_prefix(base_path) {
        Some("") => "/",
        Some(rest) if rest.starts_with('/') => rest,
        _ => path,
    }
}

/// Replaces `https://<backend>[:443]<base>/` with the public origin; returns the
/// new body and the number of replacements.
fn replace_backend_origin(
    body: &[u8],
    target: &UpstreamTarget,
    public_origin: &[u8],
) -> (Vec<u8>, usize) {
    let with_port = format!(
        "https://{}:{}{}/",
        target.host(),
        target.port(),
        target.base_path()
    );
    let bare = format!("https://{}{}/", target.host(), target.base_path());

    let (body, a) = replace_all(body, with_port.as_bytes(), public_origin);
    let (body, b) = replace_all(&body, bare.as_bytes(), public_origin);
    (body, a + b)
}

fn replace_all(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> (Vec<u8>, usize) {
    let mut out = Vec::with_capacity(haystack.len());
    let mut count = 0;
    let mut rest = haystack;

    while let Some(pos) = find(rest, needle) {
        out.extend_from_slice(&rest[..pos]);
        out.extend_from_slice(replacement);
        rest = &rest[pos + needle.len()..];
        count += 1;
    }
    out.extend_from_slice(rest);
    (out, count)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BACKEND: &str = "acme-111111111111.d.codeartifact.eu-west-1.amazonaws.com";

    fn target() -> UpstreamTarget {
        UpstreamTarget::parse(&format!("https://{BACKEND}/npm/js/")).unwrap()
    }

    fn ctx(user_agent: Option<&str>) -> RequestContext {
        RequestContext {
            host: "npm.example.com".to_string(),
            user_agent: user_agent.map(str::to_string),
            ..RequestContext::default()
        }
    }

    fn location_headers(location: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_str(location).unwrap());
        headers
    }

    #[test]
    fn redirect_on_backend_host_is_rewritten() {
        let mut headers =
            location_headers(&format!("https://{BACKEND}/npm/js/lodash/-/lodash-4.17.21.tgz?sig=1"));
        assert!(rewrite_location(&mut headers, &ctx(None), &target()).unwrap());
        assert_eq!(
            headers.get(header::LOCATION).unwrap(),
            "http://npm.example.com/lodash/-/lodash-4.17.21.tgz?sig=1"
        );
    }

    #[test]
    fn redirect_keeps_public_port_and_scheme() {
        let mut context = ctx(None);
        context.host = "npm.example.com:5000".to_string();
        context.scheme = "https";
        let mut headers = location_headers(&format!("https://{BACKEND}:443/npm/js/"));
        assert!(rewrite_location(&mut headers, &context, &target()).unwrap());
        assert_eq!(
            headers.get(header::LOCATION).unwrap(),
            "https://npm.example.com:5000/"
        );
    }

    #[test]
    fn redirect_to_other_host_is_untouched() {
        let original = "https://assets-bucket.s3.amazonaws.com/blob?X-Amz-Signature=abc%2Fdef";
        let mut headers = location_headers(original);
        assert!(!rewrite_location(&mut headers, &ctx(None), &target()).unwrap());
        assert_eq!(headers.get(header::LOCATION).unwrap().as_bytes(), original.as_bytes());
    }

    #[test]
    fn relative_redirect_is_untouched() {
        let mut headers = location_headers("/npm/js/lodash");
        assert!(!rewrite_location(&mut headers, &ctx(None), &target()).unwrap());
        assert_eq!(headers.get(header::LOCATION).unwrap(), "/npm/js/lodash");
    }

    #[test]
    fn malformed_redirect_is_an_error() {
        let mut headers = location_headers("https://[::1");
        assert!(rewrite_location(&mut headers, &ctx(None), &target()).is_err());
    }

    #[test]
    fn base_path_is_only_stripped_on_segment_boundary() {
        assert_eq!(strip_base_path("/npm/js/x", "/npm/js"), "/x");
        assert_eq!(strip_base_path("/npm/js", "/npm/js"), "/");
        assert_eq!(strip_base_path("/npm/jsx/x", "/npm/js"), "/npm/jsx/x");
        assert_eq!(strip_base_path("/other", ""), "/other");
    }

    #[test]
    fn gate_requires_known_client_and_json() {
        let rewriter = Rewriter::new(&UpstreamConfig::default());
        let mut json = HeaderMap::new();
        json.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        let mut install = HeaderMap::new();
        install.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/vnd.npm.install-v1+json"),
        );
        let mut tarball = HeaderMap::new();
        tarball.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );

        assert!(rewriter.wants_body_rewrite(&ctx(Some("npm/10.0 node/v20")), &json));
        assert!(rewriter.wants_body_rewrite(&ctx(Some("yarn/1.22")), &install));
        assert!(rewriter.wants_body_rewrite(&ctx(Some("Bun/1.1")), &json));
        assert!(!rewriter.wants_body_rewrite(&ctx(Some("pip/23.0")), &json));
        assert!(!rewriter.wants_body_rewrite(&ctx(None), &json));
        assert!(!rewriter.wants_body_rewrite(&ctx(Some("npm/10.0")), &tarball));
        assert!(!rewriter.wants_body_rewrite(&ctx(Some("npm/10.0")), &HeaderMap::new()));
    }

    #[test]
    fn bodiless_responses_are_not_rewritten() {
        assert!(has_body(&Method::GET, StatusCode::OK));
        assert!(!has_body(&Method::HEAD, StatusCode::OK));
        assert!(!has_body(&Method::GET, StatusCode::NOT_MODIFIED));
        assert!(!has_body(&Method::GET, StatusCode::NO_CONTENT));
        assert!(!has_body(&Method::GET, StatusCode::CONTINUE));
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        use flate2::{Compression, write::GzEncoder};
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn gunzip_stops_at_the_decoded_limit() {
        let inflated = vec![b'a'; 64 * 1024];
        let compressed = gzip(&inflated);
        assert!(compressed.len() < 1024);

        let err = gunzip_limited(&compressed, 4096).unwrap_err();
        assert!(err.to_string().contains("exceeds 4096 bytes"));

        assert_eq!(gunzip_limited(&compressed, 64 * 1024).unwrap(), inflated);
    }

    #[test]
    fn replaces_both_port_forms() {
        let body = format!(
            r#"{{"a":"https://{BACKEND}:443/npm/js/a.tgz","b":"https://{BACKEND}/npm/js/b.tgz","c":"https://{BACKEND}/npm/other/c.tgz"}}"#
        );
        let (out, count) =
            replace_backend_origin(body.as_bytes(), &target(), b"http://npm.example.com/");
        let out = String::from_utf8(out).unwrap();
        assert_eq!(count, 2);
        assert!(out.contains(r#""a":"http://npm.example.com/a.tgz""#));
        assert!(out.contains(r#""b":"http://npm.example.com/b.tgz""#));
        // a sibling repository on the same backend host is not ours to rewrite
        assert!(out.contains(&format!("https://{BACKEND}/npm/other/c.tgz")));
    }

    #[test]
    fn replace_all_counts_and_handles_edges() {
        assert_eq!(replace_all(b"aXbXc", b"X", b"--"), (b"a--b--c".to_vec(), 2));
        assert_eq!(replace_all(b"abc", b"", b"z"), (b"abc".to_vec(), 0));
        assert_eq!(replace_all(b"ab", b"abc", b"z"), (b"ab".to_vec(), 0));
    }
}
