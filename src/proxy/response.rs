use anyhow::Result;
use rama::http::{Body, Response, StatusCode, header};

/// Responds with JSON content
pub fn respond_json(status: StatusCode, body: &str) -> Result<Response<Body>> {
    Response::builder()
        .status(status)
        .header(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json; charset=utf-8"),
        )
        .header(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static("no-store"),
        )
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body.to_owned()))
        .map_err(Into::into)
}

/// Responds with plain text. Infallible: only static headers are set.
pub fn respond_text(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, header::HeaderValue::from(body.len()));
    response
}

/// 401 challenge for the front-door gate
pub fn respond_unauthorized() -> Response<Body> {
    let mut response = respond_text(StatusCode::UNAUTHORIZED, "unauthorized");
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        header::HeaderValue::from_static("Basic realm=\"Restricted\""),
    );
    response
}
