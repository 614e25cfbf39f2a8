//! Translation between HTTP and worker envelopes.

use std::sync::Arc;

use axum::{
    Extension,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header},
    response::Response,
};
use tracing::debug;

use super::AppState;
use super::error::GatewayError;
use super::middleware::RequestId;
use crate::version;
use crate::worker::{RequestEnvelope, ResponseEnvelope};

/// Canonical header name used in envelopes for the correlation ID.
const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Catch-all handler: relay the request to a worker and render its response.
pub async fn relay(
    State(state): State<Arc<AppState>>,
    request_id: Option<Extension<RequestId>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let mut envelope = to_envelope(&method, &uri, &headers, body);
    if let Some(Extension(RequestId(id))) = request_id {
        envelope
            .headers
            .entry(REQUEST_ID_HEADER.to_string())
            .or_insert(id);
    }

    let response = state.dispatcher.handle_request(&envelope).await?;
    Ok(render(response))
}

/// Build a request envelope. Only the first value of a repeated header is kept.
pub fn to_envelope(method: &Method, uri: &Uri, headers: &HeaderMap, body: Bytes) -> RequestEnvelope {
    let url = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut envelope = RequestEnvelope::new(method.as_str(), url).with_body(body.to_vec());
    for (name, value) in headers {
        envelope
            .headers
            .entry(canonical_header_name(name.as_str()))
            .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    envelope
}

/// `content-type` -> `Content-Type`.
pub fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Turn a worker response into an HTTP response.
///
/// Headers that are not valid HTTP are skipped. A missing body becomes the
/// diagnostic placeholder.
pub fn render(envelope: ResponseEnvelope) -> Response {
    let status = StatusCode::from_u16(envelope.status()).unwrap_or(StatusCode::OK);

    let mut headers = HeaderMap::with_capacity(envelope.headers.len() + 1);
    for (name, value) in &envelope.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => debug!(header = %name, "Skipping invalid response header from worker"),
        }
    }
    if !headers.contains_key(header::SERVER) {
        headers.insert(header::SERVER, HeaderValue::from_static(version::server_name()));
    }

    let mut response = Response::new(Body::from(envelope.into_body()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
