//! Envelope protocol spoken with worker processes.
//!
//! Messages are JSON objects, one per line (newline-delimited JSON). JSON string
//! escaping guarantees that an encoded envelope never contains a raw `\n`, so the
//! newline is an unambiguous frame delimiter regardless of what the body holds.
//!
//! Bodies that are valid UTF-8 travel as plain JSON strings. Anything else is
//! base64-encoded and flagged with `"body_encoding": "base64"`; workers may use
//! the same flag on responses.

use std::borrow::Cow;
use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Body rendered when a worker response carries no usable `body` field.
pub const INVALID_BODY_PLACEHOLDER: &str = "Invalid response body from worker";

/// Status used when a worker response carries no usable `status` field.
pub const DEFAULT_STATUS: u16 = 200;

const BASE64_ENCODING: &str = "base64";

/// Failure to decode an envelope line.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("invalid base64 body: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("unsupported body encoding '{0}'")]
    UnsupportedEncoding(String),
}

/// Request sent from the gateway to a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestEnvelope {
    /// HTTP method (e.g. "GET").
    pub method: String,
    /// Raw request target: path plus query string.
    pub url: String,
    /// Request headers, one value per name.
    pub headers: BTreeMap<String, String>,
    /// Fully buffered request body.
    pub body: Vec<u8>,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    method: &'a str,
    url: &'a str,
    headers: &'a BTreeMap<String, String>,
    body: Cow<'a, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body_encoding: Option<&'static str>,
}

impl RequestEnvelope {
    /// Create an envelope with an empty header map and body.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set a header, replacing any previous value for the same name.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Replace the body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Serialize to a JSON line (with trailing newline).
    pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let (body, body_encoding) = encode_body(&self.body);
        let wire = WireRequest {
            method: &self.method,
            url: &self.url,
            headers: &self.headers,
            body,
            body_encoding,
        };
        let mut line = serde_json::to_vec(&wire)?;
        line.push(b'\n');
        Ok(line)
    }

    /// Deserialize from a JSON line.
    ///
    /// This is the worker's side of the exchange; the host only encodes
    /// requests. Kept public for tests and the protocol benchmarks.
    pub fn from_line(line: &[u8]) -> Result<Self, DecodeError> {
        let map = parse_object(line)?;
        let text = |key: &str| {
            map.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Ok(Self {
            method: text("method"),
            url: text("url"),
            headers: string_headers(map.get("headers")),
            body: decode_body(&map)?.unwrap_or_default(),
        })
    }
}

/// Response returned by a worker.
///
/// `status` and `body` stay optional so that "the worker did not say" remains
/// distinguishable from an explicit value; [`status`](Self::status) and
/// [`body`](Self::body) apply the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseEnvelope {
    /// Status code, if the worker sent a valid one.
    pub status: Option<u16>,
    /// Response headers. Non-string values sent by the worker are dropped.
    pub headers: BTreeMap<String, String>,
    /// Response body, if the worker sent one.
    pub body: Option<Vec<u8>>,
}

impl ResponseEnvelope {
    /// Status code to render, defaulting to 200.
    pub fn status(&self) -> u16 {
        self.status.unwrap_or(DEFAULT_STATUS)
    }

    /// Body to render, defaulting to a diagnostic placeholder.
    pub fn body(&self) -> &[u8] {
        self.body
            .as_deref()
            .unwrap_or(INVALID_BODY_PLACEHOLDER.as_bytes())
    }

    /// Consume the envelope, returning the body to render.
    pub fn into_body(self) -> Vec<u8> {
        self.body
            .unwrap_or_else(|| INVALID_BODY_PLACEHOLDER.as_bytes().to_vec())
    }

    /// Deserialize from a JSON line.
    ///
    /// Unknown fields are ignored, so a worker that echoes the request line back
    /// verbatim produces a valid response.
    pub fn from_line(line: &[u8]) -> Result<Self, DecodeError> {
        let map = parse_object(line)?;
        Ok(Self {
            status: parse_status(map.get("status")),
            headers: string_headers(map.get("headers")),
            body: decode_body(&map)?,
        })
    }

    /// Serialize to a JSON line (with trailing newline).
    ///
    /// This is the worker's side of the exchange; the host only decodes
    /// responses. Kept public for tests and the protocol benchmarks.
    pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut map = Map::new();
        if let Some(status) = self.status {
            map.insert("status".into(), Value::from(status));
        }
        map.insert("headers".into(), serde_json::to_value(&self.headers)?);
        if let Some(body) = &self.body {
            let (text, encoding) = encode_body(body);
            map.insert("body".into(), Value::String(text.into_owned()));
            if let Some(encoding) = encoding {
                map.insert("body_encoding".into(), Value::from(encoding));
            }
        }
        let mut line = serde_json::to_vec(&Value::Object(map))?;
        line.push(b'\n');
        Ok(line)
    }
}

fn parse_object(line: &[u8]) -> Result<Map<String, Value>, DecodeError> {
    match serde_json::from_slice(line)? {
        Value::Object(map) => Ok(map),
        _ => Err(DecodeError::NotAnObject),
    }
}

/// JSON numbers arrive as floats from some runtimes, so `404.0` is accepted.
fn parse_status(value: Option<&Value>) -> Option<u16> {
    let number = value?.as_f64()?;
    if number.fract() != 0.0 {
        return None;
    }
    let code = u16::try_from(number as i64).ok()?;
    // Interim 1xx codes cannot be a final response.
    (200..=999).contains(&code).then_some(code)
}

fn string_headers(value: Option<&Value>) -> BTreeMap<String, String> {
    let Some(Value::Object(map)) = value else {
        return BTreeMap::new();
    };
    map.iter()
        .filter_map(|(name, value)| value.as_str().map(|v| (name.clone(), v.to_string())))
        .collect()
}

fn encode_body(body: &[u8]) -> (Cow<'_, str>, Option<&'static str>) {
    match std::str::from_utf8(body) {
        Ok(text) => (Cow::Borrowed(text), None),
        Err(_) => (Cow::Owned(STANDARD.encode(body)), Some(BASE64_ENCODING)),
    }
}

fn decode_body(map: &Map<String, Value>) -> Result<Option<Vec<u8>>, DecodeError> {
    let Some(Value::String(body)) = map.get("body") else {
        return Ok(None);
    };
    match map.get("body_encoding").and_then(Value::as_str) {
        None => Ok(Some(body.as_bytes().to_vec())),
        Some(BASE64_ENCODING) => Ok(Some(STANDARD.decode(body)?)),
        Some(other) => Err(DecodeError::UnsupportedEncoding(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = RequestEnvelope::new("POST", "/submit?x=1")
            .with_header("X-Test", "1")
            .with_body("ping");
        let line = req.to_line().unwrap();
        assert!(line.ends_with(b"\n"));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);

        let text = String::from_utf8(line.clone()).unwrap();
        assert!(text.contains(r#""method":"POST""#));
        assert!(text.contains(r#""url":"/submit?x=1""#));
        assert!(text.contains(r#""X-Test":"1""#));
        assert!(text.contains(r#""body":"ping""#));
        assert!(!text.contains("body_encoding"));

        assert_eq!(RequestEnvelope::from_line(&line).unwrap(), req);
    }

    #[test]
    fn test_request_body_with_control_bytes_stays_on_one_line() {
        let req = RequestEnvelope::new("POST", "/").with_body("line1\nline2\r\n\u{0}\t");
        let line = req.to_line().unwrap();
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(RequestEnvelope::from_line(&line).unwrap().body, req.body);
    }

    #[test]
    fn test_binary_request_body_is_base64() {
        let req = RequestEnvelope::new("PUT", "/blob").with_body(vec![0xff, 0x00, 0xfe, b'\n']);
        let line = req.to_line().unwrap();
        let text = String::from_utf8(line.clone()).unwrap();
        assert!(text.contains(r#""body_encoding":"base64""#));

        let parsed = RequestEnvelope::from_line(&line).unwrap();
        assert_eq!(parsed.body, vec![0xff, 0x00, 0xfe, b'\n']);
    }

    #[test]
    fn test_response_full() {
        let line = br#"{"status":201,"headers":{"Content-Type":"application/json"},"body":"{}"}"#;
        let resp = ResponseEnvelope::from_line(line).unwrap();
        assert_eq!(resp.status(), 201);
        assert_eq!(resp.headers["Content-Type"], "application/json");
        assert_eq!(resp.body(), b"{}");
    }

    #[test]
    fn test_response_missing_status_defaults_to_200() {
        let resp = ResponseEnvelope::from_line(br#"{"body":"ok"}"#).unwrap();
        assert_eq!(resp.status, None);
        assert_eq!(resp.status(), 200);
    }

    #[test]
    fn test_response_non_numeric_status_defaults_to_200() {
        for line in [
            br#"{"status":"404","body":""}"#.as_slice(),
            br#"{"status":null,"body":""}"#.as_slice(),
            br#"{"status":true,"body":""}"#.as_slice(),
            br#"{"status":12.5,"body":""}"#.as_slice(),
            br#"{"status":42,"body":""}"#.as_slice(),
            br#"{"status":100,"body":""}"#.as_slice(),
            br#"{"status":199,"body":""}"#.as_slice(),
            br#"{"status":70000,"body":""}"#.as_slice(),
        ] {
            let resp = ResponseEnvelope::from_line(line).unwrap();
            assert_eq!(resp.status(), 200, "line: {}", String::from_utf8_lossy(line));
        }
    }

    #[test]
    fn test_response_float_status_is_accepted() {
        let resp = ResponseEnvelope::from_line(br#"{"status":404.0}"#).unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[test]
    fn test_response_missing_body_uses_placeholder() {
        let resp = ResponseEnvelope::from_line(br#"{"status":200}"#).unwrap();
        assert_eq!(resp.body(), INVALID_BODY_PLACEHOLDER.as_bytes());
        assert!(!resp.clone().into_body().is_empty());

        let resp = ResponseEnvelope::from_line(br#"{"body":123}"#).unwrap();
        assert_eq!(resp.body(), INVALID_BODY_PLACEHOLDER.as_bytes());
    }

    #[test]
    fn test_response_empty_body_is_not_replaced() {
        let resp = ResponseEnvelope::from_line(br#"{"status":204,"body":""}"#).unwrap();
        assert_eq!(resp.body(), b"");
    }

    #[test]
    fn test_response_non_string_headers_are_dropped() {
        let resp =
            ResponseEnvelope::from_line(br#"{"headers":{"X-Pid":1234,"X-Name":"w0"}}"#).unwrap();
        assert_eq!(resp.headers.len(), 1);
        assert_eq!(resp.headers["X-Name"], "w0");
    }

    #[test]
    fn test_echoed_request_decodes_as_response() {
        let req = RequestEnvelope::new("GET", "/")
            .with_header("X-Test", "1")
            .with_body("ping");
        let resp = ResponseEnvelope::from_line(&req.to_line().unwrap()).unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.body(), b"ping");
        assert_eq!(resp.headers["X-Test"], "1");
    }

    #[test]
    fn test_response_rejects_non_objects() {
        assert!(matches!(
            ResponseEnvelope::from_line(b"[200, {}, \"x\"]"),
            Err(DecodeError::NotAnObject)
        ));
        assert!(matches!(
            ResponseEnvelope::from_line(b"Hello from PHP"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_response_unknown_body_encoding() {
        let err = ResponseEnvelope::from_line(br#"{"body":"x","body_encoding":"gzip"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("gzip"));
    }

    #[test]
    fn test_response_to_line_binary_body() {
        let resp = ResponseEnvelope {
            status: Some(200),
            headers: BTreeMap::new(),
            body: Some(vec![0x89, b'P', b'N', b'G']),
        };
        let parsed = ResponseEnvelope::from_line(&resp.to_line().unwrap()).unwrap();
        assert_eq!(parsed, resp);
    }
}
