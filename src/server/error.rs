//! Gateway error responses.

use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::error::TuskError;

/// Prefix of every upstream error body.
pub const ENGINE_ERROR_PREFIX: &str = "Engine Error: ";

/// A dispatch failure, rendered as a fixed upstream-error response.
#[derive(Debug)]
pub struct GatewayError(pub TuskError);

impl GatewayError {
    /// Status code for this error.
    ///
    /// Every dispatch failure is reported as 502 Bad Gateway, including a
    /// saturated pool; the gateway never retries.
    pub fn status(&self) -> StatusCode {
        StatusCode::BAD_GATEWAY
    }

    /// Plain-text body, `Engine Error: <description>`.
    pub fn body(&self) -> String {
        format!("{}{}", ENGINE_ERROR_PREFIX, self.0)
    }
}

impl From<TuskError> for GatewayError {
    fn from(err: TuskError) -> Self {
        Self(err)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        warn!(error = %self.0, "Request failed");
        (
            self.status(),
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.body(),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_no_workers_body() {
        let err = GatewayError::from(TuskError::NoWorkers);
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.body(), "Engine Error: no workers available");
    }

    #[test]
    fn test_into_response() {
        let response = GatewayError::from(TuskError::PoolSaturated(Duration::from_secs(1)))
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }
}
