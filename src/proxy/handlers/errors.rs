use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::ProxyError;

fn error_type_for(status: u16) -> &'static str {
    match status {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        429 => "rate_limit_error",
        503 => "overloaded_error",
        _ => "api_error",
    }
}

/// Renders any core error as a dialect-A error envelope carrying the
/// `CODE|HINT` string a front end can localize.
pub fn proxy_error_response(err: &ProxyError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::BAD_GATEWAY);
    (
        status,
        Json(json!({
            "type": "error",
            "error": {
                "type": error_type_for(err.http_status()),
                "message": format!("{}: {}", err.wire_code(), err),
            }
        })),
    )
        .into_response()
}

pub fn invalid_request_response(message: impl Into<String>) -> Response {
    proxy_error_response(&ProxyError::InvalidRequest(message.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_account_renders_overloaded_envelope() {
        let response = proxy_error_response(&ProxyError::NoAccount);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn rate_limited_maps_to_429() {
        let response = proxy_error_response(&ProxyError::RateLimited("quota".to_string()));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
