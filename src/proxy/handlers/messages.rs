use axum::{
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;

use super::errors::{invalid_request_response, proxy_error_response};
use crate::error::ProxyError;
use crate::proxy::mappers::claude::{
    conversation_fingerprint, create_message_stream, harvest_signatures, transform_request,
    translate_response, ClaudeRequest,
};
use crate::proxy::state::AppState;

const MAX_ACCOUNT_ATTEMPTS: usize = 2;

fn beta_headers(resolved_model: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if resolved_model.starts_with("claude-") {
        headers.insert(
            "anthropic-beta".to_string(),
            "claude-code-20250219".to_string(),
        );
    }
    headers
}

/// Front door for dialect-A requests: select the active account, rewrite
/// the body, dispatch with a fresh bearer token, and translate the answer
/// back. A 429 marks the account rate-limited and, when auto-switch is
/// enabled, retries once against the freshly selected account; the second
/// 429 surfaces to the client.
pub async fn handle_messages(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let request: ClaudeRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => return invalid_request_response(format!("invalid request body: {}", e)),
    };

    tracing::info!(
        "[Messages] model={} stream={} messages={} tools={}",
        request.model,
        request.stream,
        request.messages.len(),
        request.tools.as_ref().map(|t| t.len()).unwrap_or(0)
    );

    let mut last_error = ProxyError::NoAccount;

    for attempt in 0..MAX_ACCOUNT_ATTEMPTS {
        let Some(account) = state.pool.get_active() else {
            return proxy_error_response(&ProxyError::NoAccount);
        };

        let token = match state.pool.bearer_token_for(&state.http, &account.id).await {
            Ok(t) => t,
            // bearer_token_for already quarantined the account.
            Err(e) => return proxy_error_response(&e),
        };

        let project_id = account
            .project_id
            .clone()
            .unwrap_or_else(|| crate::constants::DEFAULT_PROJECT_ID.to_string());
        let routed = match transform_request(&request, &project_id, &state.signatures) {
            Ok(r) => r,
            Err(e) => return invalid_request_response(e),
        };
        let fingerprint = conversation_fingerprint(&request.messages);
        let extra_headers = beta_headers(&routed.resolved_model);

        state.pool.touch(&account.id);

        let dispatch_error = if request.stream {
            match state
                .upstream
                .stream_generate(&token, &routed.body, &extra_headers)
                .await
            {
                Ok(upstream_response) => {
                    return stream_response(
                        upstream_response,
                        &request.model,
                        &routed.resolved_model,
                        fingerprint,
                        &state,
                    );
                }
                Err(e) => e,
            }
        } else {
            match state
                .upstream
                .generate(&token, &routed.body, &extra_headers)
                .await
            {
                Ok(payload) => {
                    harvest_signatures(&payload, &fingerprint, &state.signatures);
                    let translated = translate_response(&payload, &request.model);
                    return (
                        [("X-Mapped-Model", routed.resolved_model.as_str())],
                        Json(translated),
                    )
                        .into_response();
                }
                Err(e) => e,
            }
        };

        match dispatch_error {
            ProxyError::RateLimited(detail) => {
                tracing::warn!(
                    "[Messages] Account {} rate limited on attempt {}: {}",
                    account.email,
                    attempt + 1,
                    detail
                );
                state.pool.mark_rate_limited(&account.id);
                let auto_switch = state
                    .config
                    .read()
                    .map(|c| c.auto_switch_enabled)
                    .unwrap_or(false);
                let switched = state
                    .pool
                    .get_active()
                    .map(|a| a.id != account.id)
                    .unwrap_or(false);
                let rate_limited = ProxyError::RateLimited(detail);
                if auto_switch && switched && attempt + 1 < MAX_ACCOUNT_ATTEMPTS {
                    last_error = rate_limited;
                    continue;
                }
                return proxy_error_response(&rate_limited);
            }
            ProxyError::AuthRejected(detail) => {
                tracing::warn!(
                    "[Messages] Account {} rejected upstream: {}",
                    account.email,
                    detail
                );
                state.pool.mark_error(&account.id);
                return proxy_error_response(&ProxyError::AuthRejected(detail));
            }
            other => return proxy_error_response(&other),
        }
    }

    proxy_error_response(&last_error)
}

fn stream_response(
    upstream_response: reqwest::Response,
    client_model: &str,
    resolved_model: &str,
    fingerprint: String,
    state: &AppState,
) -> Response {
    let translated = create_message_stream(
        Box::pin(upstream_response.bytes_stream()),
        client_model.to_string(),
        fingerprint,
        state.signatures.clone(),
    )
    .map(|item| item.map_err(std::io::Error::other));

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("X-Mapped-Model", resolved_model)
        .body(Body::from_stream(translated))
        .unwrap_or_else(|e| {
            proxy_error_response(&ProxyError::Internal(format!(
                "failed to build stream response: {}",
                e
            )))
        })
}
