use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio::time::Duration;

use crate::error::{ProxyError, ProxyResult};
use crate::models::AppConfig;

// Error bodies are read at most this far when digging for a structured
// message; anything longer is upstream noise.
const ERROR_BODY_LIMIT: usize = 512 * 1024;

/// Authenticated POSTs against the internal RPC surface with endpoint
/// failover. Endpoints are tried in order; a logical call never issues
/// more POSTs than there are base URLs.
pub struct UpstreamDispatcher {
    client: RwLock<Client>,
    base_urls: RwLock<Vec<String>>,
    user_agent: RwLock<String>,
    timeout: RwLock<Duration>,
}

enum Failure {
    /// Network, DNS or per-attempt timeout: the endpoint may be down, the
    /// next one may not.
    Transport(String),
    /// 408 / 429 / 5xx: the endpoint answered but cannot serve right now.
    Retryable { status: StatusCode, message: String },
}

impl UpstreamDispatcher {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: RwLock::new(build_client(config)),
            base_urls: RwLock::new(config.effective_base_urls()),
            user_agent: RwLock::new(config.effective_user_agent()),
            timeout: RwLock::new(Duration::from_secs(config.effective_request_timeout())),
        }
    }

    /// Hot-applies a settings update without dropping in-flight requests.
    pub async fn apply_config(&self, config: &AppConfig) {
        *self.client.write().await = build_client(config);
        *self.base_urls.write().await = config.effective_base_urls();
        *self.user_agent.write().await = config.effective_user_agent();
        *self.timeout.write().await = Duration::from_secs(config.effective_request_timeout());
    }

    fn build_url(base_url: &str, method: &str, query_string: Option<&str>) -> String {
        match query_string {
            Some(qs) => format!("{}:{}?{}", base_url, method, qs),
            None => format!("{}:{}", base_url, method),
        }
    }

    fn should_try_next_endpoint(status: StatusCode) -> bool {
        status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
    }

    fn is_terminal_auth(status: StatusCode) -> bool {
        status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
    }

    pub async fn call(
        &self,
        method: &str,
        access_token: &str,
        body: &Value,
        query_string: Option<&str>,
        extra_headers: &HashMap<String, String>,
    ) -> ProxyResult<Response> {
        let client = self.client.read().await.clone();
        let user_agent = self.user_agent.read().await.clone();
        let attempt_timeout = *self.timeout.read().await;
        let base_urls = self.base_urls.read().await.clone();

        let mut last_failure: Option<Failure> = None;

        for (idx, base_url) in base_urls.iter().enumerate() {
            let url = Self::build_url(base_url, method, query_string);
            let has_next = idx + 1 < base_urls.len();

            let mut request = client
                .post(&url)
                .header("Authorization", format!("Bearer {}", access_token))
                .header("Content-Type", "application/json")
                .header("User-Agent", &user_agent)
                .json(body);
            for (name, value) in extra_headers {
                request = request.header(name, value);
            }

            // The timeout bounds each endpoint attempt, not the logical call.
            let sent = tokio::time::timeout(attempt_timeout, request.send()).await;
            let response = match sent {
                Ok(Ok(resp)) => resp,
                Ok(Err(e)) => {
                    let msg = format!("request failed at {}: {}", base_url, e);
                    tracing::debug!("[Upstream] {}", msg);
                    last_failure = Some(Failure::Transport(msg));
                    continue;
                }
                Err(_) => {
                    let msg = format!(
                        "request timed out after {}s at {}",
                        attempt_timeout.as_secs(),
                        base_url
                    );
                    tracing::debug!("[Upstream] {}", msg);
                    last_failure = Some(Failure::Transport(msg));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                if idx > 0 {
                    tracing::info!(
                        "[Upstream] Fallback endpoint succeeded: {} ({})",
                        base_url,
                        status
                    );
                }
                return Ok(response);
            }

            if Self::is_terminal_auth(status) {
                // Token problem, not endpoint problem: stop immediately.
                let message = read_error_message(response).await;
                return Err(ProxyError::AuthRejected(format!("{}: {}", status, message)));
            }

            if Self::should_try_next_endpoint(status) {
                let message = read_error_message(response).await;
                tracing::warn!(
                    "[Upstream] Endpoint {} returned {} (method={}), {} endpoint(s) left",
                    base_url,
                    status,
                    method,
                    base_urls.len() - idx - 1
                );
                last_failure = Some(Failure::Retryable { status, message });
                if has_next {
                    continue;
                }
                break;
            }

            // Any other HTTP status is terminal mid-list.
            let message = read_error_message(response).await;
            return Err(ProxyError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        Err(match last_failure {
            Some(Failure::Retryable { status, message })
                if status == StatusCode::TOO_MANY_REQUESTS =>
            {
                ProxyError::RateLimited(message)
            }
            Some(Failure::Retryable { status, message }) => {
                ProxyError::UpstreamUnavailable(format!("{}: {}", status, message))
            }
            Some(Failure::Transport(message)) => ProxyError::UpstreamUnavailable(message),
            None => ProxyError::UpstreamUnavailable("no endpoints configured".to_string()),
        })
    }

    /// Buffered call. Some internal endpoints double-wrap the payload as
    /// `{"response": {...}}`; the inner object is returned either way.
    pub async fn generate(
        &self,
        access_token: &str,
        body: &Value,
        extra_headers: &HashMap<String, String>,
    ) -> ProxyResult<Value> {
        let response = self
            .call("generateContent", access_token, body, None, extra_headers)
            .await?;
        let decoded: Value = response.json().await?;
        Ok(unwrap_response_envelope(decoded))
    }

    /// Streaming call: the caller owns the byte stream and is responsible
    /// for re-framing. Nothing is buffered here.
    pub async fn stream_generate(
        &self,
        access_token: &str,
        body: &Value,
        extra_headers: &HashMap<String, String>,
    ) -> ProxyResult<Response> {
        self.call(
            "streamGenerateContent",
            access_token,
            body,
            Some("alt=sse"),
            extra_headers,
        )
        .await
    }
}

fn build_client(config: &AppConfig) -> Client {
    let mut builder = Client::builder().connect_timeout(Duration::from_secs(20));
    if config.upstream_proxy.enabled && !config.upstream_proxy.url.is_empty() {
        match reqwest::Proxy::all(&config.upstream_proxy.url) {
            Ok(proxy) => {
                tracing::info!("[Upstream] Outbound proxy enabled: {}", config.upstream_proxy.url);
                builder = builder.proxy(proxy);
            }
            Err(e) => {
                tracing::warn!("[Upstream] Ignoring invalid proxy url {}: {}", config.upstream_proxy.url, e);
            }
        }
    }
    builder.build().unwrap_or_default()
}

/// `{"response": {...}}` → inner object; anything else passes through.
pub fn unwrap_response_envelope(decoded: Value) -> Value {
    match decoded.get("response") {
        Some(inner) if inner.is_object() => inner.clone(),
        _ => decoded,
    }
}

fn message_from_object(value: &Value) -> Option<String> {
    let candidate = value
        .get("error")
        .and_then(|e| e.get("message"))
        .or_else(|| value.get("message"))
        .and_then(|m| m.as_str())?;
    if candidate.is_empty() {
        None
    } else {
        Some(candidate.to_string())
    }
}

/// Digs a human-readable message out of an error payload that may be a
/// JSON object, a raw string, or SSE frames. `None` means nothing
/// structured was found and the raw text should surface instead.
pub fn extract_error_message(raw: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        if let Some(message) = message_from_object(&value) {
            return Some(message);
        }
    }
    for line in raw.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(data) {
            if let Some(message) = message_from_object(&value) {
                return Some(message);
            }
        }
    }
    None
}

/// Reads up to 512 KiB of a still-open error response and applies the
/// string rule.
async fn read_error_message(response: Response) -> String {
    let mut collected: Vec<u8> = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(bytes) = chunk else { break };
        let remaining = ERROR_BODY_LIMIT.saturating_sub(collected.len());
        if remaining == 0 {
            break;
        }
        collected.extend_from_slice(&bytes[..bytes.len().min(remaining)]);
    }
    let raw = String::from_utf8_lossy(&collected).to_string();
    extract_error_message(&raw).unwrap_or(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode as AxStatus, routing::post, Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[derive(Clone)]
    struct MockState {
        hits: Arc<AtomicUsize>,
        status: u16,
        body: Value,
    }

    async fn mock_handler(State(state): State<MockState>) -> (AxStatus, Json<Value>) {
        state.hits.fetch_add(1, Ordering::SeqCst);
        (
            AxStatus::from_u16(state.status).unwrap(),
            Json(state.body.clone()),
        )
    }

    async fn start_mock(status: u16, body: Value) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let state = MockState {
            hits: hits.clone(),
            status,
            body,
        };
        let app = Router::new()
            .fallback(post(mock_handler))
            .with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve mock");
        });
        (format!("http://{}/v1internal", addr), hits)
    }

    fn dispatcher_for(base_urls: Vec<String>) -> UpstreamDispatcher {
        let config = AppConfig {
            internal_base_urls: base_urls,
            request_timeout: 5,
            ..AppConfig::default()
        };
        UpstreamDispatcher::new(&config)
    }

    #[tokio::test]
    async fn failover_on_500_uses_second_endpoint() {
        let (first, first_hits) = start_mock(500, json!({"error": {"message": "boom"}})).await;
        let (second, second_hits) =
            start_mock(200, json!({"response": {"candidates": []}})).await;

        let dispatcher = dispatcher_for(vec![first, second]);
        let result = dispatcher
            .generate("token", &json!({"contents": []}), &HashMap::new())
            .await
            .expect("fallback should succeed");

        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
        assert_eq!(result, json!({"candidates": []}));
    }

    #[tokio::test]
    async fn auth_failure_is_terminal_after_one_post() {
        let (first, first_hits) =
            start_mock(401, json!({"error": {"message": "bad token"}})).await;
        let (second, second_hits) = start_mock(200, json!({})).await;

        let dispatcher = dispatcher_for(vec![first, second]);
        let err = dispatcher
            .generate("token", &json!({"contents": []}), &HashMap::new())
            .await
            .unwrap_err();

        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 0);
        assert!(matches!(err, ProxyError::AuthRejected(_)));
        assert!(err.to_string().contains("bad token"));
    }

    #[tokio::test]
    async fn exhaustion_never_exceeds_endpoint_count() {
        let (first, first_hits) = start_mock(503, json!({"message": "down"})).await;
        let (second, second_hits) = start_mock(503, json!({"message": "down"})).await;

        let dispatcher = dispatcher_for(vec![first, second]);
        let err = dispatcher
            .generate("token", &json!({}), &HashMap::new())
            .await
            .unwrap_err();

        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
        assert!(matches!(err, ProxyError::UpstreamUnavailable(_)));
        assert!(err.to_string().contains("down"));
    }

    #[tokio::test]
    async fn exhaustion_on_429_surfaces_rate_limited() {
        let (first, _) = start_mock(429, json!({"error": {"message": "quota"}})).await;
        let (second, _) = start_mock(429, json!({"error": {"message": "quota"}})).await;

        let dispatcher = dispatcher_for(vec![first, second]);
        let err = dispatcher
            .generate("token", &json!({}), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::RateLimited(_)));
    }

    #[tokio::test]
    async fn non_retryable_status_is_terminal_mid_list() {
        let (first, first_hits) =
            start_mock(400, json!({"error": {"message": "schema mismatch"}})).await;
        let (second, second_hits) = start_mock(200, json!({})).await;

        let dispatcher = dispatcher_for(vec![first, second]);
        let err = dispatcher
            .generate("token", &json!({}), &HashMap::new())
            .await
            .unwrap_err();

        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 0);
        match err {
            ProxyError::Upstream { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "schema mismatch");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn network_failure_falls_through_to_next_endpoint() {
        // Nothing listens on the first address.
        let (second, second_hits) = start_mock(200, json!({"ok": true})).await;
        let dispatcher = dispatcher_for(vec![
            "http://127.0.0.1:9/v1internal".to_string(),
            second,
        ]);

        let result = dispatcher
            .generate("token", &json!({}), &HashMap::new())
            .await
            .expect("second endpoint should answer");
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
        assert_eq!(result, json!({"ok": true}));
    }

    #[test]
    fn build_url_shapes() {
        assert_eq!(
            UpstreamDispatcher::build_url("https://h/v1internal", "generateContent", None),
            "https://h/v1internal:generateContent"
        );
        assert_eq!(
            UpstreamDispatcher::build_url(
                "https://h/v1internal",
                "streamGenerateContent",
                Some("alt=sse")
            ),
            "https://h/v1internal:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn extract_message_from_json_object() {
        assert_eq!(
            extract_error_message(r#"{"error": {"message": "inner"}}"#),
            Some("inner".to_string())
        );
        assert_eq!(
            extract_error_message(r#"{"message": "flat"}"#),
            Some("flat".to_string())
        );
        assert_eq!(extract_error_message(r#"{"status": 500}"#), None);
    }

    #[test]
    fn extract_message_from_sse_frames() {
        let raw = "event: error\ndata: {\"noise\": 1}\ndata: {\"error\": {\"message\": \"from sse\"}}\n";
        assert_eq!(extract_error_message(raw), Some("from sse".to_string()));
        assert_eq!(extract_error_message("plain text failure"), None);
    }

    #[test]
    fn response_envelope_unwrapping() {
        let wrapped = json!({"response": {"candidates": [1]}, "traceId": "t"});
        assert_eq!(
            unwrap_response_envelope(wrapped),
            json!({"candidates": [1]})
        );

        let bare = json!({"candidates": [2]});
        assert_eq!(unwrap_response_envelope(bare.clone()), bare);
    }
}
