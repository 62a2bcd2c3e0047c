use axum::{
    http::Method,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::error::{ProxyError, ProxyResult};
use crate::proxy::handlers;
use crate::proxy::state::AppState;

async fn root() -> Json<Value> {
    Json(json!({
        "service": "trestle",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            "POST /v1/messages",
            "GET /v1/accounts",
            "POST /v1/accounts",
            "DELETE /v1/accounts/:id",
            "POST /v1/accounts/:id/switch",
            "POST /v1/accounts/:id/refresh",
            "POST /v1/accounts/sync-local",
            "GET /v1/settings",
            "PUT /v1/settings"
        ]
    }))
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/v1/messages", post(handlers::messages::handle_messages))
        .route("/v1/accounts", get(handlers::accounts::list_accounts))
        .route("/v1/accounts", post(handlers::accounts::add_account))
        .route("/v1/accounts/:id", delete(handlers::accounts::delete_account))
        .route(
            "/v1/accounts/:id/switch",
            post(handlers::accounts::switch_account),
        )
        .route(
            "/v1/accounts/:id/refresh",
            post(handlers::accounts::refresh_account),
        )
        .route(
            "/v1/accounts/sync-local",
            post(handlers::accounts::sync_local_account),
        )
        .route("/v1/settings", get(handlers::settings::get_settings))
        .route("/v1/settings", put(handlers::settings::put_settings))
        .layer(cors)
        .with_state(state)
}

/// Binds the control surface on loopback and serves until ctrl-c.
pub async fn serve(state: AppState) -> ProxyResult<()> {
    let port = state.config.read().expect("config lock").port;
    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ProxyError::Internal(format!("failed to bind {}: {}", addr, e)))?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await
        .map_err(|e| ProxyError::Internal(format!("server error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AppConfig;
    use crate::modules::credentials::CredentialStore;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn start_test_server() -> String {
        let credentials = Arc::new(CredentialStore::with_primary_key([11u8; 32]));
        let state = AppState::build(AppConfig::default(), credentials);
        let app = build_router(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn messages_without_accounts_returns_no_account_error() {
        let base = start_test_server().await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/v1/messages", base))
            .json(&json!({
                "model": "claude-sonnet-4-5",
                "max_tokens": 10,
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 503);
        let body: Value = response.json().await.unwrap();
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("ERR_NO_ACCOUNT"));
    }

    #[tokio::test]
    async fn malformed_messages_body_is_a_client_error() {
        let base = start_test_server().await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/v1/messages", base))
            .json(&json!({"model": 42}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn accounts_listing_is_empty_initially() {
        let base = start_test_server().await;
        let body: Value = reqwest::get(format!("{}/v1/accounts", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["accounts"].as_array().unwrap().len(), 0);
        assert_eq!(body["global_quota"], 0.0);
    }

    #[tokio::test]
    async fn settings_round_trip_over_http() {
        let _guard = crate::test_utils::env_lock();
        let base = start_test_server().await;
        let client = reqwest::Client::new();

        let mut settings: Value = client
            .get(format!("{}/v1/settings", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        settings["request_timeout"] = json!(0);
        settings["request_user_agent"] = json!("settings-probe/1");

        let response = client
            .put(format!("{}/v1/settings", base))
            .json(&settings)
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());

        let fetched: Value = client
            .get(format!("{}/v1/settings", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        // Sub-second timeouts are clamped on write.
        assert_eq!(fetched["request_timeout"], json!(1));
        assert_eq!(fetched["request_user_agent"], json!("settings-probe/1"));

        // Restore defaults for sibling tests sharing the data dir.
        let _ = crate::modules::persistence::save_settings(&AppConfig::default());
    }
}
