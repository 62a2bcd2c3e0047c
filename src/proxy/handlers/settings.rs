use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::errors::proxy_error_response;
use crate::error::ProxyError;
use crate::models::AppConfig;
use crate::modules::persistence;
use crate::proxy::state::AppState;

pub async fn get_settings(State(state): State<AppState>) -> Response {
    let config = state.config.read().expect("config lock").clone();
    Json(config).into_response()
}

/// Replaces the settings document, persists it, and hot-applies the parts
/// the dispatcher derives from it.
pub async fn put_settings(
    State(state): State<AppState>,
    Json(mut config): Json<AppConfig>,
) -> Response {
    config.request_timeout = config.request_timeout.max(1);

    if let Err(e) = persistence::save_settings(&config) {
        return proxy_error_response(&ProxyError::Internal(format!(
            "failed to persist settings: {}",
            e
        )));
    }
    state.upstream.apply_config(&config).await;
    *state.config.write().expect("config lock") = config;
    tracing::info!("[Settings] Configuration updated");

    Json(json!({"saved": true})).into_response()
}
