use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::errors::{invalid_request_response, proxy_error_response};
use crate::models::global_quota;
use crate::proxy::providers::group_models_by_provider;
use crate::proxy::state::AppState;

/// Accounts with redacted credentials, each annotated with its derived
/// provider stats, plus the pool-wide quota mean.
pub async fn list_accounts(State(state): State<AppState>) -> Response {
    let (visibility, groupings_enabled) = {
        let config = state.config.read().expect("config lock");
        (
            config.model_visibility.clone(),
            config.provider_groupings_enabled,
        )
    };

    let accounts: Vec<serde_json::Value> = state
        .pool
        .list()
        .into_iter()
        .map(|view| {
            let mut entry = serde_json::to_value(&view).unwrap_or(json!({}));
            if groupings_enabled {
                if let Some(quota) = &view.quota {
                    let stats = group_models_by_provider(quota, &visibility);
                    entry["stats"] = serde_json::to_value(&stats).unwrap_or(json!(null));
                }
            }
            entry
        })
        .collect();

    let snapshots = state.pool.quota_snapshots();
    let global = global_quota(snapshots.iter(), &visibility);

    Json(json!({
        "accounts": accounts,
        "global_quota": global,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct AddAccountRequest {
    pub auth_code: String,
    #[serde(default)]
    pub replace: bool,
}

pub async fn add_account(
    State(state): State<AppState>,
    Json(body): Json<AddAccountRequest>,
) -> Response {
    if body.auth_code.trim().is_empty() {
        return invalid_request_response("auth_code is required");
    }
    match state
        .pool
        .add(&state.http, body.auth_code.trim(), body.replace)
        .await
    {
        Ok(view) => {
            // First account in the pool becomes active right away.
            if state.pool.get_active().is_none() {
                let _ = state.pool.switch_to(&view.id);
            }
            Json(json!({"account": view})).into_response()
        }
        Err(e) => proxy_error_response(&e),
    }
}

pub async fn delete_account(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.pool.delete(&id) {
        Ok(()) => Json(json!({"deleted": id})).into_response(),
        Err(e) => proxy_error_response(&e),
    }
}

pub async fn switch_account(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.pool.switch_to(&id) {
        Ok(()) => Json(json!({"active": id})).into_response(),
        Err(e) => proxy_error_response(&e),
    }
}

/// Force-polls a single account instead of waiting for the next tick.
pub async fn refresh_account(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.poller.poll_account(&id).await {
        Ok(()) => match state.pool.get(&id) {
            Some(account) => Json(json!({"account": account.redacted()})).into_response(),
            None => invalid_request_response(format!("no such account: {}", id)),
        },
        Err(e) => proxy_error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct SyncLocalRequest {
    pub email: String,
    pub refresh_token: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

/// Imports an IDE-managed account: its refresh token is encrypted into the
/// pool and owned by the proxy from then on.
pub async fn sync_local_account(
    State(state): State<AppState>,
    Json(body): Json<SyncLocalRequest>,
) -> Response {
    if body.email.trim().is_empty() || body.refresh_token.trim().is_empty() {
        return invalid_request_response("email and refresh_token are required");
    }
    match state.pool.import_local(
        body.email.trim(),
        body.refresh_token.trim(),
        body.project_id,
    ) {
        Ok(view) => {
            if state.pool.get_active().is_none() {
                let _ = state.pool.switch_to(&view.id);
            }
            Json(json!({"account": view})).into_response()
        }
        Err(e) => proxy_error_response(&e),
    }
}
