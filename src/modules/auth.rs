use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{ProxyError, ProxyResult};
use crate::models::TokenData;

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    pub token_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserInfo {
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

/// Exchanges an authorization code delivered by the external capture flow
/// for a token pair. Callers that obtained the code with PKCE pass the
/// verifier through.
pub async fn exchange_auth_code(
    client: &reqwest::Client,
    code: &str,
    redirect_uri: &str,
    code_verifier: Option<&str>,
) -> ProxyResult<TokenResponse> {
    let mut params = vec![
        ("client_id", constants::OAUTH_CLIENT_ID),
        ("client_secret", constants::OAUTH_CLIENT_SECRET),
        ("code", code),
        ("grant_type", "authorization_code"),
        ("redirect_uri", redirect_uri),
    ];
    if let Some(verifier) = code_verifier {
        params.push(("code_verifier", verifier));
    }

    let response = client
        .post(constants::OAUTH_TOKEN_URL)
        .form(&params)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(ProxyError::AuthRejected(format!(
            "code exchange failed ({}): {}",
            status, body
        )));
    }
    Ok(response.json().await?)
}

pub async fn refresh_access_token(
    client: &reqwest::Client,
    refresh_token: &str,
) -> ProxyResult<TokenResponse> {
    let params = [
        ("client_id", constants::OAUTH_CLIENT_ID),
        ("client_secret", constants::OAUTH_CLIENT_SECRET),
        ("refresh_token", refresh_token),
        ("grant_type", "refresh_token"),
    ];

    let response = client
        .post(constants::OAUTH_TOKEN_URL)
        .form(&params)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(ProxyError::AuthRejected(format!(
            "token refresh failed ({}): {}",
            status, body
        )));
    }
    Ok(response.json().await?)
}

pub async fn fetch_user_info(
    client: &reqwest::Client,
    access_token: &str,
) -> ProxyResult<UserInfo> {
    let response = client
        .get(constants::OAUTH_USERINFO_URL)
        .bearer_auth(access_token)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(ProxyError::AuthRejected(format!(
            "userinfo fetch failed ({}): {}",
            status, body
        )));
    }
    Ok(response.json().await?)
}

impl TokenResponse {
    pub fn into_token_data(self, previous_refresh: Option<String>) -> TokenData {
        let expiry = self
            .expires_in
            .map(|secs| chrono::Utc::now().timestamp() + secs as i64)
            .unwrap_or(0);
        TokenData {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .or(previous_refresh)
                .unwrap_or_default(),
            token_type: if self.token_type.is_empty() {
                "Bearer".to_string()
            } else {
                self.token_type
            },
            expiry_timestamp: expiry,
        }
    }
}
