//! OAuth refresh against the token server.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::api::types::ApiError;
use crate::auth::credentials::Credential;
use crate::auth::refresh::Refresher;
use crate::config::schema::CredentialsConfig;

/// Refreshes tokens with the `refresh_token` grant.
pub struct OAuthRefresher {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl OAuthRefresher {
    pub fn from_config(config: &CredentialsConfig, timeout: Duration) -> Result<Self, ApiError> {
        let client_id = config.client_id.clone().unwrap_or_default();
        let client_secret = config.client_secret.clone().unwrap_or_default();
        if client_id.is_empty() || client_secret.is_empty() {
            return Err(ApiError::new(
                "MISSING_CLIENT_CREDENTIALS",
                0,
                "client_id and client_secret are required for refresh",
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::network(e.to_string()))?;
        Ok(Self {
            client,
            token_url: config.token_url.clone(),
            client_id,
            client_secret,
        })
    }
}

#[async_trait]
impl Refresher for OAuthRefresher {
    async fn refresh(&self, tenant: &str, current: &Credential) -> Result<Credential, ApiError> {
        let Some(refresh_token) = current.refresh_token.as_deref().filter(|t| !t.is_empty()) else {
            return Err(ApiError::new("MISSING_REFRESH_TOKEN", 0, "refresh_token missing"));
        };

        tracing::debug!(tenant, token_url = %self.token_url, "Requesting token refresh");
        let body: Value = self
            .client
            .get(&self.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|e| ApiError::network(e.to_string()))?
            .json()
            .await
            .map_err(|e| ApiError::new("INVALID_JSON", 0, e.to_string()))?;

        credential_from_response(&body, refresh_token)
    }
}

/// Decode a token server response. A missing refresh token keeps the old one.
pub fn credential_from_response(body: &Value, previous_refresh: &str) -> Result<Credential, ApiError> {
    if let Some(code) = body.get("error").and_then(Value::as_str) {
        let message = body
            .get("error_description")
            .and_then(Value::as_str)
            .unwrap_or(code);
        return Err(ApiError::new(code, 0, message));
    }

    let access_token = body
        .get("access_token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            ApiError::new(
                "INVALID_REFRESH_RESPONSE",
                0,
                "OAuth refresh returned no access_token",
            )
        })?;
    let refresh_token = body
        .get("refresh_token")
        .and_then(Value::as_str)
        .unwrap_or(previous_refresh);

    Ok(Credential {
        access_token: access_token.to_string(),
        refresh_token: Some(refresh_token.to_string()),
        expires_at: body.get("expires").and_then(Value::as_f64),
    })
}
