//! HTTP transport built on reqwest.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use url::Url;

use crate::api::transport::{RemoteCall, Transport};
use crate::api::types::{parse_error_body, ApiError};
use crate::config::schema::{AuthMode, TenantConfig};

/// Posts JSON to the tenant's REST endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    tenant: TenantConfig,
}

impl HttpTransport {
    pub fn new(tenant: TenantConfig, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::network(e.to_string()))?;
        Ok(Self { client, tenant })
    }

    /// Resolve the endpoint URL for a method.
    ///
    /// Webhooks embed the user id and code in the path and share one layout
    /// for v2 and v3. OAuth uses `/rest/<method>`, or `/rest/api/<method>` for v3.
    pub fn endpoint(&self, method: &str, rest_v3: bool) -> Result<Url, ApiError> {
        let mut domain = self.tenant.domain.trim().trim_end_matches('/').to_string();
        if !domain.starts_with("http://") && !domain.starts_with("https://") {
            domain = format!("https://{domain}");
        }

        let raw = match self.tenant.auth_mode {
            AuthMode::Webhook => {
                let (Some(user), Some(code)) = (
                    self.tenant.webhook_user_id.as_deref().filter(|s| !s.is_empty()),
                    self.tenant.webhook_code.as_deref().filter(|s| !s.is_empty()),
                ) else {
                    return Err(ApiError::new(
                        "NO_AUTH_FOUND",
                        0,
                        "webhook_user_id and webhook_code are required for webhook mode",
                    ));
                };
                format!("{domain}/rest/{user}/{code}/{method}")
            }
            AuthMode::OAuth if rest_v3 => format!("{domain}/rest/api/{method}"),
            AuthMode::OAuth => format!("{domain}/rest/{method}"),
        };

        Url::parse(&raw).map_err(|e| ApiError::new("INVALID_REQUEST", 0, e.to_string()))
    }

    fn body_for(&self, call: &RemoteCall) -> Value {
        let mut body = match &call.params {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        if self.tenant.auth_mode == AuthMode::OAuth {
            if let Some(credential) = &call.credential {
                body.insert(
                    "auth".to_string(),
                    Value::String(credential.access_token.clone()),
                );
            }
        }
        Value::Object(body)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, call: &RemoteCall) -> Result<Value, ApiError> {
        let url = self.endpoint(&call.method, call.rest_v3)?;
        let response = self
            .client
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&self.body_for(call))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ApiError::new("TIMEOUT", 0, e.to_string())
                } else {
                    ApiError::network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let raw = response
            .text()
            .await
            .map_err(|e| ApiError::network(e.to_string()))?;

        let body = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => Value::Object(map),
            Ok(other) => serde_json::json!({ "result": other }),
            Err(_) if status >= 400 => Value::Object(Map::new()),
            Err(_) => {
                return Err(ApiError::new("INVALID_JSON", status, "invalid JSON response"));
            }
        };

        if let Some(error) = parse_error_body(status, &body) {
            return Err(error);
        }
        Ok(body)
    }
}
