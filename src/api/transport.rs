//! The boundary to the remote API.

use async_trait::async_trait;
use serde_json::Value;

use crate::api::types::ApiError;
use crate::auth::Credential;

/// One outbound method invocation.
#[derive(Debug, Clone)]
pub struct RemoteCall {
    pub method: String,
    pub params: Value,
    /// Use the REST v3 path layout.
    pub rest_v3: bool,
    /// OAuth credential to attach, absent in webhook mode.
    pub credential: Option<Credential>,
}

/// Sends a single call and returns the decoded response body.
///
/// Implementations perform exactly one network exchange per call; retries
/// belong to the executor above them.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, call: &RemoteCall) -> Result<Value, ApiError>;
}
