//! Immutable call requests.

use serde_json::{Map, Value};

use crate::policy::Risk;

/// A method invocation as submitted to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    method: String,
    params: Value,
    risk: Option<Risk>,
    idempotency_key: Option<String>,
    confirm_write: bool,
    confirm_destructive: bool,
    allow_unlisted: bool,
    rest_v3: bool,
}

impl CallRequest {
    /// Start building a request. The method is trimmed and lowercased.
    pub fn builder(method: impl AsRef<str>) -> CallRequestBuilder {
        CallRequestBuilder {
            request: CallRequest {
                method: method.as_ref().trim().to_ascii_lowercase(),
                params: Value::Object(Map::new()),
                risk: None,
                idempotency_key: None,
                confirm_write: false,
                confirm_destructive: false,
                allow_unlisted: false,
                rest_v3: false,
            },
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    /// Risk declared by the caller, if any.
    pub fn risk(&self) -> Option<Risk> {
        self.risk
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    pub fn confirm_write(&self) -> bool {
        self.confirm_write
    }

    pub fn confirm_destructive(&self) -> bool {
        self.confirm_destructive
    }

    pub fn allow_unlisted(&self) -> bool {
        self.allow_unlisted
    }

    pub fn rest_v3(&self) -> bool {
        self.rest_v3
    }

    /// A copy of this request with different flags, built from scratch.
    pub fn to_builder(&self) -> CallRequestBuilder {
        CallRequestBuilder {
            request: self.clone(),
        }
    }
}

/// Builder for [`CallRequest`].
#[derive(Debug, Clone)]
pub struct CallRequestBuilder {
    request: CallRequest,
}

impl CallRequestBuilder {
    pub fn params(mut self, params: Value) -> Self {
        self.request.params = params;
        self
    }

    pub fn risk(mut self, risk: Risk) -> Self {
        self.request.risk = Some(risk);
        self
    }

    /// Blank keys are ignored.
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into().trim().to_string();
        self.request.idempotency_key = (!key.is_empty()).then_some(key);
        self
    }

    pub fn confirm_write(mut self, yes: bool) -> Self {
        self.request.confirm_write = yes;
        self
    }

    pub fn confirm_destructive(mut self, yes: bool) -> Self {
        self.request.confirm_destructive = yes;
        self
    }

    pub fn allow_unlisted(mut self, yes: bool) -> Self {
        self.request.allow_unlisted = yes;
        self
    }

    pub fn rest_v3(mut self, yes: bool) -> Self {
        self.request.rest_v3 = yes;
        self
    }

    pub fn build(self) -> CallRequest {
        self.request
    }
}
