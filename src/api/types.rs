//! Remote API error taxonomy.

use serde_json::Value;
use thiserror::Error;

/// Codes that will never succeed on retry and stop long-running loops.
pub const FATAL_ERROR_CODES: &[&str] = &[
    "WRONG_AUTH_TYPE",
    "insufficient_scope",
    "INVALID_CREDENTIALS",
    "NO_AUTH_FOUND",
    "METHOD_NOT_FOUND",
    "ERROR_METHOD_NOT_FOUND",
    "INVALID_REQUEST",
    "ACCESS_DENIED",
    "PAYMENT_REQUIRED",
];

/// Returns true for codes in [`FATAL_ERROR_CODES`].
pub fn is_fatal_code(code: &str) -> bool {
    FATAL_ERROR_CODES.contains(&code)
}

/// An error reported by the remote API or the transport in front of it.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code} (status {status}): {message}")]
pub struct ApiError {
    /// Remote error code, e.g. `QUERY_LIMIT_EXCEEDED`.
    pub code: String,
    /// HTTP status, 0 when no response was received.
    pub status: u16,
    /// Human readable description.
    pub message: String,
}

/// What an error code means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    RateLimited,
    Transient,
    AuthExpired,
    Permission,
    Validation,
    BatchSize,
    NotFound,
    Network,
    Other,
}

/// How the retry executor treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff.
    Transient,
    /// Refresh credentials once, then retry once.
    AuthExpired,
    /// Surface immediately.
    NonRetryable,
}

impl ApiError {
    pub fn new(code: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            status,
            message: message.into(),
        }
    }

    /// Connection-level failure before any response arrived.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new("NETWORK_ERROR", 0, message)
    }

    /// The attempt exceeded its deadline.
    pub fn timeout(secs: u64) -> Self {
        Self::new("TIMEOUT", 0, format!("request timed out after {secs}s"))
    }

    pub fn kind(&self) -> ApiErrorKind {
        match self.code.as_str() {
            "QUERY_LIMIT_EXCEEDED" => ApiErrorKind::RateLimited,
            "expired_token" => ApiErrorKind::AuthExpired,
            "insufficient_scope" | "ACCESS_DENIED" => ApiErrorKind::Permission,
            "INVALID_REQUEST" | "ERROR_ARGUMENT" => ApiErrorKind::Validation,
            "ERROR_BATCH_LENGTH_EXCEEDED" => ApiErrorKind::BatchSize,
            "METHOD_NOT_FOUND" | "ERROR_METHOD_NOT_FOUND" | "NOT_FOUND" => ApiErrorKind::NotFound,
            "NETWORK_ERROR" | "TIMEOUT" => ApiErrorKind::Network,
            "INTERNAL_SERVER_ERROR" => ApiErrorKind::Transient,
            _ if self.status >= 500 => ApiErrorKind::Transient,
            _ => ApiErrorKind::Other,
        }
    }

    pub fn class(&self) -> ErrorClass {
        if self.is_fatal() {
            return ErrorClass::NonRetryable;
        }
        match self.kind() {
            ApiErrorKind::RateLimited | ApiErrorKind::Transient | ApiErrorKind::Network => {
                ErrorClass::Transient
            }
            ApiErrorKind::AuthExpired => ErrorClass::AuthExpired,
            _ => ErrorClass::NonRetryable,
        }
    }

    pub fn is_fatal(&self) -> bool {
        is_fatal_code(&self.code)
    }
}

/// Extract an error from a response body, if it carries one.
///
/// REST v2 reports `{"error": "CODE", "error_description": "..."}`; REST v3
/// reports `{"error": {"code": "...", "message": "..."}}`. Any non-2xx
/// status without a recognisable body is still an error.
pub fn parse_error_body(status: u16, body: &Value) -> Option<ApiError> {
    match body.get("error") {
        Some(Value::String(code)) if !code.is_empty() => {
            let message = body
                .get("error_description")
                .and_then(Value::as_str)
                .filter(|m| !m.is_empty())
                .unwrap_or(code);
            Some(ApiError::new(code.clone(), status, message))
        }
        Some(Value::Object(err)) => {
            let code = err.get("code").map(value_to_code).unwrap_or_default();
            if code.is_empty() {
                return http_status_error(status);
            }
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .filter(|m| !m.is_empty())
                .unwrap_or(&code)
                .to_string();
            Some(ApiError::new(code, status, message))
        }
        _ => http_status_error(status),
    }
}

fn value_to_code(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn http_status_error(status: u16) -> Option<ApiError> {
    match status {
        200..=299 => None,
        404 => Some(ApiError::new("NOT_FOUND", status, "resource not found")),
        s if s >= 500 => Some(ApiError::new(
            "INTERNAL_SERVER_ERROR",
            status,
            format!("server returned status {s}"),
        )),
        s => Some(ApiError::new("HTTP_ERROR", status, format!("server returned status {s}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classification() {
        let cases = [
            (ApiError::new("QUERY_LIMIT_EXCEEDED", 503, "slow down"), ErrorClass::Transient),
            (ApiError::new("", 502, "bad gateway"), ErrorClass::Transient),
            (ApiError::network("connection reset"), ErrorClass::Transient),
            (ApiError::timeout(30), ErrorClass::Transient),
            (ApiError::new("expired_token", 401, "expired"), ErrorClass::AuthExpired),
            (ApiError::new("ACCESS_DENIED", 403, "no"), ErrorClass::NonRetryable),
            (ApiError::new("ERROR_ARGUMENT", 400, "bad"), ErrorClass::NonRetryable),
            (ApiError::new("ERROR_BATCH_LENGTH_EXCEEDED", 400, "big"), ErrorClass::NonRetryable),
            (ApiError::new("INVALID_REQUEST", 500, "fatal wins"), ErrorClass::NonRetryable),
        ];
        for (error, expected) in cases {
            assert_eq!(error.class(), expected, "{error}");
        }
    }

    #[test]
    fn test_parse_v2_and_v3_bodies() {
        let v2 = parse_error_body(
            200,
            &json!({"error": "QUERY_LIMIT_EXCEEDED", "error_description": "Too many requests"}),
        )
        .unwrap();
        assert_eq!(v2.code, "QUERY_LIMIT_EXCEEDED");
        assert_eq!(v2.message, "Too many requests");

        let v3 = parse_error_body(400, &json!({"error": {"code": "ERROR_ARGUMENT"}})).unwrap();
        assert_eq!(v3.code, "ERROR_ARGUMENT");
        assert_eq!(v3.message, "ERROR_ARGUMENT");
        assert_eq!(v3.status, 400);

        assert!(parse_error_body(200, &json!({"result": {"ID": 1}})).is_none());
        assert_eq!(
            parse_error_body(503, &json!({})).unwrap().kind(),
            ApiErrorKind::Transient
        );
    }
}
