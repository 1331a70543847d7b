//! Offline queue items and the sources they are pulled from.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::api::types::ApiError;
use crate::digest::sha256_hex;
use crate::error::{GuardError, GuardResult};
use crate::gateway::{CallRequest, PolicyGateway};

const OFFLINE_GET: &str = "event.offline.get";
const OFFLINE_CLEAR: &str = "event.offline.clear";
const OFFLINE_ERROR: &str = "event.offline.error";

/// One event as delivered by the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub message_id: Option<String>,
    pub event: Option<Value>,
    pub data: Option<Value>,
    pub auth: Option<Value>,
    pub raw: Value,
}

impl QueueItem {
    /// Read the well-known fields in either case.
    pub fn from_value(raw: Value) -> Self {
        let field = |names: &[&str]| -> Option<Value> {
            let map = raw.as_object()?;
            names
                .iter()
                .filter_map(|name| map.get(*name))
                .find(|value| !value.is_null())
                .cloned()
        };
        let message_id = field(&["message_id", "MESSAGE_ID", "id", "ID"]).map(|value| match value {
            Value::String(s) => s,
            other => other.to_string(),
        });
        Self {
            message_id,
            event: field(&["event", "EVENT"]),
            data: field(&["data", "DATA"]),
            auth: field(&["auth", "AUTH"]),
            raw,
        }
    }

    pub fn event_name(&self) -> &str {
        self.event.as_ref().and_then(Value::as_str).unwrap_or("unknown")
    }

    /// `event:<first 16 hex of sha256(data)>`, stable across polls.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.event_name(), &self.payload_hash()[..16])
    }

    /// SHA-256 of the canonical JSON of the payload.
    pub fn payload_hash(&self) -> String {
        let empty = Value::Object(Map::new());
        let data = self.data.as_ref().unwrap_or(&empty);
        sha256_hex(data.to_string().as_bytes())
    }

    /// Message id when present, otherwise the dedup key.
    pub fn identity(&self) -> String {
        self.message_id.clone().unwrap_or_else(|| self.dedup_key())
    }

    pub fn application_token(&self) -> Option<&str> {
        self.auth
            .as_ref()
            .and_then(|auth| auth.get("application_token"))
            .and_then(Value::as_str)
    }

    /// Describe why the item is malformed, if it is.
    pub fn validate_schema(&self) -> Option<String> {
        if !self.raw.is_object() {
            return Some("event item is not an object".to_string());
        }
        if self.event.as_ref().is_some_and(|e| !e.is_string()) {
            return Some("event field must be a string".to_string());
        }
        if self.data.as_ref().is_some_and(|d| !d.is_object()) {
            return Some("data field must be an object".to_string());
        }
        if self.auth.as_ref().is_some_and(|a| !a.is_object()) {
            return Some("auth field must be an object".to_string());
        }
        None
    }
}

/// Items returned by one poll and the token that acknowledges them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueBatch {
    pub token: Option<String>,
    pub items: Vec<QueueItem>,
}

impl QueueBatch {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Decode an `event.offline.get` response body.
pub fn parse_offline_response(body: &Value) -> Result<QueueBatch, ApiError> {
    let invalid = |reason: &str| {
        ApiError::new(
            "INVALID_OFFLINE_RESPONSE_SCHEMA",
            0,
            format!("Invalid offline response schema: {reason}"),
        )
    };
    let Some(body) = body.as_object() else {
        return Err(invalid("response is not an object"));
    };
    let result = match body.get("result") {
        None | Some(Value::Null) => return Err(invalid("missing result field")),
        Some(Value::Object(result)) => result,
        Some(_) => return Err(invalid("result is not an object")),
    };
    let token = match result.get("process_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(id)) => Some(id.clone()),
        Some(_) => return Err(invalid("result.process_id must be string when present")),
    };

    let items = ["events", "items", "result"]
        .iter()
        .find_map(|name| match result.get(*name) {
            Some(Value::Array(list)) => {
                Some(list.iter().filter(|v| v.is_object()).cloned().collect::<Vec<_>>())
            }
            Some(Value::Object(map)) => Some(map.values().filter(|v| v.is_object()).cloned().collect()),
            _ => None,
        })
        .unwrap_or_else(Vec::new)
        .into_iter()
        .map(QueueItem::from_value)
        .collect();

    Ok(QueueBatch { token, items })
}

/// A durable event queue with non-destructive reads.
#[async_trait]
pub trait OfflineQueue: Send + Sync {
    /// Read up to `limit` items without removing them.
    async fn poll(&self, limit: usize) -> GuardResult<QueueBatch>;

    /// Remove acknowledged items. Empty `ids` removes the whole batch.
    async fn acknowledge(&self, token: &str, ids: &[String]) -> GuardResult<()>;

    /// Tell the source these items failed for good.
    async fn report_error(&self, token: &str, ids: &[String]) -> GuardResult<()>;
}

/// The portal's offline event queue, reached through the gateway.
pub struct GatewayQueue {
    gateway: Arc<PolicyGateway>,
}

impl GatewayQueue {
    pub fn new(gateway: Arc<PolicyGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl OfflineQueue for GatewayQueue {
    async fn poll(&self, limit: usize) -> GuardResult<QueueBatch> {
        let request = CallRequest::builder(OFFLINE_GET)
            .params(json!({"clear": "0", "limit": limit}))
            .build();
        let outcome = self.gateway.execute_protocol(request).await?;
        parse_offline_response(&outcome.payload).map_err(|e| GuardError::Remote {
            method: OFFLINE_GET.to_string(),
            code: e.code,
            status: e.status,
            message: e.message,
            attempts: 1,
        })
    }

    async fn acknowledge(&self, token: &str, ids: &[String]) -> GuardResult<()> {
        let mut params = json!({"process_id": token});
        if !ids.is_empty() {
            params["message_id"] = json!(ids);
        }
        let request = CallRequest::builder(OFFLINE_CLEAR)
            .params(params)
            .confirm_write(true)
            .build();
        self.gateway.execute_protocol(request).await.map(|_| ())
    }

    async fn report_error(&self, token: &str, ids: &[String]) -> GuardResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let request = CallRequest::builder(OFFLINE_ERROR)
            .params(json!({"process_id": token, "message_id": ids}))
            .build();
        self.gateway.execute_protocol(request).await.map(|_| ())
    }
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    items: Vec<QueueItem>,
    batches: HashMap<String, Vec<String>>,
    next_token: u64,
    reported: Vec<String>,
    polls: u64,
}

/// In-process queue with the same delivery semantics as the remote one.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: impl IntoIterator<Item = Value>) -> Self {
        let queue = Self::new();
        for item in items {
            queue.push(item);
        }
        queue
    }

    pub fn push(&self, raw: Value) {
        if let Ok(mut state) = self.state.lock() {
            state.items.push(QueueItem::from_value(raw));
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identities of the items still queued.
    pub fn identities(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.items.iter().map(QueueItem::identity).collect())
            .unwrap_or_default()
    }

    /// Ids passed to `report_error` so far.
    pub fn reported_errors(&self) -> Vec<String> {
        self.state.lock().map(|s| s.reported.clone()).unwrap_or_default()
    }

    pub fn polls(&self) -> u64 {
        self.state.lock().map(|s| s.polls).unwrap_or(0)
    }
}

fn poisoned() -> GuardError {
    GuardError::Remote {
        method: OFFLINE_GET.to_string(),
        code: "QUEUE_UNAVAILABLE".to_string(),
        status: 0,
        message: "memory queue lock poisoned".to_string(),
        attempts: 1,
    }
}

#[async_trait]
impl OfflineQueue for MemoryQueue {
    async fn poll(&self, limit: usize) -> GuardResult<QueueBatch> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        state.polls += 1;
        if state.items.is_empty() {
            return Ok(QueueBatch::default());
        }
        let items: Vec<QueueItem> = state.items.iter().take(limit.max(1)).cloned().collect();
        state.next_token += 1;
        let token = format!("mem-{}", state.next_token);
        let identities = items.iter().map(QueueItem::identity).collect();
        state.batches.insert(token.clone(), identities);
        Ok(QueueBatch {
            token: Some(token),
            items,
        })
    }

    async fn acknowledge(&self, token: &str, ids: &[String]) -> GuardResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let Some(batch) = state.batches.remove(token) else {
            return Ok(());
        };
        let remove: Vec<String> = if ids.is_empty() {
            batch
        } else {
            batch.into_iter().filter(|id| ids.contains(id)).collect()
        };
        state.items.retain(|item| !remove.contains(&item.identity()));
        Ok(())
    }

    async fn report_error(&self, _token: &str, ids: &[String]) -> GuardResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        state.reported.extend(ids.iter().cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_fields_and_identity() {
        let item = QueueItem::from_value(json!({
            "EVENT": "ONCRMLEADADD",
            "DATA": {"FIELDS": {"ID": 7}},
            "ID": 42,
        }));
        assert_eq!(item.message_id.as_deref(), Some("42"));
        assert_eq!(item.identity(), "42");
        assert_eq!(item.event_name(), "ONCRMLEADADD");
        assert_eq!(item.validate_schema(), None);

        let anonymous = QueueItem::from_value(json!({"event": "ONTASKADD", "data": {"b": 1, "a": 2}}));
        let reordered = QueueItem::from_value(json!({"event": "ONTASKADD", "data": {"a": 2, "b": 1}}));
        assert!(anonymous.identity().starts_with("ONTASKADD:"));
        assert_eq!(anonymous.identity().len(), "ONTASKADD:".len() + 16);
        assert_eq!(anonymous.identity(), reordered.identity());
    }

    #[test]
    fn test_item_schema() {
        let bad = QueueItem::from_value(json!({"event": 5, "message_id": "m1"}));
        assert_eq!(bad.validate_schema().unwrap(), "event field must be a string");
        let bad = QueueItem::from_value(json!({"event": "E", "data": [1]}));
        assert_eq!(bad.validate_schema().unwrap(), "data field must be an object");
        let bad = QueueItem::from_value(json!("not an object"));
        assert!(bad.validate_schema().is_some());
    }

    #[test]
    fn test_application_token() {
        let item = QueueItem::from_value(json!({"event": "E", "auth": {"application_token": "t1"}}));
        assert_eq!(item.application_token(), Some("t1"));
    }

    #[test]
    fn test_parse_offline_response() {
        let batch = parse_offline_response(&json!({
            "result": {
                "process_id": "proc-1",
                "events": [{"message_id": "a", "event": "E"}, "junk", {"message_id": "b"}]
            }
        }))
        .unwrap();
        assert_eq!(batch.token.as_deref(), Some("proc-1"));
        assert_eq!(batch.items.len(), 2);

        let batch = parse_offline_response(&json!({
            "result": {"process_id": "p", "result": {"x": {"ID": "1"}, "y": {"ID": "2"}}}
        }))
        .unwrap();
        assert_eq!(batch.items.len(), 2);

        let empty = parse_offline_response(&json!({"result": {}})).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.token, None);
    }

    #[test]
    fn test_parse_offline_response_errors() {
        for body in [
            json!([]),
            json!({"error": "x"}),
            json!({"result": []}),
            json!({"result": {"process_id": 5}}),
        ] {
            let err = parse_offline_response(&body).unwrap_err();
            assert_eq!(err.code, "INVALID_OFFLINE_RESPONSE_SCHEMA");
        }
    }

    #[tokio::test]
    async fn test_memory_queue_ack() {
        let queue = MemoryQueue::with_items([
            json!({"message_id": "a"}),
            json!({"message_id": "b"}),
            json!({"message_id": "c"}),
        ]);
        let batch = queue.poll(2).await.unwrap();
        assert_eq!(batch.items.len(), 2);
        // Reads are non-destructive.
        assert_eq!(queue.len(), 3);

        let token = batch.token.unwrap();
        queue.acknowledge(&token, &["b".to_string(), "c".to_string()]).await.unwrap();
        assert_eq!(queue.identities(), vec!["a", "c"]);

        let batch = queue.poll(10).await.unwrap();
        queue.acknowledge(batch.token.as_deref().unwrap(), &[]).await.unwrap();
        assert!(queue.is_empty());
    }
}
