//! Parameter digests.
//!
//! `serde_json` maps keep keys sorted, so serializing a [`Value`] is already
//! canonical: two parameter bags with the same content hash identically
//! regardless of the order the caller built them in.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// SHA-256 hex digest of the canonical JSON encoding of `value`.
pub fn params_digest(value: &Value) -> String {
    sha256_hex(value.to_string().as_bytes())
}

/// SHA-256 hex digest of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Sorted top-level keys of a parameter object. Values are never exposed.
pub fn param_keys(value: &Value) -> Vec<String> {
    match value {
        Value::Object(map) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}
