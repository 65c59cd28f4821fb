//! Control-plane request/response shapes and dedicated-queue reply parsing.
//!
//! These request/response types mirror the JSON bodies the orchestrator's
//! control server expects (`frame_orchestrator::core::admin`); the two
//! crates don't share a type directly since the control-plane wire is the
//! integration boundary, not the Rust type.

use std::collections::{HashMap, HashSet};

use frame_proto::WireFields;
use redis::Value;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct RegisterRequest {
    pub processor_id: String,
    pub capabilities: HashSet<String>,
    pub declared_capacity: u32,
    /// Freshly generated per process start; asserting the same token on a
    /// later register is how the worker tells the orchestrator "this is
    /// still me" and keeps its `inflight` reservations across reconnects.
    pub session_token: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterResponse {
    pub queue_name: String,
    pub session_token: String,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatRequest {
    pub processor_id: String,
    pub session_token: String,
    pub inflight_observed: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct DeregisterRequest {
    pub processor_id: String,
    pub session_token: String,
}

/// Parses an `XREAD` reply into `(entry_id, fields)` pairs, same nested
/// shape as the orchestrator's stream replies minus the consumer-group
/// wrapping.
pub fn parse_xread_entries(value: &Value) -> Vec<(String, WireFields)> {
    let Value::Array(streams) = value else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for stream_entry in streams {
        let Value::Array(pair) = stream_entry else { continue };
        let Some(Value::Array(entries)) = pair.get(1) else { continue };

        for entry in entries {
            let Value::Array(parts) = entry else { continue };
            let Some(Value::BulkString(id_bytes)) = parts.first() else { continue };
            let id = String::from_utf8_lossy(id_bytes).into_owned();

            let fields = match parts.get(1) {
                Some(Value::Array(kv)) => parse_field_pairs(kv),
                _ => HashMap::new(),
            };

            out.push((id, fields));
        }
    }
    out
}

fn parse_field_pairs(kv: &[Value]) -> WireFields {
    let mut fields = HashMap::with_capacity(kv.len() / 2);
    let mut iter = kv.iter();
    while let (Some(Value::BulkString(key)), Some(Value::BulkString(value))) = (iter.next(), iter.next()) {
        fields.insert(
            String::from_utf8_lossy(key).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        );
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_xread_reply() {
        let reply = Value::Array(vec![Value::Array(vec![
            Value::BulkString(b"frames:processor:p1".to_vec()),
            Value::Array(vec![Value::Array(vec![
                Value::BulkString(b"1-0".to_vec()),
                Value::Array(vec![
                    Value::BulkString(b"frame_id".to_vec()),
                    Value::BulkString(b"abc".to_vec()),
                ]),
            ])]),
        ])]);

        let entries = parse_xread_entries(&reply);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "1-0");
        assert_eq!(entries[0].1.get("frame_id").map(String::as_str), Some("abc"));
    }

    #[test]
    fn nil_reply_on_block_timeout_yields_no_entries() {
        assert!(parse_xread_entries(&Value::Nil).is_empty());
    }
}
