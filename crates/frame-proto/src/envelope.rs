//! Frame Envelope codec (spec §3, §4.2, §6).
//!
//! The upstream log and the per-processor queues both carry entries as a flat
//! key/value map of byte strings. This module is the single quarantine zone
//! that turns that untyped shape into [`FrameEnvelope`] and back; nothing
//! downstream of [`FrameEnvelope::decode`] touches the wire representation
//! again.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{DlqReason, RoutingReason};

/// The flat key/value shape of a log entry (spec §6).
pub type WireFields = HashMap<String, String>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("exactly one of image_data/payload_ref must be present")]
    AmbiguousPayload,
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("invalid integer field {0}: {1}")]
    InvalidInt(&'static str, String),
    #[error("invalid base64 in image_data")]
    InvalidBase64,
    #[error("invalid metadata JSON: {0}")]
    InvalidMetadata(String),
}

/// Where the frame's pixel data lives: inlined in the envelope (below the
/// configured cap) or referenced by an opaque external key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadRef {
    Inline(Vec<u8>),
    External(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameEnvelope {
    pub frame_id: String,
    pub camera_id: String,
    pub capture_timestamp: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub payload: PayloadRef,
    pub metadata: Option<serde_json::Value>,
    pub trace_context: Option<String>,
}

impl FrameEnvelope {
    /// Decodes the wire shape of an upstream/queue entry. Any missing
    /// required field or ambiguous payload reference is `malformed` — the
    /// caller routes it straight to the dead-letter stream (spec §4.2, §4.7).
    pub fn decode(fields: &WireFields) -> Result<Self, EnvelopeError> {
        let frame_id = required(fields, "frame_id")?.to_string();
        let camera_id = required(fields, "camera_id")?.to_string();
        let format = required(fields, "format")?.to_string();

        let capture_timestamp = required(fields, "timestamp")?;
        let capture_timestamp = DateTime::parse_from_rfc3339(capture_timestamp)
            .map_err(|err| EnvelopeError::InvalidTimestamp(err.to_string()))?
            .with_timezone(&Utc);

        let width = parse_u32(fields, "width")?;
        let height = parse_u32(fields, "height")?;

        let payload = match (fields.get("image_data"), fields.get("payload_ref")) {
            (Some(_), Some(_)) => return Err(EnvelopeError::AmbiguousPayload),
            (None, None) => return Err(EnvelopeError::AmbiguousPayload),
            (Some(encoded), None) => {
                let bytes = BASE64
                    .decode(encoded.as_bytes())
                    .map_err(|_| EnvelopeError::InvalidBase64)?;
                PayloadRef::Inline(bytes)
            }
            (None, Some(key)) => PayloadRef::External(key.clone()),
        };

        let metadata = match fields.get("metadata") {
            Some(raw) if !raw.is_empty() => Some(
                serde_json::from_str(raw)
                    .map_err(|err| EnvelopeError::InvalidMetadata(err.to_string()))?,
            ),
            _ => None,
        };

        let trace_context = fields.get("traceparent").cloned();

        Ok(Self {
            frame_id,
            camera_id,
            capture_timestamp,
            width,
            height,
            format,
            payload,
            metadata,
            trace_context,
        })
    }

    /// Encodes back to the wire shape used for the upstream stream and
    /// result/DLQ entries that don't need the orchestrator sequence number.
    pub fn encode(&self) -> WireFields {
        let mut fields = WireFields::new();
        fields.insert("frame_id".to_string(), self.frame_id.clone());
        fields.insert("camera_id".to_string(), self.camera_id.clone());
        fields.insert(
            "timestamp".to_string(),
            self.capture_timestamp.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        );
        fields.insert("width".to_string(), self.width.to_string());
        fields.insert("height".to_string(), self.height.to_string());
        fields.insert("format".to_string(), self.format.clone());

        match &self.payload {
            PayloadRef::Inline(bytes) => {
                fields.insert("image_data".to_string(), BASE64.encode(bytes));
            }
            PayloadRef::External(key) => {
                fields.insert("payload_ref".to_string(), key.clone());
            }
        }

        if let Some(metadata) = &self.metadata {
            if let Ok(raw) = serde_json::to_string(metadata) {
                fields.insert("metadata".to_string(), raw);
            }
        }

        if let Some(trace_context) = &self.trace_context {
            fields.insert("traceparent".to_string(), trace_context.clone());
        }

        fields
    }

    /// Encodes for a per-processor dedicated queue, adding the orchestrator's
    /// monotonic assignment sequence (spec §6).
    pub fn encode_for_queue(&self, orchestrator_seq: u64) -> WireFields {
        let mut fields = self.encode();
        fields.insert("orchestrator_seq".to_string(), orchestrator_seq.to_string());
        fields
    }

    /// Encodes for the dead-letter stream, tagging the terminal reason and
    /// how many distinct processors were attempted (spec §6).
    pub fn encode_for_dlq(&self, reason: DlqReason, attempts: u32) -> WireFields {
        let mut fields = self.encode();
        fields.insert("dlq_reason".to_string(), reason.to_string());
        fields.insert("dlq_attempts".to_string(), attempts.to_string());
        fields
    }
}

/// Transient, per-frame record of a routing decision (spec §3).
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub frame_id: String,
    pub chosen_processor_id: Option<String>,
    pub reason: RoutingReason,
    pub attempts: u32,
}

fn required<'a>(
    fields: &'a WireFields,
    key: &'static str,
) -> Result<&'a str, EnvelopeError> {
    fields
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or(EnvelopeError::MissingField(key))
}

fn parse_u32(fields: &WireFields, key: &'static str) -> Result<u32, EnvelopeError> {
    required(fields, key)?
        .parse::<u32>()
        .map_err(|err| EnvelopeError::InvalidInt(key, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fields() -> WireFields {
        let mut fields = WireFields::new();
        fields.insert("frame_id".to_string(), "t0_cam1_1".to_string());
        fields.insert("camera_id".to_string(), "cam1".to_string());
        fields.insert(
            "timestamp".to_string(),
            "2026-07-27T10:00:00.123456789Z".to_string(),
        );
        fields.insert("width".to_string(), "1920".to_string());
        fields.insert("height".to_string(), "1080".to_string());
        fields.insert("format".to_string(), "jpeg".to_string());
        fields.insert("payload_ref".to_string(), "s3://bucket/key".to_string());
        fields
    }

    #[test]
    fn decode_encode_round_trips() {
        let fields = sample_fields();
        let envelope = FrameEnvelope::decode(&fields).unwrap();
        assert_eq!(envelope.frame_id, "t0_cam1_1");
        assert_eq!(envelope.payload, PayloadRef::External("s3://bucket/key".to_string()));

        let reencoded = envelope.encode();
        let reparsed = FrameEnvelope::decode(&reencoded).unwrap();
        assert_eq!(reparsed, envelope);
    }

    #[test]
    fn rejects_missing_required_field() {
        let mut fields = sample_fields();
        fields.remove("camera_id");
        assert_eq!(
            FrameEnvelope::decode(&fields).unwrap_err(),
            EnvelopeError::MissingField("camera_id")
        );
    }

    #[test]
    fn rejects_both_payload_fields_present() {
        let mut fields = sample_fields();
        fields.insert("image_data".to_string(), BASE64.encode(b"abc"));
        assert_eq!(
            FrameEnvelope::decode(&fields).unwrap_err(),
            EnvelopeError::AmbiguousPayload
        );
    }

    #[test]
    fn rejects_neither_payload_field_present() {
        let mut fields = sample_fields();
        fields.remove("payload_ref");
        assert_eq!(
            FrameEnvelope::decode(&fields).unwrap_err(),
            EnvelopeError::AmbiguousPayload
        );
    }

    #[test]
    fn inline_payload_round_trips() {
        let mut fields = sample_fields();
        fields.remove("payload_ref");
        fields.insert("image_data".to_string(), BASE64.encode(b"pixels"));
        let envelope = FrameEnvelope::decode(&fields).unwrap();
        assert_eq!(envelope.payload, PayloadRef::Inline(b"pixels".to_vec()));
    }

    #[test]
    fn queue_encoding_adds_orchestrator_seq() {
        let envelope = FrameEnvelope::decode(&sample_fields()).unwrap();
        let queued = envelope.encode_for_queue(42);
        assert_eq!(queued.get("orchestrator_seq").map(String::as_str), Some("42"));
    }

    #[test]
    fn dlq_encoding_adds_reason_and_attempts() {
        let envelope = FrameEnvelope::decode(&sample_fields()).unwrap();
        let dlq = envelope.encode_for_dlq(DlqReason::NoCapabilityMatch, 0);
        assert_eq!(dlq.get("dlq_reason").map(String::as_str), Some("no_capability_match"));
        assert_eq!(dlq.get("dlq_attempts").map(String::as_str), Some("0"));
    }
}
