//! Control-plane wire payloads (spec §5, §15): the JSON bodies carried inside
//! `frame-proto` frames between workers/the admin CLI and the orchestrator.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub processor_id: String,
    pub capabilities: HashSet<String>,
    pub declared_capacity: u32,
    pub session_token: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub queue_name: String,
    pub session_token: String,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub processor_id: String,
    pub session_token: String,
    pub inflight_observed: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct DeregisterRequest {
    pub processor_id: String,
    pub session_token: String,
}

#[derive(Debug, Deserialize)]
pub struct ProcessorIdRequest {
    pub processor_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ReplayRequest {
    pub entry_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ProcessorSummary {
    pub processor_id: String,
    pub state: &'static str,
    pub capabilities: HashSet<String>,
    pub declared_capacity: u32,
    pub inflight: u32,
}

/// Outcome of a control-plane request that doesn't carry its own payload.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum AdminResponse {
    Ok,
    Rejected(String),
    Conflict(String),
}
