//! Typed rows for the analytics tables.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// One row in `requests`, written once when upstream response headers
/// arrive (or a dial failure occurs) and updated once with usage later.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status_code: i32,
    pub success: bool,
    pub error_message: Option<String>,
    pub response_time_ms: i64,
    pub is_stream: bool,
    pub model: Option<String>,
    pub message_id: Option<String>,
    pub stop_reason: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub total_tokens: i64,
    pub cost_usd: f64,
    pub tokens_per_second: f32,
    pub tool_count: i32,
    pub thinking_budget_tokens: i32,
}

impl RequestRecord {
    /// A record with everything but identity zeroed, for the two insert
    /// sites in the proxy handler.
    pub fn new(id: Uuid, ts: DateTime<Utc>, method: String, path: String) -> Self {
        Self {
            id,
            ts,
            method,
            path,
            status_code: 0,
            success: false,
            error_message: None,
            response_time_ms: 0,
            is_stream: false,
            model: None,
            message_id: None,
            stop_reason: None,
            input_tokens: 0,
            output_tokens: 0,
            cache_read_tokens: 0,
            cache_creation_tokens: 0,
            total_tokens: 0,
            cost_usd: 0.0,
            tokens_per_second: 0.0,
            tool_count: 0,
            thinking_budget_tokens: 0,
        }
    }
}

/// The post-stream usage update for a `requests` row, keyed `(id, ts)`.
#[derive(Debug, Clone)]
pub struct UsageUpdate {
    pub request_id: Uuid,
    pub ts: DateTime<Utc>,
    pub model: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub total_tokens: i64,
    pub cost_usd: f64,
    pub tokens_per_second: f32,
    pub stop_reason: Option<String>,
    pub message_id: Option<String>,
}

/// One row in `request_payloads`. Header maps must already be sanitized
/// (credential-bearing keys replaced) before the record is built.
#[derive(Debug, Clone)]
pub struct PayloadRecord {
    pub request_id: Uuid,
    pub ts: DateTime<Utc>,
    pub request_headers: Value,
    pub response_headers: Value,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<i32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub message_count: Option<i32>,
    pub stop_sequence: Option<String>,
}
