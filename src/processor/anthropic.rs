//! Serde models for the Anthropic Messages API wire shapes, plus the
//! ingress-side request field extraction.
//!
//! Every field defaults so that partial or unexpected payloads degrade to
//! zero values instead of failing the observability path.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Streaming events ────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct MessageStart {
    #[serde(default)]
    pub message: StartedMessage,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartedMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage: Usage,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub cache_creation_input_tokens: i64,
    #[serde(default)]
    pub cache_read_input_tokens: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct MessageDelta {
    #[serde(default)]
    pub delta: MessageDeltaFields,
    #[serde(default)]
    pub usage: MessageDeltaUsage,
}

#[derive(Debug, Default, Deserialize)]
pub struct MessageDeltaFields {
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
}

/// `usage.output_tokens` on a message_delta is cumulative: later values
/// supersede earlier ones.
#[derive(Debug, Default, Deserialize)]
pub struct MessageDeltaUsage {
    #[serde(default)]
    pub output_tokens: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContentBlockStart {
    #[serde(default)]
    pub index: i64,
    #[serde(default)]
    pub content_block: ContentBlockInfo,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContentBlockInfo {
    #[serde(default, rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContentBlockDelta {
    #[serde(default)]
    pub index: i64,
    #[serde(default)]
    pub delta: BlockDelta,
}

#[derive(Debug, Default, Deserialize)]
pub struct BlockDelta {
    #[serde(default, rename = "type")]
    pub delta_type: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub thinking: String,
    #[serde(default)]
    pub partial_json: String,
}

// ── Full response (non-streaming body / reconstruction envelope) ─

#[derive(Debug, Default, Deserialize)]
pub struct AnthropicResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
    #[serde(default)]
    pub usage: Usage,
}

/// Envelope serialized for reconstructed streaming responses.
#[derive(Debug, Serialize)]
pub struct ResponseEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub role: &'static str,
    pub content: Vec<ResponseBlock>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    Thinking { thinking: String },
}

// ── Request (ingress side) ──────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct AnthropicRequest {
    #[serde(default)]
    system: Value,
    #[serde(default)]
    max_tokens: i32,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    messages: Vec<Value>,
    #[serde(default)]
    tools: Vec<Value>,
    #[serde(default)]
    thinking: Option<ThinkingConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct ThinkingConfig {
    #[serde(default)]
    budget_tokens: i32,
}

/// Fields extracted from an inbound request body. Parse failure yields
/// the all-zero value; it never fails the request.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedRequest {
    pub system_prompt: String,
    pub max_tokens: i32,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub message_count: i32,
    pub tool_count: i32,
    pub thinking_budget_tokens: i32,
}

impl ParsedRequest {
    pub fn from_body(body: &[u8]) -> Self {
        let Ok(req) = serde_json::from_slice::<AnthropicRequest>(body) else {
            return Self::default();
        };

        Self {
            system_prompt: extract_system_prompt(&req.system),
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            top_p: req.top_p,
            message_count: req.messages.len() as i32,
            tool_count: req.tools.len() as i32,
            thinking_budget_tokens: req.thinking.map(|t| t.budget_tokens).unwrap_or(0),
        }
    }
}

/// `system` is either a plain string or an array of text blocks; block
/// texts are joined with newlines.
fn extract_system_prompt(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => {
            let texts: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .filter(|t| !t.is_empty())
                .collect();
            texts.join("\n")
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_with_string_system() {
        let body = br#"{"model":"m","system":"be terse","messages":[{"role":"user","content":"hi"}],"max_tokens":128,"temperature":0.5,"top_p":0.9}"#;
        let parsed = ParsedRequest::from_body(body);

        assert_eq!(parsed.system_prompt, "be terse");
        assert_eq!(parsed.max_tokens, 128);
        assert_eq!(parsed.temperature, Some(0.5));
        assert_eq!(parsed.top_p, Some(0.9));
        assert_eq!(parsed.message_count, 1);
        assert_eq!(parsed.tool_count, 0);
        assert_eq!(parsed.thinking_budget_tokens, 0);
    }

    #[test]
    fn test_parse_request_with_block_system_and_tools() {
        let body = br#"{
            "system":[{"type":"text","text":"one"},{"type":"text","text":""},{"type":"text","text":"two"}],
            "messages":[{},{}],
            "tools":[{"name":"a"},{"name":"b"},{"name":"c"}],
            "thinking":{"type":"enabled","budget_tokens":2048}
        }"#;
        let parsed = ParsedRequest::from_body(body);

        assert_eq!(parsed.system_prompt, "one\ntwo");
        assert_eq!(parsed.message_count, 2);
        assert_eq!(parsed.tool_count, 3);
        assert_eq!(parsed.thinking_budget_tokens, 2048);
    }

    #[test]
    fn test_parse_failure_yields_zero_fields() {
        assert_eq!(ParsedRequest::from_body(b"not json"), ParsedRequest::default());
        assert_eq!(ParsedRequest::from_body(b""), ParsedRequest::default());
    }

    #[test]
    fn test_missing_optional_params_stay_none() {
        let parsed = ParsedRequest::from_body(br#"{"messages":[]}"#);

        assert_eq!(parsed.temperature, None);
        assert_eq!(parsed.top_p, None);
        assert_eq!(parsed.max_tokens, 0);
    }
}
