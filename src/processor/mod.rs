//! Background analytics for proxied requests.
//!
//! The processor consumes the event bus, buffers each request's raw
//! response bytes until its terminator arrives, then replays the bytes
//! through a fresh SSE parser and reassembles the logical response:
//! message metadata, content blocks and usage totals. Results leave as
//! write jobs; nothing here ever touches the client-facing path.

pub mod anthropic;

use std::collections::{BTreeMap, HashMap};

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bus::{self, BusMessage};
use crate::sse::{SseEvent, SseParser};
use crate::store::jobs;
use crate::store::records::UsageUpdate;
use crate::store::writer::WriterHandle;
use anthropic::{
    AnthropicResponse, ContentBlockDelta, ContentBlockStart, MessageDelta, MessageStart,
    ResponseBlock, ResponseEnvelope, Usage,
};

#[derive(Debug, Default, serde::Deserialize)]
struct DoneMeta {
    #[serde(default)]
    ts: i64,
}

struct Accumulator {
    ts: DateTime<Utc>,
    buf: BytesMut,
}

/// Consumes bus subjects and emits analytics write jobs.
#[derive(Clone)]
pub struct Processor {
    writer: WriterHandle<PgPool>,
}

impl Processor {
    pub fn new(writer: WriterHandle<PgPool>) -> Self {
        Self { writer }
    }

    /// Single-consumer loop over the bus. Chunks accumulate per request;
    /// the `.done` terminator closes the accumulator and runs reassembly,
    /// restoring the request's wall-clock from the terminator metadata.
    pub async fn run(self, mut rx: mpsc::Receiver<BusMessage>) {
        let mut accumulators: HashMap<Uuid, Accumulator> = HashMap::new();

        while let Some(msg) = rx.recv().await {
            let Some((request_id, done)) = bus::extract_request_id(&msg.subject) else {
                continue;
            };

            if done {
                let Some(mut acc) = accumulators.remove(&request_id) else {
                    continue;
                };
                if let Ok(meta) = serde_json::from_slice::<DoneMeta>(&msg.payload) {
                    if meta.ts != 0 {
                        acc.ts = DateTime::from_timestamp_nanos(meta.ts);
                    }
                }
                self.process_stream(request_id, acc.ts, &acc.buf);
            } else {
                accumulators
                    .entry(request_id)
                    .or_insert_with(|| Accumulator { ts: Utc::now(), buf: BytesMut::new() })
                    .buf
                    .extend_from_slice(&msg.payload);
            }
        }

        tracing::debug!("event bus closed, processor exiting");
    }

    /// Reassembly pipeline for a buffered SSE stream.
    pub fn process_stream(&self, request_id: Uuid, ts: DateTime<Utc>, body: &[u8]) {
        let (events, state) = summarize_stream(body);

        tracing::debug!(
            request_id = %request_id,
            sse_events = events.len(),
            model = %state.model,
            stop_reason = state.stop_reason.as_deref().unwrap_or(""),
            input_tokens = state.input_tokens,
            output_tokens = state.output_tokens,
            "stream processing complete"
        );

        if !events.is_empty() {
            self.writer.enqueue(jobs::insert_sse_events(request_id, ts, events));
        }

        if !state.model.is_empty() || state.total_tokens() > 0 {
            self.writer.enqueue(jobs::update_request_usage(state.usage_update(request_id, ts)));
        }

        if let Some(body) = state.reconstruct_response() {
            self.writer.enqueue(jobs::update_payload_response(
                request_id,
                ts,
                body,
                state.stop_sequence.clone(),
            ));
        }
    }

    /// Usage extraction for a fully buffered non-streaming response.
    pub fn process_non_stream(&self, request_id: Uuid, ts: DateTime<Utc>, body: &[u8]) {
        let Ok(parsed) = serde_json::from_slice::<AnthropicResponse>(body) else {
            return;
        };
        if parsed.model.is_empty() {
            return;
        }

        let total = parsed.usage.input_tokens
            + parsed.usage.output_tokens
            + parsed.usage.cache_read_input_tokens
            + parsed.usage.cache_creation_input_tokens;

        self.writer.enqueue(jobs::update_request_usage(UsageUpdate {
            request_id,
            ts,
            model: Some(parsed.model),
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
            cache_read_tokens: parsed.usage.cache_read_input_tokens,
            cache_creation_tokens: parsed.usage.cache_creation_input_tokens,
            total_tokens: total,
            cost_usd: 0.0,
            tokens_per_second: 0.0,
            stop_reason: parsed.stop_reason,
            message_id: (!parsed.id.is_empty()).then_some(parsed.id),
        }));
    }
}

/// Parse a buffered stream and fold its events into a [`StreamState`].
pub fn summarize_stream(body: &[u8]) -> (Vec<SseEvent>, StreamState) {
    let mut parser = SseParser::new();
    let events = parser.parse_chunk(body);

    let mut state = StreamState::default();
    for ev in &events {
        state.ingest(ev);
    }
    (events, state)
}

#[derive(Debug, Default)]
struct StreamBlock {
    block_type: String,
    id: String,
    name: String,
    text: String,
    input_json: String,
}

/// Running state folded from a request's event timeline.
#[derive(Debug, Default)]
pub struct StreamState {
    pub model: String,
    pub message_id: String,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    blocks: BTreeMap<i64, StreamBlock>,
}

impl StreamState {
    pub fn ingest(&mut self, ev: &SseEvent) {
        match ev.event_type.as_str() {
            "message_start" => {
                if let Ok(msg) = serde_json::from_str::<MessageStart>(&ev.raw_data) {
                    self.model = msg.message.model;
                    self.message_id = msg.message.id;
                    self.input_tokens = msg.message.usage.input_tokens;
                    self.output_tokens = msg.message.usage.output_tokens;
                    self.cache_read_tokens = msg.message.usage.cache_read_input_tokens;
                    self.cache_creation_tokens = msg.message.usage.cache_creation_input_tokens;
                }
            }
            "message_delta" => {
                if let Ok(msg) = serde_json::from_str::<MessageDelta>(&ev.raw_data) {
                    // Cumulative count: a later non-zero value supersedes.
                    if msg.usage.output_tokens > 0 {
                        self.output_tokens = msg.usage.output_tokens;
                    }
                    if msg.delta.stop_reason.is_some() {
                        self.stop_reason = msg.delta.stop_reason;
                    }
                    if msg.delta.stop_sequence.is_some() {
                        self.stop_sequence = msg.delta.stop_sequence;
                    }
                }
            }
            "content_block_start" => {
                if let Ok(msg) = serde_json::from_str::<ContentBlockStart>(&ev.raw_data) {
                    self.blocks.insert(
                        msg.index,
                        StreamBlock {
                            block_type: msg.content_block.block_type,
                            id: msg.content_block.id,
                            name: msg.content_block.name,
                            ..Default::default()
                        },
                    );
                }
            }
            "content_block_delta" => {
                if let Ok(msg) = serde_json::from_str::<ContentBlockDelta>(&ev.raw_data) {
                    let Some(block) = self.blocks.get_mut(&msg.index) else {
                        return;
                    };
                    match msg.delta.delta_type.as_str() {
                        "text_delta" => block.text.push_str(&msg.delta.text),
                        "thinking_delta" => block.text.push_str(&msg.delta.thinking),
                        "input_json_delta" => block.input_json.push_str(&msg.delta.partial_json),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    pub fn total_tokens(&self) -> i64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_creation_tokens
    }

    pub fn usage_update(&self, request_id: Uuid, ts: DateTime<Utc>) -> UsageUpdate {
        UsageUpdate {
            request_id,
            ts,
            model: (!self.model.is_empty()).then(|| self.model.clone()),
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_read_tokens: self.cache_read_tokens,
            cache_creation_tokens: self.cache_creation_tokens,
            total_tokens: self.total_tokens(),
            cost_usd: 0.0,
            tokens_per_second: 0.0,
            stop_reason: self.stop_reason.clone(),
            message_id: (!self.message_id.is_empty()).then(|| self.message_id.clone()),
        }
    }

    /// Rebuild a non-streaming response body from the accumulated blocks,
    /// in ascending index order. Returns `None` when neither a message id
    /// nor a model was captured.
    pub fn reconstruct_response(&self) -> Option<String> {
        if self.message_id.is_empty() && self.model.is_empty() {
            return None;
        }

        let content = self
            .blocks
            .values()
            .filter_map(|b| match b.block_type.as_str() {
                "text" => Some(ResponseBlock::Text { text: b.text.clone() }),
                "tool_use" => Some(ResponseBlock::ToolUse {
                    id: b.id.clone(),
                    name: b.name.clone(),
                    input: valid_json(&b.input_json),
                }),
                "thinking" => Some(ResponseBlock::Thinking { thinking: b.text.clone() }),
                _ => None,
            })
            .collect();

        let envelope = ResponseEnvelope {
            id: self.message_id.clone(),
            kind: "message",
            role: "assistant",
            content,
            model: self.model.clone(),
            stop_reason: self.stop_reason.clone(),
            stop_sequence: self.stop_sequence.clone(),
            usage: Usage {
                input_tokens: self.input_tokens,
                output_tokens: self.output_tokens,
                cache_creation_input_tokens: self.cache_creation_tokens,
                cache_read_input_tokens: self.cache_read_tokens,
            },
        };

        serde_json::to_string(&envelope).ok()
    }
}

/// An accumulated tool input that is not valid JSON is replaced by null.
fn valid_json(s: &str) -> Value {
    serde_json::from_str(s).unwrap_or(Value::Null)
}
