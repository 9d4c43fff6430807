//! The catch-all reverse proxy handler.
//!
//! Relays every request to the configured upstream with byte-accurate
//! streaming while mirroring the response into the analytics pipeline.
//! Streaming bodies are read-and-mirrored: each upstream chunk is
//! published to the event bus before it is forwarded to the client, so
//! both sinks observe identical bytes in identical order. No failure in
//! the observability path may fail or delay the proxied response.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::response::Response;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::bus;
use crate::errors::AppError;
use crate::processor::anthropic::{AnthropicResponse, ParsedRequest};
use crate::proxy::headers::{
    build_target_url, prepare_client_headers, prepare_upstream_headers, sanitize_headers,
};
use crate::store::jobs;
use crate::store::records::{PayloadRecord, RequestRecord};
use crate::AppState;

/// The main handler for all proxied requests.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    req: Request,
) -> Result<Response, AppError> {
    let request_id = Uuid::new_v4();
    let ts = Utc::now();
    let start = Instant::now();

    let (parts, body) = req.into_parts();
    let method = parts.method;
    let uri = parts.uri;
    let req_headers = parts.headers;
    let path = uri.path().to_string();

    // -- 1. Buffer the inbound body (it feeds both the upstream request
    //       and the ingress-side field extraction) --
    let req_body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            tracing::error!("failed to read request body: {}", e);
            let mut rec = RequestRecord::new(request_id, ts, method.to_string(), path);
            rec.status_code = 502;
            rec.error_message = Some(e.to_string());
            rec.response_time_ms = start.elapsed().as_millis() as i64;
            state.writer.enqueue(jobs::insert_request(rec));
            return Err(AppError::RequestBody(e.to_string()));
        }
    };

    let parsed_req = ParsedRequest::from_body(&req_body);

    // -- 2. Forward upstream --
    let target_url = build_target_url(&state.config.upstream_url, uri.path(), uri.query());
    let upstream_headers = prepare_upstream_headers(&req_headers, &state.config.api_key);

    let resp = match state
        .upstream
        .forward(method.clone(), &target_url, upstream_headers, req_body.clone())
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(url = %target_url, "upstream request failed: {}", e);
            let mut rec = RequestRecord::new(request_id, ts, method.to_string(), path);
            rec.status_code = 502;
            rec.error_message = Some(e.to_string());
            rec.response_time_ms = start.elapsed().as_millis() as i64;
            state.writer.enqueue(jobs::insert_request(rec));
            return Err(e);
        }
    };

    let status = resp.status();
    let resp_headers = resp.headers().clone();
    let is_streaming = resp_headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("text/event-stream"));

    // -- 3. Initial request record (usage fields filled post-stream) --
    let mut rec = RequestRecord::new(request_id, ts, method.to_string(), path.clone());
    rec.status_code = status.as_u16() as i32;
    rec.success = status.as_u16() >= 200 && status.as_u16() < 400;
    rec.response_time_ms = start.elapsed().as_millis() as i64;
    rec.is_stream = is_streaming;
    rec.tool_count = parsed_req.tool_count;
    rec.thinking_budget_tokens = parsed_req.thinking_budget_tokens;
    state.writer.enqueue(jobs::insert_request(rec));

    let client_headers = prepare_client_headers(&resp_headers);

    if is_streaming {
        // Payload row goes in with an empty response body; the processor
        // fills it once the stream terminator lands.
        state.writer.enqueue(jobs::insert_payload(payload_record(
            request_id,
            ts,
            &req_headers,
            &resp_headers,
            &req_body,
            None,
            &parsed_req,
            None,
        )));

        let body = relay_stream(state.clone(), resp, request_id, ts, method.to_string(), path, start);
        return build_response(status, client_headers, body);
    }

    // -- 4. Non-streaming: buffer, relay, and hand off in-process --
    let resp_body = match resp.bytes().await {
        Ok(b) => b,
        Err(e) => {
            tracing::error!("failed to read response body: {}", e);
            return Err(AppError::Upstream(e.to_string()));
        }
    };

    let stop_sequence = serde_json::from_slice::<AnthropicResponse>(&resp_body)
        .ok()
        .and_then(|r| r.stop_sequence);

    state.processor.process_non_stream(request_id, ts, &resp_body);
    state.writer.enqueue(jobs::insert_payload(payload_record(
        request_id,
        ts,
        &req_headers,
        &resp_headers,
        &req_body,
        Some(&resp_body),
        &parsed_req,
        stop_sequence,
    )));

    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %uri.path(),
        status = status.as_u16(),
        stream = false,
        duration_ms = start.elapsed().as_millis() as u64,
        "proxied request"
    );

    build_response(status, client_headers, Body::from(resp_body))
}

/// Read-and-mirror relay for a streaming response. Each chunk is
/// published to the bus, then forwarded to the client; the terminator is
/// published on EOF, upstream error, or client disconnect, so the
/// processor always gets to flush what was captured.
fn relay_stream(
    state: Arc<AppState>,
    resp: reqwest::Response,
    request_id: Uuid,
    ts: DateTime<Utc>,
    method: String,
    path: String,
    start: Instant,
) -> Body {
    let status = resp.status().as_u16();
    let ts_nanos = ts.timestamp_nanos_opt().unwrap_or_default();
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(8);

    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        let subject = bus::chunk_subject(request_id);

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    state.bus.publish(subject.clone(), bytes.clone()).await;
                    if tx.send(Ok(bytes)).await.is_err() {
                        // Client went away; stop reading upstream but
                        // still terminate the bus stream below.
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx
                        .send(Err(std::io::Error::new(
                            std::io::ErrorKind::BrokenPipe,
                            e.to_string(),
                        )))
                        .await;
                    break;
                }
            }
        }

        state.bus.publish_done(request_id, ts_nanos).await;

        tracing::info!(
            request_id = %request_id,
            method = %method,
            path = %path,
            status = status,
            stream = true,
            duration_ms = start.elapsed().as_millis() as u64,
            "proxied request"
        );
    });

    Body::from_stream(ReceiverStream::new(rx))
}

fn build_response(
    status: axum::http::StatusCode,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let mut builder = Response::builder().status(status);
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }
    builder
        .body(body)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("response build failed: {}", e)))
}

#[allow(clippy::too_many_arguments)]
fn payload_record(
    request_id: Uuid,
    ts: DateTime<Utc>,
    req_headers: &HeaderMap,
    resp_headers: &HeaderMap,
    req_body: &[u8],
    resp_body: Option<&[u8]>,
    parsed: &ParsedRequest,
    stop_sequence: Option<String>,
) -> PayloadRecord {
    PayloadRecord {
        request_id,
        ts,
        request_headers: sanitize_headers(req_headers),
        response_headers: sanitize_headers(resp_headers),
        request_body: non_empty_lossy(req_body),
        response_body: resp_body.and_then(non_empty_lossy),
        system_prompt: (!parsed.system_prompt.is_empty()).then(|| parsed.system_prompt.clone()),
        max_tokens: (parsed.max_tokens != 0).then_some(parsed.max_tokens),
        temperature: parsed.temperature,
        top_p: parsed.top_p,
        message_count: (parsed.message_count != 0).then_some(parsed.message_count),
        stop_sequence,
    }
}

fn non_empty_lossy(bytes: &[u8]) -> Option<String> {
    (!bytes.is_empty()).then(|| String::from_utf8_lossy(bytes).into_owned())
}
