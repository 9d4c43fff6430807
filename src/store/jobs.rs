//! Write-job constructors for the analytics tables.
//!
//! Each constructor closes over a typed record and returns an opaque
//! [`WriteJob`] the batch writer can execute against the pool.

use sqlx::PgPool;

use crate::sse::SseEvent;
use crate::store::records::{PayloadRecord, RequestRecord, UsageUpdate};
use crate::store::writer::WriteJob;

fn nil_if_zero(v: i32) -> Option<i32> {
    (v != 0).then_some(v)
}

/// Insert the initial `requests` row.
pub fn insert_request(r: RequestRecord) -> WriteJob<PgPool> {
    Box::new(move |pool: PgPool| {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO requests (
                    id, ts, method, path, status_code, success, error_message,
                    response_time_ms, is_stream, model, message_id, stop_reason,
                    input_tokens, output_tokens, cache_read_tokens, cache_creation_tokens,
                    total_tokens, cost_usd, tokens_per_second, tool_count, thinking_budget_tokens
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21)"#,
            )
            .bind(r.id)
            .bind(r.ts)
            .bind(&r.method)
            .bind(&r.path)
            .bind(r.status_code)
            .bind(r.success)
            .bind(&r.error_message)
            .bind(r.response_time_ms)
            .bind(r.is_stream)
            .bind(&r.model)
            .bind(&r.message_id)
            .bind(&r.stop_reason)
            .bind(r.input_tokens)
            .bind(r.output_tokens)
            .bind(r.cache_read_tokens)
            .bind(r.cache_creation_tokens)
            .bind(r.total_tokens)
            .bind(r.cost_usd)
            .bind(r.tokens_per_second)
            .bind(nil_if_zero(r.tool_count))
            .bind(nil_if_zero(r.thinking_budget_tokens))
            .execute(&pool)
            .await?;
            Ok(())
        })
    })
}

/// Fill the usage fields of an existing `requests` row once the full
/// response has been observed. COALESCE keeps previously captured values
/// when the stream produced none.
pub fn update_request_usage(u: UsageUpdate) -> WriteJob<PgPool> {
    Box::new(move |pool: PgPool| {
        Box::pin(async move {
            sqlx::query(
                r#"
                UPDATE requests SET
                    model = COALESCE($1, model),
                    input_tokens = $2,
                    output_tokens = $3,
                    cache_read_tokens = $4,
                    cache_creation_tokens = $5,
                    total_tokens = $6,
                    cost_usd = $7,
                    tokens_per_second = $8,
                    stop_reason = COALESCE($9, stop_reason),
                    message_id = COALESCE($10, message_id),
                    success = TRUE
                WHERE id = $11 AND ts = $12"#,
            )
            .bind(&u.model)
            .bind(u.input_tokens)
            .bind(u.output_tokens)
            .bind(u.cache_read_tokens)
            .bind(u.cache_creation_tokens)
            .bind(u.total_tokens)
            .bind(u.cost_usd)
            .bind(u.tokens_per_second)
            .bind(&u.stop_reason)
            .bind(&u.message_id)
            .bind(u.request_id)
            .bind(u.ts)
            .execute(&pool)
            .await?;
            Ok(())
        })
    })
}

/// Insert the `request_payloads` row. For streaming requests the response
/// body starts empty and is filled by [`update_payload_response`].
pub fn insert_payload(p: PayloadRecord) -> WriteJob<PgPool> {
    Box::new(move |pool: PgPool| {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO request_payloads (
                    request_id, ts, request_headers, request_body, response_headers,
                    response_body, system_prompt, max_tokens, temperature, top_p,
                    message_count, stop_sequence
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)"#,
            )
            .bind(p.request_id)
            .bind(p.ts)
            .bind(&p.request_headers)
            .bind(&p.request_body)
            .bind(&p.response_headers)
            .bind(&p.response_body)
            .bind(&p.system_prompt)
            .bind(p.max_tokens)
            .bind(p.temperature)
            .bind(p.top_p)
            .bind(p.message_count)
            .bind(&p.stop_sequence)
            .execute(&pool)
            .await?;
            Ok(())
        })
    })
}

/// Attach the reconstructed response body to a payload row after stream
/// processing completes.
pub fn update_payload_response(
    request_id: uuid::Uuid,
    ts: chrono::DateTime<chrono::Utc>,
    response_body: String,
    stop_sequence: Option<String>,
) -> WriteJob<PgPool> {
    Box::new(move |pool: PgPool| {
        Box::pin(async move {
            sqlx::query(
                r#"
                UPDATE request_payloads
                SET response_body = $1,
                    stop_sequence = COALESCE($2, stop_sequence)
                WHERE request_id = $3 AND ts = $4"#,
            )
            .bind(&response_body)
            .bind(&stop_sequence)
            .bind(request_id)
            .bind(ts)
            .execute(&pool)
            .await?;
            Ok(())
        })
    })
}

/// Bulk-insert the SSE timeline of a request in one round trip.
pub fn insert_sse_events(
    request_id: uuid::Uuid,
    ts: chrono::DateTime<chrono::Utc>,
    events: Vec<SseEvent>,
) -> WriteJob<PgPool> {
    Box::new(move |pool: PgPool| {
        Box::pin(async move {
            let mut indices = Vec::with_capacity(events.len());
            let mut types = Vec::with_capacity(events.len());
            let mut data = Vec::with_capacity(events.len());
            let mut sizes = Vec::with_capacity(events.len());
            for ev in events {
                indices.push(ev.index);
                types.push(ev.event_type);
                data.push(ev.raw_data);
                sizes.push(ev.raw_bytes);
            }

            sqlx::query(
                r#"
                INSERT INTO sse_events (request_id, ts, event_index, event_type, data_json, raw_bytes)
                SELECT $1, $2, idx, typ, payload, size
                FROM UNNEST($3::int4[], $4::text[], $5::text[], $6::int4[])
                    AS t(idx, typ, payload, size)"#,
            )
            .bind(request_id)
            .bind(ts)
            .bind(&indices)
            .bind(&types)
            .bind(&data)
            .bind(&sizes)
            .execute(&pool)
            .await?;
            Ok(())
        })
    })
}
