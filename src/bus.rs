//! In-process event bus between the proxy and the stream processor.
//!
//! Work-queue semantics over a bounded channel: every message is delivered
//! to exactly one consumer, in publish order per producer. Subjects follow
//! the `sidekick.req.<request-id>` scheme, with a `.done` terminator after
//! the last chunk of each request. The terminator payload carries the
//! canonical request timestamp as `{"ts": <ns since epoch>}` so the
//! processor can restore the original wall-clock even if it consumes late.

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const SUBJECT_PREFIX: &str = "sidekick.req.";
pub const DONE_SUFFIX: &str = ".done";

/// Default intake capacity. Publishers await when the consumer lags this
/// far behind; the hot path sheds load at the batch writer, not here.
pub const DEFAULT_CAPACITY: usize = 65_536;

/// A single message on the bus: a raw body chunk or a terminator.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Bytes,
}

pub fn chunk_subject(request_id: Uuid) -> String {
    format!("{SUBJECT_PREFIX}{request_id}")
}

pub fn done_subject(request_id: Uuid) -> String {
    format!("{SUBJECT_PREFIX}{request_id}{DONE_SUFFIX}")
}

/// Parse a chunk or terminator subject back to its request id.
/// Returns `None` for foreign subjects or unparseable ids.
pub fn extract_request_id(subject: &str) -> Option<(Uuid, bool)> {
    let rest = subject.strip_prefix(SUBJECT_PREFIX)?;
    let (raw, done) = match rest.strip_suffix(DONE_SUFFIX) {
        Some(raw) => (raw, true),
        None => (rest, false),
    };
    Uuid::parse_str(raw).ok().map(|id| (id, done))
}

/// Publishing half of the bus, cloned into each request task.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<BusMessage>,
}

impl EventBus {
    pub async fn publish(&self, subject: String, payload: Bytes) {
        if self.tx.send(BusMessage { subject, payload }).await.is_err() {
            tracing::warn!("event bus closed, dropping message");
        }
    }

    /// Publish a terminator for `request_id` carrying the request timestamp.
    pub async fn publish_done(&self, request_id: Uuid, ts_nanos: i64) {
        let meta = serde_json::json!({ "ts": ts_nanos });
        self.publish(done_subject(request_id), Bytes::from(meta.to_string()))
            .await;
    }
}

/// Create the bus and its single consumer end.
pub fn channel(capacity: usize) -> (EventBus, mpsc::Receiver<BusMessage>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventBus { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_round_trip() {
        let id = Uuid::new_v4();

        assert_eq!(extract_request_id(&chunk_subject(id)), Some((id, false)));
        assert_eq!(extract_request_id(&done_subject(id)), Some((id, true)));
    }

    #[test]
    fn test_foreign_subjects_rejected() {
        assert_eq!(extract_request_id("sidekick.other"), None);
        assert_eq!(extract_request_id("sidekick.req.not-a-uuid"), None);
        assert_eq!(extract_request_id("sidekick.req.not-a-uuid.done"), None);
    }

    #[tokio::test]
    async fn test_chunks_delivered_before_terminator() {
        let (bus, mut rx) = channel(16);
        let id = Uuid::new_v4();

        bus.publish(chunk_subject(id), Bytes::from_static(b"one")).await;
        bus.publish(chunk_subject(id), Bytes::from_static(b"two")).await;
        bus.publish_done(id, 42).await;
        drop(bus);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let last = rx.recv().await.unwrap();
        assert!(rx.recv().await.is_none());

        assert_eq!(first.payload, Bytes::from_static(b"one"));
        assert_eq!(second.payload, Bytes::from_static(b"two"));
        assert_eq!(extract_request_id(&last.subject), Some((id, true)));

        let meta: serde_json::Value = serde_json::from_slice(&last.payload).unwrap();
        assert_eq!(meta["ts"], 42);
    }
}
