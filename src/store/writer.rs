//! Batched write pipeline for analytics jobs.
//!
//! Many producers enqueue opaque jobs without ever blocking; a single
//! background worker drains them in batches sized by count or flush
//! interval. When the bounded intake is full the job is dropped with a
//! warning — analytics must never stall the hot request path.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A unit of work to execute against the store. Opaque to the writer:
/// inserts, updates and bulk loads all look the same.
pub type WriteJob<C> = Box<dyn FnOnce(C) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Bound on any single job's execution time.
const JOB_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub buffer_size: usize,
    pub batch_size: usize,
    pub flush_ms: u64,
}

/// Owns the worker task. Handlers get cloneable [`WriterHandle`]s;
/// `shutdown` closes the intake, flushes the residual batch and joins
/// the worker.
pub struct BatchWriter<C> {
    tx: mpsc::Sender<WriteJob<C>>,
    worker: JoinHandle<()>,
}

/// Non-blocking producer side of the writer.
pub struct WriterHandle<C> {
    tx: mpsc::Sender<WriteJob<C>>,
}

impl<C> Clone for WriterHandle<C> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<C: Clone + Send + Sync + 'static> BatchWriter<C> {
    pub fn new(ctx: C, config: WriterConfig) -> Self {
        let (handle, rx) = WriterHandle::channel(config.buffer_size);
        let worker = tokio::spawn(worker_loop(ctx, rx, config.batch_size.max(1), config.flush_ms));
        Self { tx: handle.tx, worker }
    }

    pub fn handle(&self) -> WriterHandle<C> {
        WriterHandle { tx: self.tx.clone() }
    }

    /// Close the intake and wait for the worker to drain and exit.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.worker.await {
            tracing::error!("batch writer worker panicked: {e}");
        }
    }
}

impl<C> WriterHandle<C> {
    /// A bare intake with no worker attached; the caller owns draining
    /// the receiving end. [`BatchWriter::new`] pairs this with its worker.
    pub fn channel(buffer_size: usize) -> (Self, mpsc::Receiver<WriteJob<C>>) {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        (Self { tx }, rx)
    }

    /// Hand a job to the worker. Never blocks; a full buffer sheds the job.
    pub fn enqueue(&self, job: WriteJob<C>) {
        use mpsc::error::TrySendError;
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => tracing::warn!("write queue full, dropping job"),
            Err(TrySendError::Closed(_)) => tracing::warn!("write queue closed, dropping job"),
        }
    }
}

async fn worker_loop<C: Clone + Send + Sync + 'static>(
    ctx: C,
    mut rx: mpsc::Receiver<WriteJob<C>>,
    batch_size: usize,
    flush_ms: u64,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(flush_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut batch: Vec<WriteJob<C>> = Vec::with_capacity(batch_size);

    loop {
        tokio::select! {
            job = rx.recv() => {
                match job {
                    Some(job) => {
                        batch.push(job);
                        if batch.len() >= batch_size {
                            flush(&ctx, &mut batch).await;
                        }
                    }
                    None => {
                        flush(&ctx, &mut batch).await;
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(&ctx, &mut batch).await;
                }
            }
        }
    }
}

/// Run every job in the batch. Failures and timeouts are logged and do
/// not abort the remainder.
async fn flush<C: Clone>(ctx: &C, batch: &mut Vec<WriteJob<C>>) {
    for job in batch.drain(..) {
        match tokio::time::timeout(JOB_TIMEOUT, job(ctx.clone())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("write job failed: {e}"),
            Err(_) => tracing::error!("write job timed out after {}s", JOB_TIMEOUT.as_secs()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    fn counting_job(counter: Arc<AtomicUsize>) -> WriteJob<()> {
        Box::new(move |_| {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    async fn wait_for(counter: &Arc<AtomicUsize>, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while counter.load(Ordering::SeqCst) < expected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("counter never reached expected value");
    }

    #[tokio::test]
    async fn test_flushes_when_batch_size_reached() {
        let counter = Arc::new(AtomicUsize::new(0));
        let writer = BatchWriter::new(
            (),
            WriterConfig { buffer_size: 16, batch_size: 3, flush_ms: 3_600_000 },
        );
        let handle = writer.handle();

        for _ in 0..3 {
            handle.enqueue(counting_job(counter.clone()));
        }

        // The flush interval is an hour; only the size threshold can fire.
        wait_for(&counter, 3).await;
        writer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_on_interval() {
        let counter = Arc::new(AtomicUsize::new(0));
        let writer = BatchWriter::new(
            (),
            WriterConfig { buffer_size: 16, batch_size: 100, flush_ms: 50 },
        );
        let handle = writer.handle();

        handle.enqueue(counting_job(counter.clone()));
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_overflow_jobs_dropped_queued_jobs_survive() {
        let counter = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());

        // batch_size 1 so the blocking job is flushed immediately and
        // pins the worker while the intake fills up.
        let writer = BatchWriter::new(
            (),
            WriterConfig { buffer_size: 2, batch_size: 1, flush_ms: 3_600_000 },
        );
        let handle = writer.handle();

        let started_tx = started.clone();
        let gate_rx = gate.clone();
        handle.enqueue(Box::new(move |_| {
            Box::pin(async move {
                started_tx.notify_one();
                gate_rx.notified().await;
                Ok(())
            })
        }));
        started.notified().await;

        // Worker is blocked mid-flush: the intake holds at most two jobs.
        for _ in 0..5 {
            handle.enqueue(counting_job(counter.clone()));
        }

        gate.notify_one();
        wait_for(&counter, 2).await;
        writer.shutdown().await;

        // Exactly the overflow was shed; nothing queued was lost.
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_residual_batch() {
        let counter = Arc::new(AtomicUsize::new(0));
        let writer = BatchWriter::new(
            (),
            WriterConfig { buffer_size: 64, batch_size: 100, flush_ms: 3_600_000 },
        );
        let handle = writer.handle();

        for _ in 0..7 {
            handle.enqueue(counting_job(counter.clone()));
        }

        writer.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_failed_job_does_not_abort_batch() {
        let counter = Arc::new(AtomicUsize::new(0));
        let writer = BatchWriter::new(
            (),
            WriterConfig { buffer_size: 16, batch_size: 100, flush_ms: 3_600_000 },
        );
        let handle = writer.handle();

        handle.enqueue(Box::new(|_| {
            Box::pin(async { Err(anyhow::anyhow!("simulated store failure")) })
        }));
        handle.enqueue(counting_job(counter.clone()));

        writer.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
