/// Bounded-concurrency job queue
///
/// The single admission-control point for heavy work (syncs and pipeline
/// runs). `submit` never blocks; a dispatcher task hands jobs out in FIFO
/// order, at most `max_concurrency` at a time. A job's error or panic is
/// logged and counted, never propagated. Queue contents live in memory only.

use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, Semaphore};

pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

type BoxedJob = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

struct QueuedJob {
    label: String,
    job: BoxedJob,
}

#[derive(Default)]
struct Counters {
    queued: AtomicUsize,
    running: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    idle: Notify,
}

impl Counters {
    fn is_idle(&self) -> bool {
        self.queued.load(Ordering::SeqCst) == 0 && self.running.load(Ordering::SeqCst) == 0
    }
}

/// Point-in-time queue counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub max_concurrency: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Cloneable handle to the queue
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::UnboundedSender<QueuedJob>,
    counters: Arc<Counters>,
    max_concurrency: usize,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").field("stats", &self.stats()).finish()
    }
}

impl JobQueue {
    /// Spawn the dispatcher; must be called inside a tokio runtime
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        let (sender, receiver) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        tokio::spawn(dispatch(receiver, counters.clone(), max_concurrency));
        tracing::info!("📬 Job queue started (max {} concurrent jobs)", max_concurrency);
        Self {
            sender,
            counters,
            max_concurrency,
        }
    }

    /// Enqueue a job without waiting for it to start
    pub fn submit<F>(&self, label: impl Into<String>, job: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let label = label.into();
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        let queued = QueuedJob {
            label,
            job: Box::pin(job),
        };
        if let Err(mpsc::error::SendError(rejected)) = self.sender.send(queued) {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            tracing::error!("❌ Job queue is shut down, dropping job '{}'", rejected.label);
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            max_concurrency: self.max_concurrency,
            queued: self.counters.queued.load(Ordering::SeqCst),
            running: self.counters.running.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }

    /// Resolve once nothing is queued or running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.counters.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.counters.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

async fn dispatch(mut receiver: mpsc::UnboundedReceiver<QueuedJob>, counters: Arc<Counters>, max_concurrency: usize) {
    let permits = Arc::new(Semaphore::new(max_concurrency));

    while let Some(QueuedJob { label, job }) = receiver.recv().await {
        // Waiting here, before taking the next job, keeps strict FIFO order
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        counters.running.fetch_add(1, Ordering::SeqCst);
        counters.queued.fetch_sub(1, Ordering::SeqCst);

        let counters = counters.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let started = std::time::Instant::now();
            tracing::debug!("▶️ Job '{}' started", label);

            // Inner spawn turns a panic into a JoinError instead of killing the slot
            match tokio::spawn(job).await {
                Ok(Ok(())) => {
                    counters.completed.fetch_add(1, Ordering::SeqCst);
                    tracing::info!("✅ Job '{}' finished in {:?}", label, started.elapsed());
                }
                Ok(Err(e)) => {
                    counters.failed.fetch_add(1, Ordering::SeqCst);
                    tracing::error!("❌ Job '{}' failed: {:#}", label, e);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::SeqCst);
                    tracing::error!("💥 Job '{}' panicked: {}", label, e);
                }
            }

            counters.running.fetch_sub(1, Ordering::SeqCst);
            if counters.is_idle() {
                counters.idle.notify_waiters();
            }
        });
    }
}
