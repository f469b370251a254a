//! Bounded worker pools.
//!
//! [`DatasetScheduler`] runs the heavy per-dataset pass on a fixed number
//! of tokio tasks draining a shared job queue. [`run_bounded`] is the
//! lighter per-file pool used while raw files are stored.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use address_map_ingest_models::ImportResult;
use futures::stream::{self, StreamExt as _};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::IngestError;
use crate::pipeline::{PipelineContext, abandon, process_dataset};

/// Jobs that may wait in the queue before `submit` applies backpressure.
const QUEUE_CAPACITY: usize = 1024;

type JobReply = oneshot::Sender<Result<ImportResult, IngestError>>;

struct Job {
    dataset_id: i64,
    claimed: bool,
    reply: JobReply,
}

/// Awaitable result of a submitted job.
///
/// Dropping the handle detaches the job; it still runs to completion.
pub struct JobHandle {
    dataset_id: i64,
    rx: oneshot::Receiver<Result<ImportResult, IngestError>>,
}

impl JobHandle {
    /// The dataset this job processes.
    #[must_use]
    pub const fn dataset_id(&self) -> i64 {
        self.dataset_id
    }

    /// Waits for the job to finish.
    ///
    /// # Errors
    ///
    /// Returns the job's error, or [`IngestError::Task`] if the worker
    /// went away without replying.
    pub async fn wait(self) -> Result<ImportResult, IngestError> {
        let dataset_id = self.dataset_id;
        self.rx.await.map_err(|_| {
            IngestError::Task(format!("worker dropped job for dataset {dataset_id}"))
        })?
    }
}

/// Fixed-size pool of dataset workers.
pub struct DatasetScheduler {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: Arc<AtomicBool>,
}

impl DatasetScheduler {
    /// Spawns `max_workers` workers (at least one) on the current runtime.
    #[must_use]
    pub fn start(ctx: Arc<PipelineContext>, max_workers: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(QUEUE_CAPACITY);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let cancel = Arc::new(AtomicBool::new(false));

        let workers = (0..max_workers.max(1))
            .map(|worker_id| {
                let ctx = Arc::clone(&ctx);
                let rx = Arc::clone(&rx);
                let cancel = Arc::clone(&cancel);
                tokio::spawn(async move { worker(worker_id, ctx, rx, cancel).await })
            })
            .collect();

        log::debug!("Started {} dataset workers", max_workers.max(1));

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            cancel,
        }
    }

    /// Queues a dataset for processing.
    ///
    /// Set `claimed` when the caller already moved the dataset to
    /// processing.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::ShutDown`] once the scheduler was shut down
    /// or cancelled.
    pub async fn submit(&self, dataset_id: i64, claimed: bool) -> Result<JobHandle, IngestError> {
        if self.is_cancelled() {
            return Err(IngestError::ShutDown);
        }

        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(IngestError::ShutDown)?;

        let (reply, rx) = oneshot::channel();
        tx.send(Job {
            dataset_id,
            claimed,
            reply,
        })
        .await
        .map_err(|_| IngestError::ShutDown)?;

        Ok(JobHandle { dataset_id, rx })
    }

    /// Stops dispatching queued jobs and interrupts in-flight datasets
    /// between records. Affected datasets are marked failed.
    pub fn cancel(&self) {
        log::info!("Cancelling dataset processing");
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Whether [`Self::cancel`] was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Stops accepting jobs, lets queued jobs drain, and waits for every
    /// worker to exit.
    pub async fn shutdown(&self) {
        drop(
            self.tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let workers =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in workers {
            if let Err(e) = handle.await {
                log::error!("Dataset worker panicked: {e}");
            }
        }
        log::debug!("Dataset workers stopped");
    }
}

async fn worker(
    worker_id: usize,
    ctx: Arc<PipelineContext>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    cancel: Arc<AtomicBool>,
) {
    loop {
        let job = rx.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };

        let result = if cancel.load(Ordering::Relaxed) {
            abandon(ctx.store.as_ref(), job.dataset_id, job.claimed, "cancelled").await;
            Err(IngestError::Cancelled)
        } else {
            log::trace!("Worker {worker_id} picked up dataset {}", job.dataset_id);
            process_dataset(&ctx, job.dataset_id, job.claimed, &cancel).await
        };

        // The submitter may have detached.
        job.reply.send(result).ok();
    }
}

/// Runs `f` over `items` with at most `min(cap, items.len())` futures in
/// flight. Results come back in completion order.
pub async fn run_bounded<T, F, Fut>(items: Vec<T>, cap: usize, f: F) -> Vec<Fut::Output>
where
    F: FnMut(T) -> Fut,
    Fut: Future,
{
    let limit = cap.min(items.len()).max(1);
    stream::iter(items.into_iter().map(f))
        .buffer_unordered(limit)
        .collect()
        .await
}
