#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Dataset ingestion: upload gateway, worker pools, batch writer, and the
//! dataset status lifecycle.
//!
//! [`Ingestor`] is the entry point. Uploads are validated and stored
//! synchronously, then handed to a [`DatasetScheduler`] whose workers
//! parse each file and upsert its locations in batches.

mod error;
pub mod gateway;
pub mod pipeline;
pub mod progress;
pub mod scheduler;
pub mod writer;

pub use error::IngestError;
pub use scheduler::{DatasetScheduler, JobHandle};

use std::sync::Arc;

use address_map_database::LocationStore;
use address_map_extract::FieldKeyTable;
use address_map_ingest_models::{
    BatchSummary, FileResult, IngestConfig, ProgressEvent, UploadFile, UploadMetadata,
};
use address_map_location_models::{
    Dataset, DatasetFilter, DatasetStats, DatasetStatus, Page, SourceFormat,
};
use futures::stream::{FuturesUnordered, StreamExt as _};
use tokio::sync::{Semaphore, mpsc};

use crate::pipeline::{PipelineContext, abandon};
use crate::progress::{EventSink, ProgressCallback, null_progress};
use crate::scheduler::run_bounded;

/// Outcome of storing one file of an upload: `(index, filename, result)`.
type StoredFile = (usize, String, Result<Dataset, IngestError>);

/// Upload, processing, and lifecycle operations over a [`LocationStore`].
pub struct Ingestor {
    store: Arc<dyn LocationStore>,
    config: IngestConfig,
    scheduler: DatasetScheduler,
}

impl Ingestor {
    /// Creates an ingestor and starts its worker pool.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(store: Arc<dyn LocationStore>, config: IngestConfig, keys: FieldKeyTable) -> Self {
        Self::with_progress(store, config, keys, null_progress())
    }

    /// Like [`Self::new`], reporting written records to `progress`.
    #[must_use]
    pub fn with_progress(
        store: Arc<dyn LocationStore>,
        config: IngestConfig,
        keys: FieldKeyTable,
        progress: Arc<dyn ProgressCallback>,
    ) -> Self {
        let ctx = Arc::new(PipelineContext {
            store: Arc::clone(&store),
            keys,
            batch_size: config.batch_size,
            permits: Arc::new(Semaphore::new(config.store_permits.max(1))),
            progress,
        });
        let scheduler = DatasetScheduler::start(ctx, config.max_workers);

        Self {
            store,
            config,
            scheduler,
        }
    }

    /// The backing store.
    #[must_use]
    pub const fn store(&self) -> &Arc<dyn LocationStore> {
        &self.store
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Stores a single file and queues it for processing.
    ///
    /// Returns the pending dataset immediately.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Validation`] before anything is written, or
    /// the error that prevented storing or queueing the file.
    pub async fn upload(
        &self,
        metadata: &UploadMetadata,
        file: UploadFile,
    ) -> Result<Dataset, IngestError> {
        let (dataset, _detached) = self.upload_with_handle(metadata, file).await?;
        Ok(dataset)
    }

    /// Like [`Self::upload`], also returning a handle to await processing.
    ///
    /// # Errors
    ///
    /// See [`Self::upload`].
    pub async fn upload_with_handle(
        &self,
        metadata: &UploadMetadata,
        file: UploadFile,
    ) -> Result<(Dataset, JobHandle), IngestError> {
        let formats = gateway::validate(metadata, std::slice::from_ref(&file))?;
        gateway::ensure_upload_dir(&self.config.upload_dir).await?;

        let name = gateway::display_name(metadata, &file.filename, 1);
        let dataset = gateway::store_upload(
            self.store.as_ref(),
            &self.config.upload_dir,
            metadata,
            name,
            &file,
            formats[0],
        )
        .await?;

        let handle = self.submit(dataset.id, false).await?;
        Ok((dataset, handle))
    }

    /// Stores a single file and waits until it has been processed.
    ///
    /// # Errors
    ///
    /// Returns the upload error or the error that failed the dataset.
    pub async fn upload_and_process(
        &self,
        metadata: &UploadMetadata,
        file: UploadFile,
    ) -> Result<Dataset, IngestError> {
        let (dataset, handle) = self.upload_with_handle(metadata, file).await?;
        handle.wait().await?;
        self.get(dataset.id).await
    }

    /// Stores several files and queues each for processing.
    ///
    /// Per-file storage failures are reported in the summary without
    /// affecting the other files. Successful entries carry the pending
    /// dataset.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Validation`] or a fatal setup error before
    /// any file is stored.
    pub async fn upload_batch(
        &self,
        metadata: &UploadMetadata,
        files: Vec<UploadFile>,
    ) -> Result<BatchSummary, IngestError> {
        let formats = gateway::validate(metadata, &files)?;
        gateway::ensure_upload_dir(&self.config.upload_dir).await?;

        let batch_id = uuid::Uuid::new_v4().to_string();
        let mut results = Vec::with_capacity(files.len());

        for (file_index, filename, stored) in self.store_files(metadata, files, formats, None).await
        {
            let outcome = match stored {
                Ok(dataset) => self.submit(dataset.id, false).await.map(|_detached| dataset),
                Err(e) => Err(e),
            };
            results.push(file_result(file_index, filename, outcome));
        }

        let summary = BatchSummary::from_results(batch_id, results);
        log::info!(
            "Batch {}: {} stored, {} failed",
            summary.batch_id,
            summary.success_count,
            summary.fail_count
        );
        Ok(summary)
    }

    /// Stores and processes several files, reporting lifecycle events.
    ///
    /// Validation and upload directory setup happen before this returns;
    /// the rest runs on a detached task that keeps going if the receiver
    /// is dropped. The stream always ends with one
    /// [`ProgressEvent::Complete`].
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Validation`] or a fatal setup error before
    /// any file is stored.
    pub async fn upload_batch_streaming(
        self: &Arc<Self>,
        metadata: UploadMetadata,
        files: Vec<UploadFile>,
    ) -> Result<mpsc::UnboundedReceiver<ProgressEvent>, IngestError> {
        let formats = gateway::validate(&metadata, &files)?;
        gateway::ensure_upload_dir(&self.config.upload_dir).await?;

        let (sink, rx) = EventSink::channel();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_streaming_batch(&metadata, files, formats, &sink)
                .await;
        });

        Ok(rx)
    }

    async fn run_streaming_batch(
        &self,
        metadata: &UploadMetadata,
        files: Vec<UploadFile>,
        formats: Vec<SourceFormat>,
        sink: &EventSink,
    ) -> BatchSummary {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let total = files.len();

        sink.emit(ProgressEvent::Start {
            batch_id: batch_id.clone(),
            file_count: total,
            message: format!("Received {total} file(s)"),
        });

        let mut results = Vec::with_capacity(total);
        let mut stored_ok = Vec::with_capacity(total);
        for (file_index, filename, stored) in self
            .store_files(metadata, files, formats, Some((sink, &batch_id)))
            .await
        {
            match stored {
                Ok(dataset) => stored_ok.push((file_index, filename, dataset)),
                Err(e) => {
                    let result = file_result(file_index, filename, Err(e));
                    sink.emit(terminal_event(&batch_id, &result));
                    results.push(result);
                }
            }
        }

        sink.emit(ProgressEvent::ProcessingStarted {
            batch_id: batch_id.clone(),
            dataset_count: stored_ok.len(),
        });

        let mut running = stored_ok
            .into_iter()
            .map(|(file_index, filename, dataset)| async move {
                let outcome = self.import(dataset.id).await;
                (file_index, filename, outcome)
            })
            .collect::<FuturesUnordered<_>>();

        while let Some((file_index, filename, outcome)) = running.next().await {
            let result = file_result(file_index, filename, outcome);
            sink.emit(terminal_event(&batch_id, &result));
            results.push(result);
        }

        let summary = BatchSummary::from_results(batch_id, results);
        sink.emit(ProgressEvent::Complete {
            batch_id: summary.batch_id.clone(),
            success_count: summary.success_count,
            fail_count: summary.fail_count,
            total: summary.total,
        });
        log::info!(
            "Batch {}: {} succeeded, {} failed",
            summary.batch_id,
            summary.success_count,
            summary.fail_count
        );
        summary
    }

    /// Writes every file concurrently (bounded by `max_workers`) and
    /// creates its dataset row.
    async fn store_files(
        &self,
        metadata: &UploadMetadata,
        files: Vec<UploadFile>,
        formats: Vec<SourceFormat>,
        events: Option<(&EventSink, &str)>,
    ) -> Vec<StoredFile> {
        let file_count = files.len();
        let jobs: Vec<_> = files.into_iter().zip(formats).enumerate().collect();

        run_bounded(
            jobs,
            self.config.max_workers,
            |(file_index, (file, format))| async move {
                if let Some((sink, batch_id)) = events {
                    sink.emit(ProgressEvent::Processing {
                        batch_id: batch_id.to_string(),
                        file_index,
                        filename: file.filename.clone(),
                    });
                }

                let name = gateway::display_name(metadata, &file.filename, file_count);
                let stored = gateway::store_upload(
                    self.store.as_ref(),
                    &self.config.upload_dir,
                    metadata,
                    name,
                    &file,
                    format,
                )
                .await;
                if let Err(e) = &stored {
                    log::warn!("Failed to store {}: {e}", file.filename);
                }

                (file_index, file.filename, stored)
            },
        )
        .await
    }

    /// Queues a dataset and waits for it, returning the final row.
    async fn import(&self, dataset_id: i64) -> Result<Dataset, IngestError> {
        self.submit(dataset_id, false).await?.wait().await?;
        self.get(dataset_id).await
    }

    /// Queues a dataset, failing it if the pool no longer accepts work.
    async fn submit(&self, dataset_id: i64, claimed: bool) -> Result<JobHandle, IngestError> {
        match self.scheduler.submit(dataset_id, claimed).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                abandon(self.store.as_ref(), dataset_id, claimed, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Lists datasets.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Persistence`] if the store query fails.
    pub async fn list(&self, filter: &DatasetFilter) -> Result<Page<Dataset>, IngestError> {
        Ok(self.store.list_datasets(filter).await?)
    }

    /// Fetches one dataset.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::NotFound`] for an unknown id.
    pub async fn get(&self, id: i64) -> Result<Dataset, IngestError> {
        self.store
            .get_dataset(id)
            .await?
            .ok_or(IngestError::NotFound(id))
    }

    /// Aggregate dataset counters.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Persistence`] if the store query fails.
    pub async fn stats(&self) -> Result<DatasetStats, IngestError> {
        Ok(self.store.dataset_stats().await?)
    }

    /// Deletes a dataset row and any remaining raw file, whatever its
    /// status.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::NotFound`] for an unknown id.
    pub async fn delete(&self, id: i64) -> Result<Dataset, IngestError> {
        let dataset = self
            .store
            .delete_dataset(id)
            .await?
            .ok_or(IngestError::NotFound(id))?;

        match tokio::fs::remove_file(&dataset.file_path).await {
            Ok(()) => log::info!("Deleted dataset {id} and {}", dataset.file_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("Deleted dataset {id}");
            }
            Err(e) => log::warn!("Deleted dataset {id} but not {}: {e}", dataset.file_path),
        }

        Ok(dataset)
    }

    /// Re-runs processing of a completed or failed dataset from its stored
    /// file, returning the dataset in its processing state.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::NotFound`], [`IngestError::Conflict`] when
    /// the dataset is pending or processing, or
    /// [`IngestError::SourceMissing`] when its file is gone.
    pub async fn reprocess(&self, id: i64) -> Result<Dataset, IngestError> {
        let (dataset, _detached) = self.reprocess_with_handle(id).await?;
        Ok(dataset)
    }

    /// Like [`Self::reprocess`], also returning a handle to await the run.
    ///
    /// # Errors
    ///
    /// See [`Self::reprocess`].
    pub async fn reprocess_with_handle(&self, id: i64) -> Result<(Dataset, JobHandle), IngestError> {
        let dataset = self.get(id).await?;
        if !dataset.status.can_reprocess() {
            return Err(IngestError::Conflict {
                id,
                status: dataset.status,
            });
        }

        if !tokio::fs::try_exists(&dataset.file_path)
            .await
            .unwrap_or(false)
        {
            return Err(IngestError::SourceMissing {
                id,
                path: dataset.file_path,
            });
        }

        if !self
            .store
            .transition_status(id, DatasetStatus::REPROCESSABLE, DatasetStatus::Processing)
            .await?
        {
            let status = self.get(id).await?.status;
            return Err(IngestError::Conflict { id, status });
        }

        log::info!("Reprocessing dataset {id} from {}", dataset.file_path);
        let claimed = self.get(id).await?;
        let handle = self.submit(id, true).await?;
        Ok((claimed, handle))
    }

    /// Stops dispatching queued datasets and interrupts in-flight ones.
    pub fn cancel(&self) {
        self.scheduler.cancel();
    }

    /// Drains queued work and stops the worker pool.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

fn file_result(
    file_index: usize,
    filename: String,
    outcome: Result<Dataset, IngestError>,
) -> FileResult {
    match outcome {
        Ok(dataset) => FileResult {
            file_index,
            filename,
            dataset: Some(dataset),
            error: None,
        },
        Err(e) => FileResult {
            file_index,
            filename,
            dataset: None,
            error: Some(e.to_string()),
        },
    }
}

fn terminal_event(batch_id: &str, result: &FileResult) -> ProgressEvent {
    match (&result.dataset, &result.error) {
        (Some(dataset), None) => ProgressEvent::FileSaved {
            batch_id: batch_id.to_string(),
            file_index: result.file_index,
            filename: result.filename.clone(),
            dataset: Box::new(dataset.clone()),
        },
        (_, error) => ProgressEvent::FileError {
            batch_id: batch_id.to_string(),
            file_index: result.file_index,
            filename: result.filename.clone(),
            error: error.clone().unwrap_or_default(),
        },
    }
}
