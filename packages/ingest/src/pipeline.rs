//! Per-dataset parse-and-write pass.
//!
//! Extraction is blocking (file reads, decompression, JSON parsing), so it
//! runs under `spawn_blocking` and hands fixed-size batches through a
//! bounded channel to the async [`BatchWriter`]. The dataset row records
//! the outcome: completed with its record count, or failed with the
//! captured error and its source file kept for a later retry.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use address_map_database::LocationStore;
use address_map_extract::{ExtractContext, ExtractError, ExtractStats, FieldKeyTable, LocationReader};
use address_map_ingest_models::ImportResult;
use address_map_location_models::{Dataset, DatasetStatus, NewLocation};
use tokio::sync::{Semaphore, mpsc};

use crate::IngestError;
use crate::progress::ProgressCallback;
use crate::writer::{BatchWriter, WriteStats};

/// Batches buffered between the reader thread and the writer.
const BATCH_CHANNEL_BUFFER: usize = 4;

/// Shared state for every dataset processed by one scheduler.
pub struct PipelineContext {
    /// Backing store.
    pub store: Arc<dyn LocationStore>,
    /// Property-key synonym table.
    pub keys: FieldKeyTable,
    /// Rows per upsert.
    pub batch_size: usize,
    /// Concurrent store writes shared by all workers.
    pub permits: Arc<Semaphore>,
    /// Receives the number of records written.
    pub progress: Arc<dyn ProgressCallback>,
}

/// Processes one dataset end to end.
///
/// Unless `claimed` is set (the caller already moved the row to
/// processing), the dataset is first claimed with a pending→processing
/// compare-and-swap.
///
/// # Errors
///
/// Returns [`IngestError::NotFound`] for an unknown id,
/// [`IngestError::Conflict`] if the dataset cannot be claimed, or the
/// error that failed the dataset.
pub async fn process_dataset(
    ctx: &PipelineContext,
    dataset_id: i64,
    claimed: bool,
    cancel: &Arc<AtomicBool>,
) -> Result<ImportResult, IngestError> {
    let start = Instant::now();
    let dataset = match ctx.store.get_dataset(dataset_id).await {
        Ok(Some(dataset)) => dataset,
        Ok(None) => return Err(IngestError::NotFound(dataset_id)),
        Err(e) => {
            if claimed {
                fail(ctx.store.as_ref(), dataset_id, &e.to_string()).await;
            }
            return Err(e.into());
        }
    };

    if !claimed
        && !ctx
            .store
            .transition_status(dataset_id, &[DatasetStatus::Pending], DatasetStatus::Processing)
            .await?
    {
        return Err(IngestError::Conflict {
            id: dataset_id,
            status: dataset.status,
        });
    }

    log::info!(
        "Processing dataset {dataset_id} ({}, {} bytes)",
        dataset.name,
        dataset.file_size
    );

    // From here on the row is processing; every error must move it to failed.
    match run_claimed(ctx, &dataset, cancel, start).await {
        Ok(result) => {
            if let Err(e) = tokio::fs::remove_file(&dataset.file_path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                log::warn!("Failed to remove {}: {e}", dataset.file_path);
            }

            log::info!(
                "Dataset {dataset_id} completed: {} records ({} new, {} duplicate, {} skipped) in {:.1}s",
                result.record_count,
                result.records_inserted,
                result.records_duplicate,
                result.records_skipped,
                result.duration.as_secs_f64()
            );
            Ok(result)
        }
        Err(e) => {
            fail(ctx.store.as_ref(), dataset_id, &e.to_string()).await;
            Err(e)
        }
    }
}

async fn run_claimed(
    ctx: &PipelineContext,
    dataset: &Dataset,
    cancel: &Arc<AtomicBool>,
    start: Instant,
) -> Result<ImportResult, IngestError> {
    let (read, written) = extract_and_write(ctx, dataset, cancel).await?;
    let result = ImportResult {
        dataset_id: dataset.id,
        features: read.features,
        record_count: read.accepted,
        records_inserted: written.inserted,
        records_duplicate: read.accepted.saturating_sub(written.inserted),
        records_skipped: read.skipped(),
        duration: start.elapsed(),
    };

    if !ctx.store.complete_dataset(dataset.id, result.record_count).await? {
        log::warn!(
            "Dataset {} changed while processing; not marking completed",
            dataset.id
        );
    }
    Ok(result)
}

/// Moves a job that will never run out of the queue's way: an unclaimed
/// pending dataset is claimed first so it can be failed and retried.
pub async fn abandon(store: &dyn LocationStore, dataset_id: i64, claimed: bool, reason: &str) {
    if !claimed {
        match store
            .transition_status(dataset_id, &[DatasetStatus::Pending], DatasetStatus::Processing)
            .await
        {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                log::error!("Failed to claim dataset {dataset_id} for abandonment: {e}");
                return;
            }
        }
    }
    fail(store, dataset_id, reason).await;
}

async fn fail(store: &dyn LocationStore, dataset_id: i64, message: &str) {
    log::warn!("Dataset {dataset_id} failed: {message}");
    if let Err(e) = store.fail_dataset(dataset_id, message).await {
        log::error!("Failed to record failure of dataset {dataset_id}: {e}");
    }
}

async fn extract_and_write(
    ctx: &PipelineContext,
    dataset: &Dataset,
    cancel: &Arc<AtomicBool>,
) -> Result<(ExtractStats, WriteStats), IngestError> {
    let batch_size = ctx.batch_size.max(1);
    let (tx, mut rx) = mpsc::channel::<Vec<NewLocation>>(BATCH_CHANNEL_BUFFER);

    let path = PathBuf::from(&dataset.file_path);
    let format = dataset.format;
    let keys = ctx.keys.clone();
    let extract_ctx = ExtractContext {
        region: dataset.region.clone(),
        sub_region: dataset.sub_region.clone(),
    };
    let cancel = Arc::clone(cancel);

    let reader = tokio::task::spawn_blocking(move || -> Result<ExtractStats, ExtractError> {
        let mut locations =
            LocationReader::open(&path, format, keys, extract_ctx)?.with_cancel(cancel);
        let mut batch = Vec::with_capacity(batch_size);

        for location in locations.by_ref() {
            batch.push(location?);
            if batch.len() >= batch_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                if tx.blocking_send(full).is_err() {
                    // Writer stopped; its error is reported instead.
                    break;
                }
            }
        }
        if !batch.is_empty() {
            tx.blocking_send(batch).ok();
        }
        Ok(locations.stats())
    });

    let mut writer = BatchWriter::new(Arc::clone(&ctx.store), Arc::clone(&ctx.permits), batch_size);
    let mut write_result = Ok(());
    while let Some(batch) = rx.recv().await {
        let count = batch.len() as u64;
        if let Err(e) = write_all(&mut writer, batch).await {
            write_result = Err(e);
            break;
        }
        ctx.progress.inc(count);
    }
    drop(rx);

    let read = reader
        .await
        .map_err(|e| IngestError::Task(e.to_string()))?;
    write_result?;
    let read = read?;
    let written = writer.finish().await?;

    Ok((read, written))
}

async fn write_all(writer: &mut BatchWriter, batch: Vec<NewLocation>) -> Result<(), IngestError> {
    for location in batch {
        writer.push(location).await?;
    }
    Ok(())
}
