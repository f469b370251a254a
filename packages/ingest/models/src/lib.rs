#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Ingestion configuration, progress events, and result types.

use std::path::PathBuf;
use std::time::Duration;

use address_map_location_models::Dataset;
use serde::{Deserialize, Serialize};

/// Default directory raw uploads are written to.
pub const DEFAULT_UPLOAD_DIR: &str = "data/uploads";

/// Default worker cap for both the storing and processing pools.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Default number of rows per upsert.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default number of concurrent store writes the pipeline may hold.
pub const DEFAULT_STORE_PERMITS: usize = 2;

/// Default request body limit (512 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Runtime configuration for the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Directory where raw uploaded files are stored.
    pub upload_dir: PathBuf,
    /// Maximum concurrently processed files/datasets.
    pub max_workers: usize,
    /// Rows accumulated before each upsert.
    pub batch_size: usize,
    /// Maximum concurrent store writes held by the pipeline.
    pub store_permits: usize,
    /// Maximum accepted request body size in bytes.
    pub max_upload_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            max_workers: DEFAULT_MAX_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            store_permits: DEFAULT_STORE_PERMITS,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl IngestConfig {
    /// Builds a configuration from `ADDRESS_MAP_*` environment variables,
    /// falling back to the defaults for unset or unparsable values.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            upload_dir: std::env::var("ADDRESS_MAP_UPLOAD_DIR")
                .map_or(defaults.upload_dir, PathBuf::from),
            max_workers: env_usize("ADDRESS_MAP_MAX_WORKERS", defaults.max_workers),
            batch_size: env_usize("ADDRESS_MAP_BATCH_SIZE", defaults.batch_size),
            store_permits: env_usize("ADDRESS_MAP_STORE_PERMITS", defaults.store_permits),
            max_upload_bytes: env_usize("ADDRESS_MAP_MAX_UPLOAD_BYTES", defaults.max_upload_bytes),
        }
    }
}

/// Reads a positive integer from `name`, or returns `default`.
fn env_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                log::warn!("Ignoring invalid {name}={raw:?}, using {default}");
                default
            }
        },
        Err(_) => default,
    }
}

/// Metadata supplied alongside uploaded files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadata {
    /// Display name for the dataset(s).
    pub name: String,
    /// Region code (e.g., `"OH"`).
    pub region: String,
    /// Sub-region label (e.g., `"Hamilton"`).
    pub sub_region: String,
    /// Authenticated actor performing the upload.
    pub uploaded_by: String,
}

/// One uploaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    /// Original client-side file name.
    pub filename: String,
    /// Raw file contents.
    pub bytes: Vec<u8>,
}

/// Outcome of processing one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    /// Dataset that was processed.
    pub dataset_id: i64,
    /// Features seen in the file.
    pub features: u64,
    /// Accepted features, stored as the dataset's `record_count`.
    pub record_count: u64,
    /// Newly inserted rows.
    pub records_inserted: u64,
    /// Accepted features whose hash already existed.
    pub records_duplicate: u64,
    /// Features skipped (bad geometry, malformed, or empty).
    pub records_skipped: u64,
    /// How long processing took.
    pub duration: Duration,
}

/// Terminal result for one file of a batch upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResult {
    /// Zero-based position of the file in the batch.
    pub file_index: usize,
    /// Original file name.
    pub filename: String,
    /// Resulting dataset, on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<Dataset>,
    /// Captured error, on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileResult {
    /// Whether this file succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate result of a batch upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    /// Identifier of the batch.
    pub batch_id: String,
    /// Files that succeeded.
    pub success_count: usize,
    /// Files that failed.
    pub fail_count: usize,
    /// Total files in the batch.
    pub total: usize,
    /// Per-file results, in submission order.
    pub results: Vec<FileResult>,
}

impl BatchSummary {
    /// Builds a summary from per-file results, sorting them by index.
    #[must_use]
    pub fn from_results(batch_id: String, mut results: Vec<FileResult>) -> Self {
        results.sort_by_key(|r| r.file_index);
        let success_count = results.iter().filter(|r| r.is_success()).count();
        let total = results.len();

        Self {
            batch_id,
            success_count,
            fail_count: total - success_count,
            total,
            results,
        }
    }
}

/// Lifecycle notification for an interactive batch upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// The batch was accepted.
    Start {
        /// Batch identifier.
        batch_id: String,
        /// Number of files in the batch.
        file_count: usize,
        /// Human-readable message.
        message: String,
    },
    /// A file has begun.
    Processing {
        /// Batch identifier.
        batch_id: String,
        /// Zero-based file index.
        file_index: usize,
        /// Original file name.
        filename: String,
    },
    /// A file finished successfully.
    FileSaved {
        /// Batch identifier.
        batch_id: String,
        /// Zero-based file index.
        file_index: usize,
        /// Original file name.
        filename: String,
        /// The resulting dataset.
        dataset: Box<Dataset>,
    },
    /// A file failed.
    FileError {
        /// Batch identifier.
        batch_id: String,
        /// Zero-based file index.
        file_index: usize,
        /// Original file name.
        filename: String,
        /// Captured error.
        error: String,
    },
    /// All raw files are stored and the import phase begins.
    ProcessingStarted {
        /// Batch identifier.
        batch_id: String,
        /// Datasets queued for import.
        dataset_count: usize,
    },
    /// Terminal aggregate counts; always the last event.
    Complete {
        /// Batch identifier.
        batch_id: String,
        /// Files that succeeded.
        success_count: usize,
        /// Files that failed.
        fail_count: usize,
        /// Total files in the batch.
        total: usize,
    },
}

impl ProgressEvent {
    /// The wire name of this event kind.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Processing { .. } => "processing",
            Self::FileSaved { .. } => "file_saved",
            Self::FileError { .. } => "file_error",
            Self::ProcessingStarted { .. } => "processing_started",
            Self::Complete { .. } => "complete",
        }
    }

    /// Whether this is the terminal event of a batch.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }

    /// Encodes the event as a server-sent-event frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be serialized.
    pub fn to_sse_frame(&self) -> Result<String, serde_json::Error> {
        let data = serde_json::to_string(self)?;
        Ok(format!("event: {}\ndata: {data}\n\n", self.event_type()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_frame_carries_type_and_payload() {
        let event = ProgressEvent::Start {
            batch_id: "b1".to_string(),
            file_count: 3,
            message: "Uploading 3 files".to_string(),
        };
        let frame = event.to_sse_frame().unwrap();

        assert!(frame.starts_with("event: start\ndata: {"));
        assert!(frame.ends_with("}\n\n"));
        assert!(frame.contains("\"type\":\"start\""));
        assert!(frame.contains("\"file_count\":3"));
    }

    #[test]
    fn event_type_matches_serde_tag() {
        let events = [
            ProgressEvent::ProcessingStarted {
                batch_id: "b".to_string(),
                dataset_count: 1,
            },
            ProgressEvent::FileError {
                batch_id: "b".to_string(),
                file_index: 0,
                filename: "a.geojson".to_string(),
                error: "boom".to_string(),
            },
            ProgressEvent::Complete {
                batch_id: "b".to_string(),
                success_count: 0,
                fail_count: 1,
                total: 1,
            },
        ];

        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.event_type());
        }
    }

    #[test]
    fn summary_counts_and_orders_results() {
        let results = vec![
            FileResult {
                file_index: 1,
                filename: "b.geojson".to_string(),
                dataset: None,
                error: Some("bad".to_string()),
            },
            FileResult {
                file_index: 0,
                filename: "a.geojson".to_string(),
                dataset: None,
                error: None,
            },
        ];
        let summary = BatchSummary::from_results("b".to_string(), results);

        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.fail_count, 1);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.results[0].filename, "a.geojson");
    }

    #[test]
    fn default_config_is_bounded() {
        let config = IngestConfig::default();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.batch_size, 1000);
        assert!(config.store_permits < config.max_workers);
    }
}
