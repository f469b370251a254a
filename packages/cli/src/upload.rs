//! Client for `POST /api/datasets`.
//!
//! Each file is sent as a streamed body so byte progress can be observed.
//! A transfer that makes no progress for the stall interval is aborted and
//! retried with exponential backoff. Waiting for the response counts
//! against the same interval.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use address_map_ingest::progress::ProgressCallback;
use address_map_ingest_models::UploadMetadata;
use address_map_server::ACTOR_HEADER;
use address_map_server_models::{ApiDataset, ApiError};
use futures::StreamExt as _;
use reqwest::StatusCode;

const CHUNK_SIZE: usize = 64 * 1024;
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Base delay before the first retry; doubles on every further attempt.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(2);

/// Errors from uploading one file.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The local file could not be read.
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        /// File being uploaded.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The path has no usable file name.
    #[error("{} has no file name", .0.display())]
    InvalidPath(PathBuf),

    /// Connection or protocol failure.
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// No bytes moved for the whole stall interval.
    #[error("Transfer stalled: no progress for {0:?}")]
    Stalled(Duration),

    /// 5xx or 429 from the server.
    #[error("Server error {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Error message from the response body.
        message: String,
    },

    /// Any other non-success status. Not retried.
    #[error("Upload rejected ({status}): {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Error message from the response body.
        message: String,
    },
}

impl UploadError {
    /// Whether another attempt could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => !e.is_decode() && !e.is_builder(),
            Self::Stalled(_) | Self::Server { .. } => true,
            Self::Io { .. } | Self::InvalidPath(_) | Self::Rejected { .. } => false,
        }
    }
}

/// Connection and retry settings.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Server base URL, e.g. `http://localhost:8080`.
    pub server: String,
    /// Abort a transfer after this long without progress.
    pub stall: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub backoff: Duration,
}

/// Delay before retry number `attempt` (zero-based): `base * 2^attempt`,
/// capped at one minute.
#[must_use]
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16)).min(MAX_BACKOFF)
}

/// Tracks when a byte counter last moved.
#[derive(Debug, Clone, Copy)]
pub struct StallTracker {
    last_bytes: u64,
    last_change: Instant,
    stall: Duration,
}

impl StallTracker {
    #[must_use]
    pub const fn new(stall: Duration, now: Instant) -> Self {
        Self {
            last_bytes: 0,
            last_change: now,
            stall,
        }
    }

    /// Records the counter value seen at `now`; returns `true` once it has
    /// not changed for the stall interval.
    pub fn observe(&mut self, bytes: u64, now: Instant) -> bool {
        if bytes != self.last_bytes {
            self.last_bytes = bytes;
            self.last_change = now;
            return false;
        }
        now.duration_since(self.last_change) >= self.stall
    }
}

fn poll_interval(stall: Duration) -> Duration {
    (stall / 4).clamp(Duration::from_millis(10), Duration::from_secs(1))
}

/// Resolves once `sent` has not moved for `stall`.
async fn watch_stall(sent: &AtomicU64, stall: Duration) {
    let mut ticker = tokio::time::interval(poll_interval(stall));
    let mut tracker = StallTracker::new(stall, Instant::now());
    loop {
        ticker.tick().await;
        if tracker.observe(sent.load(Ordering::Relaxed), Instant::now()) {
            return;
        }
    }
}

fn status_error(status: StatusCode, body: &str) -> UploadError {
    let message = serde_json::from_str::<ApiError>(body)
        .map_or_else(|_| body.trim().to_string(), |e| e.error);

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        UploadError::Server {
            status: status.as_u16(),
            message,
        }
    } else {
        UploadError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

async fn exchange(request: reqwest::RequestBuilder) -> Result<ApiDataset, UploadError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<ApiDataset>().await?);
    }

    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

/// Uploads files to a running server one at a time.
pub struct UploadClient {
    client: reqwest::Client,
    options: UploadOptions,
}

impl UploadClient {
    #[must_use]
    pub fn new(options: UploadOptions) -> Self {
        Self {
            client: reqwest::Client::new(),
            options,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/datasets", self.options.server.trim_end_matches('/'))
    }

    /// Reads and uploads one file.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError`] if the file cannot be read or every attempt
    /// failed.
    pub async fn upload_file(
        &self,
        path: &Path,
        metadata: &UploadMetadata,
        progress: &Arc<dyn ProgressCallback>,
    ) -> Result<ApiDataset, UploadError> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| UploadError::InvalidPath(path.to_path_buf()))?
            .to_string();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| UploadError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        self.upload_bytes(&filename, Arc::new(bytes), metadata, progress)
            .await
    }

    /// Uploads in-memory contents under `filename`, retrying stalled and
    /// transient failures.
    ///
    /// # Errors
    ///
    /// Returns the last [`UploadError`] once retries are exhausted, or the
    /// first one that is not retryable.
    pub async fn upload_bytes(
        &self,
        filename: &str,
        bytes: Arc<Vec<u8>>,
        metadata: &UploadMetadata,
        progress: &Arc<dyn ProgressCallback>,
    ) -> Result<ApiDataset, UploadError> {
        let mut attempt = 0;
        loop {
            match self
                .send_once(filename, Arc::clone(&bytes), metadata, progress)
                .await
            {
                Ok(dataset) => return Ok(dataset),
                Err(e) if e.is_retryable() && attempt < self.options.max_retries => {
                    let delay = backoff_delay(self.options.backoff, attempt);
                    log::warn!(
                        "Upload of {filename} failed (attempt {}/{}), retrying in {delay:?}: {e}",
                        attempt + 1,
                        self.options.max_retries + 1,
                    );
                    progress.set_message(format!("{filename} (retry {})", attempt + 1));
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(
        &self,
        filename: &str,
        bytes: Arc<Vec<u8>>,
        metadata: &UploadMetadata,
        progress: &Arc<dyn ProgressCallback>,
    ) -> Result<ApiDataset, UploadError> {
        let sent = Arc::new(AtomicU64::new(0));
        let len = bytes.len();
        progress.set_total(len as u64);

        let body = {
            let sent = Arc::clone(&sent);
            let progress = Arc::clone(progress);
            futures::stream::iter((0..len).step_by(CHUNK_SIZE)).map(move |start| {
                let chunk = bytes[start..(start + CHUNK_SIZE).min(len)].to_vec();
                let size = chunk.len() as u64;
                let total = sent.fetch_add(size, Ordering::Relaxed) + size;
                progress.set_position(total);
                Ok::<_, std::io::Error>(chunk)
            })
        };

        let request = self
            .client
            .post(self.endpoint())
            .query(&[
                ("name", metadata.name.as_str()),
                ("region", metadata.region.as_str()),
                ("subRegion", metadata.sub_region.as_str()),
                ("filename", filename),
            ])
            .header(ACTOR_HEADER, metadata.uploaded_by.as_str())
            .body(reqwest::Body::wrap_stream(body));

        tokio::select! {
            result = exchange(request) => result,
            () = watch_stall(&sent, self.options.stall) => {
                log::warn!("Upload of {filename} stalled at {} of {len} bytes", sent.load(Ordering::Relaxed));
                Err(UploadError::Stalled(self.options.stall))
            }
        }
    }
}
