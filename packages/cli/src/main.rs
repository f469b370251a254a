#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Command-line entry point for the address map toolchain.
//!
//! Runs the API server, applies migrations, ingests files straight into the
//! configured store, uploads files to a running server, or reprocesses an
//! existing dataset.

mod upload;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use address_map_cli_utils::{IndicatifProgress, MultiProgress};
use address_map_extract::FieldKeyTable;
use address_map_ingest::{IngestError, Ingestor, gateway};
use address_map_ingest_models::{IngestConfig, UploadFile, UploadMetadata};
use clap::{Args, Parser, Subcommand};

use crate::upload::{DEFAULT_BACKOFF, UploadClient, UploadOptions};

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "address_map_cli", about = "Address map ingestion and search toolchain")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct DatasetArgs {
    /// Display name; suffixed with the file stem when several files are given
    #[arg(long)]
    name: String,

    /// Region code (e.g., OH)
    #[arg(long)]
    region: String,

    /// Sub-region label (e.g., Hamilton)
    #[arg(long)]
    sub_region: String,

    /// Actor recorded as the uploader
    #[arg(long, default_value = "cli")]
    actor: String,
}

impl DatasetArgs {
    fn metadata(self) -> UploadMetadata {
        UploadMetadata {
            name: self.name,
            region: self.region,
            sub_region: self.sub_region,
            uploaded_by: self.actor,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API server
    Serve,

    /// Apply pending database migrations
    Migrate,

    /// Ingest files directly into the configured store and wait for them
    Ingest {
        /// Point-feature files (.geojson, .json, .geojsonl, .ndjson, optionally .gz)
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        dataset: DatasetArgs,
    },

    /// Upload files to a running server, one at a time
    Upload {
        /// Files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Server base URL
        #[arg(long, default_value = "http://localhost:8080")]
        server: String,

        #[command(flatten)]
        dataset: DatasetArgs,

        /// Abort and retry a transfer after this many seconds without progress
        #[arg(long, default_value_t = 30)]
        stall_secs: u64,

        /// Retries per file after the first attempt
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
    },

    /// Re-run processing for a pending or failed dataset
    Reprocess {
        /// Dataset ID
        id: i64,
    },
}

fn block_on(future: impl Future<Output = CliResult>) -> CliResult {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(future)
}

fn main() -> CliResult {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => {
            pretty_env_logger::init_custom_env("RUST_LOG");
            actix_web::rt::System::new().block_on(address_map_server::run_server())
        }
        Commands::Migrate => {
            let _multi = address_map_cli_utils::init_logger();
            block_on(migrate())
        }
        Commands::Ingest { files, dataset } => {
            let multi = address_map_cli_utils::init_logger();
            block_on(ingest(files, dataset.metadata(), multi))
        }
        Commands::Upload {
            files,
            server,
            dataset,
            stall_secs,
            max_retries,
        } => {
            let multi = address_map_cli_utils::init_logger();
            let options = UploadOptions {
                server,
                stall: Duration::from_secs(stall_secs.max(1)),
                max_retries,
                backoff: DEFAULT_BACKOFF,
            };
            block_on(upload(files, dataset.metadata(), options, multi))
        }
        Commands::Reprocess { id } => {
            let _multi = address_map_cli_utils::init_logger();
            block_on(reprocess(id))
        }
    }
}

async fn migrate() -> CliResult {
    log::info!("Connecting to database...");
    let db = address_map_database::db::connect_from_env().await?;
    address_map_database::run_migrations(db.as_ref()).await?;
    log::info!("Migrations applied");
    Ok(())
}

async fn open_ingestor(
    progress: Option<Arc<dyn address_map_ingest::progress::ProgressCallback>>,
) -> Result<Ingestor, Box<dyn std::error::Error>> {
    let store = address_map_database::db::open_store_from_env().await?;
    let keys = FieldKeyTable::from_env()?;
    let config = IngestConfig::from_env();

    Ok(match progress {
        Some(progress) => Ingestor::with_progress(store, config, keys, progress),
        None => Ingestor::new(store, config, keys),
    })
}

async fn read_upload_file(path: &Path) -> Result<UploadFile, IngestError> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| IngestError::Validation(format!("{} has no file name", path.display())))?
        .to_string();
    let bytes = tokio::fs::read(path).await.map_err(|source| IngestError::Io {
        path: path.display().to_string(),
        source,
    })?;

    Ok(UploadFile { filename, bytes })
}

/// Metadata for one file of a multi-file command, named the way the batch
/// endpoint names its files.
fn file_metadata(metadata: &UploadMetadata, filename: &str, file_count: usize) -> UploadMetadata {
    UploadMetadata {
        name: gateway::display_name(metadata, filename, file_count),
        ..metadata.clone()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .map_or_else(|| path.display().to_string(), str::to_string)
}

fn failures(failed: usize, total: usize) -> CliResult {
    if failed > 0 {
        return Err(format!("{failed} of {total} files failed").into());
    }
    Ok(())
}

async fn ingest(files: Vec<PathBuf>, metadata: UploadMetadata, multi: MultiProgress) -> CliResult {
    let records = IndicatifProgress::records_bar(&multi, "Writing records");
    let ingestor = open_ingestor(Some(Arc::clone(&records))).await?;
    let overall = IndicatifProgress::files_bar(&multi, "Ingesting", files.len() as u64);

    let mut failed = 0;
    for path in &files {
        let result = async {
            let file = read_upload_file(path).await?;
            let meta = file_metadata(&metadata, &file.filename, files.len());
            ingestor.upload_and_process(&meta, file).await
        }
        .await;

        match result {
            Ok(dataset) => log::info!(
                "{} -> dataset {} ({} records)",
                path.display(),
                dataset.id,
                dataset.record_count.unwrap_or(0)
            ),
            Err(e) => {
                failed += 1;
                log::error!("Failed to ingest {}: {e}", path.display());
            }
        }
        overall.inc(1);
    }

    records.finish_and_clear();
    overall.finish(format!("Ingested {} of {} files", files.len() - failed, files.len()));
    ingestor.shutdown().await;

    failures(failed, files.len())
}

async fn upload(
    files: Vec<PathBuf>,
    metadata: UploadMetadata,
    options: UploadOptions,
    multi: MultiProgress,
) -> CliResult {
    log::info!("Uploading {} file(s) to {}", files.len(), options.server);
    let client = UploadClient::new(options);
    let overall = IndicatifProgress::files_bar(&multi, "Uploading", files.len() as u64);

    let mut failed = 0;
    for path in &files {
        let name = file_name(path);
        let bar = IndicatifProgress::bytes_bar(&multi, &name);
        let meta = file_metadata(&metadata, &name, files.len());

        match client.upload_file(path, &meta, &bar).await {
            Ok(dataset) => {
                bar.finish(format!("{name} -> dataset {} ({})", dataset.id, dataset.status));
            }
            Err(e) => {
                failed += 1;
                bar.finish(format!("{name} failed"));
                log::error!("Failed to upload {}: {e}", path.display());
            }
        }
        overall.inc(1);
    }

    overall.finish(format!("Uploaded {} of {} files", files.len() - failed, files.len()));

    failures(failed, files.len())
}

async fn reprocess(id: i64) -> CliResult {
    let ingestor = open_ingestor(None).await?;

    let result = async {
        let (dataset, handle) = ingestor.reprocess_with_handle(id).await?;
        log::info!("Reprocessing dataset {} ({})", dataset.id, dataset.name);
        handle.wait().await
    }
    .await;
    ingestor.shutdown().await;

    let result = result?;
    log::info!(
        "Dataset {id}: {} records ({} new, {} duplicate, {} skipped) in {:.1}s",
        result.record_count,
        result.records_inserted,
        result.records_duplicate,
        result.records_skipped,
        result.duration.as_secs_f64(),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    fn metadata() -> UploadMetadata {
        UploadMetadata {
            name: "Ohio".to_string(),
            region: "OH".to_string(),
            sub_region: "Adams".to_string(),
            uploaded_by: "cli".to_string(),
        }
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn upload_defaults() {
        let cli = Cli::try_parse_from([
            "address_map_cli",
            "upload",
            "a.geojson",
            "b.ndjson.gz",
            "--name",
            "Ohio",
            "--region",
            "OH",
            "--sub-region",
            "Adams",
        ])
        .unwrap();

        let Commands::Upload {
            files,
            server,
            dataset,
            stall_secs,
            max_retries,
        } = cli.command
        else {
            panic!("expected upload");
        };
        assert_eq!(files.len(), 2);
        assert_eq!(server, "http://localhost:8080");
        assert_eq!(stall_secs, 30);
        assert_eq!(max_retries, 3);
        assert_eq!(dataset.metadata().uploaded_by, "cli");
    }

    #[test]
    fn ingest_requires_metadata() {
        assert!(Cli::try_parse_from(["address_map_cli", "ingest", "a.geojson"]).is_err());
    }

    #[test]
    fn names_files_like_the_batch_endpoint() {
        assert_eq!(file_metadata(&metadata(), "adams.geojson", 1).name, "Ohio");
        let meta = file_metadata(&metadata(), "adams.geojson", 2);
        assert_eq!(meta.name, "Ohio - adams");
        assert_eq!(meta.region, "OH");
    }

    #[test]
    fn reports_failed_files() {
        assert!(failures(0, 3).is_ok());
        assert_eq!(failures(1, 3).unwrap_err().to_string(), "1 of 3 files failed");
    }

    #[tokio::test]
    async fn reading_a_missing_file_is_an_io_error() {
        let err = read_upload_file(Path::new("/nonexistent/a.geojson"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Io { .. }));
    }
}
