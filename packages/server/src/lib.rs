#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Actix-Web API server for the address map application.
//!
//! Serves the dataset upload and lifecycle endpoints and the proximity,
//! token, and relevance search endpoints under `/api`. Batch uploads can
//! stream their progress as `text/event-stream` frames.

pub mod archive;
mod handlers;

pub use handlers::{ACTOR_HEADER, ANONYMOUS_ACTOR};

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use address_map_database::{LocationStore, db};
use address_map_extract::FieldKeyTable;
use address_map_ingest::Ingestor;
use address_map_ingest_models::IngestConfig;

/// Shared application state.
pub struct AppState {
    /// Upload and dataset lifecycle operations.
    pub ingestor: Arc<Ingestor>,
    /// Store used by the search endpoints.
    pub store: Arc<dyn LocationStore>,
}

impl AppState {
    /// Builds the state around an ingestor, searching its store.
    #[must_use]
    pub fn new(ingestor: Arc<Ingestor>) -> Self {
        Self {
            store: Arc::clone(ingestor.store()),
            ingestor,
        }
    }
}

/// Registers the `/api` routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/health", web::get().to(handlers::health))
            .route("/datasets", web::post().to(handlers::upload_dataset))
            .route("/datasets", web::get().to(handlers::list_datasets))
            .route("/datasets/batch", web::post().to(handlers::upload_batch))
            .route(
                "/datasets/batch/stream",
                web::post().to(handlers::upload_batch_stream),
            )
            .route("/datasets/stats", web::get().to(handlers::dataset_stats))
            .route("/datasets/{id}", web::get().to(handlers::get_dataset))
            .route("/datasets/{id}", web::delete().to(handlers::delete_dataset))
            .route(
                "/datasets/{id}/reprocess",
                web::post().to(handlers::reprocess_dataset),
            )
            .route("/search", web::get().to(handlers::search_tokens))
            .route("/search/fields", web::get().to(handlers::search_fields))
            .route("/search/relevance", web::get().to(handlers::search_relevance))
            .route("/search/nearby", web::get().to(handlers::search_nearby))
            .route("/search/within", web::get().to(handlers::search_within)),
    );
}

/// Starts the address map API server.
///
/// Opens the configured store (running migrations for `PostgreSQL`),
/// starts the ingestion worker pool, and serves HTTP on
/// `BIND_ADDR:PORT`. The worker pool is drained after the server stops.
///
/// # Errors
///
/// Returns an error if the store cannot be opened, the field-key table
/// cannot be loaded, or the HTTP server fails to bind or run.
#[allow(clippy::future_not_send)]
pub async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let store = db::open_store_from_env().await?;
    let config = IngestConfig::from_env();
    let keys = FieldKeyTable::from_env()?;
    let max_upload_bytes = config.max_upload_bytes;

    log::info!(
        "Uploads go to {} ({} workers, batch size {}, {} store permits)",
        config.upload_dir.display(),
        config.max_workers,
        config.batch_size,
        config.store_permits
    );

    let ingestor = Arc::new(Ingestor::new(store, config, keys));
    let state = web::Data::new(AppState::new(Arc::clone(&ingestor)));

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    log::info!("Starting server on {bind_addr}:{port}");

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .app_data(web::PayloadConfig::new(max_upload_bytes))
            .configure(configure)
    })
    .bind((bind_addr, port))?
    .run()
    .await?;

    log::info!("Server stopped; draining ingestion workers...");
    ingestor.shutdown().await;
    Ok(())
}
