//! HTTP handler functions for the address map API.

use std::str::FromStr as _;

use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse, web};
use address_map_ingest::IngestError;
use address_map_ingest_models::{UploadFile, UploadMetadata};
use address_map_location_models::{DatasetFilter, DatasetStatus};
use address_map_search::proximity::{self, ProximityQuery};
use address_map_search::relevance::{self, RelevanceQuery};
use address_map_search::text::{self, FieldQuery, TokenQuery};
use address_map_search::{DistanceUnit, GeoFilter, GeoPoint, SearchError, clamp_limit};
use address_map_server_models::{
    ApiBatchSummary, ApiDataset, ApiDatasetStats, ApiError, ApiHealth, ApiLocation,
    ApiNearbyLocation, ApiPage, ApiScoredLocation, ApiWithin, DatasetListParams,
    FieldSearchParams, GeoParams, NearbyParams, TokenSearchParams, UploadParams, WithinParams,
};

use crate::{AppState, archive};

/// Header carrying the authenticated actor identity.
pub const ACTOR_HEADER: &str = "X-Actor-Id";

/// Actor recorded when no identity is attached.
pub const ANONYMOUS_ACTOR: &str = "anonymous";

/// Default page size for dataset listings.
const DEFAULT_DATASET_LIMIT: u32 = 50;

/// Largest page size for dataset listings.
const MAX_DATASET_LIMIT: u32 = 500;

fn error_json(status: StatusCode, message: impl Into<String>) -> HttpResponse {
    HttpResponse::build(status).json(ApiError {
        error: message.into(),
    })
}

fn bad_request(message: impl Into<String>) -> HttpResponse {
    error_json(StatusCode::BAD_REQUEST, message)
}

fn ingest_error(context: &str, e: &IngestError) -> HttpResponse {
    let status = match e {
        IngestError::Validation(_) => StatusCode::BAD_REQUEST,
        IngestError::NotFound(_) => StatusCode::NOT_FOUND,
        IngestError::Conflict { .. } => StatusCode::CONFLICT,
        IngestError::SourceMissing { .. } => StatusCode::GONE,
        IngestError::ShutDown | IngestError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        IngestError::Persistence(_)
        | IngestError::Extract(_)
        | IngestError::Io { .. }
        | IngestError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        log::error!("{context}: {e}");
    } else {
        log::debug!("{context}: {e}");
    }
    error_json(status, e.to_string())
}

fn search_error(context: &str, e: &SearchError) -> HttpResponse {
    match e {
        SearchError::Validation(message) => bad_request(message.clone()),
        SearchError::Store(_) => {
            log::error!("{context}: {e}");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, context)
        }
    }
}

fn actor(req: &HttpRequest) -> String {
    req.headers()
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map_or_else(|| ANONYMOUS_ACTOR.to_string(), str::to_string)
}

fn metadata(req: &HttpRequest, params: &UploadParams) -> UploadMetadata {
    UploadMetadata {
        name: params.name.clone().unwrap_or_default(),
        region: params.region.clone().unwrap_or_default(),
        sub_region: params.sub_region.clone().unwrap_or_default(),
        uploaded_by: actor(req),
    }
}

fn parse_unit(unit: Option<&str>) -> Result<DistanceUnit, String> {
    unit.map_or(Ok(DistanceUnit::default()), |u| {
        DistanceUnit::from_str(u.trim())
            .map_err(|_| format!("Unknown unit '{u}'; expected miles or kilometers"))
    })
}

/// Builds the optional radius filter; `lat`, `lon` and `radius` must be
/// supplied together.
fn geo_filter(params: &GeoParams) -> Result<Option<GeoFilter>, String> {
    match (params.lat, params.lon, params.radius) {
        (None, None, None) => Ok(None),
        (Some(lat), Some(lon), Some(radius)) => Ok(Some(GeoFilter {
            center: GeoPoint::new(lat, lon),
            radius,
            unit: parse_unit(params.unit.as_deref())?,
        })),
        _ => Err("lat, lon and radius must be supplied together".to_string()),
    }
}

/// `GET /api/health`
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(ApiHealth {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `POST /api/datasets`
///
/// Stores a single raw file sent as the request body and queues it for
/// processing. Responds `202` with the pending dataset.
pub async fn upload_dataset(
    state: web::Data<AppState>,
    req: HttpRequest,
    params: web::Query<UploadParams>,
    body: web::Bytes,
) -> HttpResponse {
    let Some(filename) = params.filename.clone().filter(|f| !f.trim().is_empty()) else {
        return bad_request("filename is required");
    };
    let meta = metadata(&req, &params);
    let file = UploadFile {
        filename,
        bytes: body.to_vec(),
    };

    match state.ingestor.upload(&meta, file).await {
        Ok(dataset) => HttpResponse::Accepted().json(ApiDataset::from(dataset)),
        Err(e) => ingest_error("Failed to upload dataset", &e),
    }
}

async fn unpack(state: &AppState, body: web::Bytes) -> Result<Vec<UploadFile>, IngestError> {
    let limit = state.ingestor.config().max_upload_bytes;
    tokio::task::spawn_blocking(move || archive::read_zip(&body, limit))
        .await
        .map_err(|e| IngestError::Task(e.to_string()))?
}

/// `POST /api/datasets/batch`
///
/// Stores every file of a zip archive and queues each for processing.
/// Responds with per-file results and aggregate counts.
pub async fn upload_batch(
    state: web::Data<AppState>,
    req: HttpRequest,
    params: web::Query<UploadParams>,
    body: web::Bytes,
) -> HttpResponse {
    let meta = metadata(&req, &params);
    let files = match unpack(&state, body).await {
        Ok(files) => files,
        Err(e) => return ingest_error("Failed to read archive", &e),
    };

    match state.ingestor.upload_batch(&meta, files).await {
        Ok(summary) => HttpResponse::Ok().json(ApiBatchSummary::from(summary)),
        Err(e) => ingest_error("Failed to upload batch", &e),
    }
}

/// `POST /api/datasets/batch/stream`
///
/// Like [`upload_batch`], but processes each file and streams lifecycle
/// events as `text/event-stream` frames. Disconnecting stops the stream
/// only; the batch keeps running.
pub async fn upload_batch_stream(
    state: web::Data<AppState>,
    req: HttpRequest,
    params: web::Query<UploadParams>,
    body: web::Bytes,
) -> HttpResponse {
    let meta = metadata(&req, &params);
    let files = match unpack(&state, body).await {
        Ok(files) => files,
        Err(e) => return ingest_error("Failed to read archive", &e),
    };

    let mut events = match state.ingestor.upload_batch_streaming(meta, files).await {
        Ok(rx) => rx,
        Err(e) => return ingest_error("Failed to start batch", &e),
    };

    let stream = async_stream::stream! {
        while let Some(event) = events.recv().await {
            match event.to_sse_frame() {
                Ok(frame) => yield Ok::<_, actix_web::Error>(web::Bytes::from(frame)),
                Err(e) => log::error!("Failed to encode {} event: {e}", event.event_type()),
            }
        }
    };

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(stream)
}

/// `GET /api/datasets`
pub async fn list_datasets(
    state: web::Data<AppState>,
    params: web::Query<DatasetListParams>,
) -> HttpResponse {
    let status = match params.status.as_deref().map(DatasetStatus::from_str) {
        None => None,
        Some(Ok(status)) => Some(status),
        Some(Err(_)) => {
            return bad_request(format!(
                "Unknown status '{}'",
                params.status.as_deref().unwrap_or_default()
            ));
        }
    };

    let filter = DatasetFilter {
        region: params.region.clone().filter(|r| !r.trim().is_empty()),
        status,
        limit: params
            .limit
            .unwrap_or(DEFAULT_DATASET_LIMIT)
            .min(MAX_DATASET_LIMIT),
        offset: params.offset.unwrap_or(0),
    };

    match state.ingestor.list(&filter).await {
        Ok(page) => HttpResponse::Ok().json(ApiPage {
            items: page.items.into_iter().map(ApiDataset::from).collect(),
            total: page.total,
            limit: filter.limit,
            offset: filter.offset,
        }),
        Err(e) => ingest_error("Failed to list datasets", &e),
    }
}

/// `GET /api/datasets/stats`
pub async fn dataset_stats(state: web::Data<AppState>) -> HttpResponse {
    match state.ingestor.stats().await {
        Ok(stats) => HttpResponse::Ok().json(ApiDatasetStats::from(stats)),
        Err(e) => ingest_error("Failed to compute dataset stats", &e),
    }
}

/// `GET /api/datasets/{id}`
pub async fn get_dataset(state: web::Data<AppState>, path: web::Path<i64>) -> HttpResponse {
    match state.ingestor.get(path.into_inner()).await {
        Ok(dataset) => HttpResponse::Ok().json(ApiDataset::from(dataset)),
        Err(e) => ingest_error("Failed to get dataset", &e),
    }
}

/// `DELETE /api/datasets/{id}`
pub async fn delete_dataset(state: web::Data<AppState>, path: web::Path<i64>) -> HttpResponse {
    match state.ingestor.delete(path.into_inner()).await {
        Ok(dataset) => HttpResponse::Ok().json(ApiDataset::from(dataset)),
        Err(e) => ingest_error("Failed to delete dataset", &e),
    }
}

/// `POST /api/datasets/{id}/reprocess`
///
/// `409` while the dataset is being processed, `410` if its raw file is
/// gone.
pub async fn reprocess_dataset(state: web::Data<AppState>, path: web::Path<i64>) -> HttpResponse {
    match state.ingestor.reprocess(path.into_inner()).await {
        Ok(dataset) => HttpResponse::Accepted().json(ApiDataset::from(dataset)),
        Err(e) => ingest_error("Failed to reprocess dataset", &e),
    }
}

/// `GET /api/search?q=...`
///
/// Every whitespace-separated term must match.
pub async fn search_tokens(
    state: web::Data<AppState>,
    params: web::Query<TokenSearchParams>,
) -> HttpResponse {
    let geo = match geo_filter(&params.geo()) {
        Ok(geo) => geo,
        Err(message) => return bad_request(message),
    };
    let query = TokenQuery {
        text: params.q.clone().unwrap_or_default(),
        geo,
        limit: clamp_limit(params.limit.unwrap_or(0)),
        offset: params.offset.unwrap_or(0),
    };

    match text::search_tokens(state.store.as_ref(), &query).await {
        Ok(page) => HttpResponse::Ok().json(ApiPage {
            items: page.items.into_iter().map(ApiLocation::from).collect(),
            total: page.total,
            limit: query.limit,
            offset: query.offset,
        }),
        Err(e) => search_error("Failed to search locations", &e),
    }
}

/// `GET /api/search/fields`
pub async fn search_fields(
    state: web::Data<AppState>,
    params: web::Query<FieldSearchParams>,
) -> HttpResponse {
    let geo = match geo_filter(&params.geo()) {
        Ok(geo) => geo,
        Err(message) => return bad_request(message),
    };
    let params = params.into_inner();
    let query = FieldQuery {
        house_number: params.house_number,
        street: params.street,
        city: params.city,
        district: params.district,
        region: params.region,
        postal_code: params.postal_code,
        geo,
        limit: clamp_limit(params.limit.unwrap_or(0)),
        offset: params.offset.unwrap_or(0),
    };

    match text::search_fields(state.store.as_ref(), &query).await {
        Ok(page) => HttpResponse::Ok().json(ApiPage {
            items: page.items.into_iter().map(ApiLocation::from).collect(),
            total: page.total,
            limit: query.limit,
            offset: query.offset,
        }),
        Err(e) => search_error("Failed to search locations", &e),
    }
}

/// `GET /api/search/relevance?q=...`
pub async fn search_relevance(
    state: web::Data<AppState>,
    params: web::Query<TokenSearchParams>,
) -> HttpResponse {
    let geo = match geo_filter(&params.geo()) {
        Ok(geo) => geo,
        Err(message) => return bad_request(message),
    };
    let query = RelevanceQuery {
        phrase: params.q.clone().unwrap_or_default(),
        geo,
        limit: clamp_limit(params.limit.unwrap_or(0)),
        offset: params.offset.unwrap_or(0),
    };

    match relevance::search_relevance(state.store.as_ref(), &query).await {
        Ok(page) => HttpResponse::Ok().json(ApiPage {
            items: page
                .items
                .into_iter()
                .map(ApiScoredLocation::from)
                .collect(),
            total: page.total,
            limit: query.limit,
            offset: query.offset,
        }),
        Err(e) => search_error("Failed to rank locations", &e),
    }
}

/// `GET /api/search/nearby?lat=...&lon=...&radius=...`
pub async fn search_nearby(
    state: web::Data<AppState>,
    params: web::Query<NearbyParams>,
) -> HttpResponse {
    let unit = match parse_unit(params.unit.as_deref()) {
        Ok(unit) => unit,
        Err(message) => return bad_request(message),
    };
    let query = ProximityQuery {
        center: GeoPoint::new(params.lat, params.lon),
        radius: params.radius,
        unit,
        limit: clamp_limit(params.limit.unwrap_or(0)),
    };

    match proximity::nearby(state.store.as_ref(), &query).await {
        Ok(results) => {
            let items: Vec<ApiNearbyLocation> =
                results.into_iter().map(ApiNearbyLocation::from).collect();
            HttpResponse::Ok().json(ApiPage {
                total: items.len() as u64,
                items,
                limit: query.limit,
                offset: 0,
            })
        }
        Err(e) => search_error("Failed to search nearby locations", &e),
    }
}

/// `GET /api/search/within?lat1=...&lon1=...&lat2=...&lon2=...&radius=...`
pub async fn search_within(params: web::Query<WithinParams>) -> HttpResponse {
    let unit = match parse_unit(params.unit.as_deref()) {
        Ok(unit) => unit,
        Err(message) => return bad_request(message),
    };

    match proximity::within(
        GeoPoint::new(params.lat1, params.lon1),
        GeoPoint::new(params.lat2, params.lon2),
        params.radius,
        unit,
    ) {
        Ok(result) => HttpResponse::Ok().json(ApiWithin::from(result)),
        Err(e) => search_error("Failed to compare points", &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geo_filter_requires_all_parts() {
        assert_eq!(geo_filter(&GeoParams::default()), Ok(None));

        let partial = GeoParams {
            lat: Some(39.1),
            ..GeoParams::default()
        };
        assert!(geo_filter(&partial).is_err());

        let full = GeoParams {
            lat: Some(39.1),
            lon: Some(-84.5),
            radius: Some(2.0),
            unit: Some("KM".to_string()),
        };
        let filter = geo_filter(&full).unwrap().unwrap();
        assert_eq!(filter.unit, DistanceUnit::Kilometers);
    }

    #[test]
    fn unknown_units_are_rejected() {
        assert_eq!(parse_unit(None), Ok(DistanceUnit::Miles));
        assert_eq!(parse_unit(Some("mi")), Ok(DistanceUnit::Miles));
        assert!(parse_unit(Some("leagues")).is_err());
    }

    #[test]
    fn errors_map_to_statuses() {
        let cases = [
            (IngestError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (IngestError::NotFound(1), StatusCode::NOT_FOUND),
            (
                IngestError::Conflict {
                    id: 1,
                    status: DatasetStatus::Processing,
                },
                StatusCode::CONFLICT,
            ),
            (
                IngestError::SourceMissing {
                    id: 1,
                    path: "gone".into(),
                },
                StatusCode::GONE,
            ),
            (IngestError::Task("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, status) in cases {
            assert_eq!(ingest_error("test", &error).status(), status);
        }
    }
}
