#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! API request and response types for the address map server.
//!
//! These types are serialized to JSON for the REST API. They are separate
//! from the store and pipeline types to allow independent evolution of the
//! API contract.

use std::collections::BTreeMap;

use address_map_ingest_models::{BatchSummary, FileResult};
use address_map_location_models::{
    Dataset, DatasetStats, DatasetStatus, LocationRecord, SourceFormat,
};
use address_map_search::proximity::{NearbyLocation, WithinRadius};
use address_map_search::relevance::ScoredLocation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A dataset as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiDataset {
    /// Dataset ID.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Region code.
    pub region: String,
    /// Sub-region label.
    pub sub_region: String,
    /// Source format tag.
    pub format: SourceFormat,
    /// Size of the raw upload in bytes.
    pub file_size: u64,
    /// Accepted records, once completed.
    pub record_count: Option<u64>,
    /// Lifecycle status.
    pub status: DatasetStatus,
    /// Failure message, if processing failed.
    pub error_message: Option<String>,
    /// Uploading actor.
    pub uploaded_by: String,
    /// When the file was uploaded.
    pub uploaded_at: DateTime<Utc>,
    /// When processing last finished.
    pub processed_at: Option<DateTime<Utc>>,
}

impl From<Dataset> for ApiDataset {
    fn from(d: Dataset) -> Self {
        Self {
            id: d.id,
            name: d.name,
            region: d.region,
            sub_region: d.sub_region,
            format: d.format,
            file_size: d.file_size,
            record_count: d.record_count,
            status: d.status,
            error_message: d.error_message,
            uploaded_by: d.uploaded_by,
            uploaded_at: d.uploaded_at,
            processed_at: d.processed_at,
        }
    }
}

/// A page of results with the total match count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPage<T> {
    /// Results in this page.
    pub items: Vec<T>,
    /// Total matches, ignoring pagination.
    pub total: u64,
    /// Page size applied.
    pub limit: u32,
    /// Rows skipped.
    pub offset: u32,
}

/// Aggregate dataset counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiDatasetStats {
    /// Number of datasets.
    pub total_datasets: u64,
    /// Number of stored location records.
    pub total_records: u64,
    /// Total raw upload bytes.
    pub total_bytes: u64,
    /// Dataset count per region.
    pub by_region: BTreeMap<String, u64>,
    /// Dataset count per status.
    pub by_status: BTreeMap<DatasetStatus, u64>,
}

impl From<DatasetStats> for ApiDatasetStats {
    fn from(s: DatasetStats) -> Self {
        Self {
            total_datasets: s.total_datasets,
            total_records: s.total_records,
            total_bytes: s.total_bytes,
            by_region: s.by_region,
            by_status: s.by_status,
        }
    }
}

/// Result for one file of a batch upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiFileResult {
    /// Position of the file in the archive.
    pub file_index: usize,
    /// File name inside the archive.
    pub filename: String,
    /// Created dataset, on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<ApiDataset>,
    /// Error message, on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<FileResult> for ApiFileResult {
    fn from(r: FileResult) -> Self {
        Self {
            file_index: r.file_index,
            filename: r.filename,
            dataset: r.dataset.map(ApiDataset::from),
            error: r.error,
        }
    }
}

/// Response of a non-streaming batch upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiBatchSummary {
    /// Batch identifier.
    pub batch_id: String,
    /// Files stored and queued.
    pub success_count: usize,
    /// Files rejected.
    pub fail_count: usize,
    /// Files in the archive.
    pub total: usize,
    /// Per-file results, in archive order.
    pub results: Vec<ApiFileResult>,
}

impl From<BatchSummary> for ApiBatchSummary {
    fn from(s: BatchSummary) -> Self {
        Self {
            batch_id: s.batch_id,
            success_count: s.success_count,
            fail_count: s.fail_count,
            total: s.total,
            results: s.results.into_iter().map(ApiFileResult::from).collect(),
        }
    }
}

/// A stored location as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiLocation {
    /// Row ID.
    pub id: i64,
    /// Content hash.
    pub hash: String,
    /// House number.
    pub house_number: Option<String>,
    /// Street name.
    pub street: Option<String>,
    /// Unit.
    pub unit: Option<String>,
    /// City.
    pub city: Option<String>,
    /// Sub-region / district.
    pub district: Option<String>,
    /// Region code.
    pub region: Option<String>,
    /// Postal code.
    pub postal_code: Option<String>,
    /// Concatenated address.
    pub full_address: String,
    /// Latitude.
    pub latitude: f64,
    /// Longitude.
    pub longitude: f64,
}

impl From<LocationRecord> for ApiLocation {
    fn from(r: LocationRecord) -> Self {
        Self {
            full_address: r.full_address(),
            id: r.id,
            hash: r.hash,
            house_number: r.house_number,
            street: r.street,
            unit: r.unit,
            city: r.city,
            district: r.district,
            region: r.region,
            postal_code: r.postal_code,
            latitude: r.latitude,
            longitude: r.longitude,
        }
    }
}

/// A location with its distance from the search center.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiNearbyLocation {
    /// The location.
    pub location: ApiLocation,
    /// Distance in miles.
    pub distance_miles: f64,
    /// Distance in kilometers.
    pub distance_km: f64,
}

impl From<NearbyLocation> for ApiNearbyLocation {
    fn from(n: NearbyLocation) -> Self {
        Self {
            location: n.record.into(),
            distance_miles: n.distance_miles,
            distance_km: n.distance_km,
        }
    }
}

/// A location with its relevance score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiScoredLocation {
    /// The location.
    pub location: ApiLocation,
    /// Relevance score (higher is better).
    pub score: u32,
}

impl From<ScoredLocation> for ApiScoredLocation {
    fn from(s: ScoredLocation) -> Self {
        Self {
            location: s.record.into(),
            score: s.score,
        }
    }
}

/// Response of the two-point radius check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiWithin {
    /// Whether the points are within the radius.
    pub within: bool,
    /// Distance in miles.
    pub distance_miles: f64,
    /// Distance in kilometers.
    pub distance_km: f64,
}

impl From<WithinRadius> for ApiWithin {
    fn from(w: WithinRadius) -> Self {
        Self {
            within: w.within,
            distance_miles: w.distance_miles,
            distance_km: w.distance_km,
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiHealth {
    /// Whether the service is healthy.
    pub healthy: bool,
    /// Service version.
    pub version: String,
}

/// Error body for non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// Human-readable message.
    pub error: String,
}

/// Query parameters for a single-file upload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadParams {
    /// Dataset display name.
    pub name: Option<String>,
    /// Region code.
    pub region: Option<String>,
    /// Sub-region label.
    pub sub_region: Option<String>,
    /// Original file name; its extension selects the format.
    pub filename: Option<String>,
}

/// Query parameters for listing datasets.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetListParams {
    /// Only this region.
    pub region: Option<String>,
    /// Only this status (`pending`, `processing`, `completed`, `failed`).
    pub status: Option<String>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

/// Optional radius filter shared by the text search endpoints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoParams {
    /// Center latitude.
    pub lat: Option<f64>,
    /// Center longitude.
    pub lon: Option<f64>,
    /// Radius in `unit`.
    pub radius: Option<f64>,
    /// `miles`/`mi` (default) or `kilometers`/`km`.
    pub unit: Option<String>,
}

/// Query parameters for token search.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSearchParams {
    /// Free-text query.
    pub q: Option<String>,
    /// Radius filter center latitude.
    pub lat: Option<f64>,
    /// Radius filter center longitude.
    pub lon: Option<f64>,
    /// Radius filter radius in `unit`.
    pub radius: Option<f64>,
    /// Radius filter unit.
    pub unit: Option<String>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

/// Query parameters for structured field search.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSearchParams {
    /// House number substring.
    pub house_number: Option<String>,
    /// Street substring.
    pub street: Option<String>,
    /// City substring.
    pub city: Option<String>,
    /// District substring.
    pub district: Option<String>,
    /// Region substring.
    pub region: Option<String>,
    /// Postal code substring.
    pub postal_code: Option<String>,
    /// Radius filter center latitude.
    pub lat: Option<f64>,
    /// Radius filter center longitude.
    pub lon: Option<f64>,
    /// Radius filter radius in `unit`.
    pub radius: Option<f64>,
    /// Radius filter unit.
    pub unit: Option<String>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

impl TokenSearchParams {
    /// The radius filter parameters of this query.
    #[must_use]
    pub fn geo(&self) -> GeoParams {
        GeoParams {
            lat: self.lat,
            lon: self.lon,
            radius: self.radius,
            unit: self.unit.clone(),
        }
    }
}

impl FieldSearchParams {
    /// The radius filter parameters of this query.
    #[must_use]
    pub fn geo(&self) -> GeoParams {
        GeoParams {
            lat: self.lat,
            lon: self.lon,
            radius: self.radius,
            unit: self.unit.clone(),
        }
    }
}

/// Query parameters for proximity search.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyParams {
    /// Center latitude.
    pub lat: f64,
    /// Center longitude.
    pub lon: f64,
    /// Radius in `unit`.
    pub radius: f64,
    /// `miles`/`mi` (default) or `kilometers`/`km`.
    pub unit: Option<String>,
    /// Maximum number of results.
    pub limit: Option<u32>,
}

/// Query parameters for the two-point radius check.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithinParams {
    /// First point latitude.
    pub lat1: f64,
    /// First point longitude.
    pub lon1: f64,
    /// Second point latitude.
    pub lat2: f64,
    /// Second point longitude.
    pub lon2: f64,
    /// Radius in `unit`.
    pub radius: f64,
    /// `miles`/`mi` (default) or `kilometers`/`km`.
    pub unit: Option<String>,
}
