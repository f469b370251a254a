#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Dataset, location record, and query predicate types.
//!
//! These types represent the shapes of data as stored in and retrieved
//! from the backing store. They are shared by the extraction, ingestion,
//! search, and server layers. API response types live separately in
//! `address_map_server_models`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Lifecycle status of an uploaded dataset.
///
/// The only legal transitions are `Pending -> Processing` and
/// `Processing -> Completed | Failed`. A reprocess re-claims a terminal
/// dataset straight into `Processing`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DatasetStatus {
    /// Raw file stored, waiting for a worker.
    Pending,
    /// A worker is extracting and writing records.
    Processing,
    /// All records written; the source file has been reclaimed.
    Completed,
    /// Processing failed; the source file is retained for a retry.
    Failed,
}

impl DatasetStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: &[Self] = &[
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
    ];

    /// Statuses from which a reprocess may claim the dataset.
    pub const REPROCESSABLE: &[Self] = &[Self::Completed, Self::Failed];

    /// Whether this is a terminal status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a reprocess request may be accepted in this status.
    #[must_use]
    pub const fn can_reprocess(self) -> bool {
        self.is_terminal()
    }

    /// Whether the pipeline may move a dataset from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed | Self::Failed)
                | (Self::Completed | Self::Failed, Self::Processing)
        )
    }
}

/// Source file format, determined from the uploaded file name.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SourceFormat {
    /// Plain point-feature collection (aggregate or line-delimited).
    Geojson,
    /// Gzip-compressed point-feature collection.
    GeojsonGz,
}

/// Extensions accepted for the uncompressed payload.
pub const FEATURE_EXTENSIONS: &[&str] = &["geojson", "json", "geojsonl", "ndjson"];

impl SourceFormat {
    /// Detects the format from a file name, or `None` if the extension
    /// is not an accepted point-feature collection (or its `.gz` variant).
    #[must_use]
    pub fn from_filename(filename: &str) -> Option<Self> {
        let lower = filename.to_ascii_lowercase();
        let (inner, compressed) = lower
            .strip_suffix(".gz")
            .map_or((lower.as_str(), false), |stripped| (stripped, true));

        let (_, ext) = inner.rsplit_once('.')?;
        if !FEATURE_EXTENSIONS.contains(&ext) {
            return None;
        }

        Some(if compressed {
            Self::GeojsonGz
        } else {
            Self::Geojson
        })
    }

    /// Whether the payload is gzip-compressed.
    #[must_use]
    pub const fn is_compressed(self) -> bool {
        matches!(self, Self::GeojsonGz)
    }
}

/// An uploaded dataset and its ingestion lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Primary key.
    pub id: i64,
    /// Human-readable name.
    pub name: String,
    /// Region code (e.g., "OH").
    pub region: String,
    /// Sub-region label (e.g., "Adams").
    pub sub_region: String,
    /// Source format tag.
    pub format: SourceFormat,
    /// Where the raw upload was written.
    pub file_path: String,
    /// Size of the raw upload in bytes.
    pub file_size: u64,
    /// Number of accepted records; set once, on completion.
    pub record_count: Option<u64>,
    /// Current lifecycle status.
    pub status: DatasetStatus,
    /// Failure message captured when processing failed.
    pub error_message: Option<String>,
    /// Identity of the uploading actor.
    pub uploaded_by: String,
    /// When the raw upload was stored.
    pub uploaded_at: DateTime<Utc>,
    /// When processing last finished.
    pub processed_at: Option<DateTime<Utc>>,
}

/// Fields required to create a dataset row. New rows start `Pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDataset {
    /// Human-readable name.
    pub name: String,
    /// Region code.
    pub region: String,
    /// Sub-region label.
    pub sub_region: String,
    /// Source format tag.
    pub format: SourceFormat,
    /// Where the raw upload was written.
    pub file_path: String,
    /// Size of the raw upload in bytes.
    pub file_size: u64,
    /// Identity of the uploading actor.
    pub uploaded_by: String,
}

/// A normalized location ready to be upserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLocation {
    /// Content hash; unique across the store.
    pub hash: String,
    /// House number.
    pub house_number: Option<String>,
    /// Street name.
    pub street: Option<String>,
    /// Unit/apartment.
    pub unit: Option<String>,
    /// City.
    pub city: Option<String>,
    /// Sub-region / district / county.
    pub district: Option<String>,
    /// Region code, truncated to the column width.
    pub region: Option<String>,
    /// Postal code.
    pub postal_code: Option<String>,
    /// Latitude (WGS84).
    pub latitude: f64,
    /// Longitude (WGS84).
    pub longitude: f64,
}

/// A persisted location record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    /// Primary key.
    pub id: i64,
    /// Content hash.
    pub hash: String,
    /// House number.
    pub house_number: Option<String>,
    /// Street name.
    pub street: Option<String>,
    /// Unit/apartment.
    pub unit: Option<String>,
    /// City.
    pub city: Option<String>,
    /// Sub-region / district / county.
    pub district: Option<String>,
    /// Region code.
    pub region: Option<String>,
    /// Postal code.
    pub postal_code: Option<String>,
    /// Latitude (WGS84).
    pub latitude: f64,
    /// Longitude (WGS84).
    pub longitude: f64,
    /// When the record was first inserted.
    pub created_at: DateTime<Utc>,
}

impl LocationRecord {
    /// Builds a persisted record from a [`NewLocation`].
    #[must_use]
    pub fn from_new(id: i64, location: NewLocation, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            hash: location.hash,
            house_number: location.house_number,
            street: location.street,
            unit: location.unit,
            city: location.city,
            district: location.district,
            region: location.region,
            postal_code: location.postal_code,
            latitude: location.latitude,
            longitude: location.longitude,
            created_at,
        }
    }

    /// `"<house> <street>"`, or whichever of the two is present.
    #[must_use]
    pub fn street_address(&self) -> String {
        join_non_empty(&[self.house_number.as_deref(), self.street.as_deref()], " ")
    }

    /// The concatenated address:
    /// `"<house> <street>, <unit>, <city>, <region> <postal>"` with
    /// missing parts elided.
    #[must_use]
    pub fn full_address(&self) -> String {
        let street = self.street_address();
        let region_postal =
            join_non_empty(&[self.region.as_deref(), self.postal_code.as_deref()], " ");

        join_non_empty(
            &[
                Some(street.as_str()),
                self.unit.as_deref(),
                self.city.as_deref(),
                Some(region_postal.as_str()),
            ],
            ", ",
        )
    }
}

fn join_non_empty(parts: &[Option<&str>], sep: &str) -> String {
    parts
        .iter()
        .filter_map(|p| p.map(str::trim))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(sep)
}

/// A geographic bounding box in WGS84 coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Western longitude boundary.
    pub west: f64,
    /// Southern latitude boundary.
    pub south: f64,
    /// Eastern longitude boundary.
    pub east: f64,
    /// Northern latitude boundary.
    pub north: f64,
}

impl BoundingBox {
    /// Creates a new bounding box from the given coordinates.
    #[must_use]
    pub const fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    /// Whether the point lies inside the box (edges inclusive).
    #[must_use]
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        latitude >= self.south
            && latitude <= self.north
            && longitude >= self.west
            && longitude <= self.east
    }
}

/// Filters and pagination for listing datasets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetFilter {
    /// Only datasets in this region.
    pub region: Option<String>,
    /// Only datasets in this status.
    pub status: Option<DatasetStatus>,
    /// Maximum number of rows to return.
    pub limit: u32,
    /// Number of rows to skip.
    pub offset: u32,
}

/// Aggregate counters across all datasets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetStats {
    /// Number of dataset rows.
    pub total_datasets: u64,
    /// Number of stored location records.
    pub total_records: u64,
    /// Sum of raw upload sizes in bytes.
    pub total_bytes: u64,
    /// Dataset count per region.
    pub by_region: BTreeMap<String, u64>,
    /// Dataset count per status.
    pub by_status: BTreeMap<DatasetStatus, u64>,
}

/// One page of results plus the total number of matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Rows in this page.
    pub items: Vec<T>,
    /// Total number of matching rows, ignoring pagination.
    pub total: u64,
}

impl<T> Page<T> {
    /// An empty page.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }
}

/// A searchable text field of a [`LocationRecord`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SearchField {
    /// House number.
    HouseNumber,
    /// Street name.
    Street,
    /// Unit/apartment.
    Unit,
    /// City.
    City,
    /// Sub-region / district.
    District,
    /// Region code.
    Region,
    /// Postal code.
    PostalCode,
    /// `"<house> <street>"`.
    HouseNumberStreet,
    /// `"<street> <city>"`.
    StreetCity,
    /// [`LocationRecord::full_address`].
    FullAddress,
}

impl SearchField {
    /// The fields a single free-text token is matched against.
    pub const TOKEN_FIELDS: &[Self] = &[
        Self::HouseNumber,
        Self::Street,
        Self::City,
        Self::District,
        Self::PostalCode,
        Self::HouseNumberStreet,
    ];

    /// Extracts this field's text from a record (empty when absent).
    #[must_use]
    pub fn value_of(self, record: &LocationRecord) -> String {
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        match self {
            Self::HouseNumber => opt(&record.house_number),
            Self::Street => opt(&record.street),
            Self::Unit => opt(&record.unit),
            Self::City => opt(&record.city),
            Self::District => opt(&record.district),
            Self::Region => opt(&record.region),
            Self::PostalCode => opt(&record.postal_code),
            Self::HouseNumberStreet => record.street_address(),
            Self::StreetCity => {
                join_non_empty(&[record.street.as_deref(), record.city.as_deref()], " ")
            }
            Self::FullAddress => record.full_address(),
        }
    }
}

/// One case-insensitive substring condition: `needle` must occur in at
/// least one of `fields`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextClause {
    /// Text to look for.
    pub needle: String,
    /// Candidate fields (OR).
    pub fields: Vec<SearchField>,
}

impl TextClause {
    /// Creates a clause.
    #[must_use]
    pub fn new(needle: impl Into<String>, fields: &[SearchField]) -> Self {
        Self {
            needle: needle.into(),
            fields: fields.to_vec(),
        }
    }

    /// Whether any field of `record` contains the needle, ignoring case.
    #[must_use]
    pub fn matches(&self, record: &LocationRecord) -> bool {
        let needle = self.needle.to_lowercase();
        self.fields
            .iter()
            .any(|f| f.value_of(record).to_lowercase().contains(&needle))
    }
}

/// A conjunction of [`TextClause`]s with an optional bounding box.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextPredicate {
    /// Clauses that must all hold (AND).
    pub clauses: Vec<TextClause>,
    /// Optional coordinate range filter.
    pub bbox: Option<BoundingBox>,
}

impl TextPredicate {
    /// Whether `record` satisfies every clause and the bounding box.
    #[must_use]
    pub fn matches(&self, record: &LocationRecord) -> bool {
        self.bbox
            .is_none_or(|b| b.contains(record.latitude, record.longitude))
            && self.clauses.iter().all(|c| c.matches(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> LocationRecord {
        LocationRecord {
            id: 1,
            hash: "abc".to_string(),
            house_number: Some("2525".to_string()),
            street: Some("Oakley Ave".to_string()),
            unit: None,
            city: Some("Cincinnati".to_string()),
            district: Some("Hamilton".to_string()),
            region: Some("OH".to_string()),
            postal_code: Some("45209".to_string()),
            latitude: 39.1531,
            longitude: -84.4316,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn status_transitions_follow_lifecycle() {
        use DatasetStatus::{Completed, Failed, Pending, Processing};

        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Processing.can_reprocess());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in DatasetStatus::ALL {
            let parsed: DatasetStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, *status);
        }
        assert_eq!(
            serde_json::to_string(&DatasetStatus::Processing).unwrap(),
            "\"processing\""
        );
    }

    #[test]
    fn detects_source_format() {
        assert_eq!(
            SourceFormat::from_filename("adams.geojson"),
            Some(SourceFormat::Geojson)
        );
        assert_eq!(
            SourceFormat::from_filename("Adams.GeoJSON.gz"),
            Some(SourceFormat::GeojsonGz)
        );
        assert_eq!(
            SourceFormat::from_filename("lines.ndjson"),
            Some(SourceFormat::Geojson)
        );
        assert_eq!(SourceFormat::from_filename("adams.csv"), None);
        assert_eq!(SourceFormat::from_filename("adams.gz"), None);
        assert_eq!(SourceFormat::from_filename("geojson"), None);
    }

    #[test]
    fn builds_full_address() {
        let r = record();
        assert_eq!(r.street_address(), "2525 Oakley Ave");
        assert_eq!(r.full_address(), "2525 Oakley Ave, Cincinnati, OH 45209");
    }

    #[test]
    fn full_address_elides_missing_parts() {
        let mut r = record();
        r.house_number = None;
        r.postal_code = None;
        r.unit = Some("Apt 2".to_string());
        assert_eq!(r.full_address(), "Oakley Ave, Apt 2, Cincinnati, OH");
    }

    #[test]
    fn clause_matches_any_field_case_insensitively() {
        let r = record();
        assert!(TextClause::new("oakley", SearchField::TOKEN_FIELDS).matches(&r));
        assert!(TextClause::new("2525 OAK", SearchField::TOKEN_FIELDS).matches(&r));
        assert!(!TextClause::new("landsbrook", SearchField::TOKEN_FIELDS).matches(&r));
        assert!(!TextClause::new("oakley", &[SearchField::City]).matches(&r));
    }

    #[test]
    fn predicate_requires_every_clause_and_bbox() {
        let r = record();
        let mut predicate = TextPredicate {
            clauses: vec![
                TextClause::new("oakley", SearchField::TOKEN_FIELDS),
                TextClause::new("cincinnati", SearchField::TOKEN_FIELDS),
            ],
            bbox: None,
        };
        assert!(predicate.matches(&r));

        predicate.bbox = Some(BoundingBox::new(-85.0, 39.0, -84.0, 40.0));
        assert!(predicate.matches(&r));

        predicate.bbox = Some(BoundingBox::new(-80.0, 39.0, -79.0, 40.0));
        assert!(!predicate.matches(&r));

        predicate.bbox = None;
        predicate
            .clauses
            .push(TextClause::new("dayton", SearchField::TOKEN_FIELDS));
        assert!(!predicate.matches(&r));
    }
}
