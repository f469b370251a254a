#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Proximity and text search over ingested locations.
//!
//! Every query narrows candidates in the [`LocationStore`] with a coarse
//! predicate (bounding box, case-insensitive substrings) and then applies
//! the exact rule in process: true great-circle distance for
//! [`proximity`], the token AND/OR rule for [`text`], and weighted
//! scoring for [`relevance`].
//!
//! [`LocationStore`]: address_map_database::LocationStore

pub mod geo;
pub mod proximity;
pub mod relevance;
pub mod text;

use address_map_database::DbError;
use address_map_location_models::BoundingBox;
use serde::{Deserialize, Serialize};

pub use geo::{DistanceUnit, GeoPoint};

/// Largest page size any search returns.
pub const MAX_LIMIT: u32 = 100;

/// Page size used when the caller gives none.
pub const DEFAULT_LIMIT: u32 = 20;

/// Candidate oversampling applied to bounding-box prefilters.
pub const OVERSAMPLE_FACTOR: u32 = 3;

/// Errors from running a search.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// The query parameters are invalid.
    #[error("{0}")]
    Validation(String),

    /// The store query failed.
    #[error(transparent)]
    Store(#[from] DbError),
}

/// Restricts a text search to a radius around a point, applied as a
/// bounding-box prefilter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoFilter {
    /// Center of the area.
    pub center: GeoPoint,
    /// Radius in `unit`.
    pub radius: f64,
    /// Unit of `radius`.
    pub unit: DistanceUnit,
}

impl GeoFilter {
    /// The validated bounding box of this filter.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::Validation`] for out-of-range coordinates or
    /// a non-positive radius.
    pub fn bbox(&self) -> Result<BoundingBox, SearchError> {
        let center = self.center.validate()?;
        let miles = geo::radius_miles(self.radius, self.unit)?;
        Ok(geo::bounding_box(center, miles))
    }
}

/// Clamps a requested page size to `1..=MAX_LIMIT`, treating zero as
/// [`DEFAULT_LIMIT`].
#[must_use]
pub const fn clamp_limit(limit: u32) -> u32 {
    if limit == 0 {
        DEFAULT_LIMIT
    } else if limit > MAX_LIMIT {
        MAX_LIMIT
    } else {
        limit
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use address_map_database::LocationStore as _;
    use address_map_database::memory::MemoryStore;
    use address_map_location_models::NewLocation;

    /// Builds a location with the given address and coordinates.
    pub fn location(
        hash: &str,
        house_number: &str,
        street: &str,
        city: &str,
        latitude: f64,
        longitude: f64,
    ) -> NewLocation {
        NewLocation {
            hash: hash.to_string(),
            house_number: Some(house_number.to_string()),
            street: Some(street.to_string()),
            unit: None,
            city: Some(city.to_string()),
            district: Some("Hamilton".to_string()),
            region: Some("OH".to_string()),
            postal_code: Some("45209".to_string()),
            latitude,
            longitude,
        }
    }

    /// A store holding a handful of Cincinnati-area addresses.
    pub async fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .upsert_locations(&[
                location("oakley", "2525", "Oakley Ave", "Cincinnati", 39.1457, -84.4317),
                location("landsbrook", "7", "Landsbrook Dr", "Cincinnati", 39.2301, -84.3555),
                location("center", "1", "Fountain Sq", "Cincinnati", 39.1031, -84.5120),
                location("main-a", "10", "Main St", "Cincinnati", 39.1050, -84.5110),
                location("main-b", "12", "Main St", "Norwood", 39.1560, -84.4530),
                location("oak-ln", "3", "Oak Ln", "Norwood", 39.1580, -84.4560),
            ])
            .await
            .unwrap();
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_are_clamped() {
        assert_eq!(clamp_limit(0), DEFAULT_LIMIT);
        assert_eq!(clamp_limit(7), 7);
        assert_eq!(clamp_limit(10_000), MAX_LIMIT);
    }

    #[test]
    fn geo_filter_validates() {
        let filter = GeoFilter {
            center: GeoPoint::new(39.1, -84.5),
            radius: 0.0,
            unit: DistanceUnit::Miles,
        };
        assert!(matches!(filter.bbox(), Err(SearchError::Validation(_))));

        let filter = GeoFilter {
            radius: 1.0,
            ..filter
        };
        assert!(filter.bbox().unwrap().contains(39.1, -84.5));
    }
}
