//! Radius search: bounding-box prefilter, then exact haversine distance.

use address_map_database::LocationStore;
use address_map_location_models::LocationRecord;
use serde::{Deserialize, Serialize};

use crate::geo::{self, DistanceUnit, GeoPoint, KM_PER_MILE};
use crate::{OVERSAMPLE_FACTOR, SearchError, clamp_limit};

/// Records within a radius of a point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProximityQuery {
    /// Search center.
    pub center: GeoPoint,
    /// Radius in `unit`.
    pub radius: f64,
    /// Unit of `radius`.
    pub unit: DistanceUnit,
    /// Maximum results (clamped to [`crate::MAX_LIMIT`]).
    pub limit: u32,
}

/// A record with its distance from the search center.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyLocation {
    /// The matching record.
    pub record: LocationRecord,
    /// Great-circle distance in miles.
    pub distance_miles: f64,
    /// Great-circle distance in kilometers.
    pub distance_km: f64,
}

/// Result of comparing two points directly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WithinRadius {
    /// Whether the points are at most the radius apart.
    pub within: bool,
    /// Distance in miles.
    pub distance_miles: f64,
    /// Distance in kilometers.
    pub distance_km: f64,
}

/// Finds the records nearest `query.center` within its radius, nearest
/// first.
///
/// # Errors
///
/// Returns [`SearchError::Validation`] for invalid coordinates or radius,
/// or [`SearchError::Store`] if the store query fails.
pub async fn nearby(
    store: &dyn LocationStore,
    query: &ProximityQuery,
) -> Result<Vec<NearbyLocation>, SearchError> {
    let center = query.center.validate()?;
    let radius_miles = geo::radius_miles(query.radius, query.unit)?;
    let limit = clamp_limit(query.limit);

    let bbox = geo::bounding_box(center, radius_miles);
    let candidates = store
        .locations_in_bbox(&bbox, limit.saturating_mul(OVERSAMPLE_FACTOR))
        .await?;
    let candidate_count = candidates.len();

    let results = rank_by_distance(center, radius_miles, candidates, limit);
    log::debug!(
        "Proximity search ({}, {}) r={radius_miles:.3}mi: {candidate_count} candidates, {} results",
        center.latitude,
        center.longitude,
        results.len()
    );
    Ok(results)
}

/// Drops candidates farther than `radius_miles` from `center`, stably
/// sorts the rest by true distance, and keeps the first `limit`.
#[must_use]
pub fn rank_by_distance(
    center: GeoPoint,
    radius_miles: f64,
    candidates: Vec<LocationRecord>,
    limit: u32,
) -> Vec<NearbyLocation> {
    let mut results: Vec<NearbyLocation> = candidates
        .into_iter()
        .filter_map(|record| {
            let distance_miles = geo::haversine_miles(
                center,
                GeoPoint::new(record.latitude, record.longitude),
            );
            (distance_miles <= radius_miles).then(|| NearbyLocation {
                record,
                distance_miles,
                distance_km: distance_miles * KM_PER_MILE,
            })
        })
        .collect();

    results.sort_by(|a, b| a.distance_miles.total_cmp(&b.distance_miles));
    results.truncate(limit as usize);
    results
}

/// Compares two points against a radius without touching the store.
///
/// # Errors
///
/// Returns [`SearchError::Validation`] for invalid coordinates or radius.
pub fn within(
    a: GeoPoint,
    b: GeoPoint,
    radius: f64,
    unit: DistanceUnit,
) -> Result<WithinRadius, SearchError> {
    let radius_miles = geo::radius_miles(radius, unit)?;
    let distance_miles = geo::haversine_miles(a.validate()?, b.validate()?);

    Ok(WithinRadius {
        within: distance_miles <= radius_miles,
        distance_miles,
        distance_km: distance_miles * KM_PER_MILE,
    })
}
