//! Great-circle distance and bounding-box primitives.

use address_map_location_models::BoundingBox;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::SearchError;

/// Miles spanned by one degree of latitude.
pub const MILES_PER_DEGREE_LAT: f64 = 69.0;

/// Mean Earth radius used by [`haversine_miles`].
pub const EARTH_RADIUS_MILES: f64 = 3959.0;

/// Kilometers per statute mile.
pub const KM_PER_MILE: f64 = 1.609_344;

/// A WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl GeoPoint {
    /// Creates a point.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Checks that both coordinates are finite and within WGS84 range.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::Validation`] otherwise.
    pub fn validate(self) -> Result<Self, SearchError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(SearchError::Validation(format!(
                "latitude must be between -90 and 90, got {}",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(SearchError::Validation(format!(
                "longitude must be between -180 and 180, got {}",
                self.longitude
            )));
        }
        Ok(self)
    }
}

/// Unit a search radius is expressed in.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum DistanceUnit {
    /// Statute miles.
    #[default]
    #[strum(to_string = "miles", serialize = "mi")]
    Miles,
    /// Kilometers.
    #[strum(to_string = "kilometers", serialize = "km")]
    Kilometers,
}

impl DistanceUnit {
    /// Converts `value` in this unit to miles.
    #[must_use]
    pub fn to_miles(self, value: f64) -> f64 {
        match self {
            Self::Miles => value,
            Self::Kilometers => value / KM_PER_MILE,
        }
    }
}

/// Checks that a radius is finite and positive, returning it in miles.
///
/// # Errors
///
/// Returns [`SearchError::Validation`] otherwise.
pub fn radius_miles(radius: f64, unit: DistanceUnit) -> Result<f64, SearchError> {
    if !radius.is_finite() || radius <= 0.0 {
        return Err(SearchError::Validation(format!(
            "radius must be a positive number, got {radius}"
        )));
    }
    Ok(unit.to_miles(radius))
}

/// Approximate box enclosing every point within `radius_miles` of
/// `center`.
///
/// The longitude span widens by `1 / cos(latitude)` to follow meridian
/// convergence. A circle that crosses the antimeridian or reaches a pole
/// gets the full longitude range, since a single west-to-east box cannot
/// wrap; callers that need the exact circle filter by distance afterwards.
#[must_use]
pub fn bounding_box(center: GeoPoint, radius_miles: f64) -> BoundingBox {
    let lat_delta = radius_miles / MILES_PER_DEGREE_LAT;
    let south = center.latitude - lat_delta;
    let north = center.latitude + lat_delta;

    let cos_lat = center.latitude.to_radians().cos();
    let lon_delta = if cos_lat > f64::EPSILON {
        lat_delta / cos_lat
    } else {
        f64::INFINITY
    };
    let west = center.longitude - lon_delta;
    let east = center.longitude + lon_delta;

    let (west, east) = if west < -180.0 || east > 180.0 || south <= -90.0 || north >= 90.0 {
        (-180.0, 180.0)
    } else {
        (west, east)
    };

    BoundingBox::new(west, south.max(-90.0), east, north.min(90.0))
}

/// Great-circle distance in miles.
#[must_use]
pub fn haversine_miles(a: GeoPoint, b: GeoPoint) -> f64 {
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (d_lon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_MILES * h.sqrt().min(1.0).asin()
}

/// Whether `a` and `b` are at most `radius_miles` apart.
#[must_use]
pub fn within_radius(a: GeoPoint, b: GeoPoint, radius_miles: f64) -> bool {
    haversine_miles(a, b) <= radius_miles
}
