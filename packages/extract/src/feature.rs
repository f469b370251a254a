//! Conversion of a single point feature into a [`NewLocation`].

use address_map_location_models::NewLocation;
use geojson::Feature;
use serde_json::Map;
use sha2::{Digest as _, Sha256};

use crate::ExtractContext;
use crate::field_keys::{AddressField, FieldKeyTable};

/// Stored region codes are truncated to this many characters.
pub const REGION_MAX_LEN: usize = 2;

/// Why a feature was skipped instead of extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Missing, non-point, or out-of-range geometry.
    Geometry,
    /// Neither a house number nor a street.
    Empty,
}

/// Extracts an address record from a point feature.
///
/// # Errors
///
/// Returns the [`SkipReason`] if the feature has no usable point geometry
/// or carries no address.
pub fn extract_location(
    feature: &Feature,
    keys: &FieldKeyTable,
    ctx: &ExtractContext,
) -> Result<NewLocation, SkipReason> {
    let (longitude, latitude) = point_of(feature).ok_or(SkipReason::Geometry)?;

    let empty = Map::new();
    let props = feature.properties.as_ref().unwrap_or(&empty);

    let house_number = keys.resolve(AddressField::HouseNumber, props);
    let street = keys.resolve(AddressField::Street, props);
    if house_number.is_none() && street.is_none() {
        return Err(SkipReason::Empty);
    }

    let region = keys
        .resolve(AddressField::Region, props)
        .unwrap_or_else(|| ctx.region.clone());
    let district = keys
        .resolve(AddressField::District, props)
        .or_else(|| non_empty(&ctx.sub_region));

    let hash = keys.resolve(AddressField::Hash, props).unwrap_or_else(|| {
        derive_hash(
            &ctx.sub_region,
            house_number.as_deref(),
            street.as_deref(),
            latitude,
            longitude,
        )
    });

    Ok(NewLocation {
        hash,
        house_number,
        street,
        unit: keys.resolve(AddressField::Unit, props),
        city: keys.resolve(AddressField::City, props),
        district,
        region: non_empty(&truncate_region(&region)),
        postal_code: keys.resolve(AddressField::PostalCode, props),
        latitude,
        longitude,
    })
}

/// Deterministic hash for features without a pre-computed one.
///
/// Same sub-region, address and coordinates always produce the same hash,
/// so re-ingesting a file never creates duplicates.
#[must_use]
pub fn derive_hash(
    sub_region: &str,
    house_number: Option<&str>,
    street: Option<&str>,
    latitude: f64,
    longitude: f64,
) -> String {
    let input = format!(
        "{sub_region}|{}|{}|{latitude}|{longitude}",
        house_number.unwrap_or_default(),
        street.unwrap_or_default(),
    );
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Upper-cased region code truncated to [`REGION_MAX_LEN`] characters.
#[must_use]
pub fn truncate_region(region: &str) -> String {
    region
        .trim()
        .chars()
        .take(REGION_MAX_LEN)
        .collect::<String>()
        .to_uppercase()
}

/// `(longitude, latitude)` of a point feature, if valid.
fn point_of(feature: &Feature) -> Option<(f64, f64)> {
    let geometry = feature.geometry.as_ref()?;
    let geojson::Value::Point(coords) = &geometry.value else {
        return None;
    };
    let [lon, lat] = coords.as_slice() else {
        return None;
    };
    let (lon, lat) = (*lon, *lat);

    if !lon.is_finite() || !lat.is_finite() {
        return None;
    }
    if !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat) {
        return None;
    }
    Some((lon, lat))
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    fn ctx() -> ExtractContext {
        ExtractContext {
            region: "OH".to_string(),
            sub_region: "Hamilton".to_string(),
        }
    }

    fn feature(value: Value) -> Feature {
        Feature::from_json_value(value).unwrap()
    }

    #[test]
    fn extracts_full_address() {
        let f = feature(json!({
            "type": "Feature",
            "geometry": { "type": "Point", "coordinates": [-84.4317, 39.1457] },
            "properties": {
                "number": "2525",
                "street": "Oakley Ave",
                "city": "Cincinnati",
                "postcode": "45209",
                "region": "oh",
                "hash": "abc123"
            }
        }));

        let loc = extract_location(&f, &FieldKeyTable::default(), &ctx()).unwrap();
        assert_eq!(loc.hash, "abc123");
        assert_eq!(loc.house_number.as_deref(), Some("2525"));
        assert_eq!(loc.street.as_deref(), Some("Oakley Ave"));
        assert_eq!(loc.city.as_deref(), Some("Cincinnati"));
        assert_eq!(loc.postal_code.as_deref(), Some("45209"));
        assert_eq!(loc.region.as_deref(), Some("OH"));
        assert_eq!(loc.district.as_deref(), Some("Hamilton"));
        assert!((loc.latitude - 39.1457).abs() < f64::EPSILON);
        assert!((loc.longitude - -84.4317).abs() < f64::EPSILON);
    }

    #[test]
    fn falls_back_to_dataset_region_and_derived_hash() {
        let f = feature(json!({
            "type": "Feature",
            "geometry": { "type": "Point", "coordinates": [-84.5, 39.1] },
            "properties": { "street": "Landsbrook Dr" }
        }));

        let loc = extract_location(&f, &FieldKeyTable::default(), &ctx()).unwrap();
        assert_eq!(loc.region.as_deref(), Some("OH"));
        assert_eq!(
            loc.hash,
            derive_hash("Hamilton", None, Some("Landsbrook Dr"), 39.1, -84.5)
        );
        assert_eq!(loc.hash.len(), 64);
    }

    #[test]
    fn long_region_is_truncated() {
        let f = feature(json!({
            "type": "Feature",
            "geometry": { "type": "Point", "coordinates": [-84.5, 39.1] },
            "properties": { "number": "1", "state": "Ohio" }
        }));

        let loc = extract_location(&f, &FieldKeyTable::default(), &ctx()).unwrap();
        assert_eq!(loc.region.as_deref(), Some("OH"));
    }

    #[test]
    fn derived_hash_is_deterministic() {
        let a = derive_hash("Hamilton", Some("1"), Some("Main St"), 39.0, -84.0);
        let b = derive_hash("Hamilton", Some("1"), Some("Main St"), 39.0, -84.0);
        let c = derive_hash("Butler", Some("1"), Some("Main St"), 39.0, -84.0);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn skips_non_point_geometry() {
        let f = feature(json!({
            "type": "Feature",
            "geometry": { "type": "LineString", "coordinates": [[0.0, 0.0], [1.0, 1.0]] },
            "properties": { "number": "1", "street": "Main St" }
        }));
        assert_eq!(
            extract_location(&f, &FieldKeyTable::default(), &ctx()),
            Err(SkipReason::Geometry)
        );
    }

    #[test]
    fn skips_missing_geometry() {
        let f = feature(json!({
            "type": "Feature",
            "geometry": null,
            "properties": { "number": "1" }
        }));
        assert_eq!(
            extract_location(&f, &FieldKeyTable::default(), &ctx()),
            Err(SkipReason::Geometry)
        );
    }

    #[test]
    fn skips_out_of_range_and_3d_points() {
        let keys = FieldKeyTable::default();
        let out_of_range = feature(json!({
            "type": "Feature",
            "geometry": { "type": "Point", "coordinates": [-200.0, 39.0] },
            "properties": { "number": "1" }
        }));
        let three_d = feature(json!({
            "type": "Feature",
            "geometry": { "type": "Point", "coordinates": [-84.0, 39.0, 10.0] },
            "properties": { "number": "1" }
        }));
        assert_eq!(
            extract_location(&out_of_range, &keys, &ctx()),
            Err(SkipReason::Geometry)
        );
        assert_eq!(
            extract_location(&three_d, &keys, &ctx()),
            Err(SkipReason::Geometry)
        );
    }

    #[test]
    fn skips_features_without_address() {
        let f = feature(json!({
            "type": "Feature",
            "geometry": { "type": "Point", "coordinates": [-84.0, 39.0] },
            "properties": { "city": "Cincinnati", "number": "" }
        }));
        assert_eq!(
            extract_location(&f, &FieldKeyTable::default(), &ctx()),
            Err(SkipReason::Empty)
        );
    }
}
