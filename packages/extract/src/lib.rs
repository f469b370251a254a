#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Point-feature format detection and address extraction.
//!
//! Turns the raw bytes of an uploaded point-feature collection (plain or
//! gzip-compressed, aggregate or one-feature-per-line) into a stream of
//! [`NewLocation`](address_map_location_models::NewLocation) records.
//! Property names are resolved through a configurable [`FieldKeyTable`].

pub mod collection;
pub mod detect;
pub mod feature;
pub mod field_keys;
pub mod reader;

pub use detect::Framing;
pub use field_keys::{AddressField, FieldKeyTable};
pub use reader::{ExtractStats, LocationReader};

/// Dataset-level values applied to every extracted feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractContext {
    /// Dataset region code; fallback for features without a region.
    pub region: String,
    /// Dataset sub-region label; fallback district and hash input.
    pub sub_region: String,
}

/// Errors from reading a source file.
///
/// Per-feature problems (malformed features, non-point geometry, empty
/// addresses) are never errors; they are counted in [`ExtractStats`].
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// I/O error reading or decompressing the file.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path that caused the error.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file is not a readable point-feature collection.
    #[error("Malformed feature collection in {path}: {message}")]
    Malformed {
        /// Path of the offending file.
        path: String,
        /// Description of what went wrong.
        message: String,
    },

    /// The field key table could not be loaded.
    #[error("Invalid field key table: {message}")]
    FieldKeys {
        /// Description of what went wrong.
        message: String,
    },

    /// Extraction was cancelled between records.
    #[error("cancelled")]
    Cancelled,
}
