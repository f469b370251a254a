//! Streaming iterator over the address records of a source file.

use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;

use address_map_location_models::{NewLocation, SourceFormat};
use geojson::Feature;
use serde_json::Value;

use crate::collection::stream_collection;
use crate::detect::{Framing, SourceStream, open_source};
use crate::feature::{SkipReason, extract_location};
use crate::{ExtractContext, ExtractError, FieldKeyTable};

/// Counters accumulated while reading a source file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    /// Feature entries seen, including skipped ones.
    pub features: u64,
    /// Features converted into records.
    pub accepted: u64,
    /// Features skipped for missing or non-point geometry.
    pub skipped_geometry: u64,
    /// Entries that were not valid features.
    pub skipped_malformed: u64,
    /// Features with neither house number nor street.
    pub skipped_empty: u64,
}

impl ExtractStats {
    /// Total skipped entries.
    #[must_use]
    pub const fn skipped(&self) -> u64 {
        self.skipped_geometry + self.skipped_malformed + self.skipped_empty
    }
}

enum Entries {
    Lines(Box<dyn BufRead + Send>),
    Collection(Receiver<Result<Value, ExtractError>>),
}

/// Iterator of extracted [`NewLocation`]s.
///
/// Yields `Err` at most once, for a file-level failure or cancellation,
/// and then ends.
pub struct LocationReader {
    path: String,
    entries: Entries,
    keys: FieldKeyTable,
    ctx: ExtractContext,
    cancel: Option<Arc<AtomicBool>>,
    stats: ExtractStats,
    line: Vec<u8>,
    done: bool,
}

impl LocationReader {
    /// Opens a source file for reading.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::Io`] if the file cannot be opened. A
    /// malformed aggregate collection surfaces as an `Err` item once
    /// iteration reaches the broken part.
    pub fn open(
        path: &Path,
        format: SourceFormat,
        keys: FieldKeyTable,
        ctx: ExtractContext,
    ) -> Result<Self, ExtractError> {
        let stream = open_source(path, format)?;
        Self::from_stream(path.display().to_string(), stream, keys, ctx)
    }

    /// Builds a reader over an already opened stream.
    ///
    /// # Errors
    ///
    /// Infallible today; kept fallible alongside [`Self::open`].
    pub fn from_stream(
        path: String,
        stream: SourceStream,
        keys: FieldKeyTable,
        ctx: ExtractContext,
    ) -> Result<Self, ExtractError> {
        let entries = match stream.framing {
            Framing::LineDelimited => Entries::Lines(stream.reader),
            Framing::Collection => {
                Entries::Collection(stream_collection(path.clone(), stream.reader))
            }
        };

        Ok(Self {
            path,
            entries,
            keys,
            ctx,
            cancel: None,
            stats: ExtractStats::default(),
            line: Vec::new(),
            done: false,
        })
    }

    /// Stops iteration with [`ExtractError::Cancelled`] once `flag` is set.
    #[must_use]
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Counters so far.
    #[must_use]
    pub const fn stats(&self) -> ExtractStats {
        self.stats
    }

    fn next_entry(&mut self) -> Option<Result<Value, ExtractError>> {
        match &mut self.entries {
            Entries::Collection(rx) => rx.recv().ok(),
            Entries::Lines(reader) => loop {
                self.line.clear();
                match reader.read_until(b'\n', &mut self.line) {
                    Ok(0) => return None,
                    Ok(_) => {
                        let trimmed = self.line.trim_ascii();
                        if trimmed.is_empty() {
                            continue;
                        }
                        // A line that isn't UTF-8 JSON still counts as a
                        // (malformed) entry.
                        return Some(Ok(serde_json::from_slice(trimmed).unwrap_or(Value::Null)));
                    }
                    Err(e) => {
                        return Some(Err(ExtractError::Io {
                            path: self.path.clone(),
                            source: e,
                        }));
                    }
                }
            },
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

impl Iterator for LocationReader {
    type Item = Result<NewLocation, ExtractError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if self.is_cancelled() {
                self.done = true;
                return Some(Err(ExtractError::Cancelled));
            }

            let value = match self.next_entry()? {
                Ok(value) => value,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            self.stats.features += 1;

            let feature = match Feature::from_json_value(value) {
                Ok(feature) => feature,
                Err(e) => {
                    log::trace!("Skipping malformed feature in {}: {e}", self.path);
                    self.stats.skipped_malformed += 1;
                    continue;
                }
            };

            match extract_location(&feature, &self.keys, &self.ctx) {
                Ok(location) => {
                    self.stats.accepted += 1;
                    return Some(Ok(location));
                }
                Err(SkipReason::Geometry) => self.stats.skipped_geometry += 1,
                Err(SkipReason::Empty) => self.stats.skipped_empty += 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::path::PathBuf;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    fn ctx() -> ExtractContext {
        ExtractContext {
            region: "OH".to_string(),
            sub_region: "Hamilton".to_string(),
        }
    }

    fn temp_path(ext: &str) -> PathBuf {
        std::env::temp_dir().join(format!("address_map_extract_{}.{ext}", uuid::Uuid::new_v4()))
    }

    fn point(lon: f64, lat: f64, number: &str, street: &str) -> String {
        format!(
            r#"{{"type":"Feature","geometry":{{"type":"Point","coordinates":[{lon},{lat}]}},"properties":{{"number":"{number}","street":"{street}","city":"Cincinnati"}}}}"#
        )
    }

    fn collection(features: &[String]) -> String {
        format!(
            r#"{{"type":"FeatureCollection","features":[{}]}}"#,
            features.join(",")
        )
    }

    fn read_all(path: &Path, format: SourceFormat) -> (Vec<NewLocation>, ExtractStats) {
        let mut reader =
            LocationReader::open(path, format, FieldKeyTable::default(), ctx()).unwrap();
        let locations = reader.by_ref().collect::<Result<Vec<_>, _>>().unwrap();
        (locations, reader.stats())
    }

    #[test]
    fn reads_feature_collection() {
        let path = temp_path("geojson");
        let body = collection(&[
            point(-84.4317, 39.1457, "2525", "Oakley Ave"),
            point(-84.4, 39.2, "10", "Landsbrook Dr"),
            r#"{"type":"Feature","geometry":{"type":"LineString","coordinates":[[0,0],[1,1]]},"properties":{"number":"1"}}"#.to_string(),
        ]);
        std::fs::write(&path, body).unwrap();

        let (locations, stats) = read_all(&path, SourceFormat::Geojson);
        std::fs::remove_file(&path).ok();

        assert_eq!(locations.len(), 2);
        assert_eq!(locations[0].street.as_deref(), Some("Oakley Ave"));
        assert_eq!(stats.features, 3);
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.skipped_geometry, 1);
    }

    #[test]
    fn reads_line_delimited_with_bad_lines() {
        let path = temp_path("geojsonl");
        let body = [
            point(-84.4317, 39.1457, "2525", "Oakley Ave"),
            String::new(),
            "this is not json".to_string(),
            r#"{"type":"Feature","geometry":{"type":"Point","coordinates":[-84.0,39.0]},"properties":{"city":"Nowhere"}}"#.to_string(),
            point(-84.4, 39.2, "10", "Landsbrook Dr"),
        ]
        .join("\n");
        std::fs::write(&path, body).unwrap();

        let (locations, stats) = read_all(&path, SourceFormat::Geojson);
        std::fs::remove_file(&path).ok();

        assert_eq!(locations.len(), 2);
        assert_eq!(stats.features, 4);
        assert_eq!(stats.skipped_malformed, 1);
        assert_eq!(stats.skipped_empty, 1);
        assert_eq!(stats.skipped(), 2);
    }

    #[test]
    fn reads_gzip_compressed_file() {
        let path = temp_path("geojson.gz");
        let body = collection(&[point(-84.4317, 39.1457, "2525", "Oakley Ave")]);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(body.as_bytes()).unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();

        let (locations, stats) = read_all(&path, SourceFormat::GeojsonGz);
        std::fs::remove_file(&path).ok();

        assert_eq!(locations.len(), 1);
        assert_eq!(stats.accepted, 1);
    }

    #[test]
    fn bare_feature_document_is_one_record() {
        let path = temp_path("json");
        std::fs::write(
            &path,
            format!("\n{}", point(-84.4, 39.2, "10", "Landsbrook Dr")).replace(',', ",\n"),
        )
        .unwrap();

        let (locations, _) = read_all(&path, SourceFormat::Geojson);
        std::fs::remove_file(&path).ok();

        assert_eq!(locations.len(), 1);
    }

    #[test]
    fn malformed_collection_is_a_file_error() {
        let path = temp_path("geojson");
        std::fs::write(
            &path,
            format!(
                r#"{{"type":"FeatureCollection","features":[{},{{"type":}}]}}"#,
                point(-84.4317, 39.1457, "2525", "Oakley Ave")
            ),
        )
        .unwrap();

        let mut reader = LocationReader::open(
            &path,
            SourceFormat::Geojson,
            FieldKeyTable::default(),
            ctx(),
        )
        .unwrap();
        std::fs::remove_file(&path).ok();

        assert!(matches!(reader.next(), Some(Ok(_))));
        assert!(matches!(
            reader.next(),
            Some(Err(ExtractError::Malformed { .. }))
        ));
        assert!(reader.next().is_none());
    }

    #[test]
    fn non_utf8_line_is_skipped_and_reading_continues() {
        let path = temp_path("ndjson");
        let mut body = point(-84.4317, 39.1457, "2525", "Oakley Ave").into_bytes();
        body.extend_from_slice(b"\n\xff\xfe garbage\n");
        body.extend_from_slice(point(-84.4, 39.2, "10", "Landsbrook Dr").as_bytes());
        body.push(b'\n');
        std::fs::write(&path, body).unwrap();

        let (locations, stats) = read_all(&path, SourceFormat::Geojson);
        std::fs::remove_file(&path).ok();

        assert_eq!(locations.len(), 2);
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.skipped_malformed, 1);
    }

    #[test]
    fn non_utf8_string_inside_a_line_is_malformed() {
        let path = temp_path("ndjson");
        let mut body = point(-84.4317, 39.1457, "2525", "Oakley Ave").into_bytes();
        body.extend_from_slice(b"\n{\"type\":\"Feature\",\"properties\":{\"street\":\"\xc3\x28\"}}\n");
        std::fs::write(&path, body).unwrap();

        let (locations, stats) = read_all(&path, SourceFormat::Geojson);
        std::fs::remove_file(&path).ok();

        assert_eq!(locations.len(), 1);
        assert_eq!(stats.skipped_malformed, 1);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let result = LocationReader::open(
            &temp_path("geojson"),
            SourceFormat::Geojson,
            FieldKeyTable::default(),
            ctx(),
        );
        assert!(matches!(result, Err(ExtractError::Io { .. })));
    }

    #[test]
    fn cancellation_stops_iteration() {
        let path = temp_path("geojson");
        let body = collection(&[
            point(-84.4317, 39.1457, "2525", "Oakley Ave"),
            point(-84.4, 39.2, "10", "Landsbrook Dr"),
        ]);
        std::fs::write(&path, body).unwrap();

        let flag = Arc::new(AtomicBool::new(false));
        let mut reader = LocationReader::open(
            &path,
            SourceFormat::Geojson,
            FieldKeyTable::default(),
            ctx(),
        )
        .unwrap()
        .with_cancel(Arc::clone(&flag));
        std::fs::remove_file(&path).ok();

        assert!(matches!(reader.next(), Some(Ok(_))));
        flag.store(true, Ordering::Relaxed);
        assert!(matches!(reader.next(), Some(Err(ExtractError::Cancelled))));
        assert!(reader.next().is_none());
    }
}
