//! Upload validation and raw file storage.
//!
//! Everything here runs before processing starts: requests are rejected
//! before any file or row exists, and accepted files are written to disk
//! unmodified so a failed import can be retried without re-uploading.

use std::path::{Path, PathBuf};

use address_map_database::LocationStore;
use address_map_ingest_models::{UploadFile, UploadMetadata};
use address_map_location_models::{Dataset, FEATURE_EXTENSIONS, NewDataset, SourceFormat};
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt as _;

use crate::IngestError;

/// Attempts at finding a free destination name before giving up.
const MAX_NAME_ATTEMPTS: u32 = 100;

/// Checks the metadata and every file name of an upload.
///
/// Returns the detected format of each file, in order.
///
/// # Errors
///
/// Returns [`IngestError::Validation`] naming the first problem found.
pub fn validate(
    metadata: &UploadMetadata,
    files: &[UploadFile],
) -> Result<Vec<SourceFormat>, IngestError> {
    let required = [
        ("name", &metadata.name),
        ("region", &metadata.region),
        ("subRegion", &metadata.sub_region),
    ];
    let missing: Vec<&str> = required
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(field, _)| *field)
        .collect();
    if !missing.is_empty() {
        return Err(IngestError::Validation(format!(
            "Missing required field(s): {}",
            missing.join(", ")
        )));
    }

    if files.is_empty() {
        return Err(IngestError::Validation("No files were uploaded".to_string()));
    }

    files
        .iter()
        .map(|file| {
            SourceFormat::from_filename(&file.filename).ok_or_else(|| {
                IngestError::Validation(format!(
                    "Unsupported file type for {:?}; expected one of: {}",
                    file.filename,
                    allowed_extensions()
                ))
            })
        })
        .collect()
}

fn allowed_extensions() -> String {
    FEATURE_EXTENSIONS
        .iter()
        .flat_map(|ext| [format!(".{ext}"), format!(".{ext}.gz")])
        .collect::<Vec<_>>()
        .join(", ")
}

/// Splits a file name into its stem and recognised extension(s)
/// (e.g. `"ohio.geojson.gz"` → `("ohio", ".geojson.gz")`).
///
/// Any directory components are dropped.
#[must_use]
pub fn split_extension(filename: &str) -> (&str, &str) {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename);
    let lower = base.to_ascii_lowercase();

    for ext in FEATURE_EXTENSIONS {
        for suffix in [format!(".{ext}.gz"), format!(".{ext}")] {
            if lower.ends_with(&suffix) {
                let at = base.len() - suffix.len();
                return (&base[..at], &base[at..]);
            }
        }
    }

    match base.rfind('.') {
        Some(at) if at > 0 => (&base[..at], &base[at..]),
        _ => (base, ""),
    }
}

/// Reduces a file stem to `[A-Za-z0-9_-]`, collapsing runs of anything
/// else into a single underscore.
#[must_use]
pub fn sanitize_stem(stem: &str) -> String {
    let mut out = String::with_capacity(stem.len());
    for c in stem.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }

    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Destination file name: `<UTC timestamp with millis>_<stem><ext>`.
#[must_use]
pub fn destination_name(filename: &str, now: DateTime<Utc>) -> String {
    let (stem, ext) = split_extension(filename);
    format!(
        "{}_{}{}",
        now.format("%Y%m%d%H%M%S%3f"),
        sanitize_stem(stem),
        ext.to_ascii_lowercase()
    )
}

/// Display name of one file in an upload: the metadata name, suffixed
/// with the file stem when the upload has several files.
#[must_use]
pub fn display_name(metadata: &UploadMetadata, filename: &str, file_count: usize) -> String {
    let name = metadata.name.trim();
    if file_count > 1 {
        format!("{name} - {}", split_extension(filename).0)
    } else {
        name.to_string()
    }
}

/// Creates the upload directory.
///
/// # Errors
///
/// Returns [`IngestError::Io`] if the directory cannot be created.
pub async fn ensure_upload_dir(dir: &Path) -> Result<(), IngestError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| IngestError::io(dir, e))
}

/// Writes the raw bytes under a fresh destination name that does not
/// collide with an existing file.
///
/// # Errors
///
/// Returns [`IngestError::Io`] if no file could be created or written.
pub async fn write_raw_file(dir: &Path, file: &UploadFile) -> Result<PathBuf, IngestError> {
    let name = destination_name(&file.filename, Utc::now());
    let (stem, ext) = split_extension(&name);

    for attempt in 0..MAX_NAME_ATTEMPTS {
        let path = if attempt == 0 {
            dir.join(&name)
        } else {
            dir.join(format!("{stem}-{attempt}{ext}"))
        };

        let mut out = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(out) => out,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(IngestError::io(&path, e)),
        };

        let written = async {
            out.write_all(&file.bytes).await?;
            out.flush().await
        }
        .await;

        if let Err(e) = written {
            tokio::fs::remove_file(&path).await.ok();
            return Err(IngestError::io(&path, e));
        }
        return Ok(path);
    }

    Err(IngestError::io(
        &dir.join(&name),
        std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "no free destination name",
        ),
    ))
}

/// Writes one validated file to disk and creates its pending dataset row.
///
/// If the row cannot be created the written file is removed again.
///
/// # Errors
///
/// Returns [`IngestError`] if writing the file or inserting the row fails.
pub async fn store_upload(
    store: &dyn LocationStore,
    upload_dir: &Path,
    metadata: &UploadMetadata,
    name: String,
    file: &UploadFile,
    format: SourceFormat,
) -> Result<Dataset, IngestError> {
    let path = write_raw_file(upload_dir, file).await?;

    let new = NewDataset {
        name,
        region: metadata.region.trim().to_string(),
        sub_region: metadata.sub_region.trim().to_string(),
        format,
        file_path: path.display().to_string(),
        file_size: file.bytes.len() as u64,
        uploaded_by: metadata.uploaded_by.clone(),
    };

    match store.insert_dataset(&new).await {
        Ok(dataset) => {
            log::info!(
                "Stored {} ({} bytes) as dataset {} at {}",
                file.filename,
                dataset.file_size,
                dataset.id,
                dataset.file_path
            );
            Ok(dataset)
        }
        Err(e) => {
            tokio::fs::remove_file(&path).await.ok();
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    fn metadata() -> UploadMetadata {
        UploadMetadata {
            name: "Ohio addresses".to_string(),
            region: "OH".to_string(),
            sub_region: "Adams".to_string(),
            uploaded_by: "tester".to_string(),
        }
    }

    fn file(name: &str) -> UploadFile {
        UploadFile {
            filename: name.to_string(),
            bytes: b"{}".to_vec(),
        }
    }

    #[test]
    fn validate_accepts_supported_files() {
        let formats = validate(
            &metadata(),
            &[file("a.geojson"), file("b.ndjson.gz"), file("C.JSON")],
        )
        .unwrap();
        assert_eq!(
            formats,
            vec![
                SourceFormat::Geojson,
                SourceFormat::GeojsonGz,
                SourceFormat::Geojson
            ]
        );
    }

    #[test]
    fn validate_rejects_missing_region() {
        let mut meta = metadata();
        meta.region = "  ".to_string();
        let err = validate(&meta, &[file("a.geojson")]).unwrap_err();
        assert!(matches!(err, IngestError::Validation(ref m) if m.contains("region")));
    }

    #[test]
    fn validate_rejects_disallowed_extension() {
        let err = validate(&metadata(), &[file("a.geojson"), file("b.csv")]).unwrap_err();
        assert!(matches!(err, IngestError::Validation(ref m) if m.contains("b.csv")));
    }

    #[test]
    fn validate_rejects_empty_upload() {
        assert!(matches!(
            validate(&metadata(), &[]),
            Err(IngestError::Validation(_))
        ));
    }

    #[test]
    fn splits_compound_extensions() {
        assert_eq!(split_extension("ohio.geojson.gz"), ("ohio", ".geojson.gz"));
        assert_eq!(split_extension("dir/ohio.v2.json"), ("ohio.v2", ".json"));
        assert_eq!(split_extension("README"), ("README", ""));
    }

    #[test]
    fn destination_name_is_timestamped_and_sanitized() {
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 12, 30, 45).unwrap();
        assert_eq!(
            destination_name("../Hamilton County (2025).GeoJSON", now),
            "20260105123045000_Hamilton_County_2025.geojson"
        );
        assert_eq!(
            destination_name("???.ndjson.gz", now),
            "20260105123045000_upload.ndjson.gz"
        );
    }

    #[test]
    fn display_name_includes_stem_for_batches() {
        assert_eq!(display_name(&metadata(), "adams.geojson", 1), "Ohio addresses");
        assert_eq!(
            display_name(&metadata(), "adams.geojson", 2),
            "Ohio addresses - adams"
        );
    }

    #[tokio::test]
    async fn write_raw_file_never_overwrites() {
        let dir = std::env::temp_dir().join(format!("address_map_gateway_{}", uuid::Uuid::new_v4()));
        ensure_upload_dir(&dir).await.unwrap();

        let a = write_raw_file(&dir, &file("same.geojson")).await.unwrap();
        let b = write_raw_file(&dir, &file("same.geojson")).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(std::fs::read(&a).unwrap(), b"{}");
        assert_eq!(std::fs::read(&b).unwrap(), b"{}");

        std::fs::remove_dir_all(&dir).ok();
    }
}
