//! Unpacks multi-file uploads sent as a zip archive.

use std::io::{Cursor, Read as _};
use std::path::Path;

use address_map_ingest::IngestError;
use address_map_ingest_models::UploadFile;

/// Reads every regular file from a zip archive held in memory.
///
/// Directory entries, `__MACOSX/` resource forks, and hidden files are
/// skipped. Entries keep their archive order. At most `limit` bytes are
/// decompressed across all entries, whatever sizes the headers declare.
///
/// # Errors
///
/// Returns [`IngestError::Validation`] if the body is not a readable zip
/// archive, holds no files, or unpacks to more than `limit` bytes.
pub fn read_zip(bytes: &[u8], limit: usize) -> Result<Vec<UploadFile>, IngestError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| IngestError::Validation(format!("Invalid zip archive: {e}")))?;

    let mut files = Vec::with_capacity(archive.len());
    let mut remaining = limit;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| IngestError::Validation(format!("Corrupt zip entry {i}: {e}")))?;

        if entry.is_dir() || entry.name().starts_with("__MACOSX/") {
            continue;
        }

        let Some(filename) = Path::new(entry.name())
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
        else {
            continue;
        };
        if filename.starts_with('.') {
            log::debug!("Skipping hidden archive entry {}", entry.name());
            continue;
        }

        let declared = usize::try_from(entry.size()).unwrap_or(usize::MAX);
        let mut contents = Vec::with_capacity(declared.min(remaining));
        // One byte past the budget is enough to tell an oversized entry.
        let budget = u64::try_from(remaining).unwrap_or(u64::MAX).saturating_add(1);
        (&mut entry)
            .take(budget)
            .read_to_end(&mut contents)
            .map_err(|e| {
                IngestError::Validation(format!("Failed to read {filename} from archive: {e}"))
            })?;
        if contents.len() > remaining {
            return Err(IngestError::Validation(format!(
                "Archive unpacks to more than {limit} bytes"
            )));
        }
        remaining -= contents.len();

        files.push(UploadFile {
            filename,
            bytes: contents,
        });
    }

    if files.is_empty() {
        return Err(IngestError::Validation(
            "Archive contains no files".to_string(),
        ));
    }

    Ok(files)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write as _;

    use super::*;

    pub fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, contents) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn reads_files_in_archive_order() {
        let bytes = build_zip(&[
            ("adams/part1.geojson", b"{}"),
            ("__MACOSX/adams/._part1.geojson", b"junk"),
            ("adams/.DS_Store", b"junk"),
            ("part2.ndjson.gz", b"\x1f\x8b"),
        ]);

        let files = read_zip(&bytes, 1024).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["part1.geojson", "part2.ndjson.gz"]);
        assert_eq!(files[0].bytes, b"{}");
    }

    #[test]
    fn rejects_non_zip_bodies() {
        assert!(matches!(
            read_zip(b"not a zip", 1024),
            Err(IngestError::Validation(_))
        ));
    }

    #[test]
    fn rejects_archives_without_files() {
        let bytes = build_zip(&[("__MACOSX/x", b"junk")]);
        assert!(matches!(read_zip(&bytes, 1024), Err(IngestError::Validation(_))));
    }

    #[test]
    fn stops_decompressing_past_the_limit() {
        let zeros = vec![0_u8; 64 * 1024];
        let bytes = build_zip(&[("zeros.geojson", zeros.as_slice())]);
        assert!(bytes.len() < 1024);

        let err = read_zip(&bytes, 4096).unwrap_err();
        assert!(matches!(err, IngestError::Validation(ref m) if m.contains("4096")));
    }

    #[test]
    fn limit_covers_all_entries_together() {
        let part = vec![b'x'; 600];
        let bytes = build_zip(&[("a.geojson", part.as_slice()), ("b.geojson", part.as_slice())]);

        assert!(matches!(
            read_zip(&bytes, 1000),
            Err(IngestError::Validation(_))
        ));
        assert_eq!(read_zip(&bytes, 1200).unwrap().len(), 2);
    }
}
