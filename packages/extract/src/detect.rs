//! Framing detection and transparent decompression.

use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::path::Path;

use address_map_location_models::SourceFormat;
use flate2::bufread::MultiGzDecoder;
use serde_json::Value;

use crate::ExtractError;

/// Number of decompressed bytes inspected to decide the framing.
pub const SNIFF_LEN: u64 = 4096;

/// Gzip stream magic bytes.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// How features are laid out in a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// One `Feature` object per line.
    LineDelimited,
    /// A single aggregate `FeatureCollection` document.
    Collection,
}

/// Decides the framing from a prefix of the decompressed stream.
///
/// The stream is line-delimited only when its first non-blank line is, on
/// its own, a complete JSON object of type `Feature`. Anything else,
/// including a first line cut off by the prefix length, is treated as an
/// aggregate collection.
#[must_use]
pub fn sniff_framing(prefix: &[u8]) -> Framing {
    let text = String::from_utf8_lossy(prefix);
    let Some(first_line) = text.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return Framing::Collection;
    };

    match serde_json::from_str::<Value>(first_line) {
        Ok(Value::Object(obj)) if obj.get("type").and_then(Value::as_str) == Some("Feature") => {
            Framing::LineDelimited
        }
        _ => Framing::Collection,
    }
}

/// A decompressed, buffered source stream with its detected framing.
pub struct SourceStream {
    /// Detected framing.
    pub framing: Framing,
    /// The full decompressed stream, including the sniffed prefix.
    pub reader: Box<dyn BufRead + Send>,
}

/// Opens a source file, decompressing it when its format says so or when
/// it starts with the gzip magic bytes.
///
/// # Errors
///
/// Returns [`ExtractError::Io`] if the file cannot be opened or the
/// prefix cannot be read.
pub fn open_source(path: &Path, format: SourceFormat) -> Result<SourceStream, ExtractError> {
    let io_err = |e| ExtractError::Io {
        path: path.display().to_string(),
        source: e,
    };

    let file = File::open(path).map_err(io_err)?;
    let reader = decompress(BufReader::new(file), format).map_err(io_err)?;
    sniff_stream(reader).map_err(io_err)
}

/// Wraps `reader` in a gzip decoder when needed.
///
/// # Errors
///
/// Returns an I/O error if the magic bytes cannot be read.
pub fn decompress<R: BufRead + Send + 'static>(
    mut reader: R,
    format: SourceFormat,
) -> std::io::Result<Box<dyn BufRead + Send>> {
    let magic = reader.fill_buf()?.starts_with(&GZIP_MAGIC);

    if format.is_compressed() || magic {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(reader))))
    } else {
        Ok(Box::new(reader))
    }
}

/// Reads up to [`SNIFF_LEN`] bytes, detects the framing, and returns a
/// stream that replays the prefix before the remainder.
///
/// # Errors
///
/// Returns an I/O error if reading the prefix fails (e.g., a corrupt gzip
/// header).
pub fn sniff_stream(mut reader: Box<dyn BufRead + Send>) -> std::io::Result<SourceStream> {
    let mut prefix = Vec::with_capacity(usize::try_from(SNIFF_LEN).unwrap_or(4096));
    (&mut reader).take(SNIFF_LEN).read_to_end(&mut prefix)?;

    let framing = sniff_framing(&prefix);
    log::trace!("Detected {framing:?} framing from {} byte prefix", prefix.len());

    Ok(SourceStream {
        framing,
        reader: Box::new(BufReader::new(Cursor::new(prefix).chain(reader))),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    #[test]
    fn detects_line_delimited_features() {
        let data = b"{\"type\":\"Feature\",\"geometry\":null,\"properties\":{}}\n{\"type\":\"Feature\"}\n";
        assert_eq!(sniff_framing(data), Framing::LineDelimited);
    }

    #[test]
    fn skips_leading_blank_lines() {
        let data = b"\n   \n{\"type\":\"Feature\",\"properties\":{}}\n";
        assert_eq!(sniff_framing(data), Framing::LineDelimited);
    }

    #[test]
    fn detects_collection() {
        let data = b"{\n  \"type\": \"FeatureCollection\",\n  \"features\": []\n}";
        assert_eq!(sniff_framing(data), Framing::Collection);

        let single_line = b"{\"type\":\"FeatureCollection\",\"features\":[]}";
        assert_eq!(sniff_framing(single_line), Framing::Collection);
    }

    #[test]
    fn ambiguous_input_defaults_to_collection() {
        assert_eq!(sniff_framing(b""), Framing::Collection);
        assert_eq!(sniff_framing(b"not json at all"), Framing::Collection);
        assert_eq!(
            sniff_framing(b"{\"type\":\"Feature\",\"properties\":{\"cut"),
            Framing::Collection
        );
    }

    #[test]
    fn sniffing_preserves_the_whole_stream() {
        let body = format!(
            "{{\"type\":\"Feature\",\"properties\":{{\"pad\":\"{}\"}}}}\n",
            "x".repeat(5000)
        );
        let reader: Box<dyn BufRead + Send> = Box::new(Cursor::new(body.clone().into_bytes()));
        let mut stream = sniff_stream(reader).unwrap();

        let mut out = String::new();
        stream.reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, body);
        // First line is longer than the prefix, so the framing is ambiguous.
        assert_eq!(stream.framing, Framing::Collection);
    }

    #[test]
    fn decompresses_by_magic_bytes() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(b"{\"type\":\"Feature\",\"properties\":{}}\n")
            .unwrap();
        let gz = encoder.finish().unwrap();

        let reader = decompress(Cursor::new(gz), SourceFormat::Geojson).unwrap();
        let stream = sniff_stream(reader).unwrap();
        assert_eq!(stream.framing, Framing::LineDelimited);
    }

    #[test]
    fn plain_stream_passes_through() {
        let reader = decompress(Cursor::new(b"{}".to_vec()), SourceFormat::Geojson).unwrap();
        let mut out = String::new();
        sniff_stream(reader)
            .unwrap()
            .reader
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "{}");
    }
}
