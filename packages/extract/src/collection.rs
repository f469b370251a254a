//! Incremental parsing of aggregate feature collections.
//!
//! The document is walked with a serde visitor on a dedicated thread. Each
//! element of the top-level `features` array is sent through a bounded
//! channel as soon as it has been parsed, so memory stays proportional to
//! the channel capacity rather than the file size.

use std::fmt;
use std::io::BufRead;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};

use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Value};

use crate::ExtractError;

/// Parsed features buffered ahead of the consumer.
pub const COLLECTION_BUFFER: usize = 256;

const RECEIVER_CLOSED: &str = "feature receiver closed";

type Entry = Result<Value, ExtractError>;

/// Starts parsing `reader` and returns the receiving end of its features.
///
/// The channel yields every feature value in document order. A parse or
/// I/O failure arrives as a single trailing `Err`. A document without a
/// `features` array that is itself a `Feature` yields that one value.
/// Dropping the receiver stops the parser at the next feature.
#[must_use]
pub fn stream_collection(path: String, reader: Box<dyn BufRead + Send>) -> Receiver<Entry> {
    let (tx, rx) = sync_channel(COLLECTION_BUFFER);

    std::thread::spawn(move || {
        let mut deserializer = serde_json::Deserializer::from_reader(reader);
        let result = CollectionSeed { tx: &tx }
            .deserialize(&mut deserializer)
            .and_then(|()| deserializer.end());

        if let Err(e) = result {
            if e.to_string().starts_with(RECEIVER_CLOSED) {
                log::trace!("Stopped parsing {path}: reader dropped");
                return;
            }
            let error = if e.is_io() {
                ExtractError::Io {
                    path,
                    source: e.into(),
                }
            } else {
                ExtractError::Malformed {
                    path,
                    message: e.to_string(),
                }
            };
            tx.send(Err(error)).ok();
        }
    });

    rx
}

struct CollectionSeed<'a> {
    tx: &'a SyncSender<Entry>,
}

impl<'de> DeserializeSeed<'de> for CollectionSeed<'_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for CollectionSeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a FeatureCollection or Feature object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        let mut found = false;
        // Everything except `features`, kept in case the document is a bare Feature.
        let mut rest = Map::new();

        while let Some(key) = map.next_key::<String>()? {
            if key == "features" {
                map.next_value_seed(FeaturesSeed { tx: self.tx })?;
                found = true;
            } else if found {
                map.next_value::<IgnoredAny>()?;
            } else {
                rest.insert(key, map.next_value::<Value>()?);
            }
        }

        if found {
            return Ok(());
        }
        if rest.get("type").and_then(Value::as_str) == Some("Feature") {
            return self
                .tx
                .send(Ok(Value::Object(rest)))
                .map_err(|_| de::Error::custom(RECEIVER_CLOSED));
        }
        Err(de::Error::custom("no \"features\" array"))
    }
}

struct FeaturesSeed<'a> {
    tx: &'a SyncSender<Entry>,
}

impl<'de> DeserializeSeed<'de> for FeaturesSeed<'_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for FeaturesSeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a \"features\" array")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while let Some(value) = seq.next_element::<Value>()? {
            self.tx
                .send(Ok(value))
                .map_err(|_| de::Error::custom(RECEIVER_CLOSED))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufReader, Cursor, Read};

    use super::*;

    fn collect(doc: &str) -> Vec<Entry> {
        stream_collection(
            "test.geojson".to_string(),
            Box::new(Cursor::new(doc.as_bytes().to_vec())),
        )
        .into_iter()
        .collect()
    }

    /// Serves `prefix`, then fails every read.
    struct Truncated(Cursor<Vec<u8>>);

    impl Read for Truncated {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.0.read(buf)? {
                0 => Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "stream cut",
                )),
                n => Ok(n),
            }
        }
    }

    #[test]
    fn yields_features_in_order_around_other_keys() {
        let entries = collect(
            r#"{"type":"FeatureCollection","name":"x","features":[{"id":1},{"id":2}],"bbox":[0,0,1,1]}"#,
        );
        let ids: Vec<i64> = entries
            .into_iter()
            .map(|e| e.unwrap()["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn features_arrive_before_the_document_ends() {
        let prefix = br#"{"type":"FeatureCollection","features":[{"id":1},{"id":2},{"id""#;
        let reader = BufReader::new(Truncated(Cursor::new(prefix.to_vec())));
        let rx = stream_collection("cut.geojson".to_string(), Box::new(reader));

        assert_eq!(rx.recv().unwrap().unwrap()["id"], 1);
        assert_eq!(rx.recv().unwrap().unwrap()["id"], 2);
        assert!(matches!(rx.recv().unwrap(), Err(ExtractError::Io { .. })));
        assert!(rx.recv().is_err());
    }

    #[test]
    fn bare_feature_is_a_single_entry() {
        let entries = collect(r#"{"type":"Feature","geometry":null,"properties":{}}"#);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].as_ref().unwrap()["type"], "Feature");
    }

    #[test]
    fn rejects_documents_without_features() {
        let entries = collect(r#"{"type":"FeatureCollection"}"#);
        assert!(matches!(
            entries.as_slice(),
            [Err(ExtractError::Malformed { .. })]
        ));

        let entries = collect(r#"{"type":"FeatureCollection","features":{}}"#);
        assert!(matches!(
            entries.as_slice(),
            [Err(ExtractError::Malformed { .. })]
        ));

        let entries = collect("[1, 2]");
        assert!(matches!(
            entries.as_slice(),
            [Err(ExtractError::Malformed { .. })]
        ));
    }

    #[test]
    fn stops_when_the_receiver_is_dropped() {
        let features: Vec<String> = (0..COLLECTION_BUFFER * 4)
            .map(|i| format!(r#"{{"id":{i}}}"#))
            .collect();
        let doc = format!(r#"{{"features":[{}]}}"#, features.join(","));
        let rx = stream_collection("big.geojson".to_string(), Box::new(Cursor::new(doc.into_bytes())));

        assert!(rx.recv().unwrap().is_ok());
        drop(rx);
    }
}
