//! Buffered, permit-bounded location writer.

use std::sync::Arc;

use address_map_database::LocationStore;
use address_map_location_models::NewLocation;
use tokio::sync::Semaphore;

use crate::IngestError;

/// Counters from a finished [`BatchWriter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// Rows handed to the store.
    pub written: u64,
    /// Rows the store actually inserted (the rest were duplicates).
    pub inserted: u64,
    /// Upserts performed.
    pub batches: u64,
}

/// Accumulates locations and upserts them `batch_size` rows at a time.
///
/// Every upsert holds one permit from a semaphore shared by all writers,
/// which caps how many store connections ingestion can occupy at once.
pub struct BatchWriter {
    store: Arc<dyn LocationStore>,
    permits: Arc<Semaphore>,
    batch_size: usize,
    buffer: Vec<NewLocation>,
    stats: WriteStats,
}

impl BatchWriter {
    /// Creates a writer. A `batch_size` of zero is treated as one.
    #[must_use]
    pub fn new(store: Arc<dyn LocationStore>, permits: Arc<Semaphore>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            permits,
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            stats: WriteStats::default(),
        }
    }

    /// Buffers a location, flushing when the batch is full.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError`] if a flush fails.
    pub async fn push(&mut self, location: NewLocation) -> Result<(), IngestError> {
        self.buffer.push(location);
        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Upserts everything buffered. Returns the rows inserted.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Persistence`] if the upsert fails, or
    /// [`IngestError::ShutDown`] if the permit pool was closed.
    pub async fn flush(&mut self) -> Result<u64, IngestError> {
        if self.buffer.is_empty() {
            return Ok(0);
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| IngestError::ShutDown)?;

        let inserted = self.store.upsert_locations(&self.buffer).await?;
        let written = self.buffer.len() as u64;

        self.stats.written += written;
        self.stats.inserted += inserted;
        self.stats.batches += 1;
        self.buffer.clear();

        log::debug!(
            "Wrote batch {} ({written} rows, {inserted} new)",
            self.stats.batches
        );
        Ok(inserted)
    }

    /// Flushes the remainder and returns the totals.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError`] if the final flush fails.
    pub async fn finish(mut self) -> Result<WriteStats, IngestError> {
        self.flush().await?;
        Ok(self.stats)
    }

    /// Totals so far.
    #[must_use]
    pub const fn stats(&self) -> WriteStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use address_map_database::memory::MemoryStore;

    use super::*;

    fn location(hash: &str) -> NewLocation {
        NewLocation {
            hash: hash.to_string(),
            house_number: Some("1".to_string()),
            street: Some("Main St".to_string()),
            unit: None,
            city: None,
            district: None,
            region: None,
            postal_code: None,
            latitude: 39.0,
            longitude: -84.0,
        }
    }

    #[tokio::test]
    async fn flushes_full_batches_and_remainder() {
        let store = Arc::new(MemoryStore::new());
        let mut writer = BatchWriter::new(store.clone(), Arc::new(Semaphore::new(1)), 2);

        for hash in ["a", "b", "c", "a", "d"] {
            writer.push(location(hash)).await.unwrap();
        }
        assert_eq!(writer.stats().batches, 2);

        let stats = writer.finish().await.unwrap();
        assert_eq!(stats.batches, 3);
        assert_eq!(stats.written, 5);
        assert_eq!(stats.inserted, 4);
        assert_eq!(store.location_count(), 4);
    }

    #[tokio::test]
    async fn closed_permit_pool_stops_writes() {
        let store = Arc::new(MemoryStore::new());
        let permits = Arc::new(Semaphore::new(1));
        permits.close();

        let mut writer = BatchWriter::new(store.clone(), permits, 10);
        writer.push(location("a")).await.unwrap();
        assert!(matches!(
            writer.finish().await,
            Err(IngestError::ShutDown)
        ));
        assert_eq!(store.location_count(), 0);
    }
}
