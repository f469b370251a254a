//! In-process [`LocationStore`] implementation.
//!
//! Mirrors the `PostgreSQL` semantics (unique-hash upsert, conditional
//! status updates, inclusive bounding boxes, case-insensitive substring
//! matching) behind a single mutex. Used by tests and by
//! `ADDRESS_MAP_STORE=memory` local runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use address_map_location_models::{
    BoundingBox, Dataset, DatasetFilter, DatasetStats, DatasetStatus, LocationRecord, NewDataset,
    NewLocation, Page, TextPredicate,
};
use async_trait::async_trait;
use chrono::Utc;

use crate::{DbError, LocationStore};

#[derive(Default)]
struct MemoryState {
    datasets: BTreeMap<i64, Dataset>,
    locations: BTreeMap<i64, LocationRecord>,
    hashes: BTreeSet<String>,
    next_dataset_id: i64,
    next_location_id: i64,
}

/// A mutex-guarded in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored location records.
    #[must_use]
    pub fn location_count(&self) -> usize {
        self.lock().locations.len()
    }
}

fn page_bounds(total: usize, limit: u32, offset: u32) -> (usize, usize) {
    let start = (offset as usize).min(total);
    let end = start.saturating_add(limit as usize).min(total);
    (start, end)
}

#[async_trait]
impl LocationStore for MemoryStore {
    async fn insert_dataset(&self, dataset: &NewDataset) -> Result<Dataset, DbError> {
        let mut state = self.lock();
        state.next_dataset_id += 1;
        let row = Dataset {
            id: state.next_dataset_id,
            name: dataset.name.clone(),
            region: dataset.region.clone(),
            sub_region: dataset.sub_region.clone(),
            format: dataset.format,
            file_path: dataset.file_path.clone(),
            file_size: dataset.file_size,
            record_count: None,
            status: DatasetStatus::Pending,
            error_message: None,
            uploaded_by: dataset.uploaded_by.clone(),
            uploaded_at: Utc::now(),
            processed_at: None,
        };
        state.datasets.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_dataset(&self, id: i64) -> Result<Option<Dataset>, DbError> {
        Ok(self.lock().datasets.get(&id).cloned())
    }

    async fn list_datasets(&self, filter: &DatasetFilter) -> Result<Page<Dataset>, DbError> {
        let state = self.lock();
        let mut matching: Vec<&Dataset> = state
            .datasets
            .values()
            .filter(|d| filter.region.as_ref().is_none_or(|r| &d.region == r))
            .filter(|d| filter.status.is_none_or(|s| d.status == s))
            .collect();
        matching.sort_by(|a, b| {
            b.uploaded_at
                .cmp(&a.uploaded_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        let (start, end) = page_bounds(matching.len(), filter.limit, filter.offset);
        Ok(Page {
            items: matching[start..end].iter().map(|d| (*d).clone()).collect(),
            total: matching.len() as u64,
        })
    }

    async fn dataset_stats(&self) -> Result<DatasetStats, DbError> {
        let state = self.lock();
        let mut stats = DatasetStats {
            total_datasets: state.datasets.len() as u64,
            total_records: state.locations.len() as u64,
            ..DatasetStats::default()
        };
        for dataset in state.datasets.values() {
            stats.total_bytes += dataset.file_size;
            *stats.by_region.entry(dataset.region.clone()).or_default() += 1;
            *stats.by_status.entry(dataset.status).or_default() += 1;
        }
        Ok(stats)
    }

    async fn delete_dataset(&self, id: i64) -> Result<Option<Dataset>, DbError> {
        Ok(self.lock().datasets.remove(&id))
    }

    async fn transition_status(
        &self,
        id: i64,
        from: &[DatasetStatus],
        to: DatasetStatus,
    ) -> Result<bool, DbError> {
        let mut state = self.lock();
        let Some(dataset) = state.datasets.get_mut(&id) else {
            return Ok(false);
        };
        if !from.contains(&dataset.status) {
            return Ok(false);
        }
        dataset.status = to;
        if to == DatasetStatus::Processing {
            dataset.error_message = None;
        }
        Ok(true)
    }

    async fn complete_dataset(&self, id: i64, record_count: u64) -> Result<bool, DbError> {
        let mut state = self.lock();
        let Some(dataset) = state.datasets.get_mut(&id) else {
            return Ok(false);
        };
        if dataset.status != DatasetStatus::Processing {
            return Ok(false);
        }
        dataset.status = DatasetStatus::Completed;
        dataset.record_count = Some(record_count);
        dataset.processed_at = Some(Utc::now());
        Ok(true)
    }

    async fn fail_dataset(&self, id: i64, message: &str) -> Result<bool, DbError> {
        let mut state = self.lock();
        let Some(dataset) = state.datasets.get_mut(&id) else {
            return Ok(false);
        };
        if dataset.status != DatasetStatus::Processing {
            return Ok(false);
        }
        dataset.status = DatasetStatus::Failed;
        dataset.error_message = Some(message.to_string());
        dataset.processed_at = Some(Utc::now());
        Ok(true)
    }

    async fn upsert_locations(&self, locations: &[NewLocation]) -> Result<u64, DbError> {
        let mut state = self.lock();
        let now = Utc::now();
        let mut inserted = 0u64;

        for location in locations {
            if !state.hashes.insert(location.hash.clone()) {
                continue;
            }
            state.next_location_id += 1;
            let id = state.next_location_id;
            state
                .locations
                .insert(id, LocationRecord::from_new(id, location.clone(), now));
            inserted += 1;
        }

        Ok(inserted)
    }

    async fn locations_in_bbox(
        &self,
        bbox: &BoundingBox,
        limit: u32,
    ) -> Result<Vec<LocationRecord>, DbError> {
        Ok(self
            .lock()
            .locations
            .values()
            .filter(|r| bbox.contains(r.latitude, r.longitude))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn match_locations(
        &self,
        predicate: &TextPredicate,
        limit: u32,
        offset: u32,
    ) -> Result<Page<LocationRecord>, DbError> {
        let state = self.lock();
        let matching: Vec<&LocationRecord> = state
            .locations
            .values()
            .filter(|r| predicate.matches(r))
            .collect();

        let (start, end) = page_bounds(matching.len(), limit, offset);
        Ok(Page {
            items: matching[start..end].iter().map(|r| (*r).clone()).collect(),
            total: matching.len() as u64,
        })
    }
}
