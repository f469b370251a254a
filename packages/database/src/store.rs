//! The backing store contract.

use address_map_location_models::{
    BoundingBox, Dataset, DatasetFilter, DatasetStats, DatasetStatus, LocationRecord, NewDataset,
    NewLocation, Page, TextPredicate,
};
use async_trait::async_trait;

use crate::DbError;

/// Persistence for datasets and location records.
///
/// Implementations must be safe to share between ingestion workers and
/// concurrent query traffic.
#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Creates a dataset row in [`DatasetStatus::Pending`].
    async fn insert_dataset(&self, dataset: &NewDataset) -> Result<Dataset, DbError>;

    /// Fetches a dataset by id.
    async fn get_dataset(&self, id: i64) -> Result<Option<Dataset>, DbError>;

    /// Lists datasets matching `filter`, newest first.
    async fn list_datasets(&self, filter: &DatasetFilter) -> Result<Page<Dataset>, DbError>;

    /// Aggregate counters over all datasets and records.
    async fn dataset_stats(&self) -> Result<DatasetStats, DbError>;

    /// Deletes a dataset row, returning it if it existed.
    async fn delete_dataset(&self, id: i64) -> Result<Option<Dataset>, DbError>;

    /// Atomically moves a dataset to `to` if its current status is one of
    /// `from`. Entering [`DatasetStatus::Processing`] clears any previous
    /// error message.
    ///
    /// Returns `false` (and changes nothing) when the row is missing or
    /// its status is not in `from`.
    async fn transition_status(
        &self,
        id: i64,
        from: &[DatasetStatus],
        to: DatasetStatus,
    ) -> Result<bool, DbError>;

    /// Moves a processing dataset to completed, recording its final
    /// record count and processing time.
    async fn complete_dataset(&self, id: i64, record_count: u64) -> Result<bool, DbError>;

    /// Moves a processing dataset to failed with the captured message.
    async fn fail_dataset(&self, id: i64, message: &str) -> Result<bool, DbError>;

    /// Inserts locations, skipping any whose hash already exists.
    ///
    /// Returns the number of rows actually inserted.
    async fn upsert_locations(&self, locations: &[NewLocation]) -> Result<u64, DbError>;

    /// Returns up to `limit` records whose coordinates fall inside `bbox`.
    async fn locations_in_bbox(
        &self,
        bbox: &BoundingBox,
        limit: u32,
    ) -> Result<Vec<LocationRecord>, DbError>;

    /// Returns one page of records satisfying `predicate`, ordered by id,
    /// along with the total match count.
    async fn match_locations(
        &self,
        predicate: &TextPredicate,
        limit: u32,
        offset: u32,
    ) -> Result<Page<LocationRecord>, DbError>;
}
