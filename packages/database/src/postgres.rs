//! `PostgreSQL` [`LocationStore`] implementation.
//!
//! All queries use `query_raw_params()`/`exec_raw_params()` with
//! positional `$n` parameters. Bounding boxes are plain `BETWEEN` ranges
//! on the coordinate columns; text predicates are `ILIKE` substring
//! matches; status changes are conditional `UPDATE`s so each transition
//! is a single atomic compare-and-swap.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use address_map_location_models::{
    BoundingBox, Dataset, DatasetFilter, DatasetStats, DatasetStatus, LocationRecord, NewDataset,
    NewLocation, Page, SearchField, SourceFormat, TextPredicate,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use moosicbox_json_utils::database::ToValue as _;
use switchy_database::{Database, DatabaseValue, Row};

use crate::{DbError, LocationStore};

/// Maximum number of parameters `PostgreSQL` allows per statement.
pub const PG_MAX_PARAMS: usize = 65_535;

/// Parameters bound per location row in the upsert `VALUES` list.
const PARAMS_PER_LOCATION: usize = 10;

const DATASET_COLUMNS: &str = "id, name, region, sub_region, format, file_path, file_size, \
     record_count, status, error_message, uploaded_by, uploaded_at, processed_at";

const LOCATION_COLUMNS: &str = "id, hash, house_number, street, unit, city, district, region, \
     postal_code, latitude, longitude, created_at";

/// A [`LocationStore`] backed by a `switchy_database` connection.
pub struct PostgresStore {
    db: Arc<dyn Database>,
}

impl PostgresStore {
    /// Wraps an open database connection.
    #[must_use]
    pub const fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// The underlying connection.
    #[must_use]
    pub fn database(&self) -> &dyn Database {
        self.db.as_ref()
    }
}

fn malformed(message: impl Into<String>) -> DbError {
    DbError::Row {
        message: message.into(),
    }
}

fn to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc)
}

fn opt_string(value: Option<&String>) -> DatabaseValue {
    value.map_or(DatabaseValue::Null, |v| DatabaseValue::String(v.clone()))
}

fn i64_from_u64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn dataset_from_row(row: &Row) -> Result<Dataset, DbError> {
    let id: i64 = row
        .to_value("id")
        .map_err(|e| malformed(format!("Failed to parse dataset id: {e}")))?;

    let status_name: String = row.to_value("status").unwrap_or_default();
    let status = status_name
        .parse::<DatasetStatus>()
        .map_err(|e| malformed(format!("Invalid status '{status_name}' on dataset {id}: {e}")))?;

    let format_name: String = row.to_value("format").unwrap_or_default();
    let format = format_name
        .parse::<SourceFormat>()
        .map_err(|e| malformed(format!("Invalid format '{format_name}' on dataset {id}: {e}")))?;

    let file_size: i64 = row.to_value("file_size").unwrap_or(0);
    let record_count: Option<i64> = row.to_value("record_count").unwrap_or(None);
    let uploaded_at: NaiveDateTime = row.to_value("uploaded_at").unwrap_or_default();
    let processed_at: Option<NaiveDateTime> = row.to_value("processed_at").unwrap_or(None);

    Ok(Dataset {
        id,
        name: row.to_value("name").unwrap_or_default(),
        region: row.to_value("region").unwrap_or_default(),
        sub_region: row.to_value("sub_region").unwrap_or_default(),
        format,
        file_path: row.to_value("file_path").unwrap_or_default(),
        file_size: u64::try_from(file_size).unwrap_or(0),
        record_count: record_count.and_then(|c| u64::try_from(c).ok()),
        status,
        error_message: row.to_value("error_message").unwrap_or(None),
        uploaded_by: row.to_value("uploaded_by").unwrap_or_default(),
        uploaded_at: to_utc(uploaded_at),
        processed_at: processed_at.map(to_utc),
    })
}

fn location_from_row(row: &Row) -> LocationRecord {
    let created_at: NaiveDateTime = row.to_value("created_at").unwrap_or_default();

    LocationRecord {
        id: row.to_value("id").unwrap_or(0),
        hash: row.to_value("hash").unwrap_or_default(),
        house_number: row.to_value("house_number").unwrap_or(None),
        street: row.to_value("street").unwrap_or(None),
        unit: row.to_value("unit").unwrap_or(None),
        city: row.to_value("city").unwrap_or(None),
        district: row.to_value("district").unwrap_or(None),
        region: row.to_value("region").unwrap_or(None),
        postal_code: row.to_value("postal_code").unwrap_or(None),
        latitude: row.to_value("latitude").unwrap_or(0.0),
        longitude: row.to_value("longitude").unwrap_or(0.0),
        created_at: to_utc(created_at),
    }
}

fn count_from_rows(rows: &[Row], column: &str) -> u64 {
    let Some(row) = rows.first() else {
        return 0;
    };
    let n: i64 = row.to_value(column).unwrap_or(0);
    u64::try_from(n).unwrap_or(0)
}

/// SQL expression producing the text of a [`SearchField`].
///
/// Mirrors [`SearchField::value_of`]: absent parts are empty strings and
/// composite fields skip missing components.
const fn field_sql(field: SearchField) -> &'static str {
    match field {
        SearchField::HouseNumber => "COALESCE(house_number, '')",
        SearchField::Street => "COALESCE(street, '')",
        SearchField::Unit => "COALESCE(unit, '')",
        SearchField::City => "COALESCE(city, '')",
        SearchField::District => "COALESCE(district, '')",
        SearchField::Region => "COALESCE(region, '')",
        SearchField::PostalCode => "COALESCE(postal_code, '')",
        SearchField::HouseNumberStreet => "CONCAT_WS(' ', house_number, street)",
        SearchField::StreetCity => "CONCAT_WS(' ', street, city)",
        SearchField::FullAddress => {
            "CONCAT_WS(', ', NULLIF(CONCAT_WS(' ', house_number, street), ''), unit, city, \
             NULLIF(CONCAT_WS(' ', region, postal_code), ''))"
        }
    }
}

/// Escapes `LIKE` wildcards so the needle is matched literally.
fn like_pattern(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// Builds the `WHERE` clause for a [`TextPredicate`], appending bound
/// values to `params`.
fn predicate_sql(predicate: &TextPredicate, params: &mut Vec<DatabaseValue>) -> String {
    let mut sql = String::from(" WHERE 1=1");

    if let Some(bbox) = &predicate.bbox {
        let idx = params.len() + 1;
        write!(
            sql,
            " AND latitude BETWEEN ${} AND ${} AND longitude BETWEEN ${} AND ${}",
            idx,
            idx + 1,
            idx + 2,
            idx + 3,
        )
        .unwrap();
        params.push(DatabaseValue::Real64(bbox.south));
        params.push(DatabaseValue::Real64(bbox.north));
        params.push(DatabaseValue::Real64(bbox.west));
        params.push(DatabaseValue::Real64(bbox.east));
    }

    for clause in &predicate.clauses {
        if clause.fields.is_empty() {
            sql.push_str(" AND FALSE");
            continue;
        }
        params.push(DatabaseValue::String(like_pattern(&clause.needle)));
        let idx = params.len();
        let alternatives: Vec<String> = clause
            .fields
            .iter()
            .map(|f| format!("{} ILIKE ${idx}", field_sql(*f)))
            .collect();
        write!(sql, " AND ({})", alternatives.join(" OR ")).unwrap();
    }

    sql
}

/// Builds `status IN ($a, $b, ...)` for the given statuses.
fn status_in_sql(statuses: &[DatasetStatus], params: &mut Vec<DatabaseValue>) -> String {
    let placeholders: Vec<String> = statuses
        .iter()
        .map(|s| {
            params.push(DatabaseValue::String(s.to_string()));
            format!("${}", params.len())
        })
        .collect();
    format!("status IN ({})", placeholders.join(", "))
}

#[async_trait]
impl LocationStore for PostgresStore {
    async fn insert_dataset(&self, dataset: &NewDataset) -> Result<Dataset, DbError> {
        let sql = format!(
            "INSERT INTO datasets (
                name, region, sub_region, format, file_path, file_size,
                status, uploaded_by, uploaded_at
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING {DATASET_COLUMNS}"
        );
        let rows = self
            .db
            .query_raw_params(
                &sql,
                &[
                    DatabaseValue::String(dataset.name.clone()),
                    DatabaseValue::String(dataset.region.clone()),
                    DatabaseValue::String(dataset.sub_region.clone()),
                    DatabaseValue::String(dataset.format.to_string()),
                    DatabaseValue::String(dataset.file_path.clone()),
                    DatabaseValue::Int64(i64_from_u64(dataset.file_size)),
                    DatabaseValue::String(DatasetStatus::Pending.to_string()),
                    DatabaseValue::String(dataset.uploaded_by.clone()),
                    DatabaseValue::DateTime(Utc::now().naive_utc()),
                ],
            )
            .await?;

        let row = rows
            .first()
            .ok_or_else(|| malformed("Failed to get dataset row from insert"))?;
        dataset_from_row(row)
    }

    async fn get_dataset(&self, id: i64) -> Result<Option<Dataset>, DbError> {
        let sql = format!("SELECT {DATASET_COLUMNS} FROM datasets WHERE id = $1");
        let rows = self
            .db
            .query_raw_params(&sql, &[DatabaseValue::Int64(id)])
            .await?;

        rows.first().map(dataset_from_row).transpose()
    }

    async fn list_datasets(&self, filter: &DatasetFilter) -> Result<Page<Dataset>, DbError> {
        let mut where_sql = String::from(" WHERE 1=1");
        let mut params: Vec<DatabaseValue> = Vec::new();

        if let Some(region) = &filter.region {
            params.push(DatabaseValue::String(region.clone()));
            write!(where_sql, " AND region = ${}", params.len()).unwrap();
        }

        if let Some(status) = filter.status {
            params.push(DatabaseValue::String(status.to_string()));
            write!(where_sql, " AND status = ${}", params.len()).unwrap();
        }

        let count_rows = self
            .db
            .query_raw_params(
                &format!("SELECT COUNT(*) AS total FROM datasets{where_sql}"),
                &params,
            )
            .await?;
        let total = count_from_rows(&count_rows, "total");

        let mut sql =
            format!("SELECT {DATASET_COLUMNS} FROM datasets{where_sql} ORDER BY uploaded_at DESC, id DESC");
        write!(sql, " LIMIT ${} OFFSET ${}", params.len() + 1, params.len() + 2).unwrap();
        params.push(DatabaseValue::Int64(i64::from(filter.limit)));
        params.push(DatabaseValue::Int64(i64::from(filter.offset)));

        let rows = self.db.query_raw_params(&sql, &params).await?;
        let items = rows.iter().map(dataset_from_row).collect::<Result<_, _>>()?;

        Ok(Page { items, total })
    }

    async fn dataset_stats(&self) -> Result<DatasetStats, DbError> {
        let totals = self
            .db
            .query_raw_params(
                "SELECT COUNT(*) AS total,
                        COALESCE(SUM(file_size), 0)::BIGINT AS total_bytes
                 FROM datasets",
                &[],
            )
            .await?;

        let records = self
            .db
            .query_raw_params("SELECT COUNT(*) AS total FROM locations", &[])
            .await?;

        let mut by_region = BTreeMap::new();
        for row in &self
            .db
            .query_raw_params(
                "SELECT region, COUNT(*) AS n FROM datasets GROUP BY region",
                &[],
            )
            .await?
        {
            let region: String = row.to_value("region").unwrap_or_default();
            let n: i64 = row.to_value("n").unwrap_or(0);
            by_region.insert(region, u64::try_from(n).unwrap_or(0));
        }

        let mut by_status = BTreeMap::new();
        for row in &self
            .db
            .query_raw_params(
                "SELECT status, COUNT(*) AS n FROM datasets GROUP BY status",
                &[],
            )
            .await?
        {
            let name: String = row.to_value("status").unwrap_or_default();
            let n: i64 = row.to_value("n").unwrap_or(0);
            match name.parse::<DatasetStatus>() {
                Ok(status) => {
                    by_status.insert(status, u64::try_from(n).unwrap_or(0));
                }
                Err(e) => log::warn!("Ignoring unknown dataset status '{name}': {e}"),
            }
        }

        Ok(DatasetStats {
            total_datasets: count_from_rows(&totals, "total"),
            total_records: count_from_rows(&records, "total"),
            total_bytes: count_from_rows(&totals, "total_bytes"),
            by_region,
            by_status,
        })
    }

    async fn delete_dataset(&self, id: i64) -> Result<Option<Dataset>, DbError> {
        let sql = format!("DELETE FROM datasets WHERE id = $1 RETURNING {DATASET_COLUMNS}");
        let rows = self
            .db
            .query_raw_params(&sql, &[DatabaseValue::Int64(id)])
            .await?;

        rows.first().map(dataset_from_row).transpose()
    }

    async fn transition_status(
        &self,
        id: i64,
        from: &[DatasetStatus],
        to: DatasetStatus,
    ) -> Result<bool, DbError> {
        if from.is_empty() {
            return Ok(false);
        }

        let mut params = vec![
            DatabaseValue::Int64(id),
            DatabaseValue::String(to.to_string()),
        ];
        let clear_error = if to == DatasetStatus::Processing {
            ", error_message = NULL"
        } else {
            ""
        };
        let status_in = status_in_sql(from, &mut params);
        let sql =
            format!("UPDATE datasets SET status = $2{clear_error} WHERE id = $1 AND {status_in}");

        let affected = self.db.exec_raw_params(&sql, &params).await?;
        Ok(affected > 0)
    }

    async fn complete_dataset(&self, id: i64, record_count: u64) -> Result<bool, DbError> {
        let affected = self
            .db
            .exec_raw_params(
                "UPDATE datasets SET
                    status = $2,
                    record_count = $3,
                    processed_at = $4
                 WHERE id = $1 AND status = $5",
                &[
                    DatabaseValue::Int64(id),
                    DatabaseValue::String(DatasetStatus::Completed.to_string()),
                    DatabaseValue::Int64(i64_from_u64(record_count)),
                    DatabaseValue::DateTime(Utc::now().naive_utc()),
                    DatabaseValue::String(DatasetStatus::Processing.to_string()),
                ],
            )
            .await?;

        Ok(affected > 0)
    }

    async fn fail_dataset(&self, id: i64, message: &str) -> Result<bool, DbError> {
        let affected = self
            .db
            .exec_raw_params(
                "UPDATE datasets SET
                    status = $2,
                    error_message = $3,
                    processed_at = $4
                 WHERE id = $1 AND status = $5",
                &[
                    DatabaseValue::Int64(id),
                    DatabaseValue::String(DatasetStatus::Failed.to_string()),
                    DatabaseValue::String(message.to_string()),
                    DatabaseValue::DateTime(Utc::now().naive_utc()),
                    DatabaseValue::String(DatasetStatus::Processing.to_string()),
                ],
            )
            .await?;

        Ok(affected > 0)
    }

    async fn upsert_locations(&self, locations: &[NewLocation]) -> Result<u64, DbError> {
        if locations.is_empty() {
            return Ok(0);
        }

        let chunk_size = PG_MAX_PARAMS / PARAMS_PER_LOCATION;
        let created_at = Utc::now().naive_utc();
        let mut inserted = 0u64;

        for chunk in locations.chunks(chunk_size) {
            let mut sql = String::from(
                "INSERT INTO locations (
                    hash, house_number, street, unit, city, district, region,
                    postal_code, latitude, longitude, created_at
                 ) VALUES ",
            );
            let mut params: Vec<DatabaseValue> =
                Vec::with_capacity(chunk.len() * PARAMS_PER_LOCATION + 1);
            params.push(DatabaseValue::DateTime(created_at));

            for (i, location) in chunk.iter().enumerate() {
                if i > 0 {
                    sql.push_str(", ");
                }
                let base = params.len() + 1;
                sql.push('(');
                for offset in 0..PARAMS_PER_LOCATION {
                    write!(sql, "${}, ", base + offset).unwrap();
                }
                sql.push_str("$1)");

                params.push(DatabaseValue::String(location.hash.clone()));
                params.push(opt_string(location.house_number.as_ref()));
                params.push(opt_string(location.street.as_ref()));
                params.push(opt_string(location.unit.as_ref()));
                params.push(opt_string(location.city.as_ref()));
                params.push(opt_string(location.district.as_ref()));
                params.push(opt_string(location.region.as_ref()));
                params.push(opt_string(location.postal_code.as_ref()));
                params.push(DatabaseValue::Real64(location.latitude));
                params.push(DatabaseValue::Real64(location.longitude));
            }

            sql.push_str(" ON CONFLICT (hash) DO NOTHING");

            inserted += self.db.exec_raw_params(&sql, &params).await?;
        }

        Ok(inserted)
    }

    async fn locations_in_bbox(
        &self,
        bbox: &BoundingBox,
        limit: u32,
    ) -> Result<Vec<LocationRecord>, DbError> {
        let sql = format!(
            "SELECT {LOCATION_COLUMNS} FROM locations
             WHERE latitude BETWEEN $1 AND $2
               AND longitude BETWEEN $3 AND $4
             LIMIT $5"
        );
        let rows = self
            .db
            .query_raw_params(
                &sql,
                &[
                    DatabaseValue::Real64(bbox.south),
                    DatabaseValue::Real64(bbox.north),
                    DatabaseValue::Real64(bbox.west),
                    DatabaseValue::Real64(bbox.east),
                    DatabaseValue::Int64(i64::from(limit)),
                ],
            )
            .await?;

        Ok(rows.iter().map(location_from_row).collect())
    }

    async fn match_locations(
        &self,
        predicate: &TextPredicate,
        limit: u32,
        offset: u32,
    ) -> Result<Page<LocationRecord>, DbError> {
        let mut params: Vec<DatabaseValue> = Vec::new();
        let where_sql = predicate_sql(predicate, &mut params);

        let count_rows = self
            .db
            .query_raw_params(
                &format!("SELECT COUNT(*) AS total FROM locations{where_sql}"),
                &params,
            )
            .await?;
        let total = count_from_rows(&count_rows, "total");

        let mut sql = format!("SELECT {LOCATION_COLUMNS} FROM locations{where_sql} ORDER BY id");
        write!(sql, " LIMIT ${} OFFSET ${}", params.len() + 1, params.len() + 2).unwrap();
        params.push(DatabaseValue::Int64(i64::from(limit)));
        params.push(DatabaseValue::Int64(i64::from(offset)));

        let rows = self.db.query_raw_params(&sql, &params).await?;

        Ok(Page {
            items: rows.iter().map(location_from_row).collect(),
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use address_map_location_models::TextClause;

    use super::*;

    #[test]
    fn escapes_like_wildcards() {
        assert_eq!(like_pattern("oak"), "%oak%");
        assert_eq!(like_pattern("50%_off\\"), "%50\\%\\_off\\\\%");
    }

    #[test]
    fn builds_predicate_with_bbox_and_clauses() {
        let predicate = TextPredicate {
            clauses: vec![
                TextClause::new("oakley", &[SearchField::Street, SearchField::City]),
                TextClause::new("2525", &[SearchField::HouseNumber]),
            ],
            bbox: Some(BoundingBox::new(-85.0, 39.0, -84.0, 40.0)),
        };
        let mut params = Vec::new();
        let sql = predicate_sql(&predicate, &mut params);

        assert_eq!(params.len(), 6);
        assert!(sql.contains("latitude BETWEEN $1 AND $2"));
        assert!(sql.contains("longitude BETWEEN $3 AND $4"));
        assert!(sql.contains("(COALESCE(street, '') ILIKE $5 OR COALESCE(city, '') ILIKE $5)"));
        assert!(sql.contains("(COALESCE(house_number, '') ILIKE $6)"));
    }

    #[test]
    fn empty_field_list_never_matches() {
        let predicate = TextPredicate {
            clauses: vec![TextClause::new("x", &[])],
            bbox: None,
        };
        let mut params = Vec::new();
        let sql = predicate_sql(&predicate, &mut params);
        assert!(sql.ends_with("AND FALSE"));
        assert!(params.is_empty());
    }

    #[test]
    fn status_in_appends_params() {
        let mut params = vec![DatabaseValue::Int64(7), DatabaseValue::Null];
        let sql = status_in_sql(DatasetStatus::REPROCESSABLE, &mut params);
        assert_eq!(sql, "status IN ($3, $4)");
        assert_eq!(params.len(), 4);
    }
}
