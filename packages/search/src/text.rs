//! Token and per-field substring search.

use address_map_database::LocationStore;
use address_map_location_models::{
    BoundingBox, LocationRecord, Page, SearchField, TextClause, TextPredicate,
};
use serde::{Deserialize, Serialize};

use crate::{GeoFilter, SearchError, clamp_limit};

/// Free-text search: every whitespace token must match at least one of
/// [`SearchField::TOKEN_FIELDS`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenQuery {
    /// Raw query text.
    pub text: String,
    /// Optional area restriction.
    pub geo: Option<GeoFilter>,
    /// Page size.
    pub limit: u32,
    /// Rows to skip.
    pub offset: u32,
}

/// Structured search: every supplied field must contain its value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldQuery {
    /// House number substring.
    pub house_number: Option<String>,
    /// Street substring.
    pub street: Option<String>,
    /// City substring.
    pub city: Option<String>,
    /// Sub-region substring.
    pub district: Option<String>,
    /// Region substring.
    pub region: Option<String>,
    /// Postal code substring.
    pub postal_code: Option<String>,
    /// Optional area restriction.
    pub geo: Option<GeoFilter>,
    /// Page size.
    pub limit: u32,
    /// Rows to skip.
    pub offset: u32,
}

/// Splits on whitespace, dropping empty tokens.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_string).collect()
}

/// One clause per token over the token field set.
#[must_use]
pub fn token_predicate(tokens: &[String], bbox: Option<BoundingBox>) -> TextPredicate {
    TextPredicate {
        clauses: tokens
            .iter()
            .map(|token| TextClause::new(token.clone(), SearchField::TOKEN_FIELDS))
            .collect(),
        bbox,
    }
}

impl FieldQuery {
    /// One single-field clause per supplied, non-blank value.
    #[must_use]
    pub fn clauses(&self) -> Vec<TextClause> {
        [
            (SearchField::HouseNumber, &self.house_number),
            (SearchField::Street, &self.street),
            (SearchField::City, &self.city),
            (SearchField::District, &self.district),
            (SearchField::Region, &self.region),
            (SearchField::PostalCode, &self.postal_code),
        ]
        .into_iter()
        .filter_map(|(field, value)| {
            let value = value.as_deref()?.trim();
            (!value.is_empty()).then(|| TextClause::new(value, &[field]))
        })
        .collect()
    }
}

/// Runs a token search.
///
/// # Errors
///
/// Returns [`SearchError::Validation`] when the query has no tokens or an
/// invalid geo filter, or [`SearchError::Store`] if the store query fails.
pub async fn search_tokens(
    store: &dyn LocationStore,
    query: &TokenQuery,
) -> Result<Page<LocationRecord>, SearchError> {
    let tokens = tokenize(&query.text);
    if tokens.is_empty() {
        return Err(SearchError::Validation(
            "query must contain at least one search term".to_string(),
        ));
    }

    let bbox = query.geo.as_ref().map(GeoFilter::bbox).transpose()?;
    let predicate = token_predicate(&tokens, bbox);
    run_predicate(store, &predicate, query.limit, query.offset).await
}

/// Runs a structured field search.
///
/// # Errors
///
/// Returns [`SearchError::Validation`] when no field is supplied or the
/// geo filter is invalid, or [`SearchError::Store`] if the store query
/// fails.
pub async fn search_fields(
    store: &dyn LocationStore,
    query: &FieldQuery,
) -> Result<Page<LocationRecord>, SearchError> {
    let clauses = query.clauses();
    if clauses.is_empty() {
        return Err(SearchError::Validation(
            "at least one search field is required".to_string(),
        ));
    }

    let predicate = TextPredicate {
        clauses,
        bbox: query.geo.as_ref().map(GeoFilter::bbox).transpose()?,
    };
    run_predicate(store, &predicate, query.limit, query.offset).await
}

async fn run_predicate(
    store: &dyn LocationStore,
    predicate: &TextPredicate,
    limit: u32,
    offset: u32,
) -> Result<Page<LocationRecord>, SearchError> {
    let mut page = store
        .match_locations(predicate, clamp_limit(limit), offset)
        .await?;

    let before = page.items.len();
    page.items.retain(|record| predicate.matches(record));
    if page.items.len() != before {
        log::warn!(
            "Store returned {} records that fail the text predicate",
            before - page.items.len()
        );
    }

    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GeoPoint;
    use crate::geo::DistanceUnit;
    use crate::test_support::seeded_store;

    fn hashes(page: &Page<LocationRecord>) -> Vec<&str> {
        let mut hashes: Vec<&str> = page.items.iter().map(|r| r.hash.as_str()).collect();
        hashes.sort_unstable();
        hashes
    }

    #[test]
    fn tokenizes_on_whitespace() {
        assert_eq!(tokenize("  2525\toakley  "), vec!["2525", "oakley"]);
        assert!(tokenize("   ").is_empty());
    }

    #[tokio::test]
    async fn every_token_must_match() {
        let store = seeded_store().await;
        let page = search_tokens(
            &store,
            &TokenQuery {
                text: "main norwood".to_string(),
                limit: 50,
                ..TokenQuery::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(hashes(&page), vec!["main-b"]);
        assert_eq!(page.total, 1);

        let tokens = tokenize("main norwood");
        for record in &page.items {
            for token in &tokens {
                let token = token.to_lowercase();
                assert!(SearchField::TOKEN_FIELDS.iter().any(|f| {
                    f.value_of(record).to_lowercase().contains(&token)
                }));
            }
        }
    }

    #[tokio::test]
    async fn token_order_does_not_matter() {
        let store = seeded_store().await;
        let forward = search_tokens(
            &store,
            &TokenQuery {
                text: "2525 oakley".to_string(),
                limit: 50,
                ..TokenQuery::default()
            },
        )
        .await
        .unwrap();
        let reversed = search_tokens(
            &store,
            &TokenQuery {
                text: "Oakley 2525".to_string(),
                limit: 50,
                ..TokenQuery::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(hashes(&forward), vec!["oakley"]);
        assert_eq!(hashes(&forward), hashes(&reversed));
    }

    #[tokio::test]
    async fn geo_filter_narrows_token_results() {
        let store = seeded_store().await;
        let page = search_tokens(
            &store,
            &TokenQuery {
                text: "main".to_string(),
                geo: Some(GeoFilter {
                    center: GeoPoint::new(39.1031, -84.5120),
                    radius: 1.0,
                    unit: DistanceUnit::Miles,
                }),
                limit: 50,
                offset: 0,
            },
        )
        .await
        .unwrap();

        assert_eq!(hashes(&page), vec!["main-a"]);
    }

    #[tokio::test]
    async fn street_field_search_matches_only_that_street() {
        let store = seeded_store().await;
        let oakley = search_fields(
            &store,
            &FieldQuery {
                street: Some("Oakley".to_string()),
                limit: 50,
                ..FieldQuery::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(hashes(&oakley), vec!["oakley"]);

        let landsbrook = search_fields(
            &store,
            &FieldQuery {
                street: Some("Landsbrook".to_string()),
                limit: 50,
                ..FieldQuery::default()
            },
        )
        .await
        .unwrap();
        assert!(landsbrook.items.iter().all(|r| r.hash != "oakley"));
    }

    #[tokio::test]
    async fn empty_queries_are_rejected() {
        let store = seeded_store().await;
        assert!(matches!(
            search_tokens(&store, &TokenQuery::default()).await,
            Err(SearchError::Validation(_))
        ));
        assert!(matches!(
            search_fields(
                &store,
                &FieldQuery {
                    city: Some("  ".to_string()),
                    ..FieldQuery::default()
                }
            )
            .await,
            Err(SearchError::Validation(_))
        ));
    }
}
