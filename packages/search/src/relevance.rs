//! Weighted single-phrase search.
//!
//! A record's score is the weight of the first rule it satisfies:
//!
//! | Rule | Weight |
//! |---|---|
//! | full address equals the phrase | [`EXACT_ADDRESS_WEIGHT`] |
//! | `"<street> <city>"` contains the phrase, but neither part alone does | [`STREET_CITY_WEIGHT`] |
//! | city contains the phrase | [`CITY_WEIGHT`] |
//! | street contains the phrase | [`STREET_WEIGHT`] |
//! | house number contains the phrase | [`HOUSE_NUMBER_WEIGHT`] |
//!
//! Candidates whose full address merely contains the phrase are kept with a
//! score of zero. Ties are broken by city, street, then house number, all
//! ascending.

use std::cmp::Ordering;

use address_map_database::LocationStore;
use address_map_location_models::{
    LocationRecord, Page, SearchField, TextClause, TextPredicate,
};
use serde::{Deserialize, Serialize};

use crate::{GeoFilter, SearchError, clamp_limit};

/// The normalized full address equals the phrase.
pub const EXACT_ADDRESS_WEIGHT: u32 = 100;
/// The phrase crosses from the street into the city, e.g. `"main st cinc"`.
pub const STREET_CITY_WEIGHT: u32 = 80;
/// The city contains the phrase.
pub const CITY_WEIGHT: u32 = 60;
/// The street contains the phrase.
pub const STREET_WEIGHT: u32 = 40;
/// The house number contains the phrase.
pub const HOUSE_NUMBER_WEIGHT: u32 = 20;

/// Most candidates fetched from the store for one phrase.
pub const RELEVANCE_CANDIDATE_LIMIT: u32 = 1000;

/// Fields a record must match for the phrase to consider it at all.
const CANDIDATE_FIELDS: &[SearchField] = &[SearchField::FullAddress, SearchField::StreetCity];

/// A single-phrase relevance search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelevanceQuery {
    /// The phrase, matched as a whole.
    pub phrase: String,
    /// Optional area restriction.
    pub geo: Option<GeoFilter>,
    /// Page size.
    pub limit: u32,
    /// Rows to skip after ranking.
    pub offset: u32,
}

/// A candidate with the weight of the rule it matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredLocation {
    /// The matched location.
    pub record: LocationRecord,
    /// One of the `*_WEIGHT` constants, or zero.
    pub score: u32,
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn field_contains(field: SearchField, record: &LocationRecord, phrase: &str) -> bool {
    normalize(&field.value_of(record)).contains(phrase)
}

/// Scores `record` against an already normalized phrase.
#[must_use]
pub fn score(record: &LocationRecord, phrase: &str) -> u32 {
    if normalize(&record.full_address()) == phrase {
        return EXACT_ADDRESS_WEIGHT;
    }

    let in_city = field_contains(SearchField::City, record, phrase);
    let in_street = field_contains(SearchField::Street, record, phrase);

    // Only a phrase spanning the street/city boundary counts as a street+city match.
    if !in_city && !in_street && field_contains(SearchField::StreetCity, record, phrase) {
        STREET_CITY_WEIGHT
    } else if in_city {
        CITY_WEIGHT
    } else if in_street {
        STREET_WEIGHT
    } else if field_contains(SearchField::HouseNumber, record, phrase) {
        HOUSE_NUMBER_WEIGHT
    } else {
        0
    }
}

/// Splits a house number into its leading integer and the remainder, so
/// that `"9"` sorts before `"10"` and `"10A"` after `"10"`.
fn house_key(house_number: Option<&str>) -> (Option<u64>, String) {
    let house = house_number.unwrap_or_default().trim();
    let digits = house.chars().take_while(char::is_ascii_digit).count();
    let number = house[..digits].parse().ok();
    (number, house[digits..].to_lowercase())
}

fn tie_break(a: &LocationRecord, b: &LocationRecord) -> Ordering {
    let lower = |v: &Option<String>| v.as_deref().unwrap_or_default().to_lowercase();

    lower(&a.city)
        .cmp(&lower(&b.city))
        .then_with(|| lower(&a.street).cmp(&lower(&b.street)))
        .then_with(|| {
            let (a_num, a_rest) = house_key(a.house_number.as_deref());
            let (b_num, b_rest) = house_key(b.house_number.as_deref());
            // Numbered houses first.
            match (a_num, b_num) {
                (Some(x), Some(y)) => x.cmp(&y).then_with(|| a_rest.cmp(&b_rest)),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => a_rest.cmp(&b_rest),
            }
        })
}

/// Scores and orders candidates: score descending, then the address
/// tie-break.
#[must_use]
pub fn rank(candidates: Vec<LocationRecord>, phrase: &str) -> Vec<ScoredLocation> {
    let phrase = normalize(phrase);
    let mut scored: Vec<ScoredLocation> = candidates
        .into_iter()
        .map(|record| ScoredLocation {
            score: score(&record, &phrase),
            record,
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| tie_break(&a.record, &b.record))
    });
    scored
}

/// Runs a relevance search. `total` counts every candidate the store
/// matched.
///
/// # Errors
///
/// Returns [`SearchError::Validation`] for a blank phrase or invalid geo
/// filter, or [`SearchError::Store`] if the store query fails.
pub async fn search_relevance(
    store: &dyn LocationStore,
    query: &RelevanceQuery,
) -> Result<Page<ScoredLocation>, SearchError> {
    let phrase = normalize(&query.phrase);
    if phrase.is_empty() {
        return Err(SearchError::Validation("query must not be empty".to_string()));
    }

    let predicate = TextPredicate {
        clauses: vec![TextClause::new(phrase.clone(), CANDIDATE_FIELDS)],
        bbox: query.geo.as_ref().map(GeoFilter::bbox).transpose()?,
    };
    let candidates = store
        .match_locations(&predicate, RELEVANCE_CANDIDATE_LIMIT, 0)
        .await?;
    if candidates.total > u64::from(RELEVANCE_CANDIDATE_LIMIT) {
        log::debug!(
            "Relevance search for {phrase:?} matched {} records, ranking the first {RELEVANCE_CANDIDATE_LIMIT}",
            candidates.total
        );
    }

    let items = rank(candidates.items, &phrase)
        .into_iter()
        .skip(query.offset as usize)
        .take(clamp_limit(query.limit) as usize)
        .collect();

    Ok(Page {
        items,
        total: candidates.total,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::test_support::seeded_store;

    fn record(house: &str, street: &str, city: &str) -> LocationRecord {
        LocationRecord {
            id: 0,
            hash: format!("{house}-{street}-{city}"),
            house_number: Some(house.to_string()),
            street: Some(street.to_string()),
            unit: None,
            city: Some(city.to_string()),
            district: None,
            region: Some("OH".to_string()),
            postal_code: Some("45209".to_string()),
            latitude: 39.1,
            longitude: -84.5,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn weights_follow_match_kind() {
        let r = record("2525", "Oakley Ave", "Cincinnati");
        assert_eq!(
            score(&r, &normalize("2525 Oakley Ave, Cincinnati, OH 45209")),
            EXACT_ADDRESS_WEIGHT
        );
        assert_eq!(score(&r, "oakley ave cinc"), STREET_CITY_WEIGHT);
        assert_eq!(score(&r, "ave cincinnati"), STREET_CITY_WEIGHT);
        assert_eq!(score(&r, "cincinnati"), CITY_WEIGHT);
        assert_eq!(score(&r, "oakley"), STREET_WEIGHT);
        assert_eq!(score(&r, "2525"), HOUSE_NUMBER_WEIGHT);
        assert_eq!(score(&r, "oh 45209"), 0);
    }

    #[test]
    fn city_outranks_street_when_both_contain_the_phrase() {
        let r = record("1", "Norwood Ave", "Norwood");
        assert_eq!(score(&r, "norwood"), CITY_WEIGHT);

        let no_city = LocationRecord {
            city: None,
            ..record("1", "Main St", "")
        };
        assert_eq!(score(&no_city, "main st"), STREET_WEIGHT);
    }

    #[test]
    fn ties_break_on_city_street_then_house_number() {
        let ranked = rank(
            vec![
                record("10", "Main St", "Norwood"),
                record("9", "Main St", "Norwood"),
                record("3", "Elm St", "Norwood"),
                record("12", "Main St", "Cincinnati"),
            ],
            "St",
        );

        let order: Vec<(&str, &str, &str)> = ranked
            .iter()
            .map(|s| {
                (
                    s.record.city.as_deref().unwrap(),
                    s.record.street.as_deref().unwrap(),
                    s.record.house_number.as_deref().unwrap(),
                )
            })
            .collect();
        assert_eq!(
            order,
            vec![
                ("Cincinnati", "Main St", "12"),
                ("Norwood", "Elm St", "3"),
                ("Norwood", "Main St", "9"),
                ("Norwood", "Main St", "10"),
            ]
        );
    }

    #[test]
    fn higher_scores_rank_first() {
        let ranked = rank(
            vec![
                record("5", "Main St", "Norwood"),
                record("1", "Fountain Sq", "Cincinnati"),
            ],
            "1 Fountain Sq, Cincinnati, OH 45209",
        );
        assert_eq!(ranked[0].score, EXACT_ADDRESS_WEIGHT);
        assert_eq!(ranked[1].score, 0);
    }

    #[tokio::test]
    async fn searches_the_store_and_pages_ranked_results() {
        let store = seeded_store().await;
        let page = search_relevance(
            &store,
            &RelevanceQuery {
                phrase: "  main   st ".to_string(),
                limit: 1,
                ..RelevanceQuery::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].record.hash, "main-a");
        assert_eq!(page.items[0].score, STREET_WEIGHT);

        let second = search_relevance(
            &store,
            &RelevanceQuery {
                phrase: "main st".to_string(),
                limit: 1,
                offset: 1,
                ..RelevanceQuery::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(second.items[0].record.hash, "main-b");
    }

    async fn top(phrase: &str) -> Vec<(String, u32)> {
        let store = seeded_store().await;
        let page = search_relevance(
            &store,
            &RelevanceQuery {
                phrase: phrase.to_string(),
                limit: 10,
                ..RelevanceQuery::default()
            },
        )
        .await
        .unwrap();
        page.items
            .into_iter()
            .map(|s| (s.record.hash, s.score))
            .collect()
    }

    #[tokio::test]
    async fn store_search_scores_every_tier() {
        assert_eq!(
            top("10 Main St, Cincinnati, OH 45209").await,
            vec![("main-a".to_string(), EXACT_ADDRESS_WEIGHT)]
        );
        assert_eq!(
            top("main st cincinnati").await,
            vec![("main-a".to_string(), STREET_CITY_WEIGHT)]
        );
        assert_eq!(
            top("norwood").await,
            vec![
                ("main-b".to_string(), CITY_WEIGHT),
                ("oak-ln".to_string(), CITY_WEIGHT),
            ]
        );
        assert_eq!(
            top("landsbrook").await,
            vec![("landsbrook".to_string(), STREET_WEIGHT)]
        );
        assert_eq!(
            top("2525").await,
            vec![("oakley".to_string(), HOUSE_NUMBER_WEIGHT)]
        );
    }

    #[test]
    fn house_numbers_sort_numerically_then_by_suffix() {
        let mut unnumbered = record("", "Main St", "Norwood");
        unnumbered.house_number = None;
        let ranked = rank(
            vec![
                unnumbered,
                record("10A", "Main St", "Norwood"),
                record("10", "Main St", "Norwood"),
                record("9", "Main St", "Norwood"),
                record("100", "Main St", "Norwood"),
            ],
            "main",
        );

        let houses: Vec<Option<&str>> = ranked
            .iter()
            .map(|s| s.record.house_number.as_deref())
            .collect();
        assert_eq!(
            houses,
            vec![Some("9"), Some("10"), Some("10A"), Some("100"), None]
        );
        assert!(ranked.iter().all(|s| s.score == STREET_WEIGHT));
    }

    #[tokio::test]
    async fn blank_phrase_is_rejected() {
        let store = seeded_store().await;
        let err = search_relevance(&store, &RelevanceQuery::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::Validation(_)));
    }
}
