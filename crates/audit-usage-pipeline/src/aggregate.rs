use anyhow::Result;
use audit_usage_core::{format_rfc3339, ResourceId, UsageStatistic};
use audit_usage_store_sqlite::{EventStore, RawUsageStatistic};
use time::OffsetDateTime;
use tracing::debug;

use crate::correlator::QueryCollisions;

/// A stored query reference with no text behind it. The correlator never
/// produces one, so hitting this means the store is corrupt.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("query reference {reference} resolves to no stored text{location}")]
    InconsistentQueryReference { reference: String, location: String },
}

impl ConsistencyError {
    fn unresolved(reference: &str, context: Option<(OffsetDateTime, &ResourceId)>) -> Self {
        let location = context
            .map(|(bucket, resource)| {
                let bucket = format_rfc3339(bucket).unwrap_or_else(|_| bucket.to_string());
                format!(" (bucket {bucket}, resource {resource})")
            })
            .unwrap_or_default();
        Self::InconsistentQueryReference {
            reference: reference.to_string(),
            location,
        }
    }
}

/// Resolves a query reference to literal text: collision surrogates first,
/// then the text joined from the store.
pub fn resolve_query_text(
    collisions: &QueryCollisions,
    reference: &str,
    stored_text: Option<&str>,
) -> Result<String, ConsistencyError> {
    collisions
        .text(reference)
        .or(stored_text)
        .map(str::to_string)
        .ok_or_else(|| ConsistencyError::unresolved(reference, None))
}

/// Turns stored events into per-(bucket, resource) usage statistics.
pub struct AggregationEngine<'a> {
    collisions: &'a QueryCollisions,
    top_n: usize,
}

impl<'a> AggregationEngine<'a> {
    #[must_use]
    pub fn new(collisions: &'a QueryCollisions, top_n: usize) -> Self {
        Self { collisions, top_n }
    }

    /// Streams every statistic to `emit` in (bucket, resource) order without
    /// materializing the result set. Returns the number emitted.
    pub fn run<F>(&self, store: &mut EventStore, mut emit: F) -> Result<u64>
    where
        F: FnMut(UsageStatistic) -> Result<()>,
    {
        let mut statistics = store.usage_statistics(self.top_n)?;
        let mut emitted = 0_u64;
        for raw in statistics.iter()? {
            emit(self.resolve(raw?)?)?;
            emitted += 1;
        }
        debug!(emitted, top_n = self.top_n, "aggregated usage statistics");
        Ok(emitted)
    }

    pub fn resolve(&self, raw: RawUsageStatistic) -> Result<UsageStatistic, ConsistencyError> {
        let RawUsageStatistic {
            bucket_start,
            resource,
            query_count,
            query_freq,
            user_freq,
            column_freq,
        } = raw;

        let query_freq = query_freq
            .into_iter()
            .map(|entry| {
                resolve_query_text(self.collisions, &entry.reference, entry.text.as_deref())
                    .map(|text| (text, entry.count))
                    .map_err(|_| {
                        ConsistencyError::unresolved(&entry.reference, Some((bucket_start, &resource)))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(UsageStatistic {
            bucket_start,
            resource,
            query_count,
            query_freq,
            user_freq,
            column_freq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audit_usage_core::parse_rfc3339_utc;
    use audit_usage_store_sqlite::QueryFrequency;

    fn raw_statistic(reference: &str, text: Option<&str>) -> RawUsageStatistic {
        RawUsageStatistic {
            bucket_start: match parse_rfc3339_utc("2023-01-01T10:00:00Z") {
                Ok(value) => value,
                Err(err) => panic!("test failure: {err}"),
            },
            resource: match ResourceId::parse("p.d.t1") {
                Ok(value) => value,
                Err(err) => panic!("test failure: {err}"),
            },
            query_count: 2,
            query_freq: vec![QueryFrequency {
                reference: reference.to_string(),
                text: text.map(str::to_string),
                count: 2,
            }],
            user_freq: vec![("a@x.com".to_string(), 2)],
            column_freq: Vec::new(),
        }
    }

    #[test]
    fn collision_map_wins_over_stored_text() {
        let mut collisions = QueryCollisions::default();
        collisions.insert("surrogate".to_string(), "SELECT 2".to_string());
        let engine = AggregationEngine::new(&collisions, 10);

        let resolved = match engine.resolve(raw_statistic("surrogate", Some("stale"))) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(resolved.query_freq, vec![("SELECT 2".to_string(), 2)]);
    }

    #[test]
    fn stored_text_resolves_hash_references() {
        let collisions = QueryCollisions::default();
        let engine = AggregationEngine::new(&collisions, 10);
        let resolved = match engine.resolve(raw_statistic("abc", Some("SELECT 1"))) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(resolved.query_freq, vec![("SELECT 1".to_string(), 2)]);
        assert_eq!(resolved.user_freq, vec![("a@x.com".to_string(), 2)]);
    }

    #[test]
    fn dangling_reference_is_a_consistency_error() {
        let collisions = QueryCollisions::default();
        let engine = AggregationEngine::new(&collisions, 10);
        let err = match engine.resolve(raw_statistic("dangling", None)) {
            Ok(value) => panic!("expected error, got {value:?}"),
            Err(err) => err,
        };
        let message = err.to_string();
        assert!(message.contains("dangling"));
        assert!(message.contains("p.d.t1"));
    }
}
