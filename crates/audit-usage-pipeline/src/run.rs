use std::collections::BTreeMap;

use anyhow::{Context, Result};
use audit_usage_core::{
    now_utc, AuditEvent, CorrelatedEvent, DerivedOperation, DropReason, EventError,
    KnownResources, OperationDeriver, UsageConfig, UsageRecord,
};
use audit_usage_store_sqlite::{EventStore, StoreStats, StoredPair};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::aggregate::{resolve_query_text, AggregationEngine};
use crate::correlator::{Correlator, IngestOutcome, QueryCollisions};
use crate::sink::UsageSink;
use crate::source::{RateLimited, RateLimiter};

/// Counters describing one extraction run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunReport {
    pub events_seen: u64,
    pub read_events_stored: u64,
    pub query_events_stored: u64,
    pub dropped: BTreeMap<String, u64>,
    pub query_hash_collisions: u64,
    pub error_counts: BTreeMap<String, u64>,
    pub read_reasons: BTreeMap<String, u64>,
    pub operation_types: BTreeMap<String, u64>,
    pub operations_emitted: u64,
    pub operations_dropped: u64,
    pub operations_skipped: u64,
    pub usage_records_emitted: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreStats>,
}

impl RunReport {
    fn count_drop(&mut self, reason: DropReason) {
        *self.dropped.entry(reason.as_str().to_string()).or_default() += 1;
    }

    fn count_error(&mut self, err: &EventError) {
        *self
            .error_counts
            .entry(err.category().to_string())
            .or_default() += 1;
    }

    #[must_use]
    pub fn dropped_total(&self) -> u64 {
        self.dropped.values().sum()
    }

    #[must_use]
    pub fn error_total(&self) -> u64 {
        self.error_counts.values().sum()
    }
}

/// Runs one extraction over an ephemeral store that is removed afterwards.
pub fn run_usage_extraction<S, K>(
    config: &UsageConfig,
    known_resources: &KnownResources,
    source: S,
    sink: &mut K,
) -> Result<RunReport>
where
    S: IntoIterator<Item = Result<AuditEvent, EventError>>,
    K: UsageSink + ?Sized,
{
    config.validate().context("invalid usage configuration")?;
    let store = EventStore::open_ephemeral(&config.store, config.bucket_duration)
        .context("failed to open event store")?;
    run_with_store(config, known_resources, store, source, sink)
}

/// Runs one extraction over a caller-provided store. The store is closed on
/// every path; a run failure takes precedence over a close failure.
pub fn run_with_store<S, K>(
    config: &UsageConfig,
    known_resources: &KnownResources,
    mut store: EventStore,
    source: S,
    sink: &mut K,
) -> Result<RunReport>
where
    S: IntoIterator<Item = Result<AuditEvent, EventError>>,
    K: UsageSink + ?Sized,
{
    let outcome = execute(config, known_resources, &mut store, source, sink);
    let closed = store.close();

    match (outcome, closed) {
        (Ok(report), Ok(())) => Ok(report),
        (Ok(_), Err(err)) => Err(err.context("failed to close event store")),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(close_err)) => {
            warn!(error = %close_err, "failed to close event store after run failure");
            Err(err)
        }
    }
}

fn execute<S, K>(
    config: &UsageConfig,
    known_resources: &KnownResources,
    store: &mut EventStore,
    source: S,
    sink: &mut K,
) -> Result<RunReport>
where
    S: IntoIterator<Item = Result<AuditEvent, EventError>>,
    K: UsageSink + ?Sized,
{
    let filter = config
        .resource_pattern
        .compile()
        .context("invalid resource pattern")?;
    let mut report = RunReport::default();
    let mut correlator = Correlator::new(config, known_resources);

    let events = source.into_iter();
    match &config.rate_limit {
        Some(rate_limit) => ingest(
            &mut correlator,
            store,
            RateLimited::new(events, RateLimiter::from_config(rate_limit)),
            &mut report,
        )?,
        None => ingest(&mut correlator, store, events, &mut report)?,
    }

    let (collisions, counters) = correlator.into_parts();
    report.read_events_stored = counters.read_events_stored;
    report.query_events_stored = counters.query_events_stored;
    report.query_hash_collisions = counters.query_hash_collisions;
    report.read_reasons = counters.read_reasons;
    info!(
        events_seen = report.events_seen,
        reads = report.read_events_stored,
        queries = report.query_events_stored,
        dropped = report.dropped_total(),
        errors = report.error_total(),
        "event ingestion finished"
    );

    store.create_indexes()?;

    if config.include_operational_stats {
        let deriver = OperationDeriver::new(
            &filter,
            known_resources,
            config.include_read_operational_stats,
        );
        emit_operations(store, &collisions, &deriver, now_utc(), sink, &mut report)?;
    }

    let bucket_duration = config.bucket_duration;
    let engine = AggregationEngine::new(&collisions, config.effective_top_n());
    report.usage_records_emitted = engine.run(store, |statistic| {
        sink.emit_usage(&UsageRecord::from_statistic(statistic, bucket_duration))
    })?;

    report.store = Some(store.stats()?);
    info!(
        usage_records = report.usage_records_emitted,
        operations = report.operations_emitted,
        collisions = report.query_hash_collisions,
        "usage extraction finished"
    );
    Ok(report)
}

fn ingest<I>(
    correlator: &mut Correlator<'_>,
    store: &mut EventStore,
    events: I,
    report: &mut RunReport,
) -> Result<()>
where
    I: Iterator<Item = Result<AuditEvent, EventError>>,
{
    for item in events {
        report.events_seen += 1;
        let event = match item {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, category = err.category(), "skipping unreadable event");
                report.count_error(&err);
                continue;
            }
        };

        match correlator.ingest(store, event)? {
            IngestOutcome::Stored => {}
            IngestOutcome::Dropped(reason) => {
                debug!(reason = reason.as_str(), "dropped event");
                report.count_drop(reason);
            }
            IngestOutcome::Failed(err) => {
                warn!(error = %err, category = err.category(), "failed to store event");
                report.count_error(&err);
            }
        }
    }
    Ok(())
}

fn emit_operations<K>(
    store: &mut EventStore,
    collisions: &QueryCollisions,
    deriver: &OperationDeriver<'_>,
    reported_at: OffsetDateTime,
    sink: &mut K,
    report: &mut RunReport,
) -> Result<()>
where
    K: UsageSink + ?Sized,
{
    let mut pairs = store.correlated_events()?;
    for row in pairs.iter()? {
        let StoredPair {
            read,
            query,
            query_text,
        } = row?;
        let query = match query {
            Some(mut query) => {
                query.query = resolve_query_text(collisions, &query.query, query_text.as_deref())?;
                Some(query)
            }
            None => None,
        };
        let Some(event) = CorrelatedEvent::pair(read, query) else {
            continue;
        };

        match deriver.derive(&event, reported_at) {
            DerivedOperation::Emit(record) => {
                let operation_type = record
                    .category
                    .custom_operation_type()
                    .unwrap_or_else(|| record.category.operation_type())
                    .to_string();
                sink.emit_operation(&record)?;
                *report.operation_types.entry(operation_type).or_default() += 1;
                report.operations_emitted += 1;
            }
            DerivedOperation::Dropped(reason) => {
                debug!(reason = reason.as_str(), "dropped operation");
                report.count_drop(reason);
                report.operations_dropped += 1;
            }
            DerivedOperation::Skipped => report.operations_skipped += 1,
        }
    }
    Ok(())
}
