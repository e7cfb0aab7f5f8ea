use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime, UtcOffset};

mod config;
mod operation;

pub use config::{
    AllowDenyPattern, RateLimitConfig, ResourceFilter, StoreConfig, UsageConfig,
    DEFAULT_CACHE_MAX_SIZE, DEFAULT_MAX_QUERY_LENGTH, DEFAULT_TOP_N_QUERIES,
};
pub use operation::{
    CorrelatedEvent, DerivedOperation, OperationCategory, OperationDeriver, OperationRecord,
    WriteOperation, CUSTOM_READ,
};

/// Statement types that only read data. Query events of these types are
/// flagged `is_read` in the store.
pub const READ_STATEMENT_TYPES: &[&str] = &["SELECT"];

/// Set of `project.dataset.table` identifiers discovered by the current crawl.
pub type KnownResources = BTreeSet<ResourceId>;

/// Maps a (truncated) query text to its content reference.
pub type QueryHasher = fn(&str) -> String;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum UsageError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Failure attached to a single incoming event. These never abort a run.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EventError {
    #[error("line {line}: malformed event: {message}")]
    Parse { line: usize, message: String },
    #[error("event source failed: {0}")]
    Source(String),
    #[error("invalid event: {0}")]
    Invalid(String),
}

impl EventError {
    /// Label under which the run report counts this error.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Parse { .. } | Self::Source(_) => "log-parse",
            Self::Invalid(_) => "store-event",
        }
    }
}

impl From<UsageError> for EventError {
    fn from(err: UsageError) -> Self {
        Self::Invalid(err.to_string())
    }
}

/// Why an event or derived record was dropped. Drops are counted, never errors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    OutsideTimeWindow,
    UnknownResource,
    TemporaryTable,
    MissingJobName,
    NoDestination,
    FilteredDestination,
}

impl DropReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OutsideTimeWindow => "outside_time_window",
            Self::UnknownResource => "unknown_resource",
            Self::TemporaryTable => "temporary_table",
            Self::MissingJobName => "missing_job_name",
            Self::NoDestination => "no_destination",
            Self::FilteredDestination => "filtered_destination",
        }
    }
}

impl Display for DropReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A warehouse table identifier in `project.dataset.table` form.
///
/// The project part may itself contain dots (domain-scoped projects), so the
/// identifier is split from the right.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId(String);

impl ResourceId {
    /// Parses a `project.dataset.table` identifier.
    ///
    /// # Errors
    /// Returns [`UsageError::Validation`] when any of the three parts is
    /// missing or empty.
    pub fn parse(raw: &str) -> Result<Self, UsageError> {
        let parts = raw.rsplitn(3, '.').collect::<Vec<_>>();
        if parts.len() != 3 || parts.iter().any(|part| part.trim().is_empty()) {
            return Err(UsageError::Validation(format!(
                "resource MUST be <project>.<dataset>.<table>: {raw}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn project(&self) -> &str {
        self.0.rsplitn(3, '.').nth(2).unwrap_or_default()
    }

    #[must_use]
    pub fn dataset(&self) -> &str {
        self.0.rsplitn(3, '.').nth(1).unwrap_or_default()
    }

    #[must_use]
    pub fn table(&self) -> &str {
        self.0.rsplitn(3, '.').next().unwrap_or_default()
    }

    /// Temporary tables live in datasets whose name starts with one of the
    /// configured prefixes.
    #[must_use]
    pub fn is_temporary(&self, prefixes: &[String]) -> bool {
        let dataset = self.dataset();
        prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && dataset.starts_with(prefix.as_str()))
    }
}

impl TryFrom<String> for ResourceId {
    type Error = UsageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResourceId> for String {
    fn from(value: ResourceId) -> Self {
        value.0
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BucketDuration {
    Hour,
    #[default]
    Day,
}

impl BucketDuration {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            _ => None,
        }
    }

    #[must_use]
    pub fn duration(self) -> Duration {
        match self {
            Self::Hour => Duration::HOUR,
            Self::Day => Duration::DAY,
        }
    }

    /// Floors `timestamp` (normalized to UTC) to the start of its bucket.
    #[must_use]
    pub fn bucket_start(self, timestamp: OffsetDateTime) -> OffsetDateTime {
        let utc = timestamp.to_offset(UtcOffset::UTC);
        let width = self.duration().whole_seconds();
        let unix = utc.unix_timestamp();
        let floored = unix - unix.rem_euclid(width);
        OffsetDateTime::from_unix_timestamp(floored).unwrap_or(utc)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadEvent {
    pub resource: ResourceId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub actor_email: String,
    #[serde(default)]
    pub fields_read: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
}

impl ReadEvent {
    /// # Errors
    /// Returns [`UsageError::Validation`] when the actor is missing or the
    /// timestamp is not UTC.
    pub fn validate(&self) -> Result<(), UsageError> {
        if self.actor_email.trim().is_empty() {
            return Err(UsageError::Validation(format!(
                "read of {} has no actor_email",
                self.resource
            )));
        }
        if self.timestamp.offset() != UtcOffset::UTC {
            return Err(UsageError::Validation(
                "read timestamp MUST be UTC (offset Z)".to_string(),
            ));
        }
        Ok(())
    }

    /// The same read with its timestamp expressed in UTC.
    #[must_use]
    pub fn into_utc(mut self) -> Self {
        self.timestamp = self.timestamp.to_offset(UtcOffset::UTC);
        self
    }

    /// The job identifier linking this read to a query, if non-empty.
    #[must_use]
    pub fn job(&self) -> Option<&str> {
        self.job_name.as_deref().filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryEvent {
    pub job_name: String,
    pub query: String,
    pub statement_type: String,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub start_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub end_time: OffsetDateTime,
    pub actor_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_table: Option<ResourceId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referenced_tables: Vec<ResourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billed_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_affected_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_dataset: Option<String>,
}

impl QueryEvent {
    /// # Errors
    /// Returns [`UsageError::Validation`] when the actor is missing or a
    /// timestamp is not UTC.
    pub fn validate(&self) -> Result<(), UsageError> {
        if self.actor_email.trim().is_empty() {
            return Err(UsageError::Validation(format!(
                "query job {} has no actor_email",
                self.job_name
            )));
        }
        let utc_times = std::iter::once(self.end_time).chain(self.start_time);
        for value in utc_times {
            if value.offset() != UtcOffset::UTC {
                return Err(UsageError::Validation(
                    "query timestamps MUST be UTC (offset Z)".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// The same query with both timestamps expressed in UTC.
    #[must_use]
    pub fn into_utc(mut self) -> Self {
        self.end_time = self.end_time.to_offset(UtcOffset::UTC);
        self.start_time = self.start_time.map(|value| value.to_offset(UtcOffset::UTC));
        self
    }

    #[must_use]
    pub fn is_read(&self) -> bool {
        READ_STATEMENT_TYPES.contains(&self.statement_type.as_str())
    }
}

/// Canonical input event as produced by the upstream event source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    Read(ReadEvent),
    Query(QueryEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnAccess {
    pub read_key: String,
    pub field: String,
}

/// One aggregated (bucket, resource) row. Frequency lists are already ordered
/// by count descending with a deterministic tie-break.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageStatistic {
    #[serde(with = "time::serde::rfc3339")]
    pub bucket_start: OffsetDateTime,
    pub resource: ResourceId,
    pub query_count: u64,
    pub query_freq: Vec<(String, u64)>,
    pub user_freq: Vec<(String, u64)>,
    pub column_freq: Vec<(String, u64)>,
}

/// Usage statistic as handed to the downstream emitter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub bucket_start: OffsetDateTime,
    pub bucket_duration: BucketDuration,
    pub resource: ResourceId,
    pub query_count: u64,
    pub query_freq: Vec<(String, u64)>,
    pub user_freq: Vec<(String, u64)>,
    pub column_freq: Vec<(String, u64)>,
}

impl UsageRecord {
    #[must_use]
    pub fn from_statistic(statistic: UsageStatistic, bucket_duration: BucketDuration) -> Self {
        Self {
            bucket_start: statistic.bucket_start,
            bucket_duration,
            resource: statistic.resource,
            query_count: statistic.query_count,
            query_freq: statistic.query_freq,
            user_freq: statistic.user_freq,
            column_freq: statistic.column_freq,
        }
    }
}

/// SHA-256 hex digest of a query text.
#[must_use]
pub fn query_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Truncates to at most `max_chars` characters without splitting a code point.
#[must_use]
pub fn truncate_query(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`UsageError::Validation`] when parsing fails or the timestamp is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, UsageError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| UsageError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(UsageError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`UsageError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, UsageError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| UsageError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
pub fn unix_millis(value: OffsetDateTime) -> i64 {
    value.unix_timestamp() * 1_000 + i64::from(value.millisecond())
}
