use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    unix_millis, DropReason, KnownResources, QueryEvent, ReadEvent, ResourceFilter, ResourceId,
};

/// Custom operation type reported for reads with no accompanying query.
pub const CUSTOM_READ: &str = "CUSTOM_READ";

/// A read, a query, or both halves of one job after correlation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorrelatedEvent {
    ReadOnly { read: ReadEvent },
    QueryOnly { query: QueryEvent },
    Both { read: ReadEvent, query: QueryEvent },
}

impl CorrelatedEvent {
    /// Builds the variant for whichever halves are present.
    #[must_use]
    pub fn pair(read: Option<ReadEvent>, query: Option<QueryEvent>) -> Option<Self> {
        match (read, query) {
            (Some(read), Some(query)) => Some(Self::Both { read, query }),
            (Some(read), None) => Some(Self::ReadOnly { read }),
            (None, Some(query)) => Some(Self::QueryOnly { query }),
            (None, None) => None,
        }
    }

    #[must_use]
    pub fn read(&self) -> Option<&ReadEvent> {
        match self {
            Self::ReadOnly { read } | Self::Both { read, .. } => Some(read),
            Self::QueryOnly { .. } => None,
        }
    }

    #[must_use]
    pub fn query(&self) -> Option<&QueryEvent> {
        match self {
            Self::QueryOnly { query } | Self::Both { query, .. } => Some(query),
            Self::ReadOnly { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteOperation {
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
}

impl WriteOperation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Create => "CREATE",
            Self::Drop => "DROP",
            Self::Alter => "ALTER",
        }
    }

    /// Maps a warehouse statement type onto a write operation.
    #[must_use]
    pub fn from_statement_type(statement_type: &str) -> Option<Self> {
        match statement_type {
            "INSERT" => Some(Self::Insert),
            "UPDATE" | "MERGE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            "CREATE"
            | "CREATE_TABLE_AS_SELECT"
            | "CREATE_EXTERNAL_TABLE"
            | "CREATE_SNAPSHOT_TABLE"
            | "CREATE_VIEW"
            | "CREATE_MATERIALIZED_VIEW"
            | "CREATE_SCHEMA" => Some(Self::Create),
            "DROP_TABLE"
            | "DROP_EXTERNAL_TABLE"
            | "DROP_SNAPSHOT_TABLE"
            | "DROP_VIEW"
            | "DROP_MATERIALIZED_VIEW"
            | "DROP_SCHEMA" => Some(Self::Drop),
            "ALTER_TABLE" | "ALTER_VIEW" | "ALTER_MATERIALIZED_VIEW" | "ALTER_SCHEMA" => {
                Some(Self::Alter)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "category", content = "statement_type", rename_all = "snake_case")]
pub enum OperationCategory {
    Write(WriteOperation),
    Read,
    Custom(String),
}

impl OperationCategory {
    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write(_))
    }

    /// Operation type as the catalog expects it.
    #[must_use]
    pub fn operation_type(&self) -> &str {
        match self {
            Self::Write(operation) => operation.as_str(),
            Self::Read | Self::Custom(_) => "CUSTOM",
        }
    }

    #[must_use]
    pub fn custom_operation_type(&self) -> Option<&str> {
        match self {
            Self::Write(_) => None,
            Self::Read => Some(CUSTOM_READ),
            Self::Custom(raw) => Some(raw.as_str()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationRecord {
    pub destination: ResourceId,
    pub reported_at_millis: i64,
    pub last_updated_millis: i64,
    pub actor_email: String,
    pub category: OperationCategory,
    #[serde(default)]
    pub affected_resources: Vec<ResourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_affected_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_properties: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DerivedOperation {
    Emit(OperationRecord),
    Dropped(DropReason),
    /// Non-write operation while read operational stats are disabled.
    Skipped,
}

/// Stateless mapping from correlated events to operation records.
#[derive(Debug, Clone, Copy)]
pub struct OperationDeriver<'a> {
    filter: &'a ResourceFilter,
    known_resources: &'a KnownResources,
    include_read_operational_stats: bool,
}

impl<'a> OperationDeriver<'a> {
    #[must_use]
    pub fn new(
        filter: &'a ResourceFilter,
        known_resources: &'a KnownResources,
        include_read_operational_stats: bool,
    ) -> Self {
        Self {
            filter,
            known_resources,
            include_read_operational_stats,
        }
    }

    #[must_use]
    pub fn derive(&self, event: &CorrelatedEvent, reported_at: OffsetDateTime) -> DerivedOperation {
        let read = event.read();
        let query = event.query();

        let category = classify(read, query);

        let destination = query
            .and_then(|query| query.destination_table.clone())
            .or_else(|| read.map(|read| read.resource.clone()));
        let Some(destination) = destination else {
            return DerivedOperation::Dropped(DropReason::NoDestination);
        };
        if !self.filter.allowed(destination.as_str())
            || !self.known_resources.contains(&destination)
        {
            return DerivedOperation::Dropped(DropReason::FilteredDestination);
        }

        if !self.include_read_operational_stats && !category.is_write() {
            return DerivedOperation::Skipped;
        }

        let (actor_email, timestamp) = match (query, read) {
            (Some(query), _) => (query.actor_email.clone(), query.end_time),
            (None, Some(read)) => (read.actor_email.clone(), read.timestamp),
            (None, None) => return DerivedOperation::Dropped(DropReason::NoDestination),
        };

        let mut record = OperationRecord {
            destination,
            reported_at_millis: unix_millis(reported_at),
            last_updated_millis: unix_millis(timestamp),
            actor_email,
            category,
            affected_resources: query
                .map(|query| query.referenced_tables.clone())
                .unwrap_or_default(),
            num_affected_rows: None,
            custom_properties: None,
        };

        if self.include_read_operational_stats {
            record.custom_properties = Some(custom_properties(read, query));
            record.num_affected_rows = query.and_then(|query| query.num_affected_rows);
        }

        DerivedOperation::Emit(record)
    }
}

/// A read alongside the query always suppresses write classification.
fn classify(read: Option<&ReadEvent>, query: Option<&QueryEvent>) -> OperationCategory {
    match (read, query) {
        (None, Some(query)) => WriteOperation::from_statement_type(&query.statement_type)
            .map_or_else(
                || OperationCategory::Custom(query.statement_type.clone()),
                OperationCategory::Write,
            ),
        (Some(_), Some(query)) => OperationCategory::Custom(query.statement_type.clone()),
        (_, None) => OperationCategory::Read,
    }
}

fn custom_properties(
    read: Option<&ReadEvent>,
    query: Option<&QueryEvent>,
) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();

    if let Some(query) = query {
        if let Some(start_time) = query.start_time {
            let taken = unix_millis(query.end_time) - unix_millis(start_time);
            properties.insert("millisecondsTaken".to_string(), taken.to_string());
        }
        if !query.job_name.is_empty() {
            properties.insert("sessionId".to_string(), query.job_name.clone());
        }
        properties.insert("text".to_string(), query.query.clone());
        if let Some(bytes) = query.billed_bytes {
            properties.insert("bytesProcessed".to_string(), bytes.to_string());
        }
        if let Some(dataset) = &query.default_dataset {
            properties.insert("defaultDatabase".to_string(), dataset.clone());
        }
    }

    if let Some(read) = read {
        if let Some(reason) = &read.read_reason {
            properties.insert("readReason".to_string(), reason.clone());
        }
        if !read.fields_read.is_empty() {
            let fields = read
                .fields_read
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(",");
            properties.insert("fieldsRead".to_string(), fields);
        }
    }

    properties
}
