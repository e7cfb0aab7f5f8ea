use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use audit_usage_core::{
    query_hash, truncate_query, AuditEvent, ColumnAccess, DropReason, EventError, KnownResources,
    QueryEvent, QueryHasher, ReadEvent, UsageConfig,
};
use audit_usage_store_sqlite::{EventStore, QueryText};
use serde::{Deserialize, Serialize};
use tracing::warn;
use ulid::Ulid;

/// Collision surrogates minted during one run, mapped to their literal text.
#[derive(Debug, Clone, Default)]
pub struct QueryCollisions {
    by_reference: HashMap<String, String>,
    by_text: HashMap<String, String>,
}

impl QueryCollisions {
    #[must_use]
    pub fn text(&self, reference: &str) -> Option<&str> {
        self.by_reference.get(reference).map(String::as_str)
    }

    #[must_use]
    pub fn reference(&self, text: &str) -> Option<&str> {
        self.by_text.get(text).map(String::as_str)
    }

    pub fn insert(&mut self, reference: String, text: String) {
        self.by_text.insert(text.clone(), reference.clone());
        self.by_reference.insert(reference, text);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_reference.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_reference.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored,
    Dropped(DropReason),
    Failed(EventError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorrelatorCounters {
    pub read_events_stored: u64,
    pub query_events_stored: u64,
    pub query_hash_collisions: u64,
    pub read_reasons: BTreeMap<String, u64>,
}

/// Persists incoming events, deduplicating query text by content hash.
pub struct Correlator<'a> {
    config: &'a UsageConfig,
    known_resources: &'a KnownResources,
    hasher: QueryHasher,
    collisions: QueryCollisions,
    counters: CorrelatorCounters,
}

impl<'a> Correlator<'a> {
    #[must_use]
    pub fn new(config: &'a UsageConfig, known_resources: &'a KnownResources) -> Self {
        Self {
            config,
            known_resources,
            hasher: query_hash,
            collisions: QueryCollisions::default(),
            counters: CorrelatorCounters::default(),
        }
    }

    #[must_use]
    pub fn with_hasher(mut self, hasher: QueryHasher) -> Self {
        self.hasher = hasher;
        self
    }

    /// Stores one event, normalizing its timestamps to UTC. `Err` means the store itself failed and the run
    /// must abort.
    pub fn ingest(&mut self, store: &mut EventStore, event: AuditEvent) -> Result<IngestOutcome> {
        match event {
            AuditEvent::Read(read) => self.ingest_read(store, read.into_utc()),
            AuditEvent::Query(query) => self.ingest_query(store, query.into_utc()),
        }
    }

    fn ingest_read(&mut self, store: &mut EventStore, read: ReadEvent) -> Result<IngestOutcome> {
        if let Err(err) = read.validate() {
            return Ok(IngestOutcome::Failed(err.into()));
        }
        if !self.config.in_window(read.timestamp) {
            return Ok(IngestOutcome::Dropped(DropReason::OutsideTimeWindow));
        }
        if read
            .resource
            .is_temporary(&self.config.temp_table_dataset_prefixes)
        {
            return Ok(IngestOutcome::Dropped(DropReason::TemporaryTable));
        }
        if !self.known_resources.contains(&read.resource) {
            return Ok(IngestOutcome::Dropped(DropReason::UnknownResource));
        }

        let key = Ulid::new().to_string();
        for field in &read.fields_read {
            store.column_accesses().set(
                &Ulid::new().to_string(),
                ColumnAccess {
                    read_key: key.clone(),
                    field: field.clone(),
                },
            )?;
        }

        if let Some(reason) = &read.read_reason {
            *self
                .counters
                .read_reasons
                .entry(reason.clone())
                .or_default() += 1;
        }
        store.read_events().set(&key, read)?;
        self.counters.read_events_stored += 1;
        Ok(IngestOutcome::Stored)
    }

    fn ingest_query(&mut self, store: &mut EventStore, mut query: QueryEvent) -> Result<IngestOutcome> {
        if query.job_name.trim().is_empty() {
            return Ok(IngestOutcome::Dropped(DropReason::MissingJobName));
        }
        if let Err(err) = query.validate() {
            return Ok(IngestOutcome::Failed(err.into()));
        }

        let text = truncate_query(&query.query, self.config.max_query_length).to_string();
        query.query = self.reference_for(store, text)?;
        let job_name = query.job_name.clone();
        store.query_events().set(&job_name, query)?;
        self.counters.query_events_stored += 1;
        Ok(IngestOutcome::Stored)
    }

    /// Returns the reference under which `text` is stored, storing it first
    /// when it is new. A hash slot already holding different text gets the
    /// new text under a fresh surrogate.
    fn reference_for(&mut self, store: &mut EventStore, text: String) -> Result<String> {
        let hash = (self.hasher)(&text);
        let mut texts = store.query_texts();

        match texts.get(&hash)? {
            None => {
                texts.set(
                    &hash,
                    QueryText {
                        text,
                        is_collision: false,
                    },
                )?;
                Ok(hash)
            }
            Some(existing) if existing.text == text => Ok(hash),
            Some(_) => {
                if let Some(reference) = self.collisions.reference(&text) {
                    return Ok(reference.to_string());
                }
                let surrogate = Ulid::new().to_string();
                texts.set(
                    &surrogate,
                    QueryText {
                        text: text.clone(),
                        is_collision: true,
                    },
                )?;
                self.collisions.insert(surrogate.clone(), text);
                self.counters.query_hash_collisions += 1;
                warn!(hash = %hash, surrogate = %surrogate, "query hash collision");
                Ok(surrogate)
            }
        }
    }

    #[must_use]
    pub fn collisions(&self) -> &QueryCollisions {
        &self.collisions
    }

    #[must_use]
    pub fn counters(&self) -> &CorrelatorCounters {
        &self.counters
    }

    #[must_use]
    pub fn into_parts(self) -> (QueryCollisions, CorrelatorCounters) {
        (self.collisions, self.counters)
    }
}
