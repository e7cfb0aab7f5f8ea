#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use audit_usage_core::{
    format_rfc3339, parse_rfc3339_utc, BucketDuration, ColumnAccess, QueryEvent, ReadEvent,
    ResourceId, StoreConfig,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Statement};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::debug;

const EPHEMERAL_DB_FILE: &str = "events.sqlite";
const META_BUCKET_DURATION: &str = "bucket_duration";

const SCHEMA_EVENT_STORE_V1: &str = r"
CREATE TABLE IF NOT EXISTS store_meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS read_events (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  resource TEXT NOT NULL,
  job_name TEXT,
  bucket TEXT NOT NULL,
  actor TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS query_events (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  query_ref TEXT NOT NULL,
  statement_type TEXT NOT NULL,
  is_read INTEGER NOT NULL CHECK (is_read IN (0, 1))
);

CREATE TABLE IF NOT EXISTS column_accesses (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  read_key TEXT NOT NULL,
  field TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS query_texts (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  text TEXT NOT NULL,
  is_collision INTEGER NOT NULL CHECK (is_collision IN (0, 1))
);
";

const INDEXES_EVENT_STORE_V1: &str = r"
CREATE INDEX IF NOT EXISTS idx_read_events_job_name ON read_events(job_name);
CREATE INDEX IF NOT EXISTS idx_read_events_bucket_resource ON read_events(bucket, resource, actor);
CREATE INDEX IF NOT EXISTS idx_query_events_query_ref ON query_events(query_ref);
CREATE INDEX IF NOT EXISTS idx_column_accesses_read_key ON column_accesses(read_key, field);
CREATE INDEX IF NOT EXISTS idx_query_texts_collision ON query_texts(is_collision);
";

const USAGE_STATISTICS_SQL: &str = r"
WITH joined AS (
  SELECT r.bucket, r.resource, q.query_ref
  FROM read_events r
  INNER JOIN query_events q ON q.key = r.job_name
),
totals AS (
  SELECT bucket, resource, COUNT(*) AS query_count
  FROM joined
  GROUP BY bucket, resource
),
query_counts AS (
  SELECT j.bucket, j.resource, j.query_ref, t.text, COUNT(*) AS cnt
  FROM joined j
  LEFT JOIN query_texts t ON t.key = j.query_ref
  GROUP BY j.bucket, j.resource, j.query_ref
),
query_ranked AS (
  SELECT bucket, resource, query_ref, text, cnt,
    ROW_NUMBER() OVER (
      PARTITION BY bucket, resource
      ORDER BY cnt DESC, text ASC, query_ref ASC
    ) AS query_rank
  FROM query_counts
),
query_freq AS (
  SELECT bucket, resource,
    json_group_array(json_array(query_ref, text, cnt) ORDER BY query_rank) AS entries
  FROM query_ranked
  WHERE ?1 > 0 AND query_rank <= ?1
  GROUP BY bucket, resource
),
user_freq AS (
  SELECT bucket, resource,
    json_group_array(json_array(actor, cnt) ORDER BY cnt DESC, actor ASC) AS entries
  FROM (
    SELECT bucket, resource, actor, COUNT(*) AS cnt
    FROM read_events
    GROUP BY bucket, resource, actor
  )
  GROUP BY bucket, resource
),
column_freq AS (
  SELECT bucket, resource,
    json_group_array(json_array(field, cnt) ORDER BY cnt DESC, field ASC) AS entries
  FROM (
    SELECT r.bucket, r.resource, c.field, COUNT(*) AS cnt
    FROM read_events r
    INNER JOIN column_accesses c ON c.read_key = r.key
    GROUP BY r.bucket, r.resource, c.field
  )
  GROUP BY bucket, resource
)
SELECT a.bucket, a.resource, a.query_count, qf.entries, uf.entries, cf.entries
FROM totals a
LEFT JOIN query_freq qf ON qf.bucket = a.bucket AND qf.resource = a.resource
LEFT JOIN user_freq uf ON uf.bucket = a.bucket AND uf.resource = a.resource
LEFT JOIN column_freq cf ON cf.bucket = a.bucket AND cf.resource = a.resource
ORDER BY a.bucket, a.resource
";

const CORRELATED_EVENTS_SQL: &str = r"
SELECT 0 AS part, r.rowid AS seq, r.value, q.value, t.text
FROM read_events r
LEFT JOIN query_events q ON q.key = r.job_name
LEFT JOIN query_texts t ON t.key = q.query_ref
UNION ALL
SELECT 1 AS part, q.rowid AS seq, NULL, q.value, t.text
FROM query_events q
LEFT JOIN query_texts t ON t.key = q.query_ref
WHERE NOT EXISTS (SELECT 1 FROM read_events r WHERE r.job_name = q.key)
ORDER BY part, seq
";

struct TableSchema {
    name: &'static str,
    columns: &'static [&'static str],
}

static READ_EVENTS: TableSchema = TableSchema {
    name: "read_events",
    columns: &["resource", "job_name", "bucket", "actor"],
};

static QUERY_EVENTS: TableSchema = TableSchema {
    name: "query_events",
    columns: &["query_ref", "statement_type", "is_read"],
};

static COLUMN_ACCESSES: TableSchema = TableSchema {
    name: "column_accesses",
    columns: &["read_key", "field"],
};

static QUERY_TEXTS: TableSchema = TableSchema {
    name: "query_texts",
    columns: &["text", "is_collision"],
};

/// Literal query text stored under a content hash or a collision surrogate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryText {
    pub text: String,
    pub is_collision: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StoreStats {
    pub read_events: u64,
    pub query_events: u64,
    pub read_queries: u64,
    pub column_accesses: u64,
    pub query_texts: u64,
    pub collision_texts: u64,
    pub buckets: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFrequency {
    pub reference: String,
    /// `None` when the reference has no row in `query_texts`.
    pub text: Option<String>,
    pub count: u64,
}

/// One (bucket, resource) row before query references are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawUsageStatistic {
    pub bucket_start: time::OffsetDateTime,
    pub resource: ResourceId,
    pub query_count: u64,
    pub query_freq: Vec<QueryFrequency>,
    pub user_freq: Vec<(String, u64)>,
    pub column_freq: Vec<(String, u64)>,
}

/// A stored read joined to its query, or a query no read points at. The
/// query's `query` field still holds the reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPair {
    pub read: Option<ReadEvent>,
    pub query: Option<QueryEvent>,
    pub query_text: Option<String>,
}

type DeriveColumns<V> = Box<dyn Fn(&V) -> Result<Vec<SqlValue>>>;

struct CacheEntry<V> {
    value: V,
    dirty: bool,
    seq: u64,
}

/// Write-back LRU cache in front of one key/value table.
struct CachedTable<V> {
    schema: &'static TableSchema,
    derive: DeriveColumns<V>,
    upsert_sql: String,
    entries: HashMap<String, CacheEntry<V>>,
    recency: BTreeMap<u64, String>,
    next_seq: u64,
    max_size: usize,
    batch_size: usize,
}

impl<V: Serialize + DeserializeOwned + Clone> CachedTable<V> {
    fn new(schema: &'static TableSchema, config: &StoreConfig, derive: DeriveColumns<V>) -> Self {
        let columns = schema.columns.join(", ");
        let placeholders = (0..schema.columns.len() + 2)
            .map(|index| format!("?{}", index + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = std::iter::once("value")
            .chain(schema.columns.iter().copied())
            .map(|column| format!("{column} = excluded.{column}"))
            .collect::<Vec<_>>()
            .join(", ");
        let upsert_sql = format!(
            "INSERT INTO {}(key, value, {columns}) VALUES ({placeholders})
             ON CONFLICT(key) DO UPDATE SET {updates}",
            schema.name
        );

        Self {
            schema,
            derive,
            upsert_sql,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_seq: 0,
            max_size: config.cache_max_size.max(1),
            batch_size: config.eviction_batch_size().max(1),
        }
    }

    fn bump(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn get(&mut self, conn: &Connection, key: &str) -> Result<Option<V>> {
        let seq = self.bump();
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.seq);
            entry.seq = seq;
            self.recency.insert(seq, key.to_string());
            return Ok(Some(entry.value.clone()));
        }

        let raw: Option<String> = conn
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", self.schema.name),
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read {} key {key}", self.schema.name))?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let value: V = serde_json::from_str(&raw)
            .with_context(|| format!("failed to decode {} value for key {key}", self.schema.name))?;

        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.clone(),
                dirty: false,
                seq,
            },
        );
        self.recency.insert(seq, key.to_string());
        self.evict_if_needed(conn)?;
        Ok(Some(value))
    }

    fn set(&mut self, conn: &Connection, key: &str, value: V) -> Result<()> {
        let seq = self.bump();
        let previous = self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                dirty: true,
                seq,
            },
        );
        if let Some(previous) = previous {
            self.recency.remove(&previous.seq);
        }
        self.recency.insert(seq, key.to_string());
        self.evict_if_needed(conn)
    }

    fn contains(&self, conn: &Connection, key: &str) -> Result<bool> {
        if self.entries.contains_key(key) {
            return Ok(true);
        }
        conn.query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE key = ?1)",
                self.schema.name
            ),
            params![key],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to probe {} key {key}", self.schema.name))
    }

    fn evict_if_needed(&mut self, conn: &Connection) -> Result<()> {
        if self.entries.len() <= self.max_size {
            return Ok(());
        }

        let victims = self
            .recency
            .values()
            .take(self.batch_size)
            .cloned()
            .collect::<Vec<_>>();
        let dirty = victims
            .iter()
            .filter_map(|key| {
                self.entries
                    .get(key)
                    .filter(|entry| entry.dirty)
                    .map(|entry| (key.as_str(), &entry.value))
            })
            .collect::<Vec<_>>();
        let written = dirty.len();
        self.write_rows(conn, dirty)?;

        for key in &victims {
            if let Some(entry) = self.entries.remove(key) {
                self.recency.remove(&entry.seq);
            }
        }

        debug!(
            table = self.schema.name,
            evicted = victims.len(),
            written,
            "evicted cache batch"
        );
        Ok(())
    }

    /// Writes every dirty entry in recency order. Entries stay cached.
    fn flush(&mut self, conn: &Connection) -> Result<usize> {
        let dirty = self
            .recency
            .values()
            .filter_map(|key| {
                self.entries
                    .get(key)
                    .filter(|entry| entry.dirty)
                    .map(|entry| (key.as_str(), &entry.value))
            })
            .collect::<Vec<_>>();
        if dirty.is_empty() {
            return Ok(0);
        }
        let written = dirty.len();
        self.write_rows(conn, dirty)?;
        for entry in self.entries.values_mut() {
            entry.dirty = false;
        }
        Ok(written)
    }

    fn write_rows(&self, conn: &Connection, rows: Vec<(&str, &V)>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let tx = conn
            .unchecked_transaction()
            .with_context(|| format!("failed to start {} write transaction", self.schema.name))?;
        {
            let mut stmt = tx
                .prepare_cached(&self.upsert_sql)
                .with_context(|| format!("failed to prepare {} upsert", self.schema.name))?;
            for (key, value) in rows {
                let raw = serde_json::to_string(value).with_context(|| {
                    format!("failed to serialize {} value for key {key}", self.schema.name)
                })?;
                let mut values = vec![SqlValue::Text(key.to_string()), SqlValue::Text(raw)];
                values.extend((self.derive)(value)?);
                stmt.execute(params_from_iter(values))
                    .with_context(|| format!("failed to write {} key {key}", self.schema.name))?;
            }
        }
        tx.commit()
            .with_context(|| format!("failed to commit {} write transaction", self.schema.name))?;
        Ok(())
    }
}

/// Typed view of one persisted table.
pub struct TableHandle<'a, V> {
    conn: &'a Connection,
    table: &'a mut CachedTable<V>,
}

impl<V: Serialize + DeserializeOwned + Clone> TableHandle<'_, V> {
    pub fn get(&mut self, key: &str) -> Result<Option<V>> {
        self.table.get(self.conn, key)
    }

    pub fn set(&mut self, key: &str, value: V) -> Result<()> {
        self.table.set(self.conn, key, value)
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        self.table.contains(self.conn, key)
    }

    pub fn len(&mut self) -> Result<u64> {
        self.table.flush(self.conn)?;
        let count: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", self.table.schema.name),
                [],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to count {}", self.table.schema.name))?;
        u64::try_from(count).map_err(|_| anyhow!("negative row count: {count}"))
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Entries currently held in memory.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.table.entries.len()
    }

    /// Visits every row in insertion order.
    pub fn for_each<F>(&mut self, mut visit: F) -> Result<()>
    where
        F: FnMut(&str, V) -> Result<()>,
    {
        self.table.flush(self.conn)?;
        let name = self.table.schema.name;
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT key, value FROM {name} ORDER BY rowid"))
            .with_context(|| format!("failed to prepare {name} scan"))?;
        let mut rows = stmt.query([]).with_context(|| format!("failed to scan {name}"))?;
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let raw: String = row.get(1)?;
            let value: V = serde_json::from_str(&raw)
                .with_context(|| format!("failed to decode {name} value for key {key}"))?;
            visit(&key, value)?;
        }
        Ok(())
    }
}

/// Ephemeral persisted store for one extraction run.
///
/// Four cached tables share a single `SQLite` connection. Field order matters:
/// the connection drops before the temporary directory holding its file.
pub struct EventStore {
    conn: Connection,
    read_events: CachedTable<ReadEvent>,
    query_events: CachedTable<QueryEvent>,
    column_accesses: CachedTable<ColumnAccess>,
    query_texts: CachedTable<QueryText>,
    bucket_duration: BucketDuration,
    indexes_created: bool,
    read_only: bool,
    temp_dir: Option<TempDir>,
}

impl EventStore {
    pub fn open(
        path: &Path,
        config: &StoreConfig,
        bucket_duration: BucketDuration,
    ) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Self::from_connection(conn, config, bucket_duration)
    }

    /// Opens a store in a fresh temporary directory removed on drop.
    pub fn open_ephemeral(config: &StoreConfig, bucket_duration: BucketDuration) -> Result<Self> {
        let temp_dir = tempfile::Builder::new()
            .prefix("audit-usage-")
            .tempdir()
            .context("failed to create temporary store directory")?;
        let path = temp_dir.path().join(EPHEMERAL_DB_FILE);
        let mut store = Self::open(&path, config, bucket_duration)?;
        debug!(path = %path.display(), "opened ephemeral event store");
        store.temp_dir = Some(temp_dir);
        Ok(store)
    }

    pub fn open_in_memory(config: &StoreConfig, bucket_duration: BucketDuration) -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        Self::from_connection(conn, config, bucket_duration)
    }

    /// Opens a kept store for diagnostics. Writes through this handle fail.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .context("failed to configure sqlite pragmas")?;

        let bucket_duration = read_bucket_duration(&conn)?.ok_or_else(|| {
            anyhow!(
                "store {} has no recorded bucket duration",
                path.display()
            )
        })?;
        let mut store = Self::with_tables(conn, &StoreConfig::default(), bucket_duration);
        store.indexes_created = true;
        store.read_only = true;
        Ok(store)
    }

    fn from_connection(
        conn: Connection,
        config: &StoreConfig,
        bucket_duration: BucketDuration,
    ) -> Result<Self> {
        let mut store = Self::with_tables(conn, config, bucket_duration);
        store.migrate()?;
        store.record_bucket_duration()?;
        if !config.delay_index_creation {
            store.create_indexes()?;
        }
        Ok(store)
    }

    fn with_tables(
        conn: Connection,
        config: &StoreConfig,
        bucket_duration: BucketDuration,
    ) -> Self {
        Self {
            conn,
            read_events: CachedTable::new(
                &READ_EVENTS,
                config,
                Box::new(move |event: &ReadEvent| {
                    let bucket = format_rfc3339(bucket_duration.bucket_start(event.timestamp))
                        .map_err(|err| anyhow!(err.to_string()))?;
                    Ok(vec![
                        SqlValue::Text(event.resource.to_string()),
                        event
                            .job()
                            .map_or(SqlValue::Null, |job| SqlValue::Text(job.to_string())),
                        SqlValue::Text(bucket),
                        SqlValue::Text(event.actor_email.clone()),
                    ])
                }),
            ),
            query_events: CachedTable::new(
                &QUERY_EVENTS,
                config,
                Box::new(|event: &QueryEvent| {
                    Ok(vec![
                        SqlValue::Text(event.query.clone()),
                        SqlValue::Text(event.statement_type.clone()),
                        SqlValue::Integer(bool_to_sql(event.is_read())),
                    ])
                }),
            ),
            column_accesses: CachedTable::new(
                &COLUMN_ACCESSES,
                config,
                Box::new(|access: &ColumnAccess| {
                    Ok(vec![
                        SqlValue::Text(access.read_key.clone()),
                        SqlValue::Text(access.field.clone()),
                    ])
                }),
            ),
            query_texts: CachedTable::new(
                &QUERY_TEXTS,
                config,
                Box::new(|text: &QueryText| {
                    Ok(vec![
                        SqlValue::Text(text.text.clone()),
                        SqlValue::Integer(bool_to_sql(text.is_collision)),
                    ])
                }),
            ),
            bucket_duration,
            indexes_created: false,
            read_only: false,
            temp_dir: None,
        }
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_EVENT_STORE_V1)
            .context("failed to apply event store schema")
    }

    /// Bucket width the stored `bucket` columns were computed with.
    #[must_use]
    pub fn bucket_duration(&self) -> BucketDuration {
        self.bucket_duration
    }

    /// Records the bucket width on first open and rejects reopening with a
    /// different one.
    fn record_bucket_duration(&self) -> Result<()> {
        match read_bucket_duration(&self.conn)? {
            Some(existing) if existing == self.bucket_duration => Ok(()),
            Some(existing) => Err(anyhow!(
                "store was written with {} buckets, not {}",
                existing.as_str(),
                self.bucket_duration.as_str()
            )),
            None => {
                self.conn
                    .execute(
                        "INSERT INTO store_meta(key, value) VALUES (?1, ?2)",
                        params![META_BUCKET_DURATION, self.bucket_duration.as_str()],
                    )
                    .context("failed to record store bucket duration")?;
                Ok(())
            }
        }
    }

    /// Builds the derived-column indexes. Idempotent.
    pub fn create_indexes(&mut self) -> Result<()> {
        if self.indexes_created {
            return Ok(());
        }
        self.conn
            .execute_batch(INDEXES_EVENT_STORE_V1)
            .context("failed to create event store indexes")?;
        self.indexes_created = true;
        debug!("created event store indexes");
        Ok(())
    }

    pub fn read_events(&mut self) -> TableHandle<'_, ReadEvent> {
        TableHandle {
            conn: &self.conn,
            table: &mut self.read_events,
        }
    }

    pub fn query_events(&mut self) -> TableHandle<'_, QueryEvent> {
        TableHandle {
            conn: &self.conn,
            table: &mut self.query_events,
        }
    }

    pub fn column_accesses(&mut self) -> TableHandle<'_, ColumnAccess> {
        TableHandle {
            conn: &self.conn,
            table: &mut self.column_accesses,
        }
    }

    pub fn query_texts(&mut self) -> TableHandle<'_, QueryText> {
        TableHandle {
            conn: &self.conn,
            table: &mut self.query_texts,
        }
    }

    /// Writes every dirty cache entry. Returns the number of rows written.
    pub fn flush(&mut self) -> Result<usize> {
        let mut written = self.read_events.flush(&self.conn)?;
        written += self.query_events.flush(&self.conn)?;
        written += self.column_accesses.flush(&self.conn)?;
        written += self.query_texts.flush(&self.conn)?;
        Ok(written)
    }

    /// Flushes every cache and closes the connection. A kept database file is
    /// left in rollback-journal mode so read-only diagnostics can open it.
    pub fn close(mut self) -> Result<()> {
        let written = self.flush()?;
        if !self.read_only {
            self.conn
                .query_row("PRAGMA journal_mode = DELETE", [], |row| row.get::<_, String>(0))
                .context("failed to leave WAL journal mode")?;
        }
        let Self { conn, temp_dir, .. } = self;
        conn.close()
            .map_err(|(_, err)| err)
            .context("failed to close sqlite database")?;
        debug!(flushed = written, "closed event store");
        drop(temp_dir);
        Ok(())
    }

    pub fn stats(&mut self) -> Result<StoreStats> {
        self.flush()?;
        self.conn
            .query_row(
                "SELECT
                    (SELECT COUNT(*) FROM read_events),
                    (SELECT COUNT(*) FROM query_events),
                    (SELECT COUNT(*) FROM query_events WHERE is_read = 1),
                    (SELECT COUNT(*) FROM column_accesses),
                    (SELECT COUNT(*) FROM query_texts),
                    (SELECT COUNT(*) FROM query_texts WHERE is_collision = 1),
                    (SELECT COUNT(DISTINCT bucket) FROM read_events)",
                [],
                |row| {
                    Ok(StoreStats {
                        read_events: count_from_sql(0, row.get(0)?)?,
                        query_events: count_from_sql(1, row.get(1)?)?,
                        read_queries: count_from_sql(2, row.get(2)?)?,
                        column_accesses: count_from_sql(3, row.get(3)?)?,
                        query_texts: count_from_sql(4, row.get(4)?)?,
                        collision_texts: count_from_sql(5, row.get(5)?)?,
                        buckets: count_from_sql(6, row.get(6)?)?,
                    })
                },
            )
            .context("failed to collect event store stats")
    }

    /// Prepares the per-(bucket, resource) usage query. Rows are produced
    /// lazily by [`UsageStatistics::iter`].
    pub fn usage_statistics(&mut self, top_n: usize) -> Result<UsageStatistics<'_>> {
        self.flush()?;
        let top_n = i64::try_from(top_n).map_err(|_| anyhow!("top_n out of range: {top_n}"))?;
        let stmt = self
            .conn
            .prepare(USAGE_STATISTICS_SQL)
            .context("failed to prepare usage statistics query")?;
        Ok(UsageStatistics { stmt, top_n })
    }

    /// Prepares the read/query pairing query. Rows are produced lazily by
    /// [`CorrelatedEvents::iter`].
    pub fn correlated_events(&mut self) -> Result<CorrelatedEvents<'_>> {
        self.flush()?;
        let stmt = self
            .conn
            .prepare(CORRELATED_EVENTS_SQL)
            .context("failed to prepare correlated events query")?;
        Ok(CorrelatedEvents { stmt })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

pub struct UsageStatistics<'s> {
    stmt: Statement<'s>,
    top_n: i64,
}

impl UsageStatistics<'_> {
    pub fn iter(&mut self) -> Result<impl Iterator<Item = Result<RawUsageStatistic>> + '_> {
        let top_n = self.top_n;
        let rows = self
            .stmt
            .query_map(params![top_n], parse_usage_row)
            .context("failed to run usage statistics query")?;
        Ok(rows.map(|row| row.context("failed to decode usage statistics row")))
    }
}

pub struct CorrelatedEvents<'s> {
    stmt: Statement<'s>,
}

impl CorrelatedEvents<'_> {
    pub fn iter(&mut self) -> Result<impl Iterator<Item = Result<StoredPair>> + '_> {
        let rows = self
            .stmt
            .query_map([], parse_pair_row)
            .context("failed to run correlated events query")?;
        Ok(rows.map(|row| row.context("failed to decode correlated event row")))
    }
}

fn parse_usage_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawUsageStatistic> {
    let bucket_raw: String = row.get(0)?;
    let resource_raw: String = row.get(1)?;
    let query_count: i64 = row.get(2)?;
    let query_freq_raw: Option<String> = row.get(3)?;
    let user_freq_raw: Option<String> = row.get(4)?;
    let column_freq_raw: Option<String> = row.get(5)?;

    let bucket_start =
        parse_rfc3339_utc(&bucket_raw).map_err(|err| invalid_text(0, err.to_string()))?;
    let resource =
        ResourceId::parse(&resource_raw).map_err(|err| invalid_text(1, err.to_string()))?;

    let query_freq = decode_json::<Vec<(String, Option<String>, u64)>>(3, query_freq_raw)?
        .into_iter()
        .map(|(reference, text, count)| QueryFrequency {
            reference,
            text,
            count,
        })
        .collect();

    Ok(RawUsageStatistic {
        bucket_start,
        resource,
        query_count: count_from_sql(2, query_count)?,
        query_freq,
        user_freq: decode_json(4, user_freq_raw)?,
        column_freq: decode_json(5, column_freq_raw)?,
    })
}

fn parse_pair_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredPair> {
    let read_raw: Option<String> = row.get(2)?;
    let query_raw: Option<String> = row.get(3)?;
    let query_text: Option<String> = row.get(4)?;

    let read = read_raw
        .map(|raw| serde_json::from_str::<ReadEvent>(&raw))
        .transpose()
        .map_err(|err| invalid_text(2, format!("invalid read event: {err}")))?;
    let query = query_raw
        .map(|raw| serde_json::from_str::<QueryEvent>(&raw))
        .transpose()
        .map_err(|err| invalid_text(3, format!("invalid query event: {err}")))?;

    Ok(StoredPair {
        read,
        query,
        query_text,
    })
}

fn decode_json<T: DeserializeOwned + Default>(
    index: usize,
    raw: Option<String>,
) -> rusqlite::Result<T> {
    match raw {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|err| invalid_text(index, format!("invalid frequency list: {err}"))),
        None => Ok(T::default()),
    }
}

fn invalid_text(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message,
        )),
    )
}

fn count_from_sql(index: usize, value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid count: {value}"),
            )),
        )
    })
}

fn read_bucket_duration(conn: &Connection) -> Result<Option<BucketDuration>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM store_meta WHERE key = ?1",
            params![META_BUCKET_DURATION],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read store bucket duration")?;
    raw.map(|value| {
        BucketDuration::parse(&value)
            .ok_or_else(|| anyhow!("unknown stored bucket duration: {value}"))
    })
    .transpose()
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use std::collections::BTreeSet;

    use super::*;
    use audit_usage_core::query_hash;
    use proptest::prelude::*;
    use time::OffsetDateTime;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(value) => value,
            None => panic!("expected Some(..)"),
        }
    }

    fn utc(raw: &str) -> OffsetDateTime {
        match parse_rfc3339_utc(raw) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn resource(raw: &str) -> ResourceId {
        match ResourceId::parse(raw) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn small_cache(max: usize, batch: usize) -> StoreConfig {
        StoreConfig {
            cache_max_size: max,
            cache_eviction_batch_size: Some(batch),
            delay_index_creation: true,
        }
    }

    fn fixture_store() -> EventStore {
        must(EventStore::open_in_memory(
            &StoreConfig::default(),
            BucketDuration::Hour,
        ))
    }

    fn fixture_read(table: &str, actor: &str, job: Option<&str>, fields: &[&str]) -> ReadEvent {
        ReadEvent {
            resource: resource(table),
            timestamp: utc("2023-01-01T10:15:00Z"),
            actor_email: actor.to_string(),
            fields_read: fields.iter().map(|field| (*field).to_string()).collect(),
            read_reason: None,
            job_name: job.map(str::to_string),
        }
    }

    fn fixture_query(job: &str, reference: &str) -> QueryEvent {
        QueryEvent {
            job_name: job.to_string(),
            query: reference.to_string(),
            statement_type: "SELECT".to_string(),
            start_time: Some(utc("2023-01-01T10:14:55Z")),
            end_time: utc("2023-01-01T10:15:00Z"),
            actor_email: "a@x.com".to_string(),
            destination_table: None,
            referenced_tables: Vec::new(),
            billed_bytes: None,
            num_affected_rows: None,
            default_dataset: None,
        }
    }

    fn store_text(store: &mut EventStore, text: &str) -> String {
        let reference = query_hash(text);
        must(store.query_texts().set(
            &reference,
            QueryText {
                text: text.to_string(),
                is_collision: false,
            },
        ));
        reference
    }

    fn store_read(store: &mut EventStore, read: ReadEvent) -> String {
        let key = Ulid::new().to_string();
        for field in &read.fields_read {
            must(store.column_accesses().set(
                &Ulid::new().to_string(),
                ColumnAccess {
                    read_key: key.clone(),
                    field: field.clone(),
                },
            ));
        }
        must(store.read_events().set(&key, read));
        key
    }

    fn sql_count(store: &EventStore, table: &str) -> i64 {
        match store
            .connection()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn collect_usage(store: &mut EventStore, top_n: usize) -> Vec<RawUsageStatistic> {
        let mut statistics = must(store.usage_statistics(top_n));
        must(must(statistics.iter()).collect::<Result<Vec<_>>>())
    }

    #[test]
    fn written_values_read_back_equal() {
        let mut store = fixture_store();
        let mut read = fixture_read("p.d.t1", "a@x.com", Some("job1"), &["c1", "c2"]);
        read.read_reason = Some("JOB".to_string());
        let key = store_read(&mut store, read.clone());
        must(store.flush());

        let mut reopened_view = store.read_events();
        assert_eq!(must_some(must(reopened_view.get(&key))), read);
        assert!(must(reopened_view.contains(&key)));
        assert!(!must(reopened_view.contains("missing")));
        assert_eq!(must(reopened_view.get("missing")), None);
    }

    fn full_query() -> QueryEvent {
        QueryEvent {
            job_name: "job1".to_string(),
            query: "ref-a".to_string(),
            statement_type: "INSERT".to_string(),
            start_time: Some(utc("2023-01-01T10:14:55.123456789Z")),
            end_time: utc("2023-01-01T10:15:00.5Z"),
            actor_email: "a@x.com".to_string(),
            destination_table: Some(resource("p.d.t2")),
            referenced_tables: vec![resource("p.d.t1"), resource("p.other.t3")],
            billed_bytes: Some(10_485_760),
            num_affected_rows: Some(42),
            default_dataset: Some("p.d".to_string()),
        }
    }

    #[test]
    fn every_query_and_column_field_reads_back_equal() {
        let query = full_query();
        let access = ColumnAccess {
            read_key: "read-1".to_string(),
            field: "c1".to_string(),
        };

        let mut cached = fixture_store();
        must(cached.query_events().set("job1", query.clone()));
        must(cached.column_accesses().set("access-1", access.clone()));
        assert_eq!(must_some(must(cached.query_events().get("job1"))), query);
        assert_eq!(
            must_some(must(cached.column_accesses().get("access-1"))),
            access
        );

        let mut evicting = must(EventStore::open_in_memory(
            &small_cache(1, 1),
            BucketDuration::Hour,
        ));
        must(evicting.query_events().set("job1", query.clone()));
        must(evicting.query_events().set("job2", fixture_query("job2", "ref-b")));
        must(evicting.column_accesses().set("access-1", access.clone()));
        must(evicting.column_accesses().set(
            "access-2",
            ColumnAccess {
                read_key: "read-2".to_string(),
                field: "c2".to_string(),
            },
        ));
        assert_eq!(sql_count(&evicting, "query_events"), 1);
        assert_eq!(sql_count(&evicting, "column_accesses"), 1);
        assert_eq!(evicting.query_events().cached_len(), 1);

        assert_eq!(must_some(must(evicting.query_events().get("job1"))), query);
        assert_eq!(
            must_some(must(evicting.column_accesses().get("access-1"))),
            access
        );
        let reloaded = must_some(must(evicting.query_events().get("job1")));
        assert_eq!(reloaded.start_time.map(OffsetDateTime::nanosecond), Some(123_456_789));
    }

    #[test]
    fn identical_reads_are_kept_as_distinct_rows() {
        let mut store = fixture_store();
        let read = fixture_read("p.d.t1", "a@x.com", None, &[]);
        let first = store_read(&mut store, read.clone());
        let second = store_read(&mut store, read);
        assert_ne!(first, second);
        assert_eq!(must(store.read_events().len()), 2);
    }

    #[test]
    fn query_events_upsert_by_job_name() {
        let mut store = fixture_store();
        must(store.query_events().set("job1", fixture_query("job1", "ref-a")));
        must(store.flush());
        must(store.query_events().set("job1", fixture_query("job1", "ref-b")));

        let mut queries = store.query_events();
        assert_eq!(must(queries.len()), 1);
        assert_eq!(must_some(must(queries.get("job1"))).query, "ref-b");
    }

    #[test]
    fn eviction_writes_a_whole_batch() {
        let mut store = must(EventStore::open_in_memory(
            &small_cache(4, 3),
            BucketDuration::Hour,
        ));
        for index in 0..5 {
            must(store.query_texts().set(
                &format!("key-{index}"),
                QueryText {
                    text: format!("SELECT {index}"),
                    is_collision: false,
                },
            ));
        }

        assert_eq!(store.query_texts().cached_len(), 2);
        assert_eq!(sql_count(&store, "query_texts"), 3);
        assert_eq!(
            must_some(must(store.query_texts().get("key-0"))).text,
            "SELECT 0"
        );
    }

    #[test]
    fn eviction_targets_least_recently_used() {
        let mut store = must(EventStore::open_in_memory(
            &small_cache(2, 1),
            BucketDuration::Hour,
        ));
        let text = |value: &str| QueryText {
            text: value.to_string(),
            is_collision: false,
        };
        must(store.query_texts().set("a", text("A")));
        must(store.query_texts().set("b", text("B")));
        let _ = must(store.query_texts().get("a"));
        must(store.query_texts().set("c", text("C")));

        let persisted: Option<String> = match store
            .connection()
            .query_row("SELECT key FROM query_texts", [], |row| row.get(0))
            .optional()
        {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(persisted.as_deref(), Some("b"));
    }

    #[test]
    fn delayed_indexes_are_created_on_demand() {
        let mut store = fixture_store();
        let index_count = |store: &EventStore| -> i64 {
            match store.connection().query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_%'",
                [],
                |row| row.get(0),
            ) {
                Ok(value) => value,
                Err(err) => panic!("test failure: {err}"),
            }
        };
        assert_eq!(index_count(&store), 0);
        must(store.create_indexes());
        must(store.create_indexes());
        assert_eq!(index_count(&store), 5);

        let eager = must(EventStore::open_in_memory(
            &StoreConfig {
                delay_index_creation: false,
                ..StoreConfig::default()
            },
            BucketDuration::Day,
        ));
        assert_eq!(index_count(&eager), 5);
    }

    #[test]
    fn usage_statistics_group_by_bucket_and_resource() {
        let mut store = fixture_store();
        let reference = store_text(&mut store, "SELECT c1 FROM t1");
        must(store.query_events().set("job1", fixture_query("job1", &reference)));
        store_read(
            &mut store,
            fixture_read("proj.ds.t1", "a@x.com", Some("job1"), &["c1"]),
        );
        // Not tied to a completed query: contributes to user/column frequency only.
        store_read(
            &mut store,
            fixture_read("proj.ds.t1", "b@x.com", Some("job-missing"), &["c2"]),
        );

        let statistics = collect_usage(&mut store, 10);
        assert_eq!(statistics.len(), 1);
        let statistic = &statistics[0];
        assert_eq!(statistic.bucket_start, utc("2023-01-01T10:00:00Z"));
        assert_eq!(statistic.resource.as_str(), "proj.ds.t1");
        assert_eq!(statistic.query_count, 1);
        assert_eq!(
            statistic.query_freq,
            vec![QueryFrequency {
                reference,
                text: Some("SELECT c1 FROM t1".to_string()),
                count: 1,
            }]
        );
        assert_eq!(
            statistic.user_freq,
            vec![("a@x.com".to_string(), 1), ("b@x.com".to_string(), 1)]
        );
        assert_eq!(
            statistic.column_freq,
            vec![("c1".to_string(), 1), ("c2".to_string(), 1)]
        );
    }

    #[test]
    fn top_n_keeps_highest_counts_with_text_tie_break() {
        let mut store = fixture_store();
        let plan = [("SELECT b", 5), ("SELECT a", 5), ("SELECT c", 3)];
        for (text, count) in plan {
            let reference = store_text(&mut store, text);
            for index in 0..count {
                let job = format!("{text}-{index}");
                must(store.query_events().set(&job, fixture_query(&job, &reference)));
                store_read(
                    &mut store,
                    fixture_read("p.d.t1", "a@x.com", Some(&job), &[]),
                );
            }
        }

        let statistics = collect_usage(&mut store, 2);
        assert_eq!(statistics.len(), 1);
        let freq = statistics[0]
            .query_freq
            .iter()
            .map(|entry| (entry.text.clone().unwrap_or_default(), entry.count))
            .collect::<Vec<_>>();
        assert_eq!(
            freq,
            vec![("SELECT a".to_string(), 5), ("SELECT b".to_string(), 5)]
        );
        assert_eq!(statistics[0].query_count, 13);

        let disabled = collect_usage(&mut store, 0);
        assert!(disabled[0].query_freq.is_empty());
        assert_eq!(disabled[0].query_count, 13);
    }

    #[test]
    fn usage_statistics_are_deterministic() {
        let mut store = fixture_store();
        for (index, actor) in ["c@x.com", "a@x.com", "b@x.com", "a@x.com"].iter().enumerate() {
            let job = format!("job{index}");
            let reference = store_text(&mut store, &format!("SELECT {}", index % 2));
            must(store.query_events().set(&job, fixture_query(&job, &reference)));
            store_read(
                &mut store,
                fixture_read("p.d.t1", actor, Some(&job), &["z", "y", "x"]),
            );
        }

        let first = collect_usage(&mut store, 10);
        let second = collect_usage(&mut store, 10);
        assert_eq!(first, second);
        assert_eq!(
            first[0].user_freq,
            vec![
                ("a@x.com".to_string(), 2),
                ("b@x.com".to_string(), 1),
                ("c@x.com".to_string(), 1)
            ]
        );
        assert_eq!(
            first[0].column_freq,
            vec![
                ("x".to_string(), 4),
                ("y".to_string(), 4),
                ("z".to_string(), 4)
            ]
        );
    }

    #[test]
    fn unresolved_reference_surfaces_without_text() {
        let mut store = fixture_store();
        must(store.query_events().set("job1", fixture_query("job1", "dangling")));
        store_read(
            &mut store,
            fixture_read("p.d.t1", "a@x.com", Some("job1"), &[]),
        );

        let statistics = collect_usage(&mut store, 5);
        assert_eq!(statistics[0].query_freq[0].reference, "dangling");
        assert_eq!(statistics[0].query_freq[0].text, None);
    }

    #[test]
    fn correlated_events_pair_reads_and_orphan_queries() {
        let mut store = fixture_store();
        let reference = store_text(&mut store, "SELECT 1");
        must(store.query_events().set("job1", fixture_query("job1", &reference)));
        must(store.query_events().set("job2", fixture_query("job2", &reference)));
        store_read(&mut store, fixture_read("p.d.t1", "a@x.com", Some("job1"), &[]));
        store_read(&mut store, fixture_read("p.d.t2", "a@x.com", None, &[]));

        let mut pairs = must(store.correlated_events());
        let rows = must(must(pairs.iter()).collect::<Result<Vec<_>>>());
        assert_eq!(rows.len(), 3);

        assert_eq!(
            rows[0].query.as_ref().map(|query| query.job_name.as_str()),
            Some("job1")
        );
        assert_eq!(rows[0].query_text.as_deref(), Some("SELECT 1"));
        assert!(rows[1].read.is_some() && rows[1].query.is_none());
        assert!(rows[2].read.is_none());
        assert_eq!(
            rows[2].query.as_ref().map(|query| query.job_name.as_str()),
            Some("job2")
        );
    }

    #[test]
    fn stats_count_rows_collisions_and_buckets() {
        let mut store = fixture_store();
        let reference = store_text(&mut store, "SELECT 1");
        must(store.query_texts().set(
            "surrogate",
            QueryText {
                text: "SELECT 2".to_string(),
                is_collision: true,
            },
        ));
        must(store.query_events().set("job1", fixture_query("job1", &reference)));
        store_read(&mut store, fixture_read("p.d.t1", "a@x.com", Some("job1"), &["c1"]));
        let mut later = fixture_read("p.d.t1", "a@x.com", None, &[]);
        later.timestamp = utc("2023-01-01T11:30:00Z");
        store_read(&mut store, later);

        let stats = must(store.stats());
        assert_eq!(
            stats,
            StoreStats {
                read_events: 2,
                query_events: 1,
                read_queries: 1,
                column_accesses: 1,
                query_texts: 2,
                collision_texts: 1,
                buckets: 2,
            }
        );
    }

    #[test]
    fn close_makes_writes_durable_and_read_only_open_sees_them() {
        let dir = must(tempfile::tempdir().context("tempdir"));
        let path = dir.path().join("kept.sqlite");
        let mut store = must(EventStore::open(
            &path,
            &StoreConfig::default(),
            BucketDuration::Day,
        ));
        store_read(&mut store, fixture_read("p.d.t1", "a@x.com", None, &["c1"]));
        must(store.close());

        let mut reopened = must(EventStore::open_read_only(&path));
        let stats = must(reopened.stats());
        assert_eq!(stats.read_events, 1);
        assert_eq!(stats.column_accesses, 1);
    }

    #[test]
    fn bucket_duration_is_recorded_and_checked_on_reopen() {
        let dir = must(tempfile::tempdir().context("tempdir"));
        let path = dir.path().join("hourly.sqlite");
        let store = must(EventStore::open(
            &path,
            &StoreConfig::default(),
            BucketDuration::Hour,
        ));
        must(store.close());

        let reopened = must(EventStore::open_read_only(&path));
        assert_eq!(reopened.bucket_duration(), BucketDuration::Hour);
        must(reopened.close());

        assert!(EventStore::open(&path, &StoreConfig::default(), BucketDuration::Day).is_err());
        let same = must(EventStore::open(
            &path,
            &StoreConfig::default(),
            BucketDuration::Hour,
        ));
        must(same.close());
    }

    #[test]
    fn ephemeral_store_directory_is_removed_after_close() {
        let store = must(EventStore::open_ephemeral(
            &StoreConfig::default(),
            BucketDuration::Day,
        ));
        let dir = match &store.temp_dir {
            Some(dir) => dir.path().to_path_buf(),
            None => panic!("ephemeral store without a directory"),
        };
        assert!(dir.exists());
        must(store.close());
        assert!(!dir.exists());
    }

    #[test]
    fn for_each_visits_rows_in_insertion_order() {
        let mut store = fixture_store();
        for key in ["k1", "k2", "k3"] {
            must(store.query_events().set(key, fixture_query(key, "ref")));
        }
        let mut seen = Vec::new();
        must(store.query_events().for_each(|key, value| {
            assert_eq!(key, value.job_name);
            seen.push(key.to_string());
            Ok(())
        }));
        assert_eq!(seen, vec!["k1", "k2", "k3"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_eviction_never_loses_writes(
            writes in prop::collection::vec((0u8..12, any::<u16>()), 1..120),
            max in 1usize..6,
        ) {
            let batch = (max * 9 / 10).max(1);
            let mut store = must(EventStore::open_in_memory(&small_cache(max, batch), BucketDuration::Hour));
            let mut expected = BTreeMap::new();
            for (key, value) in &writes {
                let key = format!("k{key}");
                let text = QueryText { text: value.to_string(), is_collision: false };
                must(store.query_texts().set(&key, text.clone()));
                expected.insert(key, text);
                prop_assert!(store.query_texts().cached_len() <= max);
            }

            let mut texts = store.query_texts();
            prop_assert_eq!(must(texts.len()), expected.len() as u64);
            for (key, text) in &expected {
                let got = must(texts.get(key));
                prop_assert_eq!(got.as_ref(), Some(text));
            }
        }

        #[test]
        fn prop_distinct_reads_are_all_retained(count in 1usize..40) {
            let mut store = must(EventStore::open_in_memory(&small_cache(3, 2), BucketDuration::Day));
            let mut keys = BTreeSet::new();
            for _ in 0..count {
                keys.insert(store_read(&mut store, fixture_read("p.d.t1", "a@x.com", None, &[])));
            }
            prop_assert_eq!(keys.len(), count);
            prop_assert_eq!(must(store.read_events().len()), count as u64);
        }
    }
}
