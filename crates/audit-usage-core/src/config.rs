use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{BucketDuration, UsageError};

pub const DEFAULT_MAX_QUERY_LENGTH: usize = 24_000;
pub const DEFAULT_TOP_N_QUERIES: usize = 10;
pub const DEFAULT_CACHE_MAX_SIZE: usize = 2_000;

fn default_max_query_length() -> usize {
    DEFAULT_MAX_QUERY_LENGTH
}

fn default_top_n_queries() -> usize {
    DEFAULT_TOP_N_QUERIES
}

fn default_cache_max_size() -> usize {
    DEFAULT_CACHE_MAX_SIZE
}

fn default_true() -> bool {
    true
}

fn default_temp_prefixes() -> Vec<String> {
    vec!["_".to_string()]
}

fn default_allow() -> Vec<String> {
    vec![".*".to_string()]
}

/// Settings for one usage extraction run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UsageConfig {
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_time: OffsetDateTime,
    #[serde(default)]
    pub bucket_duration: BucketDuration,
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,
    #[serde(default = "default_top_n_queries")]
    pub top_n_queries: usize,
    #[serde(default = "default_true")]
    pub include_top_n_queries: bool,
    #[serde(default = "default_true")]
    pub include_operational_stats: bool,
    #[serde(default)]
    pub include_read_operational_stats: bool,
    #[serde(default = "default_temp_prefixes")]
    pub temp_table_dataset_prefixes: Vec<String>,
    #[serde(default)]
    pub resource_pattern: AllowDenyPattern,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
}

impl UsageConfig {
    /// A configuration with every optional setting at its default.
    #[must_use]
    pub fn new(start_time: OffsetDateTime, end_time: OffsetDateTime) -> Self {
        Self {
            start_time,
            end_time,
            bucket_duration: BucketDuration::default(),
            max_query_length: DEFAULT_MAX_QUERY_LENGTH,
            top_n_queries: DEFAULT_TOP_N_QUERIES,
            include_top_n_queries: true,
            include_operational_stats: true,
            include_read_operational_stats: false,
            temp_table_dataset_prefixes: default_temp_prefixes(),
            resource_pattern: AllowDenyPattern::default(),
            store: StoreConfig::default(),
            rate_limit: None,
        }
    }

    /// Parses a JSON config document and validates it.
    ///
    /// # Errors
    /// Returns [`UsageError::Configuration`] for unknown fields, bad types or
    /// values that fail [`UsageConfig::validate`].
    pub fn from_json(raw: &str) -> Result<Self, UsageError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| UsageError::Configuration(format!("invalid config document: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`UsageError::Configuration`] describing the first invalid setting.
    pub fn validate(&self) -> Result<(), UsageError> {
        if self.start_time >= self.end_time {
            return Err(UsageError::Configuration(
                "start_time MUST be before end_time".to_string(),
            ));
        }
        if self.max_query_length == 0 {
            return Err(UsageError::Configuration(
                "max_query_length MUST be at least 1".to_string(),
            ));
        }
        if self.temp_table_dataset_prefixes.iter().any(String::is_empty) {
            return Err(UsageError::Configuration(
                "temp_table_dataset_prefixes MUST NOT contain empty prefixes".to_string(),
            ));
        }
        self.resource_pattern.compile()?;
        self.store.validate()?;
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        Ok(())
    }

    /// Number of top queries to keep per statistic; zero when disabled.
    #[must_use]
    pub fn effective_top_n(&self) -> usize {
        if self.include_top_n_queries {
            self.top_n_queries
        } else {
            0
        }
    }

    /// Half-open `[start_time, end_time)` window check.
    #[must_use]
    pub fn in_window(&self, timestamp: OffsetDateTime) -> bool {
        timestamp >= self.start_time && timestamp < self.end_time
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default = "default_cache_max_size")]
    pub cache_max_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_eviction_batch_size: Option<usize>,
    #[serde(default = "default_true")]
    pub delay_index_creation: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_max_size: DEFAULT_CACHE_MAX_SIZE,
            cache_eviction_batch_size: None,
            delay_index_creation: true,
        }
    }
}

impl StoreConfig {
    /// Configured batch size, or 90% of the cache bound (at least one).
    #[must_use]
    pub fn eviction_batch_size(&self) -> usize {
        self.cache_eviction_batch_size
            .unwrap_or_else(|| (self.cache_max_size * 9 / 10).max(1))
    }

    /// # Errors
    /// Returns [`UsageError::Configuration`] for a zero cache or a batch size
    /// outside `1..=cache_max_size`.
    pub fn validate(&self) -> Result<(), UsageError> {
        if self.cache_max_size == 0 {
            return Err(UsageError::Configuration(
                "store.cache_max_size MUST be at least 1".to_string(),
            ));
        }
        let batch = self.eviction_batch_size();
        if batch == 0 || batch > self.cache_max_size {
            return Err(UsageError::Configuration(format!(
                "store.cache_eviction_batch_size MUST be in 1..={}",
                self.cache_max_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    pub max_calls: u32,
    pub period_secs: u64,
}

impl RateLimitConfig {
    #[must_use]
    pub fn period(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.period_secs)
    }

    /// # Errors
    /// Returns [`UsageError::Configuration`] when either bound is zero.
    pub fn validate(&self) -> Result<(), UsageError> {
        if self.max_calls == 0 || self.period_secs == 0 {
            return Err(UsageError::Configuration(
                "rate_limit.max_calls and rate_limit.period_secs MUST be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Regex allow/deny lists as written in config. Call [`AllowDenyPattern::compile`]
/// to get a matcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AllowDenyPattern {
    #[serde(default = "default_allow")]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default = "default_true")]
    pub ignore_case: bool,
}

impl Default for AllowDenyPattern {
    fn default() -> Self {
        Self {
            allow: default_allow(),
            deny: Vec::new(),
            ignore_case: true,
        }
    }
}

impl AllowDenyPattern {
    #[must_use]
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns [`UsageError::Configuration`] naming the first pattern that is
    /// not a valid regex.
    pub fn compile(&self) -> Result<ResourceFilter, UsageError> {
        let build = |patterns: &[String]| {
            patterns
                .iter()
                .map(|pattern| {
                    RegexBuilder::new(&format!("^(?:{pattern})$"))
                        .case_insensitive(self.ignore_case)
                        .build()
                        .map_err(|err| {
                            UsageError::Configuration(format!(
                                "invalid resource pattern {pattern:?}: {err}"
                            ))
                        })
                })
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(ResourceFilter {
            allow: build(&self.allow)?,
            deny: build(&self.deny)?,
        })
    }
}

/// Compiled allow/deny matcher. A value passes when it fully matches some
/// allow pattern and no deny pattern.
#[derive(Debug, Clone)]
pub struct ResourceFilter {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
}

impl ResourceFilter {
    #[must_use]
    pub fn allowed(&self, value: &str) -> bool {
        self.allow.iter().any(|pattern| pattern.is_match(value))
            && !self.deny.iter().any(|pattern| pattern.is_match(value))
    }
}
