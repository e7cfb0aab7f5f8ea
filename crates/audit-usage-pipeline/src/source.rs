use std::collections::VecDeque;
use std::io::BufRead;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use audit_usage_core::{AuditEvent, EventError, KnownResources, RateLimitConfig, ResourceId};
use tracing::debug;

/// Pull-based event stream. `next()` is where a source may block: on I/O,
/// on a remote page fetch, or on a rate limit.
pub trait EventSource: Iterator<Item = Result<AuditEvent, EventError>> {}

impl<T> EventSource for T where T: Iterator<Item = Result<AuditEvent, EventError>> {}

/// Reads one canonical JSON event per line. Blank lines are skipped; a line
/// that is not UTF-8 or not a valid event is reported and reading continues.
pub struct JsonLinesSource<R> {
    reader: R,
    line: usize,
    finished: bool,
}

impl<R: BufRead> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: 0,
            finished: false,
        }
    }
}

impl<R: BufRead> Iterator for JsonLinesSource<R> {
    type Item = Result<AuditEvent, EventError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match self.reader.read_until(b'\n', &mut buffer) {
                Ok(0) => {
                    self.finished = true;
                    return None;
                }
                Ok(_) => {
                    self.line += 1;
                    let text = match std::str::from_utf8(&buffer) {
                        Ok(text) => text.trim(),
                        Err(err) => {
                            return Some(Err(EventError::Parse {
                                line: self.line,
                                message: format!("line is not valid UTF-8: {err}"),
                            }));
                        }
                    };
                    if text.is_empty() {
                        continue;
                    }
                    return Some(serde_json::from_str(text).map_err(|err| {
                        EventError::Parse {
                            line: self.line,
                            message: err.to_string(),
                        }
                    }));
                }
                Err(err) => {
                    self.finished = true;
                    return Some(Err(EventError::Source(format!(
                        "read failed after line {}: {err}",
                        self.line
                    ))));
                }
            }
        }
    }
}

/// Allows at most `max_calls` acquisitions per rolling `period`.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_calls: usize,
    period: Duration,
    calls: VecDeque<Instant>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(max_calls: u32, period: Duration) -> Self {
        let max_calls = usize::try_from(max_calls).unwrap_or(usize::MAX).max(1);
        Self {
            max_calls,
            period,
            calls: VecDeque::with_capacity(max_calls.min(1_024)),
        }
    }

    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_calls, config.period())
    }

    /// How long a call made at `now` would have to wait.
    pub fn wait_time(&mut self, now: Instant) -> Duration {
        while let Some(oldest) = self.calls.front() {
            if now.saturating_duration_since(*oldest) >= self.period {
                self.calls.pop_front();
            } else {
                break;
            }
        }
        if self.calls.len() < self.max_calls {
            return Duration::ZERO;
        }
        self.calls.front().map_or(Duration::ZERO, |oldest| {
            self.period
                .saturating_sub(now.saturating_duration_since(*oldest))
        })
    }

    /// Blocks until a call is allowed, records it, and returns the time spent
    /// waiting.
    pub fn acquire(&mut self) -> Duration {
        let started = Instant::now();
        loop {
            let now = Instant::now();
            let wait = self.wait_time(now);
            if wait.is_zero() {
                self.calls.push_back(now);
                return now.saturating_duration_since(started);
            }
            thread::sleep(wait);
        }
    }
}

/// Applies a [`RateLimiter`] to every fetch from the wrapped source.
pub struct RateLimited<I> {
    inner: I,
    limiter: RateLimiter,
}

impl<I> RateLimited<I> {
    pub fn new(inner: I, limiter: RateLimiter) -> Self {
        Self { inner, limiter }
    }
}

impl<I: Iterator> Iterator for RateLimited<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        let waited = self.limiter.acquire();
        if !waited.is_zero() {
            debug!(waited_ms = waited.as_millis(), "rate limited event fetch");
        }
        self.inner.next()
    }
}

/// Reads the crawl's table list: one `project.dataset.table` per line, `#`
/// comments and blank lines ignored.
pub fn load_known_resources<R: BufRead>(reader: R) -> Result<KnownResources> {
    let mut resources = KnownResources::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read known resources line {}", index + 1))?;
        let entry = line.split('#').next().unwrap_or_default().trim();
        if entry.is_empty() {
            continue;
        }
        let resource = ResourceId::parse(entry)
            .map_err(|err| anyhow!("known resources line {}: {err}", index + 1))?;
        resources.insert(resource);
    }
    Ok(resources)
}
