use std::io::Write;

use anyhow::{Context, Result};
use audit_usage_core::{OperationRecord, UsageRecord};
use serde::Serialize;

/// Downstream consumer of derived records.
pub trait UsageSink {
    fn emit_usage(&mut self, record: &UsageRecord) -> Result<()>;
    fn emit_operation(&mut self, record: &OperationRecord) -> Result<()>;
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum OutputLine<'a> {
    Usage(&'a UsageRecord),
    Operation(&'a OperationRecord),
}

/// Writes each record as one JSON object per line.
pub struct JsonLinesSink<W: Write> {
    writer: W,
    written: u64,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("failed to flush record output")
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_line(&mut self, line: &OutputLine<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.writer, line).context("failed to serialize record")?;
        self.writer
            .write_all(b"\n")
            .context("failed to write record output")?;
        self.written += 1;
        Ok(())
    }
}

impl<W: Write> UsageSink for JsonLinesSink<W> {
    fn emit_usage(&mut self, record: &UsageRecord) -> Result<()> {
        self.write_line(&OutputLine::Usage(record))
    }

    fn emit_operation(&mut self, record: &OperationRecord) -> Result<()> {
        self.write_line(&OutputLine::Operation(record))
    }
}

/// Keeps every record in memory.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    pub usage: Vec<UsageRecord>,
    pub operations: Vec<OperationRecord>,
}

impl UsageSink for CollectingSink {
    fn emit_usage(&mut self, record: &UsageRecord) -> Result<()> {
        self.usage.push(record.clone());
        Ok(())
    }

    fn emit_operation(&mut self, record: &OperationRecord) -> Result<()> {
        self.operations.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audit_usage_core::{
        parse_rfc3339_utc, BucketDuration, OperationCategory, ResourceId, WriteOperation,
    };

    fn resource(raw: &str) -> ResourceId {
        match ResourceId::parse(raw) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn json_lines_tag_each_record_kind() {
        let mut sink = JsonLinesSink::new(Vec::new());
        let usage = UsageRecord {
            bucket_start: match parse_rfc3339_utc("2023-01-01T10:00:00Z") {
                Ok(value) => value,
                Err(err) => panic!("test failure: {err}"),
            },
            bucket_duration: BucketDuration::Hour,
            resource: resource("p.d.t1"),
            query_count: 1,
            query_freq: vec![("SELECT 1".to_string(), 1)],
            user_freq: vec![("a@x.com".to_string(), 1)],
            column_freq: Vec::new(),
        };
        let operation = OperationRecord {
            destination: resource("p.d.t2"),
            reported_at_millis: 2,
            last_updated_millis: 1,
            actor_email: "a@x.com".to_string(),
            category: OperationCategory::Write(WriteOperation::Insert),
            affected_resources: vec![resource("p.d.t1")],
            num_affected_rows: None,
            custom_properties: None,
        };

        if let Err(err) = sink.emit_usage(&usage) {
            panic!("test failure: {err}");
        }
        if let Err(err) = sink.emit_operation(&operation) {
            panic!("test failure: {err}");
        }
        assert_eq!(sink.written(), 2);

        let output = match String::from_utf8(sink.into_inner()) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        let lines = output
            .lines()
            .map(|line| match serde_json::from_str::<serde_json::Value>(line) {
                Ok(value) => value,
                Err(err) => panic!("test failure: {err}"),
            })
            .collect::<Vec<_>>();
        assert_eq!(lines[0]["kind"], "usage");
        assert_eq!(lines[0]["bucket_start"], "2023-01-01T10:00:00Z");
        assert_eq!(lines[0]["query_freq"][0][0], "SELECT 1");
        assert_eq!(lines[1]["kind"], "operation");
        assert_eq!(lines[1]["category"]["category"], "write");
        assert_eq!(lines[1]["category"]["statement_type"], "INSERT");
    }
}
