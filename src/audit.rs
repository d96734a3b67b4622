//! Audit records for calculations and resolutions.
//!
//! The engine writes one [`AuditEntry`] per service operation and never
//! reads them back. Sinks may fail; callers log the failure and carry on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::info;

use crate::models::AppliedChange;

/// Operation being audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Calculate,
    Apply,
    Resolve,
    BulkResolve,
    Preview,
    IntegrityCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Success,
    Failure,
    Partial,
}

/// Timing and size of an audited operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceData {
    pub duration_ms: f64,
    /// Tasks, conflicts or changes processed, depending on the operation.
    pub entity_count: usize,
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub operation: AuditOperation,
    pub outcome: AuditOutcome,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub performance: PerformanceData,
    #[serde(default)]
    pub changes: Vec<AppliedChange>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(operation: AuditOperation, outcome: AuditOutcome) -> Self {
        Self {
            operation,
            outcome,
            project_id: None,
            metadata: BTreeMap::new(),
            performance: PerformanceData::default(),
            changes: Vec::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_performance(mut self, duration_ms: f64, entity_count: usize) -> Self {
        self.performance = PerformanceData {
            duration_ms,
            entity_count,
        };
        self
    }

    pub fn with_changes(mut self, changes: Vec<AppliedChange>) -> Self {
        self.changes = changes;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination for audit records.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError>;
}

/// Emits each record as an `info` event on target `gantt_schedule::audit`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let metadata = serde_json::to_string(&entry.metadata)
            .map_err(|e| AuditError::Unavailable(e.to_string()))?;
        info!(
            target: "gantt_schedule::audit",
            operation = ?entry.operation,
            outcome = ?entry.outcome,
            project_id = entry.project_id.as_deref().unwrap_or(""),
            duration_ms = entry.performance.duration_ms,
            entity_count = entry.performance.entity_count,
            changes = entry.changes.len(),
            %metadata,
            "audit"
        );
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records so far, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        self.entries
            .lock()
            .map_err(|e| AuditError::Unavailable(e.to_string()))?
            .push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_wire_names() {
        assert_eq!(
            serde_json::to_value(AuditOperation::BulkResolve).unwrap(),
            json!("bulk_resolve")
        );
        assert_eq!(
            serde_json::to_value(AuditOperation::IntegrityCheck).unwrap(),
            json!("integrity_check")
        );
        assert_eq!(
            serde_json::to_value(AuditOutcome::Partial).unwrap(),
            json!("PARTIAL")
        );
    }

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemoryAuditSink::new();
        sink.record(&AuditEntry::new(AuditOperation::Calculate, AuditOutcome::Success))
            .unwrap();
        sink.record(
            &AuditEntry::new(AuditOperation::Resolve, AuditOutcome::Failure)
                .with_project("P1")
                .with_metadata("strategy", json!("MERGE"))
                .with_performance(1.5, 2),
        )
        .unwrap();

        let entries = sink.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].operation, AuditOperation::Resolve);
        assert_eq!(entries[1].metadata["strategy"], json!("MERGE"));
        assert_eq!(entries[1].performance.entity_count, 2);
    }

    #[test]
    fn test_tracing_sink_accepts_records() {
        let entry = AuditEntry::new(AuditOperation::Apply, AuditOutcome::Success).with_project("P1");
        assert!(TracingAuditSink.record(&entry).is_ok());
    }
}
