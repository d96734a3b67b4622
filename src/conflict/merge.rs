//! Field-level merge rules for the MERGE strategy.
//!
//! | Field | Rules | Default |
//! |-------|-------|---------|
//! | `startDate` | EARLIEST, LATEST, AVERAGE, MANUAL | EARLIEST |
//! | `endDate` | EARLIEST, LATEST, AVERAGE, MANUAL | LATEST |
//! | `progress` | MAX, MIN, AVERAGE | MAX |
//! | `assigneeId` / `assigneeIds` | MERGE, CURRENT, INCOMING | MERGE |
//! | anything else | CURRENT, INCOMING | INCOMING |
//!
//! MERGE on assignees is a set union for list values. A single-valued
//! assignee keeps whichever side is set, falling back to the default
//! preference when both are set and differ.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How to combine two dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DateMergeRule {
    Earliest,
    Latest,
    /// Midpoint of the two dates.
    Average,
    /// Caller must supply the value.
    Manual,
}

/// How to combine two progress values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressMergeRule {
    Max,
    Min,
    /// Rounded mean.
    Average,
}

/// How to combine assignees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssigneeMergeRule {
    /// Set union.
    Merge,
    Current,
    Incoming,
}

/// Which side wins for fields without a dedicated rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergePreference {
    Current,
    Incoming,
}

/// Per-field merge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MergeRules {
    pub start_date: DateMergeRule,
    pub end_date: DateMergeRule,
    pub progress: ProgressMergeRule,
    pub assignee: AssigneeMergeRule,
    pub default_preference: MergePreference,
}

impl Default for MergeRules {
    fn default() -> Self {
        Self {
            start_date: DateMergeRule::Earliest,
            end_date: DateMergeRule::Latest,
            progress: ProgressMergeRule::Max,
            assignee: AssigneeMergeRule::Merge,
            default_preference: MergePreference::Incoming,
        }
    }
}

/// A field that could not be merged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("field '{0}' requires a manual value")]
    ManualValueRequired(String),
    #[error("field '{field}' has an unmergeable value: {value}")]
    InvalidValue { field: String, value: String },
}

impl MergeRules {
    pub fn with_dates(mut self, start: DateMergeRule, end: DateMergeRule) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    pub fn with_progress(mut self, rule: ProgressMergeRule) -> Self {
        self.progress = rule;
        self
    }

    pub fn with_assignee(mut self, rule: AssigneeMergeRule) -> Self {
        self.assignee = rule;
        self
    }

    pub fn with_default_preference(mut self, preference: MergePreference) -> Self {
        self.default_preference = preference;
        self
    }

    /// Merges one field. `manual` is only consulted by MANUAL date rules.
    ///
    /// A side that is `null` or missing yields the other side unchanged.
    pub fn merge_field(
        &self,
        field: &str,
        current: &Value,
        incoming: &Value,
        manual: Option<&Value>,
    ) -> Result<Value, MergeError> {
        if current == incoming {
            return Ok(current.clone());
        }
        match field {
            "startDate" => merge_dates(field, self.start_date, current, incoming, manual),
            "endDate" => merge_dates(field, self.end_date, current, incoming, manual),
            _ if current.is_null() => Ok(incoming.clone()),
            _ if incoming.is_null() => Ok(current.clone()),
            "progress" => merge_progress(field, self.progress, current, incoming),
            "assigneeId" | "assigneeIds" | "assignees" => Ok(self.merge_assignees(current, incoming)),
            _ => Ok(self.prefer(current, incoming)),
        }
    }

    fn prefer(&self, current: &Value, incoming: &Value) -> Value {
        match self.default_preference {
            MergePreference::Current => current.clone(),
            MergePreference::Incoming => incoming.clone(),
        }
    }

    fn merge_assignees(&self, current: &Value, incoming: &Value) -> Value {
        match self.assignee {
            AssigneeMergeRule::Current => current.clone(),
            AssigneeMergeRule::Incoming => incoming.clone(),
            AssigneeMergeRule::Merge => match (current, incoming) {
                (Value::Array(a), Value::Array(b)) => {
                    let mut union = a.clone();
                    for v in b {
                        if !union.contains(v) {
                            union.push(v.clone());
                        }
                    }
                    Value::Array(union)
                }
                _ => self.prefer(current, incoming),
            },
        }
    }
}

fn merge_dates(
    field: &str,
    rule: DateMergeRule,
    current: &Value,
    incoming: &Value,
    manual: Option<&Value>,
) -> Result<Value, MergeError> {
    let pick: fn(DateTime<Utc>, DateTime<Utc>) -> DateTime<Utc> = match rule {
        DateMergeRule::Manual => {
            return manual
                .cloned()
                .ok_or_else(|| MergeError::ManualValueRequired(field.to_string()));
        }
        DateMergeRule::Earliest => |a, b| a.min(b),
        DateMergeRule::Latest => |a, b| a.max(b),
        DateMergeRule::Average => |a, b| a + (b - a) / 2,
    };
    if current.is_null() {
        return Ok(incoming.clone());
    }
    if incoming.is_null() {
        return Ok(current.clone());
    }
    let merged = pick(parse_date(field, current)?, parse_date(field, incoming)?);
    serde_json::to_value(merged).map_err(|e| MergeError::InvalidValue {
        field: field.to_string(),
        value: e.to_string(),
    })
}

fn parse_date(field: &str, value: &Value) -> Result<DateTime<Utc>, MergeError> {
    serde_json::from_value(value.clone()).map_err(|_| MergeError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    })
}

fn merge_progress(
    field: &str,
    rule: ProgressMergeRule,
    current: &Value,
    incoming: &Value,
) -> Result<Value, MergeError> {
    let number = |v: &Value| {
        v.as_f64().ok_or_else(|| MergeError::InvalidValue {
            field: field.to_string(),
            value: v.to_string(),
        })
    };
    let (a, b) = (number(current)?, number(incoming)?);
    let merged = match rule {
        ProgressMergeRule::Max => a.max(b),
        ProgressMergeRule::Min => a.min(b),
        ProgressMergeRule::Average => ((a + b) / 2.0).round(),
    };
    Ok(Value::from(merged.clamp(0.0, 100.0) as u64))
}
