//! Engine-wide defaults.
//!
//! Every section deserializes with defaults for missing fields, so a JSON
//! document only needs the values it overrides:
//!
//! ```
//! use gantt_schedule::config::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{"cascade": {"maxAffectedTasks": 20}}"#).unwrap();
//! assert_eq!(config.cascade.max_affected_tasks, 20);
//! assert_eq!(config.cascade.max_cascade_depth, 10);
//! ```

use serde::{Deserialize, Serialize};

use crate::cascade::CascadeConfig;
use crate::conflict::{MergeRules, ResolutionOptions};
use crate::models::{CalendarError, WorkingHoursConfig};
use crate::scheduler::SchedulingOptions;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid engine configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Calendar(#[from] CalendarError),
}

/// Defaults used by [`SchedulingService`](crate::service::SchedulingService).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub scheduling: SchedulingOptions,
    pub cascade: CascadeConfig,
    pub merge_rules: MergeRules,
    pub resolution: ResolutionOptions,
    /// Calendar for projects whose calendar source has none.
    pub calendar: WorkingHoursConfig,
}

impl EngineConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.calendar.build()?;
        Ok(config)
    }

    pub fn with_scheduling(mut self, options: SchedulingOptions) -> Self {
        self.scheduling = options;
        self
    }

    pub fn with_cascade(mut self, cascade: CascadeConfig) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn with_merge_rules(mut self, rules: MergeRules) -> Self {
        self.merge_rules = rules;
        self
    }

    pub fn with_resolution(mut self, options: ResolutionOptions) -> Self {
        self.resolution = options;
        self
    }

    pub fn with_calendar(mut self, calendar: WorkingHoursConfig) -> Self {
        self.calendar = calendar;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ProgressMergeRule;
    use crate::scheduler::DurationSource;

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(EngineConfig::from_json_str("{}").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_partial_overrides() {
        let config = EngineConfig::from_json_str(
            r#"{
                "scheduling": {"durationSource": "ESTIMATED_HOURS"},
                "mergeRules": {"progress": "MIN"},
                "resolution": {"createBackup": true},
                "calendar": {"hoursPerDay": 10, "dayStartHour": 8}
            }"#,
        )
        .unwrap();
        assert_eq!(config.scheduling.duration_source, DurationSource::EstimatedHours);
        assert_eq!(config.merge_rules.progress, ProgressMergeRule::Min);
        assert!(config.resolution.create_backup);
        assert!(config.resolution.all_or_nothing);
        assert_eq!(config.calendar.hours_per_day, 10);
        assert_eq!(config.calendar.working_days, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_rejects_bad_calendar_and_syntax() {
        assert!(matches!(
            EngineConfig::from_json_str(r#"{"calendar": {"workingDays": []}}"#),
            Err(ConfigError::Calendar(_))
        ));
        assert!(matches!(
            EngineConfig::from_json_str(r#"{"calendar": {"dayStartHour": 4294967295, "hoursPerDay": 8}}"#),
            Err(ConfigError::Calendar(_))
        ));
        assert!(matches!(
            EngineConfig::from_json_str("{"),
            Err(ConfigError::Parse(_))
        ));
    }
}
