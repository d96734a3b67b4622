//! Service facade.
//!
//! [`SchedulingService`] is the surface embedders call. It loads snapshots
//! from a [`ProjectRepository`], runs the pure engines, persists through the
//! repository's atomic compare-and-write, and records an audit entry for
//! every operation. Audit failures are logged and swallowed.
//!
//! | Operation | Audit |
//! |-----------|-------|
//! | `calculate_schedule` | `calculate` |
//! | `apply_schedule` | `apply` |
//! | `reschedule_from_move` | `preview` |
//! | `resolve_conflict` | `resolve` |
//! | `resolve_bulk_conflicts` | `bulk_resolve` |
//! | `check_integrity` | `integrity_check` |
//!
//! Detected conflicts are kept in one registry per service until resolved.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::{AuditEntry, AuditOperation, AuditOutcome, AuditSink, TracingAuditSink};
use crate::cascade::{AutoRescheduler, CascadeConfig, CascadeResult, RecommendedAction};
use crate::config::EngineConfig;
use crate::conflict::{
    ConflictContext, ConflictDetector, ConflictResolver, PendingWrite, ResolutionOptions,
};
use crate::error::{ConflictError, Result, SchedulingError};
use crate::models::{
    snapshot_etag, ConflictId, ConflictResolutionResult, Dependency, DetectedConflict, EntityType,
    ResolutionStrategy, SchedulingResult, Task, WorkingCalendar,
};
use crate::scheduler::{CancellationFlag, CriticalPathScheduler, SchedulingOptions};
use crate::store::{self, CalendarSource, ProjectRepository, RepositoryError};
use crate::validation::{
    self, DependencyValidation, ValidationError, ValidationErrorKind, ValidationErrors,
};

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Scheduling operations over persisted projects.
pub struct SchedulingService {
    repository: Arc<dyn ProjectRepository>,
    calendars: Option<Arc<dyn CalendarSource>>,
    audit: Arc<dyn AuditSink>,
    config: EngineConfig,
    resolver: Mutex<ConflictResolver>,
    cancel: Option<CancellationFlag>,
}

impl SchedulingService {
    /// Creates a service with default configuration and a tracing audit sink.
    ///
    /// Without a calendar source every project uses the configured calendar.
    pub fn new(repository: Arc<dyn ProjectRepository>) -> Self {
        let config = EngineConfig::default();
        Self {
            repository,
            calendars: None,
            audit: Arc::new(TracingAuditSink),
            resolver: Mutex::new(ConflictResolver::new(config.merge_rules.clone())),
            config,
            cancel: None,
        }
    }

    pub fn with_calendar_source(mut self, calendars: Arc<dyn CalendarSource>) -> Self {
        self.calendars = Some(calendars);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.resolver = Mutex::new(ConflictResolver::new(config.merge_rules.clone()));
        self.config = config;
        self
    }

    /// Flag passed to every calculation and cascade.
    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Conflicts detected and not yet resolved.
    pub fn open_conflicts(&self) -> Result<Vec<DetectedConflict>> {
        Ok(self.resolver()?.open_conflicts().cloned().collect())
    }

    /// Calculates the critical-path schedule of a project.
    ///
    /// `options` defaults to the configured scheduling options.
    pub fn calculate_schedule(
        &self,
        project_id: &str,
        options: Option<&SchedulingOptions>,
    ) -> Result<SchedulingResult> {
        let started = Instant::now();
        let outcome = self.run_calculation(project_id, options);
        let entry = AuditEntry::new(AuditOperation::Calculate, outcome_of(&outcome)).with_project(project_id);
        let entry = match &outcome {
            Ok(result) => {
                info!(
                    project_id,
                    task_count = result.tasks.len(),
                    critical_tasks = result.metrics.critical_tasks,
                    "schedule calculated"
                );
                entry
                    .with_metadata("scheduleId", json!(result.schedule_id))
                    .with_metadata("etag", json!(result.etag))
                    .with_metadata("iterations", json!(result.metrics.performance.iterations))
                    .with_performance(elapsed_ms(started), result.tasks.len())
            }
            Err(e) => {
                warn!(project_id, error = %e, "schedule calculation failed");
                entry
                    .with_metadata("error", json!(e.to_string()))
                    .with_performance(elapsed_ms(started), 0)
            }
        };
        self.record(entry);
        outcome
    }

    fn run_calculation(&self, project_id: &str, options: Option<&SchedulingOptions>) -> Result<SchedulingResult> {
        let (tasks, dependencies) = self.load(project_id)?;
        let mut scheduler = CriticalPathScheduler::new(self.calendar(project_id)?);
        if let Some(flag) = &self.cancel {
            scheduler = scheduler.with_cancellation(flag.clone());
        }
        scheduler.calculate(
            &tasks,
            &dependencies,
            options.unwrap_or(&self.config.scheduling),
        )
    }

    /// Checks whether `candidate` may be added to `existing`.
    pub fn validate_dependency(&self, candidate: &Dependency, existing: &[Dependency]) -> DependencyValidation {
        let validation = validation::validate_dependency(candidate, existing);
        debug!(
            dependency_id = %candidate.id,
            is_valid = validation.is_valid,
            "dependency validated"
        );
        validation
    }

    /// Previews the cascade caused by moving one task.
    ///
    /// Nothing is persisted; apply [`CascadeResult::change_set`] to commit.
    pub fn reschedule_from_move(
        &self,
        task_id: &str,
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
        tasks: &[Task],
        dependencies: &[Dependency],
        config: Option<&CascadeConfig>,
    ) -> Result<CascadeResult> {
        let started = Instant::now();
        let mut engine = AutoRescheduler::new(config.unwrap_or(&self.config.cascade).clone());
        if let Some(flag) = &self.cancel {
            engine = engine.with_cancellation(flag.clone());
        }
        let outcome = engine.reschedule(task_id, new_start, new_end, tasks, dependencies);

        let entry = match &outcome {
            Ok(cascade) => {
                let status = if cascade.recommended_action == RecommendedAction::Abort {
                    AuditOutcome::Partial
                } else {
                    AuditOutcome::Success
                };
                AuditEntry::new(AuditOperation::Preview, status)
                    .with_metadata("taskId", json!(task_id))
                    .with_metadata("recommendedAction", json!(cascade.recommended_action))
                    .with_metadata("cascadeLevels", json!(cascade.cascade_levels))
                    .with_performance(elapsed_ms(started), cascade.affected_tasks.len())
            }
            Err(e) => AuditEntry::new(AuditOperation::Preview, AuditOutcome::Failure)
                .with_metadata("taskId", json!(task_id))
                .with_metadata("error", json!(e.to_string()))
                .with_performance(elapsed_ms(started), 0),
        };
        self.record(entry);
        outcome
    }

    /// Detects conflicts between `context` and the stored project, and
    /// registers them for resolution.
    pub fn detect_conflicts(
        &self,
        project_id: &str,
        etag: &str,
        context: &ConflictContext,
    ) -> Result<Vec<DetectedConflict>> {
        let (tasks, dependencies) = self.load(project_id)?;
        let detector = ConflictDetector::new().with_calendar(self.calendar(project_id)?);
        let conflicts = detector.detect(etag, context, &tasks, &dependencies);
        let conflicts = register(&mut *self.resolver()?, conflicts);
        info!(project_id, conflicts = conflicts.len(), "conflicts detected");
        Ok(conflicts)
    }

    /// Persists a calculated schedule.
    ///
    /// # Errors
    /// `SchedulingError::Conflict` when the project changed since the
    /// calculation in a way that touches the schedule; the conflicts are
    /// also registered for resolution.
    pub fn apply_schedule(&self, project_id: &str, result: &SchedulingResult) -> Result<String> {
        let started = Instant::now();
        let outcome = self.run_apply(project_id, result);
        let entry = AuditEntry::new(AuditOperation::Apply, outcome_of(&outcome))
            .with_project(project_id)
            .with_metadata("scheduleId", json!(result.schedule_id));
        let entry = match &outcome {
            Ok(etag) => entry.with_metadata("etag", json!(etag)),
            Err(SchedulingError::Conflict(e)) => entry.with_metadata("conflicts", json!(e.conflicts.len())),
            Err(e) => entry.with_metadata("error", json!(e.to_string())),
        };
        self.record(entry.with_performance(elapsed_ms(started), result.tasks.len()));
        outcome
    }

    fn run_apply(&self, project_id: &str, result: &SchedulingResult) -> Result<String> {
        let (tasks, dependencies) = self.load(project_id)?;
        let current = snapshot_etag(&tasks, &dependencies);
        let context = ConflictContext::from_schedule(result);

        if current != result.etag {
            let conflicts = ConflictDetector::new().detect(&result.etag, &context, &tasks, &dependencies);
            if !conflicts.is_empty() {
                warn!(project_id, conflicts = conflicts.len(), "schedule is stale");
                let conflicts = register(&mut *self.resolver()?, conflicts);
                return Err(ConflictError::new(conflicts).into());
            }
        }

        let etag = self
            .repository
            .save_schedule_application(project_id, &result.schedule_id, &current, &context.writes)?;
        info!(
            project_id,
            schedule_id = %result.schedule_id,
            written = context.writes.len(),
            "schedule applied"
        );
        Ok(etag)
    }

    /// Resolves one registered conflict and persists the outcome.
    pub fn resolve_conflict(
        &self,
        project_id: &str,
        conflict_id: &ConflictId,
        strategy: ResolutionStrategy,
        options: &ResolutionOptions,
    ) -> Result<ConflictResolutionResult> {
        self.resolve(
            project_id,
            std::slice::from_ref(conflict_id),
            strategy,
            options,
            AuditOperation::Resolve,
        )
    }

    /// Resolves several registered conflicts with one strategy.
    pub fn resolve_bulk_conflicts(
        &self,
        project_id: &str,
        conflict_ids: &[ConflictId],
        strategy: ResolutionStrategy,
        options: &ResolutionOptions,
    ) -> Result<ConflictResolutionResult> {
        self.resolve(project_id, conflict_ids, strategy, options, AuditOperation::BulkResolve)
    }

    fn resolve(
        &self,
        project_id: &str,
        ids: &[ConflictId],
        strategy: ResolutionStrategy,
        options: &ResolutionOptions,
        operation: AuditOperation,
    ) -> Result<ConflictResolutionResult> {
        let started = Instant::now();
        let outcome = self.run_resolution(project_id, ids, strategy, options);

        let entry = match &outcome {
            Ok(result) => {
                let status = if result.success {
                    AuditOutcome::Success
                } else if result.is_partial() {
                    AuditOutcome::Partial
                } else {
                    AuditOutcome::Failure
                };
                AuditEntry::new(operation, status)
                    .with_changes(result.applied_changes.clone())
                    .with_metadata("resolved", json!(result.resolved_conflicts))
                    .with_metadata("remaining", json!(result.remaining_conflicts))
            }
            Err(e) => AuditEntry::new(operation, AuditOutcome::Failure)
                .with_metadata("error", json!(e.to_string())),
        };
        self.record(
            entry
                .with_project(project_id)
                .with_metadata("strategy", json!(strategy))
                .with_performance(elapsed_ms(started), ids.len()),
        );
        outcome
    }

    fn run_resolution(
        &self,
        project_id: &str,
        ids: &[ConflictId],
        strategy: ResolutionStrategy,
        options: &ResolutionOptions,
    ) -> Result<ConflictResolutionResult> {
        let backup_id = if options.create_backup {
            Some(self.repository.create_backup(project_id)?)
        } else {
            None
        };

        let mut result = {
            let mut resolver = self.resolver()?;
            let originals: Vec<DetectedConflict> =
                ids.iter().filter_map(|id| resolver.get(id).cloned()).collect();
            let mut result = if let [id] = ids {
                resolver.resolve_conflict(id, strategy, options)?
            } else {
                resolver.resolve_bulk_conflicts(ids, strategy, options)?
            };

            if let Err(e) = self.persist_resolution(project_id, &originals, &result) {
                // Resolved in memory but not persisted: reopen.
                let resolved = &result.resolved_conflicts;
                let reopened: Vec<DetectedConflict> = originals
                    .into_iter()
                    .filter(|c| resolved.contains(&c.id))
                    .collect();
                resolver.register(reopened.iter().cloned());
                warn!(project_id, error = %e, "resolution could not be persisted");

                if matches!(e, SchedulingError::Repository(RepositoryError::VersionMismatch { .. })) {
                    let fresh = self.redetect(project_id, &reopened)?;
                    if !fresh.is_empty() {
                        return Err(ConflictError::new(register(&mut resolver, fresh)).into());
                    }
                }
                return Err(e);
            }
            result.backup_id = backup_id;
            result
        };

        for id in &result.resolved_conflicts {
            info!(project_id, conflict_id = %id, ?strategy, "conflict resolved");
        }
        if options.recalculate_schedule && !result.resolved_conflicts.is_empty() {
            result.recalculated_schedule = Some(Box::new(self.calculate_schedule(project_id, None)?));
        }
        Ok(result)
    }

    /// Writes the resolved values once the project they produce still
    /// validates.
    ///
    /// Only validation errors the writes introduce reject the resolution;
    /// problems already stored are left to [`Self::check_integrity`].
    fn persist_resolution(
        &self,
        project_id: &str,
        originals: &[DetectedConflict],
        result: &ConflictResolutionResult,
    ) -> Result<()> {
        if result.resolutions.is_empty() {
            return Ok(());
        }
        let (tasks, dependencies) = self.load(project_id)?;
        let writes = resolution_writes(originals, result, &tasks, &dependencies)?;
        if writes.is_empty() {
            return Ok(());
        }

        let (next_tasks, next_dependencies) = store::apply_writes(&tasks, &dependencies, &writes)?;
        if let Err(after) = validation::validate_input(&next_tasks, &next_dependencies) {
            let before = validation::validate_input(&tasks, &dependencies)
                .err()
                .map(|e| e.0)
                .unwrap_or_default();
            let introduced = introduced_errors(&before, after.0);
            if !introduced.is_empty() {
                return Err(ValidationErrors(introduced).into());
            }
        }

        self.repository.write_entities(project_id, &writes)?;
        Ok(())
    }

    /// Re-runs version detection for conflicts whose resolution hit a
    /// newer stored version.
    ///
    /// The incoming values are replayed against the version each conflict
    /// was detected at, so the fresh conflicts carry the values stored now.
    fn redetect(&self, project_id: &str, conflicts: &[DetectedConflict]) -> Result<Vec<DetectedConflict>> {
        let mut context = ConflictContext::new();
        for conflict in conflicts {
            let (Some(base), Some(incoming)) = (conflict.stored_version, conflict.conflicting_value.as_object())
            else {
                continue;
            };
            let mut write = PendingWrite::new(conflict.entity_type, conflict.entity_id.as_str(), base);
            for (field, value) in incoming {
                write = write.with_change(field.as_str(), value.clone());
            }
            context = context.with_write(write);
        }
        let (tasks, dependencies) = self.load(project_id)?;
        Ok(ConflictDetector::new().detect("", &context, &tasks, &dependencies))
    }

    /// Runs the structural checks on the stored project and registers any
    /// conflicts found.
    pub fn check_integrity(&self, project_id: &str) -> Result<Vec<DetectedConflict>> {
        let started = Instant::now();
        let outcome = self.run_integrity_check(project_id);
        let entry = AuditEntry::new(AuditOperation::IntegrityCheck, outcome_of(&outcome)).with_project(project_id);
        let entry = match &outcome {
            Ok(conflicts) => entry
                .with_metadata("conflicts", json!(conflicts.len()))
                .with_performance(elapsed_ms(started), conflicts.len()),
            Err(e) => entry
                .with_metadata("error", json!(e.to_string()))
                .with_performance(elapsed_ms(started), 0),
        };
        self.record(entry);
        outcome
    }

    fn run_integrity_check(&self, project_id: &str) -> Result<Vec<DetectedConflict>> {
        let (tasks, dependencies) = self.load(project_id)?;
        let detector = ConflictDetector::new().with_calendar(self.calendar(project_id)?);
        let conflicts = detector.detect_structural(&tasks, &dependencies);
        let conflicts = register(&mut *self.resolver()?, conflicts);
        info!(project_id, conflicts = conflicts.len(), "integrity checked");
        Ok(conflicts)
    }

    fn load(&self, project_id: &str) -> Result<(Vec<Task>, Vec<Dependency>)> {
        let tasks = self.repository.load_tasks(project_id)?;
        let dependencies = self.repository.load_dependencies(project_id)?;
        Ok((tasks, dependencies))
    }

    fn calendar(&self, project_id: &str) -> Result<WorkingCalendar> {
        let calendar = match &self.calendars {
            Some(source) => source.working_hours(project_id)?.build()?,
            None => self.config.calendar.build()?,
        };
        Ok(calendar)
    }

    fn resolver(&self) -> Result<MutexGuard<'_, ConflictResolver>> {
        self.resolver
            .lock()
            .map_err(|e| RepositoryError::Unavailable(format!("conflict registry: {e}")).into())
    }

    fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.record(&entry) {
            warn!(operation = ?entry.operation, error = %e, "audit record dropped");
        }
    }
}

/// Registers `conflicts` and returns them under their registry ids.
fn register(resolver: &mut ConflictResolver, mut conflicts: Vec<DetectedConflict>) -> Vec<DetectedConflict> {
    let ids = resolver.register(conflicts.iter().cloned());
    for (conflict, id) in conflicts.iter_mut().zip(ids) {
        conflict.id = id;
    }
    conflicts
}

/// Field writes for every resolved value that differs from storage.
///
/// Each write is based on the version its conflict was detected at, so an
/// edit stored after detection fails the write instead of being lost.
fn resolution_writes(
    originals: &[DetectedConflict],
    result: &ConflictResolutionResult,
    tasks: &[Task],
    dependencies: &[Dependency],
) -> Result<Vec<PendingWrite>> {
    let detected: HashMap<&ConflictId, u64> = originals
        .iter()
        .filter_map(|c| c.stored_version.map(|v| (&c.id, v)))
        .collect();
    let stored: HashMap<(EntityType, &str), u64> = tasks
        .iter()
        .map(|t| ((EntityType::Task, t.id.as_str()), t.version))
        .chain(
            dependencies
                .iter()
                .map(|d| ((EntityType::Dependency, d.id.as_str()), d.version)),
        )
        .collect();

    let mut writes = Vec::new();
    for resolution in &result.resolutions {
        let changed = result.applied_changes.iter().filter(|c| {
            c.entity_type == resolution.entity_type
                && c.entity_id == resolution.entity_id
                && c.old_value != c.new_value
        });
        let mut write: Option<PendingWrite> = None;
        for change in changed {
            let pending = match write.take() {
                Some(pending) => pending,
                None => {
                    let base = detected
                        .get(&resolution.conflict_id)
                        .or_else(|| stored.get(&(resolution.entity_type, resolution.entity_id.as_str())))
                        .copied()
                        .ok_or_else(|| RepositoryError::EntityNotFound {
                            entity_type: resolution.entity_type,
                            entity_id: resolution.entity_id.clone(),
                        })?;
                    PendingWrite::new(resolution.entity_type, resolution.entity_id.as_str(), base)
                }
            };
            write = Some(pending.with_change(change.field.as_str(), change.new_value.clone()));
        }
        writes.extend(write);
    }
    Ok(writes)
}

/// Errors in `after` that `before` did not already report. A graph that
/// was already cyclic counts its cycle as known whatever path is reported.
fn introduced_errors(before: &[ValidationError], after: Vec<ValidationError>) -> Vec<ValidationError> {
    after
        .into_iter()
        .filter(|e| {
            !before.iter().any(|b| {
                b == e || (b.kind == ValidationErrorKind::CyclicDependency && e.kind == b.kind)
            })
        })
        .collect()
}

fn outcome_of<T>(outcome: &Result<T>) -> AuditOutcome {
    match outcome {
        Ok(_) => AuditOutcome::Success,
        Err(_) => AuditOutcome::Failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditError, MemoryAuditSink};
    use crate::models::{ConflictStatus, ConflictType, TaskStatus, WorkingHoursConfig};
    use crate::store::InMemoryRepository;
    use chrono::TimeZone;

    const PROJECT: &str = "P1";

    fn d(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    struct FailingSink;

    impl AuditSink for FailingSink {
        fn record(&self, _entry: &AuditEntry) -> std::result::Result<(), AuditError> {
            Err(AuditError::Unavailable("down".into()))
        }
    }

    fn setup(
        tasks: Vec<Task>,
        deps: Vec<Dependency>,
    ) -> (SchedulingService, Arc<InMemoryRepository>, Arc<MemoryAuditSink>) {
        let repo = Arc::new(InMemoryRepository::new().with_project(PROJECT, tasks, deps));
        repo.set_calendar(PROJECT, WorkingHoursConfig::continuous())
            .unwrap();
        let audit = Arc::new(MemoryAuditSink::new());
        let service = SchedulingService::new(repo.clone())
            .with_calendar_source(repo.clone())
            .with_audit(audit.clone());
        (service, repo, audit)
    }

    fn chain() -> (Vec<Task>, Vec<Dependency>) {
        (
            vec![
                Task::new("A", d(8, 0), d(8, 10)),
                Task::new("B", d(8, 0), d(8, 5)),
            ],
            vec![Dependency::finish_to_start("A", "B")],
        )
    }

    #[test]
    fn test_calculate_records_audit() {
        let (tasks, deps) = chain();
        let (service, _, audit) = setup(tasks, deps);
        let result = service.calculate_schedule(PROJECT, None).unwrap();
        assert_eq!(result.task("B").unwrap().earliest_start, d(8, 10));

        let entries = audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, AuditOperation::Calculate);
        assert_eq!(entries[0].outcome, AuditOutcome::Success);
        assert_eq!(entries[0].metadata["scheduleId"], json!(result.schedule_id));
    }

    #[test]
    fn test_calculate_failure_is_audited() {
        let tasks = vec![
            Task::new("A", d(8, 0), d(8, 1)),
            Task::new("B", d(8, 0), d(8, 1)),
        ];
        let deps = vec![
            Dependency::finish_to_start("A", "B"),
            Dependency::finish_to_start("B", "A"),
        ];
        let (service, _, audit) = setup(tasks, deps);
        assert!(matches!(
            service.calculate_schedule(PROJECT, None),
            Err(SchedulingError::Validation(_))
        ));
        assert_eq!(audit.entries()[0].outcome, AuditOutcome::Failure);
    }

    #[test]
    fn test_audit_failure_does_not_fail_operation() {
        let (tasks, deps) = chain();
        let (service, _, _) = setup(tasks, deps);
        let service = service.with_audit(Arc::new(FailingSink));
        assert!(service.calculate_schedule(PROJECT, None).is_ok());
    }

    #[test]
    fn test_apply_fresh_schedule() {
        let (tasks, deps) = chain();
        let (service, repo, _) = setup(tasks, deps);
        let result = service.calculate_schedule(PROJECT, None).unwrap();
        let etag = service.apply_schedule(PROJECT, &result).unwrap();

        assert_eq!(repo.etag(PROJECT).unwrap(), etag);
        let b = &repo.load_tasks(PROJECT).unwrap()[1];
        assert_eq!(b.start_date, d(8, 10));
        assert_eq!(b.version, 2);
        assert_eq!(repo.applied_schedules(PROJECT).unwrap(), vec![result.schedule_id]);
    }

    #[test]
    fn test_apply_stale_schedule_returns_conflict() {
        let (tasks, deps) = chain();
        let (service, repo, audit) = setup(tasks, deps);
        let result = service.calculate_schedule(PROJECT, None).unwrap();

        repo.write_entities(
            PROJECT,
            &[PendingWrite::task("B", 1).with_change("progress", json!(20))],
        )
        .unwrap();

        let err = service.apply_schedule(PROJECT, &result).unwrap_err();
        let SchedulingError::Conflict(ConflictError { conflicts }) = err else {
            panic!("expected conflict, got {err:?}");
        };
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::OptimisticLocking);
        assert_eq!(conflicts[0].entity_id, "B");
        assert_eq!(service.open_conflicts().unwrap().len(), 1);
        assert_eq!(audit.entries().last().unwrap().outcome, AuditOutcome::Failure);
        assert_eq!(repo.load_tasks(PROJECT).unwrap()[1].start_date, d(8, 0));
    }

    #[test]
    fn test_resolve_incoming_persists_schedule_dates() {
        let (tasks, deps) = chain();
        let (service, repo, audit) = setup(tasks, deps);
        let result = service.calculate_schedule(PROJECT, None).unwrap();
        repo.write_entities(
            PROJECT,
            &[PendingWrite::task("B", 1).with_change("progress", json!(20))],
        )
        .unwrap();
        let _ = service.apply_schedule(PROJECT, &result);
        let id = service.open_conflicts().unwrap()[0].id.clone();

        let options = ResolutionOptions::default()
            .with_backup(true)
            .with_recalculation(true);
        let resolved = service
            .resolve_conflict(PROJECT, &id, ResolutionStrategy::Incoming, &options)
            .unwrap();
        assert!(resolved.success);
        assert_eq!(resolved.backup_id.as_deref(), Some("BACKUP-0001"));
        assert!(resolved.recalculated_schedule.is_some());

        let b = &repo.load_tasks(PROJECT).unwrap()[1];
        assert_eq!(b.start_date, d(8, 10));
        assert_eq!(b.progress, 20);
        assert_eq!(b.version, 3);
        assert!(service.open_conflicts().unwrap().is_empty());

        let resolve_entry = audit
            .entries()
            .into_iter()
            .find(|e| e.operation == AuditOperation::Resolve)
            .unwrap();
        assert_eq!(resolve_entry.outcome, AuditOutcome::Success);
        assert_eq!(resolve_entry.changes.len(), 2);
    }

    #[test]
    fn test_resolve_current_writes_nothing() {
        let (tasks, deps) = chain();
        let (service, repo, _) = setup(tasks, deps);
        let ctx = ConflictContext::new()
            .with_write(PendingWrite::task("A", 0).with_change("progress", json!(50)));
        let conflicts = service.detect_conflicts(PROJECT, "", &ctx).unwrap();
        assert_eq!(conflicts.len(), 1);

        let before = repo.etag(PROJECT).unwrap();
        let result = service
            .resolve_conflict(
                PROJECT,
                &conflicts[0].id,
                ResolutionStrategy::Current,
                &ResolutionOptions::default(),
            )
            .unwrap();
        assert!(result.success);
        assert_eq!(result.applied_changes[0].old_value, result.applied_changes[0].new_value);
        assert_eq!(repo.etag(PROJECT).unwrap(), before);
    }

    #[test]
    fn test_bulk_resolution_is_audited() {
        let (tasks, deps) = chain();
        let (service, repo, audit) = setup(tasks, deps);
        let ctx = ConflictContext::new()
            .with_write(PendingWrite::task("A", 0).with_change("progress", json!(50)))
            .with_write(PendingWrite::task("B", 0).with_change("progress", json!(70)));
        let ids: Vec<ConflictId> = service
            .detect_conflicts(PROJECT, "", &ctx)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids.len(), 2);

        let result = service
            .resolve_bulk_conflicts(PROJECT, &ids, ResolutionStrategy::Merge, &ResolutionOptions::default())
            .unwrap();
        assert!(result.success);
        let tasks = repo.load_tasks(PROJECT).unwrap();
        assert_eq!((tasks[0].progress, tasks[1].progress), (50, 70));

        let last = audit.entries().pop().unwrap();
        assert_eq!(last.operation, AuditOperation::BulkResolve);
        assert_eq!(last.changes.len(), 2);
    }

    #[test]
    fn test_failed_persist_reopens_conflict() {
        let (tasks, deps) = chain();
        let (service, _, _) = setup(tasks, deps);
        let ctx = ConflictContext::new()
            .with_write(PendingWrite::task("A", 0).with_change("color", json!("red")));
        let id = service.detect_conflicts(PROJECT, "", &ctx).unwrap()[0].id.clone();

        let err = service.resolve_conflict(
            PROJECT,
            &id,
            ResolutionStrategy::Incoming,
            &ResolutionOptions::default(),
        );
        assert!(matches!(err, Err(SchedulingError::Repository(_))));
        let open = service.open_conflicts().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, id);
    }

    #[test]
    fn test_resolution_writes_against_detected_version() {
        let (tasks, deps) = chain();
        let (service, repo, _) = setup(tasks, deps);
        let ctx = ConflictContext::new()
            .with_write(PendingWrite::task("A", 0).with_change("progress", json!(30)));
        let detected = service.detect_conflicts(PROJECT, "", &ctx).unwrap();
        assert_eq!(detected[0].stored_version, Some(1));

        // Someone else saves A after the conflict was shown.
        repo.write_entities(
            PROJECT,
            &[PendingWrite::task("A", 1).with_change("progress", json!(90))],
        )
        .unwrap();

        let err = service
            .resolve_conflict(
                PROJECT,
                &detected[0].id,
                ResolutionStrategy::Incoming,
                &ResolutionOptions::default(),
            )
            .unwrap_err();
        let SchedulingError::Conflict(ConflictError { conflicts }) = err else {
            panic!("expected conflict, got {err:?}");
        };
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::OptimisticLocking);
        assert_eq!(conflicts[0].current_value, json!({"progress": 90}));
        assert_eq!(conflicts[0].stored_version, Some(2));

        let a = &repo.load_tasks(PROJECT).unwrap()[0];
        assert_eq!((a.progress, a.version), (90, 2));
        let open = service.open_conflicts().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, conflicts[0].id);
        assert_eq!(open[0].status, ConflictStatus::Detected);

        service
            .resolve_conflict(
                PROJECT,
                &open[0].id,
                ResolutionStrategy::Incoming,
                &ResolutionOptions::default(),
            )
            .unwrap();
        let a = &repo.load_tasks(PROJECT).unwrap()[0];
        assert_eq!((a.progress, a.version), (30, 3));
    }

    #[test]
    fn test_resolution_creating_cycle_is_rejected() {
        let tasks = vec![
            Task::new("A", d(8, 0), d(8, 2)),
            Task::new("B", d(8, 2), d(8, 4)),
            Task::new("C", d(8, 4), d(8, 6)),
        ];
        let deps = vec![
            Dependency::finish_to_start("A", "B"),
            Dependency::finish_to_start("B", "C"),
            Dependency::finish_to_start("A", "C"),
        ];
        let (service, repo, audit) = setup(tasks, deps.clone());
        let ctx = ConflictContext::new().with_write(
            PendingWrite::dependency("A->C", 0)
                .with_change("predecessorId", json!("C"))
                .with_change("successorId", json!("A")),
        );
        let id = service.detect_conflicts(PROJECT, "", &ctx).unwrap()[0].id.clone();

        let err = service
            .resolve_conflict(PROJECT, &id, ResolutionStrategy::Incoming, &ResolutionOptions::default())
            .unwrap_err();
        let SchedulingError::Validation(errors) = err else {
            panic!("expected validation error, got {err:?}");
        };
        assert!(errors.has(ValidationErrorKind::CyclicDependency));
        assert_eq!(repo.load_dependencies(PROJECT).unwrap(), deps);
        let open: Vec<ConflictId> = service.open_conflicts().unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(open, vec![id]);
        assert_eq!(audit.entries().last().unwrap().outcome, AuditOutcome::Failure);
    }

    #[test]
    fn test_resolution_ending_before_start_is_rejected() {
        let (tasks, deps) = chain();
        let (service, repo, _) = setup(tasks, deps);
        let ctx = ConflictContext::new()
            .with_write(PendingWrite::task("A", 0).with_change("endDate", json!(d(7, 0))));
        let id = service.detect_conflicts(PROJECT, "", &ctx).unwrap()[0].id.clone();

        let err = service.resolve_conflict(
            PROJECT,
            &id,
            ResolutionStrategy::Incoming,
            &ResolutionOptions::default(),
        );
        assert!(matches!(
            err,
            Err(SchedulingError::Validation(ref e)) if e.has(ValidationErrorKind::InvalidDateRange)
        ));
        let a = &repo.load_tasks(PROJECT).unwrap()[0];
        assert_eq!((a.end_date, a.version), (d(8, 10), 1));
        assert_eq!(service.open_conflicts().unwrap().len(), 1);
    }

    #[test]
    fn test_resolution_tolerates_existing_invalid_data() {
        let tasks = vec![
            Task::new("A", d(8, 0), d(8, 2)),
            Task::new("B", d(8, 6), d(8, 4)),
        ];
        let (service, repo, _) = setup(tasks, Vec::new());
        let ctx = ConflictContext::new()
            .with_write(PendingWrite::task("A", 0).with_change("progress", json!(40)));
        let id = service.detect_conflicts(PROJECT, "", &ctx).unwrap()[0].id.clone();

        service
            .resolve_conflict(PROJECT, &id, ResolutionStrategy::Incoming, &ResolutionOptions::default())
            .unwrap();
        assert_eq!(repo.load_tasks(PROJECT).unwrap()[0].progress, 40);
    }

    #[test]
    fn test_repeated_integrity_checks_keep_one_entry() {
        let tasks = vec![
            Task::new("A", d(8, 0), d(9, 0)),
            Task::new("B", d(8, 12), d(9, 12)),
        ];
        let deps = vec![Dependency::finish_to_start("A", "B")];
        let (service, _, _) = setup(tasks, deps);
        let ids = |conflicts: Vec<DetectedConflict>| -> Vec<ConflictId> {
            conflicts.into_iter().map(|c| c.id).collect()
        };

        let first = ids(service.check_integrity(PROJECT).unwrap());
        assert_eq!(first.len(), 1);
        for _ in 0..4 {
            assert_eq!(ids(service.check_integrity(PROJECT).unwrap()), first);
        }
        assert_eq!(service.open_conflicts().unwrap().len(), 1);

        let result = service
            .resolve_conflict(PROJECT, &first[0], ResolutionStrategy::Incoming, &ResolutionOptions::default())
            .unwrap();
        assert!(result.success);
        assert!(service.check_integrity(PROJECT).unwrap().is_empty());
    }

    #[test]
    fn test_check_integrity_registers_conflicts() {
        let tasks = vec![
            Task::new("A", d(8, 0), d(9, 0)),
            Task::new("B", d(8, 12), d(9, 12)).with_status(TaskStatus::InProgress),
        ];
        let deps = vec![Dependency::finish_to_start("A", "B")];
        let (service, _, audit) = setup(tasks, deps);

        let conflicts = service.check_integrity(PROJECT).unwrap();
        let kinds: Vec<ConflictType> = conflicts.iter().map(|c| c.conflict_type).collect();
        assert!(kinds.contains(&ConflictType::DependencyMismatch));
        assert!(kinds.contains(&ConflictType::SchedulingConflict));
        assert_eq!(service.open_conflicts().unwrap().len(), conflicts.len());
        assert_eq!(audit.entries()[0].operation, AuditOperation::IntegrityCheck);
    }

    #[test]
    fn test_reschedule_preview_is_audited() {
        let (tasks, deps) = chain();
        let (service, _, audit) = setup(tasks.clone(), deps.clone());
        let cascade = service
            .reschedule_from_move("A", d(8, 2), d(8, 12), &tasks, &deps, None)
            .unwrap();
        assert_eq!(cascade.affected_ids(), vec!["B"]);
        let entry = &audit.entries()[0];
        assert_eq!(entry.operation, AuditOperation::Preview);
        assert_eq!(entry.metadata["recommendedAction"], json!("proceed"));
    }

    #[test]
    fn test_validate_dependency_passthrough() {
        let (tasks, deps) = chain();
        let (service, _, _) = setup(tasks, deps.clone());
        let back = Dependency::finish_to_start("B", "A");
        assert!(!service.validate_dependency(&back, &deps).is_valid);
    }

    #[test]
    fn test_cancelled_calculation() {
        let (tasks, deps) = chain();
        let (service, _, _) = setup(tasks, deps);
        let flag = CancellationFlag::new();
        flag.cancel();
        let service = service.with_cancellation(flag);
        assert!(matches!(
            service.calculate_schedule(PROJECT, None),
            Err(SchedulingError::Cancelled)
        ));
    }

    #[test]
    fn test_configured_calendar_without_source() {
        let (tasks, deps) = chain();
        let repo = Arc::new(InMemoryRepository::new().with_project(PROJECT, tasks, deps));
        let config = EngineConfig::default().with_calendar(WorkingHoursConfig::continuous());
        let service = SchedulingService::new(repo).with_config(config);
        let result = service.calculate_schedule(PROJECT, None).unwrap();
        // 2024-01-08 is a Monday; a continuous calendar keeps midnight starts.
        assert_eq!(result.task("A").unwrap().earliest_start, d(8, 0));
        assert_eq!(result.task("B").unwrap().earliest_finish, d(8, 15));
    }

    #[test]
    fn test_unknown_project() {
        let (tasks, deps) = chain();
        let (service, _, _) = setup(tasks, deps);
        assert!(matches!(
            service.calculate_schedule("missing", None),
            Err(SchedulingError::Repository(RepositoryError::ProjectNotFound(_)))
        ));
    }
}
