//! Conflict detection.
//!
//! Two independent checks:
//!
//! - **Version check**: every pending write carries the version it was based
//!   on. A stored version that differs is an `OPTIMISTIC_LOCKING` conflict,
//!   one per entity no matter how many fields the write touches. When the
//!   caller also supplies the versions it read (a calculated schedule being
//!   applied) and the snapshot etag has moved, read-only entities that changed,
//!   appeared or disappeared are reported too.
//! - **Structural check**: re-validates the snapshot as it is now and
//!   reports cycles, dangling references, impossible dates, violated links,
//!   tasks started ahead of their predecessors and double-booked assignees.
//!
//! Both return conflicts as data; nothing here fails.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};

use crate::models::{
    snapshot_etag, ConflictSeverity, ConflictType, Dependency, DependencyType, DetectedConflict,
    Entity, EntityType, SchedulingResult, Task, TaskStatus, WorkingCalendar,
};
use crate::validation::detect_cycles;

/// Fields whose change affects the schedule.
const SCHEDULE_FIELDS: &[&str] = &[
    "startDate",
    "endDate",
    "status",
    "estimatedHours",
    "predecessorId",
    "successorId",
    "type",
    "lag",
];

/// An edit waiting to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Version the edit was based on.
    pub base_version: u64,
    /// New field values, keyed by wire name.
    pub changes: BTreeMap<String, Value>,
}

impl PendingWrite {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>, base_version: u64) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            base_version,
            changes: BTreeMap::new(),
        }
    }

    pub fn task(id: impl Into<String>, base_version: u64) -> Self {
        Self::new(EntityType::Task, id, base_version)
    }

    pub fn dependency(id: impl Into<String>, base_version: u64) -> Self {
        Self::new(EntityType::Dependency, id, base_version)
    }

    pub fn with_change(mut self, field: impl Into<String>, value: Value) -> Self {
        self.changes.insert(field.into(), value);
        self
    }
}

/// What the caller read and what it wants to write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictContext {
    /// Task versions the caller's view was built from.
    pub task_versions: BTreeMap<String, u64>,
    /// Dependency versions the caller's view was built from.
    pub dependency_versions: BTreeMap<String, u64>,
    pub writes: Vec<PendingWrite>,
    /// Also run [`ConflictDetector::detect_structural`].
    pub include_structural: bool,
}

impl ConflictContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for applying a calculated schedule: the read set is every
    /// task and dependency the calculation used, and each task whose
    /// computed dates differ from its planned dates becomes a write.
    pub fn from_schedule(result: &SchedulingResult) -> Self {
        let mut ctx = Self::new();
        for st in &result.tasks {
            ctx.task_versions.insert(st.task.id.clone(), st.task.version);
            if st.earliest_start != st.task.start_date || st.earliest_finish != st.task.end_date {
                ctx.writes.push(
                    PendingWrite::task(&st.task.id, st.task.version)
                        .with_change("startDate", json!(st.earliest_start))
                        .with_change("endDate", json!(st.earliest_finish)),
                );
            }
        }
        for dep in &result.dependencies {
            ctx.dependency_versions.insert(dep.id.clone(), dep.version);
        }
        ctx
    }

    pub fn with_write(mut self, write: PendingWrite) -> Self {
        self.writes.push(write);
        self
    }

    pub fn with_structural(mut self, include: bool) -> Self {
        self.include_structural = include;
        self
    }

    fn has_read_set(&self) -> bool {
        !self.task_versions.is_empty() || !self.dependency_versions.is_empty()
    }
}

/// Finds version and structural conflicts in a snapshot.
#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    calendar: Option<WorkingCalendar>,
}

impl ConflictDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables the non-working-day start check.
    pub fn with_calendar(mut self, calendar: WorkingCalendar) -> Self {
        self.calendar = Some(calendar);
        self
    }

    /// Compares `context` against the stored snapshot.
    ///
    /// `etag` is the snapshot etag the caller read. Pending writes are
    /// always version-checked; the read set is only examined when `etag`
    /// no longer matches the snapshot.
    pub fn detect(
        &self,
        etag: &str,
        context: &ConflictContext,
        tasks: &[Task],
        dependencies: &[Dependency],
    ) -> Vec<DetectedConflict> {
        let store = Snapshot::new(tasks, dependencies);
        let mut conflicts = Vec::new();

        // Merge writes per entity; the stalest base version wins.
        let mut writes: BTreeMap<(EntityType, &str), (u64, Map<String, Value>)> = BTreeMap::new();
        for write in &context.writes {
            let entry = writes
                .entry((write.entity_type, write.entity_id.as_str()))
                .or_insert((write.base_version, Map::new()));
            entry.0 = entry.0.min(write.base_version);
            entry
                .1
                .extend(write.changes.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        for (&(entity_type, id), (base_version, changes)) in &writes {
            let Some((version, stored)) = store.get(entity_type, id) else {
                conflicts.push(deleted(entity_type, id, *base_version));
                continue;
            };
            if version == *base_version {
                continue;
            }
            let current: Map<String, Value> = changes
                .keys()
                .map(|field| (field.clone(), stored.get(field).cloned().unwrap_or(Value::Null)))
                .collect();
            let severity = if changes.keys().any(|f| SCHEDULE_FIELDS.contains(&f.as_str())) {
                ConflictSeverity::High
            } else {
                ConflictSeverity::Medium
            };
            conflicts.push(
                DetectedConflict::new(ConflictType::OptimisticLocking, severity, entity_type, id)
                    .with_values(Value::Object(current), Value::Object(changes.clone()))
                    .with_stored_version(version)
                    .with_message(format!(
                        "{entity_type} '{id}' is at version {version}, edit was based on version {base_version}"
                    )),
            );
        }

        if context.has_read_set() && etag != snapshot_etag(tasks, dependencies) {
            let written = |t: EntityType, id: &str| writes.contains_key(&(t, id));
            for (entity_type, read) in [
                (EntityType::Task, &context.task_versions),
                (EntityType::Dependency, &context.dependency_versions),
            ] {
                for (id, &base_version) in read {
                    if written(entity_type, id.as_str()) {
                        continue;
                    }
                    match store.get(entity_type, id) {
                        None => conflicts.push(deleted(entity_type, id, base_version)),
                        Some((version, _)) if version != base_version => conflicts.push(
                            DetectedConflict::new(
                                ConflictType::OptimisticLocking,
                                ConflictSeverity::Medium,
                                entity_type,
                                id.as_str(),
                            )
                            .with_values(json!({ "version": version }), json!({ "version": base_version }))
                            .with_stored_version(version)
                            .with_message(format!(
                                "{entity_type} '{id}' changed since it was read (version {base_version} → {version})"
                            )),
                        ),
                        Some(_) => {}
                    }
                }
            }
            conflicts.extend(store.added_since(context));
        }

        if context.include_structural {
            conflicts.extend(self.detect_structural(tasks, dependencies));
        }
        conflicts
    }

    /// Re-validates the snapshot as stored.
    pub fn detect_structural(&self, tasks: &[Task], dependencies: &[Dependency]) -> Vec<DetectedConflict> {
        let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let mut conflicts = Vec::new();

        if let Some(path) = detect_cycles(dependencies) {
            conflicts.push(circular(&path, dependencies));
        }

        for dep in dependencies {
            let missing: Vec<&str> = [dep.predecessor_id.as_str(), dep.successor_id.as_str()]
                .into_iter()
                .filter(|id| !by_id.contains_key(id))
                .collect();
            if !missing.is_empty() {
                conflicts.push(
                    DetectedConflict::new(
                        ConflictType::DataIntegrity,
                        ConflictSeverity::High,
                        EntityType::Dependency,
                        dep.id.as_str(),
                    )
                    .with_values(
                        json!({ "predecessorId": dep.predecessor_id, "successorId": dep.successor_id }),
                        Value::Null,
                    )
                    .with_message(format!(
                        "Dependency '{}' references unknown task(s): {}",
                        dep.id,
                        missing.join(", ")
                    )),
                );
            }
        }

        for task in tasks {
            if task.progress > 100 {
                conflicts.push(
                    DetectedConflict::new(
                        ConflictType::DataIntegrity,
                        ConflictSeverity::Medium,
                        EntityType::Task,
                        task.id.as_str(),
                    )
                    .with_values(json!({ "progress": task.progress }), json!({ "progress": 100 }))
                    .with_message(format!("Task '{}' has progress {}%", task.id, task.progress)),
                );
            }
            conflicts.extend(self.date_violation(task));
        }

        for dep in dependencies {
            let (Some(pred), Some(succ)) = (
                by_id.get(dep.predecessor_id.as_str()),
                by_id.get(dep.successor_id.as_str()),
            ) else {
                continue;
            };
            if pred.status == TaskStatus::Cancelled || succ.status == TaskStatus::Cancelled {
                continue;
            }
            conflicts.extend(link_violation(dep, pred, succ));
            conflicts.extend(started_early(dep, pred, succ));
        }

        conflicts.extend(overallocations(tasks));

        let store = Snapshot::new(tasks, dependencies);
        for conflict in conflicts.iter_mut().filter(|c| c.stored_version.is_none()) {
            conflict.stored_version = store.version(conflict.entity_type, &conflict.entity_id);
        }
        conflicts
    }

    fn date_violation(&self, task: &Task) -> Option<DetectedConflict> {
        let conflict = |severity, fix: Value, message: String| {
            DetectedConflict::new(
                ConflictType::DateConstraintViolation,
                severity,
                EntityType::Task,
                task.id.as_str(),
            )
            .with_values(dates(task.start_date, task.end_date), fix)
            .with_message(message)
        };

        if task.end_date < task.start_date {
            return Some(conflict(
                ConflictSeverity::High,
                json!({ "startDate": task.start_date, "endDate": task.start_date }),
                format!("Task '{}' ends before it starts", task.id),
            ));
        }
        let calendar = self.calendar.as_ref()?;
        if calendar.is_working_day(task.start_date.date_naive()) {
            return None;
        }
        let start = calendar.next_working_instant(task.start_date);
        Some(conflict(
            ConflictSeverity::Low,
            dates(start, task.end_date.max(start)),
            format!(
                "Task '{}' starts on a non-working day ({})",
                task.id,
                task.start_date.date_naive()
            ),
        ))
    }
}

/// Stored entities with their versions and wire representation.
struct Snapshot<'a> {
    tasks: HashMap<&'a str, &'a Task>,
    dependencies: HashMap<&'a str, &'a Dependency>,
}

impl<'a> Snapshot<'a> {
    fn new(tasks: &'a [Task], dependencies: &'a [Dependency]) -> Self {
        Self {
            tasks: tasks.iter().map(|t| (t.id.as_str(), t)).collect(),
            dependencies: dependencies.iter().map(|d| (d.id.as_str(), d)).collect(),
        }
    }

    fn version(&self, entity_type: EntityType, id: &str) -> Option<u64> {
        match entity_type {
            EntityType::Task => self.tasks.get(id).map(|t| t.version),
            EntityType::Dependency => self.dependencies.get(id).map(|d| d.version),
            EntityType::Schedule => None,
        }
    }

    fn get(&self, entity_type: EntityType, id: &str) -> Option<(u64, Map<String, Value>)> {
        let (version, value) = match entity_type {
            EntityType::Task => {
                let t = self.tasks.get(id)?;
                (t.version(), serde_json::to_value(t).ok()?)
            }
            EntityType::Dependency => {
                let d = self.dependencies.get(id)?;
                (d.version(), serde_json::to_value(d).ok()?)
            }
            EntityType::Schedule => return None,
        };
        match value {
            Value::Object(map) => Some((version, map)),
            _ => None,
        }
    }

    /// Entities a schedule would use that the caller never read.
    ///
    /// Cancelled tasks and their links are ignored since calculation skips them.
    fn added_since(&self, context: &ConflictContext) -> Vec<DetectedConflict> {
        let live = |id: &str| {
            self.tasks
                .get(id)
                .is_some_and(|t| t.status != TaskStatus::Cancelled)
        };
        let mut added: Vec<(EntityType, &str, u64)> = self
            .tasks
            .values()
            .filter(|t| live(t.id.as_str()) && !context.task_versions.contains_key(&t.id))
            .map(|t| (EntityType::Task, t.id.as_str(), t.version))
            .chain(
                self.dependencies
                    .values()
                    .filter(|d| {
                        live(d.predecessor_id.as_str())
                            && live(d.successor_id.as_str())
                            && !context.dependency_versions.contains_key(&d.id)
                    })
                    .map(|d| (EntityType::Dependency, d.id.as_str(), d.version)),
            )
            .collect();
        added.sort_unstable();

        added
            .into_iter()
            .map(|(entity_type, id, version)| {
                DetectedConflict::new(
                    ConflictType::OptimisticLocking,
                    ConflictSeverity::Medium,
                    entity_type,
                    id,
                )
                .with_values(json!({ "version": version }), Value::Null)
                .with_message(format!("{entity_type} '{id}' was created after the snapshot was read"))
            })
            .collect()
    }
}

fn dates(start: DateTime<Utc>, end: DateTime<Utc>) -> Value {
    json!({ "startDate": start, "endDate": end })
}

fn deleted(entity_type: EntityType, id: &str, base_version: u64) -> DetectedConflict {
    DetectedConflict::new(
        ConflictType::DataIntegrity,
        ConflictSeverity::High,
        entity_type,
        id,
    )
    .with_values(Value::Null, json!({ "version": base_version }))
    .with_message(format!("{entity_type} '{id}' no longer exists"))
}

fn circular(path: &[String], dependencies: &[Dependency]) -> DetectedConflict {
    let closing = match path {
        [.., from, to] => dependencies
            .iter()
            .find(|d| &d.predecessor_id == from && &d.successor_id == to),
        _ => None,
    };
    let (entity_type, entity_id) = match closing {
        Some(dep) => (EntityType::Dependency, dep.id.clone()),
        None => (
            EntityType::Task,
            path.first().cloned().unwrap_or_default(),
        ),
    };
    DetectedConflict::new(
        ConflictType::CircularDependency,
        ConflictSeverity::Critical,
        entity_type,
        entity_id,
    )
    .with_values(json!(path), Value::Null)
    .with_message(format!("Circular dependency: {}", path.join(" → ")))
}

/// Current dates break the link; the fix pushes the successor forward.
fn link_violation(dep: &Dependency, pred: &Task, succ: &Task) -> Option<DetectedConflict> {
    let rule = dep.rule();
    let lag = dep.lag_duration();
    if rule.is_satisfied(pred.start_date, pred.end_date, succ.start_date, succ.end_date, lag) {
        return None;
    }
    let span = succ.span();
    let start = rule.earliest_successor_start(pred.start_date, pred.end_date, span, lag);
    Some(
        DetectedConflict::new(
            ConflictType::DependencyMismatch,
            ConflictSeverity::Medium,
            EntityType::Task,
            succ.id.as_str(),
        )
        .with_conflicting_entity(pred.id.as_str())
        .with_values(dates(succ.start_date, succ.end_date), dates(start, start + span))
        .with_message(format!(
            "{} ({} link '{}')",
            rule.describe(&pred.id, &succ.id),
            dep.dependency_type,
            dep.id
        )),
    )
}

/// Successor already under way while its finish-to-start predecessor has not begun.
fn started_early(dep: &Dependency, pred: &Task, succ: &Task) -> Option<DetectedConflict> {
    let started = matches!(succ.status, TaskStatus::InProgress | TaskStatus::Done);
    if dep.dependency_type != DependencyType::FinishToStart
        || !started
        || pred.status != TaskStatus::Todo
    {
        return None;
    }
    Some(
        DetectedConflict::new(
            ConflictType::SchedulingConflict,
            ConflictSeverity::Medium,
            EntityType::Task,
            succ.id.as_str(),
        )
        .with_conflicting_entity(pred.id.as_str())
        .with_values(json!({ "status": succ.status }), json!({ "status": TaskStatus::Todo }))
        .with_message(format!(
            "Task '{}' is {:?} but its predecessor '{}' has not started",
            succ.id, succ.status, pred.id
        )),
    )
}

/// One conflict per overlapping pair of open tasks sharing an assignee.
///
/// The later task is the entity; the fix moves it to start when the
/// earlier one ends.
fn overallocations(tasks: &[Task]) -> Vec<DetectedConflict> {
    let mut by_assignee: BTreeMap<&str, Vec<&Task>> = BTreeMap::new();
    for task in tasks {
        let Some(assignee) = &task.assignee_id else {
            continue;
        };
        if task.status.is_movable() && task.end_date > task.start_date {
            by_assignee.entry(assignee.as_str()).or_default().push(task);
        }
    }

    let mut conflicts = Vec::new();
    for (assignee, mut booked) in by_assignee {
        booked.sort_by(|a, b| (a.start_date, &a.id).cmp(&(b.start_date, &b.id)));
        let mut open: Vec<&Task> = Vec::new();
        for task in booked {
            open.retain(|o| o.end_date > task.start_date);
            for earlier in &open {
                let start = earlier.end_date;
                conflicts.push(
                    DetectedConflict::new(
                        ConflictType::ResourceOverallocation,
                        ConflictSeverity::Medium,
                        EntityType::Task,
                        task.id.as_str(),
                    )
                    .with_conflicting_entity(earlier.id.as_str())
                    .with_values(
                        dates(task.start_date, task.end_date),
                        dates(start, start + task.span()),
                    )
                    .with_message(format!(
                        "'{assignee}' is booked on '{}' and '{}' at the same time",
                        earlier.id, task.id
                    )),
                );
            }
            open.push(task);
        }
    }
    conflicts
}
