//! Persistence collaborators.
//!
//! The engine never owns project data. It loads snapshots through
//! [`ProjectRepository`] and writes back through the same trait, which must
//! perform read-compare-write as one atomic step: a stale version or etag
//! is rejected, never merged silently.
//!
//! [`InMemoryRepository`] is a mutex-guarded implementation used by tests
//! and embedders that keep projects in memory.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::conflict::PendingWrite;
use crate::models::{
    snapshot_etag, Dependency, Entity, EntityType, FieldError, Task, WorkingHoursConfig,
};

/// Failures reported by a repository.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("{entity_type} not found: {entity_id}")]
    EntityNotFound {
        entity_type: EntityType,
        entity_id: String,
    },

    #[error("{entity_type} '{entity_id}' is at version {actual}, write expected {expected}")]
    VersionMismatch {
        entity_type: EntityType,
        entity_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("project changed since it was read (etag {expected}, now {actual})")]
    EtagMismatch { expected: String, actual: String },

    #[error("backup not found: {0}")]
    BackupNotFound(String),

    #[error(transparent)]
    InvalidField(#[from] FieldError),

    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Project storage consumed by the engine.
pub trait ProjectRepository: Send + Sync {
    fn load_tasks(&self, project_id: &str) -> Result<Vec<Task>, RepositoryError>;

    fn load_dependencies(&self, project_id: &str) -> Result<Vec<Dependency>, RepositoryError>;

    /// Persists a calculated schedule if the project still matches `etag`.
    ///
    /// Returns the new project etag.
    fn save_schedule_application(
        &self,
        project_id: &str,
        schedule_id: &str,
        etag: &str,
        writes: &[PendingWrite],
    ) -> Result<String, RepositoryError>;

    /// Applies field writes, each checked against its base version.
    ///
    /// All or nothing. Returns the new project etag.
    fn write_entities(&self, project_id: &str, writes: &[PendingWrite]) -> Result<String, RepositoryError>;

    /// Snapshots the project, returning a backup id.
    fn create_backup(&self, project_id: &str) -> Result<String, RepositoryError>;

    fn restore_backup(&self, project_id: &str, backup_id: &str) -> Result<(), RepositoryError>;
}

/// Source of per-project working calendars.
pub trait CalendarSource: Send + Sync {
    fn working_hours(&self, project_id: &str) -> Result<WorkingHoursConfig, RepositoryError>;
}

#[derive(Debug, Clone, Default)]
struct ProjectData {
    tasks: Vec<Task>,
    dependencies: Vec<Dependency>,
    calendar: Option<WorkingHoursConfig>,
    backups: BTreeMap<String, (Vec<Task>, Vec<Dependency>)>,
    applied_schedules: Vec<String>,
}

impl ProjectData {
    fn etag(&self) -> String {
        snapshot_etag(&self.tasks, &self.dependencies)
    }

    /// Validates every write against a copy, then commits the copy.
    fn apply(&mut self, writes: &[PendingWrite]) -> Result<(), RepositoryError> {
        let (tasks, dependencies) = apply_writes(&self.tasks, &self.dependencies, writes)?;
        self.tasks = tasks;
        self.dependencies = dependencies;
        Ok(())
    }
}

/// Applies `writes` to copies of a snapshot and returns the copies.
///
/// Every write is checked against the version stored before the batch and
/// each touched entity's version is bumped once. The inputs are never
/// modified, so callers can preview a batch before persisting it.
pub fn apply_writes(
    tasks: &[Task],
    dependencies: &[Dependency],
    writes: &[PendingWrite],
) -> Result<(Vec<Task>, Vec<Dependency>), RepositoryError> {
    let mut tasks = tasks.to_vec();
    let mut dependencies = dependencies.to_vec();
    let mut touched: Vec<(EntityType, usize)> = Vec::new();

    for write in writes {
        let index = match write.entity_type {
            EntityType::Task => apply_write(&mut tasks, write)?,
            EntityType::Dependency => apply_write(&mut dependencies, write)?,
            EntityType::Schedule => return Err(not_found(write)),
        };
        if !touched.contains(&(write.entity_type, index)) {
            touched.push((write.entity_type, index));
        }
    }

    for (entity_type, index) in touched {
        match entity_type {
            EntityType::Task => bump(&mut tasks[index]),
            _ => bump(&mut dependencies[index]),
        }
    }
    Ok((tasks, dependencies))
}

fn not_found(write: &PendingWrite) -> RepositoryError {
    RepositoryError::EntityNotFound {
        entity_type: write.entity_type,
        entity_id: write.entity_id.clone(),
    }
}

fn bump<E: Entity>(entity: &mut E) {
    let next = entity.version() + 1;
    entity.set_version(next);
}

/// Applies one write in place and returns the entity's index.
///
/// Versions are bumped after the whole batch, so several writes to one
/// entity all compare against the version stored before the batch.
fn apply_write<E: Entity + Clone>(
    entities: &mut [E],
    write: &PendingWrite,
) -> Result<usize, RepositoryError> {
    let index = entities
        .iter()
        .position(|e| e.entity_id() == write.entity_id)
        .ok_or_else(|| not_found(write))?;
    let actual = entities[index].version();
    if actual != write.base_version {
        return Err(RepositoryError::VersionMismatch {
            entity_type: write.entity_type,
            entity_id: write.entity_id.clone(),
            expected: write.base_version,
            actual,
        });
    }
    let mut entity = entities[index].clone();
    for (field, value) in &write.changes {
        entity = entity.with_field(field, value.clone())?;
    }
    entities[index] = entity;
    Ok(index)
}

/// Mutex-guarded, in-process project store.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    projects: Mutex<HashMap<String, ProjectData>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a project.
    pub fn with_project(
        self,
        project_id: impl Into<String>,
        tasks: Vec<Task>,
        dependencies: Vec<Dependency>,
    ) -> Self {
        let mut projects = self.projects.into_inner().unwrap_or_else(|e| e.into_inner());
        projects.insert(
            project_id.into(),
            ProjectData {
                tasks,
                dependencies,
                ..ProjectData::default()
            },
        );
        Self {
            projects: Mutex::new(projects),
        }
    }

    /// Sets the working calendar served for a project.
    pub fn set_calendar(&self, project_id: &str, config: WorkingHoursConfig) -> Result<(), RepositoryError> {
        self.project(project_id, |p| {
            p.calendar = Some(config);
            Ok(())
        })
    }

    /// Schedule ids applied to a project, oldest first.
    pub fn applied_schedules(&self, project_id: &str) -> Result<Vec<String>, RepositoryError> {
        self.project(project_id, |p| Ok(p.applied_schedules.clone()))
    }

    /// Current etag of a project.
    pub fn etag(&self, project_id: &str) -> Result<String, RepositoryError> {
        self.project(project_id, |p| Ok(p.etag()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, ProjectData>>, RepositoryError> {
        self.projects
            .lock()
            .map_err(|e| RepositoryError::Unavailable(e.to_string()))
    }

    fn project<R>(
        &self,
        project_id: &str,
        f: impl FnOnce(&mut ProjectData) -> Result<R, RepositoryError>,
    ) -> Result<R, RepositoryError> {
        let mut projects = self.lock()?;
        let project = projects
            .get_mut(project_id)
            .ok_or_else(|| RepositoryError::ProjectNotFound(project_id.to_string()))?;
        f(project)
    }
}

impl ProjectRepository for InMemoryRepository {
    fn load_tasks(&self, project_id: &str) -> Result<Vec<Task>, RepositoryError> {
        self.project(project_id, |p| Ok(p.tasks.clone()))
    }

    fn load_dependencies(&self, project_id: &str) -> Result<Vec<Dependency>, RepositoryError> {
        self.project(project_id, |p| Ok(p.dependencies.clone()))
    }

    fn save_schedule_application(
        &self,
        project_id: &str,
        schedule_id: &str,
        etag: &str,
        writes: &[PendingWrite],
    ) -> Result<String, RepositoryError> {
        self.project(project_id, |p| {
            let actual = p.etag();
            if actual != etag {
                return Err(RepositoryError::EtagMismatch {
                    expected: etag.to_string(),
                    actual,
                });
            }
            p.apply(writes)?;
            p.applied_schedules.push(schedule_id.to_string());
            Ok(p.etag())
        })
    }

    fn write_entities(&self, project_id: &str, writes: &[PendingWrite]) -> Result<String, RepositoryError> {
        self.project(project_id, |p| {
            p.apply(writes)?;
            Ok(p.etag())
        })
    }

    fn create_backup(&self, project_id: &str) -> Result<String, RepositoryError> {
        self.project(project_id, |p| {
            let id = format!("BACKUP-{:04}", p.backups.len() + 1);
            p.backups
                .insert(id.clone(), (p.tasks.clone(), p.dependencies.clone()));
            Ok(id)
        })
    }

    fn restore_backup(&self, project_id: &str, backup_id: &str) -> Result<(), RepositoryError> {
        self.project(project_id, |p| {
            let (tasks, dependencies) = p
                .backups
                .get(backup_id)
                .cloned()
                .ok_or_else(|| RepositoryError::BackupNotFound(backup_id.to_string()))?;
            p.tasks = tasks;
            p.dependencies = dependencies;
            Ok(())
        })
    }
}

impl CalendarSource for InMemoryRepository {
    /// The project's calendar, or the default Monday–Friday calendar.
    fn working_hours(&self, project_id: &str) -> Result<WorkingHoursConfig, RepositoryError> {
        self.project(project_id, |p| Ok(p.calendar.clone().unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    const PROJECT: &str = "P1";

    fn d(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 9, 0, 0).unwrap()
    }

    fn repo() -> InMemoryRepository {
        InMemoryRepository::new().with_project(
            PROJECT,
            vec![Task::new("A", d(8), d(9)), Task::new("B", d(9), d(10))],
            vec![Dependency::finish_to_start("A", "B")],
        )
    }

    #[test]
    fn test_load_and_missing_project() {
        let repo = repo();
        assert_eq!(repo.load_tasks(PROJECT).unwrap().len(), 2);
        assert_eq!(repo.load_dependencies(PROJECT).unwrap().len(), 1);
        assert_eq!(
            repo.load_tasks("nope"),
            Err(RepositoryError::ProjectNotFound("nope".into()))
        );
    }

    #[test]
    fn test_write_bumps_version_once() {
        let repo = repo();
        let before = repo.etag(PROJECT).unwrap();
        let writes = vec![
            PendingWrite::task("A", 1).with_change("progress", json!(30)),
            PendingWrite::task("A", 1).with_change("title", json!("Design")),
        ];
        let after = repo.write_entities(PROJECT, &writes).unwrap();
        assert_ne!(before, after);

        let a = &repo.load_tasks(PROJECT).unwrap()[0];
        assert_eq!(a.version, 2);
        assert_eq!(a.progress, 30);
        assert_eq!(a.title, "Design");
    }

    #[test]
    fn test_stale_write_is_rejected_atomically() {
        let repo = repo();
        let writes = vec![
            PendingWrite::task("A", 1).with_change("progress", json!(30)),
            PendingWrite::task("B", 0).with_change("progress", json!(60)),
        ];
        let err = repo.write_entities(PROJECT, &writes).unwrap_err();
        assert_eq!(
            err,
            RepositoryError::VersionMismatch {
                entity_type: EntityType::Task,
                entity_id: "B".into(),
                expected: 0,
                actual: 1,
            }
        );
        assert_eq!(repo.load_tasks(PROJECT).unwrap()[0].progress, 0);
    }

    #[test]
    fn test_apply_writes_leaves_input_untouched() {
        let tasks = vec![Task::new("A", d(8), d(9))];
        let writes = [PendingWrite::task("A", 1).with_change("progress", json!(40))];
        let (next, deps) = apply_writes(&tasks, &[], &writes).unwrap();
        assert_eq!((next[0].progress, next[0].version), (40, 2));
        assert!(deps.is_empty());
        assert_eq!((tasks[0].progress, tasks[0].version), (0, 1));
    }

    #[test]
    fn test_invalid_field_is_rejected() {
        let repo = repo();
        let bad = [PendingWrite::task("A", 1).with_change("color", json!("red"))];
        assert!(matches!(
            repo.write_entities(PROJECT, &bad),
            Err(RepositoryError::InvalidField(FieldError::Unknown(_)))
        ));
        let ro = [PendingWrite::dependency("A->B", 1).with_change("version", json!(5))];
        assert!(matches!(
            repo.write_entities(PROJECT, &ro),
            Err(RepositoryError::InvalidField(FieldError::ReadOnly(_)))
        ));
    }

    #[test]
    fn test_schedule_application_checks_etag() {
        let repo = repo();
        let etag = repo.etag(PROJECT).unwrap();
        let writes = [PendingWrite::task("B", 1).with_change("startDate", json!(d(11)))];

        repo.save_schedule_application(PROJECT, "S1", &etag, &writes)
            .unwrap();
        assert_eq!(repo.applied_schedules(PROJECT).unwrap(), vec!["S1"]);
        assert_eq!(repo.load_tasks(PROJECT).unwrap()[1].start_date, d(11));

        let again = repo.save_schedule_application(PROJECT, "S2", &etag, &writes);
        assert!(matches!(again, Err(RepositoryError::EtagMismatch { .. })));
    }

    #[test]
    fn test_backup_round_trip() {
        let repo = repo();
        let backup = repo.create_backup(PROJECT).unwrap();
        assert_eq!(backup, "BACKUP-0001");
        repo.write_entities(
            PROJECT,
            &[PendingWrite::task("A", 1).with_change("progress", json!(90))],
        )
        .unwrap();
        repo.restore_backup(PROJECT, &backup).unwrap();
        assert_eq!(repo.load_tasks(PROJECT).unwrap()[0].progress, 0);
        assert_eq!(
            repo.restore_backup(PROJECT, "BACKUP-9999"),
            Err(RepositoryError::BackupNotFound("BACKUP-9999".into()))
        );
    }

    #[test]
    fn test_calendar_source_defaults() {
        let repo = repo();
        assert_eq!(repo.working_hours(PROJECT).unwrap(), WorkingHoursConfig::default());
        repo.set_calendar(PROJECT, WorkingHoursConfig::continuous())
            .unwrap();
        assert_eq!(
            repo.working_hours(PROJECT).unwrap(),
            WorkingHoursConfig::continuous()
        );
    }
}
