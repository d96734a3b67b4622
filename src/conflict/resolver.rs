//! Conflict resolution.
//!
//! [`resolve_values`] is the pure core: given one conflict and a strategy
//! it computes the winning field values and an [`AppliedChange`] per field.
//! [`ConflictResolver`] wraps it with the conflict registry and the
//! `Detected → Resolving → Resolved | Detected` state machine.
//!
//! | Strategy | New value per field |
//! |----------|--------------------|
//! | CURRENT  | stored value (recorded with `newValue == oldValue`) |
//! | INCOMING | incoming value, stored value where the incoming side is silent |
//! | MANUAL   | caller-supplied value, stored value where none is given |
//! | MERGE    | [`MergeRules::merge_field`] |
//!
//! Persisting the resolved values, taking backups and recalculating the
//! schedule are left to the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::merge::MergeRules;
use crate::error::{Result, SchedulingError};
use crate::models::{
    AppliedChange, ConflictId, ConflictResolutionResult, ConflictStatus, DetectedConflict,
    Resolution, ResolutionStrategy,
};

/// Fields a resolution never writes.
const PROTECTED_FIELDS: &[&str] = &["id", "version"];

/// Options for one resolution call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolutionOptions {
    /// Re-run the scheduler after persisting.
    pub recalculate_schedule: bool,
    /// Snapshot the project before persisting.
    pub create_backup: bool,
    /// Field values for MANUAL (and MANUAL merge rules).
    pub manual_values: BTreeMap<String, Value>,
    /// Bulk only: resolve nothing unless every conflict resolves.
    pub all_or_nothing: bool,
    /// Overrides the resolver's merge rules.
    pub merge_rules: Option<MergeRules>,
}

impl Default for ResolutionOptions {
    fn default() -> Self {
        Self {
            recalculate_schedule: false,
            create_backup: false,
            manual_values: BTreeMap::new(),
            all_or_nothing: true,
            merge_rules: None,
        }
    }
}

impl ResolutionOptions {
    pub fn with_recalculation(mut self, recalculate: bool) -> Self {
        self.recalculate_schedule = recalculate;
        self
    }

    pub fn with_backup(mut self, backup: bool) -> Self {
        self.create_backup = backup;
        self
    }

    pub fn with_manual_value(mut self, field: impl Into<String>, value: Value) -> Self {
        self.manual_values.insert(field.into(), value);
        self
    }

    pub fn with_all_or_nothing(mut self, all_or_nothing: bool) -> Self {
        self.all_or_nothing = all_or_nothing;
        self
    }

    pub fn with_merge_rules(mut self, rules: MergeRules) -> Self {
        self.merge_rules = Some(rules);
        self
    }
}

/// Computes the resolved values for one conflict.
///
/// Deterministic: fields are visited in sorted order and no state is read
/// besides the arguments.
///
/// # Errors
/// `SchedulingError::Resolution` when MANUAL has no values, when INCOMING
/// or MERGE meet a conflict with nothing to apply, or when a merge rule
/// rejects a field.
pub fn resolve_values(
    conflict: &DetectedConflict,
    strategy: ResolutionStrategy,
    rules: &MergeRules,
    manual: &BTreeMap<String, Value>,
) -> Result<(Resolution, Vec<AppliedChange>)> {
    let fail = |message: String| SchedulingError::Resolution {
        id: conflict.id.clone(),
        message,
    };

    let current = conflict.current_value.as_object();
    let incoming = conflict.conflicting_value.as_object();
    match strategy {
        ResolutionStrategy::Manual if manual.is_empty() => {
            return Err(fail("MANUAL resolution requires field values".into()));
        }
        ResolutionStrategy::Incoming | ResolutionStrategy::Merge if incoming.is_none() => {
            return Err(fail(format!(
                "{strategy:?} resolution has no incoming field values to apply"
            )));
        }
        _ => {}
    }

    let mut fields: BTreeSet<String> = conflict.fields().into_iter().collect();
    if strategy == ResolutionStrategy::Manual {
        fields.extend(manual.keys().cloned());
    }

    let mut values = BTreeMap::new();
    let mut changes = Vec::new();
    for field in fields {
        if PROTECTED_FIELDS.contains(&field.as_str()) {
            continue;
        }
        let old = current
            .and_then(|m| m.get(&field))
            .cloned()
            .unwrap_or(Value::Null);
        let theirs = incoming.and_then(|m| m.get(&field));
        let new = match strategy {
            ResolutionStrategy::Current => old.clone(),
            ResolutionStrategy::Incoming => theirs.cloned().unwrap_or_else(|| old.clone()),
            ResolutionStrategy::Manual => manual.get(&field).cloned().unwrap_or_else(|| old.clone()),
            ResolutionStrategy::Merge => match theirs {
                Some(theirs) => rules
                    .merge_field(&field, &old, theirs, manual.get(&field))
                    .map_err(|e| fail(e.to_string()))?,
                None => old.clone(),
            },
        };
        values.insert(field.clone(), new.clone());
        changes.push(AppliedChange {
            entity_type: conflict.entity_type,
            entity_id: conflict.entity_id.clone(),
            field,
            old_value: old,
            new_value: new,
            strategy,
        });
    }

    let resolution = Resolution {
        conflict_id: conflict.id.clone(),
        entity_type: conflict.entity_type,
        entity_id: conflict.entity_id.clone(),
        values,
    };
    Ok((resolution, changes))
}

/// Registry of open conflicts and their lifecycle.
///
/// Resolved conflicts leave the registry.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    conflicts: BTreeMap<ConflictId, DetectedConflict>,
    rules: MergeRules,
}

impl ConflictResolver {
    pub fn new(rules: MergeRules) -> Self {
        Self {
            conflicts: BTreeMap::new(),
            rules,
        }
    }

    pub fn rules(&self) -> &MergeRules {
        &self.rules
    }

    /// Adds conflicts in `Detected` state, returning their ids.
    ///
    /// A conflict with the same type, entity and conflicting entity as an
    /// open `Detected` one replaces it under the existing id, so repeated
    /// detection of one problem keeps a single entry.
    pub fn register(&mut self, conflicts: impl IntoIterator<Item = DetectedConflict>) -> Vec<ConflictId> {
        conflicts
            .into_iter()
            .map(|mut conflict| {
                conflict.status = ConflictStatus::Detected;
                if let Some(existing) = self.find_same(&conflict) {
                    debug!(conflict_id = %existing, "conflict refreshed");
                    conflict.id = existing;
                }
                let id = conflict.id.clone();
                self.conflicts.insert(id.clone(), conflict);
                id
            })
            .collect()
    }

    fn find_same(&self, conflict: &DetectedConflict) -> Option<ConflictId> {
        self.conflicts
            .values()
            .find(|open| {
                open.status == ConflictStatus::Detected
                    && open.conflict_type == conflict.conflict_type
                    && open.entity_type == conflict.entity_type
                    && open.entity_id == conflict.entity_id
                    && open.conflicting_entity_id == conflict.conflicting_entity_id
            })
            .map(|open| open.id.clone())
    }

    pub fn get(&self, id: &ConflictId) -> Option<&DetectedConflict> {
        self.conflicts.get(id)
    }

    /// Open conflicts in id order.
    pub fn open_conflicts(&self) -> impl Iterator<Item = &DetectedConflict> {
        self.conflicts.values()
    }

    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    fn transition(&mut self, id: &ConflictId, to: ConflictStatus) -> Result<()> {
        let conflict = self
            .conflicts
            .get_mut(id)
            .ok_or_else(|| SchedulingError::ConflictNotFound(id.clone()))?;
        let from = conflict.status;
        if !from.can_transition_to(to) {
            return Err(SchedulingError::InvalidTransition {
                id: id.clone(),
                from,
                to,
            });
        }
        debug!(conflict_id = %id, ?from, ?to, "conflict status changed");
        conflict.status = to;
        Ok(())
    }

    fn finish(&mut self, id: &ConflictId) -> Result<()> {
        self.transition(id, ConflictStatus::Resolved)?;
        self.conflicts.remove(id);
        Ok(())
    }

    /// Resolves one conflict.
    ///
    /// A strategy that cannot be applied returns the conflict to `Detected`
    /// and reports the reason in `errors` with `success == false`.
    ///
    /// # Errors
    /// `ConflictNotFound` for unknown ids, `InvalidTransition` when the
    /// conflict is not in `Detected` state.
    pub fn resolve_conflict(
        &mut self,
        id: &ConflictId,
        strategy: ResolutionStrategy,
        options: &ResolutionOptions,
    ) -> Result<ConflictResolutionResult> {
        let from = self
            .conflicts
            .get(id)
            .ok_or_else(|| SchedulingError::ConflictNotFound(id.clone()))?
            .status;
        if !from.can_transition_to(ConflictStatus::Resolving) {
            return Err(SchedulingError::InvalidTransition {
                id: id.clone(),
                from,
                to: ConflictStatus::Resolving,
            });
        }
        self.resolve_bulk_conflicts(std::slice::from_ref(id), strategy, options)
    }

    /// Resolves several conflicts with one strategy.
    ///
    /// With `all_or_nothing` (the default) every conflict goes back to
    /// `Detected` if any of them fails, and the result lists all of them as
    /// remaining. Otherwise the successes are kept and the split is reported.
    /// Unknown ids and conflicts not in `Detected` state count as failures.
    pub fn resolve_bulk_conflicts(
        &mut self,
        ids: &[ConflictId],
        strategy: ResolutionStrategy,
        options: &ResolutionOptions,
    ) -> Result<ConflictResolutionResult> {
        let rules = options.merge_rules.as_ref().unwrap_or(&self.rules).clone();
        let mut result = ConflictResolutionResult::new(strategy);
        let mut seen = BTreeSet::new();
        let mut resolving: Vec<ConflictId> = Vec::new();
        let mut outcomes = Vec::new();

        for id in ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Err(e) = self.transition(id, ConflictStatus::Resolving) {
                result.errors.insert(id.clone(), e.to_string());
                result.remaining_conflicts.push(id.clone());
                continue;
            }
            resolving.push(id.clone());
            let Some(conflict) = self.conflicts.get(id) else {
                continue;
            };
            match resolve_values(conflict, strategy, &rules, &options.manual_values) {
                Ok(outcome) => outcomes.push((id.clone(), outcome)),
                Err(e) => {
                    result.errors.insert(id.clone(), e.to_string());
                }
            }
        }

        let abort = options.all_or_nothing && !result.errors.is_empty();
        for id in resolving {
            let failed = result.errors.contains_key(&id);
            if abort || failed {
                self.transition(&id, ConflictStatus::Detected)?;
                result.remaining_conflicts.push(id);
            } else {
                self.finish(&id)?;
                result.resolved_conflicts.push(id);
            }
        }
        if !abort {
            for (_, (resolution, changes)) in outcomes {
                result.resolutions.push(resolution);
                result.applied_changes.extend(changes);
            }
        }

        result.success = result.errors.is_empty();
        debug!(
            ?strategy,
            resolved = result.resolved_conflicts.len(),
            remaining = result.remaining_conflicts.len(),
            "conflict resolution finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConflictSeverity, ConflictType, EntityType};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn locking(current: Value, incoming: Value) -> DetectedConflict {
        DetectedConflict::new(
            ConflictType::OptimisticLocking,
            ConflictSeverity::High,
            EntityType::Task,
            "T1",
        )
        .with_values(current, incoming)
    }

    fn sample() -> DetectedConflict {
        locking(
            json!({"startDate": "2024-01-10T09:00:00Z", "progress": 40, "title": "Build"}),
            json!({"startDate": "2024-01-08T09:00:00Z", "progress": 20, "title": "Build it"}),
        )
    }

    fn resolver_with(conflicts: Vec<DetectedConflict>) -> (ConflictResolver, Vec<ConflictId>) {
        let mut resolver = ConflictResolver::default();
        let ids = resolver.register(conflicts);
        (resolver, ids)
    }

    #[test]
    fn test_current_keeps_stored_values() {
        let (res, changes) = resolve_values(
            &sample(),
            ResolutionStrategy::Current,
            &MergeRules::default(),
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(changes.len(), 3);
        assert!(changes.iter().all(|c| c.old_value == c.new_value));
        assert_eq!(res.values["progress"], json!(40));
    }

    #[test]
    fn test_incoming_takes_their_values() {
        let (res, changes) = resolve_values(
            &sample(),
            ResolutionStrategy::Incoming,
            &MergeRules::default(),
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(res.values["title"], json!("Build it"));
        assert_eq!(res.values["progress"], json!(20));
        let fields: Vec<&str> = changes.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(fields, vec!["progress", "startDate", "title"]);
        assert!(changes.iter().all(|c| c.strategy == ResolutionStrategy::Incoming));
    }

    #[test]
    fn test_manual_uses_supplied_values() {
        let manual: BTreeMap<String, Value> = [("progress".to_string(), json!(30))].into();
        let (res, _) = resolve_values(
            &sample(),
            ResolutionStrategy::Manual,
            &MergeRules::default(),
            &manual,
        )
        .unwrap();
        assert_eq!(res.values["progress"], json!(30));
        assert_eq!(res.values["title"], json!("Build"));

        let err = resolve_values(
            &sample(),
            ResolutionStrategy::Manual,
            &MergeRules::default(),
            &BTreeMap::new(),
        );
        assert!(matches!(err, Err(SchedulingError::Resolution { .. })));
    }

    #[test]
    fn test_merge_applies_rules() {
        let (res, _) = resolve_values(
            &sample(),
            ResolutionStrategy::Merge,
            &MergeRules::default(),
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(res.values["startDate"], json!("2024-01-08T09:00:00Z"));
        assert_eq!(res.values["progress"], json!(40));
        assert_eq!(res.values["title"], json!("Build it"));
    }

    #[test]
    fn test_merge_is_deterministic() {
        let conflict = sample();
        let rules = MergeRules::default();
        let first = resolve_values(&conflict, ResolutionStrategy::Merge, &rules, &BTreeMap::new()).unwrap();
        for _ in 0..10 {
            let again =
                resolve_values(&conflict, ResolutionStrategy::Merge, &rules, &BTreeMap::new()).unwrap();
            assert_eq!(again.1, first.1);
        }
    }

    #[test]
    fn test_protected_fields_are_skipped() {
        let conflict = locking(json!({"version": 3}), json!({"version": 2}));
        let (res, changes) = resolve_values(
            &conflict,
            ResolutionStrategy::Incoming,
            &MergeRules::default(),
            &BTreeMap::new(),
        )
        .unwrap();
        assert!(res.values.is_empty());
        assert!(changes.is_empty());
    }

    #[test]
    fn test_incoming_without_values_fails() {
        let conflict = locking(json!({"version": 3}), Value::Null);
        assert!(resolve_values(
            &conflict,
            ResolutionStrategy::Incoming,
            &MergeRules::default(),
            &BTreeMap::new()
        )
        .is_err());
    }

    #[test]
    fn test_resolve_removes_from_registry() {
        let (mut resolver, ids) = resolver_with(vec![sample()]);
        let result = resolver
            .resolve_conflict(&ids[0], ResolutionStrategy::Incoming, &ResolutionOptions::default())
            .unwrap();
        assert!(result.success);
        assert_eq!(result.resolved_conflicts, ids);
        assert_eq!(result.applied_changes.len(), 3);
        assert!(resolver.is_empty());

        let again = resolver.resolve_conflict(&ids[0], ResolutionStrategy::Incoming, &ResolutionOptions::default());
        assert!(matches!(again, Err(SchedulingError::ConflictNotFound(_))));
    }

    #[test]
    fn test_failed_resolution_returns_to_detected() {
        let (mut resolver, ids) = resolver_with(vec![sample()]);
        let result = resolver
            .resolve_conflict(&ids[0], ResolutionStrategy::Manual, &ResolutionOptions::default())
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.remaining_conflicts, ids);
        assert!(result.errors.contains_key(&ids[0]));
        assert_eq!(resolver.get(&ids[0]).unwrap().status, ConflictStatus::Detected);

        // Retry is allowed.
        let retry = resolver
            .resolve_conflict(&ids[0], ResolutionStrategy::Current, &ResolutionOptions::default())
            .unwrap();
        assert!(retry.success);
    }

    #[test]
    fn test_bulk_all_or_nothing() {
        let ok = sample();
        let mut bad = locking(json!({"progress": 1}), Value::Null);
        bad.entity_id = "T2".into();
        let (mut resolver, ids) = resolver_with(vec![ok, bad]);

        let result = resolver
            .resolve_bulk_conflicts(&ids, ResolutionStrategy::Incoming, &ResolutionOptions::default())
            .unwrap();
        assert!(!result.success);
        assert!(result.resolved_conflicts.is_empty());
        assert_eq!(result.remaining_conflicts.len(), 2);
        assert!(result.applied_changes.is_empty());
        assert_eq!(result.errors.len(), 1);
        assert_eq!(resolver.len(), 2);
        assert!(resolver
            .open_conflicts()
            .all(|c| c.status == ConflictStatus::Detected));
    }

    #[test]
    fn test_bulk_partial_reports_split() {
        let ok = sample();
        let ok_id = ok.id.clone();
        let mut bad = locking(json!({"progress": 1}), Value::Null);
        bad.entity_id = "T2".into();
        let bad_id = bad.id.clone();
        let (mut resolver, mut ids) = resolver_with(vec![ok, bad]);
        let unknown = ConflictId::generate();
        ids.push(unknown.clone());
        ids.push(ok_id.clone());

        let options = ResolutionOptions::default().with_all_or_nothing(false);
        let result = resolver
            .resolve_bulk_conflicts(&ids, ResolutionStrategy::Incoming, &options)
            .unwrap();
        assert!(!result.success);
        assert!(result.is_partial());
        assert_eq!(result.resolved_conflicts, vec![ok_id]);
        let mut remaining = result.remaining_conflicts.clone();
        remaining.sort();
        let mut expected = vec![bad_id.clone(), unknown.clone()];
        expected.sort();
        assert_eq!(remaining, expected);
        assert!(result.errors.contains_key(&unknown));
        assert_eq!(resolver.len(), 1);
        assert!(resolver.get(&bad_id).is_some());
    }

    #[test]
    fn test_options_override_rules() {
        use super::super::merge::ProgressMergeRule;

        let (mut resolver, ids) = resolver_with(vec![sample()]);
        let options = ResolutionOptions::default()
            .with_merge_rules(MergeRules::default().with_progress(ProgressMergeRule::Min));
        let result = resolver
            .resolve_conflict(&ids[0], ResolutionStrategy::Merge, &options)
            .unwrap();
        assert_eq!(result.resolutions[0].values["progress"], json!(20));
    }

    #[test]
    fn test_register_refreshes_same_conflict() {
        let first = sample();
        let (mut resolver, ids) = resolver_with(vec![first]);
        let again = locking(json!({"progress": 45}), json!({"progress": 25})).with_stored_version(3);
        let again_ids = resolver.register(vec![again]);

        assert_eq!(again_ids, ids);
        assert_eq!(resolver.len(), 1);
        let open = resolver.get(&ids[0]).unwrap();
        assert_eq!(open.current_value, json!({"progress": 45}));
        assert_eq!(open.stored_version, Some(3));

        let mut other = sample();
        other.entity_id = "T2".into();
        resolver.register(vec![other]);
        assert_eq!(resolver.len(), 2);
    }

    #[test]
    fn test_options_deserialize_defaults() {
        let options: ResolutionOptions =
            serde_json::from_str(r#"{"recalculateSchedule": true}"#).unwrap();
        assert!(options.recalculate_schedule);
        assert!(options.all_or_nothing);
        assert!(!options.create_backup);
    }
}
