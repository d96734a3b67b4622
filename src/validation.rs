//! Dependency graph validation.
//!
//! Checks the structural integrity of a task/dependency snapshot before it
//! is scheduled or persisted. Detects:
//! - Self-dependencies and duplicate edges
//! - Duplicate IDs and references to unknown tasks
//! - Impossible dates and out-of-range progress
//! - Circular dependencies (DAG validation), reported with the cycle path
//!
//! Every function here is pure over the snapshot it is given. Link types do
//! not matter for cycle detection: FS, SS, SF and FF edges all order the
//! predecessor before the successor.
//!
//! # Reference
//! Cormen et al. (2009), "Introduction to Algorithms", Ch. 22.3-22.4 (DFS, Topological Sort)

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::models::{Dependency, DependencyType, Task};

/// Validation result.
pub type ValidationResult = Result<(), ValidationErrors>;

/// A validation error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationError {
    /// Error category.
    pub kind: ValidationErrorKind,
    /// Human-readable description.
    pub message: String,
}

/// Categories of validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationErrorKind {
    /// A task depends on itself.
    SelfDependency,
    /// The dependency graph contains a cycle.
    CyclicDependency,
    /// Two entities share the same ID.
    DuplicateId,
    /// A dependency references a task that doesn't exist.
    UnknownTask,
    /// A task ends before it starts.
    InvalidDateRange,
    /// Progress outside 0-100.
    InvalidProgress,
    /// Two dependencies link the same pair of tasks.
    DuplicateDependency,
}

impl ValidationError {
    pub fn new(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Non-empty list of validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    /// Whether any error has the given kind.
    pub fn has(&self, kind: ValidationErrorKind) -> bool {
        self.0.iter().any(|e| e.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<&str> = self.0.iter().map(|e| e.message.as_str()).collect();
        f.write_str(&messages.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

/// Outcome of checking one candidate dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyValidation {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
    /// Closed cycle the candidate would create, e.g. `[A, B, C, A]`.
    pub cycle_path: Option<Vec<String>>,
}

/// Validates a candidate dependency against the existing edge set.
///
/// An existing edge with the candidate's id is treated as the edge being
/// edited and ignored. The candidate `A → B` is rejected when `B` can
/// already reach `A`.
///
/// # Example
/// ```
/// use gantt_schedule::models::Dependency;
/// use gantt_schedule::validation::validate_dependency;
///
/// let existing = vec![
///     Dependency::finish_to_start("A", "B"),
///     Dependency::finish_to_start("B", "C"),
/// ];
/// let result = validate_dependency(&Dependency::finish_to_start("C", "A"), &existing);
/// assert!(!result.is_valid);
/// assert_eq!(result.cycle_path.unwrap(), vec!["C", "A", "B", "C"]);
/// ```
pub fn validate_dependency(candidate: &Dependency, existing: &[Dependency]) -> DependencyValidation {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut cycle_path = None;

    let others: Vec<&Dependency> = existing.iter().filter(|d| d.id != candidate.id).collect();
    let pred = candidate.predecessor_id.as_str();
    let succ = candidate.successor_id.as_str();

    if pred == succ {
        errors.push(ValidationError::new(
            ValidationErrorKind::SelfDependency,
            format!("Task '{pred}' cannot depend on itself"),
        ));
    } else {
        if let Some(dup) = others
            .iter()
            .find(|d| d.predecessor_id == pred && d.successor_id == succ)
        {
            errors.push(ValidationError::new(
                ValidationErrorKind::DuplicateDependency,
                format!("'{pred}' → '{succ}' already exists as dependency '{}'", dup.id),
            ));
        }

        if let Some(path) = dependency_path(succ, pred, others.iter().copied()) {
            let mut cycle = Vec::with_capacity(path.len() + 1);
            cycle.push(pred.to_string());
            cycle.extend(path);
            errors.push(ValidationError::new(
                ValidationErrorKind::CyclicDependency,
                format!(
                    "Adding '{pred}' → '{succ}' would create a cycle: {}",
                    cycle.join(" → ")
                ),
            ));
            cycle_path = Some(cycle);
        }
    }

    if candidate.lag < 0 {
        warnings.push(format!(
            "Negative lag of {}h lets '{succ}' overlap '{pred}'",
            candidate.lag
        ));
    }
    if candidate.dependency_type == DependencyType::StartToFinish {
        warnings.push(format!(
            "Start-to-finish links are rare; check that '{succ}' should not finish before '{pred}' starts"
        ));
    }

    DependencyValidation {
        is_valid: errors.is_empty(),
        errors,
        warnings,
        cycle_path,
    }
}

/// Ordered node path `from → … → to` along dependency edges, if one exists.
///
/// Depth-first, visiting successors in edge order; each node is expanded
/// at most once per call, so cost is O(V + E).
pub fn dependency_path<'a, I>(from: &str, to: &str, edges: I) -> Option<Vec<String>>
where
    I: IntoIterator<Item = &'a Dependency>,
{
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
    for dep in edges {
        adj.entry(dep.predecessor_id.as_str())
            .or_default()
            .push(dep.successor_id.as_str());
    }

    if from == to {
        return Some(vec![from.to_string()]);
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut parent: HashMap<&str, &str> = HashMap::new();
    // Explicit stack of (node, next neighbor index) keeps deep chains off the call stack.
    let mut stack: Vec<(&str, usize)> = vec![(from, 0)];
    visited.insert(from);

    while let Some((node, idx)) = stack.pop() {
        let Some(next) = adj.get(node).and_then(|n| n.get(idx)).copied() else {
            continue;
        };
        stack.push((node, idx + 1));
        if !visited.insert(next) {
            continue;
        }
        parent.insert(next, node);
        if next == to {
            let mut path = vec![to.to_string()];
            let mut cur = to;
            while let Some(&p) = parent.get(cur) {
                path.push(p.to_string());
                cur = p;
            }
            path.reverse();
            return Some(path);
        }
        stack.push((next, 0));
    }

    None
}

/// Validates a whole task/dependency snapshot.
///
/// Checks:
/// 1. No duplicate task IDs
/// 2. Every task ends no earlier than it starts
/// 3. Progress within 0-100
/// 4. No duplicate dependency IDs
/// 5. Dependencies reference existing tasks and not themselves
/// 6. At most one dependency per (predecessor, successor) pair
/// 7. No circular dependencies
///
/// # Returns
/// `Ok(())` if all checks pass, `Err(errors)` with all detected issues.
pub fn validate_input(tasks: &[Task], dependencies: &[Dependency]) -> ValidationResult {
    let mut errors = Vec::new();

    let mut task_ids = HashSet::new();
    for task in tasks {
        if !task_ids.insert(task.id.as_str()) {
            errors.push(ValidationError::new(
                ValidationErrorKind::DuplicateId,
                format!("Duplicate task ID: {}", task.id),
            ));
        }
        if task.end_date < task.start_date {
            errors.push(ValidationError::new(
                ValidationErrorKind::InvalidDateRange,
                format!(
                    "Task '{}' ends ({}) before it starts ({})",
                    task.id, task.end_date, task.start_date
                ),
            ));
        }
        if task.progress > 100 {
            errors.push(ValidationError::new(
                ValidationErrorKind::InvalidProgress,
                format!("Task '{}' has progress {} (must be 0-100)", task.id, task.progress),
            ));
        }
    }

    let mut dep_ids = HashSet::new();
    let mut pairs = HashSet::new();
    for dep in dependencies {
        if !dep_ids.insert(dep.id.as_str()) {
            errors.push(ValidationError::new(
                ValidationErrorKind::DuplicateId,
                format!("Duplicate dependency ID: {}", dep.id),
            ));
        }
        for end in [&dep.predecessor_id, &dep.successor_id] {
            if !task_ids.contains(end.as_str()) {
                errors.push(ValidationError::new(
                    ValidationErrorKind::UnknownTask,
                    format!("Dependency '{}' references unknown task '{}'", dep.id, end),
                ));
            }
        }
        if dep.predecessor_id == dep.successor_id {
            errors.push(ValidationError::new(
                ValidationErrorKind::SelfDependency,
                format!("Task '{}' cannot depend on itself", dep.predecessor_id),
            ));
        } else if !pairs.insert((dep.predecessor_id.as_str(), dep.successor_id.as_str())) {
            errors.push(ValidationError::new(
                ValidationErrorKind::DuplicateDependency,
                format!(
                    "More than one dependency links '{}' → '{}'",
                    dep.predecessor_id, dep.successor_id
                ),
            ));
        }
    }

    if let Some(cycle) = detect_cycles(dependencies) {
        errors.push(ValidationError::new(
            ValidationErrorKind::CyclicDependency,
            format!("Circular dependency detected: {}", cycle.join(" → ")),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors(errors))
    }
}

/// Detects a cycle in the dependency graph using DFS.
///
/// Self-loops are left to [`validate_input`]. Returns the first cycle found
/// as a closed path (`[A, B, C, A]`); nodes are visited in sorted order so
/// the answer is deterministic.
///
/// # Algorithm
/// Iterative DFS with an explicit frame stack. A back-edge (an edge into a
/// node still on the path) closes a cycle. Each node and edge is visited
/// once, so the cost is O(V + E) and independent of the call stack.
pub fn detect_cycles(dependencies: &[Dependency]) -> Option<Vec<String>> {
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut all_ids: Vec<&str> = Vec::new();

    for dep in dependencies {
        if dep.predecessor_id == dep.successor_id {
            continue;
        }
        adj.entry(dep.predecessor_id.as_str())
            .or_default()
            .push(dep.successor_id.as_str());
        all_ids.push(&dep.predecessor_id);
        all_ids.push(&dep.successor_id);
    }
    all_ids.sort_unstable();
    all_ids.dedup();

    let mut visited: HashSet<&str> = HashSet::new();
    // Current DFS path and each path node's position in it.
    let mut path: Vec<&str> = Vec::new();
    let mut in_stack: HashMap<&str, usize> = HashMap::new();
    // (node, index of the next neighbor to explore)
    let mut frames: Vec<(&str, usize)> = Vec::new();

    for &root in &all_ids {
        if visited.contains(root) {
            continue;
        }
        visited.insert(root);
        in_stack.insert(root, path.len());
        path.push(root);
        frames.push((root, 0));

        while let Some(frame) = frames.last_mut() {
            let (node, cursor) = *frame;
            let next = adj.get(node).and_then(|n| n.get(cursor)).copied();
            let Some(next) = next else {
                frames.pop();
                path.pop();
                in_stack.remove(node);
                continue;
            };
            frame.1 += 1;

            if let Some(&pos) = in_stack.get(next) {
                let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
                cycle.push(next.to_string());
                return Some(cycle);
            }
            if visited.insert(next) {
                in_stack.insert(next, path.len());
                path.push(next);
                frames.push((next, 0));
            }
        }
    }

    None
}

/// Groups tasks into topological levels (Kahn's algorithm).
///
/// Level 0 holds tasks without predecessors; every task sits one level
/// after its deepest predecessor. Indices refer to `tasks`, each level in
/// input order. Edges touching unknown tasks are ignored. Returns `None`
/// if the graph has a cycle.
pub fn topological_levels(tasks: &[Task], dependencies: &[Dependency]) -> Option<Vec<Vec<usize>>> {
    let index: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; tasks.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];
    for dep in dependencies {
        if let (Some(&p), Some(&s)) = (
            index.get(dep.predecessor_id.as_str()),
            index.get(dep.successor_id.as_str()),
        ) {
            successors[p].push(s);
            in_degree[s] += 1;
        }
    }

    let mut levels = Vec::new();
    let mut current: Vec<usize> = (0..tasks.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut placed = 0;

    while !current.is_empty() {
        placed += current.len();
        let mut next = Vec::new();
        for &i in &current {
            for &s in &successors[i] {
                in_degree[s] -= 1;
                if in_degree[s] == 0 {
                    next.push(s);
                }
            }
        }
        next.sort_unstable();
        levels.push(current);
        current = next;
    }

    (placed == tasks.len()).then_some(levels)
}

/// Flat topological order of task indices; `None` on a cycle.
pub fn topological_order(tasks: &[Task], dependencies: &[Dependency]) -> Option<Vec<usize>> {
    topological_levels(tasks, dependencies).map(|levels| levels.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn d(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 9, 0, 0).unwrap()
    }

    fn make_task(id: &str) -> Task {
        Task::new(id, d(8), d(9))
    }

    fn fs(pred: &str, succ: &str) -> Dependency {
        Dependency::finish_to_start(pred, succ)
    }

    #[test]
    fn test_valid_candidate() {
        let existing = vec![fs("A", "B")];
        let result = validate_dependency(&fs("B", "C"), &existing);
        assert!(result.is_valid);
        assert!(result.errors.is_empty());
        assert!(result.cycle_path.is_none());
    }

    #[test]
    fn test_self_dependency() {
        let result = validate_dependency(&fs("A", "A"), &[]);
        assert!(!result.is_valid);
        assert_eq!(result.errors[0].kind, ValidationErrorKind::SelfDependency);
    }

    #[test]
    fn test_cycle_rejected_with_path() {
        let existing = vec![fs("A", "B"), fs("B", "C")];
        let result = validate_dependency(&fs("C", "A"), &existing);
        assert!(!result.is_valid);
        assert_eq!(result.errors[0].kind, ValidationErrorKind::CyclicDependency);
        assert_eq!(
            result.cycle_path,
            Some(vec!["C".into(), "A".into(), "B".into(), "C".into()])
        );
        assert!(result.errors[0].message.contains("C → A → B → C"));
    }

    #[test]
    fn test_cycle_detected_across_link_types() {
        let existing = vec![
            Dependency::new("d1", "A", "B", DependencyType::StartToStart),
            Dependency::new("d2", "B", "C", DependencyType::FinishToFinish),
        ];
        let candidate = Dependency::new("d3", "C", "A", DependencyType::StartToFinish);
        assert!(!validate_dependency(&candidate, &existing).is_valid);
    }

    #[test]
    fn test_editing_existing_edge_ignores_itself() {
        let existing = vec![fs("A", "B")];
        let edited = fs("A", "B").with_lag(4);
        let result = validate_dependency(&edited, &existing);
        assert!(result.is_valid);
    }

    #[test]
    fn test_duplicate_pair_rejected() {
        let existing = vec![fs("A", "B")];
        let candidate = Dependency::new("other", "A", "B", DependencyType::StartToStart);
        let result = validate_dependency(&candidate, &existing);
        assert!(!result.is_valid);
        assert_eq!(result.errors[0].kind, ValidationErrorKind::DuplicateDependency);
    }

    #[test]
    fn test_negative_lag_warning() {
        let result = validate_dependency(&fs("A", "B").with_lag(-8), &[]);
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_dependency_path() {
        let edges = vec![fs("A", "B"), fs("B", "C"), fs("A", "D"), fs("D", "C")];
        assert_eq!(
            dependency_path("A", "C", &edges),
            Some(vec!["A".into(), "B".into(), "C".into()])
        );
        assert_eq!(dependency_path("C", "A", &edges), None);
        assert_eq!(dependency_path("A", "A", &edges), Some(vec!["A".into()]));
    }

    #[test]
    fn test_validate_input_ok() {
        let tasks = vec![make_task("A"), make_task("B"), make_task("C")];
        let deps = vec![fs("A", "B"), fs("B", "C")];
        assert!(validate_input(&tasks, &deps).is_ok());
    }

    #[test]
    fn test_duplicate_task_id() {
        let tasks = vec![make_task("A"), make_task("A")];
        let errors = validate_input(&tasks, &[]).unwrap_err();
        assert!(errors.has(ValidationErrorKind::DuplicateId));
    }

    #[test]
    fn test_unknown_task_reference() {
        let tasks = vec![make_task("A")];
        let errors = validate_input(&tasks, &[fs("A", "GHOST")]).unwrap_err();
        assert!(errors.has(ValidationErrorKind::UnknownTask));
    }

    #[test]
    fn test_invalid_dates_and_progress() {
        let mut bad = Task::new("A", d(10), d(8));
        bad.progress = 120;
        let errors = validate_input(&[bad], &[]).unwrap_err();
        assert!(errors.has(ValidationErrorKind::InvalidDateRange));
        assert!(errors.has(ValidationErrorKind::InvalidProgress));
    }

    #[test]
    fn test_cyclic_dependency() {
        let tasks = vec![make_task("A"), make_task("B"), make_task("C")];
        let deps = vec![fs("A", "B"), fs("B", "C"), fs("C", "A")];
        let errors = validate_input(&tasks, &deps).unwrap_err();
        assert!(errors.has(ValidationErrorKind::CyclicDependency));
        assert_eq!(
            detect_cycles(&deps),
            Some(vec!["A".into(), "B".into(), "C".into(), "A".into()])
        );
    }

    #[test]
    fn test_deep_chain_stays_off_call_stack() {
        let n = 100_000;
        let ids: Vec<String> = (0..n).map(|i| format!("T{i:06}")).collect();
        let mut deps: Vec<Dependency> = ids.windows(2).map(|w| fs(&w[0], &w[1])).collect();
        let tasks: Vec<Task> = ids.iter().map(|id| make_task(id)).collect();

        assert_eq!(detect_cycles(&deps), None);
        assert!(validate_input(&tasks, &deps).is_ok());

        deps.push(fs(&ids[n - 1], &ids[0]));
        let cycle = detect_cycles(&deps).unwrap();
        assert_eq!(cycle.len(), n + 1);
        assert_eq!(cycle.first(), cycle.last());
    }

    #[test]
    fn test_multiple_errors() {
        let tasks = vec![make_task("A")];
        let deps = vec![fs("A", "A"), fs("A", "X")];
        let errors = validate_input(&tasks, &deps).unwrap_err();
        assert!(errors.0.len() >= 2);
        assert!(errors.to_string().contains("cannot depend on itself"));
    }

    #[test]
    fn test_topological_levels() {
        let tasks = vec![make_task("C"), make_task("A"), make_task("B"), make_task("D")];
        let deps = vec![fs("A", "B"), fs("B", "C"), fs("A", "C")];
        let levels = topological_levels(&tasks, &deps).unwrap();
        // A and D first (input order), then B, then C.
        assert_eq!(levels, vec![vec![1, 3], vec![2], vec![0]]);
        assert_eq!(topological_order(&tasks, &deps), Some(vec![1, 3, 2, 0]));
    }

    #[test]
    fn test_topological_levels_cycle() {
        let tasks = vec![make_task("A"), make_task("B")];
        let deps = vec![fs("A", "B"), fs("B", "A")];
        assert!(topological_levels(&tasks, &deps).is_none());
    }

    #[test]
    fn test_random_graphs_never_admit_cycles() {
        let mut rng = SmallRng::seed_from_u64(42);
        for _ in 0..50 {
            let n = rng.random_range(3..12);
            let ids: Vec<String> = (0..n).map(|i| format!("T{i}")).collect();
            let mut edges: Vec<Dependency> = Vec::new();

            for _ in 0..n * 2 {
                let u = rng.random_range(0..n);
                let v = rng.random_range(0..n);
                let candidate = fs(&ids[u], &ids[v]);
                if edges.iter().any(|e| e.id == candidate.id) {
                    continue;
                }
                let reachable = dependency_path(&ids[v], &ids[u], &edges).is_some();
                let result = validate_dependency(&candidate, &edges);

                if u != v && reachable {
                    assert!(!result.is_valid);
                    assert!(result.cycle_path.is_some());
                }
                if result.is_valid {
                    edges.push(candidate);
                    assert!(detect_cycles(&edges).is_none());
                }
            }

            let tasks: Vec<Task> = ids.iter().map(|id| make_task(id)).collect();
            assert!(validate_input(&tasks, &edges).is_ok());
        }
    }
}
