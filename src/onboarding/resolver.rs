//! Task dependency resolver.
//!
//! Answers "may this task run?" for one task of one onboarding instance, given
//! the statuses of its siblings. Pure: no I/O, no clock, same answer for the
//! same snapshot.

use std::collections::HashMap;

use uuid::Uuid;

use super::graph::DependencyGraph;
use super::model::{TaskInstance, TaskStatus};

/// Sibling statuses of one instance, keyed by task template id.
pub type StatusSnapshot = HashMap<Uuid, TaskStatus>;

/// Build a snapshot from the task instances of one onboarding instance.
pub fn snapshot(tasks: &[TaskInstance]) -> StatusSnapshot {
    tasks
        .iter()
        .map(|t| (t.task_template_id, t.status))
        .collect()
}

/// Outcome of resolving one task's dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Eligibility {
    /// Dependencies (task template ids) that are not completed, in declaration order.
    pub unmet: Vec<Uuid>,
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        self.unmet.is_empty()
    }

    /// Human-readable names of the unmet dependencies.
    pub fn unmet_names(&self, graph: &DependencyGraph) -> Vec<String> {
        self.unmet
            .iter()
            .map(|id| {
                graph
                    .name_of(*id)
                    .map(str::to_string)
                    .unwrap_or_else(|| id.to_string())
            })
            .collect()
    }
}

/// Resolve a dependency list against a status snapshot.
///
/// A dependency counts as met only when its sibling task is `completed`; a
/// dependency with no sibling at all is unmet.
pub fn resolve(dependencies: &[Uuid], statuses: &StatusSnapshot) -> Eligibility {
    let mut unmet = Vec::new();
    for dep in dependencies {
        if statuses.get(dep) != Some(&TaskStatus::Completed) && !unmet.contains(dep) {
            unmet.push(*dep);
        }
    }
    Eligibility { unmet }
}

/// Status a task should hold when nothing has been done on it yet.
pub fn resting_status(eligibility: &Eligibility) -> TaskStatus {
    if eligibility.is_eligible() {
        TaskStatus::NotStarted
    } else {
        TaskStatus::Blocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn no_dependencies_is_never_blocked() {
        let statuses = StatusSnapshot::new();
        let result = resolve(&[], &statuses);
        assert!(result.is_eligible());
        assert_eq!(resting_status(&result), TaskStatus::NotStarted);
    }

    #[test]
    fn in_progress_is_not_good_enough() {
        let d = ids(2);
        let statuses: StatusSnapshot = [
            (d[0], TaskStatus::Completed),
            (d[1], TaskStatus::InProgress),
        ]
        .into_iter()
        .collect();
        let result = resolve(&d, &statuses);
        assert_eq!(result.unmet, vec![d[1]]);
        assert_eq!(resting_status(&result), TaskStatus::Blocked);
    }

    #[test]
    fn missing_sibling_counts_as_unmet() {
        let d = ids(1);
        let result = resolve(&d, &StatusSnapshot::new());
        assert_eq!(result.unmet, d);
    }

    #[test]
    fn duplicate_dependencies_are_reported_once() {
        let d = ids(1);
        let result = resolve(&[d[0], d[0]], &StatusSnapshot::new());
        assert_eq!(result.unmet.len(), 1);
    }

    #[test]
    fn all_completed_is_eligible() {
        let d = ids(3);
        let statuses: StatusSnapshot = d.iter().map(|id| (*id, TaskStatus::Completed)).collect();
        assert!(resolve(&d, &statuses).is_eligible());
    }
}
