//! Status transitions and their cascade onto dependent tasks.
//!
//! Everything here is pure: the planner gets the fresh sibling rows of one
//! instance plus the dependency graph and returns the rows to write. The engine
//! owns the transaction around it.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::graph::DependencyGraph;
use super::model::{TaskInstance, TaskStatus, TaskStatusUpdate};
use super::resolver::{self, StatusSnapshot};
use crate::error::EngineError;
use crate::integration::is_issue_key;

/// A requested change to one task instance.
#[derive(Debug, Clone)]
pub enum TaskChange {
    /// Direct status write from `PUT /tasks/{id}`.
    Status(TaskStatusUpdate),
    /// The ticketing system accepted a request created for this task.
    TicketCreated { issue_key: String, ticket_info: Value },
    /// An existing ticket was linked by hand.
    Associate { issue_key: String, ticket_info: Value },
    /// Drop ticket and progress data and put the task back at rest.
    Unassign,
}

/// A sibling whose status is moved by the cascade.
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeEffect {
    pub from: TaskStatus,
    /// Row as it must be written.
    pub task: TaskInstance,
}

/// Everything one transition writes.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionPlan {
    pub previous: TaskStatus,
    pub task: TaskInstance,
    pub effects: Vec<CascadeEffect>,
}

/// Plan a change to `task_id`, given every task instance of its onboarding
/// instance as currently stored.
pub fn plan_transition(
    graph: &DependencyGraph,
    siblings: &[TaskInstance],
    task_id: Uuid,
    change: &TaskChange,
    now: DateTime<Utc>,
) -> Result<TransitionPlan, EngineError> {
    let current = siblings
        .iter()
        .find(|t| t.id == task_id)
        .ok_or_else(|| EngineError::not_found("task", task_id))?;

    if let (TaskChange::TicketCreated { issue_key, .. }, Some(existing)) = (change, &current.issue_key) {
        return Err(EngineError::validation(format!(
            "task {task_id} already tracks ticket {existing}; {issue_key} was not recorded"
        )));
    }

    let statuses = resolver::snapshot(siblings);
    let eligibility = graph.eligibility(current.task_template_id, &statuses);

    let target = match change {
        TaskChange::Status(update) => update.status,
        TaskChange::TicketCreated { .. } => TaskStatus::InProgress,
        TaskChange::Associate { .. } if current.status == TaskStatus::Completed => {
            TaskStatus::Completed
        }
        TaskChange::Associate { .. } => TaskStatus::InProgress,
        TaskChange::Unassign => resolver::resting_status(&eligibility),
    };

    if target == TaskStatus::Blocked && eligibility.is_eligible() {
        return Err(EngineError::validation(format!(
            "task {task_id} has no unmet dependencies and cannot be blocked"
        )));
    }
    if target != TaskStatus::Blocked && !eligibility.is_eligible() {
        return Err(EngineError::validation(format!(
            "task {task_id} is blocked by: {}",
            eligibility.unmet_names(graph).join(", ")
        )));
    }

    let task = apply_change(current, change, target, now);
    let effects = cascade(graph, siblings, current.task_template_id, current.status, target, now);

    Ok(TransitionPlan {
        previous: current.status,
        task,
        effects,
    })
}

/// Field rules for the changed row itself.
fn apply_change(
    current: &TaskInstance,
    change: &TaskChange,
    target: TaskStatus,
    now: DateTime<Utc>,
) -> TaskInstance {
    let mut next = current.clone();
    next.status = target;
    next.updated_at = now;

    match change {
        TaskChange::Status(update) => {
            if target == TaskStatus::InProgress && next.task_started_at.is_none() {
                next.task_started_at = Some(now);
            }
            if let Some(info) = &update.ticket_info {
                next.issue_key = match info {
                    Some(value) => issue_key_of(value).or(next.issue_key),
                    None => None,
                };
                next.ticket_info = info.clone();
            }
            if let Some(at) = update.ticket_created_at {
                next.ticket_created_at = Some(at);
            }
            if let Some(at) = update.ticket_closed_at {
                next.ticket_closed_at = Some(at);
            }
            if target == TaskStatus::Completed {
                next.task_completed_at = Some(now);
            }
        }
        TaskChange::TicketCreated {
            issue_key,
            ticket_info,
        } => {
            next.issue_key = Some(issue_key.clone());
            next.ticket_info = Some(ticket_info.clone());
            next.ticket_created_at = Some(now);
            next.task_started_at = Some(now);
        }
        TaskChange::Associate {
            issue_key,
            ticket_info,
        } => {
            next.issue_key = Some(issue_key.clone());
            next.ticket_info = Some(ticket_info.clone());
            next.ticket_created_at.get_or_insert(now);
            if target == TaskStatus::InProgress {
                next.task_started_at.get_or_insert(now);
            }
        }
        TaskChange::Unassign => {
            next.ticket_info = None;
            next.issue_key = None;
            next.task_started_at = None;
            next.task_completed_at = None;
            next.ticket_created_at = None;
            next.ticket_closed_at = None;
        }
    }
    next
}

/// `issueKey` or `key` from a ticket payload, if it is a well-formed key.
pub fn issue_key_of(ticket_info: &Value) -> Option<String> {
    ticket_info
        .get("issueKey")
        .or_else(|| ticket_info.get("key"))
        .and_then(Value::as_str)
        .filter(|key| is_issue_key(key))
        .map(str::to_string)
}

fn cascade(
    graph: &DependencyGraph,
    siblings: &[TaskInstance],
    changed_template: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    now: DateTime<Utc>,
) -> Vec<CascadeEffect> {
    let by_template: HashMap<Uuid, &TaskInstance> =
        siblings.iter().map(|t| (t.task_template_id, t)).collect();

    if to == TaskStatus::Completed && from != TaskStatus::Completed {
        let mut statuses: StatusSnapshot = resolver::snapshot(siblings);
        statuses.insert(changed_template, TaskStatus::Completed);
        return unblock_dependents(graph, &by_template, &statuses, changed_template, now);
    }
    if from == TaskStatus::Completed && to != TaskStatus::Completed {
        return reblock_dependents(graph, &by_template, changed_template, now);
    }
    Vec::new()
}

/// Forward cascade: blocked dependents whose dependencies are now all
/// completed move to `not_started`. Nothing they unblock is completed, so
/// the walk stops at the first level.
fn unblock_dependents(
    graph: &DependencyGraph,
    by_template: &HashMap<Uuid, &TaskInstance>,
    statuses: &StatusSnapshot,
    completed_template: Uuid,
    now: DateTime<Utc>,
) -> Vec<CascadeEffect> {
    let mut effects = Vec::new();
    for dependent in graph.dependents_of(completed_template) {
        let Some(sibling) = by_template.get(dependent) else {
            continue;
        };
        if sibling.status != TaskStatus::Blocked {
            continue;
        }
        if graph.eligibility(*dependent, statuses).is_eligible() {
            effects.push(moved(sibling, TaskStatus::NotStarted, now));
        }
    }
    effects
}

/// Backward cascade: every dependent not already blocked becomes blocked.
/// A dependent that was itself completed no longer satisfies its own
/// dependents, so the walk continues through it.
fn reblock_dependents(
    graph: &DependencyGraph,
    by_template: &HashMap<Uuid, &TaskInstance>,
    reverted_template: Uuid,
    now: DateTime<Utc>,
) -> Vec<CascadeEffect> {
    let mut effects = Vec::new();
    let mut visited: HashSet<Uuid> = HashSet::from([reverted_template]);
    let mut queue = vec![reverted_template];

    while let Some(template) = queue.pop() {
        for dependent in graph.dependents_of(template) {
            if !visited.insert(*dependent) {
                continue;
            }
            let Some(sibling) = by_template.get(dependent) else {
                continue;
            };
            if sibling.status == TaskStatus::Blocked {
                continue;
            }
            if sibling.status == TaskStatus::Completed {
                queue.push(*dependent);
            }
            effects.push(moved(sibling, TaskStatus::Blocked, now));
        }
    }
    effects
}

fn moved(sibling: &TaskInstance, to: TaskStatus, now: DateTime<Utc>) -> CascadeEffect {
    let mut task = sibling.clone();
    task.status = to;
    task.updated_at = now;
    CascadeEffect {
        from: sibling.status,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::model::{TaskConfig, TaskTemplate};

    struct Fixture {
        graph: DependencyGraph,
        templates: Vec<TaskTemplate>,
        tasks: Vec<TaskInstance>,
    }

    impl Fixture {
        /// Templates given as dependency index lists; initial statuses from the resolver.
        fn new(deps: &[&[usize]]) -> Self {
            let mut templates: Vec<TaskTemplate> = Vec::new();
            for (i, d) in deps.iter().enumerate() {
                let ids: Vec<Uuid> = d.iter().map(|j| templates[*j].id).collect();
                templates.push(
                    TaskTemplate::new(format!("T{i}"), TaskConfig::Manual).depending_on(ids),
                );
            }
            let graph = DependencyGraph::from_templates(&templates);
            let instance_id = Uuid::new_v4();
            let tasks = templates
                .iter()
                .map(|t| {
                    let status = if t.depends_on.is_empty() {
                        TaskStatus::NotStarted
                    } else {
                        TaskStatus::Blocked
                    };
                    TaskInstance::new(instance_id, t.id, status)
                })
                .collect();
            Self {
                graph,
                templates,
                tasks,
            }
        }

        fn apply(&mut self, index: usize, change: TaskChange) -> Result<TransitionPlan, EngineError> {
            let plan = plan_transition(&self.graph, &self.tasks, self.tasks[index].id, &change, Utc::now())?;
            let mut rows = vec![plan.task.clone()];
            rows.extend(plan.effects.iter().map(|e| e.task.clone()));
            for row in rows {
                if let Some(slot) = self.tasks.iter_mut().find(|t| t.id == row.id) {
                    *slot = row;
                }
            }
            Ok(plan)
        }

        fn set(&mut self, index: usize, status: TaskStatus) -> Result<TransitionPlan, EngineError> {
            self.apply(index, TaskChange::Status(TaskStatusUpdate::to(status)))
        }

        fn statuses(&self) -> Vec<TaskStatus> {
            self.tasks.iter().map(|t| t.status).collect()
        }
    }

    use TaskStatus::*;

    #[test]
    fn completing_a_task_unblocks_only_ready_dependents() {
        // A, B(A), C(A, B)
        let mut f = Fixture::new(&[&[], &[0], &[0, 1]]);
        let plan = f.set(0, Completed).unwrap();
        assert_eq!(plan.effects.len(), 1);
        assert_eq!(f.statuses(), vec![Completed, NotStarted, Blocked]);

        f.set(1, Completed).unwrap();
        assert_eq!(f.statuses(), vec![Completed, Completed, NotStarted]);
    }

    #[test]
    fn reverting_reblocks_transitively() {
        let mut f = Fixture::new(&[&[], &[0], &[0, 1]]);
        f.set(0, Completed).unwrap();
        f.set(1, Completed).unwrap();
        let plan = f.set(0, InProgress).unwrap();
        assert_eq!(plan.previous, Completed);
        assert_eq!(f.statuses(), vec![InProgress, Blocked, Blocked]);
    }

    #[test]
    fn reblocking_walks_through_completed_chain() {
        // A -> B -> C chain, all completed, then A reverts.
        let mut f = Fixture::new(&[&[], &[0], &[1]]);
        f.set(0, Completed).unwrap();
        f.set(1, Completed).unwrap();
        f.set(2, Completed).unwrap();
        let plan = f.set(0, NotStarted).unwrap();
        assert_eq!(plan.effects.len(), 2);
        assert_eq!(f.statuses(), vec![NotStarted, Blocked, Blocked]);
    }

    #[test]
    fn completing_twice_has_no_further_effects() {
        let mut f = Fixture::new(&[&[], &[0]]);
        f.set(0, Completed).unwrap();
        let first_completed_at = f.tasks[0].task_completed_at;
        let again = f.set(0, Completed).unwrap();
        assert!(again.effects.is_empty());
        assert_eq!(f.statuses(), vec![Completed, NotStarted]);
        assert!(f.tasks[0].task_completed_at >= first_completed_at);
    }

    #[test]
    fn revert_restores_previous_statuses() {
        let mut f = Fixture::new(&[&[], &[0], &[0], &[1, 2]]);
        f.set(0, InProgress).unwrap();
        let before = f.statuses();
        f.set(0, Completed).unwrap();
        assert_ne!(f.statuses(), before);
        f.set(0, InProgress).unwrap();
        assert_eq!(f.statuses(), before);
    }

    #[test]
    fn blocked_task_cannot_start() {
        let mut f = Fixture::new(&[&[], &[0]]);
        let err = f.set(1, InProgress).unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailure(ref m) if m.contains("T0")));
        assert_eq!(f.statuses(), vec![NotStarted, Blocked]);
    }

    #[test]
    fn eligible_task_cannot_be_blocked() {
        let mut f = Fixture::new(&[&[]]);
        assert!(matches!(
            f.set(0, Blocked),
            Err(EngineError::ValidationFailure(_))
        ));
    }

    #[test]
    fn started_at_is_set_once() {
        let mut f = Fixture::new(&[&[]]);
        f.set(0, InProgress).unwrap();
        let started = f.tasks[0].task_started_at;
        assert!(started.is_some());
        f.set(0, NotStarted).unwrap();
        f.set(0, InProgress).unwrap();
        assert_eq!(f.tasks[0].task_started_at, started);
    }

    #[test]
    fn ticket_info_is_tri_state() {
        let mut f = Fixture::new(&[&[]]);
        let mut update = TaskStatusUpdate::to(InProgress);
        update.ticket_info = Some(Some(serde_json::json!({"issueKey": "IT-1"})));
        f.apply(0, TaskChange::Status(update)).unwrap();
        assert_eq!(f.tasks[0].issue_key.as_deref(), Some("IT-1"));

        f.set(0, InProgress).unwrap();
        assert!(f.tasks[0].ticket_info.is_some());

        let mut clear = TaskStatusUpdate::to(InProgress);
        clear.ticket_info = Some(None);
        f.apply(0, TaskChange::Status(clear)).unwrap();
        assert!(f.tasks[0].ticket_info.is_none());
        assert!(f.tasks[0].issue_key.is_none());
    }

    #[test]
    fn unassign_resets_to_resting_status_and_reblocks() {
        let mut f = Fixture::new(&[&[], &[0]]);
        f.apply(
            0,
            TaskChange::TicketCreated {
                issue_key: "IT-9".into(),
                ticket_info: serde_json::json!({"issueKey": "IT-9"}),
            },
        )
        .unwrap();
        f.set(0, Completed).unwrap();
        assert_eq!(f.statuses(), vec![Completed, NotStarted]);

        f.apply(0, TaskChange::Unassign).unwrap();
        assert_eq!(f.statuses(), vec![NotStarted, Blocked]);
        let task = &f.tasks[0];
        assert!(task.issue_key.is_none());
        assert!(task.ticket_info.is_none());
        assert!(task.task_started_at.is_none());
        assert!(task.task_completed_at.is_none());
        assert!(task.ticket_created_at.is_none());
    }

    #[test]
    fn associate_keeps_completed_tasks_completed() {
        let mut f = Fixture::new(&[&[], &[0]]);
        f.set(0, Completed).unwrap();
        let plan = f
            .apply(
                0,
                TaskChange::Associate {
                    issue_key: "HR-3".into(),
                    ticket_info: serde_json::json!({"issueKey": "HR-3"}),
                },
            )
            .unwrap();
        assert!(plan.effects.is_empty());
        assert_eq!(f.statuses(), vec![Completed, NotStarted]);
        assert!(f.tasks[0].ticket_created_at.is_some());
    }

    #[test]
    fn only_well_formed_issue_keys_are_extracted() {
        use serde_json::json;
        assert_eq!(issue_key_of(&json!({"issueKey": "IT-12"})).as_deref(), Some("IT-12"));
        assert_eq!(issue_key_of(&json!({"key": "OPS_2-9"})).as_deref(), Some("OPS_2-9"));
        for bad in ["../../servicedesk/1/customer?x=", "it-1", "IT-", "IT-1?x"] {
            assert_eq!(issue_key_of(&json!({ "issueKey": bad })), None, "{bad}");
        }
    }

    #[test]
    fn unknown_task_is_not_found() {
        let f = Fixture::new(&[&[]]);
        let err = plan_transition(
            &f.graph,
            &f.tasks,
            Uuid::new_v4(),
            &TaskChange::Unassign,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
        assert_eq!(f.templates.len(), 1);
    }
}
