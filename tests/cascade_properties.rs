use chrono::Utc;
use proptest::prelude::*;
use uuid::Uuid;

use onboard_flow::onboarding::cascade::{TaskChange, plan_transition};
use onboard_flow::onboarding::graph::DependencyGraph;
use onboard_flow::onboarding::model::{TaskInstance, TaskStatus, TaskStatusUpdate};
use onboard_flow::onboarding::resolver;
use onboard_flow::templates::model::{TaskConfig, TaskTemplate};

const STATUSES: [TaskStatus; 4] = [
    TaskStatus::NotStarted,
    TaskStatus::Blocked,
    TaskStatus::InProgress,
    TaskStatus::Completed,
];

/// Templates where task `i` depends on a subset of tasks `0..i`, chosen by
/// the bits of `masks[i]`.
fn dag(masks: &[u16]) -> Vec<TaskTemplate> {
    let mut templates: Vec<TaskTemplate> = Vec::new();
    for (i, mask) in masks.iter().enumerate() {
        let deps: Vec<Uuid> = (0..i)
            .filter(|j| mask & (1 << j) != 0)
            .map(|j| templates[j].id)
            .collect();
        templates.push(TaskTemplate::new(format!("T{i}"), TaskConfig::Manual).depending_on(deps));
    }
    templates
}

fn fresh_instance(templates: &[TaskTemplate]) -> Vec<TaskInstance> {
    let instance_id = Uuid::new_v4();
    templates
        .iter()
        .map(|t| {
            let status = if t.depends_on.is_empty() {
                TaskStatus::NotStarted
            } else {
                TaskStatus::Blocked
            };
            TaskInstance::new(instance_id, t.id, status)
        })
        .collect()
}

fn assert_blocked_iff_unmet(graph: &DependencyGraph, tasks: &[TaskInstance]) {
    let statuses = resolver::snapshot(tasks);
    for task in tasks {
        let eligible = graph.eligibility(task.task_template_id, &statuses).is_eligible();
        assert_eq!(
            task.status == TaskStatus::Blocked,
            !eligible,
            "{} is {} while eligible={eligible}",
            graph.name_of(task.task_template_id).unwrap_or("?"),
            task.status
        );
    }
}

fn apply(tasks: &mut [TaskInstance], written: impl IntoIterator<Item = TaskInstance>) {
    for row in written {
        if let Some(slot) = tasks.iter_mut().find(|t| t.id == row.id) {
            *slot = row;
        }
    }
}

proptest! {
    #[test]
    fn prop_blocked_iff_dependencies_unmet(
        masks in proptest::collection::vec(any::<u16>(), 1..10),
        steps in proptest::collection::vec((0..10usize, 0..5usize), 0..60)
    ) {
        let templates = dag(&masks);
        let graph = DependencyGraph::from_templates(&templates);
        let mut tasks = fresh_instance(&templates);
        assert_blocked_iff_unmet(&graph, &tasks);

        for (index, action) in steps {
            let task_id = tasks[index % tasks.len()].id;
            let change = match action {
                4 => TaskChange::Unassign,
                n => TaskChange::Status(TaskStatusUpdate::to(STATUSES[n])),
            };
            if let Ok(plan) = plan_transition(&graph, &tasks, task_id, &change, Utc::now()) {
                let effects = plan.effects.into_iter().map(|e| e.task);
                apply(&mut tasks, std::iter::once(plan.task).chain(effects));
            }
            assert_blocked_iff_unmet(&graph, &tasks);
        }
    }

    #[test]
    fn prop_completing_twice_changes_nothing_more(
        masks in proptest::collection::vec(any::<u16>(), 1..10),
        order in proptest::collection::vec(0..10usize, 1..30)
    ) {
        let templates = dag(&masks);
        let graph = DependencyGraph::from_templates(&templates);
        let mut tasks = fresh_instance(&templates);
        let complete = TaskChange::Status(TaskStatusUpdate::to(TaskStatus::Completed));

        for index in order {
            let task_id = tasks[index % tasks.len()].id;
            if let Ok(plan) = plan_transition(&graph, &tasks, task_id, &complete, Utc::now()) {
                let effects = plan.effects.into_iter().map(|e| e.task);
                apply(&mut tasks, std::iter::once(plan.task).chain(effects));

                let again = plan_transition(&graph, &tasks, task_id, &complete, Utc::now());
                let again = again.expect("completing a completed task succeeds");
                prop_assert!(again.effects.is_empty());
                prop_assert_eq!(again.task.status, TaskStatus::Completed);
            }
        }
    }
}

#[test]
fn completing_everything_in_template_order_always_succeeds() {
    let templates = dag(&[0, 0b1, 0b11, 0b100, 0b1010]);
    let graph = DependencyGraph::from_templates(&templates);
    let mut tasks = fresh_instance(&templates);
    let complete = TaskChange::Status(TaskStatusUpdate::to(TaskStatus::Completed));

    for i in 0..tasks.len() {
        let plan = plan_transition(&graph, &tasks, tasks[i].id, &complete, Utc::now()).unwrap();
        let effects = plan.effects.into_iter().map(|e| e.task);
        apply(&mut tasks, std::iter::once(plan.task).chain(effects));
        assert_blocked_iff_unmet(&graph, &tasks);
    }
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));
}
