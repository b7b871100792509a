//! In-memory task dependency graph.
//!
//! Built once per operation from the task templates in play, so the cascade
//! never has to ask the database "who depends on X" row by row.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use uuid::Uuid;

use super::resolver::{self, Eligibility, StatusSnapshot};
use crate::templates::model::TaskTemplate;

#[derive(Debug, Clone)]
struct Node {
    name: String,
    depends_on: Vec<Uuid>,
}

/// Dependency adjacency over task template ids.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<Uuid, Node>,
    /// dependency id -> ids of templates that declare it
    dependents: HashMap<Uuid, Vec<Uuid>>,
}

impl DependencyGraph {
    pub fn from_templates<'a, I>(templates: I) -> Self
    where
        I: IntoIterator<Item = &'a TaskTemplate>,
    {
        let mut graph = Self::default();
        for template in templates {
            graph.insert(template.id, &template.name, &template.depends_on);
        }
        graph
    }

    /// Add or replace one node.
    pub fn insert(&mut self, id: Uuid, name: &str, depends_on: &[Uuid]) {
        if let Some(previous) = self.nodes.remove(&id) {
            for dep in previous.depends_on {
                if let Some(list) = self.dependents.get_mut(&dep) {
                    list.retain(|d| *d != id);
                }
            }
        }
        let mut deps: Vec<Uuid> = Vec::with_capacity(depends_on.len());
        for dep in depends_on {
            if !deps.contains(dep) {
                deps.push(*dep);
            }
        }
        for dep in &deps {
            let list = self.dependents.entry(*dep).or_default();
            if !list.contains(&id) {
                list.push(id);
            }
        }
        self.nodes.insert(
            id,
            Node {
                name: name.to_string(),
                depends_on: deps,
            },
        );
    }

    pub fn name_of(&self, id: Uuid) -> Option<&str> {
        self.nodes.get(&id).map(|n| n.name.as_str())
    }

    pub fn dependencies_of(&self, id: Uuid) -> &[Uuid] {
        self.nodes
            .get(&id)
            .map(|n| n.depends_on.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents only; not the transitive closure.
    pub fn dependents_of(&self, id: Uuid) -> &[Uuid] {
        self.dependents
            .get(&id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Run the resolver for one node against a status snapshot.
    pub fn eligibility(&self, id: Uuid, statuses: &StatusSnapshot) -> Eligibility {
        resolver::resolve(self.dependencies_of(id), statuses)
    }

    /// Returns the name of a node on a dependency cycle, if any.
    pub fn find_cycle(&self) -> Option<String> {
        let mut g: DiGraphMap<Uuid, ()> = DiGraphMap::new();
        for (id, node) in &self.nodes {
            g.add_node(*id);
            for dep in &node.depends_on {
                g.add_edge(*dep, *id, ());
            }
        }
        match toposort(&g, None) {
            Ok(_) => None,
            Err(cycle) => {
                let id = cycle.node_id();
                Some(
                    self.name_of(id)
                        .map(str::to_string)
                        .unwrap_or_else(|| id.to_string()),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onboarding::model::TaskStatus;
    use crate::templates::model::TaskConfig;

    fn template(name: &str, deps: &[Uuid]) -> TaskTemplate {
        TaskTemplate::new(name, TaskConfig::Manual).depending_on(deps.iter().copied())
    }

    #[test]
    fn dependents_are_indexed_by_dependency() {
        let a = template("A", &[]);
        let b = template("B", &[a.id]);
        let c = template("C", &[a.id, b.id]);
        let graph = DependencyGraph::from_templates([&a, &b, &c]);

        assert_eq!(graph.dependents_of(a.id), &[b.id, c.id]);
        assert_eq!(graph.dependents_of(b.id), &[c.id]);
        assert!(graph.dependents_of(c.id).is_empty());
        assert_eq!(graph.dependencies_of(c.id), &[a.id, b.id]);
        assert_eq!(graph.name_of(b.id), Some("B"));
    }

    #[test]
    fn insert_replaces_previous_edges() {
        let a = template("A", &[]);
        let b = template("B", &[a.id]);
        let mut graph = DependencyGraph::from_templates([&a, &b]);
        graph.insert(b.id, "B", &[]);
        assert!(graph.dependents_of(a.id).is_empty());
        assert!(graph.dependencies_of(b.id).is_empty());
    }

    #[test]
    fn detects_cycles() {
        let a_id = Uuid::new_v4();
        let b_id = Uuid::new_v4();
        let mut graph = DependencyGraph::default();
        graph.insert(a_id, "A", &[b_id]);
        assert!(graph.find_cycle().is_none());
        graph.insert(b_id, "B", &[a_id]);
        let name = graph.find_cycle().unwrap();
        assert!(name == "A" || name == "B");
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let id = Uuid::new_v4();
        let mut graph = DependencyGraph::default();
        graph.insert(id, "Loop", &[id]);
        assert_eq!(graph.find_cycle().as_deref(), Some("Loop"));
    }

    #[test]
    fn eligibility_reports_names() {
        let a = template("Badge", &[]);
        let b = template("Laptop", &[a.id]);
        let graph = DependencyGraph::from_templates([&a, &b]);
        let statuses: StatusSnapshot = [(a.id, TaskStatus::InProgress)].into_iter().collect();
        let result = graph.eligibility(b.id, &statuses);
        assert_eq!(result.unmet_names(&graph), vec!["Badge".to_string()]);
    }
}
