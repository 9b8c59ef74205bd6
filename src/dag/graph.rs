use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::dag::task::Task;
use crate::errors::{EngineError, Result};
use crate::types::TaskName;

/// Internal node structure: stores immediate deps and dependents.
#[derive(Debug, Clone, Default)]
struct DependencyNode {
    deps: Vec<TaskName>,
    dependents: Vec<TaskName>,
}

/// Forward and reverse dependency index over the tasks of a [`Graph`].
#[derive(Debug, Clone, Default)]
pub struct TaskDependencies {
    nodes: HashMap<TaskName, DependencyNode>,
}

impl TaskDependencies {
    pub(crate) fn from_tasks<'a>(tasks: impl Iterator<Item = &'a Task>) -> Self {
        let mut nodes: HashMap<TaskName, DependencyNode> = HashMap::new();

        for task in tasks {
            nodes.entry(task.name.clone()).or_default().deps = task.dependencies.clone();
        }

        let names: Vec<TaskName> = nodes.keys().cloned().collect();
        for name in names {
            let deps = nodes.get(&name).map(|n| n.deps.clone()).unwrap_or_default();
            for dep in deps {
                if let Some(dep_node) = nodes.get_mut(&dep) {
                    dep_node.dependents.push(name.clone());
                }
            }
        }

        Self { nodes }
    }

    /// Immediate dependencies of `target`.
    pub fn what_target_depends_on(&self, target: &str) -> &[TaskName] {
        self.nodes
            .get(target)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents of `target`.
    pub fn what_depends_on_target(&self, target: &str) -> &[TaskName] {
        self.nodes
            .get(target)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Every task `target` transitively depends on.
    pub fn what_target_depends_on_recursive(&self, target: &str) -> BTreeSet<TaskName> {
        self.walk(target, |name| self.what_target_depends_on(name))
    }

    /// Every task that transitively depends on `target`.
    pub fn what_depends_on_target_recursive(&self, target: &str) -> BTreeSet<TaskName> {
        self.walk(target, |name| self.what_depends_on_target(name))
    }

    fn walk<'a>(
        &'a self,
        root: &str,
        next: impl Fn(&str) -> &'a [TaskName],
    ) -> BTreeSet<TaskName> {
        let mut visited = BTreeSet::new();
        let mut stack: Vec<&TaskName> = next(root).iter().collect();

        while let Some(name) = stack.pop() {
            if visited.insert(name.clone()) {
                stack.extend(next(name.as_str()));
            }
        }

        visited
    }
}

/// Immutable build graph handed to one graph execution.
#[derive(Debug, Clone)]
pub struct Graph {
    tasks: BTreeMap<TaskName, Arc<Task>>,
    dependencies: TaskDependencies,
}

impl Graph {
    /// Build a graph, rejecting duplicate names, unknown or self
    /// dependencies, and cycles.
    pub fn new(tasks: impl IntoIterator<Item = Task>) -> Result<Self> {
        let mut map: BTreeMap<TaskName, Arc<Task>> = BTreeMap::new();
        for task in tasks {
            if map.contains_key(&task.name) {
                return Err(EngineError::ConfigError(format!(
                    "task '{}' is defined more than once",
                    task.name
                )));
            }
            map.insert(task.name.clone(), Arc::new(dedup_dependencies(task)));
        }

        check_dependencies(
            map.iter()
                .map(|(name, task)| (name.as_str(), task.dependencies.as_slice())),
        )?;

        let dependencies = TaskDependencies::from_tasks(map.values().map(|t| t.as_ref()));
        Ok(Self {
            tasks: map,
            dependencies,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn task(&self, name: &str) -> Option<&Arc<Task>> {
        self.tasks.get(name)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.tasks.values()
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(|s| s.as_str())
    }

    pub fn dependencies(&self) -> &TaskDependencies {
        &self.dependencies
    }
}

/// Drop repeated entries from `task.dependencies`, keeping first occurrences.
fn dedup_dependencies(mut task: Task) -> Task {
    let mut seen = HashSet::new();
    task.dependencies.retain(|dep| seen.insert(dep.clone()));
    task
}

/// Reject unknown or self dependencies and cycles.
///
/// `edges` yields each task name with its direct dependencies.
pub fn check_dependencies<'a>(
    edges: impl IntoIterator<Item = (&'a str, &'a [TaskName])> + Clone,
) -> Result<()> {
    let names: HashSet<&str> = edges.clone().into_iter().map(|(name, _)| name).collect();

    // Edge direction: dep -> task.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for name in &names {
        graph.add_node(*name);
    }

    for (name, deps) in edges {
        for dep in deps {
            if dep == name {
                return Err(EngineError::ConfigError(format!(
                    "task '{}' cannot depend on itself",
                    name
                )));
            }
            if !names.contains(dep.as_str()) {
                return Err(EngineError::ConfigError(format!(
                    "task '{}' has unknown dependency '{}'",
                    name, dep
                )));
            }
            graph.add_edge(dep.as_str(), name, ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(EngineError::DagCycle(format!(
            "cycle detected in task graph involving task '{}'",
            cycle.node_id()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::task::{TaskKind, TaskSpec};

    fn task(name: &str, deps: &[&str]) -> Task {
        deps.iter().fold(
            Task::new(name, TaskSpec::default(), TaskKind::Describing),
            |t, d| t.after(*d),
        )
    }

    #[test]
    fn diamond_indexes_both_directions() {
        let graph = Graph::new(vec![
            task("A", &[]),
            task("B", &["A"]),
            task("C", &["A"]),
            task("D", &["B", "C"]),
        ])
        .unwrap();

        let deps = graph.dependencies();
        assert_eq!(deps.what_target_depends_on("D"), ["B", "C"]);
        let mut direct: Vec<_> = deps.what_depends_on_target("A").to_vec();
        direct.sort();
        assert_eq!(direct, ["B", "C"]);

        let below_a: Vec<_> = deps.what_depends_on_target_recursive("A").into_iter().collect();
        assert_eq!(below_a, ["B", "C", "D"]);
        let above_d: Vec<_> = deps.what_target_depends_on_recursive("D").into_iter().collect();
        assert_eq!(above_d, ["A", "B", "C"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let err = Graph::new(vec![task("A", &["B"]), task("B", &["A"])]).unwrap_err();
        assert!(matches!(err, EngineError::DagCycle(_)));
    }

    #[test]
    fn unknown_and_self_dependencies_are_rejected() {
        let err = Graph::new(vec![task("A", &["missing"])]).unwrap_err();
        assert!(matches!(err, EngineError::ConfigError(msg) if msg.contains("missing")));

        let err = Graph::new(vec![task("A", &["A"])]).unwrap_err();
        assert!(matches!(err, EngineError::ConfigError(msg) if msg.contains("itself")));
    }

    #[test]
    fn repeated_dependency_is_indexed_once() {
        let mut b = task("B", &["A"]);
        b.dependencies.push("A".into());
        let graph = Graph::new(vec![task("A", &[]), b]).unwrap();

        assert_eq!(graph.task("B").unwrap().dependencies, ["A"]);
        assert_eq!(graph.dependencies().what_target_depends_on("B"), ["A"]);
        assert_eq!(graph.dependencies().what_depends_on_target("A"), ["B"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = Graph::new(vec![task("A", &[]), task("A", &[])]).unwrap_err();
        assert!(matches!(err, EngineError::ConfigError(_)));
    }
}
