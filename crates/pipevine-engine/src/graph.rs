//! Task dependency graph checks and traversal.
//!
//! The validator uses [`verify`] to reject unresolved dependencies, cycles,
//! and multiple disconnected root tasks; the executor uses
//! [`DependencyGraph`] to walk descendants when propagating failures.

use std::collections::{HashMap, HashSet};

use pipevine_types::Task;

/// Dependency edges of a pipeline, keyed by task id.
///
/// Edges run `dependency -> dependent`; `deps` is the reverse view.
#[derive(Debug)]
pub struct DependencyGraph {
    deps: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Build the graph from validated tasks. Dependencies on unknown ids
    /// are ignored here; the validator has already rejected them.
    #[must_use]
    pub fn new(tasks: &[Task]) -> Self {
        let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        let mut deps: HashMap<String, Vec<String>> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut order = Vec::with_capacity(tasks.len());

        for task in tasks {
            order.push(task.id.clone());
            let entry = deps.entry(task.id.clone()).or_default();
            for dep in &task.depends_on {
                if ids.contains(dep.as_str()) {
                    entry.push(dep.clone());
                    dependents
                        .entry(dep.clone())
                        .or_default()
                        .push(task.id.clone());
                }
            }
        }
        Self {
            deps,
            dependents,
            order,
        }
    }

    /// Task ids in declaration order.
    #[must_use]
    pub fn task_ids(&self) -> &[String] {
        &self.order
    }

    /// Direct dependencies of `id`.
    #[must_use]
    pub fn deps_of(&self, id: &str) -> &[String] {
        self.deps.get(id).map_or(&[], Vec::as_slice)
    }

    /// Direct dependents of `id`.
    #[must_use]
    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.dependents.get(id).map_or(&[], Vec::as_slice)
    }

    /// Every task reachable through dependent edges from `id`.
    #[must_use]
    pub fn descendants(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = self.dependents_of(id).iter().map(String::as_str).collect();
        while let Some(current) = stack.pop() {
            if seen.insert(current.to_string()) {
                stack.extend(self.dependents_of(current).iter().map(String::as_str));
            }
        }
        seen
    }
}

/// Check the structural invariants of the task graph, returning every
/// violation found: unresolved `depends_on` ids, dependency cycles, and
/// more than one disconnected root task.
#[must_use]
pub fn verify(tasks: &[Task]) -> Vec<String> {
    let mut errors = Vec::new();
    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();

    for task in tasks {
        for dep in &task.depends_on {
            if !ids.contains(dep.as_str()) {
                errors.push(format!(
                    "task '{}' depends on unknown task '{dep}'",
                    task.id
                ));
            }
        }
    }

    let graph = DependencyGraph::new(tasks);
    errors.extend(find_cycles(&graph));

    let isolated: Vec<&str> = graph
        .task_ids()
        .iter()
        .filter(|id| graph.deps_of(id).is_empty() && graph.dependents_of(id).is_empty())
        .map(String::as_str)
        .collect();
    if isolated.len() > 1 {
        errors.push(format!(
            "pipeline has {} disconnected root tasks ({}); a single entry point is required",
            isolated.len(),
            isolated.join(", ")
        ));
    }

    errors
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    White,
    Grey,
    Black,
}

/// Depth-first search marking grey/black; every grey revisit reports one
/// cycle. The search continues past the first hit so all cycles surface.
fn find_cycles(graph: &DependencyGraph) -> Vec<String> {
    let mut marks: HashMap<&str, Mark> = graph
        .task_ids()
        .iter()
        .map(|id| (id.as_str(), Mark::White))
        .collect();
    let mut errors = Vec::new();

    for id in graph.task_ids() {
        if marks[id.as_str()] == Mark::White {
            let mut path = Vec::new();
            visit(graph, id, &mut marks, &mut path, &mut errors);
        }
    }
    errors
}

fn visit<'a>(
    graph: &'a DependencyGraph,
    id: &'a str,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
    errors: &mut Vec<String>,
) {
    marks.insert(id, Mark::Grey);
    path.push(id);

    for dep in graph.deps_of(id) {
        match marks.get(dep.as_str()).copied() {
            Some(Mark::Grey) => {
                let start = path.iter().position(|p| *p == dep).unwrap_or(0);
                let mut cycle: Vec<&str> = path[start..].to_vec();
                cycle.push(dep);
                errors.push(format!(
                    "dependency cycle involving task '{dep}': {}",
                    cycle.join(" -> ")
                ));
            }
            Some(Mark::White) => visit(graph, dep, marks, path, errors),
            _ => {}
        }
    }

    path.pop();
    marks.insert(id, Mark::Black);
}
