/*!
# Dependency graph

Builds the stage execution order as a sequence of levels:
stages within a level have no dependency relationship between them and
may run concurrently; level N+1 only starts once every stage in level N
has reached a dependency-satisfying status.

The workflow extension this engine grew out of computes order with a
recursive depth-first `topological_sort`, which only yields a single
linear order and cannot express "these three stages may run in
parallel". This engine needs level information to feed the
`WorkerPool`, so it uses Kahn's algorithm instead: repeatedly peel off
the set of nodes with in-degree zero.
*/

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{EngineError, EngineResult};

/// Stage dependency graph, built once from a `WorkflowDefinition` and
/// immutable for the lifetime of the workflow instance.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// stage name -> names it depends on
    dependencies: HashMap<String, Vec<String>>,
    /// stage name -> names that depend on it
    dependents: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Builds a graph from a stage-name -> dependency-names map, rejecting
    /// references to undeclared stages.
    pub fn new(declared: &HashMap<String, Vec<String>>) -> EngineResult<Self> {
        let known: HashSet<&str> = declared.keys().map(String::as_str).collect();
        let mut dependents: HashMap<String, Vec<String>> =
            declared.keys().map(|name| (name.clone(), Vec::new())).collect();

        for (stage, deps) in declared {
            for dep in deps {
                if !known.contains(dep.as_str()) {
                    return Err(EngineError::UnresolvedDependency {
                        stage: stage.clone(),
                        dependency: dep.clone(),
                    });
                }
                dependents.entry(dep.clone()).or_default().push(stage.clone());
            }
        }

        let graph = Self {
            dependencies: declared.clone(),
            dependents,
        };
        graph.execution_order()?;
        Ok(graph)
    }

    pub fn add_stage(&mut self, name: impl Into<String>, deps: Vec<String>) {
        let name = name.into();
        for dep in &deps {
            self.dependents.entry(dep.clone()).or_default().push(name.clone());
        }
        self.dependents.entry(name.clone()).or_default();
        self.dependencies.insert(name, deps);
    }

    /// Direct prerequisites of `name` (defensive copy).
    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        self.dependencies.get(name).cloned().unwrap_or_default()
    }

    /// Direct dependents of `name` (defensive copy).
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.dependents.get(name).cloned().unwrap_or_default()
    }

    /// Kahn's algorithm: returns levels of stage names, each level
    /// independent of the others, in an order such that every stage's
    /// dependencies appear in a strictly earlier level.
    ///
    /// Errors with `CyclicDependency` naming the stages that never reached
    /// in-degree zero.
    pub fn execution_order(&self) -> EngineResult<Vec<Vec<String>>> {
        let mut in_degree: HashMap<&str, usize> = self
            .dependencies
            .iter()
            .map(|(name, deps)| (name.as_str(), deps.len()))
            .collect();

        let mut levels = Vec::new();
        let mut remaining = in_degree.len();

        loop {
            let mut frontier: Vec<&str> = in_degree
                .iter()
                .filter(|(_, &deg)| deg == 0)
                .map(|(&name, _)| name)
                .collect();
            frontier.sort_unstable();

            if frontier.is_empty() {
                break;
            }

            for &name in &frontier {
                in_degree.remove(name);
                remaining -= 1;
                for dependent in self.dependents_of(name) {
                    if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                        *deg -= 1;
                    }
                }
            }

            levels.push(frontier.into_iter().map(str::to_string).collect());
        }

        if remaining > 0 {
            let mut stuck: Vec<String> = in_degree.keys().map(|s| s.to_string()).collect();
            stuck.sort_unstable();
            return Err(EngineError::CyclicDependency(stuck));
        }

        Ok(levels)
    }

    pub fn stage_count(&self) -> usize {
        self.dependencies.len()
    }
}
