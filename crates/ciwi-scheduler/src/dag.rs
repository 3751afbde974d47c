//! `needs` graph for the jobs of one pipeline.

use ciwi_core::pipeline::JobConfig;
use ciwi_core::{Error, Result};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Directed acyclic graph of job dependencies. Edges point from a needed job
/// to the job that needs it.
#[derive(Debug)]
pub struct NeedsDag {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl NeedsDag {
    /// Jobs that must succeed before `job_id` can run.
    pub fn needs_of(&self, job_id: &str) -> Vec<&str> {
        self.neighbors(job_id, Direction::Incoming)
    }

    /// Jobs that directly need `job_id`.
    pub fn dependents_of(&self, job_id: &str) -> Vec<&str> {
        self.neighbors(job_id, Direction::Outgoing)
    }

    fn neighbors(&self, job_id: &str, direction: Direction) -> Vec<&str> {
        self.index
            .get(job_id)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, direction)
                    .filter_map(|n| self.graph.node_weight(n))
                    .map(String::as_str)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Job ids in dependency order.
    pub fn topological_order(&self) -> Result<Vec<&str>> {
        toposort(&self.graph, None)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|&idx| self.graph.node_weight(idx))
                    .map(String::as_str)
                    .collect()
            })
            .map_err(|cycle| {
                let name = self
                    .graph
                    .node_weight(cycle.node_id())
                    .cloned()
                    .unwrap_or_default();
                Error::InvalidConfig(format!("cycle in job needs involving \"{name}\""))
            })
    }

    /// Fail when a selected job needs a job that is not selected.
    pub fn check_selection(&self, selected: &BTreeSet<&str>) -> Result<()> {
        for job_id in selected {
            for need in self.needs_of(job_id) {
                if !selected.contains(need) {
                    return Err(Error::validation(format!(
                        "selection excludes required job \"{need}\" needed by \"{job_id}\""
                    )));
                }
            }
        }
        Ok(())
    }

    /// `job_id` and every job that transitively needs it.
    pub fn downstream_closure(&self, job_id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![job_id];
        while let Some(current) = stack.pop() {
            if seen.insert(current.to_string()) {
                stack.extend(self.dependents_of(current));
            }
        }
        seen
    }
}

/// Builder for constructing needs graphs.
pub struct DagBuilder;

impl DagBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(&self, jobs: &[JobConfig]) -> Result<NeedsDag> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for job in jobs {
            let idx = graph.add_node(job.id.clone());
            index.insert(job.id.clone(), idx);
        }

        for job in jobs {
            let job_idx = index[&job.id];
            for need in &job.needs {
                let need_idx = index.get(need).ok_or_else(|| {
                    Error::InvalidConfig(format!("job \"{}\" needs unknown job \"{need}\"", job.id))
                })?;
                graph.add_edge(*need_idx, job_idx, ());
            }
        }

        let dag = NeedsDag { graph, index };
        dag.topological_order()?;
        Ok(dag)
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}
