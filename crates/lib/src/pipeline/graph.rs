//! Stage graph for run scheduling.
//!
//! Source feeds every build; every build feeds PrepareDeploy. Waves are the
//! groups of nodes whose predecessors have all completed, so the deploy
//! node always lands in a wave after every build (the barrier).

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use super::plan::{ActionKind, PipelinePlan, StageKind};
use super::types::DefinitionError;

/// A node in the stage graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StageNode {
  Source,
  /// An image build job, by job name.
  Build(String),
  PrepareDeploy,
}

impl StageNode {
  pub fn stage(&self) -> StageKind {
    match self {
      StageNode::Source => StageKind::Source,
      StageNode::Build(_) => StageKind::Build,
      StageNode::PrepareDeploy => StageKind::PrepareDeploy,
    }
  }
}

pub struct StageGraph {
  graph: DiGraph<StageNode, ()>,
  nodes: HashMap<StageNode, NodeIndex>,
}

impl StageGraph {
  pub fn from_plan(plan: &PipelinePlan) -> Result<Self, DefinitionError> {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();

    let source = graph.add_node(StageNode::Source);
    nodes.insert(StageNode::Source, source);

    let mut builds = Vec::new();
    for stage in &plan.stages {
      if stage.kind != StageKind::Build {
        continue;
      }
      for action in &stage.actions {
        if let ActionKind::Job(job) = &action.kind {
          let node = StageNode::Build(job.name.clone());
          let idx = graph.add_node(node.clone());
          nodes.insert(node, idx);
          graph.add_edge(source, idx, ());
          builds.push(idx);
        }
      }
    }

    let deploy = graph.add_node(StageNode::PrepareDeploy);
    nodes.insert(StageNode::PrepareDeploy, deploy);
    if builds.is_empty() {
      graph.add_edge(source, deploy, ());
    }
    for idx in builds {
      graph.add_edge(idx, deploy, ());
    }

    let dag = Self { graph, nodes };
    dag.verify_acyclic()?;
    Ok(dag)
  }

  fn verify_acyclic(&self) -> Result<(), DefinitionError> {
    toposort(&self.graph, None).map_err(|_| DefinitionError::Cycle)?;
    Ok(())
  }

  pub fn len(&self) -> usize {
    self.graph.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.graph.node_count() == 0
  }

  /// Nodes that must complete before `node` may start.
  pub fn predecessors(&self, node: &StageNode) -> Vec<StageNode> {
    let Some(&idx) = self.nodes.get(node) else {
      return Vec::new();
    };
    let mut preds: Vec<NodeIndex> = self.graph.neighbors_directed(idx, Direction::Incoming).collect();
    preds.sort();
    preds.into_iter().map(|i| self.graph[i].clone()).collect()
  }

  /// Execution waves. Nodes inside a wave are independent; order within a
  /// wave follows declaration order.
  pub fn waves(&self) -> Vec<Vec<StageNode>> {
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();

    let mut ready: Vec<NodeIndex> = in_degree
      .iter()
      .filter(|&(_, &degree)| degree == 0)
      .map(|(&idx, _)| idx)
      .collect();

    let mut waves = Vec::new();
    while !ready.is_empty() {
      ready.sort();
      let mut next = Vec::new();
      for &idx in &ready {
        for dependent in self.graph.neighbors_directed(idx, Direction::Outgoing) {
          if let Some(degree) = in_degree.get_mut(&dependent) {
            *degree -= 1;
            if *degree == 0 {
              next.push(dependent);
            }
          }
        }
      }
      waves.push(ready.iter().map(|&idx| self.graph[idx].clone()).collect());
      ready = next;
    }

    waves
  }
}
