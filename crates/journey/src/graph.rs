//! Flow graph validation and lookup.
//!
//! A [`FlowGraph`] is built once per flow: node payloads are resolved into
//! the tagged [`FlowNode`] variants and outgoing edges are indexed, so the
//! scheduler never re-inspects raw edge lists while advancing an execution.

use std::collections::{HashMap, HashSet};

use campaign_core::{CampaignError, CampaignResult};
use uuid::Uuid;

use crate::types::{Branch, ConditionNode, Flow, FlowEdge, FlowNode, SendNode};

#[derive(Debug, Clone)]
pub struct FlowGraph {
    flow_id: Uuid,
    entry: String,
    nodes: HashMap<String, FlowNode>,
    outgoing: HashMap<String, Vec<FlowEdge>>,
}

impl FlowGraph {
    /// Validates `flow` and indexes it.
    pub fn build(flow: &Flow) -> CampaignResult<Self> {
        let mut nodes = HashMap::with_capacity(flow.nodes.len());
        for node in &flow.nodes {
            if node.id().is_empty() {
                return Err(CampaignError::graph("node with empty id"));
            }
            if nodes.insert(node.id().to_string(), node.clone()).is_some() {
                return Err(CampaignError::graph(format!(
                    "duplicate node id '{}'",
                    node.id()
                )));
            }
        }
        if !nodes.contains_key(&flow.entry_node) {
            return Err(CampaignError::graph(format!(
                "entry node '{}' does not exist",
                flow.entry_node
            )));
        }

        let mut outgoing: HashMap<String, Vec<FlowEdge>> = HashMap::new();
        for edge in &flow.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !nodes.contains_key(endpoint) {
                    return Err(CampaignError::graph(format!(
                        "edge {} -> {} references unknown node '{endpoint}'",
                        edge.source, edge.target
                    )));
                }
            }
            outgoing
                .entry(edge.source.clone())
                .or_default()
                .push(edge.clone());
        }

        for (id, edges) in &outgoing {
            match nodes.get(id) {
                Some(FlowNode::Send(_)) => {
                    if edges.len() > 1 {
                        return Err(CampaignError::graph(format!(
                            "send node '{id}' has {} outgoing edges",
                            edges.len()
                        )));
                    }
                    if edges.iter().any(|e| e.branch.is_some()) {
                        return Err(CampaignError::graph(format!(
                            "send node '{id}' has a labelled edge"
                        )));
                    }
                }
                Some(FlowNode::Condition(_)) => {
                    let mut seen = HashSet::new();
                    for edge in edges {
                        let branch = edge.branch.ok_or_else(|| {
                            CampaignError::graph(format!(
                                "condition '{id}' has an unlabelled edge to '{}'",
                                edge.target
                            ))
                        })?;
                        if !seen.insert(branch) {
                            return Err(CampaignError::graph(format!(
                                "condition '{id}' has two {branch:?} edges"
                            )));
                        }
                    }
                }
                Some(FlowNode::End(_)) => {
                    return Err(CampaignError::graph(format!(
                        "end node '{id}' has outgoing edges"
                    )));
                }
                None => {}
            }
        }

        let graph = Self {
            flow_id: flow.id,
            entry: flow.entry_node.clone(),
            nodes,
            outgoing,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    fn check_acyclic(&self) -> CampaignResult<()> {
        // 0 = unvisited, 1 = on stack, 2 = done
        let mut marks: HashMap<&str, u8> = HashMap::new();
        for start in self.nodes.keys() {
            if marks.get(start.as_str()).copied().unwrap_or(0) != 0 {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            marks.insert(start.as_str(), 1);
            while let Some((node, next)) = stack.pop() {
                let edges = self.outgoing.get(node).map(Vec::as_slice).unwrap_or(&[]);
                if let Some(edge) = edges.get(next) {
                    stack.push((node, next + 1));
                    match marks.get(edge.target.as_str()).copied().unwrap_or(0) {
                        0 => {
                            marks.insert(edge.target.as_str(), 1);
                            stack.push((edge.target.as_str(), 0));
                        }
                        1 => {
                            return Err(CampaignError::graph(format!(
                                "cycle through '{}'",
                                edge.target
                            )))
                        }
                        _ => {}
                    }
                } else {
                    marks.insert(node, 2);
                }
            }
        }
        Ok(())
    }

    pub fn flow_id(&self) -> Uuid {
        self.flow_id
    }

    pub fn entry(&self) -> CampaignResult<&FlowNode> {
        self.node(&self.entry)
    }

    pub fn node(&self, id: &str) -> CampaignResult<&FlowNode> {
        self.nodes.get(id).ok_or_else(|| {
            CampaignError::graph(format!("node '{id}' missing from flow {}", self.flow_id))
        })
    }

    pub fn send_node(&self, id: &str) -> CampaignResult<&SendNode> {
        match self.node(id)? {
            FlowNode::Send(node) => Ok(node),
            other => Err(CampaignError::graph(format!(
                "node '{id}' is {:?}, expected send",
                other.kind()
            ))),
        }
    }

    pub fn condition_node(&self, id: &str) -> CampaignResult<&ConditionNode> {
        match self.node(id)? {
            FlowNode::Condition(node) => Ok(node),
            other => Err(CampaignError::graph(format!(
                "node '{id}' is {:?}, expected condition",
                other.kind()
            ))),
        }
    }

    /// Target of a send node's single outgoing edge.
    pub fn next_after_send(&self, id: &str) -> CampaignResult<Option<&FlowNode>> {
        match self.outgoing.get(id).and_then(|edges| edges.first()) {
            Some(edge) => self.node(&edge.target).map(Some),
            None => Ok(None),
        }
    }

    /// Target of a condition's `branch` output, if wired.
    pub fn branch_target(&self, id: &str, branch: Branch) -> CampaignResult<Option<&FlowNode>> {
        let edge = self
            .outgoing
            .get(id)
            .and_then(|edges| edges.iter().find(|e| e.branch == Some(branch)));
        match edge {
            Some(edge) => self.node(&edge.target).map(Some),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
