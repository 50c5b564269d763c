use crate::model::node::{NodeKind, ProcessNode};
use crate::types::{ModelHandle, NodeId, Principal};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use uuid::Uuid;

// ─── Build errors ─────────────────────────────────────────────

/// Structural model-construction failures. Fatal: the whole model is
/// rejected, never retried.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("graph constraint violation: {0}")]
    GraphConstraintViolation(String),
    #[error("duplicate node id: {0}")]
    DuplicateNodeId(NodeId),
}

fn violation(msg: impl Into<String>) -> ModelError {
    ModelError::GraphConstraintViolation(msg.into())
}

// ─── Process model ────────────────────────────────────────────

/// The immutable, validated definition of a workflow graph.
///
/// Owns all nodes in an id-indexed arena. Immutable after construction
/// except for metadata (`rename`, `set_owner`); the graph shape never
/// changes once built.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessModel {
    handle: ModelHandle,
    /// Identity for idempotent re-registration across updates.
    uuid: Uuid,
    name: String,
    owner: Option<Principal>,
    nodes: BTreeMap<NodeId, ProcessNode>,
    start_nodes: Vec<NodeId>,
    end_node_count: usize,
    /// SHA-256 of the canonical node listing; equal fingerprints mean
    /// structurally identical models.
    fingerprint: [u8; 32],
}

impl ProcessModel {
    pub fn handle(&self) -> ModelHandle {
        self.handle
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Option<&Principal> {
        self.owner.as_ref()
    }

    pub fn start_nodes(&self) -> &[NodeId] {
        &self.start_nodes
    }

    pub fn end_node_count(&self) -> usize {
        self.end_node_count
    }

    pub fn fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }

    /// Look up a node by id. Absent ids are "not found", not an error.
    pub fn get_node(&self, id: &str) -> Option<&ProcessNode> {
        self.nodes.get(id)
    }

    /// Deduplicated, deterministic traversal: depth-first from the start
    /// nodes, each node visited at most once. Used for export and diffing.
    pub fn model_nodes(&self) -> Vec<&ProcessNode> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<&str> = Vec::new();

        for start in self.start_nodes.iter().rev() {
            stack.push(start);
        }
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(id) {
                // Push successors in reverse so they pop in declared order.
                for succ in node.successors.iter().rev() {
                    stack.push(succ);
                }
                out.push(node);
            }
        }
        out
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // Metadata updates never touch the graph shape.

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn set_owner(&mut self, owner: Principal) {
        self.owner = Some(owner);
    }
}

// ─── Builder ──────────────────────────────────────────────────

/// Collects authored nodes (predecessor links only) and builds a validated
/// [`ProcessModel`] by reversing the End-rooted predecessor chains into a
/// Start-rooted successor graph.
pub struct ModelBuilder {
    name: String,
    owner: Option<Principal>,
    uuid: Option<Uuid>,
    nodes: Vec<ProcessNode>,
}

impl ModelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: None,
            uuid: None,
            nodes: Vec::new(),
        }
    }

    pub fn owner(mut self, owner: Principal) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Identity for idempotent re-registration; generated when absent.
    pub fn uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn node(mut self, node: ProcessNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn nodes(mut self, nodes: impl IntoIterator<Item = ProcessNode>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    /// Validate and build. All structural invariants are enforced here;
    /// a model that builds is safe to execute.
    pub fn build(mut self) -> Result<ProcessModel, ModelError> {
        self.generate_missing_ids();

        // Duplicate ids reject the model before anything else is derived.
        let mut arena: BTreeMap<NodeId, ProcessNode> = BTreeMap::new();
        for node in self.nodes {
            if arena.contains_key(&node.id) {
                return Err(ModelError::DuplicateNodeId(node.id));
            }
            arena.insert(node.id.clone(), node);
        }

        validate_authored_arity(&arena)?;
        let end_rooted = derive_successors(&mut arena)?;
        validate_derived_arity(&arena)?;
        check_acyclic(&arena)?;

        let start_nodes: Vec<NodeId> = arena
            .values()
            .filter(|n| n.is_start())
            .map(|n| n.id.clone())
            .collect();
        if start_nodes.is_empty() {
            return Err(violation("model has no start node"));
        }
        check_reachability(&arena, &start_nodes, &end_rooted)?;

        let end_node_count = arena.values().filter(|n| n.is_end()).count();
        let fingerprint = fingerprint_nodes(&arena);

        Ok(ProcessModel {
            handle: ModelHandle::new(),
            uuid: self.uuid.unwrap_or_else(Uuid::now_v7),
            name: self.name,
            owner: self.owner,
            nodes: arena,
            start_nodes,
            end_node_count,
            fingerprint,
        })
    }

    fn generate_missing_ids(&mut self) {
        let taken: HashSet<String> = self
            .nodes
            .iter()
            .filter(|n| !n.id.is_empty())
            .map(|n| n.id.clone())
            .collect();
        let mut counter = 1usize;
        for node in self.nodes.iter_mut().filter(|n| n.id.is_empty()) {
            loop {
                let candidate = format!("node{counter}");
                counter += 1;
                if !taken.contains(&candidate) {
                    node.id = candidate;
                    break;
                }
            }
        }
    }
}

// ─── Validation passes ────────────────────────────────────────

fn validate_authored_arity(arena: &BTreeMap<NodeId, ProcessNode>) -> Result<(), ModelError> {
    for node in arena.values() {
        for pred in &node.predecessors {
            if !arena.contains_key(pred) {
                return Err(violation(format!(
                    "node '{}' references unknown predecessor '{}'",
                    node.id, pred
                )));
            }
            if pred == &node.id {
                return Err(violation(format!("node '{}' is its own predecessor", node.id)));
            }
        }

        let preds = node.predecessors.len();
        match &node.kind {
            NodeKind::Start { .. } => {
                if preds != 0 {
                    return Err(violation(format!(
                        "start node '{}' must have no predecessors, found {}",
                        node.id, preds
                    )));
                }
            }
            NodeKind::Join { min, max } => {
                if preds == 0 {
                    return Err(violation(format!(
                        "join node '{}' must have at least one predecessor",
                        node.id
                    )));
                }
                check_bounds(&node.id, "join", *min, *max)?;
                if (*min as usize) > preds {
                    return Err(violation(format!(
                        "join node '{}': min {} exceeds its {} predecessors and can never fire",
                        node.id, min, preds
                    )));
                }
            }
            NodeKind::Split { min, max } => {
                check_bounds(&node.id, "split", *min, *max)?;
                if preds != 1 {
                    return Err(violation(format!(
                        "split node '{}' must have exactly one predecessor, found {}",
                        node.id, preds
                    )));
                }
            }
            NodeKind::Activity { .. } | NodeKind::End { .. } => {
                if preds != 1 {
                    return Err(violation(format!(
                        "{} node '{}' must have exactly one predecessor, found {}",
                        node.kind.label(),
                        node.id,
                        preds
                    )));
                }
            }
        }
    }
    Ok(())
}

fn check_bounds(id: &str, label: &str, min: u32, max: u32) -> Result<(), ModelError> {
    if min < 1 {
        return Err(violation(format!("{label} node '{id}': min must be >= 1")));
    }
    if max < min {
        return Err(violation(format!(
            "{label} node '{id}': max {max} is below min {min}"
        )));
    }
    Ok(())
}

/// Predecessor→successor reversal. Starting from every End node, walk
/// predecessors; the first time an edge is traversed the successor link is
/// recorded, later traversals of other edges append further successors.
/// Returns the set of nodes on some End-rooted chain.
fn derive_successors(arena: &mut BTreeMap<NodeId, ProcessNode>) -> Result<HashSet<NodeId>, ModelError> {
    let end_ids: Vec<NodeId> = arena
        .values()
        .filter(|n| n.is_end())
        .map(|n| n.id.clone())
        .collect();
    if end_ids.is_empty() {
        return Err(violation("model has no end node"));
    }

    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut stack: Vec<NodeId> = end_ids;

    while let Some(id) = stack.pop() {
        if !visited.insert(id.clone()) {
            continue;
        }
        let preds = arena
            .get(&id)
            .map(|n| n.predecessors.clone())
            .unwrap_or_default();
        for pred in preds {
            // Predecessor existence was validated before the reversal.
            if let Some(pred_node) = arena.get_mut(&pred) {
                if !pred_node.successors.contains(&id) {
                    pred_node.successors.push(id.clone());
                }
                stack.push(pred);
            }
        }
    }
    Ok(visited)
}

fn validate_derived_arity(arena: &BTreeMap<NodeId, ProcessNode>) -> Result<(), ModelError> {
    for node in arena.values() {
        let succs = node.successors.len();
        if succs > node.max_successors() {
            return Err(violation(format!(
                "{} node '{}' admits at most {} successors, found {}",
                node.kind.label(),
                node.id,
                node.max_successors(),
                succs
            )));
        }
        if let NodeKind::Split { min, .. } = &node.kind {
            if succs < *min as usize {
                return Err(violation(format!(
                    "split node '{}': min {} exceeds its {} successors and can never be satisfied",
                    node.id, min, succs
                )));
            }
        }
    }
    Ok(())
}

fn check_acyclic(arena: &BTreeMap<NodeId, ProcessNode>) -> Result<(), ModelError> {
    let mut graph: DiGraph<NodeId, ()> = DiGraph::new();
    let mut indices: HashMap<&NodeId, NodeIndex> = HashMap::new();
    for id in arena.keys() {
        indices.insert(id, graph.add_node(id.clone()));
    }
    for node in arena.values() {
        for succ in &node.successors {
            graph.add_edge(indices[&node.id], indices[succ], ());
        }
    }
    petgraph::algo::toposort(&graph, None).map_err(|cycle| {
        violation(format!(
            "cycle through node '{}'",
            graph[cycle.node_id()]
        ))
    })?;
    Ok(())
}

fn check_reachability(
    arena: &BTreeMap<NodeId, ProcessNode>,
    start_nodes: &[NodeId],
    end_rooted: &HashSet<NodeId>,
) -> Result<(), ModelError> {
    // Forward sweep from the start nodes over derived successors.
    let mut from_start: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = start_nodes.iter().map(String::as_str).collect();
    while let Some(id) = stack.pop() {
        if !from_start.insert(id) {
            continue;
        }
        if let Some(node) = arena.get(id) {
            for succ in &node.successors {
                stack.push(succ);
            }
        }
    }

    for node in arena.values() {
        if !from_start.contains(node.id.as_str()) {
            return Err(violation(format!(
                "node '{}' is not reachable from any start node",
                node.id
            )));
        }
        if !end_rooted.contains(&node.id) {
            return Err(violation(format!(
                "node '{}' does not reach any end node",
                node.id
            )));
        }
    }
    Ok(())
}

/// Canonical structural fingerprint: sorted node listing of id, variant tag,
/// threshold bounds, and predecessor ids. Successors are derived and
/// therefore excluded.
fn fingerprint_nodes(arena: &BTreeMap<NodeId, ProcessNode>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for (id, node) in arena {
        hasher.update(id.as_bytes());
        hasher.update([0u8]);
        hasher.update(node.kind.label().as_bytes());
        if let Some((min, max)) = node.join_bounds() {
            hasher.update(min.to_be_bytes());
            hasher.update(max.to_be_bytes());
        }
        if let NodeKind::Split { min, max } = &node.kind {
            hasher.update(min.to_be_bytes());
            hasher.update(max.to_be_bytes());
        }
        for pred in &node.predecessors {
            hasher.update(pred.as_bytes());
            hasher.update([1u8]);
        }
        hasher.update([2u8]);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> ModelBuilder {
        ModelBuilder::new("linear")
            .node(ProcessNode::start("s"))
            .node(ProcessNode::activity("a", "s"))
            .node(ProcessNode::end("e", "a"))
    }

    #[test]
    fn linear_model_builds() {
        let model = linear().build().unwrap();
        assert_eq!(model.start_nodes(), ["s".to_string()]);
        assert_eq!(model.end_node_count(), 1);
        assert_eq!(model.node_count(), 3);

        // Successor derivation reverses the authored predecessor links.
        assert_eq!(model.get_node("s").unwrap().successors, ["a".to_string()]);
        assert_eq!(model.get_node("a").unwrap().successors, ["e".to_string()]);
        assert!(model.get_node("e").unwrap().successors.is_empty());
    }

    #[test]
    fn model_nodes_is_deterministic_and_deduplicated() {
        let model = ModelBuilder::new("diamond")
            .node(ProcessNode::start("s"))
            .node(ProcessNode::split("sp", "s", 2, 2))
            .node(ProcessNode::activity("a1", "sp"))
            .node(ProcessNode::activity("a2", "sp"))
            .node(ProcessNode::join("j", vec!["a1".into(), "a2".into()], 2, 2))
            .node(ProcessNode::end("e", "j"))
            .build()
            .unwrap();

        let first: Vec<&str> = model.model_nodes().iter().map(|n| n.id.as_str()).collect();
        let second: Vec<&str> = model.model_nodes().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 6, "each node exactly once");
        assert_eq!(first[0], "s");
    }

    #[test]
    fn duplicate_node_id_rejected() {
        let err = linear()
            .node(ProcessNode::activity("a", "s"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::DuplicateNodeId(id) if id == "a"));
    }

    #[test]
    fn non_join_with_two_predecessors_rejected() {
        let mut bad = ProcessNode::activity("a", "s");
        bad.predecessors.push("s2".into());
        let err = ModelBuilder::new("bad")
            .node(ProcessNode::start("s"))
            .node(ProcessNode::start("s2"))
            .node(bad)
            .node(ProcessNode::end("e", "a"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::GraphConstraintViolation(_)));
    }

    #[test]
    fn join_bounds_validated() {
        let err = ModelBuilder::new("bad")
            .node(ProcessNode::start("s"))
            .node(ProcessNode::activity("a", "s"))
            .node(ProcessNode::join("j", vec!["a".into()], 2, 1))
            .node(ProcessNode::end("e", "j"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::GraphConstraintViolation(_)));

        // min above the predecessor count can never fire.
        let err = ModelBuilder::new("bad")
            .node(ProcessNode::start("s"))
            .node(ProcessNode::activity("a", "s"))
            .node(ProcessNode::join("j", vec!["a".into()], 2, 2))
            .node(ProcessNode::end("e", "j"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::GraphConstraintViolation(_)));
    }

    #[test]
    fn split_min_zero_rejected() {
        let err = ModelBuilder::new("bad")
            .node(ProcessNode::start("s"))
            .node(ProcessNode::split("sp", "s", 0, 2))
            .node(ProcessNode::activity("a", "sp"))
            .node(ProcessNode::end("e", "a"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::GraphConstraintViolation(_)));
    }

    #[test]
    fn cycle_rejected() {
        let err = ModelBuilder::new("cyclic")
            .node(ProcessNode::start("s"))
            .node(ProcessNode::join("j", vec!["s".into(), "a".into()], 1, 2))
            .node(ProcessNode::activity("a", "j"))
            .node(ProcessNode::end("e", "a"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::GraphConstraintViolation(msg) if msg.contains("cycle")));
    }

    #[test]
    fn dangling_node_rejected() {
        let err = linear()
            .node(ProcessNode::activity("orphan", "s"))
            .build()
            .unwrap_err();
        assert!(
            matches!(err, ModelError::GraphConstraintViolation(msg) if msg.contains("orphan"))
        );
    }

    #[test]
    fn missing_end_rejected() {
        let err = ModelBuilder::new("no-end")
            .node(ProcessNode::start("s"))
            .node(ProcessNode::activity("a", "s"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::GraphConstraintViolation(msg) if msg.contains("end")));
    }

    #[test]
    fn get_node_miss_is_none() {
        let model = linear().build().unwrap();
        assert!(model.get_node("nope").is_none());
    }

    #[test]
    fn missing_ids_are_generated() {
        let model = ModelBuilder::new("anon")
            .node(ProcessNode::start("s"))
            .node(ProcessNode::activity("", "s"))
            .node(ProcessNode::end("e", "node1"))
            .build()
            .unwrap();
        assert!(model.get_node("node1").is_some());
    }

    #[test]
    fn fan_out_without_split_is_allowed() {
        // Two activities both name the start as predecessor; the reversal
        // gives the start two successors.
        let model = ModelBuilder::new("fan")
            .node(ProcessNode::start("s"))
            .node(ProcessNode::activity("a1", "s"))
            .node(ProcessNode::activity("a2", "s"))
            .node(ProcessNode::join("j", vec!["a1".into(), "a2".into()], 2, 2))
            .node(ProcessNode::end("e", "j"))
            .build()
            .unwrap();
        assert_eq!(model.get_node("s").unwrap().successors.len(), 2);
    }

    #[test]
    fn fingerprint_stable_and_structure_sensitive() {
        let a = linear().build().unwrap();
        let b = linear().build().unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = ModelBuilder::new("other")
            .node(ProcessNode::start("s"))
            .node(ProcessNode::activity("b", "s"))
            .node(ProcessNode::end("e", "b"))
            .build()
            .unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn metadata_updates_leave_graph_untouched() {
        let mut model = linear().build().unwrap();
        let fp = model.fingerprint();
        model.rename("renamed");
        model.set_owner(Principal::new("alice"));
        assert_eq!(model.name(), "renamed");
        assert_eq!(model.fingerprint(), fp);
        assert_eq!(model.node_count(), 3);
    }
}
