use crate::condition::Condition;
use crate::types::{NodeId, Payload};
use serde::{Deserialize, Serialize};

// ─── Data bindings ────────────────────────────────────────────

/// Ordered data binding. Imports pull `source` out of the surrounding data
/// into the node under `name`; exports push `source` out of the node results
/// into instance data under `name`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataBinding {
    pub name: String,
    pub source: String,
}

impl DataBinding {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

// ─── Message template ─────────────────────────────────────────

/// Static shape of an activity's outbound message. The body is merged with
/// bound import data at dispatch time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub service: String,
    pub operation: String,
    pub body: Payload,
}

impl MessageTemplate {
    pub fn new(service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            body: Payload::new(),
        }
    }
}

// ─── Node variants ────────────────────────────────────────────

/// Variant-specific data of a process node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Start {
        imports: Vec<DataBinding>,
    },
    Activity {
        condition: Option<Condition>,
        message: MessageTemplate,
        imports: Vec<DataBinding>,
        exports: Vec<DataBinding>,
    },
    Split {
        min: u32,
        max: u32,
    },
    Join {
        min: u32,
        max: u32,
    },
    End {
        exports: Vec<DataBinding>,
    },
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Start { .. } => "start",
            NodeKind::Activity { .. } => "activity",
            NodeKind::Split { .. } => "split",
            NodeKind::Join { .. } => "join",
            NodeKind::End { .. } => "end",
        }
    }
}

// ─── Process node ─────────────────────────────────────────────

/// One typed node of a process model.
///
/// Nodes are authored with predecessor ids only; `successors` is derived by
/// the builder's reversal pass and empty until then. Links are id sets into
/// the owning model's arena, never object references.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessNode {
    /// Unique within the model; generated by the builder when empty.
    pub id: NodeId,
    pub kind: NodeKind,
    pub predecessors: Vec<NodeId>,
    /// Derived during model construction, not authored.
    pub successors: Vec<NodeId>,
    /// Layout hint, irrelevant to execution; carried through unchanged.
    pub position: Option<(f64, f64)>,
}

impl ProcessNode {
    fn new(id: impl Into<String>, kind: NodeKind, predecessors: Vec<NodeId>) -> Self {
        Self {
            id: id.into(),
            kind,
            predecessors,
            successors: Vec::new(),
            position: None,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Start { imports: vec![] }, vec![])
    }

    pub fn activity(id: impl Into<String>, predecessor: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::Activity {
                condition: None,
                message: MessageTemplate::default(),
                imports: vec![],
                exports: vec![],
            },
            vec![predecessor.into()],
        )
    }

    pub fn split(id: impl Into<String>, predecessor: impl Into<String>, min: u32, max: u32) -> Self {
        Self::new(id, NodeKind::Split { min, max }, vec![predecessor.into()])
    }

    pub fn join(id: impl Into<String>, predecessors: Vec<NodeId>, min: u32, max: u32) -> Self {
        Self::new(id, NodeKind::Join { min, max }, predecessors)
    }

    pub fn end(id: impl Into<String>, predecessor: impl Into<String>) -> Self {
        Self::new(id, NodeKind::End { exports: vec![] }, vec![predecessor.into()])
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        if let NodeKind::Activity { condition: slot, .. } = &mut self.kind {
            *slot = Some(condition);
        }
        self
    }

    pub fn with_message(mut self, message: MessageTemplate) -> Self {
        if let NodeKind::Activity { message: slot, .. } = &mut self.kind {
            *slot = message;
        }
        self
    }

    pub fn with_imports(mut self, bindings: Vec<DataBinding>) -> Self {
        match &mut self.kind {
            NodeKind::Start { imports } | NodeKind::Activity { imports, .. } => *imports = bindings,
            _ => {}
        }
        self
    }

    pub fn with_exports(mut self, bindings: Vec<DataBinding>) -> Self {
        match &mut self.kind {
            NodeKind::Activity { exports, .. } | NodeKind::End { exports } => *exports = bindings,
            _ => {}
        }
        self
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Some((x, y));
        self
    }

    // ── Structural contract ──

    /// Maximum number of predecessors the variant admits.
    pub fn max_predecessors(&self) -> usize {
        match &self.kind {
            NodeKind::Start { .. } => 0,
            NodeKind::Join { .. } => usize::MAX,
            _ => 1,
        }
    }

    /// Maximum number of successors the variant admits. A split's fan-out is
    /// bounded by its own `max`; an end node is terminal.
    pub fn max_successors(&self) -> usize {
        match &self.kind {
            NodeKind::End { .. } => 0,
            NodeKind::Split { max, .. } => *max as usize,
            _ => usize::MAX,
        }
    }

    // ── Capability surface ──

    /// Whether this node may activate given the current instance data.
    /// Only activities carry a condition; everything else activates freely.
    pub fn condition_holds(&self, data: &Payload) -> bool {
        match &self.kind {
            NodeKind::Activity {
                condition: Some(cond),
                ..
            } => cond.evaluate(data),
            _ => true,
        }
    }

    /// Whether task provision auto-advances. An activity dispatches a
    /// message instead and waits for asynchronous completion.
    pub fn provide_auto(&self) -> bool {
        !matches!(self.kind, NodeKind::Activity { .. })
    }

    /// Whether task acceptance auto-advances. For activities the external
    /// worker drives this step.
    pub fn take_auto(&self) -> bool {
        !matches!(self.kind, NodeKind::Activity { .. })
    }

    /// Whether task start auto-advances. For activities the external worker
    /// drives this step.
    pub fn start_auto(&self) -> bool {
        !matches!(self.kind, NodeKind::Activity { .. })
    }

    /// Join threshold bounds, when this node is a join.
    pub fn join_bounds(&self) -> Option<(u32, u32)> {
        match &self.kind {
            NodeKind::Join { min, max } => Some((*min, *max)),
            _ => None,
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self.kind, NodeKind::Start { .. })
    }

    pub fn is_end(&self) -> bool {
        matches!(self.kind, NodeKind::End { .. })
    }

    pub fn is_join(&self) -> bool {
        matches!(self.kind, NodeKind::Join { .. })
    }
}
