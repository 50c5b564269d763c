use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Node identifier, unique within one process model.
pub type NodeId = String;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Instance data and node results. BTreeMap for deterministic iteration
/// (reproducible outbound messages and event payloads).
pub type Payload = BTreeMap<String, serde_json::Value>;

pub(crate) fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

// ─── Handles ──────────────────────────────────────────────────

/// Opaque reference to a persisted process model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelHandle(pub Uuid);

/// Opaque reference to a running process instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceHandle(pub Uuid);

/// Opaque reference to one node occurrence within a process instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeInstanceHandle(pub Uuid);

impl ModelHandle {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl InstanceHandle {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl NodeInstanceHandle {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ModelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for InstanceHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for NodeInstanceHandle {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Principal ────────────────────────────────────────────────

/// Opaque owner identity. The engine only ever compares principals; it never
/// interprets their contents.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Principal(pub String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Instance state ───────────────────────────────────────────

/// Overall state of a process instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Active,
    Finished,
    Cancelled,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Finished | InstanceState::Cancelled)
    }
}

// ─── Node instance state ──────────────────────────────────────

/// Runtime state of one node occurrence. Transition rules live in
/// [`crate::state`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeInstanceState {
    /// Created, entry condition held, not yet driven.
    Pending,
    /// Activity dispatch committed; the send may or may not have left yet.
    Sent,
    /// Transport accepted the outbound message.
    Acknowledged,
    /// External worker accepted the task.
    Taken,
    /// External worker started working on the task.
    Started,
    Complete,
    Failed,
    Cancelled,
    /// Entry condition was false, or a join starved; successors along this
    /// edge are never activated.
    Skipped,
}

impl NodeInstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeInstanceState::Complete
                | NodeInstanceState::Failed
                | NodeInstanceState::Cancelled
                | NodeInstanceState::Skipped
        )
    }

    /// States in which an outbound dispatch is (or may be) in flight.
    pub fn is_dispatched(&self) -> bool {
        matches!(
            self,
            NodeInstanceState::Sent
                | NodeInstanceState::Acknowledged
                | NodeInstanceState::Taken
                | NodeInstanceState::Started
        )
    }
}

// ─── Process instance ─────────────────────────────────────────

/// One running execution of a process model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub handle: InstanceHandle,
    /// Caller-supplied identity for idempotent re-identification.
    pub uuid: Uuid,
    pub model: ModelHandle,
    pub owner: Principal,
    pub state: InstanceState,
    /// Instance data: start imports land here, activity exports merge here.
    pub data: Payload,
    /// Node-instance failures observed on this instance so far.
    pub error_count: u32,
    /// Optimistic concurrency token, checked by the store on every write.
    pub version: u64,
    pub created_at: Timestamp,
}

impl ProcessInstance {
    pub fn new(model: ModelHandle, owner: Principal, uuid: Uuid, data: Payload) -> Self {
        Self {
            handle: InstanceHandle::new(),
            uuid,
            model,
            owner,
            state: InstanceState::Active,
            data,
            error_count: 0,
            version: 0,
            created_at: now_ms(),
        }
    }
}

// ─── Node instance ────────────────────────────────────────────

/// One occurrence of a process node within a process instance.
///
/// `predecessors` records the specific node instances that arrived, not the
/// static graph predecessors: a join counts arrivals of this particular
/// run, so its threshold bookkeeping lives in the length of this list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    pub handle: NodeInstanceHandle,
    pub instance: InstanceHandle,
    pub node: NodeId,
    pub state: NodeInstanceState,
    pub predecessors: Vec<NodeInstanceHandle>,
    /// Data produced on completion, consumed by successor imports.
    pub results: Payload,
    /// Recorded cause when the state is `Failed`.
    pub failure: Option<String>,
    /// Optimistic concurrency token, checked by the store on every write.
    pub version: u64,
    pub created_at: Timestamp,
}

impl NodeInstance {
    pub fn new(
        instance: InstanceHandle,
        node: NodeId,
        state: NodeInstanceState,
        predecessors: Vec<NodeInstanceHandle>,
    ) -> Self {
        Self {
            handle: NodeInstanceHandle::new(),
            instance,
            node,
            state,
            predecessors,
            results: Payload::new(),
            failure: None,
            version: 0,
            created_at: now_ms(),
        }
    }

    /// Number of predecessor branches that have arrived at this occurrence.
    pub fn arrivals(&self) -> usize {
        self.predecessors.len()
    }
}
