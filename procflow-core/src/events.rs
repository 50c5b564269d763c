use crate::types::{
    InstanceHandle, ModelHandle, NodeId, NodeInstanceHandle, NodeInstanceState, Principal,
};
use serde::{Deserialize, Serialize};

/// Runtime events — the durable audit trail for every process instance.
///
/// Appended by the engine inside the same logical step as the state change
/// they describe; read back for history, diagnostics, and tests.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RuntimeEvent {
    InstanceStarted {
        instance: InstanceHandle,
        model: ModelHandle,
        owner: Principal,
    },
    NodeInstanceCreated {
        node_instance: NodeInstanceHandle,
        node: NodeId,
        state: NodeInstanceState,
    },
    StateChanged {
        node_instance: NodeInstanceHandle,
        from: NodeInstanceState,
        to: NodeInstanceState,
    },
    MessageDispatched {
        node_instance: NodeInstanceHandle,
        service: String,
        operation: String,
    },
    TaskEventApplied {
        node_instance: NodeInstanceHandle,
        to: NodeInstanceState,
    },
    CompletionApplied {
        node_instance: NodeInstanceHandle,
        to: NodeInstanceState,
    },
    /// A completion arrived for a node instance already in a terminal
    /// state; it was discarded without touching state.
    LateCompletionIgnored {
        node_instance: NodeInstanceHandle,
        state: NodeInstanceState,
    },
    JoinArrived {
        node_instance: NodeInstanceHandle,
        arrivals: usize,
    },
    /// More branches arrived than the join's `max` admits: a split/join
    /// mismatch between model and run, surfaced rather than dropped.
    JoinOverflow {
        node_instance: NodeInstanceHandle,
        arrivals: usize,
        max: u32,
    },
    /// A pending join whose remaining branches could no longer reach `min`
    /// was resolved as skipped during the termination sweep.
    JoinSkipped {
        node_instance: NodeInstanceHandle,
    },
    /// Entry condition evaluated false; the node occurrence was created in
    /// the `Skipped` state.
    ConditionSkipped {
        node_instance: NodeInstanceHandle,
        node: NodeId,
    },
    InstanceFinished {
        completed_ends: usize,
        expected_ends: usize,
    },
    InstanceCancelled {
        by: Principal,
    },
    TickleRequested {
        by: Principal,
    },
    InstancePurged {
        by: Principal,
    },
}
