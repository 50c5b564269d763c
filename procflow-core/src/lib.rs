//! procflow-core — workflow graph model and runtime execution engine.
//!
//! A process is a directed acyclic graph of typed nodes (start, activity,
//! split, join, end), authored through predecessor links and validated into
//! an immutable [`model::ProcessModel`]. The [`engine::Engine`] instantiates
//! running copies, tracks each node occurrence through a state machine,
//! dispatches activity work to an external [`dispatch::MessageTransport`],
//! and applies tagged completion outcomes back onto the run.
//!
//! All runtime state lives behind the [`store::InstanceStore`] trait with
//! optimistic per-record versioning; [`store_memory::MemoryStore`] is the
//! bundled backend for tests and embedded use.

pub mod condition;
pub mod dispatch;
pub mod engine;
pub mod events;
pub mod model;
pub mod state;
pub mod store;
pub mod store_memory;
pub mod types;

pub use condition::Condition;
pub use dispatch::{
    CompletionEnvelope, CompletionOutcome, DispatchError, MessageTransport, OutboundMessage,
    TaskEvent,
};
pub use engine::{Engine, EngineError};
pub use events::RuntimeEvent;
pub use model::{
    DataBinding, MessageTemplate, ModelBuilder, ModelError, NodeKind, ProcessModel, ProcessNode,
};
pub use store::{InstanceStore, StoreError};
pub use store_memory::MemoryStore;
pub use types::{
    InstanceHandle, InstanceState, ModelHandle, NodeId, NodeInstance, NodeInstanceHandle,
    NodeInstanceState, Payload, Principal, ProcessInstance, Timestamp,
};
