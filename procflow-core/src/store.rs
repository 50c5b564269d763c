use crate::events::RuntimeEvent;
use crate::model::ProcessModel;
use crate::types::{
    InstanceHandle, ModelHandle, NodeId, NodeInstance, NodeInstanceHandle, Principal,
    ProcessInstance,
};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

// ─── Store errors ─────────────────────────────────────────────

/// Failures at the transactional store boundary.
///
/// `Conflict` is the optimistic-versioning signal: the record changed since
/// it was read. The engine retries the single failed step from a fresh read,
/// never the whole instance.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("optimistic version conflict")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("store backend failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ─── Store trait ──────────────────────────────────────────────

/// Persistence boundary for all engine state.
///
/// The engine operates exclusively through this trait, enabling pluggable
/// backends ([`crate::store_memory::MemoryStore`] for tests and embedding, a
/// database for production). Every `update_*` call is version-checked: the
/// write lands only if the record's `version` still matches the stored one,
/// and the stored version then increments. That check is the unit of
/// isolation the engine's step-retry loop relies on.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    // ── Models ──

    /// Register a model. Registration is idempotent over the model's uuid:
    /// re-registering an identical model (same uuid, same fingerprint)
    /// returns the existing handle.
    async fn put_model(&self, model: ProcessModel) -> StoreResult<ModelHandle>;
    async fn get_model(&self, handle: ModelHandle) -> StoreResult<Option<Arc<ProcessModel>>>;
    async fn find_model_by_uuid(&self, uuid: Uuid) -> StoreResult<Option<Arc<ProcessModel>>>;

    // ── Process instances ──

    async fn insert_instance(&self, instance: &ProcessInstance) -> StoreResult<()>;
    async fn get_instance(&self, handle: InstanceHandle) -> StoreResult<Option<ProcessInstance>>;
    /// Version-checked write. Returns the new version on success.
    async fn update_instance(&self, instance: &ProcessInstance) -> StoreResult<u64>;
    async fn list_instances(&self, owner: &Principal) -> StoreResult<Vec<ProcessInstance>>;
    /// Remove an instance with its node instances and event history.
    async fn remove_instance(&self, handle: InstanceHandle) -> StoreResult<()>;

    // ── Node instances ──

    async fn insert_node_instance(&self, ni: &NodeInstance) -> StoreResult<()>;
    async fn get_node_instance(
        &self,
        handle: NodeInstanceHandle,
    ) -> StoreResult<Option<NodeInstance>>;
    /// Version-checked write. Returns the new version on success.
    async fn update_node_instance(&self, ni: &NodeInstance) -> StoreResult<u64>;
    async fn list_node_instances(&self, instance: InstanceHandle)
        -> StoreResult<Vec<NodeInstance>>;
    /// At most one occurrence per node per instance (models are acyclic).
    async fn find_node_instance(
        &self,
        instance: InstanceHandle,
        node: &NodeId,
    ) -> StoreResult<Option<NodeInstance>>;

    // ── Event log (append-only) ──

    /// Append an event and return its sequence number.
    async fn append_event(
        &self,
        instance: InstanceHandle,
        event: &RuntimeEvent,
    ) -> StoreResult<u64>;
    async fn read_events(
        &self,
        instance: InstanceHandle,
        from_seq: u64,
    ) -> StoreResult<Vec<(u64, RuntimeEvent)>>;
}
