use crate::events::RuntimeEvent;
use crate::model::ProcessModel;
use crate::store::{InstanceStore, StoreError, StoreResult};
use crate::types::{
    InstanceHandle, ModelHandle, NodeId, NodeInstance, NodeInstanceHandle, Principal,
    ProcessInstance,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    models: HashMap<ModelHandle, Arc<ProcessModel>>,
    models_by_uuid: HashMap<Uuid, ModelHandle>,
    instances: HashMap<InstanceHandle, ProcessInstance>,
    node_instances: HashMap<NodeInstanceHandle, NodeInstance>,
    by_instance: HashMap<InstanceHandle, Vec<NodeInstanceHandle>>,
    events: HashMap<InstanceHandle, Vec<(u64, RuntimeEvent)>>,
}

/// In-memory [`InstanceStore`] for tests and embedded use.
///
/// Implements the same optimistic-versioning contract a database backend
/// would: updates compare the incoming record's version against the stored
/// one and fail with [`StoreError::Conflict`] on mismatch.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))
    }

    fn write(&self) -> StoreResult<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn put_model(&self, model: ProcessModel) -> StoreResult<ModelHandle> {
        let mut inner = self.write()?;
        if let Some(existing_handle) = inner.models_by_uuid.get(&model.uuid()).copied() {
            if let Some(existing) = inner.models.get(&existing_handle) {
                if existing.fingerprint() == model.fingerprint() {
                    return Ok(existing_handle);
                }
            }
        }
        let handle = model.handle();
        inner.models_by_uuid.insert(model.uuid(), handle);
        inner.models.insert(handle, Arc::new(model));
        Ok(handle)
    }

    async fn get_model(&self, handle: ModelHandle) -> StoreResult<Option<Arc<ProcessModel>>> {
        Ok(self.read()?.models.get(&handle).cloned())
    }

    async fn find_model_by_uuid(&self, uuid: Uuid) -> StoreResult<Option<Arc<ProcessModel>>> {
        let inner = self.read()?;
        Ok(inner
            .models_by_uuid
            .get(&uuid)
            .and_then(|h| inner.models.get(h))
            .cloned())
    }

    async fn insert_instance(&self, instance: &ProcessInstance) -> StoreResult<()> {
        let mut inner = self.write()?;
        inner.instances.insert(instance.handle, instance.clone());
        inner.by_instance.entry(instance.handle).or_default();
        Ok(())
    }

    async fn get_instance(&self, handle: InstanceHandle) -> StoreResult<Option<ProcessInstance>> {
        Ok(self.read()?.instances.get(&handle).cloned())
    }

    async fn update_instance(&self, instance: &ProcessInstance) -> StoreResult<u64> {
        let mut inner = self.write()?;
        let stored = inner
            .instances
            .get_mut(&instance.handle)
            .ok_or(StoreError::NotFound)?;
        if stored.version != instance.version {
            return Err(StoreError::Conflict);
        }
        *stored = instance.clone();
        stored.version += 1;
        Ok(stored.version)
    }

    async fn list_instances(&self, owner: &Principal) -> StoreResult<Vec<ProcessInstance>> {
        let inner = self.read()?;
        let mut out: Vec<ProcessInstance> = inner
            .instances
            .values()
            .filter(|i| &i.owner == owner)
            .cloned()
            .collect();
        out.sort_by_key(|i| i.handle);
        Ok(out)
    }

    async fn remove_instance(&self, handle: InstanceHandle) -> StoreResult<()> {
        let mut inner = self.write()?;
        inner.instances.remove(&handle).ok_or(StoreError::NotFound)?;
        if let Some(handles) = inner.by_instance.remove(&handle) {
            for h in handles {
                inner.node_instances.remove(&h);
            }
        }
        inner.events.remove(&handle);
        Ok(())
    }

    async fn insert_node_instance(&self, ni: &NodeInstance) -> StoreResult<()> {
        let mut inner = self.write()?;
        inner.node_instances.insert(ni.handle, ni.clone());
        inner.by_instance.entry(ni.instance).or_default().push(ni.handle);
        Ok(())
    }

    async fn get_node_instance(
        &self,
        handle: NodeInstanceHandle,
    ) -> StoreResult<Option<NodeInstance>> {
        Ok(self.read()?.node_instances.get(&handle).cloned())
    }

    async fn update_node_instance(&self, ni: &NodeInstance) -> StoreResult<u64> {
        let mut inner = self.write()?;
        let stored = inner
            .node_instances
            .get_mut(&ni.handle)
            .ok_or(StoreError::NotFound)?;
        if stored.version != ni.version {
            return Err(StoreError::Conflict);
        }
        *stored = ni.clone();
        stored.version += 1;
        Ok(stored.version)
    }

    async fn list_node_instances(
        &self,
        instance: InstanceHandle,
    ) -> StoreResult<Vec<NodeInstance>> {
        let inner = self.read()?;
        let handles = inner.by_instance.get(&instance).cloned().unwrap_or_default();
        Ok(handles
            .iter()
            .filter_map(|h| inner.node_instances.get(h))
            .cloned()
            .collect())
    }

    async fn find_node_instance(
        &self,
        instance: InstanceHandle,
        node: &NodeId,
    ) -> StoreResult<Option<NodeInstance>> {
        let inner = self.read()?;
        let handles = inner.by_instance.get(&instance).cloned().unwrap_or_default();
        Ok(handles
            .iter()
            .filter_map(|h| inner.node_instances.get(h))
            .find(|ni| &ni.node == node)
            .cloned())
    }

    async fn append_event(
        &self,
        instance: InstanceHandle,
        event: &RuntimeEvent,
    ) -> StoreResult<u64> {
        let mut inner = self.write()?;
        let log = inner.events.entry(instance).or_default();
        let seq = log.last().map(|(s, _)| s + 1).unwrap_or(1);
        log.push((seq, event.clone()));
        Ok(seq)
    }

    async fn read_events(
        &self,
        instance: InstanceHandle,
        from_seq: u64,
    ) -> StoreResult<Vec<(u64, RuntimeEvent)>> {
        let inner = self.read()?;
        Ok(inner
            .events
            .get(&instance)
            .map(|log| {
                log.iter()
                    .filter(|(seq, _)| *seq >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelBuilder, ProcessNode};
    use crate::types::{NodeInstanceState, Payload};

    fn linear_model() -> ProcessModel {
        ModelBuilder::new("m")
            .node(ProcessNode::start("s"))
            .node(ProcessNode::activity("a", "s"))
            .node(ProcessNode::end("e", "a"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn model_registration_is_idempotent_over_uuid() {
        let store = MemoryStore::new();
        let uuid = Uuid::now_v7();

        let first = ModelBuilder::new("m")
            .uuid(uuid)
            .node(ProcessNode::start("s"))
            .node(ProcessNode::activity("a", "s"))
            .node(ProcessNode::end("e", "a"))
            .build()
            .unwrap();
        let second = ModelBuilder::new("m")
            .uuid(uuid)
            .node(ProcessNode::start("s"))
            .node(ProcessNode::activity("a", "s"))
            .node(ProcessNode::end("e", "a"))
            .build()
            .unwrap();

        let h1 = store.put_model(first).await.unwrap();
        let h2 = store.put_model(second).await.unwrap();
        assert_eq!(h1, h2, "identical re-registration returns the same handle");

        let found = store.find_model_by_uuid(uuid).await.unwrap().unwrap();
        assert_eq!(found.handle(), h1);
    }

    #[tokio::test]
    async fn version_conflict_on_stale_write() {
        let store = MemoryStore::new();
        let model = linear_model();
        let handle = store.put_model(model).await.unwrap();

        let instance = ProcessInstance::new(
            handle,
            Principal::new("alice"),
            Uuid::now_v7(),
            Payload::new(),
        );
        store.insert_instance(&instance).await.unwrap();

        let mut copy_a = store.get_instance(instance.handle).await.unwrap().unwrap();
        let mut copy_b = copy_a.clone();

        copy_a.error_count = 1;
        let v = store.update_instance(&copy_a).await.unwrap();
        assert_eq!(v, 1);

        copy_b.error_count = 2;
        let err = store.update_instance(&copy_b).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
    }

    #[tokio::test]
    async fn node_instance_update_is_version_checked() {
        let store = MemoryStore::new();
        let instance = InstanceHandle::new();
        let ni = NodeInstance::new(instance, "a".into(), NodeInstanceState::Pending, vec![]);
        store.insert_node_instance(&ni).await.unwrap();

        let mut fresh = store.get_node_instance(ni.handle).await.unwrap().unwrap();
        fresh.state = NodeInstanceState::Sent;
        let v = store.update_node_instance(&fresh).await.unwrap();
        assert_eq!(v, 1);

        // The copy read before the update is now stale.
        let mut stale = ni.clone();
        stale.state = NodeInstanceState::Cancelled;
        assert!(matches!(
            store.update_node_instance(&stale).await.unwrap_err(),
            StoreError::Conflict
        ));
    }

    #[tokio::test]
    async fn events_are_sequenced_per_instance() {
        let store = MemoryStore::new();
        let instance = InstanceHandle::new();
        let e = RuntimeEvent::TickleRequested {
            by: Principal::new("alice"),
        };
        assert_eq!(store.append_event(instance, &e).await.unwrap(), 1);
        assert_eq!(store.append_event(instance, &e).await.unwrap(), 2);

        let all = store.read_events(instance, 1).await.unwrap();
        assert_eq!(all.len(), 2);
        let tail = store.read_events(instance, 2).await.unwrap();
        assert_eq!(tail.len(), 1);
    }

    #[tokio::test]
    async fn remove_instance_drops_history() {
        let store = MemoryStore::new();
        let model = linear_model();
        let handle = store.put_model(model).await.unwrap();
        let instance = ProcessInstance::new(
            handle,
            Principal::new("alice"),
            Uuid::now_v7(),
            Payload::new(),
        );
        store.insert_instance(&instance).await.unwrap();
        let ni = NodeInstance::new(
            instance.handle,
            "a".into(),
            NodeInstanceState::Pending,
            vec![],
        );
        store.insert_node_instance(&ni).await.unwrap();
        store
            .append_event(
                instance.handle,
                &RuntimeEvent::TickleRequested {
                    by: Principal::new("alice"),
                },
            )
            .await
            .unwrap();

        store.remove_instance(instance.handle).await.unwrap();
        assert!(store.get_instance(instance.handle).await.unwrap().is_none());
        assert!(store.get_node_instance(ni.handle).await.unwrap().is_none());
        assert!(store
            .read_events(instance.handle, 1)
            .await
            .unwrap()
            .is_empty());
    }
}
