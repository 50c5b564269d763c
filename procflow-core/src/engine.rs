use crate::dispatch::{
    build_message, response_override, CompletionEnvelope, CompletionOutcome, MessageTransport,
    TaskEvent,
};
use crate::events::RuntimeEvent;
use crate::model::{NodeKind, ProcessModel, ProcessNode};
use crate::state::can_transition;
use crate::store::{InstanceStore, StoreError};
use crate::types::{
    InstanceHandle, InstanceState, ModelHandle, NodeId, NodeInstance, NodeInstanceHandle,
    NodeInstanceState, Payload, Principal, ProcessInstance,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded retries for a single optimistic step. A conflict means another
/// writer landed first; the step is re-run from a fresh read.
const MAX_CONFLICT_RETRIES: usize = 8;

// ─── Engine errors ────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unknown model {0:?}")]
    UnknownModel(ModelHandle),
    #[error("unknown instance {0:?}")]
    UnknownInstance(InstanceHandle),
    #[error("unknown node instance {0:?}")]
    UnknownNodeInstance(NodeInstanceHandle),
    #[error("model references unknown node '{0}'")]
    UnknownNode(NodeId),
    #[error("illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: NodeInstanceState,
        to: NodeInstanceState,
    },
    #[error("join '{node}': {arrivals} arrivals exceed max {max}")]
    JoinOverflow {
        node: NodeId,
        arrivals: usize,
        max: u32,
    },
    #[error("principal '{0}' does not own this instance")]
    NotOwner(Principal),
    #[error("instance {0:?} is still active")]
    InstanceActive(InstanceHandle),
}

// ─── Engine ───────────────────────────────────────────────────

/// The process instance coordinator.
///
/// Drives one or more process instances from creation to termination: it
/// creates node occurrences when predecessors complete, auto-advances
/// structural nodes, commits the `Sent` transition before handing activity
/// work to the transport, and maps completion outcomes back onto the state
/// machine. All mutation goes through the store, one optimistic transaction
/// per logical step; no lock is ever held across transport I/O.
pub struct Engine {
    store: Arc<dyn InstanceStore>,
    transport: Arc<dyn MessageTransport>,
}

impl Engine {
    pub fn new(store: Arc<dyn InstanceStore>, transport: Arc<dyn MessageTransport>) -> Self {
        Self { store, transport }
    }

    // ── Lifecycle entry points ──

    /// Create and start a process instance. Binds the initial payload via
    /// each start node's imports, creates one occurrence per start node and
    /// advances them.
    pub async fn start(
        &self,
        model_handle: ModelHandle,
        owner: Principal,
        uuid: Uuid,
        initial: &Payload,
    ) -> Result<InstanceHandle, EngineError> {
        let model = self.require_model(model_handle).await?;

        let mut data = Payload::new();
        for start_id in model.start_nodes() {
            let node = self.require_node(&model, start_id)?;
            if let NodeKind::Start { imports } = &node.kind {
                for binding in imports {
                    let value = initial.get(&binding.source).cloned().unwrap_or(Value::Null);
                    data.insert(binding.name.clone(), value);
                }
            }
        }

        let instance = ProcessInstance::new(model_handle, owner.clone(), uuid, data);
        let handle = instance.handle;
        self.store.insert_instance(&instance).await?;
        self.store
            .append_event(
                handle,
                &RuntimeEvent::InstanceStarted {
                    instance: handle,
                    model: model_handle,
                    owner,
                },
            )
            .await?;
        info!(instance = %handle.0, model = %model.name(), "process instance started");

        let mut worklist = VecDeque::new();
        for start_id in model.start_nodes() {
            let node = self.require_node(&model, start_id)?;
            let ni = self.create_occurrence(&instance, node, vec![]).await?;
            if let Some(done) = self.drive(node, ni).await? {
                worklist.push_back(done);
            }
        }

        let advanced = self.propagate(worklist).await;
        self.check_termination(handle).await?;
        advanced.map(|_| handle)
    }

    /// Re-evaluate successors of a completed node occurrence. Driven
    /// internally on every completion; public for external recovery tooling.
    pub async fn advance(&self, handle: NodeInstanceHandle) -> Result<(), EngineError> {
        let ni = self.require_node_instance(handle).await?;
        let advanced = self.propagate(VecDeque::from([handle])).await;
        self.check_termination(ni.instance).await?;
        advanced
    }

    /// Apply one tagged completion outcome to the node occurrence it names.
    /// Late completions on terminal occurrences are discarded, never applied.
    pub async fn apply_completion(
        &self,
        envelope: CompletionEnvelope,
    ) -> Result<(), EngineError> {
        let Some(ni) = self.store.get_node_instance(envelope.node_instance).await? else {
            warn!(node_instance = %envelope.node_instance.0, "completion for unknown node instance discarded");
            return Ok(());
        };
        let instance = self.require_instance(ni.instance).await?;
        if instance.owner != envelope.owner {
            return Err(EngineError::NotOwner(envelope.owner));
        }
        if ni.state.is_terminal() {
            warn!(
                node_instance = %ni.handle.0,
                state = ?ni.state,
                "late completion discarded"
            );
            self.store
                .append_event(
                    instance.handle,
                    &RuntimeEvent::LateCompletionIgnored {
                        node_instance: ni.handle,
                        state: ni.state,
                    },
                )
                .await?;
            return Ok(());
        }

        let model = self.require_model(instance.model).await?;
        let advanced = match envelope.outcome {
            CompletionOutcome::Success(payload) => match response_override(payload) {
                Err(cause) => {
                    self.fail_node(ni.handle, cause).await?;
                    self.record_completion(instance.handle, ni.handle, NodeInstanceState::Failed)
                        .await?;
                    Ok(())
                }
                Ok((target, results)) => {
                    match target.unwrap_or(NodeInstanceState::Complete) {
                        NodeInstanceState::Complete => {
                            self.complete_node(&model, ni.handle, results).await?;
                            self.record_completion(
                                instance.handle,
                                ni.handle,
                                NodeInstanceState::Complete,
                            )
                            .await?;
                            self.propagate(VecDeque::from([ni.handle])).await
                        }
                        NodeInstanceState::Failed => {
                            self.fail_node(ni.handle, "activity reported failure".into())
                                .await?;
                            self.record_completion(
                                instance.handle,
                                ni.handle,
                                NodeInstanceState::Failed,
                            )
                            .await?;
                            Ok(())
                        }
                        NodeInstanceState::Cancelled => {
                            self.set_state(ni.handle, NodeInstanceState::Cancelled).await?;
                            self.record_completion(
                                instance.handle,
                                ni.handle,
                                NodeInstanceState::Cancelled,
                            )
                            .await?;
                            Ok(())
                        }
                        other => Err(EngineError::IllegalTransition {
                            from: ni.state,
                            to: other,
                        }),
                    }
                }
            },
            CompletionOutcome::Failure(cause) => {
                self.fail_node(ni.handle, cause).await?;
                self.record_completion(instance.handle, ni.handle, NodeInstanceState::Failed)
                    .await?;
                Ok(())
            }
            CompletionOutcome::Cancelled => {
                self.set_state(ni.handle, NodeInstanceState::Cancelled).await?;
                self.record_completion(instance.handle, ni.handle, NodeInstanceState::Cancelled)
                    .await?;
                Ok(())
            }
        };

        self.check_termination(instance.handle).await?;
        advanced
    }

    /// Worker-driven dispatch progress: acknowledged / taken / started.
    pub async fn apply_task_event(
        &self,
        handle: NodeInstanceHandle,
        owner: &Principal,
        event: TaskEvent,
    ) -> Result<(), EngineError> {
        let Some(ni) = self.store.get_node_instance(handle).await? else {
            warn!(node_instance = %handle.0, "task event for unknown node instance discarded");
            return Ok(());
        };
        let instance = self.require_instance(ni.instance).await?;
        if &instance.owner != owner {
            return Err(EngineError::NotOwner(owner.clone()));
        }
        if ni.state.is_terminal() {
            warn!(node_instance = %handle.0, state = ?ni.state, "task event on terminal occurrence discarded");
            return Ok(());
        }
        let to = event.target_state();
        self.set_state(handle, to).await?;
        self.store
            .append_event(
                instance.handle,
                &RuntimeEvent::TaskEventApplied {
                    node_instance: handle,
                    to,
                },
            )
            .await?;
        Ok(())
    }

    /// Cancel an instance: every non-terminal node occurrence becomes
    /// `Cancelled` and in-flight dispatches get a best-effort transport
    /// cancellation. Idempotent.
    pub async fn cancel(
        &self,
        handle: InstanceHandle,
        principal: &Principal,
    ) -> Result<(), EngineError> {
        let instance = self.require_instance(handle).await?;
        if &instance.owner != principal {
            return Err(EngineError::NotOwner(principal.clone()));
        }
        if instance.state.is_terminal() {
            return Ok(());
        }

        for ni in self.store.list_node_instances(handle).await? {
            if ni.state.is_terminal() {
                continue;
            }
            let was_dispatched = ni.state.is_dispatched();
            if self.cancel_node(ni.handle).await? && was_dispatched {
                self.transport.cancel(ni.handle).await;
            }
        }

        self.mutate_instance(handle, |i| i.state = InstanceState::Cancelled)
            .await?;
        self.store
            .append_event(
                handle,
                &RuntimeEvent::InstanceCancelled {
                    by: principal.clone(),
                },
            )
            .await?;
        info!(instance = %handle.0, by = %principal, "process instance cancelled");
        Ok(())
    }

    /// Re-drive an instance whose external dispatch may have been lost:
    /// pending occurrences are advanced or re-dispatched, in-flight
    /// activities are re-sent, and completed occurrences re-propagate.
    /// Completed work is never duplicated.
    pub async fn tickle(
        &self,
        handle: InstanceHandle,
        principal: &Principal,
    ) -> Result<(), EngineError> {
        let instance = self.require_instance(handle).await?;
        if &instance.owner != principal {
            return Err(EngineError::NotOwner(principal.clone()));
        }
        if instance.state.is_terminal() {
            return Ok(());
        }
        self.store
            .append_event(
                handle,
                &RuntimeEvent::TickleRequested {
                    by: principal.clone(),
                },
            )
            .await?;
        info!(instance = %handle.0, "tickle requested");

        let model = self.require_model(instance.model).await?;
        let mut worklist = VecDeque::new();
        for ni in self.store.list_node_instances(handle).await? {
            let node = self.require_node(&model, &ni.node)?;
            match ni.state {
                NodeInstanceState::Pending => {
                    if let Some(done) = self.drive(node, ni).await? {
                        worklist.push_back(done);
                    }
                }
                NodeInstanceState::Sent | NodeInstanceState::Acknowledged => {
                    self.resend(&ni, node).await?;
                }
                NodeInstanceState::Complete => {
                    // Re-propagate in case a crash lost the advance;
                    // arrival bookkeeping deduplicates.
                    worklist.push_back(ni.handle);
                }
                _ => {}
            }
        }

        let advanced = self.propagate(worklist).await;
        self.check_termination(handle).await?;
        advanced
    }

    /// Remove a terminal instance together with its node occurrences and
    /// event history.
    pub async fn purge(
        &self,
        handle: InstanceHandle,
        principal: &Principal,
    ) -> Result<(), EngineError> {
        let instance = self.require_instance(handle).await?;
        if &instance.owner != principal {
            return Err(EngineError::NotOwner(principal.clone()));
        }
        if !instance.state.is_terminal() {
            return Err(EngineError::InstanceActive(handle));
        }
        self.store
            .append_event(
                handle,
                &RuntimeEvent::InstancePurged {
                    by: principal.clone(),
                },
            )
            .await?;
        self.store.remove_instance(handle).await?;
        info!(instance = %handle.0, "process instance purged");
        Ok(())
    }

    /// Consume a completion channel until it closes, applying each envelope.
    /// Application errors are logged and do not stop the pump.
    pub async fn run_completions(&self, mut rx: mpsc::Receiver<CompletionEnvelope>) {
        while let Some(envelope) = rx.recv().await {
            if let Err(err) = self.apply_completion(envelope).await {
                warn!(error = %err, "completion application failed");
            }
        }
    }

    // ── Successor propagation ──

    /// Worklist-driven successor evaluation: pop a completed occurrence,
    /// derive each successor occurrence, push whatever completed in turn.
    async fn propagate(
        &self,
        mut worklist: VecDeque<NodeInstanceHandle>,
    ) -> Result<(), EngineError> {
        while let Some(handle) = worklist.pop_front() {
            let ni = self.require_node_instance(handle).await?;
            if ni.state != NodeInstanceState::Complete {
                continue;
            }
            let instance = self.require_instance(ni.instance).await?;
            let model = self.require_model(instance.model).await?;
            let node = self.require_node(&model, &ni.node)?;
            for succ_id in &node.successors {
                if let Some(done) = self.arrive(&model, &instance, succ_id, &ni).await? {
                    worklist.push_back(done);
                }
            }
        }
        Ok(())
    }

    /// One predecessor arrival at a successor node: create the occurrence on
    /// first arrival, update join bookkeeping on later ones. Returns the
    /// occurrence handle when the arrival completed it synchronously.
    async fn arrive(
        &self,
        model: &ProcessModel,
        instance: &ProcessInstance,
        succ_id: &NodeId,
        pred: &NodeInstance,
    ) -> Result<Option<NodeInstanceHandle>, EngineError> {
        let node = self.require_node(model, succ_id)?;

        for _ in 0..MAX_CONFLICT_RETRIES {
            let existing = self.store.find_node_instance(instance.handle, succ_id).await?;
            let Some(mut existing) = existing else {
                // First arrival: create the occurrence (joins are created
                // lazily here too) and evaluate its entry condition against
                // fresh instance data.
                let fresh = self.require_instance(instance.handle).await?;
                let ni = self
                    .create_occurrence(&fresh, node, vec![pred.handle])
                    .await?;
                if ni.state == NodeInstanceState::Skipped {
                    return Ok(None);
                }
                if node.is_join() {
                    self.store
                        .append_event(
                            instance.handle,
                            &RuntimeEvent::JoinArrived {
                                node_instance: ni.handle,
                                arrivals: 1,
                            },
                        )
                        .await?;
                }
                return self.drive(node, ni).await;
            };

            if existing.predecessors.contains(&pred.handle) {
                // Duplicate arrival (tickle or re-delivered advance).
                return Ok(None);
            }

            let Some((min, max)) = node.join_bounds() else {
                warn!(
                    node = %succ_id,
                    "second arrival at a non-join occurrence ignored"
                );
                return Ok(None);
            };

            let arrivals = existing.arrivals() + 1;
            if arrivals > max as usize {
                self.store
                    .append_event(
                        instance.handle,
                        &RuntimeEvent::JoinOverflow {
                            node_instance: existing.handle,
                            arrivals,
                            max,
                        },
                    )
                    .await?;
                warn!(node = %succ_id, arrivals, max, "join overflow");
                return Err(EngineError::JoinOverflow {
                    node: succ_id.clone(),
                    arrivals,
                    max,
                });
            }

            existing.predecessors.push(pred.handle);
            match self.store.update_node_instance(&existing).await {
                Ok(version) => {
                    existing.version = version;
                    self.store
                        .append_event(
                            instance.handle,
                            &RuntimeEvent::JoinArrived {
                                node_instance: existing.handle,
                                arrivals,
                            },
                        )
                        .await?;
                    if existing.state == NodeInstanceState::Pending && arrivals >= min as usize {
                        return self.drive(node, existing).await;
                    }
                    return Ok(None);
                }
                Err(StoreError::Conflict) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(EngineError::Store(StoreError::Conflict))
    }

    /// Create a node occurrence: `Pending` when the entry condition holds,
    /// terminal `Skipped` otherwise.
    async fn create_occurrence(
        &self,
        instance: &ProcessInstance,
        node: &ProcessNode,
        predecessors: Vec<NodeInstanceHandle>,
    ) -> Result<NodeInstance, EngineError> {
        let state = if node.condition_holds(&instance.data) {
            NodeInstanceState::Pending
        } else {
            NodeInstanceState::Skipped
        };
        let ni = NodeInstance::new(instance.handle, node.id.clone(), state, predecessors);
        self.store.insert_node_instance(&ni).await?;
        self.store
            .append_event(
                instance.handle,
                &RuntimeEvent::NodeInstanceCreated {
                    node_instance: ni.handle,
                    node: node.id.clone(),
                    state,
                },
            )
            .await?;
        if state == NodeInstanceState::Skipped {
            debug!(node = %node.id, "entry condition false, occurrence skipped");
            self.store
                .append_event(
                    instance.handle,
                    &RuntimeEvent::ConditionSkipped {
                        node_instance: ni.handle,
                        node: node.id.clone(),
                    },
                )
                .await?;
        }
        Ok(ni)
    }

    /// Drive a pending occurrence one step. Structural nodes run the
    /// synchronous `Pending → Taken → Started → Complete` chain (a join only
    /// once its threshold is met); activities dispatch and wait.
    async fn drive(
        &self,
        node: &ProcessNode,
        ni: NodeInstance,
    ) -> Result<Option<NodeInstanceHandle>, EngineError> {
        if ni.state != NodeInstanceState::Pending {
            return Ok(None);
        }
        if node.provide_auto() {
            if let Some((min, _)) = node.join_bounds() {
                if ni.arrivals() < min as usize {
                    return Ok(None);
                }
            }
            self.set_state(ni.handle, NodeInstanceState::Taken).await?;
            self.set_state(ni.handle, NodeInstanceState::Started).await?;
            self.set_state(ni.handle, NodeInstanceState::Complete).await?;
            Ok(Some(ni.handle))
        } else {
            self.dispatch_activity(node, ni).await?;
            Ok(None)
        }
    }

    /// Dispatch an activity. The `Sent` transition is committed before the
    /// send leaves: a crash between commit and send is recoverable via
    /// tickle. A rejected send marks the occurrence `Failed`.
    async fn dispatch_activity(
        &self,
        node: &ProcessNode,
        ni: NodeInstance,
    ) -> Result<(), EngineError> {
        let NodeKind::Activity {
            message, imports, ..
        } = &node.kind
        else {
            return Ok(());
        };
        self.set_state(ni.handle, NodeInstanceState::Sent).await?;

        let instance = self.require_instance(ni.instance).await?;
        let msg = build_message(
            ni.handle,
            instance.handle,
            instance.owner.clone(),
            message,
            imports,
            &instance.data,
        );
        self.store
            .append_event(
                instance.handle,
                &RuntimeEvent::MessageDispatched {
                    node_instance: ni.handle,
                    service: msg.service.clone(),
                    operation: msg.operation.clone(),
                },
            )
            .await?;
        debug!(node = %node.id, service = %msg.service, "activity dispatched");

        match self.transport.send(msg).await {
            Ok(()) => {
                self.set_state(ni.handle, NodeInstanceState::Acknowledged).await?;
            }
            Err(err) => {
                warn!(node = %node.id, error = %err, "dispatch failed");
                self.fail_node(ni.handle, err.to_string()).await?;
            }
        }
        Ok(())
    }

    /// Re-send an in-flight activity without a state change (tickle path).
    async fn resend(&self, ni: &NodeInstance, node: &ProcessNode) -> Result<(), EngineError> {
        let NodeKind::Activity {
            message, imports, ..
        } = &node.kind
        else {
            return Ok(());
        };
        let instance = self.require_instance(ni.instance).await?;
        let msg = build_message(
            ni.handle,
            instance.handle,
            instance.owner.clone(),
            message,
            imports,
            &instance.data,
        );
        self.store
            .append_event(
                instance.handle,
                &RuntimeEvent::MessageDispatched {
                    node_instance: ni.handle,
                    service: msg.service.clone(),
                    operation: msg.operation.clone(),
                },
            )
            .await?;
        match self.transport.send(msg).await {
            Ok(()) => {
                if ni.state == NodeInstanceState::Sent {
                    self.set_state(ni.handle, NodeInstanceState::Acknowledged).await?;
                }
            }
            Err(err) => {
                warn!(node = %node.id, error = %err, "re-dispatch failed");
                self.fail_node(ni.handle, err.to_string()).await?;
            }
        }
        Ok(())
    }

    // ── State writes (one optimistic transaction each) ──

    /// Transition an occurrence, validated against the state table and
    /// retried from a fresh read on version conflict. A no-op when the
    /// occurrence is already in the target state.
    async fn set_state(
        &self,
        handle: NodeInstanceHandle,
        to: NodeInstanceState,
    ) -> Result<NodeInstance, EngineError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let mut ni = self.require_node_instance(handle).await?;
            if ni.state == to {
                return Ok(ni);
            }
            if !can_transition(ni.state, to) {
                return Err(EngineError::IllegalTransition { from: ni.state, to });
            }
            let from = ni.state;
            ni.state = to;
            match self.store.update_node_instance(&ni).await {
                Ok(version) => {
                    ni.version = version;
                    self.store
                        .append_event(
                            ni.instance,
                            &RuntimeEvent::StateChanged {
                                node_instance: handle,
                                from,
                                to,
                            },
                        )
                        .await?;
                    debug!(node = %ni.node, ?from, ?to, "state changed");
                    return Ok(ni);
                }
                Err(StoreError::Conflict) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(EngineError::Store(StoreError::Conflict))
    }

    /// Cancel one occurrence; returns false when it raced into a terminal
    /// state first.
    async fn cancel_node(&self, handle: NodeInstanceHandle) -> Result<bool, EngineError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let mut ni = self.require_node_instance(handle).await?;
            if ni.state.is_terminal() {
                return Ok(ni.state == NodeInstanceState::Cancelled);
            }
            let from = ni.state;
            ni.state = NodeInstanceState::Cancelled;
            match self.store.update_node_instance(&ni).await {
                Ok(_) => {
                    self.store
                        .append_event(
                            ni.instance,
                            &RuntimeEvent::StateChanged {
                                node_instance: handle,
                                from,
                                to: NodeInstanceState::Cancelled,
                            },
                        )
                        .await?;
                    return Ok(true);
                }
                Err(StoreError::Conflict) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(EngineError::Store(StoreError::Conflict))
    }

    /// Mark an occurrence `Complete` with its result payload, then apply
    /// its export bindings to the instance data.
    async fn complete_node(
        &self,
        model: &ProcessModel,
        handle: NodeInstanceHandle,
        results: Payload,
    ) -> Result<(), EngineError> {
        let mut attempts = 0;
        let updated = loop {
            attempts += 1;
            if attempts > MAX_CONFLICT_RETRIES {
                return Err(EngineError::Store(StoreError::Conflict));
            }
            let mut ni = self.require_node_instance(handle).await?;
            if !can_transition(ni.state, NodeInstanceState::Complete) {
                return Err(EngineError::IllegalTransition {
                    from: ni.state,
                    to: NodeInstanceState::Complete,
                });
            }
            let from = ni.state;
            ni.state = NodeInstanceState::Complete;
            ni.results = results.clone();
            match self.store.update_node_instance(&ni).await {
                Ok(version) => {
                    ni.version = version;
                    self.store
                        .append_event(
                            ni.instance,
                            &RuntimeEvent::StateChanged {
                                node_instance: handle,
                                from,
                                to: NodeInstanceState::Complete,
                            },
                        )
                        .await?;
                    break ni;
                }
                Err(StoreError::Conflict) => continue,
                Err(err) => return Err(err.into()),
            }
        };

        let node = self.require_node(model, &updated.node)?;
        if let NodeKind::Activity { exports, .. } = &node.kind {
            if !exports.is_empty() {
                self.mutate_instance(updated.instance, |inst| {
                    for binding in exports {
                        let value = updated
                            .results
                            .get(&binding.source)
                            .cloned()
                            .unwrap_or(Value::Null);
                        inst.data.insert(binding.name.clone(), value);
                    }
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Mark an occurrence `Failed` with the recorded cause and bump the
    /// instance error count. Tolerates a raced terminal state.
    async fn fail_node(
        &self,
        handle: NodeInstanceHandle,
        cause: String,
    ) -> Result<(), EngineError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let mut ni = self.require_node_instance(handle).await?;
            if ni.state.is_terminal() {
                warn!(node = %ni.node, state = ?ni.state, "failure on terminal occurrence ignored");
                return Ok(());
            }
            if !can_transition(ni.state, NodeInstanceState::Failed) {
                return Err(EngineError::IllegalTransition {
                    from: ni.state,
                    to: NodeInstanceState::Failed,
                });
            }
            let from = ni.state;
            ni.state = NodeInstanceState::Failed;
            ni.failure = Some(cause.clone());
            match self.store.update_node_instance(&ni).await {
                Ok(_) => {
                    self.store
                        .append_event(
                            ni.instance,
                            &RuntimeEvent::StateChanged {
                                node_instance: handle,
                                from,
                                to: NodeInstanceState::Failed,
                            },
                        )
                        .await?;
                    self.mutate_instance(ni.instance, |inst| inst.error_count += 1)
                        .await?;
                    return Ok(());
                }
                Err(StoreError::Conflict) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(EngineError::Store(StoreError::Conflict))
    }

    async fn record_completion(
        &self,
        instance: InstanceHandle,
        node_instance: NodeInstanceHandle,
        to: NodeInstanceState,
    ) -> Result<(), EngineError> {
        self.store
            .append_event(
                instance,
                &RuntimeEvent::CompletionApplied { node_instance, to },
            )
            .await?;
        Ok(())
    }

    async fn mutate_instance<F>(
        &self,
        handle: InstanceHandle,
        mutate: F,
    ) -> Result<ProcessInstance, EngineError>
    where
        F: Fn(&mut ProcessInstance),
    {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let mut instance = self.require_instance(handle).await?;
            mutate(&mut instance);
            match self.store.update_instance(&instance).await {
                Ok(version) => {
                    instance.version = version;
                    return Ok(instance);
                }
                Err(StoreError::Conflict) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(EngineError::Store(StoreError::Conflict))
    }

    // ── Termination ──

    /// Finish the instance once no non-terminal occurrence remains. Pending
    /// joins whose remaining branches can no longer reach `min` are resolved
    /// as skipped first; completing fewer end nodes than the model declares
    /// is a soft warning, not an error.
    async fn check_termination(&self, handle: InstanceHandle) -> Result<(), EngineError> {
        loop {
            let instance = self.require_instance(handle).await?;
            if instance.state != InstanceState::Active {
                return Ok(());
            }
            let model = self.require_model(instance.model).await?;
            let nis = self.store.list_node_instances(handle).await?;

            if nis.iter().all(|ni| ni.state.is_terminal()) {
                let completed_ends = nis
                    .iter()
                    .filter(|ni| {
                        ni.state == NodeInstanceState::Complete
                            && model.get_node(&ni.node).is_some_and(|n| n.is_end())
                    })
                    .count();
                let expected_ends = model.end_node_count();
                if completed_ends < expected_ends {
                    warn!(
                        instance = %handle.0,
                        completed_ends,
                        expected_ends,
                        "finished with skipped or failed paths"
                    );
                }
                self.store
                    .append_event(
                        handle,
                        &RuntimeEvent::InstanceFinished {
                            completed_ends,
                            expected_ends,
                        },
                    )
                    .await?;
                self.mutate_instance(handle, |i| i.state = InstanceState::Finished)
                    .await?;
                info!(instance = %handle.0, "process instance finished");
                return Ok(());
            }

            let starved = starved_joins(&model, &nis);
            if starved.is_empty() {
                return Ok(());
            }
            for ni_handle in starved {
                self.set_state(ni_handle, NodeInstanceState::Skipped).await?;
                self.store
                    .append_event(
                        handle,
                        &RuntimeEvent::JoinSkipped {
                            node_instance: ni_handle,
                        },
                    )
                    .await?;
            }
            // Re-list: resolving a starved join may finish the instance or
            // starve another join downstream.
        }
    }

    // ── Lookups ──

    async fn require_model(&self, handle: ModelHandle) -> Result<Arc<ProcessModel>, EngineError> {
        self.store
            .get_model(handle)
            .await?
            .ok_or(EngineError::UnknownModel(handle))
    }

    async fn require_instance(
        &self,
        handle: InstanceHandle,
    ) -> Result<ProcessInstance, EngineError> {
        self.store
            .get_instance(handle)
            .await?
            .ok_or(EngineError::UnknownInstance(handle))
    }

    async fn require_node_instance(
        &self,
        handle: NodeInstanceHandle,
    ) -> Result<NodeInstance, EngineError> {
        self.store
            .get_node_instance(handle)
            .await?
            .ok_or(EngineError::UnknownNodeInstance(handle))
    }

    fn require_node<'m>(
        &self,
        model: &'m ProcessModel,
        id: &NodeId,
    ) -> Result<&'m ProcessNode, EngineError> {
        model
            .get_node(id)
            .ok_or_else(|| EngineError::UnknownNode(id.clone()))
    }
}

/// Pending joins that can no longer reach their `min` threshold: every
/// missing branch is either a terminal occurrence that never arrived or a
/// node no remaining live occurrence can still reach.
fn starved_joins(model: &ProcessModel, nis: &[NodeInstance]) -> Vec<NodeInstanceHandle> {
    let by_node: HashMap<&str, &NodeInstance> =
        nis.iter().map(|ni| (ni.node.as_str(), ni)).collect();

    // Everything downstream of a non-terminal occurrence may still run.
    let mut reachable: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = nis
        .iter()
        .filter(|ni| !ni.state.is_terminal())
        .map(|ni| ni.node.as_str())
        .collect();
    while let Some(id) = stack.pop() {
        if !reachable.insert(id) {
            continue;
        }
        if let Some(node) = model.get_node(id) {
            for succ in &node.successors {
                stack.push(succ);
            }
        }
    }

    let mut starved = Vec::new();
    for ni in nis {
        if ni.state != NodeInstanceState::Pending {
            continue;
        }
        let Some(node) = model.get_node(&ni.node) else {
            continue;
        };
        let Some((min, _)) = node.join_bounds() else {
            continue;
        };

        let mut possible = ni.arrivals();
        for pred_id in &node.predecessors {
            match by_node.get(pred_id.as_str()) {
                Some(p) if ni.predecessors.contains(&p.handle) => {}
                Some(p) if !p.state.is_terminal() => possible += 1,
                // A completed predecessor whose arrival is still in flight.
                Some(p) if p.state == NodeInstanceState::Complete => possible += 1,
                Some(_) => {}
                None if reachable.contains(pred_id.as_str()) => possible += 1,
                None => {}
            }
        }
        if possible < min as usize {
            starved.push(ni.handle);
        }
    }
    starved
}
