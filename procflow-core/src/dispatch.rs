use crate::model::{DataBinding, MessageTemplate};
use crate::types::{
    InstanceHandle, NodeInstanceHandle, NodeInstanceState, Payload, Principal,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Reserved payload key through which a completion payload may name an
/// explicit target state instead of the default `Complete`.
pub const ACTIVITY_RESPONSE_KEY: &str = "activity_response";

// ─── Outbound side ────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("transport rejected message: {0}")]
    Rejected(String),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// One activity dispatch, keyed by the node-instance handle so workers can
/// deduplicate re-deliveries after a tickle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub node_instance: NodeInstanceHandle,
    pub instance: InstanceHandle,
    pub owner: Principal,
    pub service: String,
    pub operation: String,
    pub body: Payload,
}

/// Outbound message transport, an external collaborator. `send` returning
/// `Ok` means the transport accepted the message; task progress and
/// completion arrive separately through the completion channel.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<(), DispatchError>;

    /// Best-effort cancellation of an in-flight dispatch. A dispatch that
    /// already produced a result may still deliver it; the engine discards
    /// late completions.
    async fn cancel(&self, node_instance: NodeInstanceHandle);
}

/// Build the outbound message for an activity: the template body first,
/// then the bound imports resolved against instance data. Missing import
/// sources resolve to null rather than failing the dispatch.
pub fn build_message(
    node_instance: NodeInstanceHandle,
    instance: InstanceHandle,
    owner: Principal,
    template: &MessageTemplate,
    imports: &[DataBinding],
    data: &Payload,
) -> OutboundMessage {
    let mut body = template.body.clone();
    for binding in imports {
        let value = data.get(&binding.source).cloned().unwrap_or(Value::Null);
        body.insert(binding.name.clone(), value);
    }
    OutboundMessage {
        node_instance,
        instance,
        owner,
        service: template.service.clone(),
        operation: template.operation.clone(),
        body,
    }
}

// ─── Inbound side ─────────────────────────────────────────────

/// Worker-driven task progress, delivered before completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskEvent {
    Acknowledged,
    Taken,
    Started,
}

impl TaskEvent {
    pub fn target_state(&self) -> NodeInstanceState {
        match self {
            TaskEvent::Acknowledged => NodeInstanceState::Acknowledged,
            TaskEvent::Taken => NodeInstanceState::Taken,
            TaskEvent::Started => NodeInstanceState::Started,
        }
    }
}

/// Tagged outcome of one dispatch, delivered exactly once per envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CompletionOutcome {
    Success(Payload),
    Failure(String),
    Cancelled,
}

impl CompletionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CompletionOutcome::Success(_) => "success",
            CompletionOutcome::Failure(_) => "failure",
            CompletionOutcome::Cancelled => "cancelled",
        }
    }
}

/// One completion as it travels the channel from the transport back into
/// the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionEnvelope {
    pub node_instance: NodeInstanceHandle,
    pub owner: Principal,
    pub outcome: CompletionOutcome,
}

/// Inspect a success payload for the activity-response marker.
///
/// Returns the explicit target state and the payload with the marker
/// stripped, or the payload unchanged when no marker is present. An
/// unrecognized marker value is an error the caller maps to `Failed`.
pub fn response_override(
    mut payload: Payload,
) -> Result<(Option<NodeInstanceState>, Payload), String> {
    let Some(marker) = payload.remove(ACTIVITY_RESPONSE_KEY) else {
        return Ok((None, payload));
    };
    let state = match marker.as_str() {
        Some("complete") => NodeInstanceState::Complete,
        Some("failed") => NodeInstanceState::Failed,
        Some("cancelled") => NodeInstanceState::Cancelled,
        other => {
            return Err(format!(
                "unrecognized activity response state: {:?}",
                other.unwrap_or("<non-string>")
            ))
        }
    };
    Ok((Some(state), payload))
}
