use crate::types::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Engine events: the durable audit trail of a process instance. Each event
/// is committed in the same work unit as the state change it describes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    ProcessStarted {
        process_definition_id: ProcessDefinitionId,
        started_by: Option<String>,
    },
    ProcessCompleted,
    ProcessAborted,
    ProcessCancelled,
    ProcessArchived,
    FlowNodeCreated {
        flow_node_id: InstanceId,
        definition_id: FlowNodeDefId,
        name: String,
        container_id: InstanceId,
    },
    FlowNodeStateChanged {
        flow_node_id: InstanceId,
        from: FlowNodeState,
        to: FlowNodeState,
    },
    TransitionTaken {
        transition_id: TransitionId,
        source_flow_node_id: InstanceId,
    },
    TokensCreated {
        ref_id: RefId,
        count: u32,
    },
    TokensDeleted {
        ref_id: RefId,
        count: u32,
    },
    /// Every token of a scope was dropped (cancellation or termination).
    ScopeTokensCleared {
        ref_id: RefId,
        count: u32,
    },
    GatewayHit {
        gateway_id: InstanceId,
        transition_id: TransitionId,
    },
    GatewayHitQueued {
        gateway_id: InstanceId,
        transition_id: TransitionId,
    },
    GatewayFired {
        gateway_id: InstanceId,
        consumed_hits: Vec<TransitionId>,
    },
    GatewayRespawned {
        gateway_id: InstanceId,
        successor_id: InstanceId,
    },
    MultiInstanceChildSpawned {
        wrapper_id: InstanceId,
        child_id: InstanceId,
        loop_index: u32,
    },
    WaitingEventRegistered {
        waiting_event_id: InstanceId,
        event_type: WaitingEventType,
        flow_node_id: Option<InstanceId>,
    },
    EventTriggered {
        waiting_event_id: InstanceId,
        flow_node_id: Option<InstanceId>,
    },
    MessageSent {
        message_name: String,
        delivered: bool,
    },
    ConnectorFailed {
        flow_node_id: InstanceId,
        connector: String,
        ignored: bool,
    },
    ErrorCaught {
        code: String,
        activity_id: InstanceId,
        boundary_definition_id: FlowNodeDefId,
    },
    DataUpdated {
        names: Vec<String>,
    },
    IncidentCreated {
        incident_id: Uuid,
        flow_node_id: Option<InstanceId>,
    },
    IncidentResolved {
        incident_id: Uuid,
    },
}
