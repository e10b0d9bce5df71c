use crate::definition::GatewayType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Identifier shared by process instances, flow-node instances, tokens and
/// waiting events. Allocated from one monotonic sequence per store.
pub type InstanceId = u64;

/// Token scope: the id of the container (process instance, sub-process
/// instance or multi-instance wrapper) whose branches a token counts.
pub type RefId = InstanceId;

/// Deployed process definition id.
pub type ProcessDefinitionId = u64;

/// Index of a flow-node definition in its definition arena.
pub type FlowNodeDefId = u32;

/// Index of a transition in its definition arena.
pub type TransitionId = u32;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Data context of a process instance or flow node.
pub type DataMap = BTreeMap<String, Value>;

// ─── Flow-node instance ───────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowNodeType {
    Task,
    Gateway,
    Event,
    SubProcess,
    /// Wrapper owning the children of a multi-instance activity.
    MultiInstance,
    /// Wrapper owning the iterations of a standard loop activity.
    Loop,
}

impl FlowNodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowNodeType::Task => "task",
            FlowNodeType::Gateway => "gateway",
            FlowNodeType::Event => "event",
            FlowNodeType::SubProcess => "sub_process",
            FlowNodeType::MultiInstance => "multi_instance",
            FlowNodeType::Loop => "loop",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowNodeState {
    Ready,
    Executing,
    Completed,
    Aborted,
    Cancelled,
    /// Halted by an incident. Holds its token until replayed or cancelled.
    Failed,
}

impl FlowNodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowNodeState::Completed | FlowNodeState::Aborted | FlowNodeState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowNodeState::Ready => "ready",
            FlowNodeState::Executing => "executing",
            FlowNodeState::Completed => "completed",
            FlowNodeState::Aborted => "aborted",
            FlowNodeState::Cancelled => "cancelled",
            FlowNodeState::Failed => "failed",
        }
    }
}

/// Which path an element is on, independent of its state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateCategory {
    #[default]
    Normal,
    Aborting,
    Cancelling,
    /// Process instance halted by at least one open incident.
    Error,
}

impl StateCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateCategory::Normal => "normal",
            StateCategory::Aborting => "aborting",
            StateCategory::Cancelling => "cancelling",
            StateCategory::Error => "error",
        }
    }
}

/// Merge bookkeeping of a gateway instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GatewayState {
    pub gateway_type: GatewayType,
    /// Distinct incoming transitions that delivered a token, in arrival order.
    pub hit_by: Vec<TransitionId>,
    /// Re-entrant arrivals on an already hit transition. They belong to the
    /// next instance of this gateway.
    pub queued_hits: Vec<TransitionId>,
    /// Merge condition satisfied; no further hits are accepted.
    pub fired: bool,
}

/// Counters of a multi-instance wrapper.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiInstanceCounters {
    pub sequential: bool,
    pub total: u32,
    pub active: u32,
    pub completed: u32,
    pub terminated: u32,
    /// Children created so far.
    pub spawned: u32,
}

impl MultiInstanceCounters {
    pub fn finished(&self) -> u32 {
        self.completed + self.terminated
    }
}

/// Counters of a standard loop wrapper.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopCounters {
    pub loop_counter: u32,
    pub loop_max: Option<u32>,
    pub test_before: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum InstanceDetail {
    Activity,
    Event,
    Gateway(GatewayState),
    MultiInstance(MultiInstanceCounters),
    Loop(LoopCounters),
}

/// Live execution record of one flow node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowNodeInstance {
    pub id: InstanceId,
    pub process_instance_id: InstanceId,
    pub process_definition_id: ProcessDefinitionId,
    pub definition_id: FlowNodeDefId,
    /// Scope the node lives in: the process instance or a container instance.
    pub container_id: InstanceId,
    pub node_type: FlowNodeType,
    pub state: FlowNodeState,
    pub state_category: StateCategory,
    /// Scope of the tokens this node holds; `None` while it holds none
    /// (a boundary event still waiting for its trigger).
    pub token_ref_id: Option<RefId>,
    pub token_count: u32,
    pub name: String,
    pub description: Option<String>,
    /// Activity a boundary event instance is attached to.
    pub attached_to: Option<InstanceId>,
    /// Iteration index of a multi-instance or loop child.
    pub loop_index: Option<u32>,
    pub incoming_transition: Option<TransitionId>,
    pub local_data: DataMap,
    pub detail: InstanceDetail,
    /// State to replay once the incident holding this node is resolved.
    pub failed_from: Option<FlowNodeState>,
    pub created_at: Timestamp,
    pub last_update: Timestamp,
}

impl FlowNodeInstance {
    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Multi-instance or loop wrapper.
    pub fn is_wrapper(&self) -> bool {
        matches!(
            self.node_type,
            FlowNodeType::MultiInstance | FlowNodeType::Loop
        )
    }

    pub fn is_loop_child(&self) -> bool {
        self.loop_index.is_some()
    }

    pub fn gateway(&self) -> Option<&GatewayState> {
        match &self.detail {
            InstanceDetail::Gateway(g) => Some(g),
            _ => None,
        }
    }

    pub fn gateway_mut(&mut self) -> Option<&mut GatewayState> {
        match &mut self.detail {
            InstanceDetail::Gateway(g) => Some(g),
            _ => None,
        }
    }

    pub fn set_state(&mut self, state: FlowNodeState) {
        self.state = state;
        self.last_update = now_ms();
    }
}

// ─── Tokens ───────────────────────────────────────────────────

/// One active branch of a scope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: InstanceId,
    pub process_instance_id: InstanceId,
    pub ref_id: RefId,
    pub parent_ref_id: Option<RefId>,
}

// ─── Waiting events ───────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitingEventType {
    Timer,
    Message,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitingEventKind {
    /// Starts a new process instance; not bound to any instance.
    Start,
    IntermediateCatch,
    Boundary,
}

/// Subscription of a flow node (or a start event) to a trigger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WaitingEvent {
    pub id: InstanceId,
    pub event_type: WaitingEventType,
    pub kind: WaitingEventKind,
    pub process_definition_id: ProcessDefinitionId,
    pub process_name: String,
    pub process_instance_id: Option<InstanceId>,
    pub flow_node_instance_id: Option<InstanceId>,
    pub flow_node_definition_id: FlowNodeDefId,
    pub flow_node_name: String,
    pub message_name: Option<String>,
    /// Evaluated correlation pairs, at most five.
    pub correlations: DataMap,
    pub job_id: Option<String>,
    /// Due date of a timer subscription.
    pub due_at: Option<Timestamp>,
    pub active: bool,
}

// ─── Process instance ─────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Started,
    Completed,
    Aborted,
    Cancelled,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessState::Started)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Started => "started",
            ProcessState::Completed => "completed",
            ProcessState::Aborted => "aborted",
            ProcessState::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: InstanceId,
    pub definition_id: ProcessDefinitionId,
    pub name: String,
    pub state: ProcessState,
    pub state_category: StateCategory,
    pub data: DataMap,
    pub started_by: Option<String>,
    pub start_date: Timestamp,
    pub end_date: Option<Timestamp>,
}

impl ProcessInstance {
    /// Token scope of the root branches.
    pub fn root_ref_id(&self) -> RefId {
        self.id
    }
}

// ─── Archive ──────────────────────────────────────────────────

/// Immutable snapshot of a flow node taken when it left the live tables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArchivedFlowNodeInstance {
    pub source: FlowNodeInstance,
    pub archived_at: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArchivedProcessInstance {
    pub source: ProcessInstance,
    pub archived_at: Timestamp,
}

// ─── Incidents ────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    ConnectorFailure,
    Expression,
    InvariantViolation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub incident_id: Uuid,
    pub process_instance_id: InstanceId,
    pub flow_node_instance_id: Option<InstanceId>,
    pub flow_node_name: Option<String>,
    pub kind: IncidentKind,
    pub message: String,
    pub retry_count: u32,
    pub created_at: Timestamp,
    pub resolved_at: Option<Timestamp>,
    pub resolution: Option<String>,
}

impl Incident {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

pub fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
