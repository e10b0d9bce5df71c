use crate::authoring::validate::{validate_definition, ValidationError, RULE_CORRELATION};
use crate::error::{EngineError, Result};
use crate::expression::Expression;
use crate::types::*;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::OnceLock;

/// Upper bound on correlation pairs per message trigger or throw.
pub const MAX_CORRELATION_KEYS: usize = 5;

// ─── Node kinds ───────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayType {
    Exclusive,
    Parallel,
    Inclusive,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Completes as soon as its connectors and operations ran.
    #[default]
    Automatic,
    /// Waits for an external `execute_flow_node` call.
    User,
    Manual,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrelationDefinition {
    pub key: String,
    pub value: Expression,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageTrigger {
    pub message_name: String,
    #[serde(default)]
    pub correlations: Vec<CorrelationDefinition>,
    /// Message payload key to data name, written before the catch transition.
    #[serde(default)]
    pub data_mappings: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageThrow {
    pub message_name: String,
    #[serde(default)]
    pub target_process: Option<String>,
    #[serde(default)]
    pub target_flow_node: Option<String>,
    #[serde(default)]
    pub correlations: Vec<CorrelationDefinition>,
    #[serde(default)]
    pub payload: BTreeMap<String, Expression>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventTrigger {
    Timer {
        duration_ms: u64,
    },
    TimerDate {
        at: Timestamp,
    },
    Message(MessageTrigger),
    Error {
        #[serde(default)]
        code: Option<String>,
    },
}

impl EventTrigger {
    pub fn is_timer(&self) -> bool {
        matches!(self, EventTrigger::Timer { .. } | EventTrigger::TimerDate { .. })
    }

    pub fn message(&self) -> Option<&MessageTrigger> {
        match self {
            EventTrigger::Message(m) => Some(m),
            _ => None,
        }
    }

    /// Due date of a timer trigger armed at `now`.
    pub fn due_at(&self, now: Timestamp) -> Option<Timestamp> {
        match self {
            EventTrigger::Timer { duration_ms } => Some(now + *duration_ms as i64),
            EventTrigger::TimerDate { at } => Some(*at),
            _ => None,
        }
    }

    pub fn waiting_event_type(&self) -> Option<WaitingEventType> {
        match self {
            EventTrigger::Timer { .. } | EventTrigger::TimerDate { .. } => {
                Some(WaitingEventType::Timer)
            }
            EventTrigger::Message(_) => Some(WaitingEventType::Message),
            EventTrigger::Error { .. } => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndEventResult {
    #[default]
    None,
    /// Aborts every other element of the enclosing scope.
    Terminate,
    Message(MessageThrow),
    Error {
        code: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowNodeKind {
    StartEvent {
        #[serde(default)]
        trigger: Option<EventTrigger>,
    },
    EndEvent {
        #[serde(default)]
        result: EndEventResult,
    },
    IntermediateCatchEvent {
        trigger: EventTrigger,
    },
    IntermediateThrowEvent {
        message: MessageThrow,
    },
    BoundaryEvent {
        trigger: EventTrigger,
        #[serde(default = "default_interrupting")]
        interrupting: bool,
    },
    Task {
        #[serde(default)]
        task_type: TaskType,
    },
    Gateway {
        gateway_type: GatewayType,
    },
    SubProcess,
}

fn default_interrupting() -> bool {
    true
}

// ─── Connectors, operations, loops ────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorEvent {
    OnEnter,
    OnFinish,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailAction {
    /// Put the flow node in FAILED and raise an incident.
    #[default]
    Fail,
    Ignore,
    /// Route to the error boundary event catching `code`.
    ThrowError { code: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectorDefinition {
    pub name: String,
    pub connector_id: String,
    pub activation: ConnectorEvent,
    #[serde(default)]
    pub inputs: BTreeMap<String, Expression>,
    /// Connector output name to data name.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub fail_action: FailAction,
}

/// Data assignment applied when the flow node completes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub target: String,
    pub expression: Expression,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StandardLoop {
    pub condition: Expression,
    #[serde(default)]
    pub test_before: bool,
    #[serde(default)]
    pub loop_max: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiInstanceLoop {
    #[serde(default)]
    pub sequential: bool,
    #[serde(default)]
    pub cardinality: Option<Expression>,
    #[serde(default)]
    pub input_collection: Option<String>,
    #[serde(default)]
    pub input_item: Option<String>,
    #[serde(default)]
    pub output_item: Option<String>,
    #[serde(default)]
    pub output_collection: Option<String>,
    #[serde(default)]
    pub completion_condition: Option<Expression>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopCharacteristics {
    Standard(StandardLoop),
    MultiInstance(MultiInstanceLoop),
}

// ─── Arena ────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowNodeDefinition {
    pub id: FlowNodeDefId,
    pub name: String,
    pub description: Option<String>,
    pub kind: FlowNodeKind,
    /// Enclosing sub-process; `None` at process level.
    pub container: Option<FlowNodeDefId>,
    pub attached_to: Option<FlowNodeDefId>,
    pub incoming: Vec<TransitionId>,
    pub outgoing: Vec<TransitionId>,
    pub default_transition: Option<TransitionId>,
    pub boundary_events: Vec<FlowNodeDefId>,
    pub connectors: Vec<ConnectorDefinition>,
    pub operations: Vec<Operation>,
    pub loop_characteristics: Option<LoopCharacteristics>,
}

impl FlowNodeDefinition {
    pub fn gateway_type(&self) -> Option<GatewayType> {
        match self.kind {
            FlowNodeKind::Gateway { gateway_type } => Some(gateway_type),
            _ => None,
        }
    }

    pub fn is_activity(&self) -> bool {
        matches!(self.kind, FlowNodeKind::Task { .. } | FlowNodeKind::SubProcess)
    }

    pub fn is_start_event(&self) -> bool {
        matches!(self.kind, FlowNodeKind::StartEvent { .. })
    }

    /// Node type of an instance of this definition, ignoring loop wrappers.
    pub fn instance_type(&self) -> FlowNodeType {
        match self.kind {
            FlowNodeKind::Task { .. } => FlowNodeType::Task,
            FlowNodeKind::Gateway { .. } => FlowNodeType::Gateway,
            FlowNodeKind::SubProcess => FlowNodeType::SubProcess,
            _ => FlowNodeType::Event,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionDefinition {
    pub id: TransitionId,
    pub name: Option<String>,
    pub source: FlowNodeDefId,
    pub target: FlowNodeDefId,
    pub condition: Option<Expression>,
}

/// A process graph: flow-node definitions indexed by [`FlowNodeDefId`] and
/// transitions indexed by [`TransitionId`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: ProcessDefinitionId,
    pub name: String,
    pub version: String,
    pub version_hash: [u8; 32],
    pub initial_data: DataMap,
    pub flow_nodes: Vec<FlowNodeDefinition>,
    pub transitions: Vec<TransitionDefinition>,
    #[serde(skip)]
    graph: OnceLock<FlowGraph>,
}

impl ProcessDefinition {
    pub fn node(&self, id: FlowNodeDefId) -> Result<&FlowNodeDefinition> {
        self.flow_nodes
            .get(id as usize)
            .ok_or_else(|| EngineError::not_found("flow node definition", id))
    }

    pub fn transition(&self, id: TransitionId) -> Result<&TransitionDefinition> {
        self.transitions
            .get(id as usize)
            .ok_or_else(|| EngineError::not_found("transition", id))
    }

    pub fn node_by_name(&self, name: &str) -> Option<&FlowNodeDefinition> {
        self.flow_nodes.iter().find(|n| n.name == name)
    }

    /// Start events without trigger of a scope.
    pub fn none_start_events(&self, container: Option<FlowNodeDefId>) -> Vec<FlowNodeDefId> {
        self.flow_nodes
            .iter()
            .filter(|n| n.container == container)
            .filter(|n| matches!(n.kind, FlowNodeKind::StartEvent { trigger: None }))
            .map(|n| n.id)
            .collect()
    }

    /// Process-level start events carrying a message or timer trigger.
    pub fn triggered_start_events(&self) -> impl Iterator<Item = (&FlowNodeDefinition, &EventTrigger)> {
        self.flow_nodes
            .iter()
            .filter(|n| n.container.is_none())
            .filter_map(|n| match &n.kind {
                FlowNodeKind::StartEvent {
                    trigger: Some(trigger),
                } => Some((n, trigger)),
                _ => None,
            })
    }

    pub fn graph(&self) -> &FlowGraph {
        self.graph.get_or_init(|| FlowGraph::build(self))
    }

    /// SHA-256 over the structural content of the definition.
    pub fn compute_version_hash(&self) -> Result<[u8; 32]> {
        let content = serde_json::to_vec(&(
            &self.name,
            &self.version,
            &self.initial_data,
            &self.flow_nodes,
            &self.transitions,
        ))
        .map_err(|e| EngineError::creation("process definition", e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(&content);
        Ok(hasher.finalize().into())
    }
}

// ─── Flow graph ───────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowEdge {
    Transition(TransitionId),
    /// Activity to one of its boundary events.
    Attachment,
}

/// Directed view of the arena. Node index `i` carries definition id `i`.
#[derive(Clone, Debug)]
pub struct FlowGraph {
    graph: DiGraph<FlowNodeDefId, FlowEdge>,
}

impl FlowGraph {
    pub fn build(definition: &ProcessDefinition) -> Self {
        let mut graph = DiGraph::new();
        for node in &definition.flow_nodes {
            graph.add_node(node.id);
        }
        let count = definition.flow_nodes.len();
        for t in &definition.transitions {
            if (t.source as usize) < count && (t.target as usize) < count {
                graph.add_edge(
                    NodeIndex::new(t.source as usize),
                    NodeIndex::new(t.target as usize),
                    FlowEdge::Transition(t.id),
                );
            }
        }
        for node in &definition.flow_nodes {
            if let Some(activity) = node.attached_to {
                if (activity as usize) < count {
                    graph.add_edge(
                        NodeIndex::new(activity as usize),
                        NodeIndex::new(node.id as usize),
                        FlowEdge::Attachment,
                    );
                }
            }
        }
        Self { graph }
    }

    /// Nodes from which `target` is reachable without passing through
    /// `barrier`, `target` included.
    pub fn upstream_of(
        &self,
        target: FlowNodeDefId,
        barrier: FlowNodeDefId,
    ) -> BTreeSet<FlowNodeDefId> {
        let mut seen = BTreeSet::new();
        if target == barrier || target as usize >= self.graph.node_count() {
            return seen;
        }
        let mut queue = VecDeque::from([NodeIndex::new(target as usize)]);
        seen.insert(target);
        while let Some(idx) = queue.pop_front() {
            for pred in self.graph.neighbors_directed(idx, Direction::Incoming) {
                let id = self.graph[pred];
                if id != barrier && seen.insert(id) {
                    queue.push_back(pred);
                }
            }
        }
        seen
    }

    pub fn reachable_from(&self, roots: &[FlowNodeDefId]) -> BTreeSet<FlowNodeDefId> {
        let mut seen = BTreeSet::new();
        let Some(&first) = roots.first() else {
            return seen;
        };
        let mut dfs = Dfs::new(&self.graph, NodeIndex::new(first as usize));
        for root in roots {
            if *root as usize >= self.graph.node_count() {
                continue;
            }
            dfs.move_to(NodeIndex::new(*root as usize));
            while let Some(idx) = dfs.next(&self.graph) {
                seen.insert(self.graph[idx]);
            }
        }
        seen
    }
}

// ─── Builder ──────────────────────────────────────────────────

/// Assembles a [`ProcessDefinition`] arena and validates it on `build`.
pub struct ProcessDefinitionBuilder {
    pub(crate) definition: ProcessDefinition,
}

impl ProcessDefinitionBuilder {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            definition: ProcessDefinition {
                id: 0,
                name: name.into(),
                version: version.into(),
                version_hash: [0; 32],
                initial_data: DataMap::new(),
                flow_nodes: Vec::new(),
                transitions: Vec::new(),
                graph: OnceLock::new(),
            },
        }
    }

    pub fn initial_data(&mut self, name: impl Into<String>, value: serde_json::Value) -> &mut Self {
        self.definition.initial_data.insert(name.into(), value);
        self
    }

    pub fn add_node(&mut self, name: impl Into<String>, kind: FlowNodeKind) -> FlowNodeDefId {
        let id = self.definition.flow_nodes.len() as FlowNodeDefId;
        self.definition.flow_nodes.push(FlowNodeDefinition {
            id,
            name: name.into(),
            description: None,
            kind,
            container: None,
            attached_to: None,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            default_transition: None,
            boundary_events: Vec::new(),
            connectors: Vec::new(),
            operations: Vec::new(),
            loop_characteristics: None,
        });
        id
    }

    pub fn start_event(&mut self, name: impl Into<String>) -> FlowNodeDefId {
        self.add_node(name, FlowNodeKind::StartEvent { trigger: None })
    }

    pub fn end_event(&mut self, name: impl Into<String>) -> FlowNodeDefId {
        self.add_node(
            name,
            FlowNodeKind::EndEvent {
                result: EndEventResult::None,
            },
        )
    }

    pub fn automatic_task(&mut self, name: impl Into<String>) -> FlowNodeDefId {
        self.add_node(
            name,
            FlowNodeKind::Task {
                task_type: TaskType::Automatic,
            },
        )
    }

    pub fn user_task(&mut self, name: impl Into<String>) -> FlowNodeDefId {
        self.add_node(
            name,
            FlowNodeKind::Task {
                task_type: TaskType::User,
            },
        )
    }

    pub fn gateway(&mut self, name: impl Into<String>, gateway_type: GatewayType) -> FlowNodeDefId {
        self.add_node(name, FlowNodeKind::Gateway { gateway_type })
    }

    pub fn sub_process(&mut self, name: impl Into<String>) -> FlowNodeDefId {
        self.add_node(name, FlowNodeKind::SubProcess)
    }

    pub fn catch_event(&mut self, name: impl Into<String>, trigger: EventTrigger) -> FlowNodeDefId {
        self.add_node(name, FlowNodeKind::IntermediateCatchEvent { trigger })
    }

    /// Boundary event on `activity`, placed in the activity's scope.
    pub fn boundary_event(
        &mut self,
        activity: FlowNodeDefId,
        name: impl Into<String>,
        trigger: EventTrigger,
        interrupting: bool,
    ) -> FlowNodeDefId {
        let id = self.add_node(
            name,
            FlowNodeKind::BoundaryEvent {
                trigger,
                interrupting,
            },
        );
        let container = self
            .definition
            .flow_nodes
            .get(activity as usize)
            .and_then(|a| a.container);
        let node = &mut self.definition.flow_nodes[id as usize];
        node.attached_to = Some(activity);
        node.container = container;
        if let Some(a) = self.definition.flow_nodes.get_mut(activity as usize) {
            a.boundary_events.push(id);
        }
        id
    }

    /// Moves `node` into sub-process `container`.
    pub fn in_container(&mut self, node: FlowNodeDefId, container: FlowNodeDefId) -> &mut Self {
        if let Some(n) = self.definition.flow_nodes.get_mut(node as usize) {
            n.container = Some(container);
        }
        self
    }

    pub fn describe(&mut self, node: FlowNodeDefId, description: impl Into<String>) -> &mut Self {
        if let Some(n) = self.definition.flow_nodes.get_mut(node as usize) {
            n.description = Some(description.into());
        }
        self
    }

    fn push_transition(
        &mut self,
        source: FlowNodeDefId,
        target: FlowNodeDefId,
        condition: Option<Expression>,
    ) -> TransitionId {
        let id = self.definition.transitions.len() as TransitionId;
        self.definition.transitions.push(TransitionDefinition {
            id,
            name: None,
            source,
            target,
            condition,
        });
        if let Some(n) = self.definition.flow_nodes.get_mut(source as usize) {
            n.outgoing.push(id);
        }
        if let Some(n) = self.definition.flow_nodes.get_mut(target as usize) {
            n.incoming.push(id);
        }
        id
    }

    pub fn transition(&mut self, source: FlowNodeDefId, target: FlowNodeDefId) -> TransitionId {
        self.push_transition(source, target, None)
    }

    pub fn conditional_transition(
        &mut self,
        source: FlowNodeDefId,
        target: FlowNodeDefId,
        condition: Expression,
    ) -> TransitionId {
        self.push_transition(source, target, Some(condition))
    }

    /// Unconditional transition taken only when no other outgoing one is.
    pub fn default_transition(&mut self, source: FlowNodeDefId, target: FlowNodeDefId) -> TransitionId {
        let id = self.push_transition(source, target, None);
        if let Some(n) = self.definition.flow_nodes.get_mut(source as usize) {
            n.default_transition = Some(id);
        }
        id
    }

    pub fn loop_characteristics(
        &mut self,
        node: FlowNodeDefId,
        characteristics: LoopCharacteristics,
    ) -> &mut Self {
        if let Some(n) = self.definition.flow_nodes.get_mut(node as usize) {
            n.loop_characteristics = Some(characteristics);
        }
        self
    }

    pub fn connector(&mut self, node: FlowNodeDefId, connector: ConnectorDefinition) -> &mut Self {
        if let Some(n) = self.definition.flow_nodes.get_mut(node as usize) {
            n.connectors.push(connector);
        }
        self
    }

    pub fn operation(&mut self, node: FlowNodeDefId, target: impl Into<String>, expression: Expression) -> &mut Self {
        if let Some(n) = self.definition.flow_nodes.get_mut(node as usize) {
            n.operations.push(Operation {
                target: target.into(),
                expression,
            });
        }
        self
    }

    /// Validates the arena. Correlation limits fail with
    /// [`EngineError::Correlation`], every other rule with
    /// [`EngineError::InvalidDefinition`].
    pub fn build(self) -> Result<ProcessDefinition> {
        let mut definition = self.definition;
        let errors = validate_definition(&definition);
        if !errors.is_empty() {
            return Err(validation_failure(&errors));
        }
        definition.version_hash = definition.compute_version_hash()?;
        Ok(definition)
    }
}

pub(crate) fn validation_failure(errors: &[ValidationError]) -> EngineError {
    let joined = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    if errors.iter().any(|e| e.rule == RULE_CORRELATION) {
        EngineError::Correlation(joined)
    } else {
        EngineError::InvalidDefinition(joined)
    }
}
