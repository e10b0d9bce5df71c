use crate::definition::ProcessDefinition;
use crate::error::Result;
use crate::events::EngineEvent;
use crate::query::QueryOptions;
use crate::types::*;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

// ─── Work units ───────────────────────────────────────────────

/// One change to the live tables.
#[derive(Clone, Debug)]
pub enum Mutation {
    InsertProcess(ProcessInstance),
    SetProcessState {
        id: InstanceId,
        state: ProcessState,
        category: StateCategory,
        end_date: Option<Timestamp>,
    },
    /// Merge `values` into the process data.
    SetProcessData {
        id: InstanceId,
        values: DataMap,
    },
    /// Drop the live process row with every remaining flow node, token and
    /// waiting event it owns.
    DeleteProcess(InstanceId),
    InsertFlowNode(FlowNodeInstance),
    UpdateFlowNode(FlowNodeInstance),
    DeleteFlowNode(InstanceId),
    CreateTokens {
        process_instance_id: InstanceId,
        ref_id: RefId,
        parent_ref_id: Option<RefId>,
        count: u32,
    },
    /// Fails the whole unit when fewer than `count` tokens live in `ref_id`.
    DeleteTokens {
        process_instance_id: InstanceId,
        ref_id: RefId,
        count: u32,
    },
    DeleteToken(InstanceId),
    /// The store logs `ScopeTokensCleared` with the number of tokens it
    /// dropped, as it does for every scope emptied by `DeleteAllTokens` or
    /// `DeleteProcess`.
    DeleteScopeTokens {
        process_instance_id: InstanceId,
        ref_id: RefId,
    },
    /// Every token of one process, or of the whole store with `None`.
    DeleteAllTokens(Option<InstanceId>),
    InsertWaitingEvent(WaitingEvent),
    /// Idempotent.
    DeleteWaitingEvent(InstanceId),
    /// Take a waiting event out of the table. Fails the whole unit with
    /// `NotFound` when it is already gone, so at most one unit consumes it.
    ConsumeWaitingEvent(InstanceId),
    DeleteWaitingEventsOfFlowNode(InstanceId),
    DeleteStartWaitingEvents(ProcessDefinitionId),
    SaveIncident(Incident),
    ResolveIncident {
        incident_id: Uuid,
        resolution: String,
        at: Timestamp,
    },
    AppendEvent {
        process_instance_id: InstanceId,
        event: EngineEvent,
    },
}

/// Mutations committed atomically: all apply or none do.
#[derive(Clone, Debug, Default)]
pub struct WorkUnit {
    pub(crate) mutations: Vec<Mutation>,
}

impl WorkUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn push(&mut self, mutation: Mutation) -> &mut Self {
        self.mutations.push(mutation);
        self
    }

    pub fn event(&mut self, process_instance_id: InstanceId, event: EngineEvent) -> &mut Self {
        self.push(Mutation::AppendEvent {
            process_instance_id,
            event,
        })
    }

    pub fn insert_flow_node(&mut self, node: FlowNodeInstance) -> &mut Self {
        let event = EngineEvent::FlowNodeCreated {
            flow_node_id: node.id,
            definition_id: node.definition_id,
            name: node.name.clone(),
            container_id: node.container_id,
        };
        let pid = node.process_instance_id;
        self.push(Mutation::InsertFlowNode(node));
        self.event(pid, event)
    }

    pub fn update_flow_node(&mut self, node: FlowNodeInstance) -> &mut Self {
        self.push(Mutation::UpdateFlowNode(node))
    }

    /// Update plus a state-change audit event.
    pub fn transition_flow_node(
        &mut self,
        node: FlowNodeInstance,
        from: FlowNodeState,
    ) -> &mut Self {
        let event = EngineEvent::FlowNodeStateChanged {
            flow_node_id: node.id,
            from,
            to: node.state,
        };
        let pid = node.process_instance_id;
        self.push(Mutation::UpdateFlowNode(node));
        self.event(pid, event)
    }

    pub fn create_tokens(
        &mut self,
        process_instance_id: InstanceId,
        ref_id: RefId,
        parent_ref_id: Option<RefId>,
        count: u32,
    ) -> &mut Self {
        if count == 0 {
            return self;
        }
        self.push(Mutation::CreateTokens {
            process_instance_id,
            ref_id,
            parent_ref_id,
            count,
        });
        self.event(process_instance_id, EngineEvent::TokensCreated { ref_id, count })
    }

    pub fn delete_tokens(
        &mut self,
        process_instance_id: InstanceId,
        ref_id: RefId,
        count: u32,
    ) -> &mut Self {
        if count == 0 {
            return self;
        }
        self.push(Mutation::DeleteTokens {
            process_instance_id,
            ref_id,
            count,
        });
        self.event(process_instance_id, EngineEvent::TokensDeleted { ref_id, count })
    }

    pub fn delete_scope_tokens(&mut self, process_instance_id: InstanceId, ref_id: RefId) -> &mut Self {
        self.push(Mutation::DeleteScopeTokens {
            process_instance_id,
            ref_id,
        })
    }

    pub fn consume_waiting_event(&mut self, id: InstanceId) -> &mut Self {
        self.push(Mutation::ConsumeWaitingEvent(id))
    }

    pub fn set_process_data(&mut self, id: InstanceId, values: DataMap) -> &mut Self {
        if values.is_empty() {
            return self;
        }
        let names = values.keys().cloned().collect();
        self.push(Mutation::SetProcessData { id, values });
        self.event(id, EngineEvent::DataUpdated { names })
    }
}

/// What a commit left behind in the token ledger.
#[derive(Clone, Debug, Default)]
pub struct CommitReceipt {
    /// Live token count of every scope the unit created or deleted tokens in.
    pub remaining_tokens: BTreeMap<RefId, u64>,
    pub created_tokens: Vec<Token>,
}

impl CommitReceipt {
    pub fn remaining(&self, ref_id: RefId) -> Option<u64> {
        self.remaining_tokens.get(&ref_id).copied()
    }
}

/// A deployed definition and whether it accepts new instances.
#[derive(Clone, Debug)]
pub struct Deployment {
    pub definition: Arc<ProcessDefinition>,
    pub enabled: bool,
}

// ─── Stores ───────────────────────────────────────────────────

/// Persistence of the live execution state.
///
/// Every change goes through [`ProcessStore::commit`]; the engine never
/// writes piecemeal. Reads never block writers for longer than one commit.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    async fn next_id(&self) -> Result<InstanceId>;

    /// Apply a work unit atomically. Token deletions that would underflow
    /// fail the unit with a modification error and leave state untouched.
    async fn commit(&self, unit: WorkUnit) -> Result<CommitReceipt>;

    // ── Definitions ──

    async fn store_definition(&self, definition: ProcessDefinition) -> Result<()>;
    async fn load_deployment(&self, id: ProcessDefinitionId) -> Result<Option<Deployment>>;
    async fn set_definition_enabled(&self, id: ProcessDefinitionId, enabled: bool) -> Result<()>;
    async fn list_deployments(&self) -> Result<Vec<Deployment>>;

    // ── Process instances ──

    async fn load_process(&self, id: InstanceId) -> Result<Option<ProcessInstance>>;
    async fn search_processes(&self, options: &QueryOptions) -> Result<Vec<ProcessInstance>>;

    // ── Flow nodes ──

    async fn load_flow_node(&self, id: InstanceId) -> Result<Option<FlowNodeInstance>>;
    /// Flow nodes whose container is `container_id`.
    async fn load_flow_nodes_in_container(&self, container_id: InstanceId) -> Result<Vec<FlowNodeInstance>>;
    async fn load_flow_nodes_of_process(&self, process_instance_id: InstanceId) -> Result<Vec<FlowNodeInstance>>;
    /// Boundary event instances attached to an activity instance.
    async fn load_attached_flow_nodes(&self, activity_id: InstanceId) -> Result<Vec<FlowNodeInstance>>;
    async fn search_flow_nodes(&self, options: &QueryOptions) -> Result<Vec<FlowNodeInstance>>;

    // ── Tokens ──

    async fn count_tokens(&self, process_instance_id: InstanceId, ref_id: Option<RefId>) -> Result<u64>;
    async fn search_tokens(&self, options: &QueryOptions) -> Result<Vec<Token>>;

    // ── Waiting events ──

    async fn find_waiting_message_events(&self, message_name: &str) -> Result<Vec<WaitingEvent>>;
    async fn find_waiting_event_by_job(&self, job_id: &str) -> Result<Option<WaitingEvent>>;
    async fn load_waiting_events_of_flow_node(&self, flow_node_id: InstanceId) -> Result<Vec<WaitingEvent>>;
    async fn load_waiting_events_of_process(&self, process_instance_id: InstanceId) -> Result<Vec<WaitingEvent>>;
    async fn load_start_waiting_events(&self, definition_id: ProcessDefinitionId) -> Result<Vec<WaitingEvent>>;
    async fn search_waiting_events(&self, options: &QueryOptions) -> Result<Vec<WaitingEvent>>;

    // ── Event log (append-only) ──

    async fn read_events(
        &self,
        process_instance_id: InstanceId,
        from_seq: u64,
    ) -> Result<Vec<(u64, EngineEvent)>>;

    // ── Incidents ──

    async fn load_incident(&self, id: Uuid) -> Result<Option<Incident>>;
    async fn load_incidents(&self, process_instance_id: InstanceId) -> Result<Vec<Incident>>;
}

/// Write-once storage of archived snapshots.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Archiving the same element in the same state twice is a no-op.
    async fn archive_flow_node(&self, snapshot: ArchivedFlowNodeInstance) -> Result<()>;
    async fn archive_process(&self, snapshot: ArchivedProcessInstance) -> Result<()>;
    async fn archived_flow_nodes(&self, process_instance_id: InstanceId) -> Result<Vec<ArchivedFlowNodeInstance>>;
    async fn archived_process(&self, process_instance_id: InstanceId) -> Result<Option<ArchivedProcessInstance>>;
    /// Remove every archived element of a process instance. Returns how many
    /// snapshots were dropped.
    async fn delete_archived_process_instance(&self, process_instance_id: InstanceId) -> Result<u64>;
}
