use crate::context::ProcessEngineContext;
use crate::correlation::{self, Subscription};
use crate::definition::{
    ConnectorEvent, EndEventResult, EventTrigger, FailAction, FlowNodeDefinition, FlowNodeKind,
    GatewayType, LoopCharacteristics, ProcessDefinition, TaskType,
};
use crate::engine::Work;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::expression::ExpressionResolver;
use crate::gateway::{Arrival, GatewayService};
use crate::lock::LockKey;
use crate::multi_instance::MultiInstanceController;
use crate::scheduler::TimerJob;
use crate::store::{CommitReceipt, Mutation, WorkUnit};
use crate::types::*;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ─── Instances ────────────────────────────────────────────────

/// Where a new flow-node instance is placed.
#[derive(Clone, Debug)]
pub(crate) struct Placement {
    pub process_instance_id: InstanceId,
    pub container_id: InstanceId,
    pub token_ref_id: Option<RefId>,
    pub incoming: Option<TransitionId>,
    pub loop_index: Option<u32>,
    pub attached_to: Option<InstanceId>,
    pub local_data: DataMap,
}

impl Placement {
    /// Holding one token of `scope`.
    pub fn in_scope(process_instance_id: InstanceId, scope: RefId) -> Self {
        Self {
            process_instance_id,
            container_id: scope,
            token_ref_id: Some(scope),
            incoming: None,
            loop_index: None,
            attached_to: None,
            local_data: DataMap::new(),
        }
    }

    /// Boundary event waiting on `activity`; holds no token.
    pub fn waiting_boundary(
        process_instance_id: InstanceId,
        scope: RefId,
        activity: InstanceId,
    ) -> Self {
        Self {
            token_ref_id: None,
            attached_to: Some(activity),
            ..Self::in_scope(process_instance_id, scope)
        }
    }
}

/// A `Ready` instance of `def`. Activities with loop characteristics become
/// wrappers unless placed as one of the wrapper's children.
pub(crate) fn build_instance(
    id: InstanceId,
    definition: &ProcessDefinition,
    def: &FlowNodeDefinition,
    placement: Placement,
) -> FlowNodeInstance {
    let (node_type, detail) = match (&def.loop_characteristics, placement.loop_index) {
        (Some(LoopCharacteristics::MultiInstance(mi)), None) => (
            FlowNodeType::MultiInstance,
            InstanceDetail::MultiInstance(MultiInstanceCounters {
                sequential: mi.sequential,
                ..MultiInstanceCounters::default()
            }),
        ),
        (Some(LoopCharacteristics::Standard(l)), None) => (
            FlowNodeType::Loop,
            InstanceDetail::Loop(LoopCounters {
                loop_counter: 0,
                loop_max: l.loop_max,
                test_before: l.test_before,
            }),
        ),
        _ => match &def.kind {
            FlowNodeKind::Gateway { gateway_type } => (
                FlowNodeType::Gateway,
                InstanceDetail::Gateway(GatewayState {
                    gateway_type: *gateway_type,
                    hit_by: Vec::new(),
                    queued_hits: Vec::new(),
                    fired: false,
                }),
            ),
            FlowNodeKind::Task { .. } | FlowNodeKind::SubProcess => {
                (def.instance_type(), InstanceDetail::Activity)
            }
            _ => (FlowNodeType::Event, InstanceDetail::Event),
        },
    };
    let now = now_ms();
    FlowNodeInstance {
        id,
        process_instance_id: placement.process_instance_id,
        process_definition_id: definition.id,
        definition_id: def.id,
        container_id: placement.container_id,
        node_type,
        state: FlowNodeState::Ready,
        state_category: StateCategory::Normal,
        token_count: u32::from(placement.token_ref_id.is_some()),
        token_ref_id: placement.token_ref_id,
        name: def.name.clone(),
        description: def.description.clone(),
        attached_to: placement.attached_to,
        loop_index: placement.loop_index,
        incoming_transition: placement.incoming,
        local_data: placement.local_data,
        detail,
        failed_from: None,
        created_at: now,
        last_update: now,
    }
}

/// Whether flow nodes of the process may still make progress.
pub(crate) fn accepts_work(process: &ProcessInstance) -> bool {
    process.state == ProcessState::Started
        && matches!(
            process.state_category,
            StateCategory::Normal | StateCategory::Error
        )
}

/// Outgoing transitions taken when `def` completes.
///
/// Exclusive gateways take the first transition whose condition holds,
/// parallel gateways take all of them, everything else takes every
/// transition whose condition holds. The default transition is taken only
/// when nothing else is.
pub fn select_transitions(
    definition: &ProcessDefinition,
    def: &FlowNodeDefinition,
    data: &DataMap,
    resolver: &dyn ExpressionResolver,
) -> Result<Vec<TransitionId>> {
    if def.outgoing.is_empty() {
        return Ok(Vec::new());
    }
    let gateway_type = def.gateway_type();
    if gateway_type == Some(GatewayType::Parallel) {
        return Ok(def.outgoing.clone());
    }

    let mut taken = Vec::new();
    for t in &def.outgoing {
        if def.default_transition == Some(*t) {
            continue;
        }
        let transition = definition.transition(*t)?;
        let holds = match &transition.condition {
            Some(condition) => resolver.evaluate_bool(condition, data)?,
            None => true,
        };
        if holds {
            taken.push(*t);
            if gateway_type == Some(GatewayType::Exclusive) {
                break;
            }
        }
    }
    if taken.is_empty() {
        match def.default_transition {
            Some(default) => taken.push(default),
            None => {
                return Err(EngineError::modification(format!(
                    "no outgoing transition of '{}' can be taken",
                    def.name
                )))
            }
        }
    }
    Ok(taken)
}

// ─── Data context ─────────────────────────────────────────────

/// Values visible to a flow node and the process data writes it produced.
pub(crate) struct DataContext {
    pub values: DataMap,
    pub process_updates: DataMap,
}

impl DataContext {
    pub fn new(process: &ProcessInstance, node: &FlowNodeInstance) -> Self {
        let mut values = process.data.clone();
        values.extend(node.local_data.clone());
        Self {
            values,
            process_updates: DataMap::new(),
        }
    }

    /// Local variables of the node shadow process data.
    pub fn assign(&mut self, node: &mut FlowNodeInstance, name: &str, value: Value) {
        if node.local_data.contains_key(name) {
            node.local_data.insert(name.to_string(), value.clone());
        } else {
            self.process_updates.insert(name.to_string(), value.clone());
        }
        self.values.insert(name.to_string(), value);
    }
}

// ─── Effects ──────────────────────────────────────────────────

/// A work unit plus the side effects that follow its commit.
#[derive(Default)]
pub(crate) struct Effects {
    pub unit: WorkUnit,
    pub schedule: Vec<TimerJob>,
    pub cancel: Vec<String>,
    /// Terminal flow nodes to archive and drop once the unit committed.
    pub archive: Vec<FlowNodeInstance>,
}

impl Effects {
    pub fn register_waiting_event(
        &mut self,
        process_instance_id: Option<InstanceId>,
        waiting: WaitingEvent,
        job: Option<TimerJob>,
    ) {
        if let Some(pid) = process_instance_id {
            self.unit.event(pid, EngineEvent::WaitingEventRegistered {
                waiting_event_id: waiting.id,
                event_type: waiting.event_type,
                flow_node_id: waiting.flow_node_instance_id,
            });
        }
        self.unit.push(Mutation::InsertWaitingEvent(waiting));
        self.schedule.extend(job);
    }

    pub async fn apply(self, ctx: &ProcessEngineContext) -> Result<CommitReceipt> {
        let receipt = ctx.store.commit(self.unit).await?;
        for job in self.cancel {
            ctx.scheduler.cancel(&job).await?;
        }
        for job in self.schedule {
            ctx.scheduler.schedule(job).await?;
        }
        if !self.archive.is_empty() {
            let archived_at = now_ms();
            let mut unit = WorkUnit::new();
            for node in self.archive {
                unit.push(Mutation::DeleteFlowNode(node.id));
                ctx.archive
                    .archive_flow_node(ArchivedFlowNodeInstance {
                        source: node,
                        archived_at,
                    })
                    .await?;
            }
            ctx.store.commit(unit).await?;
        }
        Ok(receipt)
    }
}

/// `false` when the unit lost the race for a waiting event it consumes.
pub(crate) fn consumed<T>(result: Result<T>) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(err) if err.is_missing("waiting event") => Ok(false),
        Err(err) => Err(err),
    }
}

/// Outcome of a locked step: either follow-up work or an error thrown by
/// the node that must be routed once its lock is released.
enum Step {
    Done(Vec<Work>),
    Throw { node: FlowNodeInstance, code: String },
}

enum ConnectorOutcome {
    Proceed,
    Throw(String),
}

/// Boundary event taking over the token of an interrupted activity.
pub(crate) enum BoundarySource {
    /// A waiting instance, fired by its trigger.
    Waiting(InstanceId),
    /// Instantiated on the spot for a caught error.
    Caught { definition_id: FlowNodeDefId, code: String },
}

/// Target of an incident.
#[derive(Clone, Copy, Debug)]
pub(crate) enum IncidentTarget {
    FlowNode(InstanceId),
    Process(InstanceId),
}

struct Loaded {
    node: FlowNodeInstance,
    process: ProcessInstance,
    definition: Arc<ProcessDefinition>,
}

// ─── State machine ────────────────────────────────────────────

/// Flow-node state machine: READY → EXECUTING → COMPLETED, or ABORTED and
/// CANCELLED from any live state. Every step of one instance runs under
/// its flow-node lock.
pub struct FlowNodeStateMachine {
    ctx: ProcessEngineContext,
    gateways: GatewayService,
    multi: MultiInstanceController,
}

impl FlowNodeStateMachine {
    pub fn new(ctx: ProcessEngineContext) -> Self {
        Self {
            gateways: GatewayService::new(ctx.clone()),
            multi: MultiInstanceController::new(ctx.clone()),
            ctx,
        }
    }

    async fn load(&self, id: InstanceId) -> Result<Option<Loaded>> {
        let Some(node) = self.ctx.store.load_flow_node(id).await? else {
            return Ok(None);
        };
        let Some(process) = self.ctx.store.load_process(node.process_instance_id).await? else {
            return Ok(None);
        };
        let definition = self.ctx.deployment(node.process_definition_id).await?.definition;
        Ok(Some(Loaded {
            node,
            process,
            definition,
        }))
    }

    /// Scope one level above `scope`, for token parent links.
    pub(crate) async fn parent_scope(&self, pid: InstanceId, scope: RefId) -> Result<Option<RefId>> {
        if scope == pid {
            return Ok(None);
        }
        Ok(self
            .ctx
            .store
            .load_flow_node(scope)
            .await?
            .map(|container| container.container_id))
    }

    // ── Execute ──

    /// READY → EXECUTING. Runs on-enter connectors, arms boundary events
    /// and starts the inner flow of containers. Nodes with nothing to wait
    /// for are completed right away.
    pub(crate) async fn execute(&self, id: InstanceId) -> Result<Vec<Work>> {
        match self.execute_locked(id).await? {
            Step::Done(work) => Ok(work),
            Step::Throw { node, code } => self.route_error(&node, &code).await,
        }
    }

    async fn execute_locked(&self, id: InstanceId) -> Result<Step> {
        let _guard = self.ctx.locks.lock(LockKey::FlowNode(id)).await;
        let Some(Loaded {
            mut node,
            process,
            definition,
        }) = self.load(id).await?
        else {
            return Ok(Step::Done(Vec::new()));
        };
        if node.state != FlowNodeState::Ready
            || node.state_category != StateCategory::Normal
            || !accepts_work(&process)
        {
            debug!(flow_node_id = id, state = node.state.as_str(), "execute skipped");
            return Ok(Step::Done(Vec::new()));
        }
        let def = definition.node(node.definition_id)?;
        let mut fx = Effects::default();
        let mut data = DataContext::new(&process, &node);
        let mut work = Vec::new();

        if !node.is_wrapper() {
            let outcome = self
                .run_connectors(def, ConnectorEvent::OnEnter, &mut node, &mut data, &mut fx.unit)
                .await?;
            if let ConnectorOutcome::Throw(code) = outcome {
                fx.unit.set_process_data(process.id, data.process_updates);
                fx.unit.update_flow_node(node.clone());
                fx.apply(&self.ctx).await?;
                return Ok(Step::Throw { node, code });
            }
        }

        let from = node.state;
        node.set_state(FlowNodeState::Executing);

        if node.is_wrapper() {
            self.register_boundaries(&definition, def, &process, &node, &data.values, &mut fx)
                .await?;
            work.extend(
                self.multi
                    .activate(&definition, def, &process, &mut node, &data.values, &mut fx)
                    .await?,
            );
        } else {
            match &def.kind {
                FlowNodeKind::Task {
                    task_type: TaskType::User | TaskType::Manual,
                } => {
                    self.register_boundaries(&definition, def, &process, &node, &data.values, &mut fx)
                        .await?;
                }
                FlowNodeKind::SubProcess => {
                    self.register_boundaries(&definition, def, &process, &node, &data.values, &mut fx)
                        .await?;
                    let starts = definition.none_start_events(Some(def.id));
                    fx.unit
                        .create_tokens(process.id, node.id, node.token_ref_id, starts.len() as u32);
                    for start in starts {
                        let child_id = self.ctx.store.next_id().await?;
                        let mut placement = Placement::in_scope(process.id, node.id);
                        placement.local_data = node.local_data.clone();
                        fx.unit.insert_flow_node(build_instance(
                            child_id,
                            &definition,
                            definition.node(start)?,
                            placement,
                        ));
                        work.push(Work::Execute(child_id));
                    }
                }
                FlowNodeKind::IntermediateCatchEvent { trigger } => {
                    let subscription = Subscription {
                        definition: &definition,
                        def,
                        trigger,
                        kind: WaitingEventKind::IntermediateCatch,
                        process: Some(&process),
                        node: Some(&node),
                    };
                    let waiting_id = self.ctx.store.next_id().await?;
                    let (waiting, job) =
                        subscription.build(waiting_id, &data.values, self.ctx.expressions.as_ref())?;
                    fx.register_waiting_event(Some(process.id), waiting, job);
                }
                // Gateways progress through arrivals, never through execute.
                FlowNodeKind::Gateway { .. } => return Ok(Step::Done(Vec::new())),
                _ => work.push(Work::Complete(node.id)),
            }
        }

        fx.unit.set_process_data(process.id, data.process_updates);
        fx.unit.transition_flow_node(node, from);
        fx.apply(&self.ctx).await?;
        Ok(Step::Done(work))
    }

    // ── Complete ──

    /// EXECUTING → COMPLETED. Runs on-finish connectors and operations,
    /// takes the outgoing transitions and records the successors and the
    /// gateway arrivals in the same commit as the completion.
    pub(crate) async fn complete(&self, id: InstanceId) -> Result<Vec<Work>> {
        match self.complete_locked(id).await? {
            Step::Done(work) => Ok(work),
            Step::Throw { node, code } => self.route_error(&node, &code).await,
        }
    }

    async fn complete_locked(&self, id: InstanceId) -> Result<Step> {
        let _guard = self.ctx.locks.lock(LockKey::FlowNode(id)).await;
        let Some(Loaded {
            mut node,
            process,
            definition,
        }) = self.load(id).await?
        else {
            return Ok(Step::Done(Vec::new()));
        };
        if node.state != FlowNodeState::Executing
            || node.state_category != StateCategory::Normal
            || !accepts_work(&process)
            || node.gateway().is_some_and(|g| !g.fired)
        {
            debug!(flow_node_id = id, state = node.state.as_str(), "complete skipped");
            return Ok(Step::Done(Vec::new()));
        }
        let pid = process.id;
        let def = definition.node(node.definition_id)?;
        let mut fx = Effects::default();
        let mut data = DataContext::new(&process, &node);
        let mut work = Vec::new();

        if !node.is_wrapper() && node.node_type != FlowNodeType::Gateway {
            let outcome = self
                .run_connectors(def, ConnectorEvent::OnFinish, &mut node, &mut data, &mut fx.unit)
                .await?;
            if let ConnectorOutcome::Throw(code) = outcome {
                fx.unit.set_process_data(pid, data.process_updates);
                fx.unit.update_flow_node(node.clone());
                fx.apply(&self.ctx).await?;
                return Ok(Step::Throw { node, code });
            }
            self.apply_operations(def, &mut node, &mut data)?;
        }

        let mut terminate = false;
        match &def.kind {
            FlowNodeKind::EndEvent {
                result: EndEventResult::Error { code },
            } => {
                fx.unit.set_process_data(pid, data.process_updates);
                fx.unit.update_flow_node(node.clone());
                fx.apply(&self.ctx).await?;
                return Ok(Step::Throw {
                    node,
                    code: code.clone(),
                });
            }
            FlowNodeKind::EndEvent {
                result: EndEventResult::Terminate,
            } => terminate = true,
            FlowNodeKind::EndEvent {
                result: EndEventResult::Message(message),
            }
            | FlowNodeKind::IntermediateThrowEvent { message } => {
                let message =
                    correlation::build_message(message, &data.values, self.ctx.expressions.as_ref())?;
                work.push(Work::Deliver {
                    process_instance_id: pid,
                    message,
                });
            }
            _ => {}
        }

        // Waiting boundary events leave with their activity.
        for boundary in self.ctx.store.load_attached_flow_nodes(id).await? {
            if boundary.is_live() && boundary.token_ref_id.is_none() {
                self.discard_waiting(boundary, FlowNodeState::Aborted, &mut fx).await?;
            }
        }

        let scope = node.container_id;
        let from = node.state;
        let held = node.token_count;
        node.set_state(FlowNodeState::Completed);
        node.token_count = 0;

        if node.is_loop_child() {
            fx.unit.delete_tokens(pid, scope, held);
            fx.unit.set_process_data(pid, data.process_updates);
            fx.unit.transition_flow_node(node.clone(), from);
            fx.archive.push(node.clone());
            fx.apply(&self.ctx).await?;
            work.push(Work::ChildFinished {
                wrapper_id: scope,
                child: Some(Box::new(node)),
            });
            return Ok(Step::Done(work));
        }

        let taken = select_transitions(&definition, def, &data.values, self.ctx.expressions.as_ref())?;
        let branches = taken.len() as u32;
        if branches > held {
            let parent = self.parent_scope(pid, scope).await?;
            fx.unit.create_tokens(pid, scope, parent, branches - held);
        } else {
            fx.unit.delete_tokens(pid, scope, held - branches);
        }

        let mut arrivals: BTreeMap<FlowNodeDefId, Vec<TransitionId>> = BTreeMap::new();
        let mut created = Vec::new();
        for t in &taken {
            let target = definition.node(definition.transition(*t)?.target)?;
            fx.unit.event(pid, EngineEvent::TransitionTaken {
                transition_id: *t,
                source_flow_node_id: node.id,
            });
            if target.gateway_type().is_some() {
                arrivals.entry(target.id).or_default().push(*t);
                continue;
            }
            let new_id = self.ctx.store.next_id().await?;
            let mut placement = Placement::in_scope(pid, scope);
            placement.incoming = Some(*t);
            placement.local_data = node.local_data.clone();
            created.push(build_instance(new_id, &definition, target, placement));
        }

        let mut fired = Vec::new();
        let _gateway_guards = if arrivals.is_empty() {
            Vec::new()
        } else {
            let guards = self
                .ctx
                .locks
                .lock_many(arrivals.keys().map(|d| LockKey::Gateway {
                    scope,
                    definition: *d,
                }))
                .await;
            let mut live: Vec<FlowNodeInstance> = self
                .ctx
                .store
                .load_flow_nodes_in_container(scope)
                .await?
                .into_iter()
                .filter(|n| n.is_live() && n.id != node.id && !fx.archive.iter().any(|a| a.id == n.id))
                .collect();
            live.extend(created.iter().cloned());
            let scope_tokens = (self.ctx.store.count_tokens(pid, Some(scope)).await?
                + u64::from(branches))
            .saturating_sub(u64::from(held));
            fired = self
                .gateways
                .arrive(
                    Arrival {
                        definition: &definition,
                        process_instance_id: pid,
                        scope,
                        source: &node,
                    },
                    arrivals,
                    live,
                    scope_tokens,
                    &mut fx.unit,
                )
                .await?;
            guards
        };

        for successor in created {
            work.push(Work::Execute(successor.id));
            fx.unit.insert_flow_node(successor);
        }
        fx.unit.set_process_data(pid, data.process_updates);
        fx.unit.transition_flow_node(node.clone(), from);
        fx.archive.push(node);
        fx.apply(&self.ctx).await?;

        work.extend(fired.into_iter().map(Work::Complete));
        if terminate {
            work.push(Work::TerminateScope {
                process_instance_id: pid,
                scope_id: scope,
            });
        } else {
            work.push(Work::ScopeCheck {
                process_instance_id: pid,
                scope_id: scope,
            });
        }
        Ok(Step::Done(work))
    }

    // ── Connectors and operations ──

    async fn run_connectors(
        &self,
        def: &FlowNodeDefinition,
        activation: ConnectorEvent,
        node: &mut FlowNodeInstance,
        data: &mut DataContext,
        unit: &mut WorkUnit,
    ) -> Result<ConnectorOutcome> {
        for connector in def.connectors.iter().filter(|c| c.activation == activation) {
            let mut inputs = DataMap::new();
            for (name, expression) in &connector.inputs {
                inputs.insert(
                    name.clone(),
                    self.ctx.expressions.evaluate(expression, &data.values)?,
                );
            }
            match self.ctx.connectors.execute(&connector.connector_id, inputs).await {
                Ok(outputs) => {
                    for (output, target) in &connector.outputs {
                        if let Some(value) = outputs.get(output) {
                            data.assign(node, target, value.clone());
                        }
                    }
                }
                Err(err) => match &connector.fail_action {
                    FailAction::Fail => return Err(err),
                    FailAction::Ignore => {
                        warn!(flow_node_id = node.id, connector = %connector.name, error = %err, "connector failure ignored");
                        unit.event(node.process_instance_id, EngineEvent::ConnectorFailed {
                            flow_node_id: node.id,
                            connector: connector.name.clone(),
                            ignored: true,
                        });
                    }
                    FailAction::ThrowError { code } => {
                        warn!(flow_node_id = node.id, connector = %connector.name, code = %code, error = %err, "connector failure thrown as error");
                        unit.event(node.process_instance_id, EngineEvent::ConnectorFailed {
                            flow_node_id: node.id,
                            connector: connector.name.clone(),
                            ignored: false,
                        });
                        return Ok(ConnectorOutcome::Throw(code.clone()));
                    }
                },
            }
        }
        Ok(ConnectorOutcome::Proceed)
    }

    fn apply_operations(
        &self,
        def: &FlowNodeDefinition,
        node: &mut FlowNodeInstance,
        data: &mut DataContext,
    ) -> Result<()> {
        for operation in &def.operations {
            let value = self.ctx.expressions.evaluate(&operation.expression, &data.values)?;
            data.assign(node, &operation.target, value);
        }
        Ok(())
    }

    // ── Events ──

    /// Arm one waiting instance per timer or message boundary event of
    /// `activity`. Error boundaries are matched when an error is thrown.
    async fn register_boundaries(
        &self,
        definition: &ProcessDefinition,
        def: &FlowNodeDefinition,
        process: &ProcessInstance,
        activity: &FlowNodeInstance,
        data: &DataMap,
        fx: &mut Effects,
    ) -> Result<()> {
        for boundary_def_id in &def.boundary_events {
            let boundary_def = definition.node(*boundary_def_id)?;
            let FlowNodeKind::BoundaryEvent { trigger, .. } = &boundary_def.kind else {
                continue;
            };
            if trigger.waiting_event_type().is_none() {
                continue;
            }
            self.arm_boundary(definition, boundary_def, trigger, process, activity, data, fx)
                .await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn arm_boundary(
        &self,
        definition: &ProcessDefinition,
        boundary_def: &FlowNodeDefinition,
        trigger: &EventTrigger,
        process: &ProcessInstance,
        activity: &FlowNodeInstance,
        data: &DataMap,
        fx: &mut Effects,
    ) -> Result<InstanceId> {
        let boundary_id = self.ctx.store.next_id().await?;
        let mut boundary = build_instance(
            boundary_id,
            definition,
            boundary_def,
            Placement::waiting_boundary(process.id, activity.container_id, activity.id),
        );
        boundary.state = FlowNodeState::Executing;
        let subscription = Subscription {
            definition,
            def: boundary_def,
            trigger,
            kind: WaitingEventKind::Boundary,
            process: Some(process),
            node: Some(&boundary),
        };
        let waiting_id = self.ctx.store.next_id().await?;
        let (waiting, job) = subscription.build(waiting_id, data, self.ctx.expressions.as_ref())?;
        fx.unit.insert_flow_node(boundary);
        fx.register_waiting_event(Some(process.id), waiting, job);
        Ok(boundary_id)
    }

    /// Drop a node that holds no token together with its waiting events.
    async fn discard_waiting(
        &self,
        mut node: FlowNodeInstance,
        state: FlowNodeState,
        fx: &mut Effects,
    ) -> Result<()> {
        for waiting in self.ctx.store.load_waiting_events_of_flow_node(node.id).await? {
            fx.cancel.extend(waiting.job_id);
        }
        fx.unit.push(Mutation::DeleteWaitingEventsOfFlowNode(node.id));
        let from = node.state;
        node.state_category = StateCategory::Aborting;
        node.set_state(state);
        fx.unit.transition_flow_node(node.clone(), from);
        fx.archive.push(node);
        Ok(())
    }

    /// Deliver a trigger to a waiting intermediate catch event. `None` when
    /// the subscription was already consumed or the node no longer waits.
    pub(crate) async fn trigger_catch_event(
        &self,
        waiting: &WaitingEvent,
        payload: &DataMap,
    ) -> Result<Option<Vec<Work>>> {
        let Some(id) = waiting.flow_node_instance_id else {
            return Ok(None);
        };
        let _guard = self.ctx.locks.lock(LockKey::FlowNode(id)).await;
        let Some(Loaded {
            node,
            process,
            definition,
        }) = self.load(id).await?
        else {
            return Ok(None);
        };
        if node.state != FlowNodeState::Executing
            || node.state_category != StateCategory::Normal
            || !accepts_work(&process)
        {
            return Ok(None);
        }

        let mut unit = WorkUnit::new();
        unit.consume_waiting_event(waiting.id);
        if let FlowNodeKind::IntermediateCatchEvent { trigger } = &definition.node(node.definition_id)?.kind {
            if let Some(message) = trigger.message() {
                unit.set_process_data(process.id, correlation::mapped_data(message, payload));
            }
        }
        unit.event(process.id, EngineEvent::EventTriggered {
            waiting_event_id: waiting.id,
            flow_node_id: Some(id),
        });
        if !consumed(self.ctx.store.commit(unit).await)? {
            return Ok(None);
        }
        info!(flow_node_id = id, waiting_event_id = waiting.id, "catch event triggered");
        Ok(Some(vec![Work::Complete(id)]))
    }

    /// Deliver a trigger to a waiting boundary event.
    pub(crate) async fn fire_boundary(
        &self,
        waiting: &WaitingEvent,
        payload: &DataMap,
    ) -> Result<Option<Vec<Work>>> {
        let Some(boundary_id) = waiting.flow_node_instance_id else {
            return Ok(None);
        };
        let Some(boundary) = self.ctx.store.load_flow_node(boundary_id).await? else {
            return Ok(None);
        };
        let Some(activity_id) = boundary.attached_to else {
            return Ok(None);
        };
        let definition = self.ctx.deployment(boundary.process_definition_id).await?.definition;
        let FlowNodeKind::BoundaryEvent {
            trigger,
            interrupting,
        } = &definition.node(boundary.definition_id)?.kind
        else {
            return Err(EngineError::modification(format!(
                "flow node {boundary_id} is not a boundary event"
            )));
        };
        let updates = trigger
            .message()
            .map(|m| correlation::mapped_data(m, payload))
            .unwrap_or_default();

        if *interrupting {
            return self
                .interrupt(
                    activity_id,
                    BoundarySource::Waiting(boundary_id),
                    updates,
                    Some(waiting.id),
                )
                .await;
        }

        let _guard = self.ctx.locks.lock(LockKey::FlowNode(activity_id)).await;
        let Some(Loaded {
            node: activity,
            process,
            definition: _,
        }) = self.load(activity_id).await?
        else {
            return Ok(None);
        };
        if !activity.is_live()
            || activity.state_category != StateCategory::Normal
            || !accepts_work(&process)
        {
            return Ok(None);
        }
        let Some(mut boundary) = self.ctx.store.load_flow_node(boundary_id).await? else {
            return Ok(None);
        };

        let pid = process.id;
        let scope = activity.container_id;
        let mut fx = Effects::default();
        fx.unit.consume_waiting_event(waiting.id);
        let parent = self.parent_scope(pid, scope).await?;
        fx.unit.create_tokens(pid, scope, parent, 1);
        boundary.token_ref_id = Some(scope);
        boundary.token_count = 1;
        fx.unit.update_flow_node(boundary);
        fx.unit.set_process_data(pid, updates);
        fx.unit.event(pid, EngineEvent::EventTriggered {
            waiting_event_id: waiting.id,
            flow_node_id: Some(boundary_id),
        });

        // A message boundary keeps listening while the activity runs.
        if trigger.message().is_some() {
            let boundary_def = definition.node(waiting.flow_node_definition_id)?;
            let data = DataContext::new(&process, &activity);
            self.arm_boundary(&definition, boundary_def, trigger, &process, &activity, &data.values, &mut fx)
                .await?;
        }
        if !consumed(fx.apply(&self.ctx).await)? {
            return Ok(None);
        }
        info!(activity_id, boundary_id, "non-interrupting boundary event fired");
        Ok(Some(vec![Work::Complete(boundary_id)]))
    }

    /// Move the token of a live activity to one of its boundary events and
    /// abort the activity with everything it contains.
    pub(crate) async fn interrupt(
        &self,
        activity_id: InstanceId,
        source: BoundarySource,
        updates: DataMap,
        consume: Option<InstanceId>,
    ) -> Result<Option<Vec<Work>>> {
        let boundary_id = {
            let _guard = self.ctx.locks.lock(LockKey::FlowNode(activity_id)).await;
            let Some(Loaded {
                node: mut activity,
                process,
                definition,
            }) = self.load(activity_id).await?
            else {
                return Ok(None);
            };
            if !activity.is_live()
                || activity.state_category != StateCategory::Normal
                || !accepts_work(&process)
            {
                return Ok(None);
            }
            let pid = process.id;
            let scope = activity.container_id;
            let mut fx = Effects::default();
            if let Some(waiting_id) = consume {
                fx.unit.consume_waiting_event(waiting_id);
            }
            let mut boundary = match &source {
                BoundarySource::Waiting(id) => {
                    let Some(boundary) = self.ctx.store.load_flow_node(*id).await? else {
                        return Ok(None);
                    };
                    if let Some(waiting_id) = consume {
                        fx.unit.event(pid, EngineEvent::EventTriggered {
                            waiting_event_id: waiting_id,
                            flow_node_id: Some(*id),
                        });
                    }
                    boundary
                }
                BoundarySource::Caught {
                    definition_id,
                    code,
                } => {
                    let id = self.ctx.store.next_id().await?;
                    let mut boundary = build_instance(
                        id,
                        &definition,
                        definition.node(*definition_id)?,
                        Placement::waiting_boundary(pid, scope, activity_id),
                    );
                    boundary.state = FlowNodeState::Executing;
                    fx.unit.insert_flow_node(boundary.clone());
                    fx.unit.event(pid, EngineEvent::ErrorCaught {
                        code: code.clone(),
                        activity_id,
                        boundary_definition_id: *definition_id,
                    });
                    boundary
                }
            };
            boundary.token_ref_id = Some(scope);
            boundary.token_count = activity.token_count;
            boundary.last_update = now_ms();
            activity.token_count = 0;
            activity.state_category = StateCategory::Aborting;
            fx.unit.update_flow_node(boundary.clone());
            fx.unit.update_flow_node(activity);
            fx.unit.set_process_data(pid, updates);
            if !consumed(fx.apply(&self.ctx).await)? {
                return Ok(None);
            }
            info!(activity_id, boundary_id = boundary.id, "activity interrupted by boundary event");
            boundary.id
        };

        let mut work = self
            .abort_subtree(activity_id, FlowNodeState::Aborted, false, false)
            .await?;
        work.push(Work::Complete(boundary_id));
        Ok(Some(work))
    }

    /// Hand an error thrown by `source` to the nearest enclosing activity
    /// with a matching error boundary event.
    pub(crate) async fn route_error(&self, source: &FlowNodeInstance, code: &str) -> Result<Vec<Work>> {
        let definition = self.ctx.deployment(source.process_definition_id).await?.definition;
        let mut current = source.clone();
        loop {
            let def = definition.node(current.definition_id)?;
            if def.is_activity() && !current.is_loop_child() {
                let catching = def.boundary_events.iter().copied().find(|b| {
                    definition.node(*b).is_ok_and(|b| {
                        matches!(
                            &b.kind,
                            FlowNodeKind::BoundaryEvent {
                                trigger: EventTrigger::Error { code: caught },
                                ..
                            } if caught.is_none() || caught.as_deref() == Some(code)
                        )
                    })
                });
                if let Some(boundary) = catching {
                    info!(code, activity_id = current.id, "error caught");
                    let source = BoundarySource::Caught {
                        definition_id: boundary,
                        code: code.to_string(),
                    };
                    return Ok(self
                        .interrupt(current.id, source, DataMap::new(), None)
                        .await?
                        .unwrap_or_default());
                }
            }
            if current.container_id == current.process_instance_id {
                return Err(EngineError::modification(format!(
                    "no boundary event catches error '{code}' thrown by '{}'",
                    source.name
                )));
            }
            current = self
                .ctx
                .store
                .load_flow_node(current.container_id)
                .await?
                .ok_or_else(|| EngineError::not_found("flow node", current.container_id))?;
        }
    }

    // ── Abort ──

    /// Abort or cancel a flow node with every node it contains and every
    /// boundary event still waiting on it. Children go first; containers
    /// drop the tokens of their scope.
    ///
    /// With `delete_own_token` the root also gives up its own tokens and
    /// the enclosing scope is re-checked (or, for a loop child with
    /// `notify_container`, its wrapper is told).
    pub(crate) async fn abort_subtree(
        &self,
        root_id: InstanceId,
        state: FlowNodeState,
        delete_own_token: bool,
        notify_container: bool,
    ) -> Result<Vec<Work>> {
        let mut order = Vec::new();
        let mut stack = vec![root_id];
        while let Some(id) = stack.pop() {
            order.push(id);
            for child in self.ctx.store.load_flow_nodes_in_container(id).await? {
                if child.is_live() {
                    stack.push(child.id);
                }
            }
            for boundary in self.ctx.store.load_attached_flow_nodes(id).await? {
                if boundary.is_live() && boundary.token_ref_id.is_none() {
                    stack.push(boundary.id);
                }
            }
        }

        let category = match state {
            FlowNodeState::Cancelled => StateCategory::Cancelling,
            _ => StateCategory::Aborting,
        };
        let mut root = None;
        for id in order.into_iter().rev() {
            let _guard = self.ctx.locks.lock(LockKey::FlowNode(id)).await;
            let Some(mut node) = self.ctx.store.load_flow_node(id).await? else {
                continue;
            };
            if !node.is_live() {
                continue;
            }
            let pid = node.process_instance_id;
            let mut fx = Effects::default();
            for waiting in self.ctx.store.load_waiting_events_of_flow_node(id).await? {
                fx.cancel.extend(waiting.job_id);
            }
            fx.unit.push(Mutation::DeleteWaitingEventsOfFlowNode(id));
            if matches!(
                node.node_type,
                FlowNodeType::SubProcess | FlowNodeType::MultiInstance | FlowNodeType::Loop
            ) {
                fx.unit.delete_scope_tokens(pid, id);
            }
            if id == root_id && delete_own_token {
                if let Some(ref_id) = node.token_ref_id {
                    fx.unit.delete_tokens(pid, ref_id, node.token_count);
                }
                node.token_count = 0;
            }
            let from = node.state;
            node.state_category = category;
            node.set_state(state);
            fx.unit.transition_flow_node(node.clone(), from);
            fx.archive.push(node.clone());
            fx.apply(&self.ctx).await?;
            debug!(flow_node_id = id, state = state.as_str(), "flow node aborted");
            if id == root_id {
                root = Some(node);
            }
        }

        let mut work = Vec::new();
        if let Some(root) = root.filter(|_| delete_own_token) {
            if root.is_loop_child() {
                if notify_container {
                    work.push(Work::ChildFinished {
                        wrapper_id: root.container_id,
                        child: Some(Box::new(root)),
                    });
                }
            } else {
                work.push(Work::ScopeCheck {
                    process_instance_id: root.process_instance_id,
                    scope_id: root.container_id,
                });
            }
        }
        Ok(work)
    }

    // ── Incidents ──

    /// Halt the target on `err`: the flow node goes to FAILED keeping its
    /// token, the process instance to the error category.
    pub(crate) async fn raise_incident(&self, target: IncidentTarget, err: &EngineError) -> Result<Incident> {
        let kind = match err {
            EngineError::ConnectorExecution { .. } => IncidentKind::ConnectorFailure,
            EngineError::Expression(_) => IncidentKind::Expression,
            _ => IncidentKind::InvariantViolation,
        };
        let (pid, node_id) = match target {
            IncidentTarget::Process(pid) => (pid, None),
            IncidentTarget::FlowNode(id) => {
                let node = self
                    .ctx
                    .store
                    .load_flow_node(id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("flow node", id))?;
                (node.process_instance_id, Some(id))
            }
        };

        let _guard = match node_id {
            Some(id) => Some(self.ctx.locks.lock(LockKey::FlowNode(id)).await),
            None => None,
        };
        let mut unit = WorkUnit::new();
        let mut flow_node_name = None;
        if let Some(id) = node_id {
            if let Some(mut node) = self.ctx.store.load_flow_node(id).await? {
                flow_node_name = Some(node.name.clone());
                if node.is_live() && node.state != FlowNodeState::Failed {
                    let from = node.state;
                    node.failed_from = Some(from);
                    node.set_state(FlowNodeState::Failed);
                    unit.transition_flow_node(node, from);
                }
            }
        }
        let incident = Incident {
            incident_id: Uuid::now_v7(),
            process_instance_id: pid,
            flow_node_instance_id: node_id,
            flow_node_name,
            kind,
            message: err.to_string(),
            retry_count: 0,
            created_at: now_ms(),
            resolved_at: None,
            resolution: None,
        };
        if let Some(process) = self.ctx.store.load_process(pid).await? {
            if process.state == ProcessState::Started {
                unit.push(Mutation::SetProcessState {
                    id: pid,
                    state: process.state,
                    category: StateCategory::Error,
                    end_date: None,
                });
            }
        }
        unit.push(Mutation::SaveIncident(incident.clone()));
        unit.event(pid, EngineEvent::IncidentCreated {
            incident_id: incident.incident_id,
            flow_node_id: node_id,
        });
        self.ctx.store.commit(unit).await?;
        error!(
            process_instance_id = pid,
            flow_node_id = ?node_id,
            incident_id = %incident.incident_id,
            error = %err,
            "incident raised"
        );
        Ok(incident)
    }

    /// Resolve the open incidents of a FAILED node and replay the step that
    /// failed.
    pub(crate) async fn retry(&self, id: InstanceId) -> Result<Vec<Work>> {
        let _guard = self.ctx.locks.lock(LockKey::FlowNode(id)).await;
        let mut node = self
            .ctx
            .store
            .load_flow_node(id)
            .await?
            .ok_or_else(|| EngineError::not_found("flow node", id))?;
        if node.state != FlowNodeState::Failed {
            return Err(EngineError::modification(format!(
                "flow node {id} is {} and cannot be retried",
                node.state.as_str()
            )));
        }
        let pid = node.process_instance_id;
        let restored = node.failed_from.take().unwrap_or(FlowNodeState::Ready);
        node.set_state(restored);

        let mut unit = WorkUnit::new();
        let now = now_ms();
        let incidents = self.ctx.store.load_incidents(pid).await?;
        for incident in incidents
            .iter()
            .filter(|i| i.is_open() && i.flow_node_instance_id == Some(id))
        {
            let mut replayed = incident.clone();
            replayed.retry_count += 1;
            unit.push(Mutation::SaveIncident(replayed));
            unit.push(Mutation::ResolveIncident {
                incident_id: incident.incident_id,
                resolution: "retried".to_string(),
                at: now,
            });
            unit.event(pid, EngineEvent::IncidentResolved {
                incident_id: incident.incident_id,
            });
        }
        let still_open = incidents
            .iter()
            .any(|i| i.is_open() && i.flow_node_instance_id != Some(id));
        if let Some(process) = self.ctx.store.load_process(pid).await? {
            if process.state_category == StateCategory::Error && !still_open {
                unit.push(Mutation::SetProcessState {
                    id: pid,
                    state: process.state,
                    category: StateCategory::Normal,
                    end_date: None,
                });
            }
        }
        let is_wrapper = node.is_wrapper();
        unit.transition_flow_node(node, FlowNodeState::Failed);
        self.ctx.store.commit(unit).await?;
        info!(flow_node_id = id, state = restored.as_str(), "flow node retried");

        Ok(match restored {
            FlowNodeState::Ready => vec![Work::Execute(id)],
            _ if is_wrapper => vec![Work::ChildFinished {
                wrapper_id: id,
                child: None,
            }],
            _ => vec![Work::Complete(id)],
        })
    }

    // ── Recovery helpers ──

    /// Archive and drop a terminal node a crash left in the live tables.
    pub(crate) async fn archive_leftover(&self, node: FlowNodeInstance) -> Result<()> {
        let _guard = self.ctx.locks.lock(LockKey::FlowNode(node.id)).await;
        let mut fx = Effects::default();
        fx.archive.push(node);
        fx.apply(&self.ctx).await?;
        Ok(())
    }

    pub(crate) fn gateways(&self) -> &GatewayService {
        &self.gateways
    }

    pub(crate) fn multi_instance(&self) -> &MultiInstanceController {
        &self.multi
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ProcessDefinitionBuilder;
    use crate::expression::{CompareOp, DefaultExpressionResolver, Expression};
    use serde_json::json;

    fn amount_router() -> (ProcessDefinition, FlowNodeDefId) {
        let mut b = ProcessDefinitionBuilder::new("router", "1");
        let start = b.start_event("start");
        let route = b.gateway("route", GatewayType::Exclusive);
        let big = b.user_task("big");
        let small = b.user_task("small");
        let other = b.user_task("other");
        b.transition(start, route);
        b.conditional_transition(
            route,
            big,
            Expression::compare(Expression::data("amount"), CompareOp::Gt, Expression::constant(100)),
        );
        b.conditional_transition(
            route,
            small,
            Expression::compare(Expression::data("amount"), CompareOp::Gt, Expression::constant(10)),
        );
        b.default_transition(route, other);
        (b.build().unwrap(), route)
    }

    fn data(amount: i64) -> DataMap {
        DataMap::from([("amount".to_string(), json!(amount))])
    }

    #[test]
    fn test_exclusive_takes_first_true_condition() {
        let (def, route) = amount_router();
        let node = def.node(route).unwrap();
        let taken = select_transitions(&def, node, &data(500), &DefaultExpressionResolver).unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(def.node(def.transition(taken[0]).unwrap().target).unwrap().name, "big");
    }

    #[test]
    fn test_default_taken_when_nothing_holds() {
        let (def, route) = amount_router();
        let node = def.node(route).unwrap();
        let taken = select_transitions(&def, node, &data(1), &DefaultExpressionResolver).unwrap();
        assert_eq!(taken, vec![node.default_transition.unwrap()]);
    }

    #[test]
    fn test_no_transition_without_default_is_modification_error() {
        let mut b = ProcessDefinitionBuilder::new("stuck", "1");
        let start = b.start_event("start");
        let task = b.automatic_task("task");
        let end = b.end_event("end");
        b.transition(start, task);
        b.conditional_transition(task, end, Expression::data_equals("go", true));
        let def = b.build().unwrap();
        let data = DataMap::from([("go".to_string(), json!(false))]);
        let err = select_transitions(&def, def.node(task).unwrap(), &data, &DefaultExpressionResolver)
            .unwrap_err();
        assert!(matches!(err, EngineError::Modification(_)));
    }

    #[test]
    fn test_inclusive_takes_every_true_condition() {
        let mut b = ProcessDefinitionBuilder::new("fanout", "1");
        let start = b.start_event("start");
        let split = b.gateway("split", GatewayType::Inclusive);
        let a = b.user_task("a");
        let c = b.user_task("c");
        b.transition(start, split);
        b.conditional_transition(split, a, Expression::data_equals("a", true));
        b.conditional_transition(split, c, Expression::data_equals("c", true));
        let def = b.build().unwrap();
        let data = DataMap::from([("a".to_string(), json!(true)), ("c".to_string(), json!(true))]);
        let taken = select_transitions(&def, def.node(split).unwrap(), &data, &DefaultExpressionResolver)
            .unwrap();
        assert_eq!(taken.len(), 2);
    }

    #[test]
    fn test_build_instance_wraps_loop_activities() {
        let mut b = ProcessDefinitionBuilder::new("mi", "1");
        let start = b.start_event("start");
        let review = b.user_task("review");
        b.transition(start, review);
        b.loop_characteristics(
            review,
            LoopCharacteristics::MultiInstance(crate::definition::MultiInstanceLoop {
                sequential: false,
                cardinality: Some(Expression::constant(3)),
                input_collection: None,
                input_item: None,
                output_item: None,
                output_collection: None,
                completion_condition: None,
            }),
        );
        let def = b.build().unwrap();
        let review_def = def.node(review).unwrap();

        let wrapper = build_instance(7, &def, review_def, Placement::in_scope(1, 1));
        assert_eq!(wrapper.node_type, FlowNodeType::MultiInstance);
        assert_eq!(wrapper.token_count, 1);

        let mut placement = Placement::in_scope(1, 7);
        placement.loop_index = Some(0);
        let child = build_instance(8, &def, review_def, placement);
        assert_eq!(child.node_type, FlowNodeType::Task);
        assert!(child.is_loop_child());
    }

    #[test]
    fn test_local_data_shadows_process_data() {
        let process = ProcessInstance {
            id: 1,
            definition_id: 1,
            name: "p".into(),
            state: ProcessState::Started,
            state_category: StateCategory::Normal,
            data: DataMap::from([("x".to_string(), json!(1)), ("y".to_string(), json!(1))]),
            started_by: None,
            start_date: 0,
            end_date: None,
        };
        let (def, route) = amount_router();
        let mut placement = Placement::in_scope(1, 1);
        placement.local_data = DataMap::from([("x".to_string(), json!(5))]);
        let mut node = build_instance(2, &def, def.node(route).unwrap(), placement);

        let mut data = DataContext::new(&process, &node);
        assert_eq!(data.values["x"], json!(5));
        data.assign(&mut node, "x", json!(6));
        data.assign(&mut node, "y", json!(2));
        assert_eq!(node.local_data["x"], json!(6));
        assert_eq!(data.process_updates.get("x"), None);
        assert_eq!(data.process_updates["y"], json!(2));
    }
}
