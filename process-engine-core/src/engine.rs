use crate::authoring::validate::validate_definition;
use crate::authoring::yaml::parse_definition_yaml;
use crate::config::EngineConfig;
use crate::context::ProcessEngineContext;
use crate::correlation::{CorrelationOutcome, EventCorrelator, MessageInstance};
use crate::definition::{validation_failure, FlowNodeKind, ProcessDefinition, TaskType};
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::flow_node::{FlowNodeStateMachine, IncidentTarget};
use crate::gateway::GatewayService;
use crate::lock::LockKey;
use crate::process::ProcessLifecycle;
use crate::query::QueryOptions;
use crate::store::WorkUnit;
use crate::token::TokenService;
use crate::types::*;
use std::collections::VecDeque;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ─── Work items ───────────────────────────────────────────────

/// One step the engine still owes. Components return the steps that follow
/// from theirs; the drive loop runs them in order.
#[derive(Debug)]
pub(crate) enum Work {
    Execute(InstanceId),
    Complete(InstanceId),
    /// A child of a multi-instance or loop wrapper finished, or (without a
    /// child) the wrapper re-evaluates its loop after a retry.
    ChildFinished {
        wrapper_id: InstanceId,
        child: Option<Box<FlowNodeInstance>>,
    },
    Abort {
        flow_node_id: InstanceId,
        state: FlowNodeState,
        notify_container: bool,
    },
    ScopeCheck {
        process_instance_id: InstanceId,
        scope_id: RefId,
    },
    TerminateScope {
        process_instance_id: InstanceId,
        scope_id: RefId,
    },
    /// Message thrown by a process.
    Deliver {
        process_instance_id: InstanceId,
        message: MessageInstance,
    },
}

impl Work {
    fn incident_target(&self) -> IncidentTarget {
        match self {
            Work::Execute(id) | Work::Complete(id) => IncidentTarget::FlowNode(*id),
            Work::Abort { flow_node_id, .. } => IncidentTarget::FlowNode(*flow_node_id),
            Work::ChildFinished { wrapper_id, .. } => IncidentTarget::FlowNode(*wrapper_id),
            Work::ScopeCheck {
                process_instance_id,
                ..
            }
            | Work::TerminateScope {
                process_instance_id,
                ..
            }
            | Work::Deliver {
                process_instance_id,
                ..
            } => IncidentTarget::Process(*process_instance_id),
        }
    }
}

// ─── Engine ───────────────────────────────────────────────────

/// Entry point of the execution core. Every public call runs the steps it
/// causes to completion (or to the next wait state) before returning.
pub struct ProcessEngine {
    ctx: ProcessEngineContext,
    machine: FlowNodeStateMachine,
    lifecycle: ProcessLifecycle,
    correlator: EventCorrelator,
    tokens: TokenService,
}

impl ProcessEngine {
    pub fn new(ctx: ProcessEngineContext) -> Self {
        Self {
            machine: FlowNodeStateMachine::new(ctx.clone()),
            lifecycle: ProcessLifecycle::new(ctx.clone()),
            correlator: EventCorrelator::new(ctx.clone()),
            tokens: TokenService::new(ctx.clone()),
            ctx,
        }
    }

    /// Engine over in-memory stores with the default configuration.
    pub fn in_memory() -> Self {
        Self::new(ProcessEngineContext::in_memory(EngineConfig::default()))
    }

    pub fn context(&self) -> &ProcessEngineContext {
        &self.ctx
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn gateways(&self) -> &GatewayService {
        self.machine.gateways()
    }

    // ── Definitions ──

    /// Validate, hash and store a definition, then enable it.
    pub async fn deploy(&self, mut definition: ProcessDefinition) -> Result<ProcessDefinitionId> {
        let errors = validate_definition(&definition);
        if !errors.is_empty() {
            return Err(validation_failure(&errors));
        }
        definition.id = self.ctx.store.next_id().await?;
        definition.version_hash = definition.compute_version_hash()?;
        let id = definition.id;
        let name = definition.name.clone();
        self.ctx.store.store_definition(definition).await?;
        self.enable_definition(id).await?;
        info!(definition_id = id, definition = %name, "process definition deployed");
        Ok(id)
    }

    pub async fn deploy_yaml(&self, yaml: &str) -> anyhow::Result<ProcessDefinitionId> {
        let definition = parse_definition_yaml(yaml)?.into_definition()?;
        Ok(self.deploy(definition).await?)
    }

    /// Accept new instances and subscribe the message and timer start events.
    pub async fn enable_definition(&self, id: ProcessDefinitionId) -> Result<()> {
        let deployment = self.ctx.deployment(id).await?;
        if deployment.enabled {
            return Ok(());
        }
        self.ctx.store.set_definition_enabled(id, true).await?;
        self.correlator
            .register_start_events(&deployment.definition)
            .await
    }

    /// Refuse new instances. Running instances are not affected.
    pub async fn disable_definition(&self, id: ProcessDefinitionId) -> Result<()> {
        let deployment = self.ctx.deployment(id).await?;
        if !deployment.enabled {
            return Ok(());
        }
        self.ctx.store.set_definition_enabled(id, false).await?;
        self.correlator.unregister_start_events(id).await?;
        info!(definition_id = id, "process definition disabled");
        Ok(())
    }

    // ── Process instances ──

    pub async fn start_process(
        &self,
        definition_id: ProcessDefinitionId,
        started_by: Option<&str>,
        data: DataMap,
    ) -> Result<InstanceId> {
        let (process, work) = self
            .lifecycle
            .start(definition_id, started_by.map(str::to_string), data)
            .await?;
        self.drive(work).await?;
        Ok(process.id)
    }

    /// Complete a waiting user or manual task. Keys the task holds locally
    /// are written to the task, every other key to the process data.
    pub async fn execute_flow_node(&self, id: InstanceId, data: DataMap) -> Result<()> {
        {
            let _guard = self.ctx.locks.lock(LockKey::FlowNode(id)).await;
            let node = self
                .ctx
                .store
                .load_flow_node(id)
                .await?
                .ok_or_else(|| EngineError::not_found("flow node", id))?;
            let definition = self.ctx.deployment(node.process_definition_id).await?.definition;
            let waits = matches!(
                definition.node(node.definition_id)?.kind,
                FlowNodeKind::Task {
                    task_type: TaskType::User | TaskType::Manual
                }
            );
            if !waits || node.is_wrapper() || node.state != FlowNodeState::Executing {
                return Err(EngineError::modification(format!(
                    "flow node {id} ('{}') is {} and not waiting for input",
                    node.name,
                    node.state.as_str()
                )));
            }
            if node.state_category != StateCategory::Normal {
                return Err(EngineError::modification(format!(
                    "flow node {id} is {}",
                    node.state_category.as_str()
                )));
            }

            let pid = node.process_instance_id;
            let mut unit = WorkUnit::new();
            let (local, global): (DataMap, DataMap) = data
                .into_iter()
                .partition(|(name, _)| node.local_data.contains_key(name));
            if !local.is_empty() {
                let names = local.keys().cloned().collect();
                let mut node = node;
                node.local_data.extend(local);
                node.last_update = now_ms();
                unit.update_flow_node(node);
                unit.event(pid, EngineEvent::DataUpdated { names });
            }
            unit.set_process_data(pid, global);
            if !unit.is_empty() {
                self.ctx.store.commit(unit).await?;
            }
            debug!(flow_node_id = id, "task input accepted");
        }
        self.drive(vec![Work::Complete(id)]).await
    }

    /// Merge `data` into the data of a running instance.
    pub async fn set_process_data(&self, pid: InstanceId, data: DataMap) -> Result<()> {
        let process = self
            .ctx
            .store
            .load_process(pid)
            .await?
            .ok_or_else(|| EngineError::not_found("process instance", pid))?;
        if process.state.is_terminal() {
            return Err(EngineError::modification(format!(
                "process instance {pid} is {}",
                process.state.as_str()
            )));
        }
        let mut unit = WorkUnit::new();
        unit.set_process_data(pid, data);
        self.ctx.store.commit(unit).await?;
        Ok(())
    }

    pub async fn cancel_process_instance(&self, pid: InstanceId) -> Result<()> {
        self.lifecycle.cancel(pid).await
    }

    /// Abort one live flow node with its subtree. A multi-instance child
    /// counts as terminated for its wrapper.
    pub async fn abort_flow_node(&self, id: InstanceId) -> Result<()> {
        let node = self
            .ctx
            .store
            .load_flow_node(id)
            .await?
            .ok_or_else(|| EngineError::not_found("flow node", id))?;
        if !node.is_live() {
            return Err(EngineError::modification(format!(
                "flow node {id} is already {}",
                node.state.as_str()
            )));
        }
        self.drive(vec![Work::Abort {
            flow_node_id: id,
            state: FlowNodeState::Aborted,
            notify_container: true,
        }])
        .await
    }

    /// Replay the step a FAILED flow node halted on.
    pub async fn retry_flow_node(&self, id: InstanceId) -> Result<()> {
        let work = self.machine.retry(id).await?;
        self.drive(work).await
    }

    pub async fn resolve_incident(&self, pid: InstanceId, incident_id: Uuid, resolution: &str) -> Result<()> {
        self.lifecycle
            .resolve_incident(pid, incident_id, resolution)
            .await
    }

    pub async fn delete_parent_process_instance_and_elements(&self, pid: InstanceId) -> Result<u64> {
        self.lifecycle
            .delete_parent_process_instance_and_elements(pid)
            .await
    }

    // ── Events ──

    pub async fn send_message(&self, message: MessageInstance) -> Result<CorrelationOutcome> {
        let (outcome, work) = self.correlator.send_message(&message).await?;
        self.drive(work).await?;
        Ok(outcome)
    }

    /// Callback of the timer scheduler.
    pub async fn fire_timer(&self, job_id: &str) -> Result<CorrelationOutcome> {
        let (outcome, work) = self.correlator.fire_timer(job_id).await?;
        self.drive(work).await?;
        Ok(outcome)
    }

    // ── Recovery ──

    pub async fn recover_process_instance(&self, pid: InstanceId) -> Result<()> {
        let work = self.lifecycle.recover(pid).await?;
        self.drive(work).await
    }

    /// Recover every live instance. Returns how many recovered cleanly.
    pub async fn recover_all(&self) -> Result<usize> {
        let processes = self
            .ctx
            .store
            .search_processes(&QueryOptions::default())
            .await?;
        let mut recovered = 0;
        for process in processes {
            match self.recover_process_instance(process.id).await {
                Ok(()) => recovered += 1,
                Err(err) => warn!(
                    process_instance_id = process.id,
                    error = %err,
                    "recovery failed"
                ),
            }
        }
        info!(recovered, "recovery finished");
        Ok(recovered)
    }

    // ── Queries ──

    pub async fn process_instance(&self, pid: InstanceId) -> Result<Option<ProcessInstance>> {
        self.ctx.store.load_process(pid).await
    }

    pub async fn flow_node(&self, id: InstanceId) -> Result<Option<FlowNodeInstance>> {
        self.ctx.store.load_flow_node(id).await
    }

    pub async fn live_flow_nodes(&self, pid: InstanceId) -> Result<Vec<FlowNodeInstance>> {
        self.ctx.store.load_flow_nodes_of_process(pid).await
    }

    pub async fn search_process_instances(&self, options: &QueryOptions) -> Result<Vec<ProcessInstance>> {
        self.ctx.store.search_processes(options).await
    }

    pub async fn search_flow_node_instances(&self, options: &QueryOptions) -> Result<Vec<FlowNodeInstance>> {
        self.ctx.store.search_flow_nodes(options).await
    }

    pub async fn search_waiting_events(&self, options: &QueryOptions) -> Result<Vec<WaitingEvent>> {
        self.ctx.store.search_waiting_events(options).await
    }

    pub async fn incidents(&self, pid: InstanceId) -> Result<Vec<Incident>> {
        self.ctx.store.load_incidents(pid).await
    }

    pub async fn read_events(&self, pid: InstanceId, from_seq: u64) -> Result<Vec<(u64, EngineEvent)>> {
        self.ctx.store.read_events(pid, from_seq).await
    }

    pub async fn archived_process_instance(&self, pid: InstanceId) -> Result<Option<ArchivedProcessInstance>> {
        self.ctx.archive.archived_process(pid).await
    }

    pub async fn archived_flow_node_instances(&self, pid: InstanceId) -> Result<Vec<ArchivedFlowNodeInstance>> {
        self.ctx.archive.archived_flow_nodes(pid).await
    }

    // ── Drive loop ──

    /// Run work until none is left. Errors that halt a step become an
    /// incident on its target and the remaining work goes on; any other
    /// error stops the drive.
    async fn drive(&self, initial: Vec<Work>) -> Result<()> {
        let mut queue: VecDeque<Work> = initial.into();
        let mut steps = 0;
        while let Some(work) = queue.pop_front() {
            steps += 1;
            if steps > self.ctx.config.max_steps_per_drive {
                warn!(pending = queue.len() + 1, "drive step limit reached");
                return Err(EngineError::modification(format!(
                    "more than {} steps in one drive",
                    self.ctx.config.max_steps_per_drive
                )));
            }
            let target = work.incident_target();
            match self.step(work).await {
                Ok(next) => queue.extend(next),
                Err(err) if err.raises_incident() => {
                    if let Err(raise_err) = self.machine.raise_incident(target, &err).await {
                        warn!(error = %raise_err, "incident could not be recorded");
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn step(&self, work: Work) -> Result<Vec<Work>> {
        match work {
            Work::Execute(id) => self.machine.execute(id).await,
            Work::Complete(id) => self.machine.complete(id).await,
            Work::ChildFinished { wrapper_id, child } => {
                self.machine
                    .multi_instance()
                    .on_child_finished(wrapper_id, child.map(|c| *c))
                    .await
            }
            Work::Abort {
                flow_node_id,
                state,
                notify_container,
            } => {
                self.machine
                    .abort_subtree(flow_node_id, state, true, notify_container)
                    .await
            }
            Work::ScopeCheck {
                process_instance_id,
                scope_id,
            } => self.lifecycle.check_scope(process_instance_id, scope_id).await,
            Work::TerminateScope {
                process_instance_id,
                scope_id,
            } => {
                self.lifecycle
                    .terminate_scope(process_instance_id, scope_id)
                    .await
            }
            Work::Deliver {
                process_instance_id,
                message,
            } => {
                let (outcome, work) = self.correlator.send_message(&message).await?;
                self.correlator
                    .record_sent(process_instance_id, &message, &outcome)
                    .await?;
                Ok(work)
            }
        }
    }
}
