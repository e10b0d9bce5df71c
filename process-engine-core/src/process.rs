use crate::context::ProcessEngineContext;
use crate::definition::{FlowNodeDefinition, FlowNodeKind, ProcessDefinition, TaskType};
use crate::engine::Work;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::flow_node::{build_instance, Effects, FlowNodeStateMachine, Placement};
use crate::lock::LockKey;
use crate::scheduler::TimerJob;
use crate::store::{Mutation, WorkUnit};
use crate::types::*;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Owns the process-instance state: start, completion, cancellation,
/// archiving and recovery.
pub struct ProcessLifecycle {
    ctx: ProcessEngineContext,
    machine: FlowNodeStateMachine,
}

impl ProcessLifecycle {
    pub fn new(ctx: ProcessEngineContext) -> Self {
        Self {
            machine: FlowNodeStateMachine::new(ctx.clone()),
            ctx,
        }
    }

    // ── Start ──

    /// New instance from the none start events of an enabled definition.
    pub(crate) async fn start(
        &self,
        definition_id: ProcessDefinitionId,
        started_by: Option<String>,
        data: DataMap,
    ) -> Result<(ProcessInstance, Vec<Work>)> {
        let deployment = self.ctx.deployment(definition_id).await?;
        if !deployment.enabled {
            return Err(EngineError::creation(
                "process instance",
                format!("definition {definition_id} is disabled"),
            ));
        }
        let starts = deployment.definition.none_start_events(None);
        if starts.is_empty() {
            return Err(EngineError::creation(
                "process instance",
                format!(
                    "'{}' has no start event without trigger",
                    deployment.definition.name
                ),
            ));
        }
        self.instantiate(&deployment.definition, &starts, started_by, data, WorkUnit::new())
            .await
    }

    /// New instance from a triggered start event. `unit` carries the
    /// subscription bookkeeping that must commit together with the start.
    pub(crate) async fn start_from_event(
        &self,
        definition: &ProcessDefinition,
        start: FlowNodeDefId,
        data: DataMap,
        unit: WorkUnit,
    ) -> Result<(ProcessInstance, Vec<Work>)> {
        self.instantiate(definition, &[start], None, data, unit).await
    }

    async fn instantiate(
        &self,
        definition: &ProcessDefinition,
        starts: &[FlowNodeDefId],
        started_by: Option<String>,
        data: DataMap,
        mut unit: WorkUnit,
    ) -> Result<(ProcessInstance, Vec<Work>)> {
        let pid = self.ctx.store.next_id().await?;
        let mut values = definition.initial_data.clone();
        values.extend(data);
        let process = ProcessInstance {
            id: pid,
            definition_id: definition.id,
            name: definition.name.clone(),
            state: ProcessState::Started,
            state_category: StateCategory::Normal,
            data: values,
            started_by: started_by.clone(),
            start_date: now_ms(),
            end_date: None,
        };

        unit.push(Mutation::InsertProcess(process.clone()));
        unit.event(pid, EngineEvent::ProcessStarted {
            process_definition_id: definition.id,
            started_by,
        });
        unit.create_tokens(pid, process.root_ref_id(), None, starts.len() as u32);
        let mut work = Vec::new();
        for start in starts {
            let id = self.ctx.store.next_id().await?;
            unit.insert_flow_node(build_instance(
                id,
                definition,
                definition.node(*start)?,
                Placement::in_scope(pid, process.root_ref_id()),
            ));
            work.push(Work::Execute(id));
        }
        self.ctx.store.commit(unit).await?;
        info!(
            process_instance_id = pid,
            definition = %definition.name,
            "process instance started"
        );
        Ok((process, work))
    }

    // ── Completion ──

    /// Re-evaluate a scope after one of its branches moved: fire inclusive
    /// gateways whose dead branches became known, then complete the scope
    /// once no token is left in it.
    pub(crate) async fn check_scope(&self, pid: InstanceId, scope: RefId) -> Result<Vec<Work>> {
        let fired = self
            .machine
            .gateways()
            .fire_ready_inclusive_gateways(pid, scope)
            .await?;
        if !fired.is_empty() {
            return Ok(fired.into_iter().map(Work::Complete).collect());
        }
        if self.ctx.store.count_tokens(pid, Some(scope)).await? > 0 {
            return Ok(Vec::new());
        }
        if scope == pid {
            self.complete_process(pid).await?;
            return Ok(Vec::new());
        }
        let Some(container) = self.ctx.store.load_flow_node(scope).await? else {
            return Ok(Vec::new());
        };
        // Wrappers complete through their loop, never through their scope.
        if container.node_type == FlowNodeType::SubProcess
            && !container.is_wrapper()
            && container.state == FlowNodeState::Executing
        {
            debug!(sub_process_id = scope, "sub-process scope drained");
            return Ok(vec![Work::Complete(scope)]);
        }
        Ok(Vec::new())
    }

    /// COMPLETED once no token and no live flow node is left, then archive.
    pub(crate) async fn complete_process(&self, pid: InstanceId) -> Result<()> {
        {
            let _guard = self.ctx.locks.lock(LockKey::Process(pid)).await;
            let Some(process) = self.ctx.store.load_process(pid).await? else {
                return Ok(());
            };
            if process.state != ProcessState::Started
                || process.state_category != StateCategory::Normal
            {
                return Ok(());
            }
            if self.ctx.store.count_tokens(pid, None).await? > 0 {
                return Ok(());
            }
            let nodes = self.ctx.store.load_flow_nodes_of_process(pid).await?;
            if let Some(live) = nodes.iter().find(|n| n.is_live()) {
                warn!(
                    process_instance_id = pid,
                    flow_node_id = live.id,
                    "no token left but flow node still live"
                );
                return Ok(());
            }
            for leftover in nodes {
                self.machine.archive_leftover(leftover).await?;
            }

            let mut unit = WorkUnit::new();
            unit.push(Mutation::SetProcessState {
                id: pid,
                state: ProcessState::Completed,
                category: StateCategory::Normal,
                end_date: Some(now_ms()),
            });
            unit.event(pid, EngineEvent::ProcessCompleted);
            self.ctx.store.commit(unit).await?;
            info!(process_instance_id = pid, "process instance completed");
        }
        self.archive(pid).await
    }

    /// Snapshot the terminal process into the archive and drop it from the
    /// live tables.
    pub(crate) async fn archive(&self, pid: InstanceId) -> Result<()> {
        let _guard = self.ctx.locks.lock(LockKey::Process(pid)).await;
        let Some(process) = self.ctx.store.load_process(pid).await? else {
            return Ok(());
        };
        if !process.state.is_terminal() {
            return Err(EngineError::modification(format!(
                "process instance {pid} is still running"
            )));
        }
        let mut fx = Effects::default();
        for waiting in self.ctx.store.load_waiting_events_of_process(pid).await? {
            fx.cancel.extend(waiting.job_id);
        }
        self.ctx
            .archive
            .archive_process(ArchivedProcessInstance {
                source: process,
                archived_at: now_ms(),
            })
            .await?;
        fx.unit.event(pid, EngineEvent::ProcessArchived);
        fx.unit.push(Mutation::DeleteProcess(pid));
        fx.apply(&self.ctx).await?;
        debug!(process_instance_id = pid, "process instance archived");
        Ok(())
    }

    // ── Termination ──

    /// Abort every element of a scope and drop its tokens; the scope then
    /// completes.
    pub(crate) async fn terminate_scope(&self, pid: InstanceId, scope: RefId) -> Result<Vec<Work>> {
        loop {
            let live: Vec<InstanceId> = self
                .ctx
                .store
                .load_flow_nodes_in_container(scope)
                .await?
                .into_iter()
                .filter(|n| n.is_live())
                .map(|n| n.id)
                .collect();
            if live.is_empty() {
                break;
            }
            for id in live {
                self.machine
                    .abort_subtree(id, FlowNodeState::Aborted, false, false)
                    .await?;
            }
        }
        let mut unit = WorkUnit::new();
        unit.delete_scope_tokens(pid, scope);
        self.ctx.store.commit(unit).await?;
        info!(process_instance_id = pid, scope, "scope terminated");
        Ok(vec![Work::ScopeCheck {
            process_instance_id: pid,
            scope_id: scope,
        }])
    }

    /// Cancel a running instance: every live element goes to CANCELLED,
    /// every token is dropped and the instance is archived.
    pub(crate) async fn cancel(&self, pid: InstanceId) -> Result<()> {
        {
            let _guard = self.ctx.locks.lock(LockKey::Process(pid)).await;
            let process = self
                .ctx
                .store
                .load_process(pid)
                .await?
                .ok_or_else(|| EngineError::not_found("process instance", pid))?;
            if process.state.is_terminal() {
                return Err(EngineError::modification(format!(
                    "process instance {pid} is already {}",
                    process.state.as_str()
                )));
            }
            if process.state_category != StateCategory::Cancelling {
                let mut unit = WorkUnit::new();
                unit.push(Mutation::SetProcessState {
                    id: pid,
                    state: ProcessState::Started,
                    category: StateCategory::Cancelling,
                    end_date: None,
                });
                self.ctx.store.commit(unit).await?;
            }
        }
        self.finish_cancel(pid).await
    }

    async fn finish_cancel(&self, pid: InstanceId) -> Result<()> {
        // Steps in flight may still commit successors; sweep until none is left.
        loop {
            let roots: Vec<InstanceId> = self
                .ctx
                .store
                .load_flow_nodes_in_container(pid)
                .await?
                .into_iter()
                .filter(|n| n.is_live())
                .map(|n| n.id)
                .collect();
            if roots.is_empty() {
                break;
            }
            for id in roots {
                self.machine
                    .abort_subtree(id, FlowNodeState::Cancelled, false, false)
                    .await?;
            }
        }
        {
            let _guard = self.ctx.locks.lock(LockKey::Process(pid)).await;
            let mut unit = WorkUnit::new();
            unit.push(Mutation::DeleteAllTokens(Some(pid)));
            unit.push(Mutation::SetProcessState {
                id: pid,
                state: ProcessState::Cancelled,
                category: StateCategory::Cancelling,
                end_date: Some(now_ms()),
            });
            unit.event(pid, EngineEvent::ProcessCancelled);
            self.ctx.store.commit(unit).await?;
        }
        info!(process_instance_id = pid, "process instance cancelled");
        self.archive(pid).await
    }

    /// Remove an instance for good: its live rows (with tokens, waiting
    /// events and timers) and every archived snapshot. Returns how many
    /// records were removed.
    pub(crate) async fn delete_parent_process_instance_and_elements(&self, pid: InstanceId) -> Result<u64> {
        let mut deleted = 0;
        {
            let _guard = self.ctx.locks.lock(LockKey::Process(pid)).await;
            if self.ctx.store.load_process(pid).await?.is_some() {
                let nodes = self.ctx.store.load_flow_nodes_of_process(pid).await?;
                let mut fx = Effects::default();
                for waiting in self.ctx.store.load_waiting_events_of_process(pid).await? {
                    fx.cancel.extend(waiting.job_id);
                }
                fx.unit.push(Mutation::DeleteProcess(pid));
                fx.apply(&self.ctx).await?;
                deleted += 1 + nodes.len() as u64;
            }
        }
        deleted += self.ctx.archive.delete_archived_process_instance(pid).await?;
        if deleted == 0 {
            return Err(EngineError::not_found("process instance", pid));
        }
        info!(process_instance_id = pid, deleted, "process instance deleted");
        Ok(deleted)
    }

    // ── Incidents ──

    /// Close an incident without replaying anything. The instance returns
    /// to the normal category once no incident is open.
    pub(crate) async fn resolve_incident(&self, pid: InstanceId, incident_id: Uuid, resolution: &str) -> Result<()> {
        let _guard = self.ctx.locks.lock(LockKey::Process(pid)).await;
        let incidents = self.ctx.store.load_incidents(pid).await?;
        let incident = incidents
            .iter()
            .find(|i| i.incident_id == incident_id)
            .ok_or_else(|| EngineError::not_found("incident", incident_id))?;
        if !incident.is_open() {
            return Err(EngineError::modification(format!(
                "incident {incident_id} is already resolved"
            )));
        }
        let mut unit = WorkUnit::new();
        unit.push(Mutation::ResolveIncident {
            incident_id,
            resolution: resolution.to_string(),
            at: now_ms(),
        });
        unit.event(pid, EngineEvent::IncidentResolved { incident_id });
        let still_open = incidents
            .iter()
            .any(|i| i.is_open() && i.incident_id != incident_id);
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
        self.ctx.store.commit(unit).await?;
        info!(process_instance_id = pid, %incident_id, "incident resolved");
        Ok(())
    }

    // ── Recovery ──

    /// Rebuild the work an interrupted instance still owes from its live
    /// state: leftovers of finished steps are archived, READY nodes are
    /// executed again, fired gateways completed, timers re-scheduled and
    /// every scope re-checked.
    pub(crate) async fn recover(&self, pid: InstanceId) -> Result<Vec<Work>> {
        let process = self
            .ctx
            .store
            .load_process(pid)
            .await?
            .ok_or_else(|| EngineError::not_found("process instance", pid))?;
        if process.state.is_terminal() {
            self.archive(pid).await?;
            return Ok(Vec::new());
        }
        if process.state_category == StateCategory::Cancelling {
            self.finish_cancel(pid).await?;
            return Ok(Vec::new());
        }

        let definition = self.ctx.deployment(process.definition_id).await?.definition;
        let waiting_events = self.ctx.store.load_waiting_events_of_process(pid).await?;
        let subscribed: BTreeSet<InstanceId> = waiting_events
            .iter()
            .filter_map(|w| w.flow_node_instance_id)
            .collect();
        // Interrupted aborts go first so nothing inside them resumes.
        let mut work = Vec::new();
        let mut resumed = Vec::new();
        let mut wrappers = Vec::new();
        let mut scopes = BTreeSet::from([pid]);
        for node in self.ctx.store.load_flow_nodes_of_process(pid).await? {
            if !node.is_live() {
                self.machine.archive_leftover(node).await?;
                continue;
            }
            if node.node_type == FlowNodeType::SubProcess && !node.is_wrapper() {
                scopes.insert(node.id);
            }
            if node.state_category == StateCategory::Aborting {
                work.push(Work::Abort {
                    flow_node_id: node.id,
                    state: FlowNodeState::Aborted,
                    notify_container: false,
                });
                continue;
            }
            if node.state_category != StateCategory::Normal {
                continue;
            }
            match node.state {
                FlowNodeState::Ready => resumed.push(Work::Execute(node.id)),
                FlowNodeState::Executing if node.is_wrapper() => wrappers.push(node.id),
                FlowNodeState::Executing => {
                    let def = definition.node(node.definition_id)?;
                    if !waits_while_executing(def, &node, subscribed.contains(&node.id)) {
                        resumed.push(Work::Complete(node.id));
                    }
                }
                _ => {}
            }
        }
        work.extend(resumed);
        for wrapper_id in wrappers {
            work.extend(self.machine.multi_instance().reconcile(wrapper_id).await?);
        }

        for waiting in waiting_events {
            if let (Some(job_id), Some(due_at)) = (waiting.job_id, waiting.due_at) {
                self.ctx
                    .scheduler
                    .schedule(TimerJob {
                        job_id,
                        process_definition_id: waiting.process_definition_id,
                        flow_node_definition_id: waiting.flow_node_definition_id,
                        discriminator: waiting.flow_node_instance_id,
                        due_at,
                    })
                    .await?;
            }
        }
        work.extend(scopes.into_iter().map(|scope| Work::ScopeCheck {
            process_instance_id: pid,
            scope_id: scope,
        }));
        info!(process_instance_id = pid, steps = work.len(), "process instance recovered");
        Ok(work)
    }
}

/// Whether an EXECUTING node waits for something outside the engine (input,
/// a trigger, inner flow, further arrivals). Any other EXECUTING node was
/// interrupted on its way to completion. A catch event whose subscription is
/// gone was triggered before the interruption.
fn waits_while_executing(def: &FlowNodeDefinition, node: &FlowNodeInstance, subscribed: bool) -> bool {
    if node.is_wrapper() {
        return true;
    }
    match &def.kind {
        FlowNodeKind::Task {
            task_type: TaskType::User | TaskType::Manual,
        }
        | FlowNodeKind::SubProcess => true,
        FlowNodeKind::IntermediateCatchEvent { .. } => subscribed,
        FlowNodeKind::Gateway { .. } => node.gateway().is_some_and(|g| !g.fired),
        FlowNodeKind::BoundaryEvent { .. } => node.token_ref_id.is_none(),
        _ => false,
    }
}
