use crate::definition::ProcessDefinition;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::query::{self, QueryOptions};
use crate::store::*;
use crate::types::*;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-memory [`ProcessStore`]. A commit holds the write lock for the whole
/// unit, which makes every unit serializable.
pub struct MemoryStore {
    next_id: AtomicU64,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    deployments: BTreeMap<ProcessDefinitionId, Deployment>,
    processes: BTreeMap<InstanceId, ProcessInstance>,
    flow_nodes: BTreeMap<InstanceId, FlowNodeInstance>,
    tokens: BTreeMap<InstanceId, Token>,
    tokens_by_scope: BTreeMap<(InstanceId, RefId), BTreeSet<InstanceId>>,
    waiting_events: BTreeMap<InstanceId, WaitingEvent>,
    events: BTreeMap<InstanceId, Vec<EngineEvent>>,
    incidents: BTreeMap<Uuid, Incident>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: RwLock::new(Inner::default()),
        }
    }

    fn allocate(&self) -> InstanceId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn scope_count(&self, pid: InstanceId, ref_id: RefId) -> u64 {
        self.tokens_by_scope
            .get(&(pid, ref_id))
            .map(|s| s.len() as u64)
            .unwrap_or(0)
    }

    fn insert_token(&mut self, token: Token) {
        self.tokens_by_scope
            .entry((token.process_instance_id, token.ref_id))
            .or_default()
            .insert(token.id);
        self.tokens.insert(token.id, token);
    }

    fn remove_token(&mut self, id: InstanceId) {
        if let Some(token) = self.tokens.remove(&id) {
            let key = (token.process_instance_id, token.ref_id);
            if let Some(set) = self.tokens_by_scope.get_mut(&key) {
                set.remove(&id);
                if set.is_empty() {
                    self.tokens_by_scope.remove(&key);
                }
            }
        }
    }

    /// Drop every token of a scope and log how many went.
    fn clear_scope(&mut self, pid: InstanceId, ref_id: RefId) {
        let Some(ids) = self.tokens_by_scope.remove(&(pid, ref_id)) else {
            return;
        };
        for id in &ids {
            self.tokens.remove(id);
        }
        if !ids.is_empty() {
            self.events
                .entry(pid)
                .or_default()
                .push(EngineEvent::ScopeTokensCleared {
                    ref_id,
                    count: ids.len() as u32,
                });
        }
    }

    fn clear_process_tokens(&mut self, pid: InstanceId) {
        let scopes: Vec<_> = self
            .tokens_by_scope
            .range((pid, RefId::MIN)..=(pid, RefId::MAX))
            .map(|(k, _)| *k)
            .collect();
        for (pid, ref_id) in scopes {
            self.clear_scope(pid, ref_id);
        }
    }

    /// Dry-run of a unit against current state. Rejects the unit before
    /// anything is applied.
    fn check(&self, unit: &WorkUnit) -> Result<()> {
        let mut counts: HashMap<(InstanceId, RefId), i64> = HashMap::new();
        let mut cleared_processes: HashSet<InstanceId> = HashSet::new();
        let mut all_cleared = false;
        let mut deleted_tokens: HashSet<InstanceId> = HashSet::new();
        let mut nodes: HashMap<InstanceId, bool> = HashMap::new();
        let mut processes: HashMap<InstanceId, bool> = HashMap::new();
        let mut waiting: HashSet<InstanceId> = HashSet::new();
        let mut consumed: HashSet<InstanceId> = HashSet::new();

        let seed = |counts: &mut HashMap<(InstanceId, RefId), i64>,
                    cleared: &HashSet<InstanceId>,
                    all_cleared: bool,
                    key: (InstanceId, RefId)| {
            *counts.entry(key).or_insert_with(|| {
                if all_cleared || cleared.contains(&key.0) {
                    0
                } else {
                    self.scope_count(key.0, key.1) as i64
                }
            })
        };

        for m in &unit.mutations {
            match m {
                Mutation::InsertProcess(p) => {
                    let exists = *processes
                        .entry(p.id)
                        .or_insert_with(|| self.processes.contains_key(&p.id));
                    if exists {
                        return Err(EngineError::creation("process instance", format!("id {} already used", p.id)));
                    }
                    processes.insert(p.id, true);
                }
                Mutation::SetProcessState { id, .. } | Mutation::SetProcessData { id, .. } => {
                    let exists = *processes
                        .entry(*id)
                        .or_insert_with(|| self.processes.contains_key(id));
                    if !exists {
                        return Err(EngineError::not_found("process instance", id));
                    }
                }
                Mutation::DeleteProcess(id) => {
                    processes.insert(*id, false);
                    cleared_processes.insert(*id);
                    counts.retain(|k, _| k.0 != *id);
                }
                Mutation::InsertFlowNode(n) => {
                    let exists = *nodes
                        .entry(n.id)
                        .or_insert_with(|| self.flow_nodes.contains_key(&n.id));
                    if exists {
                        return Err(EngineError::creation("flow node", format!("id {} already used", n.id)));
                    }
                    nodes.insert(n.id, true);
                }
                Mutation::UpdateFlowNode(n) => {
                    let exists = *nodes
                        .entry(n.id)
                        .or_insert_with(|| self.flow_nodes.contains_key(&n.id));
                    if !exists {
                        return Err(EngineError::not_found("flow node", n.id));
                    }
                }
                Mutation::DeleteFlowNode(id) => {
                    nodes.insert(*id, false);
                }
                Mutation::CreateTokens {
                    process_instance_id,
                    ref_id,
                    count,
                    ..
                } => {
                    let key = (*process_instance_id, *ref_id);
                    let current = seed(&mut counts, &cleared_processes, all_cleared, key);
                    counts.insert(key, current + *count as i64);
                }
                Mutation::DeleteTokens {
                    process_instance_id,
                    ref_id,
                    count,
                } => {
                    let key = (*process_instance_id, *ref_id);
                    let current = seed(&mut counts, &cleared_processes, all_cleared, key);
                    if current < *count as i64 {
                        return Err(EngineError::modification(format!(
                            "cannot delete {count} token(s) of scope {ref_id}: {current} live"
                        )));
                    }
                    counts.insert(key, current - *count as i64);
                }
                Mutation::DeleteToken(id) => {
                    let token = self
                        .tokens
                        .get(id)
                        .filter(|t| !all_cleared && !cleared_processes.contains(&t.process_instance_id))
                        .filter(|_| !deleted_tokens.contains(id))
                        .ok_or_else(|| EngineError::not_found("token", id))?;
                    let key = (token.process_instance_id, token.ref_id);
                    let current = seed(&mut counts, &cleared_processes, all_cleared, key);
                    if current < 1 {
                        return Err(EngineError::not_found("token", id));
                    }
                    counts.insert(key, current - 1);
                    deleted_tokens.insert(*id);
                }
                Mutation::DeleteScopeTokens {
                    process_instance_id,
                    ref_id,
                } => {
                    counts.insert((*process_instance_id, *ref_id), 0);
                }
                Mutation::DeleteAllTokens(Some(pid)) => {
                    cleared_processes.insert(*pid);
                    counts.retain(|k, _| k.0 != *pid);
                }
                Mutation::DeleteAllTokens(None) => {
                    all_cleared = true;
                    counts.clear();
                }
                Mutation::InsertWaitingEvent(w) => {
                    if self.waiting_events.contains_key(&w.id) || !waiting.insert(w.id) {
                        return Err(EngineError::creation("waiting event", format!("id {} already used", w.id)));
                    }
                }
                Mutation::ConsumeWaitingEvent(id) => {
                    let present = (self.waiting_events.contains_key(id) || waiting.contains(id))
                        && consumed.insert(*id);
                    if !present {
                        return Err(EngineError::not_found("waiting event", id));
                    }
                }
                Mutation::ResolveIncident { incident_id, .. } => {
                    let known = self.incidents.contains_key(incident_id)
                        || unit.mutations.iter().any(
                            |m| matches!(m, Mutation::SaveIncident(i) if i.incident_id == *incident_id),
                        );
                    if !known {
                        return Err(EngineError::not_found("incident", incident_id));
                    }
                }
                Mutation::DeleteWaitingEvent(_)
                | Mutation::DeleteWaitingEventsOfFlowNode(_)
                | Mutation::DeleteStartWaitingEvents(_)
                | Mutation::SaveIncident(_)
                | Mutation::AppendEvent { .. } => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn next_id(&self) -> Result<InstanceId> {
        Ok(self.allocate())
    }

    async fn commit(&self, unit: WorkUnit) -> Result<CommitReceipt> {
        let mut inner = self.inner.write().await;
        inner.check(&unit)?;

        let mut receipt = CommitReceipt::default();
        let mut touched: BTreeSet<(InstanceId, RefId)> = BTreeSet::new();

        for m in unit.mutations {
            match m {
                Mutation::InsertProcess(p) => {
                    inner.processes.insert(p.id, p);
                }
                Mutation::SetProcessState {
                    id,
                    state,
                    category,
                    end_date,
                } => {
                    if let Some(p) = inner.processes.get_mut(&id) {
                        p.state = state;
                        p.state_category = category;
                        if end_date.is_some() {
                            p.end_date = end_date;
                        }
                    }
                }
                Mutation::SetProcessData { id, values } => {
                    if let Some(p) = inner.processes.get_mut(&id) {
                        p.data.extend(values);
                    }
                }
                Mutation::DeleteProcess(id) => {
                    inner.processes.remove(&id);
                    inner.flow_nodes.retain(|_, n| n.process_instance_id != id);
                    inner.clear_process_tokens(id);
                    inner
                        .waiting_events
                        .retain(|_, w| w.process_instance_id != Some(id));
                }
                Mutation::InsertFlowNode(n) | Mutation::UpdateFlowNode(n) => {
                    inner.flow_nodes.insert(n.id, n);
                }
                Mutation::DeleteFlowNode(id) => {
                    inner.flow_nodes.remove(&id);
                }
                Mutation::CreateTokens {
                    process_instance_id,
                    ref_id,
                    parent_ref_id,
                    count,
                } => {
                    for _ in 0..count {
                        let token = Token {
                            id: self.allocate(),
                            process_instance_id,
                            ref_id,
                            parent_ref_id,
                        };
                        receipt.created_tokens.push(token.clone());
                        inner.insert_token(token);
                    }
                    touched.insert((process_instance_id, ref_id));
                }
                Mutation::DeleteTokens {
                    process_instance_id,
                    ref_id,
                    count,
                } => {
                    let ids: Vec<InstanceId> = inner
                        .tokens_by_scope
                        .get(&(process_instance_id, ref_id))
                        .map(|s| s.iter().rev().take(count as usize).copied().collect())
                        .unwrap_or_default();
                    for id in ids {
                        inner.remove_token(id);
                    }
                    touched.insert((process_instance_id, ref_id));
                }
                Mutation::DeleteToken(id) => {
                    if let Some(t) = inner.tokens.get(&id) {
                        touched.insert((t.process_instance_id, t.ref_id));
                    }
                    inner.remove_token(id);
                }
                Mutation::DeleteScopeTokens {
                    process_instance_id,
                    ref_id,
                } => {
                    inner.clear_scope(process_instance_id, ref_id);
                    touched.insert((process_instance_id, ref_id));
                }
                Mutation::DeleteAllTokens(Some(pid)) => {
                    inner.clear_process_tokens(pid);
                }
                Mutation::DeleteAllTokens(None) => {
                    let scopes: Vec<_> = inner.tokens_by_scope.keys().copied().collect();
                    for (pid, ref_id) in scopes {
                        inner.clear_scope(pid, ref_id);
                    }
                }
                Mutation::InsertWaitingEvent(w) => {
                    inner.waiting_events.insert(w.id, w);
                }
                Mutation::DeleteWaitingEvent(id) | Mutation::ConsumeWaitingEvent(id) => {
                    inner.waiting_events.remove(&id);
                }
                Mutation::DeleteWaitingEventsOfFlowNode(node_id) => {
                    inner
                        .waiting_events
                        .retain(|_, w| w.flow_node_instance_id != Some(node_id));
                }
                Mutation::DeleteStartWaitingEvents(def_id) => {
                    inner.waiting_events.retain(|_, w| {
                        !(w.kind == WaitingEventKind::Start && w.process_definition_id == def_id)
                    });
                }
                Mutation::SaveIncident(incident) => {
                    inner.incidents.insert(incident.incident_id, incident);
                }
                Mutation::ResolveIncident {
                    incident_id,
                    resolution,
                    at,
                } => {
                    if let Some(i) = inner.incidents.get_mut(&incident_id) {
                        i.resolved_at = Some(at);
                        i.resolution = Some(resolution);
                    }
                }
                Mutation::AppendEvent {
                    process_instance_id,
                    event,
                } => {
                    inner
                        .events
                        .entry(process_instance_id)
                        .or_default()
                        .push(event);
                }
            }
        }

        for (pid, ref_id) in touched {
            receipt
                .remaining_tokens
                .insert(ref_id, inner.scope_count(pid, ref_id));
        }
        Ok(receipt)
    }

    // ── Definitions ──

    async fn store_definition(&self, definition: ProcessDefinition) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.deployments.contains_key(&definition.id) {
            return Err(EngineError::creation(
                "process definition",
                format!("id {} already deployed", definition.id),
            ));
        }
        inner.deployments.insert(
            definition.id,
            Deployment {
                definition: Arc::new(definition),
                enabled: false,
            },
        );
        Ok(())
    }

    async fn load_deployment(&self, id: ProcessDefinitionId) -> Result<Option<Deployment>> {
        Ok(self.inner.read().await.deployments.get(&id).cloned())
    }

    async fn set_definition_enabled(&self, id: ProcessDefinitionId, enabled: bool) -> Result<()> {
        let mut inner = self.inner.write().await;
        let deployment = inner
            .deployments
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("process definition", id))?;
        deployment.enabled = enabled;
        Ok(())
    }

    async fn list_deployments(&self) -> Result<Vec<Deployment>> {
        Ok(self.inner.read().await.deployments.values().cloned().collect())
    }

    // ── Process instances ──

    async fn load_process(&self, id: InstanceId) -> Result<Option<ProcessInstance>> {
        Ok(self.inner.read().await.processes.get(&id).cloned())
    }

    async fn search_processes(&self, options: &QueryOptions) -> Result<Vec<ProcessInstance>> {
        let inner = self.inner.read().await;
        query::apply(options, inner.processes.values())
    }

    // ── Flow nodes ──

    async fn load_flow_node(&self, id: InstanceId) -> Result<Option<FlowNodeInstance>> {
        Ok(self.inner.read().await.flow_nodes.get(&id).cloned())
    }

    async fn load_flow_nodes_in_container(&self, container_id: InstanceId) -> Result<Vec<FlowNodeInstance>> {
        let inner = self.inner.read().await;
        Ok(inner
            .flow_nodes
            .values()
            .filter(|n| n.container_id == container_id)
            .cloned()
            .collect())
    }

    async fn load_flow_nodes_of_process(&self, process_instance_id: InstanceId) -> Result<Vec<FlowNodeInstance>> {
        let inner = self.inner.read().await;
        Ok(inner
            .flow_nodes
            .values()
            .filter(|n| n.process_instance_id == process_instance_id)
            .cloned()
            .collect())
    }

    async fn load_attached_flow_nodes(&self, activity_id: InstanceId) -> Result<Vec<FlowNodeInstance>> {
        let inner = self.inner.read().await;
        Ok(inner
            .flow_nodes
            .values()
            .filter(|n| n.attached_to == Some(activity_id))
            .cloned()
            .collect())
    }

    async fn search_flow_nodes(&self, options: &QueryOptions) -> Result<Vec<FlowNodeInstance>> {
        let inner = self.inner.read().await;
        query::apply(options, inner.flow_nodes.values())
    }

    // ── Tokens ──

    async fn count_tokens(&self, process_instance_id: InstanceId, ref_id: Option<RefId>) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(match ref_id {
            Some(r) => inner.scope_count(process_instance_id, r),
            None => inner
                .tokens_by_scope
                .range((process_instance_id, RefId::MIN)..=(process_instance_id, RefId::MAX))
                .map(|(_, s)| s.len() as u64)
                .sum(),
        })
    }

    async fn search_tokens(&self, options: &QueryOptions) -> Result<Vec<Token>> {
        let inner = self.inner.read().await;
        query::apply(options, inner.tokens.values())
    }

    // ── Waiting events ──

    async fn find_waiting_message_events(&self, message_name: &str) -> Result<Vec<WaitingEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .waiting_events
            .values()
            .filter(|w| {
                w.active
                    && w.event_type == WaitingEventType::Message
                    && w.message_name.as_deref() == Some(message_name)
            })
            .cloned()
            .collect())
    }

    async fn find_waiting_event_by_job(&self, job_id: &str) -> Result<Option<WaitingEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .waiting_events
            .values()
            .find(|w| w.job_id.as_deref() == Some(job_id))
            .cloned())
    }

    async fn load_waiting_events_of_flow_node(&self, flow_node_id: InstanceId) -> Result<Vec<WaitingEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .waiting_events
            .values()
            .filter(|w| w.flow_node_instance_id == Some(flow_node_id))
            .cloned()
            .collect())
    }

    async fn load_waiting_events_of_process(&self, process_instance_id: InstanceId) -> Result<Vec<WaitingEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .waiting_events
            .values()
            .filter(|w| w.process_instance_id == Some(process_instance_id))
            .cloned()
            .collect())
    }

    async fn load_start_waiting_events(&self, definition_id: ProcessDefinitionId) -> Result<Vec<WaitingEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .waiting_events
            .values()
            .filter(|w| w.kind == WaitingEventKind::Start && w.process_definition_id == definition_id)
            .cloned()
            .collect())
    }

    async fn search_waiting_events(&self, options: &QueryOptions) -> Result<Vec<WaitingEvent>> {
        let inner = self.inner.read().await;
        query::apply(options, inner.waiting_events.values())
    }

    // ── Event log ──

    async fn read_events(
        &self,
        process_instance_id: InstanceId,
        from_seq: u64,
    ) -> Result<Vec<(u64, EngineEvent)>> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .get(&process_instance_id)
            .map(|events| {
                events
                    .iter()
                    .enumerate()
                    .map(|(i, e)| (i as u64 + 1, e.clone()))
                    .filter(|(seq, _)| *seq >= from_seq)
                    .collect()
            })
            .unwrap_or_default())
    }

    // ── Incidents ──

    async fn load_incident(&self, id: Uuid) -> Result<Option<Incident>> {
        Ok(self.inner.read().await.incidents.get(&id).cloned())
    }

    async fn load_incidents(&self, process_instance_id: InstanceId) -> Result<Vec<Incident>> {
        let inner = self.inner.read().await;
        Ok(inner
            .incidents
            .values()
            .filter(|i| i.process_instance_id == process_instance_id)
            .cloned()
            .collect())
    }
}

// ─── Archive ──────────────────────────────────────────────────

/// In-memory [`ArchiveStore`].
#[derive(Default)]
pub struct MemoryArchive {
    inner: RwLock<ArchiveInner>,
}

#[derive(Default)]
struct ArchiveInner {
    flow_nodes: BTreeMap<InstanceId, Vec<ArchivedFlowNodeInstance>>,
    processes: BTreeMap<InstanceId, ArchivedProcessInstance>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchive {
    async fn archive_flow_node(&self, snapshot: ArchivedFlowNodeInstance) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entries = inner
            .flow_nodes
            .entry(snapshot.source.process_instance_id)
            .or_default();
        let duplicate = entries
            .iter()
            .any(|e| e.source.id == snapshot.source.id && e.source.state == snapshot.source.state);
        if !duplicate {
            entries.push(snapshot);
        }
        Ok(())
    }

    async fn archive_process(&self, snapshot: ArchivedProcessInstance) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.processes.get(&snapshot.source.id) {
            Some(existing) if existing.source.state == snapshot.source.state => Ok(()),
            Some(existing) => Err(EngineError::modification(format!(
                "process instance {} already archived as {}",
                snapshot.source.id,
                existing.source.state.as_str()
            ))),
            None => {
                inner.processes.insert(snapshot.source.id, snapshot);
                Ok(())
            }
        }
    }

    async fn archived_flow_nodes(&self, process_instance_id: InstanceId) -> Result<Vec<ArchivedFlowNodeInstance>> {
        let inner = self.inner.read().await;
        Ok(inner
            .flow_nodes
            .get(&process_instance_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn archived_process(&self, process_instance_id: InstanceId) -> Result<Option<ArchivedProcessInstance>> {
        Ok(self.inner.read().await.processes.get(&process_instance_id).cloned())
    }

    async fn delete_archived_process_instance(&self, process_instance_id: InstanceId) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let nodes = inner
            .flow_nodes
            .remove(&process_instance_id)
            .map(|v| v.len() as u64)
            .unwrap_or(0);
        let process = inner.processes.remove(&process_instance_id).map_or(0, |_| 1);
        Ok(nodes + process)
    }
}
