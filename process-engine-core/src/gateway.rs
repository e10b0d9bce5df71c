use crate::context::ProcessEngineContext;
use crate::definition::{FlowNodeDefinition, GatewayType, ProcessDefinition};
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::flow_node::{build_instance, Effects, Placement};
use crate::lock::LockKey;
use crate::store::WorkUnit;
use crate::types::*;
use std::collections::BTreeMap;
use tracing::{debug, info};

// ─── Merge primitives ─────────────────────────────────────────

/// Record a hit on `transition`. A transition already recorded on this
/// instance is rejected.
pub fn hit_transition(gateway: &mut FlowNodeInstance, transition: TransitionId) -> Result<()> {
    let id = gateway.id;
    let state = gateway
        .gateway_mut()
        .ok_or_else(|| EngineError::modification(format!("flow node {id} is not a gateway")))?;
    if state.fired {
        return Err(EngineError::modification(format!(
            "gateway {id} already fired"
        )));
    }
    if state.hit_by.contains(&transition) {
        return Err(EngineError::modification(format!(
            "transition {transition} already hit gateway {id}"
        )));
    }
    state.hit_by.push(transition);
    Ok(())
}

/// Live view of the scope a gateway merges in.
pub struct ScopeSnapshot<'a> {
    /// Live flow nodes of the scope, the gateway itself included or not.
    pub live: &'a [FlowNodeInstance],
    /// Live tokens of the scope.
    pub tokens: u64,
}

/// Whether the gateway may fire with the hits it holds.
///
/// Exclusive joins fire on the first hit, parallel joins once every incoming
/// transition was hit. Inclusive joins fire once every incoming transition
/// is either hit or dead: no live flow node of the scope can still reach its
/// source without passing through the gateway.
pub fn check_merging_condition(
    definition: &ProcessDefinition,
    gateway_def: &FlowNodeDefinition,
    gateway: &FlowNodeInstance,
    scope: &ScopeSnapshot<'_>,
) -> Result<bool> {
    let state = gateway.gateway().ok_or_else(|| {
        EngineError::modification(format!("flow node {} is not a gateway", gateway.id))
    })?;
    if state.fired || state.hit_by.is_empty() {
        return Ok(false);
    }
    match state.gateway_type {
        GatewayType::Exclusive => Ok(true),
        GatewayType::Parallel => Ok(gateway_def
            .incoming
            .iter()
            .all(|t| state.hit_by.contains(t))),
        GatewayType::Inclusive => {
            // Every token of the scope already waits here.
            if scope.tokens <= gateway.token_count as u64 {
                return Ok(true);
            }
            for t in &gateway_def.incoming {
                if state.hit_by.contains(t) {
                    continue;
                }
                let source = definition.transition(*t)?.source;
                let upstream = definition.graph().upstream_of(source, gateway_def.id);
                let alive = scope.live.iter().any(|n| {
                    n.id != gateway.id && n.is_live() && upstream.contains(&n.definition_id)
                });
                if alive {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    }
}

/// Freeze a satisfied gateway and move re-entrant hits to a successor
/// instance with id `successor_id`. Returns the successor, if any.
pub fn set_finish_and_create_new_gateway_for_remaining_token(
    gateway: &mut FlowNodeInstance,
    successor_id: Option<InstanceId>,
) -> Result<Option<FlowNodeInstance>> {
    let id = gateway.id;
    let state = gateway
        .gateway_mut()
        .ok_or_else(|| EngineError::modification(format!("flow node {id} is not a gateway")))?;
    state.fired = true;
    let queued = std::mem::take(&mut state.queued_hits);
    let gateway_type = state.gateway_type;
    gateway.token_count = 1;
    if queued.is_empty() {
        return Ok(None);
    }

    let successor_id = successor_id.ok_or_else(|| {
        EngineError::modification(format!("gateway {id} needs a successor for queued hits"))
    })?;
    let mut hit_by = Vec::new();
    let mut rest = Vec::new();
    for t in queued {
        if hit_by.contains(&t) {
            rest.push(t);
        } else {
            hit_by.push(t);
        }
    }
    let mut successor = gateway.clone();
    successor.id = successor_id;
    successor.token_count = (hit_by.len() + rest.len()) as u32;
    successor.detail = InstanceDetail::Gateway(GatewayState {
        gateway_type,
        hit_by,
        queued_hits: rest,
        fired: false,
    });
    successor.state = FlowNodeState::Executing;
    successor.created_at = now_ms();
    successor.last_update = successor.created_at;
    Ok(Some(successor))
}

// ─── Service ──────────────────────────────────────────────────

/// Source of the tokens arriving at gateways.
pub(crate) struct Arrival<'a> {
    pub definition: &'a ProcessDefinition,
    pub process_instance_id: InstanceId,
    pub scope: RefId,
    pub source: &'a FlowNodeInstance,
}

/// Gateway merge evaluator. Every hit and merge decision on a gateway runs
/// under the gateway lock of its (scope, definition).
pub struct GatewayService {
    ctx: ProcessEngineContext,
}

impl GatewayService {
    pub fn new(ctx: ProcessEngineContext) -> Self {
        Self { ctx }
    }

    /// Record arrivals into `unit` and fire every gateway whose merge
    /// condition holds. The caller holds the gateway locks of all targets
    /// and `live` is the scope as it will be once `unit` commits.
    /// Returns the ids of fired gateways.
    pub(crate) async fn arrive(
        &self,
        arrival: Arrival<'_>,
        targets: BTreeMap<FlowNodeDefId, Vec<TransitionId>>,
        mut live: Vec<FlowNodeInstance>,
        mut scope_tokens: u64,
        unit: &mut WorkUnit,
    ) -> Result<Vec<InstanceId>> {
        let pid = arrival.process_instance_id;
        let mut fired = Vec::new();

        for (gateway_def_id, transitions) in targets {
            let gateway_def = arrival.definition.node(gateway_def_id)?;
            let gateway_type = gateway_def.gateway_type().ok_or_else(|| {
                EngineError::modification(format!("'{}' is not a gateway", gateway_def.name))
            })?;

            // Exclusive joins pass every token through on its own.
            let batches: Vec<Vec<TransitionId>> = match gateway_type {
                GatewayType::Exclusive => transitions.into_iter().map(|t| vec![t]).collect(),
                _ => vec![transitions],
            };

            for batch in batches {
                let active = live
                    .iter()
                    .position(|n| {
                        n.definition_id == gateway_def_id && n.gateway().is_some_and(|g| !g.fired)
                    })
                    .map(|i| live.remove(i));
                let (mut gateway, mut is_new) = match active {
                    Some(g) => (g, false),
                    None => {
                        let id = self.ctx.store.next_id().await?;
                        let mut placement = Placement::in_scope(pid, arrival.scope);
                        placement.local_data = arrival.source.local_data.clone();
                        let mut g = build_instance(id, arrival.definition, gateway_def, placement);
                        g.token_count = 0;
                        (g, true)
                    }
                };

                for t in batch {
                    let already = gateway.gateway().is_some_and(|g| g.hit_by.contains(&t));
                    if already {
                        if let Some(g) = gateway.gateway_mut() {
                            g.queued_hits.push(t);
                        }
                        unit.event(pid, EngineEvent::GatewayHitQueued {
                            gateway_id: gateway.id,
                            transition_id: t,
                        });
                    } else {
                        hit_transition(&mut gateway, t)?;
                        unit.event(pid, EngineEvent::GatewayHit {
                            gateway_id: gateway.id,
                            transition_id: t,
                        });
                    }
                    gateway.token_count += 1;
                    debug!(gateway_id = gateway.id, transition = t, "gateway hit");
                }
                if gateway.state == FlowNodeState::Ready {
                    gateway.set_state(FlowNodeState::Executing);
                }

                loop {
                    let satisfied = check_merging_condition(
                        arrival.definition,
                        gateway_def,
                        &gateway,
                        &ScopeSnapshot {
                            live: &live,
                            tokens: scope_tokens,
                        },
                    )?;
                    if !satisfied {
                        break;
                    }
                    let successor = self.fire(pid, arrival.scope, &mut gateway, unit).await?;
                    scope_tokens = scope_tokens.saturating_sub(
                        gateway
                            .gateway()
                            .map_or(0, |g| (g.hit_by.len() as u64).saturating_sub(1)),
                    );
                    fired.push(gateway.id);
                    persist(unit, gateway.clone(), is_new);
                    match successor {
                        Some(next) => {
                            gateway = next;
                            is_new = true;
                        }
                        None => break,
                    }
                }
                if gateway.gateway().is_some_and(|g| !g.fired) {
                    persist(unit, gateway.clone(), is_new);
                }
                live.push(gateway);
            }
        }
        Ok(fired)
    }

    /// Consume the hits of a satisfied gateway: one token continues, the
    /// others are deleted.
    async fn fire(
        &self,
        pid: InstanceId,
        scope: RefId,
        gateway: &mut FlowNodeInstance,
        unit: &mut WorkUnit,
    ) -> Result<Option<FlowNodeInstance>> {
        let consumed = gateway.gateway().map(|g| g.hit_by.clone()).unwrap_or_default();
        let has_queue = gateway.gateway().is_some_and(|g| !g.queued_hits.is_empty());
        let successor_id = if has_queue {
            Some(self.ctx.store.next_id().await?)
        } else {
            None
        };
        let successor = set_finish_and_create_new_gateway_for_remaining_token(gateway, successor_id)?;
        unit.delete_tokens(pid, scope, consumed.len().saturating_sub(1) as u32);
        unit.event(pid, EngineEvent::GatewayFired {
            gateway_id: gateway.id,
            consumed_hits: consumed.clone(),
        });
        if let Some(next) = &successor {
            unit.event(pid, EngineEvent::GatewayRespawned {
                gateway_id: gateway.id,
                successor_id: next.id,
            });
        }
        info!(
            process_instance_id = pid,
            gateway_id = gateway.id,
            hits = consumed.len(),
            "gateway fired"
        );
        Ok(successor)
    }

    /// Fire the inclusive gateways of one scope whose dead branches became
    /// known since their last hit. Returns the fired gateway ids.
    pub(crate) async fn fire_ready_inclusive_gateways(
        &self,
        pid: InstanceId,
        scope: RefId,
    ) -> Result<Vec<InstanceId>> {
        let candidates: Vec<FlowNodeInstance> = self
            .ctx
            .store
            .load_flow_nodes_in_container(scope)
            .await?
            .into_iter()
            .filter(|n| n.is_live() && is_waiting_inclusive(n))
            .collect();

        let mut fired = Vec::new();
        for candidate in candidates {
            let _guard = self
                .ctx
                .locks
                .lock(LockKey::Gateway {
                    scope,
                    definition: candidate.definition_id,
                })
                .await;
            let live: Vec<FlowNodeInstance> = self
                .ctx
                .store
                .load_flow_nodes_in_container(scope)
                .await?
                .into_iter()
                .filter(|n| n.is_live())
                .collect();
            let Some(mut gateway) = live.iter().find(|n| n.id == candidate.id).cloned() else {
                continue;
            };
            if !is_waiting_inclusive(&gateway) || gateway.state_category != StateCategory::Normal {
                continue;
            }
            let definition = self.ctx.deployment(gateway.process_definition_id).await?.definition;
            let gateway_def = definition.node(gateway.definition_id)?;
            let tokens = self.ctx.store.count_tokens(pid, Some(scope)).await?;
            let snapshot = ScopeSnapshot { live: &live, tokens };
            if !check_merging_condition(&definition, gateway_def, &gateway, &snapshot)? {
                continue;
            }

            let mut fx = Effects::default();
            let successor = self.fire(pid, scope, &mut gateway, &mut fx.unit).await?;
            fx.unit.update_flow_node(gateway.clone());
            if let Some(next) = successor {
                fx.unit.insert_flow_node(next);
            }
            fx.apply(&self.ctx).await?;
            fired.push(gateway.id);
        }
        Ok(fired)
    }

    /// Record a hit on a live gateway instance.
    pub async fn hit_transition(&self, gateway_id: InstanceId, transition: TransitionId) -> Result<()> {
        let gateway = self.load_gateway(gateway_id).await?;
        let _guard = self
            .ctx
            .locks
            .lock(LockKey::Gateway {
                scope: gateway.container_id,
                definition: gateway.definition_id,
            })
            .await;
        let mut gateway = self.load_gateway(gateway_id).await?;
        hit_transition(&mut gateway, transition)?;
        if gateway.state == FlowNodeState::Ready {
            gateway.set_state(FlowNodeState::Executing);
        }
        let mut unit = WorkUnit::new();
        unit.event(gateway.process_instance_id, EngineEvent::GatewayHit {
            gateway_id,
            transition_id: transition,
        });
        unit.update_flow_node(gateway);
        self.ctx.store.commit(unit).await?;
        Ok(())
    }

    /// Evaluate the merge condition of a live gateway instance against the
    /// current state of its scope.
    pub async fn check_merging_condition(&self, gateway_id: InstanceId) -> Result<bool> {
        let gateway = self.load_gateway(gateway_id).await?;
        let definition = self.ctx.deployment(gateway.process_definition_id).await?.definition;
        let gateway_def = definition.node(gateway.definition_id)?;
        let live: Vec<FlowNodeInstance> = self
            .ctx
            .store
            .load_flow_nodes_in_container(gateway.container_id)
            .await?
            .into_iter()
            .filter(|n| n.is_live())
            .collect();
        let tokens = self
            .ctx
            .store
            .count_tokens(gateway.process_instance_id, Some(gateway.container_id))
            .await?;
        check_merging_condition(
            &definition,
            gateway_def,
            &gateway,
            &ScopeSnapshot { live: &live, tokens },
        )
    }

    /// Waiting inclusive gateways of a process instance, in every scope,
    /// whose merge condition holds now.
    pub async fn get_inclusive_gateways_of_process_instance_that_should_fire(
        &self,
        process_instance_id: InstanceId,
    ) -> Result<Vec<FlowNodeInstance>> {
        let nodes = self
            .ctx
            .store
            .load_flow_nodes_of_process(process_instance_id)
            .await?;
        let mut ready = Vec::new();
        for gateway in nodes.iter().filter(|n| n.is_live() && is_waiting_inclusive(n)) {
            let definition = self.ctx.deployment(gateway.process_definition_id).await?.definition;
            let gateway_def = definition.node(gateway.definition_id)?;
            let live: Vec<FlowNodeInstance> = nodes
                .iter()
                .filter(|n| n.container_id == gateway.container_id && n.is_live())
                .cloned()
                .collect();
            let tokens = self
                .ctx
                .store
                .count_tokens(process_instance_id, Some(gateway.container_id))
                .await?;
            let snapshot = ScopeSnapshot { live: &live, tokens };
            if check_merging_condition(&definition, gateway_def, gateway, &snapshot)? {
                ready.push(gateway.clone());
            }
        }
        Ok(ready)
    }

    async fn load_gateway(&self, id: InstanceId) -> Result<FlowNodeInstance> {
        let node = self
            .ctx
            .store
            .load_flow_node(id)
            .await?
            .ok_or_else(|| EngineError::not_found("gateway", id))?;
        if node.gateway().is_none() {
            return Err(EngineError::modification(format!("flow node {id} is not a gateway")));
        }
        Ok(node)
    }
}

fn is_waiting_inclusive(node: &FlowNodeInstance) -> bool {
    node.gateway().is_some_and(|g| {
        g.gateway_type == GatewayType::Inclusive && !g.fired && !g.hit_by.is_empty()
    })
}

fn persist(unit: &mut WorkUnit, gateway: FlowNodeInstance, is_new: bool) {
    if is_new {
        unit.insert_flow_node(gateway);
    } else {
        unit.update_flow_node(gateway);
    }
}
