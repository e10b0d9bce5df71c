use crate::context::ProcessEngineContext;
use crate::definition::{FlowNodeDefinition, LoopCharacteristics, MultiInstanceLoop, ProcessDefinition};
use crate::engine::Work;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::flow_node::{accepts_work, build_instance, DataContext, Effects, Placement};
use crate::lock::LockKey;
use crate::types::*;
use serde_json::{json, Value};
use tracing::{debug, info};

pub const LOOP_COUNTER: &str = "loopCounter";
pub const NR_OF_INSTANCES: &str = "nrOfInstances";
pub const NR_OF_ACTIVE_INSTANCES: &str = "nrOfActiveInstances";
pub const NR_OF_COMPLETED_INSTANCES: &str = "nrOfCompletedInstances";
pub const NR_OF_TERMINATED_INSTANCES: &str = "nrOfTerminatedInstances";

/// Counters exposed to completion conditions.
pub fn builtin_variables(counters: &MultiInstanceCounters) -> DataMap {
    DataMap::from([
        (NR_OF_INSTANCES.to_string(), json!(counters.total)),
        (NR_OF_ACTIVE_INSTANCES.to_string(), json!(counters.active)),
        (NR_OF_COMPLETED_INSTANCES.to_string(), json!(counters.completed)),
        (NR_OF_TERMINATED_INSTANCES.to_string(), json!(counters.terminated)),
    ])
}

/// Input collection of a multi-instance activity, if it iterates one.
fn input_collection(mi: &MultiInstanceLoop, data: &DataMap) -> Result<Option<Vec<Value>>> {
    let Some(name) = &mi.input_collection else {
        return Ok(None);
    };
    match data.get(name) {
        Some(Value::Array(items)) => Ok(Some(items.clone())),
        Some(_) => Err(EngineError::Expression(format!(
            "input collection '{name}' is not an array"
        ))),
        None => Err(EngineError::Expression(format!("unknown data '{name}'"))),
    }
}

/// Drives the children of multi-instance and standard loop wrappers.
///
/// The wrapper holds the activity's token in its own scope; every child
/// holds one token of the wrapper's scope. Children never follow
/// transitions: they report back here and the wrapper completes once the
/// loop is over.
pub struct MultiInstanceController {
    ctx: ProcessEngineContext,
}

impl MultiInstanceController {
    pub fn new(ctx: ProcessEngineContext) -> Self {
        Self { ctx }
    }

    /// Start the loop of a wrapper entering EXECUTING.
    pub(crate) async fn activate(
        &self,
        definition: &ProcessDefinition,
        def: &FlowNodeDefinition,
        process: &ProcessInstance,
        wrapper: &mut FlowNodeInstance,
        data: &DataMap,
        fx: &mut Effects,
    ) -> Result<Vec<Work>> {
        match &def.loop_characteristics {
            Some(LoopCharacteristics::MultiInstance(mi)) => {
                let collection = input_collection(mi, data)?;
                let total = match (&mi.cardinality, &collection) {
                    (Some(cardinality), _) => self.ctx.expressions.evaluate_count(cardinality, data)?,
                    (None, Some(items)) => items.len() as u32,
                    (None, None) => {
                        return Err(EngineError::modification(format!(
                            "multi-instance '{}' has neither cardinality nor input collection",
                            def.name
                        )))
                    }
                };
                let mut counters = MultiInstanceCounters {
                    sequential: mi.sequential,
                    total,
                    ..MultiInstanceCounters::default()
                };
                if let Some(output) = &mi.output_collection {
                    fx.unit.set_process_data(
                        process.id,
                        DataMap::from([(output.clone(), Value::Array(vec![Value::Null; total as usize]))]),
                    );
                }

                let mut work = Vec::new();
                if total == 0 {
                    debug!(wrapper_id = wrapper.id, "multi-instance with no instances");
                    work.push(Work::Complete(wrapper.id));
                } else {
                    let count = if mi.sequential { 1 } else { total };
                    fx.unit
                        .create_tokens(process.id, wrapper.id, wrapper.token_ref_id, count);
                    for index in 0..count {
                        let item = collection.as_ref().and_then(|items| items.get(index as usize).cloned());
                        let child = self
                            .spawn_child(definition, def, wrapper, index, Some(mi), item, fx)
                            .await?;
                        work.push(Work::Execute(child));
                    }
                    counters.spawned = count;
                    counters.active = count;
                }
                info!(wrapper_id = wrapper.id, total, sequential = mi.sequential, "multi-instance started");
                wrapper.detail = InstanceDetail::MultiInstance(counters);
                Ok(work)
            }
            Some(LoopCharacteristics::Standard(l)) => {
                let counters = LoopCounters {
                    loop_counter: 0,
                    loop_max: l.loop_max,
                    test_before: l.test_before,
                };
                let mut vars = data.clone();
                vars.insert(LOOP_COUNTER.to_string(), json!(0));
                let run = l.loop_max != Some(0)
                    && (!l.test_before || self.ctx.expressions.evaluate_bool(&l.condition, &vars)?);
                wrapper.detail = InstanceDetail::Loop(counters);
                if !run {
                    return Ok(vec![Work::Complete(wrapper.id)]);
                }
                fx.unit
                    .create_tokens(process.id, wrapper.id, wrapper.token_ref_id, 1);
                let child = self
                    .spawn_child(definition, def, wrapper, 0, None, None, fx)
                    .await?;
                Ok(vec![Work::Execute(child)])
            }
            None => Err(EngineError::modification(format!(
                "'{}' has no loop characteristics",
                def.name
            ))),
        }
    }

    /// Record a child outcome and decide what the wrapper does next. With
    /// `child` absent the wrapper only re-evaluates its loop.
    pub(crate) async fn on_child_finished(
        &self,
        wrapper_id: InstanceId,
        child: Option<FlowNodeInstance>,
    ) -> Result<Vec<Work>> {
        let _guard = self.ctx.locks.lock(LockKey::FlowNode(wrapper_id)).await;
        let Some(mut wrapper) = self.ctx.store.load_flow_node(wrapper_id).await? else {
            return Ok(Vec::new());
        };
        let Some(process) = self.ctx.store.load_process(wrapper.process_instance_id).await? else {
            return Ok(Vec::new());
        };
        if !wrapper.is_live() || wrapper.state_category != StateCategory::Normal {
            return Ok(Vec::new());
        }
        let definition = self.ctx.deployment(wrapper.process_definition_id).await?.definition;
        let def = definition.node(wrapper.definition_id)?;
        // A failed wrapper keeps counting; it resumes once retried.
        let evaluate = wrapper.state == FlowNodeState::Executing && accepts_work(&process);
        let mut fx = Effects::default();
        let mut work = Vec::new();

        match (wrapper.detail.clone(), &def.loop_characteristics) {
            (InstanceDetail::MultiInstance(mut counters), Some(LoopCharacteristics::MultiInstance(mi))) => {
                if let Some(child) = &child {
                    if counters.active == 0 {
                        return Ok(Vec::new());
                    }
                    counters.active -= 1;
                    if child.state == FlowNodeState::Completed {
                        counters.completed += 1;
                        if let (Some(item), Some(output)) = (&mi.output_item, &mi.output_collection) {
                            let value = child.local_data.get(item).cloned().unwrap_or(Value::Null);
                            let mut items = match process.data.get(output) {
                                Some(Value::Array(items)) => items.clone(),
                                _ => Vec::new(),
                            };
                            let index = child.loop_index.unwrap_or_default() as usize;
                            if items.len() <= index {
                                items.resize(index + 1, Value::Null);
                            }
                            items[index] = value;
                            fx.unit.set_process_data(
                                process.id,
                                DataMap::from([(output.clone(), Value::Array(items))]),
                            );
                        }
                    } else {
                        counters.terminated += 1;
                    }
                }
                wrapper.detail = InstanceDetail::MultiInstance(counters.clone());
                if !evaluate {
                    fx.unit.update_flow_node(wrapper);
                    fx.apply(&self.ctx).await?;
                    return Ok(Vec::new());
                }

                let mut vars = DataContext::new(&process, &wrapper).values;
                vars.extend(builtin_variables(&counters));
                if let Some(index) = child.as_ref().and_then(|c| c.loop_index) {
                    vars.insert(LOOP_COUNTER.to_string(), json!(index));
                }
                let condition_met = match &mi.completion_condition {
                    Some(condition) => match self.ctx.expressions.evaluate_bool(condition, &vars) {
                        Ok(met) => met,
                        Err(err) => {
                            // Keep the recorded outcome before the wrapper halts.
                            fx.unit.update_flow_node(wrapper);
                            fx.apply(&self.ctx).await?;
                            return Err(err);
                        }
                    },
                    None => false,
                };

                if condition_met || counters.finished() >= counters.total {
                    let remaining: Vec<FlowNodeInstance> = self
                        .ctx
                        .store
                        .load_flow_nodes_in_container(wrapper.id)
                        .await?
                        .into_iter()
                        .filter(|n| n.is_live() && n.is_loop_child())
                        .collect();
                    counters.terminated += counters.active;
                    counters.active = 0;
                    for r in remaining {
                        work.push(Work::Abort {
                            flow_node_id: r.id,
                            state: FlowNodeState::Cancelled,
                            notify_container: false,
                        });
                    }
                    work.push(Work::Complete(wrapper.id));
                    info!(
                        wrapper_id,
                        completed = counters.completed,
                        terminated = counters.terminated,
                        "multi-instance finished"
                    );
                } else if counters.sequential && counters.active == 0 && counters.spawned < counters.total {
                    let index = counters.spawned;
                    let collection = input_collection(mi, &vars)?;
                    let item = collection.and_then(|items| items.get(index as usize).cloned());
                    fx.unit
                        .create_tokens(process.id, wrapper.id, wrapper.token_ref_id, 1);
                    let next = self
                        .spawn_child(&definition, def, &wrapper, index, Some(mi), item, &mut fx)
                        .await?;
                    counters.spawned += 1;
                    counters.active += 1;
                    work.push(Work::Execute(next));
                }
                wrapper.detail = InstanceDetail::MultiInstance(counters);
            }
            (InstanceDetail::Loop(mut counters), Some(LoopCharacteristics::Standard(l))) => {
                let completed = child
                    .as_ref()
                    .is_none_or(|c| c.state == FlowNodeState::Completed);
                if child.is_some() {
                    counters.loop_counter += 1;
                }
                wrapper.detail = InstanceDetail::Loop(counters.clone());
                if !evaluate {
                    fx.unit.update_flow_node(wrapper);
                    fx.apply(&self.ctx).await?;
                    return Ok(Vec::new());
                }

                let below_max = counters.loop_max.is_none_or(|max| counters.loop_counter < max);
                let again = if completed && below_max {
                    let mut vars = DataContext::new(&process, &wrapper).values;
                    vars.insert(LOOP_COUNTER.to_string(), json!(counters.loop_counter));
                    match self.ctx.expressions.evaluate_bool(&l.condition, &vars) {
                        Ok(again) => again,
                        Err(err) => {
                            fx.unit.update_flow_node(wrapper);
                            fx.apply(&self.ctx).await?;
                            return Err(err);
                        }
                    }
                } else {
                    false
                };
                if again {
                    fx.unit
                        .create_tokens(process.id, wrapper.id, wrapper.token_ref_id, 1);
                    let next = self
                        .spawn_child(&definition, def, &wrapper, counters.loop_counter, None, None, &mut fx)
                        .await?;
                    work.push(Work::Execute(next));
                } else {
                    info!(wrapper_id, iterations = counters.loop_counter, "loop finished");
                    work.push(Work::Complete(wrapper.id));
                }
            }
            _ => {
                return Err(EngineError::modification(format!(
                    "wrapper {wrapper_id} does not match the loop characteristics of '{}'",
                    def.name
                )))
            }
        }

        fx.unit.update_flow_node(wrapper);
        fx.apply(&self.ctx).await?;
        Ok(work)
    }

    /// Rebuild a wrapper's counters from its children after a crash and
    /// hand it back to the loop. Children that finished and were archived
    /// before their wrapper heard of them are counted here.
    pub(crate) async fn reconcile(&self, wrapper_id: InstanceId) -> Result<Vec<Work>> {
        let _guard = self.ctx.locks.lock(LockKey::FlowNode(wrapper_id)).await;
        let Some(mut wrapper) = self.ctx.store.load_flow_node(wrapper_id).await? else {
            return Ok(Vec::new());
        };
        if wrapper.state != FlowNodeState::Executing || wrapper.state_category != StateCategory::Normal {
            return Ok(Vec::new());
        }
        let pid = wrapper.process_instance_id;
        let Some(process) = self.ctx.store.load_process(pid).await? else {
            return Ok(Vec::new());
        };
        let definition = self.ctx.deployment(wrapper.process_definition_id).await?.definition;
        let def = definition.node(wrapper.definition_id)?;

        let mut finished: Vec<FlowNodeInstance> = self
            .ctx
            .archive
            .archived_flow_nodes(pid)
            .await?
            .into_iter()
            .map(|a| a.source)
            .filter(|n| n.container_id == wrapper_id && n.is_loop_child())
            .collect();
        finished.sort_by_key(|n| n.loop_index);
        let live = self
            .ctx
            .store
            .load_flow_nodes_in_container(wrapper_id)
            .await?
            .into_iter()
            .filter(|n| n.is_live() && n.is_loop_child())
            .count() as u32;

        let mut fx = Effects::default();
        let work = match (wrapper.detail.clone(), &def.loop_characteristics) {
            (InstanceDetail::MultiInstance(mut counters), Some(LoopCharacteristics::MultiInstance(mi))) => {
                let completed: Vec<&FlowNodeInstance> = finished
                    .iter()
                    .filter(|n| n.state == FlowNodeState::Completed)
                    .collect();
                counters.completed = completed.len() as u32;
                counters.terminated = finished.len() as u32 - counters.completed;
                counters.active = live;
                counters.spawned = counters.spawned.max(counters.finished() + live);
                if let (Some(item), Some(output), false) =
                    (&mi.output_item, &mi.output_collection, completed.is_empty())
                {
                    let mut items = match process.data.get(output) {
                        Some(Value::Array(items)) => items.clone(),
                        _ => Vec::new(),
                    };
                    for child in completed {
                        let index = child.loop_index.unwrap_or_default() as usize;
                        if items.len() <= index {
                            items.resize(index + 1, Value::Null);
                        }
                        items[index] = child.local_data.get(item).cloned().unwrap_or(Value::Null);
                    }
                    fx.unit
                        .set_process_data(pid, DataMap::from([(output.clone(), Value::Array(items))]));
                }
                debug!(
                    wrapper_id,
                    active = counters.active,
                    completed = counters.completed,
                    terminated = counters.terminated,
                    "multi-instance counters rebuilt"
                );
                wrapper.detail = InstanceDetail::MultiInstance(counters);
                vec![Work::ChildFinished {
                    wrapper_id,
                    child: None,
                }]
            }
            (InstanceDetail::Loop(mut counters), Some(LoopCharacteristics::Standard(_))) => {
                let iterations = finished.len() as u32;
                if live > 0 {
                    Vec::new()
                } else if iterations > counters.loop_counter {
                    // The last iteration finished unseen: replay its report.
                    counters.loop_counter = iterations - 1;
                    wrapper.detail = InstanceDetail::Loop(counters);
                    vec![Work::ChildFinished {
                        wrapper_id,
                        child: finished.pop().map(Box::new),
                    }]
                } else if iterations > 0 {
                    vec![Work::Complete(wrapper_id)]
                } else {
                    vec![Work::ChildFinished {
                        wrapper_id,
                        child: None,
                    }]
                }
            }
            _ => {
                return Err(EngineError::modification(format!(
                    "wrapper {wrapper_id} does not match the loop characteristics of '{}'",
                    def.name
                )))
            }
        };
        fx.unit.update_flow_node(wrapper);
        fx.apply(&self.ctx).await?;
        Ok(work)
    }

    #[allow(clippy::too_many_arguments)]
    async fn spawn_child(
        &self,
        definition: &ProcessDefinition,
        def: &FlowNodeDefinition,
        wrapper: &FlowNodeInstance,
        index: u32,
        mi: Option<&MultiInstanceLoop>,
        item: Option<Value>,
        fx: &mut Effects,
    ) -> Result<InstanceId> {
        let id = self.ctx.store.next_id().await?;
        let mut local_data = wrapper.local_data.clone();
        local_data.insert(LOOP_COUNTER.to_string(), json!(index));
        if let Some(mi) = mi {
            if let Some(name) = &mi.input_item {
                local_data.insert(name.clone(), item.unwrap_or(Value::Null));
            }
            if let Some(name) = &mi.output_item {
                local_data.insert(name.clone(), Value::Null);
            }
        }
        let mut placement = Placement::in_scope(wrapper.process_instance_id, wrapper.id);
        placement.loop_index = Some(index);
        placement.local_data = local_data;
        fx.unit.insert_flow_node(build_instance(id, definition, def, placement));
        fx.unit.event(wrapper.process_instance_id, EngineEvent::MultiInstanceChildSpawned {
            wrapper_id: wrapper.id,
            child_id: id,
            loop_index: index,
        });
        Ok(id)
    }
}
