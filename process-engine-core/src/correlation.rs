use crate::context::ProcessEngineContext;
use crate::definition::{
    EventTrigger, FlowNodeDefinition, FlowNodeKind, MessageThrow, MessageTrigger, ProcessDefinition,
    MAX_CORRELATION_KEYS,
};
use crate::engine::Work;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::expression::ExpressionResolver;
use crate::flow_node::{Effects, FlowNodeStateMachine};
use crate::process::ProcessLifecycle;
use crate::scheduler::{timer_job_id, TimerJob};
use crate::store::{Mutation, WorkUnit};
use crate::types::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

// ─── Messages ─────────────────────────────────────────────────

/// A message on its way to a waiting catch event, boundary event or
/// message start event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageInstance {
    pub name: String,
    #[serde(default)]
    pub target_process: Option<String>,
    #[serde(default)]
    pub target_flow_node: Option<String>,
    /// At most five key/value pairs.
    #[serde(default)]
    pub correlations: DataMap,
    #[serde(default)]
    pub payload: DataMap,
}

impl MessageInstance {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn to_process(mut self, process: impl Into<String>) -> Self {
        self.target_process = Some(process.into());
        self
    }

    pub fn to_flow_node(mut self, flow_node: impl Into<String>) -> Self {
        self.target_flow_node = Some(flow_node.into());
        self
    }

    pub fn correlate(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.correlations.insert(key.into(), value.into());
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(EngineError::Correlation("message name is empty".into()));
        }
        if self.correlations.len() > MAX_CORRELATION_KEYS {
            return Err(EngineError::Correlation(format!(
                "message '{}' carries {} correlation keys, at most {MAX_CORRELATION_KEYS} allowed",
                self.name,
                self.correlations.len()
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CorrelationOutcome {
    Delivered {
        waiting_event_id: InstanceId,
        process_instance_id: InstanceId,
        flow_node_instance_id: Option<InstanceId>,
    },
    /// No subscription matched; the message is discarded.
    NotDelivered,
}

impl CorrelationOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, CorrelationOutcome::Delivered { .. })
    }
}

/// Whether `message` satisfies every condition of `waiting`: same name,
/// the targeted process and flow node if any, and every correlation pair
/// of the subscription.
pub fn matches(waiting: &WaitingEvent, message: &MessageInstance) -> bool {
    if waiting.event_type != WaitingEventType::Message
        || waiting.message_name.as_deref() != Some(message.name.as_str())
    {
        return false;
    }
    if message
        .target_process
        .as_deref()
        .is_some_and(|p| p != waiting.process_name)
    {
        return false;
    }
    if message
        .target_flow_node
        .as_deref()
        .is_some_and(|n| n != waiting.flow_node_name)
    {
        return false;
    }
    waiting.correlations.iter().all(|(key, expected)| {
        message
            .correlations
            .get(key)
            .is_some_and(|actual| same_value(actual, expected))
    })
}

fn same_value(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Message thrown by an end or intermediate throw event.
pub(crate) fn build_message(
    throw: &MessageThrow,
    data: &DataMap,
    resolver: &dyn ExpressionResolver,
) -> Result<MessageInstance> {
    let mut message = MessageInstance::new(throw.message_name.clone());
    message.target_process = throw.target_process.clone();
    message.target_flow_node = throw.target_flow_node.clone();
    for correlation in &throw.correlations {
        message
            .correlations
            .insert(correlation.key.clone(), resolver.evaluate(&correlation.value, data)?);
    }
    for (key, expression) in &throw.payload {
        message
            .payload
            .insert(key.clone(), resolver.evaluate(expression, data)?);
    }
    Ok(message)
}

/// Process data written from a message payload.
pub(crate) fn mapped_data(trigger: &MessageTrigger, payload: &DataMap) -> DataMap {
    trigger
        .data_mappings
        .iter()
        .filter_map(|(key, name)| payload.get(key).map(|v| (name.clone(), v.clone())))
        .collect()
}

// ─── Subscriptions ────────────────────────────────────────────

/// Everything needed to subscribe one flow node to its trigger.
pub(crate) struct Subscription<'a> {
    pub definition: &'a ProcessDefinition,
    pub def: &'a FlowNodeDefinition,
    pub trigger: &'a EventTrigger,
    pub kind: WaitingEventKind,
    pub process: Option<&'a ProcessInstance>,
    pub node: Option<&'a FlowNodeInstance>,
}

impl Subscription<'_> {
    /// Waiting event with evaluated correlations, and the timer job to
    /// schedule for timer triggers.
    pub fn build(
        &self,
        id: InstanceId,
        data: &DataMap,
        resolver: &dyn ExpressionResolver,
    ) -> Result<(WaitingEvent, Option<TimerJob>)> {
        let event_type = self.trigger.waiting_event_type().ok_or_else(|| {
            EngineError::modification(format!("'{}' cannot wait for an error", self.def.name))
        })?;
        let mut correlations = DataMap::new();
        if let Some(message) = self.trigger.message() {
            if message.correlations.len() > MAX_CORRELATION_KEYS {
                return Err(EngineError::Correlation(format!(
                    "'{}' declares {} correlation keys",
                    self.def.name,
                    message.correlations.len()
                )));
            }
            for correlation in &message.correlations {
                correlations.insert(
                    correlation.key.clone(),
                    resolver.evaluate(&correlation.value, data)?,
                );
            }
        }
        let discriminator = self.node.map(|n| n.id);
        let job = self.trigger.due_at(now_ms()).map(|due_at| TimerJob {
            job_id: timer_job_id(self.definition.id, self.def.id, discriminator),
            process_definition_id: self.definition.id,
            flow_node_definition_id: self.def.id,
            discriminator,
            due_at,
        });
        let waiting = WaitingEvent {
            id,
            event_type,
            kind: self.kind,
            process_definition_id: self.definition.id,
            process_name: self.definition.name.clone(),
            process_instance_id: self.process.map(|p| p.id),
            flow_node_instance_id: discriminator,
            flow_node_definition_id: self.def.id,
            flow_node_name: self.def.name.clone(),
            message_name: self.trigger.message().map(|m| m.message_name.clone()),
            correlations,
            job_id: job.as_ref().map(|j| j.job_id.clone()),
            due_at: job.as_ref().map(|j| j.due_at),
            active: true,
        };
        Ok((waiting, job))
    }
}

// ─── Correlator ───────────────────────────────────────────────

/// Routes messages and fired timers to their subscriptions. A subscription
/// is consumed exactly once; of two concurrent deliveries only the one that
/// consumes it takes effect.
pub struct EventCorrelator {
    ctx: ProcessEngineContext,
    machine: FlowNodeStateMachine,
    lifecycle: ProcessLifecycle,
}

impl EventCorrelator {
    pub fn new(ctx: ProcessEngineContext) -> Self {
        Self {
            machine: FlowNodeStateMachine::new(ctx.clone()),
            lifecycle: ProcessLifecycle::new(ctx.clone()),
            ctx,
        }
    }

    /// Deliver `message` to the oldest matching subscription.
    pub(crate) async fn send_message(
        &self,
        message: &MessageInstance,
    ) -> Result<(CorrelationOutcome, Vec<Work>)> {
        message.validate()?;
        let mut candidates: Vec<WaitingEvent> = self
            .ctx
            .store
            .find_waiting_message_events(&message.name)
            .await?
            .into_iter()
            .filter(|w| matches(w, message))
            .collect();
        candidates.sort_by_key(|w| w.id);

        for waiting in candidates {
            if let Some(delivered) = self.deliver(&waiting, &message.payload).await? {
                info!(
                    message = %message.name,
                    waiting_event_id = waiting.id,
                    "message delivered"
                );
                return Ok(delivered);
            }
        }
        debug!(message = %message.name, "message discarded: no matching subscription");
        Ok((CorrelationOutcome::NotDelivered, Vec::new()))
    }

    /// Deliver a fired timer job to the subscription that scheduled it.
    pub(crate) async fn fire_timer(&self, job_id: &str) -> Result<(CorrelationOutcome, Vec<Work>)> {
        let Some(waiting) = self.ctx.store.find_waiting_event_by_job(job_id).await? else {
            debug!(job_id, "timer without subscription");
            return Ok((CorrelationOutcome::NotDelivered, Vec::new()));
        };
        let delivered = self.deliver(&waiting, &DataMap::new()).await?;
        self.ctx.scheduler.cancel(job_id).await?;
        Ok(delivered.unwrap_or((CorrelationOutcome::NotDelivered, Vec::new())))
    }

    async fn deliver(
        &self,
        waiting: &WaitingEvent,
        payload: &DataMap,
    ) -> Result<Option<(CorrelationOutcome, Vec<Work>)>> {
        match waiting.kind {
            WaitingEventKind::Start => self.start_from(waiting, payload).await,
            WaitingEventKind::IntermediateCatch => {
                let Some(pid) = waiting.process_instance_id else {
                    return Ok(None);
                };
                let work = self.machine.trigger_catch_event(waiting, payload).await?;
                Ok(work.map(|work| (delivered(waiting, pid), work)))
            }
            WaitingEventKind::Boundary => {
                let Some(pid) = waiting.process_instance_id else {
                    return Ok(None);
                };
                let work = self.machine.fire_boundary(waiting, payload).await?;
                Ok(work.map(|work| (delivered(waiting, pid), work)))
            }
        }
    }

    /// Start a new instance from a message or timer start event. Message
    /// starts stay subscribed for the next message.
    async fn start_from(
        &self,
        waiting: &WaitingEvent,
        payload: &DataMap,
    ) -> Result<Option<(CorrelationOutcome, Vec<Work>)>> {
        let deployment = self.ctx.deployment(waiting.process_definition_id).await?;
        if !deployment.enabled {
            return Ok(None);
        }
        let definition = deployment.definition;
        let start = definition.node(waiting.flow_node_definition_id)?;

        // Consuming, renewing and instantiating commit as one unit.
        let mut unit = WorkUnit::new();
        unit.consume_waiting_event(waiting.id);
        let mut data = DataMap::new();
        if waiting.event_type == WaitingEventType::Message {
            let mut renewed = waiting.clone();
            renewed.id = self.ctx.store.next_id().await?;
            unit.push(Mutation::InsertWaitingEvent(renewed));
            if let FlowNodeKind::StartEvent {
                trigger: Some(EventTrigger::Message(trigger)),
            } = &start.kind
            {
                data = mapped_data(trigger, payload);
            }
        }

        let started = self
            .lifecycle
            .start_from_event(&definition, start.id, data, unit)
            .await;
        match started {
            Ok((process, work)) => Ok(Some((delivered(waiting, process.id), work))),
            Err(err) if err.is_missing("waiting event") => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Subscribe the message and timer start events of a definition.
    pub(crate) async fn register_start_events(&self, definition: &ProcessDefinition) -> Result<()> {
        let mut fx = Effects::default();
        for (def, trigger) in definition.triggered_start_events() {
            let subscription = Subscription {
                definition,
                def,
                trigger,
                kind: WaitingEventKind::Start,
                process: None,
                node: None,
            };
            let id = self.ctx.store.next_id().await?;
            let (waiting, job) =
                subscription.build(id, &definition.initial_data, self.ctx.expressions.as_ref())?;
            fx.register_waiting_event(None, waiting, job);
        }
        if !fx.unit.is_empty() {
            fx.apply(&self.ctx).await?;
            info!(definition_id = definition.id, "start events subscribed");
        }
        Ok(())
    }

    pub(crate) async fn unregister_start_events(&self, definition_id: ProcessDefinitionId) -> Result<()> {
        let mut fx = Effects::default();
        for waiting in self.ctx.store.load_start_waiting_events(definition_id).await? {
            fx.cancel.extend(waiting.job_id);
        }
        fx.unit.push(Mutation::DeleteStartWaitingEvents(definition_id));
        fx.apply(&self.ctx).await?;
        Ok(())
    }

    /// Record a message thrown by a process on the log of that process.
    pub(crate) async fn record_sent(
        &self,
        process_instance_id: InstanceId,
        message: &MessageInstance,
        outcome: &CorrelationOutcome,
    ) -> Result<()> {
        let mut unit = WorkUnit::new();
        unit.event(process_instance_id, EngineEvent::MessageSent {
            message_name: message.name.clone(),
            delivered: outcome.is_delivered(),
        });
        self.ctx.store.commit(unit).await?;
        Ok(())
    }
}

fn delivered(waiting: &WaitingEvent, process_instance_id: InstanceId) -> CorrelationOutcome {
    CorrelationOutcome::Delivered {
        waiting_event_id: waiting.id,
        process_instance_id,
        flow_node_instance_id: waiting.flow_node_instance_id,
    }
}
