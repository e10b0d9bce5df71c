use crate::definition::*;
use crate::types::FlowNodeDefId;
use std::collections::{BTreeSet, HashMap};

/// Rule id reported for correlation limit violations.
pub const RULE_CORRELATION: &str = "V10";

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub rule: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

fn push(errors: &mut Vec<ValidationError>, rule: &str, message: String) {
    errors.push(ValidationError {
        rule: rule.to_string(),
        message,
    });
}

/// Validate a definition arena. Returns all errors found.
pub fn validate_definition(def: &ProcessDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let count = def.flow_nodes.len();
    let in_range = |id: FlowNodeDefId| (id as usize) < count;

    // V1: Arena ids match their index
    for (i, node) in def.flow_nodes.iter().enumerate() {
        if node.id as usize != i {
            push(&mut errors, "V1", format!("Node '{}' has id {} at index {}", node.name, node.id, i));
        }
    }
    for (i, t) in def.transitions.iter().enumerate() {
        if t.id as usize != i {
            push(&mut errors, "V1", format!("Transition {} stored at index {}", t.id, i));
        }
    }
    if !errors.is_empty() {
        return errors;
    }

    // V2: Node names must be unique
    let mut names: HashMap<&str, FlowNodeDefId> = HashMap::new();
    for node in &def.flow_nodes {
        if names.insert(node.name.as_str(), node.id).is_some() {
            push(&mut errors, "V2", format!("Duplicate node name: {}", node.name));
        }
    }

    // V13: Containers exist and are sub-processes
    for node in &def.flow_nodes {
        if let Some(c) = node.container {
            let ok = in_range(c) && matches!(def.flow_nodes[c as usize].kind, FlowNodeKind::SubProcess);
            if !ok || c == node.id {
                push(&mut errors, "V13", format!("Node '{}' has invalid container {}", node.name, c));
            }
        }
    }

    // V3: Transition endpoints
    for t in &def.transitions {
        if !in_range(t.source) || !in_range(t.target) {
            push(&mut errors, "V3", format!("Transition {} references an unknown node", t.id));
            continue;
        }
        let source = &def.flow_nodes[t.source as usize];
        let target = &def.flow_nodes[t.target as usize];
        if source.container != target.container {
            push(
                &mut errors,
                "V3",
                format!("Transition {} crosses scopes: '{}' -> '{}'", t.id, source.name, target.name),
            );
        }
        if matches!(source.kind, FlowNodeKind::EndEvent { .. }) {
            push(&mut errors, "V3", format!("End event '{}' has an outgoing transition", source.name));
        }
        if matches!(
            target.kind,
            FlowNodeKind::StartEvent { .. } | FlowNodeKind::BoundaryEvent { .. }
        ) {
            push(&mut errors, "V3", format!("'{}' cannot have incoming transitions", target.name));
        }
    }

    // V4: Incoming/outgoing lists agree with the transition table
    for t in &def.transitions {
        if !in_range(t.source) || !in_range(t.target) {
            continue;
        }
        if !def.flow_nodes[t.source as usize].outgoing.contains(&t.id)
            || !def.flow_nodes[t.target as usize].incoming.contains(&t.id)
        {
            push(&mut errors, "V4", format!("Transition {} is not linked to its endpoints", t.id));
        }
    }

    // V5 + V6: Default transitions and parallel gateway outgoing edges
    for node in &def.flow_nodes {
        if let Some(d) = node.default_transition {
            let valid = node.outgoing.contains(&d)
                && def.transitions.get(d as usize).is_some_and(|t| t.condition.is_none());
            if !valid {
                push(
                    &mut errors,
                    "V5",
                    format!("Default transition of '{}' must be one of its unconditional outgoing transitions", node.name),
                );
            }
            if node.gateway_type() == Some(GatewayType::Parallel) {
                push(&mut errors, "V5", format!("Parallel gateway '{}' cannot have a default transition", node.name));
            }
        }
        if node.gateway_type() == Some(GatewayType::Parallel) {
            for t in &node.outgoing {
                if def.transitions.get(*t as usize).is_some_and(|t| t.condition.is_some()) {
                    push(
                        &mut errors,
                        "V6",
                        format!("Parallel gateway '{}' has a conditional outgoing transition", node.name),
                    );
                }
            }
        }
    }

    // V7: Every scope has a start event; sub-process starts carry no trigger
    let mut scopes: Vec<Option<FlowNodeDefId>> = vec![None];
    scopes.extend(
        def.flow_nodes
            .iter()
            .filter(|n| matches!(n.kind, FlowNodeKind::SubProcess))
            .map(|n| Some(n.id)),
    );
    for scope in scopes {
        let starts: Vec<_> = def
            .flow_nodes
            .iter()
            .filter(|n| n.container == scope && n.is_start_event())
            .collect();
        let label = scope
            .and_then(|s| def.flow_nodes.get(s as usize))
            .map(|n| n.name.as_str())
            .unwrap_or(def.name.as_str());
        if starts.is_empty() {
            push(&mut errors, "V7", format!("Scope '{}' has no start event", label));
        }
        if scope.is_some()
            && starts
                .iter()
                .any(|n| !matches!(n.kind, FlowNodeKind::StartEvent { trigger: None }))
        {
            push(&mut errors, "V7", format!("Sub-process '{}' has a triggered start event", label));
        }
    }

    // V8: Boundary events
    for node in &def.flow_nodes {
        let FlowNodeKind::BoundaryEvent { trigger, interrupting } = &node.kind else {
            continue;
        };
        match node.attached_to {
            Some(a) if in_range(a) => {
                let activity = &def.flow_nodes[a as usize];
                if !activity.is_activity() {
                    push(&mut errors, "V8", format!("Boundary '{}' is attached to non-activity '{}'", node.name, activity.name));
                }
                if activity.container != node.container || !activity.boundary_events.contains(&node.id) {
                    push(&mut errors, "V8", format!("Boundary '{}' is not registered on '{}'", node.name, activity.name));
                }
            }
            _ => push(&mut errors, "V8", format!("Boundary '{}' is not attached to an activity", node.name)),
        }
        if node.outgoing.is_empty() {
            push(&mut errors, "V8", format!("Boundary '{}' has no outgoing transition", node.name));
        }
        if matches!(trigger, EventTrigger::Error { .. }) && !interrupting {
            push(&mut errors, "V8", format!("Error boundary '{}' must be interrupting", node.name));
        }
    }

    // V9: Intermediate catch events wait for a timer or a message
    for node in &def.flow_nodes {
        if let FlowNodeKind::IntermediateCatchEvent {
            trigger: EventTrigger::Error { .. },
        } = &node.kind
        {
            push(&mut errors, "V9", format!("Catch event '{}' cannot wait for an error", node.name));
        }
    }

    // V10: Message names and correlation limits
    for node in &def.flow_nodes {
        let (name, correlations) = match &node.kind {
            FlowNodeKind::StartEvent { trigger: Some(EventTrigger::Message(m)) }
            | FlowNodeKind::IntermediateCatchEvent { trigger: EventTrigger::Message(m) }
            | FlowNodeKind::BoundaryEvent { trigger: EventTrigger::Message(m), .. } => {
                (&m.message_name, &m.correlations)
            }
            FlowNodeKind::IntermediateThrowEvent { message }
            | FlowNodeKind::EndEvent { result: EndEventResult::Message(message) } => {
                (&message.message_name, &message.correlations)
            }
            _ => continue,
        };
        if name.is_empty() {
            push(&mut errors, RULE_CORRELATION, format!("'{}' has an empty message name", node.name));
        }
        if correlations.len() > MAX_CORRELATION_KEYS {
            push(
                &mut errors,
                RULE_CORRELATION,
                format!(
                    "'{}' declares {} correlation keys, at most {} allowed",
                    node.name,
                    correlations.len(),
                    MAX_CORRELATION_KEYS
                ),
            );
        }
        let mut keys = BTreeSet::new();
        for c in correlations {
            if !keys.insert(c.key.as_str()) {
                push(&mut errors, RULE_CORRELATION, format!("'{}' repeats correlation key '{}'", node.name, c.key));
            }
        }
    }

    // V11: Loop characteristics
    for node in &def.flow_nodes {
        let Some(lc) = &node.loop_characteristics else {
            continue;
        };
        if !node.is_activity() {
            push(&mut errors, "V11", format!("'{}' is not an activity and cannot loop", node.name));
        }
        if let LoopCharacteristics::MultiInstance(mi) = lc {
            if mi.cardinality.is_none() && mi.input_collection.is_none() {
                push(
                    &mut errors,
                    "V11",
                    format!("Multi-instance '{}' needs a cardinality or an input collection", node.name),
                );
            }
            if mi.input_item.is_some() && mi.input_collection.is_none() {
                push(&mut errors, "V11", format!("Multi-instance '{}' has an input item without collection", node.name));
            }
            if mi.output_collection.is_some() != mi.output_item.is_some() {
                push(
                    &mut errors,
                    "V11",
                    format!("Multi-instance '{}' must declare output item and collection together", node.name),
                );
            }
        }
    }

    // V12: Every node is reachable from a start or boundary event
    if errors.is_empty() {
        let roots: Vec<FlowNodeDefId> = def
            .flow_nodes
            .iter()
            .filter(|n| {
                n.is_start_event() || matches!(n.kind, FlowNodeKind::BoundaryEvent { .. })
            })
            .map(|n| n.id)
            .collect();
        let reachable = def.graph().reachable_from(&roots);
        for node in &def.flow_nodes {
            if !reachable.contains(&node.id) {
                push(&mut errors, "V12", format!("Node '{}' is unreachable", node.name));
            }
        }
    }

    errors
}
