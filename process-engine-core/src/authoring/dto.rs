use crate::definition::*;
use crate::error::{EngineError, Result};
use crate::expression::Expression;
use crate::types::{DataMap, FlowNodeDefId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Authoring form of a process definition. Nodes reference each other by
/// name; [`DefinitionDto::into_definition`] resolves names to arena ids.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DefinitionDto {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub data: DataMap,
    pub nodes: Vec<NodeDto>,
    #[serde(default)]
    pub transitions: Vec<TransitionDto>,
}

fn default_version() -> String {
    "1".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeDto {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub kind: FlowNodeKind,
    /// Enclosing sub-process name.
    #[serde(default)]
    pub container: Option<String>,
    /// Activity name, for boundary events.
    #[serde(default)]
    pub attached_to: Option<String>,
    #[serde(default)]
    pub connectors: Vec<ConnectorDefinition>,
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub loop_characteristics: Option<LoopCharacteristics>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransitionDto {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition: Option<Expression>,
    #[serde(default)]
    pub default: bool,
}

impl DefinitionDto {
    /// Resolve names and build a validated definition.
    pub fn into_definition(self) -> Result<ProcessDefinition> {
        let mut builder = ProcessDefinitionBuilder::new(self.name, self.version);
        for (name, value) in self.data {
            builder.initial_data(name, value);
        }

        let mut ids: HashMap<String, FlowNodeDefId> = HashMap::new();
        let lookup = |ids: &HashMap<String, FlowNodeDefId>, name: &str| {
            ids.get(name).copied().ok_or_else(|| {
                EngineError::InvalidDefinition(format!("unknown node reference '{name}'"))
            })
        };

        // Boundary events are attached after every activity exists.
        let mut boundaries = Vec::new();
        let mut containers = Vec::new();
        for node in self.nodes {
            if let FlowNodeKind::BoundaryEvent { trigger, interrupting } = node.kind {
                boundaries.push((node.name, node.description, node.attached_to, trigger, interrupting));
                continue;
            }
            let id = builder.add_node(node.name.clone(), node.kind);
            if let Some(description) = node.description {
                builder.describe(id, description);
            }
            for connector in node.connectors {
                builder.connector(id, connector);
            }
            for op in node.operations {
                builder.operation(id, op.target, op.expression);
            }
            if let Some(lc) = node.loop_characteristics {
                builder.loop_characteristics(id, lc);
            }
            if let Some(container) = node.container {
                containers.push((id, container));
            }
            ids.insert(node.name, id);
        }

        for (id, container) in containers {
            let c = lookup(&ids, &container)?;
            builder.in_container(id, c);
        }

        for (name, description, attached_to, trigger, interrupting) in boundaries {
            let activity_name = attached_to.ok_or_else(|| {
                EngineError::InvalidDefinition(format!("boundary '{name}' has no attached_to"))
            })?;
            let activity = lookup(&ids, &activity_name)?;
            let id = builder.boundary_event(activity, name.clone(), trigger, interrupting);
            if let Some(description) = description {
                builder.describe(id, description);
            }
            ids.insert(name, id);
        }

        for t in self.transitions {
            let from = lookup(&ids, &t.from)?;
            let to = lookup(&ids, &t.to)?;
            match (t.default, t.condition) {
                (true, _) => builder.default_transition(from, to),
                (false, Some(condition)) => builder.conditional_transition(from, to, condition),
                (false, None) => builder.transition(from, to),
            };
        }

        builder.build()
    }
}
