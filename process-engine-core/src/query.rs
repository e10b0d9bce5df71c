use crate::error::{EngineError, Result};
use crate::types::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub order: SortOrder,
}

/// Equality filter on one field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterOption {
    pub field: String,
    pub value: Value,
}

/// Paging, sorting and filtering of a search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub from_index: usize,
    pub max_results: usize,
    pub order_by: Option<OrderBy>,
    pub filters: Vec<FilterOption>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            from_index: 0,
            max_results: usize::MAX,
            order_by: None,
            filters: Vec::new(),
        }
    }
}

impl QueryOptions {
    pub fn page(from_index: usize, max_results: usize) -> Self {
        Self {
            from_index,
            max_results,
            ..Self::default()
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(FilterOption {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            order,
        });
        self
    }
}

/// Record exposing named fields to [`QueryOptions`].
pub trait Queryable {
    /// `None` for an unknown field; optional fields report `Value::Null`.
    fn field(&self, name: &str) -> Option<Value>;
}

/// Filter, sort and page `items`. Unknown filter or sort fields are read
/// errors.
pub fn apply<'a, T, I>(options: &QueryOptions, items: I) -> Result<Vec<T>>
where
    T: Queryable + Clone + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut matched = Vec::new();
    for item in items {
        let mut keep = true;
        for filter in &options.filters {
            let value = item.field(&filter.field).ok_or_else(|| {
                EngineError::Read(format!("unknown filter field '{}'", filter.field))
            })?;
            if !values_equal(&value, &filter.value) {
                keep = false;
                break;
            }
        }
        if keep {
            matched.push(item.clone());
        }
    }

    if let Some(order_by) = &options.order_by {
        let mut keyed = Vec::with_capacity(matched.len());
        for item in matched {
            let key = item.field(&order_by.field).ok_or_else(|| {
                EngineError::Read(format!("unknown sort field '{}'", order_by.field))
            })?;
            keyed.push((key, item));
        }
        keyed.sort_by(|(a, _), (b, _)| {
            let ord = compare_values(a, b);
            match order_by.order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });
        matched = keyed.into_iter().map(|(_, item)| item).collect();
    }

    Ok(matched
        .into_iter()
        .skip(options.from_index)
        .take(options.max_results)
        .collect())
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

impl Queryable for FlowNodeInstance {
    fn field(&self, name: &str) -> Option<Value> {
        Some(match name {
            "id" => json!(self.id),
            "process_instance_id" => json!(self.process_instance_id),
            "process_definition_id" => json!(self.process_definition_id),
            "definition_id" => json!(self.definition_id),
            "container_id" => json!(self.container_id),
            "name" => json!(self.name),
            "node_type" => json!(self.node_type.as_str()),
            "state" => json!(self.state.as_str()),
            "state_category" => json!(self.state_category.as_str()),
            "token_ref_id" => json!(self.token_ref_id),
            "attached_to" => json!(self.attached_to),
            "loop_index" => json!(self.loop_index),
            "last_update" => json!(self.last_update),
            _ => return None,
        })
    }
}

impl Queryable for ProcessInstance {
    fn field(&self, name: &str) -> Option<Value> {
        Some(match name {
            "id" => json!(self.id),
            "definition_id" => json!(self.definition_id),
            "name" => json!(self.name),
            "state" => json!(self.state.as_str()),
            "state_category" => json!(self.state_category.as_str()),
            "start_date" => json!(self.start_date),
            "end_date" => json!(self.end_date),
            _ => return None,
        })
    }
}

impl Queryable for Token {
    fn field(&self, name: &str) -> Option<Value> {
        Some(match name {
            "id" => json!(self.id),
            "process_instance_id" => json!(self.process_instance_id),
            "ref_id" => json!(self.ref_id),
            "parent_ref_id" => json!(self.parent_ref_id),
            _ => return None,
        })
    }
}

impl Queryable for WaitingEvent {
    fn field(&self, name: &str) -> Option<Value> {
        Some(match name {
            "id" => json!(self.id),
            "event_type" => json!(self.event_type),
            "kind" => json!(self.kind),
            "process_definition_id" => json!(self.process_definition_id),
            "process_name" => json!(self.process_name),
            "process_instance_id" => json!(self.process_instance_id),
            "flow_node_instance_id" => json!(self.flow_node_instance_id),
            "flow_node_name" => json!(self.flow_node_name),
            "message_name" => json!(self.message_name),
            "job_id" => json!(self.job_id),
            "due_at" => json!(self.due_at),
            "active" => json!(self.active),
            _ => return None,
        })
    }
}
