//! Process-instance execution core for BPMN processes.
//!
//! The [`engine::ProcessEngine`] façade drives flow nodes through their state
//! machine, merges gateways by counting tokens, runs multi-instance and loop
//! activities and correlates messages, timers and boundary events against
//! running instances. Every collaborator is injected through a
//! [`context::ProcessEngineContext`].

pub mod authoring;
pub mod config;
pub mod connector;
pub mod context;
pub mod correlation;
pub mod definition;
pub mod engine;
pub mod error;
pub mod events;
pub mod expression;
pub mod flow_node;
pub mod gateway;
pub mod lock;
pub mod logging;
pub mod multi_instance;
pub mod process;
pub mod query;
pub mod scheduler;
pub mod store;
pub mod store_memory;
pub mod token;
pub mod types;

pub use engine::ProcessEngine;
pub use error::{EngineError, Result};
