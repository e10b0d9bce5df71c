use crate::error::{EngineError, Result};
use crate::types::DataMap;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// An external integration invoked on flow-node entry or exit.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn execute(&self, inputs: DataMap) -> anyhow::Result<DataMap>;
}

/// Adapter running a closure as a [`Connector`].
pub struct FnConnector<F>(pub F);

impl<F> FnConnector<F>
where
    F: Fn(DataMap) -> anyhow::Result<DataMap> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Connector for FnConnector<F>
where
    F: Fn(DataMap) -> anyhow::Result<DataMap> + Send + Sync,
{
    async fn execute(&self, inputs: DataMap) -> anyhow::Result<DataMap> {
        (self.0)(inputs)
    }
}

/// Runs connectors by id on behalf of the engine.
#[async_trait]
pub trait ConnectorExecutor: Send + Sync {
    async fn execute(&self, connector_id: &str, inputs: DataMap) -> Result<DataMap>;
}

/// Connectors registered by id, each call bounded by a timeout.
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
    timeout: Duration,
}

impl ConnectorRegistry {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            connectors: HashMap::new(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    pub fn register(mut self, id: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        self.connectors.insert(id.into(), connector);
        self
    }
}

#[async_trait]
impl ConnectorExecutor for ConnectorRegistry {
    async fn execute(&self, connector_id: &str, inputs: DataMap) -> Result<DataMap> {
        let connector = self.connectors.get(connector_id).ok_or_else(|| {
            EngineError::ConnectorExecution {
                connector: connector_id.to_string(),
                message: "not registered".to_string(),
            }
        })?;
        match tokio::time::timeout(self.timeout, connector.execute(inputs)).await {
            Ok(Ok(outputs)) => Ok(outputs),
            Ok(Err(e)) => Err(EngineError::ConnectorExecution {
                connector: connector_id.to_string(),
                message: format!("{e:#}"),
            }),
            Err(_) => Err(EngineError::ConnectorExecution {
                connector: connector_id.to_string(),
                message: format!("timed out after {} ms", self.timeout.as_millis()),
            }),
        }
    }
}
