use crate::config::EngineConfig;
use crate::connector::{ConnectorExecutor, ConnectorRegistry};
use crate::error::{EngineError, Result};
use crate::expression::{DefaultExpressionResolver, ExpressionResolver};
use crate::lock::LockService;
use crate::scheduler::{MemoryScheduler, TimerScheduler};
use crate::store::{ArchiveStore, Deployment, ProcessStore};
use crate::store_memory::{MemoryArchive, MemoryStore};
use crate::types::ProcessDefinitionId;
use std::sync::Arc;

/// Collaborators shared by every engine component. Built once and handed to
/// each component constructor.
#[derive(Clone)]
pub struct ProcessEngineContext {
    pub store: Arc<dyn ProcessStore>,
    pub archive: Arc<dyn ArchiveStore>,
    pub expressions: Arc<dyn ExpressionResolver>,
    pub connectors: Arc<dyn ConnectorExecutor>,
    pub scheduler: Arc<dyn TimerScheduler>,
    pub locks: Arc<LockService>,
    pub config: Arc<EngineConfig>,
}

impl ProcessEngineContext {
    pub fn new(
        store: Arc<dyn ProcessStore>,
        archive: Arc<dyn ArchiveStore>,
        connectors: Arc<dyn ConnectorExecutor>,
        scheduler: Arc<dyn TimerScheduler>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            archive,
            expressions: Arc::new(DefaultExpressionResolver),
            connectors,
            scheduler,
            locks: Arc::new(LockService::new(config.lock_prune_threshold)),
            config: Arc::new(config),
        }
    }

    /// Memory store, memory archive, memory scheduler and no connectors.
    pub fn in_memory(config: EngineConfig) -> Self {
        let connectors = Arc::new(ConnectorRegistry::new(config.connector_timeout_ms));
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryArchive::new()),
            connectors,
            Arc::new(MemoryScheduler::new()),
            config,
        )
    }

    pub fn with_connectors(mut self, connectors: Arc<dyn ConnectorExecutor>) -> Self {
        self.connectors = connectors;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn TimerScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_expressions(mut self, expressions: Arc<dyn ExpressionResolver>) -> Self {
        self.expressions = expressions;
        self
    }

    pub(crate) async fn deployment(&self, id: ProcessDefinitionId) -> Result<Deployment> {
        self.store
            .load_deployment(id)
            .await?
            .ok_or_else(|| EngineError::not_found("process definition", id))
    }
}
