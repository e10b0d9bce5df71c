use crate::error::Result;
use crate::types::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// A timer registered with the scheduler. The scheduler calls back into
/// `ProcessEngine::fire_timer` with `job_id` once `due_at` passed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerJob {
    pub job_id: String,
    pub process_definition_id: ProcessDefinitionId,
    pub flow_node_definition_id: FlowNodeDefId,
    /// Flow-node instance the timer belongs to; `None` for start events.
    pub discriminator: Option<InstanceId>,
    pub due_at: Timestamp,
}

/// Job id derived from the definition, the flow node and the instance.
pub fn timer_job_id(
    process_definition_id: ProcessDefinitionId,
    flow_node_definition_id: FlowNodeDefId,
    discriminator: Option<InstanceId>,
) -> String {
    match discriminator {
        Some(d) => format!("{process_definition_id}:{flow_node_definition_id}:{d}"),
        None => format!("{process_definition_id}:{flow_node_definition_id}:start"),
    }
}

#[async_trait]
pub trait TimerScheduler: Send + Sync {
    /// Schedule a job, replacing any job with the same id.
    async fn schedule(&self, job: TimerJob) -> Result<()>;
    /// Returns whether a job was removed.
    async fn cancel(&self, job_id: &str) -> Result<bool>;
}

/// Scheduler keeping jobs in memory. Jobs never fire by themselves; callers
/// poll [`MemoryScheduler::due_jobs`] and hand them to the engine.
#[derive(Default)]
pub struct MemoryScheduler {
    jobs: Mutex<BTreeMap<String, TimerJob>>,
}

impl MemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pending_jobs(&self) -> Vec<TimerJob> {
        self.jobs.lock().await.values().cloned().collect()
    }

    /// Jobs due at `now`, earliest first.
    pub async fn due_jobs(&self, now: Timestamp) -> Vec<TimerJob> {
        let mut due: Vec<TimerJob> = self
            .jobs
            .lock()
            .await
            .values()
            .filter(|j| j.due_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|j| j.due_at);
        due
    }
}

#[async_trait]
impl TimerScheduler for MemoryScheduler {
    async fn schedule(&self, job: TimerJob) -> Result<()> {
        self.jobs.lock().await.insert(job.job_id.clone(), job);
        Ok(())
    }

    async fn cancel(&self, job_id: &str) -> Result<bool> {
        Ok(self.jobs.lock().await.remove(job_id).is_some())
    }
}
