//! Stand-in handlers for task types whose executors live outside this crate.

use async_trait::async_trait;
use tracing::info;

use crate::domain::models::TaskRecord;
use crate::services::task_worker::TaskHandler;

/// Logs the task and reports success.
///
/// Lets `worker run` drain `llm_callback` or `script_execution` rows when no
/// real executor is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOnlyHandler;

#[async_trait]
impl TaskHandler for LogOnlyHandler {
    async fn handle(&self, task: &TaskRecord) -> anyhow::Result<()> {
        info!(
            task_id = %task.task_id,
            task_type = %task.task_type,
            retry_count = task.retry_count,
            payload = %task.payload,
            "Task handled (log only)"
        );
        Ok(())
    }
}
