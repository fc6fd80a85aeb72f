//! Drives one task from `pending` to a terminal status

use super::engine::Engine;
use crate::context::RequestContext;
use crate::error::Result;
use crate::flows::{FlowRegistry, FlowRequest, FlowServices};
use crate::models::Task;
use crate::repositories::TaskRepository;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info};

/// Runs tasks on behalf of one caller
pub struct TaskExecutor {
    context: RequestContext,
    tasks: Arc<dyn TaskRepository>,
    services: FlowServices,
    registry: Arc<FlowRegistry>,
    engine: Engine,
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("context", &self.context)
            .field("engine", &self.engine.mode())
            .finish()
    }
}

impl TaskExecutor {
    pub fn new(
        context: RequestContext,
        tasks: Arc<dyn TaskRepository>,
        services: FlowServices,
        registry: Arc<FlowRegistry>,
        engine: Engine,
    ) -> Self {
        Self {
            context,
            tasks,
            services,
            registry,
            engine,
        }
    }

    /// Run a pending task to completion
    ///
    /// The task ends in `success` with the flow result, or in `failure`
    /// with the error message, in which case the error is also returned.
    /// Reverts have already run by the time the failure is recorded.
    pub async fn begin_processing(&self, task_id: &str) -> Result<Task> {
        let mut task = self.tasks.get(task_id).await?;
        task.begin()?;
        self.tasks.save(&task).await?;

        info!(task_id = %task.id, task_type = %task.task_type, "Task processing started");

        let outcome = self.run_flow(&task).await;
        self.finish(task, outcome).await
    }

    async fn run_flow(&self, task: &Task) -> Result<Value> {
        let flow = self.registry.build(&FlowRequest {
            task,
            context: &self.context,
            services: &self.services,
        })?;
        self.engine.run(&flow).await
    }

    async fn finish(&self, mut task: Task, outcome: Result<Value>) -> Result<Task> {
        match outcome {
            Ok(result) => {
                task.succeed(result)?;
                self.tasks.save(&task).await?;
                info!(task_id = %task.id, "Task succeeded");
                Ok(task)
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Task failed");
                task.fail(e.to_string())?;
                self.tasks.save(&task).await?;
                Err(e)
            }
        }
    }
}
