//! Flow engines
//!
//! Both engines run steps one after another in declared order. The serial
//! engine executes each step on the calling task. The parallel engine hands
//! each step to a tokio worker bounded by a semaphore, so long downloads
//! and tool invocations of concurrent flows share a fixed pool.

use crate::config::{EngineMode, ExecutorConfig};
use crate::error::{Result, TiticacaError};
use crate::flows::{Flow, FlowContext, FlowStep, StepOutcome};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub enum Engine {
    Serial,
    Parallel { workers: Arc<Semaphore> },
}

impl Engine {
    pub fn serial() -> Self {
        Engine::Serial
    }

    pub fn parallel(max_workers: usize) -> Self {
        Engine::Parallel {
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        match config.engine_mode {
            EngineMode::Serial => Self::serial(),
            EngineMode::Parallel => Self::parallel(config.max_workers),
        }
    }

    pub fn mode(&self) -> EngineMode {
        match self {
            Engine::Serial => EngineMode::Serial,
            Engine::Parallel { .. } => EngineMode::Parallel,
        }
    }

    async fn execute_step(
        &self,
        step: &Arc<dyn FlowStep>,
        ctx: &Arc<FlowContext>,
    ) -> Result<Option<Value>> {
        match self {
            Engine::Serial => step.execute(ctx).await,
            Engine::Parallel { workers } => {
                let permit = workers
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| TiticacaError::Other(format!("worker pool closed: {}", e)))?;
                let step = step.clone();
                let ctx = ctx.clone();
                let handle = tokio::spawn(async move {
                    let _permit = permit;
                    step.execute(&ctx).await
                });
                handle
                    .await
                    .map_err(|e| TiticacaError::Other(format!("flow step panicked: {}", e)))?
            }
        }
    }

    async fn revert_step(&self, step: &Arc<dyn FlowStep>, ctx: &FlowContext, outcome: StepOutcome) {
        debug!(step = step.name(), failed = outcome.is_failure(), "Reverting step");
        if let Err(e) = step.revert(ctx, &outcome).await {
            warn!(step = step.name(), error = %e, "Revert failed");
        }
    }

    /// Run every step; on failure revert the failed step and then the
    /// completed ones in reverse before returning the original error.
    /// The result is the last value any step produced.
    pub async fn run(&self, flow: &Flow) -> Result<Value> {
        let ctx = flow.context();
        let mut completed: Vec<(Arc<dyn FlowStep>, Option<Value>)> = Vec::new();
        let mut result = Value::Null;

        info!(flow = flow.name(), steps = flow.steps().len(), mode = ?self.mode(), "Running flow");

        for step in flow.steps() {
            debug!(step = step.name(), "Executing step");
            match self.execute_step(step, ctx).await {
                Ok(value) => {
                    if let Some(v) = &value {
                        result = v.clone();
                    }
                    completed.push((step.clone(), value));
                }
                Err(e) => {
                    error!(flow = flow.name(), step = step.name(), error = %e, "Step failed");
                    self.revert_step(step, ctx, StepOutcome::Failed(e.to_string()))
                        .await;
                    for (done, value) in completed.into_iter().rev() {
                        self.revert_step(&done, ctx, StepOutcome::Completed(value))
                            .await;
                    }
                    return Err(e);
                }
            }
        }

        info!(flow = flow.name(), "Flow finished");
        Ok(result)
    }
}
