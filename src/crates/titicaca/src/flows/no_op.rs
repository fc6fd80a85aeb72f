//! Import plugin that does nothing

use super::{FlowContext, FlowStep, StepOutcome};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

pub struct NoOp {
    name: String,
}

impl NoOp {
    pub fn new(name: String) -> Self {
        Self { name }
    }
}

#[async_trait]
impl FlowStep for NoOp {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &FlowContext) -> Result<Option<Value>> {
        debug!("No_op import plugin");
        Ok(None)
    }

    async fn revert(&self, _ctx: &FlowContext, outcome: &StepOutcome) -> Result<()> {
        if outcome.is_failure() {
            debug!("No_op import plugin failed");
        }
        Ok(())
    }
}
