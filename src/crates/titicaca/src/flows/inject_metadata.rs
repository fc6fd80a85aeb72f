//! Merge operator-configured properties into imported images

use super::{FlowContext, FlowStep, ImportActionWrapper};
use crate::config::InjectMetadataConfig;
use crate::context::RequestContext;
use crate::error::Result;
use crate::policy::Policy;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Policy action consulted before injecting
pub const INJECT_ACTION: &str = "inject_image_metadata";

pub struct InjectMetadataProperties {
    name: String,
    wrapper: Arc<ImportActionWrapper>,
    context: RequestContext,
    policy: Arc<dyn Policy>,
    config: InjectMetadataConfig,
}

impl InjectMetadataProperties {
    pub fn new(
        name: String,
        wrapper: Arc<ImportActionWrapper>,
        context: RequestContext,
        policy: Arc<dyn Policy>,
        config: InjectMetadataConfig,
    ) -> Self {
        Self {
            name,
            wrapper,
            context,
            policy,
            config,
        }
    }

    fn skipped(&self) -> bool {
        self.context.has_any_role(&self.config.ignore_user_roles)
            || !self.policy.enforce(&self.context, INJECT_ACTION)
    }
}

#[async_trait]
impl FlowStep for InjectMetadataProperties {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &FlowContext) -> Result<Option<Value>> {
        if self.skipped() {
            debug!(step = %self.name, "Caller is exempt from metadata injection");
            return Ok(None);
        }
        if self.config.inject.is_empty() {
            return Ok(None);
        }

        let props = self.config.inject.clone();
        self.wrapper
            .apply(move |action| action.set_image_extra_properties(props))
            .await?;
        debug!(
            image_id = %self.wrapper.image_id(),
            count = self.config.inject.len(),
            "Injected image properties"
        );
        Ok(None)
    }
}
