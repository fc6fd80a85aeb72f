//! Task type → flow factory lookup

use super::{api_import, legacy_import, Flow, FlowServices};
use crate::context::RequestContext;
use crate::error::{Result, TiticacaError};
use crate::models::{Task, TaskType};
use std::collections::HashMap;
use tracing::{debug, error};

/// Everything a factory may look at to build a flow
pub struct FlowRequest<'a> {
    pub task: &'a Task,
    pub context: &'a RequestContext,
    pub services: &'a FlowServices,
}

pub type FlowFactory = fn(&FlowRequest<'_>) -> Result<Flow>;

#[derive(Clone)]
pub struct FlowRegistry {
    factories: HashMap<TaskType, FlowFactory>,
}

impl Default for FlowRegistry {
    fn default() -> Self {
        Self::new()
            .with(TaskType::Import, legacy_import::get_flow)
            .with(TaskType::ApiImageImport, api_import::get_flow)
    }
}

impl FlowRegistry {
    /// A registry with nothing registered
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with(mut self, task_type: TaskType, factory: FlowFactory) -> Self {
        self.register(task_type, factory);
        self
    }

    pub fn register(&mut self, task_type: TaskType, factory: FlowFactory) {
        self.factories.insert(task_type, factory);
    }

    pub fn contains(&self, task_type: TaskType) -> bool {
        self.factories.contains_key(&task_type)
    }

    pub fn build(&self, req: &FlowRequest<'_>) -> Result<Flow> {
        let task_type = req.task.task_type;
        let factory = self.factories.get(&task_type).ok_or_else(|| {
            error!(task_id = %req.task.id, task_type = %task_type, "No flow registered for task type");
            TiticacaError::BadTaskConfiguration(format!(
                "no flow is registered for task type {}",
                task_type
            ))
        })?;

        let flow = factory(req)?;
        debug!(
            task_id = %req.task.id,
            flow = flow.name(),
            steps = ?flow.step_names(),
            "Built flow"
        );
        Ok(flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_covers_all_types() {
        let registry = FlowRegistry::default();
        assert!(registry.contains(TaskType::Import));
        assert!(registry.contains(TaskType::ApiImageImport));
        assert!(!FlowRegistry::new().contains(TaskType::Import));
    }
}
