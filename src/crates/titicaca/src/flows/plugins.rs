//! Import plugins, resolved by the names listed in
//! `image_import.image_import_plugins`

use super::convert::ConvertImage;
use super::inject_metadata::InjectMetadataProperties;
use super::introspect::Introspect;
use super::no_op::NoOp;
use super::{step_name, FlowStep, FlowServices, ImportActionWrapper};
use crate::context::RequestContext;
use crate::error::{Result, TiticacaError};
use crate::models::Task;
use std::sync::Arc;

pub const KNOWN_PLUGINS: &[&str] = &["introspect", "image_conversion", "inject_image_metadata", "no_op"];

/// Build one step per configured plugin, in configuration order
pub fn get_import_plugins(
    names: &[String],
    task: &Task,
    context: &RequestContext,
    wrapper: &Arc<ImportActionWrapper>,
    services: &FlowServices,
) -> Result<Vec<Arc<dyn FlowStep>>> {
    names
        .iter()
        .map(|name| build_plugin(name, task, context, wrapper, services))
        .collect()
}

fn build_plugin(
    plugin: &str,
    task: &Task,
    context: &RequestContext,
    wrapper: &Arc<ImportActionWrapper>,
    services: &FlowServices,
) -> Result<Arc<dyn FlowStep>> {
    let task_type = task.task_type.as_str();
    let step: Arc<dyn FlowStep> = match plugin {
        "introspect" => Arc::new(Introspect::new(
            step_name(task_type, "Introspect", &task.id),
            wrapper.clone(),
            services.inspector.clone(),
        )),
        "image_conversion" => Arc::new(ConvertImage::new(
            step_name(task_type, "ConvertImage", &task.id),
            wrapper.clone(),
            services.inspector.clone(),
            &services.config.image_conversion,
            &services.config.image_format,
        )),
        "inject_image_metadata" => Arc::new(InjectMetadataProperties::new(
            step_name(task_type, "InjectMetadataProperties", &task.id),
            wrapper.clone(),
            context.clone(),
            services.policy.clone(),
            services.config.inject_metadata_properties.clone(),
        )),
        "no_op" => Arc::new(NoOp::new(step_name(task_type, "Noop", &task.id))),
        other => {
            return Err(TiticacaError::BadTaskConfiguration(format!(
                "unknown import plugin {} (known: {})",
                other,
                KNOWN_PLUGINS.join(", ")
            )))
        }
    };
    Ok(step)
}
