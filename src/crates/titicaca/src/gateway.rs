//! Composition root for repositories
//!
//! The bare repositories get wrapped, innermost first, by the layers in
//! [`IMAGE_LAYERS`] / [`TASK_LAYERS`]. The policy layer is only applied
//! when the caller asks for the authorization layer; maintenance workers
//! and flows acting for the service skip it.

use crate::config::QuotaConfig;
use crate::context::RequestContext;
use crate::error::{Result, TiticacaError};
use crate::models::{Image, Task};
use crate::notifier::{emit, LoggingNotifier, Notification, Notifier};
use crate::policy::{Policy, RolePolicy};
use crate::repositories::{ImageRepository, TaskRepository};
use async_trait::async_trait;
use std::sync::Arc;

/// One wrapper in the repository pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoLayer {
    Quota,
    Policy,
    Notifier,
}

/// Image repository layers, innermost first
pub const IMAGE_LAYERS: &[RepoLayer] = &[RepoLayer::Quota, RepoLayer::Policy, RepoLayer::Notifier];

/// Task repository layers, innermost first
pub const TASK_LAYERS: &[RepoLayer] = &[RepoLayer::Policy, RepoLayer::Notifier];

#[derive(Clone)]
pub struct Gateway {
    images: Arc<dyn ImageRepository>,
    tasks: Arc<dyn TaskRepository>,
    notifier: Arc<dyn Notifier>,
    policy: Arc<dyn Policy>,
    quota: QuotaConfig,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    /// Layers that `image_repo` applies, innermost first
    pub fn image_layers(authorization_layer: bool) -> Vec<RepoLayer> {
        Self::active_layers(IMAGE_LAYERS, authorization_layer)
    }

    /// Layers that `task_repo` applies, innermost first
    pub fn task_layers(authorization_layer: bool) -> Vec<RepoLayer> {
        Self::active_layers(TASK_LAYERS, authorization_layer)
    }

    fn active_layers(layers: &[RepoLayer], authorization_layer: bool) -> Vec<RepoLayer> {
        layers
            .iter()
            .copied()
            .filter(|l| authorization_layer || *l != RepoLayer::Policy)
            .collect()
    }

    pub fn image_repo(
        &self,
        ctx: &RequestContext,
        authorization_layer: bool,
    ) -> Arc<dyn ImageRepository> {
        Self::image_layers(authorization_layer)
            .into_iter()
            .fold(
                self.images.clone(),
                |inner, layer| -> Arc<dyn ImageRepository> {
                    match layer {
                        RepoLayer::Quota => Arc::new(QuotaImageRepo {
                            inner,
                            quota: self.quota.clone(),
                        }),
                        RepoLayer::Policy => Arc::new(PolicyImageRepo {
                            inner,
                            policy: self.policy.clone(),
                            ctx: ctx.clone(),
                        }),
                        RepoLayer::Notifier => Arc::new(NotifyingImageRepo {
                            inner,
                            notifier: self.notifier.clone(),
                        }),
                    }
                },
            )
    }

    pub fn task_repo(
        &self,
        ctx: &RequestContext,
        authorization_layer: bool,
    ) -> Arc<dyn TaskRepository> {
        Self::task_layers(authorization_layer)
            .into_iter()
            .fold(
                self.tasks.clone(),
                |inner, layer| -> Arc<dyn TaskRepository> {
                    match layer {
                        RepoLayer::Policy => Arc::new(PolicyTaskRepo {
                            inner,
                            policy: self.policy.clone(),
                            ctx: ctx.clone(),
                        }),
                        RepoLayer::Notifier => Arc::new(NotifyingTaskRepo {
                            inner,
                            notifier: self.notifier.clone(),
                        }),
                        RepoLayer::Quota => inner,
                    }
                },
            )
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        self.notifier.clone()
    }

    pub fn policy(&self) -> Arc<dyn Policy> {
        self.policy.clone()
    }
}

#[derive(Default)]
pub struct GatewayBuilder {
    images: Option<Arc<dyn ImageRepository>>,
    tasks: Option<Arc<dyn TaskRepository>>,
    notifier: Option<Arc<dyn Notifier>>,
    policy: Option<Arc<dyn Policy>>,
    quota: QuotaConfig,
}

impl GatewayBuilder {
    pub fn images(mut self, repo: Arc<dyn ImageRepository>) -> Self {
        self.images = Some(repo);
        self
    }

    pub fn tasks(mut self, repo: Arc<dyn TaskRepository>) -> Self {
        self.tasks = Some(repo);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn quota(mut self, quota: QuotaConfig) -> Self {
        self.quota = quota;
        self
    }

    pub fn build(self) -> Result<Gateway> {
        let images = self
            .images
            .ok_or_else(|| TiticacaError::Config("gateway needs an image repository".to_string()))?;
        let tasks = self
            .tasks
            .ok_or_else(|| TiticacaError::Config("gateway needs a task repository".to_string()))?;

        Ok(Gateway {
            images,
            tasks,
            notifier: self.notifier.unwrap_or_else(|| Arc::new(LoggingNotifier)),
            policy: self.policy.unwrap_or_else(|| Arc::new(RolePolicy::new())),
            quota: self.quota,
        })
    }
}

struct QuotaImageRepo {
    inner: Arc<dyn ImageRepository>,
    quota: QuotaConfig,
}

impl QuotaImageRepo {
    fn check(&self, image: &Image) -> Result<()> {
        if image.extra_properties.len() > self.quota.image_property_quota {
            return Err(TiticacaError::LimitExceeded(format!(
                "image {} has {} properties, quota is {}",
                image.id,
                image.extra_properties.len(),
                self.quota.image_property_quota
            )));
        }
        if image.locations.len() > self.quota.image_location_quota {
            return Err(TiticacaError::LimitExceeded(format!(
                "image {} has {} locations, quota is {}",
                image.id,
                image.locations.len(),
                self.quota.image_location_quota
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ImageRepository for QuotaImageRepo {
    async fn add(&self, image: &Image) -> Result<Image> {
        self.check(image)?;
        self.inner.add(image).await
    }

    async fn get(&self, image_id: &str) -> Result<Image> {
        self.inner.get(image_id).await
    }

    async fn list(&self) -> Result<Vec<Image>> {
        self.inner.list().await
    }

    async fn save(&self, image: &Image) -> Result<Image> {
        self.check(image)?;
        self.inner.save(image).await
    }

    async fn remove(&self, image_id: &str) -> Result<()> {
        self.inner.remove(image_id).await
    }
}

fn enforce(policy: &dyn Policy, ctx: &RequestContext, action: &str) -> Result<()> {
    if policy.enforce(ctx, action) {
        Ok(())
    } else {
        Err(TiticacaError::Forbidden(format!("{} is not allowed", action)))
    }
}

struct PolicyImageRepo {
    inner: Arc<dyn ImageRepository>,
    policy: Arc<dyn Policy>,
    ctx: RequestContext,
}

#[async_trait]
impl ImageRepository for PolicyImageRepo {
    async fn add(&self, image: &Image) -> Result<Image> {
        enforce(self.policy.as_ref(), &self.ctx, "add_image")?;
        self.inner.add(image).await
    }

    async fn get(&self, image_id: &str) -> Result<Image> {
        enforce(self.policy.as_ref(), &self.ctx, "get_image")?;
        self.inner.get(image_id).await
    }

    async fn list(&self) -> Result<Vec<Image>> {
        enforce(self.policy.as_ref(), &self.ctx, "get_images")?;
        self.inner.list().await
    }

    async fn save(&self, image: &Image) -> Result<Image> {
        enforce(self.policy.as_ref(), &self.ctx, "modify_image")?;
        self.inner.save(image).await
    }

    async fn remove(&self, image_id: &str) -> Result<()> {
        enforce(self.policy.as_ref(), &self.ctx, "delete_image")?;
        self.inner.remove(image_id).await
    }
}

struct NotifyingImageRepo {
    inner: Arc<dyn ImageRepository>,
    notifier: Arc<dyn Notifier>,
}

#[async_trait]
impl ImageRepository for NotifyingImageRepo {
    async fn add(&self, image: &Image) -> Result<Image> {
        let added = self.inner.add(image).await?;
        emit(self.notifier.as_ref(), Notification::image_created(&added));
        Ok(added)
    }

    async fn get(&self, image_id: &str) -> Result<Image> {
        self.inner.get(image_id).await
    }

    async fn list(&self) -> Result<Vec<Image>> {
        self.inner.list().await
    }

    async fn save(&self, image: &Image) -> Result<Image> {
        let saved = self.inner.save(image).await?;
        emit(self.notifier.as_ref(), Notification::image_updated(&saved));
        Ok(saved)
    }

    async fn remove(&self, image_id: &str) -> Result<()> {
        self.inner.remove(image_id).await?;
        emit(self.notifier.as_ref(), Notification::image_deleted(image_id));
        Ok(())
    }
}

struct PolicyTaskRepo {
    inner: Arc<dyn TaskRepository>,
    policy: Arc<dyn Policy>,
    ctx: RequestContext,
}

#[async_trait]
impl TaskRepository for PolicyTaskRepo {
    async fn add(&self, task: &Task) -> Result<()> {
        enforce(self.policy.as_ref(), &self.ctx, "add_task")?;
        self.inner.add(task).await
    }

    async fn get(&self, task_id: &str) -> Result<Task> {
        enforce(self.policy.as_ref(), &self.ctx, "get_task")?;
        self.inner.get(task_id).await
    }

    async fn save(&self, task: &Task) -> Result<()> {
        enforce(self.policy.as_ref(), &self.ctx, "modify_task")?;
        self.inner.save(task).await
    }

    async fn list(&self) -> Result<Vec<Task>> {
        enforce(self.policy.as_ref(), &self.ctx, "get_tasks")?;
        self.inner.list().await
    }

    async fn remove(&self, task_id: &str) -> Result<()> {
        enforce(self.policy.as_ref(), &self.ctx, "delete_task")?;
        self.inner.remove(task_id).await
    }
}

struct NotifyingTaskRepo {
    inner: Arc<dyn TaskRepository>,
    notifier: Arc<dyn Notifier>,
}

#[async_trait]
impl TaskRepository for NotifyingTaskRepo {
    async fn add(&self, task: &Task) -> Result<()> {
        self.inner.add(task).await?;
        emit(self.notifier.as_ref(), Notification::task_created(task));
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Task> {
        self.inner.get(task_id).await
    }

    async fn save(&self, task: &Task) -> Result<()> {
        self.inner.save(task).await?;
        emit(self.notifier.as_ref(), Notification::task_status_changed(task));
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Task>> {
        self.inner.list().await
    }

    async fn remove(&self, task_id: &str) -> Result<()> {
        self.inner.remove(task_id).await
    }
}
