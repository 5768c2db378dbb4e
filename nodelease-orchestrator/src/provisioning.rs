use nodelease_common::{LabelExpr, NodeError, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cloud::{CloudAccount, CloudRegistry, Reservation};
use crate::lifecycle::NodeLifecycleManager;
use crate::node::Node;
use crate::template::Template;

/// One accepted unit of demand. Resolves to a connected node or the error its
/// boot/connect sequence produced.
pub struct PendingNode {
    pub cloud_id: String,
    pub template_id: String,
    pub executors: u32,
    handle: JoinHandle<Result<Arc<Node>>>,
}

impl PendingNode {
    pub async fn wait(self) -> Result<Arc<Node>> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(NodeError::Internal(format!("provisioning task failed: {}", e))),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Turns labelled demand into pending nodes, bounded by each cloud's cap and
/// executed on a fixed-size worker pool.
pub struct ProvisioningScheduler {
    clouds: Arc<CloudRegistry>,
    lifecycle: Arc<NodeLifecycleManager>,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl ProvisioningScheduler {
    pub fn new(
        clouds: Arc<CloudRegistry>,
        lifecycle: Arc<NodeLifecycleManager>,
        pool_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            clouds,
            lifecycle,
            workers: Arc::new(Semaphore::new(pool_size.max(1))),
            cancel,
        }
    }

    pub fn clouds(&self) -> &Arc<CloudRegistry> {
        &self.clouds
    }

    pub fn lifecycle(&self) -> &Arc<NodeLifecycleManager> {
        &self.lifecycle
    }

    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Provision on one cloud. A malformed expression fails synchronously; no
    /// matching template yields an empty list.
    pub async fn provision(&self, cloud_id: &str, label_expression: &str, workload: u32) -> Result<Vec<PendingNode>> {
        let expr = LabelExpr::parse(label_expression)?;
        let cloud = self.clouds.get(cloud_id)?;
        let Some(template) = cloud.templates.match_label(&expr) else {
            debug!(cloud = %cloud.id, label = %expr, "[provisioning] no matching template");
            return Ok(Vec::new());
        };
        self.provision_with(&cloud, &template, workload).await
    }

    /// Provision on the first cloud, in declaration order, with a matching template.
    pub async fn provision_any(&self, label_expression: &str, workload: u32) -> Result<Vec<PendingNode>> {
        let expr = LabelExpr::parse(label_expression)?;
        let Some((cloud, template)) = self.clouds.first_matching(&expr) else {
            debug!(label = %expr, "[provisioning] no cloud can provision");
            return Ok(Vec::new());
        };
        self.provision_with(&cloud, &template, workload).await
    }

    /// One node from an explicit template. `None` when the cloud is at its cap.
    pub async fn provision_template(&self, cloud_id: &str, template_id: &str) -> Result<Option<PendingNode>> {
        let cloud = self.clouds.get(cloud_id)?;
        let template = cloud
            .templates
            .by_id(template_id)
            .ok_or_else(|| NodeError::TemplateNotFound(template_id.to_string()))?;
        Ok(self.provision_with(&cloud, &template, 1).await?.pop())
    }

    async fn provision_with(
        &self,
        cloud: &Arc<CloudAccount>,
        template: &Arc<Template>,
        mut workload: u32,
    ) -> Result<Vec<PendingNode>> {
        let mut accepted = Vec::new();

        while workload > 0 {
            let count = match cloud.current_instance_count().await {
                Ok(c) => c,
                Err(e) if accepted.is_empty() => return Err(e),
                Err(e) => {
                    warn!(
                        cloud = %cloud.id,
                        accepted = accepted.len(),
                        error = %e,
                        "[provisioning] instance count failed, truncating workload"
                    );
                    break;
                }
            };
            if cloud.at_capacity(count) {
                info!(
                    cloud = %cloud.id,
                    current = count,
                    cap = cloud.instance_cap,
                    dropped = workload,
                    "[provisioning] instance cap reached"
                );
                break;
            }

            let reservation = cloud.reserve();
            accepted.push(self.submit(cloud.clone(), template.clone(), reservation));
            workload -= 1;
        }

        if !accepted.is_empty() {
            info!(
                cloud = %cloud.id,
                template = %template.id,
                accepted = accepted.len(),
                "[provisioning] units submitted"
            );
        }
        Ok(accepted)
    }

    fn submit(&self, cloud: Arc<CloudAccount>, template: Arc<Template>, reservation: Reservation) -> PendingNode {
        let lifecycle = self.lifecycle.clone();
        let workers = self.workers.clone();
        let cancel = self.cancel.clone();
        let cloud_id = cloud.id.clone();
        let template_id = template.id.clone();
        let executors = template.executors;

        let handle = tokio::spawn(async move {
            let _permit = tokio::select! {
                _ = cancel.cancelled() => return Err(NodeError::Cancelled),
                permit = workers.acquire_owned() => permit
                    .map_err(|_| NodeError::Internal("worker pool closed".to_string()))?,
            };
            let node = {
                let _reservation = reservation;
                lifecycle.boot(&cloud, &template).await?
            };
            lifecycle.activate(&node, &cancel).await?;
            Ok::<_, NodeError>(node)
        });

        PendingNode {
            cloud_id,
            template_id,
            executors,
            handle,
        }
    }
}
