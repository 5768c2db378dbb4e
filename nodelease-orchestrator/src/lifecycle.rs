use chrono::Utc;
use nodelease_common::{NodeError, NodeState, Result};
use nodelease_providers::InstanceSnapshot;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cloud::CloudAccount;
use crate::connectivity::ConnectivityEstablisher;
use crate::launcher::{ControlChannel, LauncherRegistry};
use crate::logger::ActionLogger;
use crate::node::{Node, NodeTable};
use crate::retention::RetentionPolicy;
use crate::state_machine;
use crate::template::Template;

#[derive(Debug, Clone)]
pub struct LifecycleTiming {
    pub poll_interval: Duration,
    pub active_timeout: Duration,
}

impl Default for LifecycleTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            active_timeout: Duration::from_secs(600),
        }
    }
}

/// Result of `attach`. `inserted` is false when the instance already had a node.
#[derive(Debug, Clone)]
pub struct Attached {
    pub node: Arc<Node>,
    pub inserted: bool,
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Drives nodes from boot request to termination against their cloud's provider.
pub struct NodeLifecycleManager {
    launchers: LauncherRegistry,
    establisher: ConnectivityEstablisher,
    retention: Arc<dyn RetentionPolicy>,
    timing: LifecycleTiming,
    logger: Arc<ActionLogger>,
    nodes: Arc<NodeTable>,
}

impl NodeLifecycleManager {
    pub fn new(
        launchers: LauncherRegistry,
        establisher: ConnectivityEstablisher,
        retention: Arc<dyn RetentionPolicy>,
        timing: LifecycleTiming,
        logger: Arc<ActionLogger>,
        nodes: Arc<NodeTable>,
    ) -> Self {
        Self {
            launchers,
            establisher,
            retention,
            timing,
            logger,
            nodes,
        }
    }

    pub fn nodes(&self) -> &Arc<NodeTable> {
        &self.nodes
    }

    pub fn logger(&self) -> &Arc<ActionLogger> {
        &self.logger
    }

    pub fn launchers(&self) -> &LauncherRegistry {
        &self.launchers
    }

    pub fn retention(&self) -> Arc<dyn RetentionPolicy> {
        self.retention.clone()
    }

    fn new_node(&self, cloud: &Arc<CloudAccount>, template: &Arc<Template>, instance_id: &str) -> Node {
        Node::new(
            cloud.clone(),
            template.clone(),
            instance_id,
            self.launchers.for_os(template.os_family),
            self.retention.clone(),
            self.logger.clone(),
        )
    }

    /// Create the instance and register a node for it in `WaitingActive`.
    ///
    /// The node id derives from the instance id, so a failed create registers
    /// no node; the failure is only recorded in the `BOOT_INSTANCE` entry.
    pub async fn boot(&self, cloud: &Arc<CloudAccount>, template: &Arc<Template>) -> Result<Arc<Node>> {
        let started = Instant::now();
        let log_id = self.logger.log_event_with_metadata(
            "BOOT_INSTANCE",
            "in_progress",
            None,
            None,
            Some(serde_json::json!({ "cloud": cloud.id, "template": template.id })),
        );

        let created = async {
            let (image_ref, flavor_ref) = cloud.validate_template(template).await?;
            let request = template.create_request(image_ref, flavor_ref);
            cloud.provider.create_instance(&request).await
        }
        .await;

        let snapshot = match created {
            Ok(s) => s,
            Err(e) => {
                error!(cloud = %cloud.id, template = %template.id, error = %e, "[lifecycle] create failed");
                self.logger
                    .log_event_complete(log_id, "failed", elapsed_ms(started), Some(&e.to_string()));
                return Err(e);
            }
        };

        let node = self.new_node(cloud, template, &snapshot.id);
        {
            let mut inner = node.lock().await;
            inner.snapshot = Some(snapshot.clone());
            state_machine::transition(&node.id, &mut inner, NodeState::Booting, "create request sent", &self.logger)?;
            state_machine::transition(
                &node.id,
                &mut inner,
                NodeState::WaitingActive,
                "instance created",
                &self.logger,
            )?;
        }
        let node = self.nodes.insert(Arc::new(node)).await;

        info!(
            node = %node.id,
            cloud = %cloud.id,
            instance_id = %snapshot.id,
            "[lifecycle] instance created"
        );
        self.logger.log_event_complete_with_metadata(
            log_id,
            "success",
            elapsed_ms(started),
            None,
            Some(serde_json::json!({
                "cloud": cloud.id,
                "template": template.id,
                "node": node.id,
                "instance_id": snapshot.id,
            })),
        );
        Ok(node)
    }

    /// Wrap an existing provider instance. The template is found from the instance name.
    /// An instance that already has a node returns that node with `inserted` unset.
    pub async fn attach(&self, cloud: &Arc<CloudAccount>, instance_id: &str) -> Result<Attached> {
        let snapshot = cloud.provider.get_instance(instance_id).await?;
        let template = cloud
            .templates
            .by_instance_name(&snapshot.name)
            .ok_or_else(|| NodeError::TemplateNotFound(snapshot.name.clone()))?;

        let node = self.new_node(cloud, &template, &snapshot.id);
        if let Some(existing) = self.nodes.get(&node.id).await {
            return Ok(Attached {
                node: existing,
                inserted: false,
            });
        }
        node.adopt(NodeState::WaitingActive, "attached existing instance").await?;
        node.lock().await.snapshot = Some(snapshot);

        let candidate = Arc::new(node);
        let node = self.nodes.insert(candidate.clone()).await;
        if !Arc::ptr_eq(&node, &candidate) {
            return Ok(Attached { node, inserted: false });
        }

        info!(node = %node.id, cloud = %cloud.id, "[lifecycle] instance attached");
        self.logger.log_quick(
            "ATTACH_INSTANCE",
            &node.id,
            Some(serde_json::json!({ "cloud": cloud.id, "instance_id": instance_id })),
        );
        Ok(Attached { node, inserted: true })
    }

    /// Poll until the instance is active, errored, or the deadline passes.
    /// The node lock is only held for each refresh.
    pub async fn wait_for_active(&self, node: &Arc<Node>, cancel: &CancellationToken) -> Result<InstanceSnapshot> {
        let deadline = Instant::now() + self.timing.active_timeout;
        let provider = node.cloud.provider.clone();

        loop {
            {
                let mut inner = node.lock().await;
                let Some(instance_id) = inner.instance_ref.clone() else {
                    return Err(NodeError::NodeTerminated(node.id.clone()));
                };
                if inner.state != NodeState::WaitingActive {
                    return Err(NodeError::NodeTerminated(node.id.clone()));
                }

                match provider.get_instance(&instance_id).await {
                    Ok(snapshot) => {
                        let active = snapshot.is_active();
                        let errored = snapshot.is_error();
                        inner.snapshot = Some(snapshot.clone());
                        if active {
                            info!(node = %node.id, "[lifecycle] instance active");
                            return Ok(snapshot);
                        }
                        if errored {
                            state_machine::fail(&node.id, &mut inner, "instance reported error status", &self.logger);
                            return Err(NodeError::BootFailure { instance_id });
                        }
                    }
                    Err(e) if e.is_not_found() => {
                        state_machine::fail(&node.id, &mut inner, "instance vanished while booting", &self.logger);
                        return Err(e);
                    }
                    Err(e) => {
                        warn!(node = %node.id, error = %e, "[lifecycle] status poll failed, retrying");
                    }
                }

                if Instant::now() >= deadline {
                    state_machine::fail(&node.id, &mut inner, "timed out waiting for active", &self.logger);
                    return Err(NodeError::ActiveTimeout {
                        instance_id,
                        waited_secs: self.timing.active_timeout.as_secs(),
                    });
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(NodeError::Cancelled),
                _ = tokio::time::sleep(self.timing.poll_interval) => {}
            }
        }
    }

    /// Open the control channel; on success the node is `Idle` with its idle clock started.
    pub async fn connect(&self, node: &Arc<Node>, cancel: &CancellationToken) -> Result<ControlChannel> {
        let networks = {
            let mut inner = node.lock().await;
            state_machine::transition(&node.id, &mut inner, NodeState::Connecting, "instance active", &self.logger)?;
            inner
                .snapshot
                .as_ref()
                .map(|s| s.networks.clone())
                .unwrap_or_default()
        };

        let started = Instant::now();
        let log_id = self.logger.log_event("CONNECT_NODE", "in_progress", Some(&node.id), None);
        let outcome = self
            .establisher
            .connect(&node.id, &networks, node.launcher(), &node.template, cancel)
            .await;

        let mut inner = node.lock().await;
        match outcome {
            Ok(outcome) => {
                let metadata = serde_json::json!({
                    "address": outcome.channel.address,
                    "network": outcome.channel.network,
                    "protocol": outcome.channel.protocol,
                    "rounds": outcome.rounds,
                    "failed_attempts": outcome.failed_attempts,
                });
                // A terminate may have raced the connection attempt.
                if inner.state != NodeState::Connecting {
                    self.logger.log_event_complete_with_metadata(
                        log_id,
                        "failed",
                        elapsed_ms(started),
                        Some("node left connecting state"),
                        Some(metadata),
                    );
                    return Err(NodeError::NodeTerminated(node.id.clone()));
                }
                state_machine::transition(&node.id, &mut inner, NodeState::Connected, "control channel open", &self.logger)?;
                state_machine::transition(&node.id, &mut inner, NodeState::Idle, "no work assigned", &self.logger)?;
                inner.idle_since = Some(Utc::now());
                inner.channel = Some(outcome.channel.clone());
                self.logger.log_event_complete_with_metadata(
                    log_id,
                    "success",
                    elapsed_ms(started),
                    None,
                    Some(metadata),
                );
                Ok(outcome.channel)
            }
            Err(e) => {
                state_machine::fail(&node.id, &mut inner, "control channel failed", &self.logger);
                self.logger
                    .log_event_complete(log_id, "failed", elapsed_ms(started), Some(&e.to_string()));
                error!(node = %node.id, error = %e, "[lifecycle] connect failed");
                Err(e)
            }
        }
    }

    /// Wait for active then connect. Failed nodes have their instance released.
    pub async fn activate(&self, node: &Arc<Node>, cancel: &CancellationToken) -> Result<()> {
        let result = async {
            self.wait_for_active(node, cancel).await?;
            self.connect(node, cancel).await
        }
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                if node.state().await == NodeState::Error {
                    self.release(node).await;
                }
                Err(e)
            }
        }
    }

    /// Boot, wait for active and connect a node from `template`.
    pub async fn launch(
        &self,
        cloud: &Arc<CloudAccount>,
        template: &Arc<Template>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Node>> {
        let node = self.boot(cloud, template).await?;
        self.activate(&node, cancel).await?;
        Ok(node)
    }

    /// Best-effort instance cleanup for a node that failed to come up.
    async fn release(&self, node: &Arc<Node>) {
        if let Err(e) = self.terminate(node).await {
            warn!(node = %node.id, error = %e, "[lifecycle] release of failed node did not complete");
        }
    }

    /// Idempotent. Never calls the provider for a node without an instance reference.
    /// Templates with `stop_on_terminate` keep their instance: it is stopped, not deleted.
    pub async fn terminate(&self, node: &Arc<Node>) -> Result<()> {
        let mut inner = node.lock().await;

        let Some(instance_id) = inner.instance_ref.clone() else {
            if !inner.state.is_terminal() {
                state_machine::begin_termination(&node.id, &mut inner, "terminate requested", &self.logger);
                state_machine::complete_termination(&node.id, &mut inner, "no instance to delete", &self.logger);
            }
            drop(inner);
            self.nodes.remove(&node.id).await;
            return Ok(());
        };

        state_machine::begin_termination(&node.id, &mut inner, "terminate requested", &self.logger);
        let provider = node.cloud.provider.clone();
        let started = Instant::now();
        let log_id = self.logger.log_event_with_metadata(
            "TERMINATE_INSTANCE",
            "in_progress",
            Some(&node.id),
            None,
            Some(serde_json::json!({ "instance_id": instance_id, "cloud": node.cloud_id })),
        );

        let (released, outcome) = if node.stop_on_terminate {
            ("instance stopped", provider.stop_instance(&instance_id).await.map(|_| ()))
        } else {
            ("instance deleted", provider.delete_instance(&instance_id).await)
        };
        match outcome {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                info!(node = %node.id, "[lifecycle] instance already gone");
            }
            Err(e) => {
                error!(node = %node.id, error = %e, released = released, "[lifecycle] release failed");
                self.logger
                    .log_event_complete(log_id, "failed", elapsed_ms(started), Some(&e.to_string()));
                return Err(e);
            }
        }

        inner.instance_ref = None;
        inner.snapshot = None;
        inner.channel = None;
        inner.idle_since = None;
        state_machine::complete_termination(&node.id, &mut inner, released, &self.logger);
        drop(inner);

        self.nodes.remove(&node.id).await;
        self.logger
            .log_event_complete(log_id, "success", elapsed_ms(started), None);
        info!(node = %node.id, instance_id = %instance_id, "[lifecycle] node terminated");
        Ok(())
    }
}
