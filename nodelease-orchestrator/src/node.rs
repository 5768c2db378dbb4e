use chrono::{DateTime, Utc};
use nodelease_common::{NodeError, NodeState, PersistedNode, Result, StateTransition};
use nodelease_providers::InstanceSnapshot;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{info, warn};

use crate::cloud::{CloudAccount, CloudRegistry};
use crate::launcher::{ControlChannel, Launcher, LauncherRegistry};
use crate::logger::ActionLogger;
use crate::retention::RetentionPolicy;
use crate::state_machine;
use crate::store::NodeStore;
use crate::template::Template;

/// Mutable part of a node, guarded by the per-node lock.
#[derive(Debug, Clone)]
pub struct NodeInner {
    pub state: NodeState,
    pub snapshot: Option<InstanceSnapshot>,
    /// Provider instance id while the instance may still exist. Cleared by terminate.
    pub instance_ref: Option<String>,
    pub idle_since: Option<DateTime<Utc>>,
    pub channel: Option<ControlChannel>,
    pub history: Vec<StateTransition>,
}

impl NodeInner {
    pub fn new(instance_ref: Option<String>) -> Self {
        Self {
            state: NodeState::Requested,
            snapshot: None,
            instance_ref,
            idle_since: None,
            channel: None,
            history: Vec::new(),
        }
    }
}

pub struct Node {
    pub id: String,
    pub cloud_id: String,
    pub template_id: String,
    pub instance_id: String,
    pub stop_on_terminate: bool,
    pub cloud: Arc<CloudAccount>,
    pub template: Arc<Template>,
    launcher: Arc<dyn Launcher>,
    retention: Arc<dyn RetentionPolicy>,
    logger: Arc<ActionLogger>,
    inner: Mutex<NodeInner>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("cloud_id", &self.cloud_id)
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

/// Serializable view for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub id: String,
    pub cloud_id: String,
    pub template_id: String,
    pub instance_id: String,
    pub state: NodeState,
    pub instance_status: Option<String>,
    pub addresses: Vec<String>,
    pub channel: Option<ControlChannel>,
    pub idle_since: Option<DateTime<Utc>>,
    pub executors: u32,
    pub stop_on_terminate: bool,
    pub history: Vec<StateTransition>,
}

pub fn node_id(template_id: &str, instance_id: &str) -> String {
    let short: String = instance_id.chars().take(8).collect();
    format!("{}:{}", template_id, short)
}

impl Node {
    pub fn new(
        cloud: Arc<CloudAccount>,
        template: Arc<Template>,
        instance_id: &str,
        launcher: Arc<dyn Launcher>,
        retention: Arc<dyn RetentionPolicy>,
        logger: Arc<ActionLogger>,
    ) -> Self {
        Self {
            id: node_id(&template.id, instance_id),
            cloud_id: cloud.id.clone(),
            template_id: template.id.clone(),
            instance_id: instance_id.to_string(),
            stop_on_terminate: template.stop_on_terminate,
            cloud,
            template,
            launcher,
            retention,
            logger,
            inner: Mutex::new(NodeInner::new(Some(instance_id.to_string()))),
        }
    }

    /// Rebuild a node from its persisted record. The node starts in
    /// `WaitingActive` and must be re-activated before serving.
    pub async fn rehydrate(
        record: &PersistedNode,
        clouds: &CloudRegistry,
        launchers: &LauncherRegistry,
        retention: Arc<dyn RetentionPolicy>,
        logger: Arc<ActionLogger>,
    ) -> Result<Node> {
        let cloud = clouds.get(&record.cloud_id)?;
        let template = cloud
            .templates
            .by_id(&record.template_id)
            .ok_or_else(|| NodeError::TemplateNotFound(record.template_id.clone()))?;
        let launcher = launchers.for_os(template.os_family);
        let mut node = Node::new(cloud, template, &record.instance_id, launcher, retention, logger);
        node.stop_on_terminate = record.stop_on_terminate;
        node.adopt(NodeState::WaitingActive, "rehydrated from node store").await?;
        Ok(node)
    }

    pub async fn lock(&self) -> MutexGuard<'_, NodeInner> {
        self.inner.lock().await
    }

    pub async fn state(&self) -> NodeState {
        self.inner.lock().await.state
    }

    pub async fn snapshot(&self) -> Option<InstanceSnapshot> {
        self.inner.lock().await.snapshot.clone()
    }

    pub async fn instance_ref(&self) -> Option<String> {
        self.inner.lock().await.instance_ref.clone()
    }

    pub async fn history(&self) -> Vec<StateTransition> {
        self.inner.lock().await.history.clone()
    }

    pub fn launcher(&self) -> &dyn Launcher {
        self.launcher.as_ref()
    }

    pub fn retention(&self) -> &dyn RetentionPolicy {
        self.retention.as_ref()
    }

    pub fn logger(&self) -> &ActionLogger {
        &self.logger
    }

    pub async fn transition(&self, to: NodeState, reason: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        state_machine::transition(&self.id, &mut inner, to, reason, &self.logger)
    }

    pub(crate) async fn adopt(&self, to: NodeState, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        state_machine::adopt(&self.id, &mut inner, to, reason, &self.logger)
    }

    /// Work assigned: `Idle -> Connected`, idle clock stops.
    pub async fn mark_busy(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        state_machine::transition(&self.id, &mut inner, NodeState::Connected, "work assigned", &self.logger)?;
        inner.idle_since = None;
        Ok(())
    }

    /// Work finished: `Connected -> Idle`, idle clock starts now.
    pub async fn mark_idle(&self) -> Result<()> {
        self.mark_idle_at(Utc::now()).await
    }

    pub async fn mark_idle_at(&self, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let changed =
            state_machine::transition(&self.id, &mut inner, NodeState::Idle, "work finished", &self.logger)?;
        if changed || inner.idle_since.is_none() {
            inner.idle_since = Some(at);
        }
        Ok(())
    }

    /// `None` unless the node is online and idle.
    pub async fn idle_duration(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let inner = self.inner.lock().await;
        if !inner.state.is_online() {
            return None;
        }
        inner.idle_since.map(|since| now - since)
    }

    pub fn persisted(&self) -> PersistedNode {
        PersistedNode {
            cloud_id: self.cloud_id.clone(),
            template_id: self.template_id.clone(),
            instance_id: self.instance_id.clone(),
            stop_on_terminate: self.stop_on_terminate,
        }
    }

    pub async fn view(&self) -> NodeView {
        let inner = self.inner.lock().await;
        NodeView {
            id: self.id.clone(),
            cloud_id: self.cloud_id.clone(),
            template_id: self.template_id.clone(),
            instance_id: self.instance_id.clone(),
            state: inner.state,
            instance_status: inner.snapshot.as_ref().map(|s| s.status.clone()),
            addresses: inner
                .snapshot
                .iter()
                .flat_map(|s| s.networks.iter())
                .flat_map(|n| n.addresses.iter().cloned())
                .collect(),
            channel: inner.channel.clone(),
            idle_since: inner.idle_since,
            executors: self.template.executors,
            stop_on_terminate: self.stop_on_terminate,
            history: inner.history.clone(),
        }
    }
}

/// Live nodes by id, written through to the node store when one is attached.
#[derive(Default)]
pub struct NodeTable {
    nodes: RwLock<BTreeMap<String, Arc<Node>>>,
    store: Option<NodeStore>,
    // Held from snapshot to rename so saves land in table order.
    persist_lock: Mutex<()>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: NodeStore) -> Self {
        Self {
            store: Some(store),
            ..Self::default()
        }
    }

    /// Returns the node already registered under the same id, if any.
    pub async fn insert(&self, node: Arc<Node>) -> Arc<Node> {
        let stored = {
            let mut nodes = self.nodes.write().await;
            nodes.entry(node.id.clone()).or_insert(node).clone()
        };
        self.persist().await;
        stored
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<Node>> {
        let removed = self.nodes.write().await.remove(id);
        if removed.is_some() {
            self.persist().await;
        }
        removed
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<Node>> {
        self.nodes.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    /// Insert rehydrated nodes without writing the store back.
    pub async fn restore(&self, restored: Vec<Arc<Node>>) {
        let mut nodes = self.nodes.write().await;
        for node in restored {
            info!(node = %node.id, "[node-table] restored");
            nodes.insert(node.id.clone(), node);
        }
    }

    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let _writer = self.persist_lock.lock().await;
        let records: Vec<PersistedNode> = self
            .nodes
            .read()
            .await
            .values()
            .map(|n| n.persisted())
            .collect();
        if let Err(e) = store.save(&records).await {
            warn!(path = %store.path().display(), error = %e, "[node-table] failed to persist nodes");
        }
    }
}
