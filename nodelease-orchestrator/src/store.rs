use anyhow::Context;
use nodelease_common::PersistedNode;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cloud::CloudRegistry;
use crate::launcher::LauncherRegistry;
use crate::logger::ActionLogger;
use crate::node::Node;
use crate::retention::RetentionPolicy;

/// JSON file holding the persisted node records.
#[derive(Debug, Clone)]
pub struct NodeStore {
    path: PathBuf,
}

impl NodeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means no nodes.
    pub async fn load(&self) -> anyhow::Result<Vec<PersistedNode>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()));
            }
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", self.path.display()))
    }

    /// Write to a sibling temp file, then rename over the store. Each call
    /// gets its own temp file; callers order concurrent saves.
    pub async fn save(&self, records: &[PersistedNode]) -> anyhow::Result<()> {
        let body = serde_json::to_vec_pretty(records).context("serializing nodes")?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("renaming {} to {}", tmp.display(), self.path.display()))?;
        Ok(())
    }

    /// Load and rehydrate every record; records that no longer resolve are skipped.
    pub async fn restore(
        &self,
        clouds: &CloudRegistry,
        launchers: &LauncherRegistry,
        retention: Arc<dyn RetentionPolicy>,
        logger: Arc<ActionLogger>,
    ) -> anyhow::Result<Vec<Arc<Node>>> {
        let records = self.load().await?;
        let mut nodes = Vec::with_capacity(records.len());
        for record in &records {
            match Node::rehydrate(record, clouds, launchers, retention.clone(), logger.clone()).await {
                Ok(node) => nodes.push(Arc::new(node)),
                Err(e) => warn!(
                    cloud = %record.cloud_id,
                    template = %record.template_id,
                    instance = %record.instance_id,
                    error = %e,
                    "[node-store] skipping record"
                ),
            }
        }
        info!(
            path = %self.path.display(),
            loaded = records.len(),
            restored = nodes.len(),
            "[node-store] restore complete"
        );
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("nodelease-store-{}-{}.json", tag, uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let store = NodeStore::new(temp_path("missing"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_then_load() {
        let path = temp_path("save");
        let store = NodeStore::new(&path);
        let records = vec![PersistedNode {
            cloud_id: "os1".to_string(),
            template_id: "linux".to_string(),
            instance_id: "0123456789".to_string(),
            stop_on_terminate: true,
        }];
        store.save(&records).await.unwrap();
        assert_eq!(store.load().await.unwrap(), records);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_saves_do_not_collide() {
        let path = temp_path("concurrent");
        let store = NodeStore::new(&path);
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let records = vec![PersistedNode {
                    cloud_id: "os1".to_string(),
                    template_id: "linux".to_string(),
                    instance_id: format!("instance-{}", i),
                    stop_on_terminate: false,
                }];
                store.save(&records).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(store.load().await.unwrap().len(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let path = temp_path("corrupt");
        std::fs::write(&path, "{not json").unwrap();
        assert!(NodeStore::new(&path).load().await.is_err());
        let _ = std::fs::remove_file(path);
    }
}
