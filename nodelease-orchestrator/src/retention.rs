use chrono::{DateTime, Utc};
use nodelease_common::NodeState;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::lifecycle::NodeLifecycleManager;

/// Decides when an idle node should be given back.
pub trait RetentionPolicy: Send + Sync {
    fn should_terminate(&self, idle: chrono::Duration) -> bool;
}

/// Terminate once idle for strictly longer than `threshold`.
#[derive(Debug, Clone)]
pub struct IdleTimeout {
    pub threshold: chrono::Duration,
}

impl Default for IdleTimeout {
    fn default() -> Self {
        Self {
            threshold: chrono::Duration::minutes(30),
        }
    }
}

impl IdleTimeout {
    pub fn minutes(minutes: i64) -> Self {
        Self {
            threshold: chrono::Duration::minutes(minutes),
        }
    }
}

impl RetentionPolicy for IdleTimeout {
    fn should_terminate(&self, idle: chrono::Duration) -> bool {
        idle > self.threshold
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub inspected: usize,
    pub terminated: Vec<String>,
    pub failed: Vec<String>,
}

/// Periodic idle sweep over the node table.
pub struct RetentionMonitor {
    lifecycle: Arc<NodeLifecycleManager>,
    interval: Duration,
}

impl RetentionMonitor {
    pub fn new(lifecycle: Arc<NodeLifecycleManager>, interval: Duration) -> Self {
        Self { lifecycle, interval }
    }

    /// One pass. Online nodes are checked against their own policy. Nodes whose
    /// earlier termination or failure cleanup did not delete the instance are
    /// retried. Nodes are handled one at a time.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for node in self.lifecycle.nodes().list().await {
            report.inspected += 1;

            let due = match node.idle_duration(now).await {
                Some(idle) => node.retention().should_terminate(idle),
                None => match node.state().await {
                    NodeState::Terminating => true,
                    NodeState::Error => node.instance_ref().await.is_some(),
                    _ => false,
                },
            };
            if !due {
                continue;
            }

            match self.lifecycle.terminate(&node).await {
                Ok(()) => {
                    info!(node = %node.id, "[job-retention] node terminated");
                    report.terminated.push(node.id.clone());
                }
                Err(e) => {
                    warn!(node = %node.id, error = %e, "[job-retention] terminate failed, will retry");
                    report.failed.push(node.id.clone());
                }
            }
        }
        report
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        info!(
            interval_s = self.interval.as_secs(),
            "[job-retention] started (sweeping idle nodes)"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[job-retention] stopped");
                    return;
                }
                _ = interval.tick() => {}
            }

            let report = self.sweep(Utc::now()).await;
            if !report.terminated.is_empty() {
                info!(count = report.terminated.len(), "[job-retention] terminated node(s)");
            }
            if !report.failed.is_empty() {
                error!(count = report.failed.len(), "[job-retention] termination failures");
            }
        }
    }
}
