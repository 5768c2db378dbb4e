use anyhow::Context;
use nodelease_common::CloudAccountConfig;
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Process settings, read from `NODELEASE_*` environment variables.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub clouds_file: PathBuf,
    pub state_file: PathBuf,
    pub listen_addr: SocketAddr,
    pub worker_pool_size: usize,
    pub poll_interval: Duration,
    pub active_timeout: Duration,
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
    pub idle_threshold_minutes: i64,
    pub retention_interval: Duration,
    pub ssh_port: u16,
    pub winrm_port: u16,
    pub launch_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            clouds_file: PathBuf::from("clouds.json"),
            state_file: PathBuf::from("nodes.json"),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8001)),
            worker_pool_size: 8,
            poll_interval: Duration::from_millis(1000),
            active_timeout: Duration::from_secs(600),
            connect_attempts: 3,
            connect_backoff: Duration::from_secs(10),
            idle_threshold_minutes: 30,
            retention_interval: Duration::from_secs(60),
            ssh_port: 22,
            winrm_port: 5985,
            launch_timeout: Duration::from_secs(30),
        }
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T: FromStr>(name: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{}={:?}: {}", name, raw, e)),
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let d = Self::default();
        Ok(Self {
            clouds_file: var("NODELEASE_CLOUDS_FILE").map(PathBuf::from).unwrap_or(d.clouds_file),
            state_file: var("NODELEASE_STATE_FILE").map(PathBuf::from).unwrap_or(d.state_file),
            listen_addr: parsed("NODELEASE_LISTEN_ADDR")?.unwrap_or(d.listen_addr),
            worker_pool_size: parsed::<usize>("NODELEASE_WORKER_POOL_SIZE")?
                .filter(|v| *v > 0)
                .unwrap_or(d.worker_pool_size),
            poll_interval: parsed::<u64>("NODELEASE_POLL_INTERVAL_MS")?
                .filter(|v| *v > 0)
                .map(Duration::from_millis)
                .unwrap_or(d.poll_interval),
            active_timeout: parsed::<u64>("NODELEASE_ACTIVE_TIMEOUT_S")?
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.active_timeout),
            connect_attempts: parsed::<u32>("NODELEASE_CONNECT_ATTEMPTS")?
                .filter(|v| *v > 0)
                .unwrap_or(d.connect_attempts),
            connect_backoff: parsed::<u64>("NODELEASE_CONNECT_BACKOFF_S")?
                .map(Duration::from_secs)
                .unwrap_or(d.connect_backoff),
            idle_threshold_minutes: parsed::<i64>("NODELEASE_IDLE_THRESHOLD_MIN")?
                .filter(|v| *v > 0)
                .unwrap_or(d.idle_threshold_minutes),
            retention_interval: parsed::<u64>("NODELEASE_RETENTION_INTERVAL_S")?
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.retention_interval),
            ssh_port: parsed("NODELEASE_SSH_PORT")?.unwrap_or(d.ssh_port),
            winrm_port: parsed("NODELEASE_WINRM_PORT")?.unwrap_or(d.winrm_port),
            launch_timeout: parsed::<u64>("NODELEASE_LAUNCH_TIMEOUT_S")?
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.launch_timeout),
        })
    }
}

/// Cloud accounts with their templates, as a JSON array.
pub fn load_clouds(path: &Path) -> anyhow::Result<Vec<CloudAccountConfig>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading clouds file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing clouds file {}", path.display()))
}
