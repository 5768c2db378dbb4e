// Common test utilities and fixtures
// All provider traffic goes to the in-memory mock provider.
#![allow(dead_code)]

use async_trait::async_trait;
use nodelease_common::{NodeError, Result, TemplateConfig};
use nodelease_orchestrator::logger::ActionLogger;
use nodelease_orchestrator::{
    CloudAccount, CloudRegistry, ConnectivityEstablisher, IdleTimeout, Launcher, LauncherRegistry,
    LifecycleTiming, NodeLifecycleManager, NodeTable, ProvisioningScheduler, RetentionPolicy,
    Template, TemplateRegistry,
};
use nodelease_providers::mock::MockProvider;
use nodelease_providers::NetworkAddresses;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const CLOUD_ID: &str = "os1";

/// Launcher that accepts a fixed set of addresses (or all of them) and records every attempt.
pub struct ScriptedLauncher {
    accept: Option<Vec<String>>,
    tried: Mutex<Vec<String>>,
}

impl ScriptedLauncher {
    pub fn accept_all() -> Self {
        Self {
            accept: None,
            tried: Mutex::new(Vec::new()),
        }
    }

    pub fn accepting(addresses: &[&str]) -> Self {
        Self {
            accept: Some(addresses.iter().map(|s| s.to_string()).collect()),
            tried: Mutex::new(Vec::new()),
        }
    }

    pub fn tried(&self) -> Vec<String> {
        self.tried.lock().unwrap().clone()
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    fn protocol(&self) -> &'static str {
        "scripted"
    }

    async fn launch(&self, address: &str, _template: &Template) -> Result<()> {
        self.tried.lock().unwrap().push(address.to_string());
        match &self.accept {
            None => Ok(()),
            Some(list) if list.iter().any(|a| a == address) => Ok(()),
            Some(_) => Err(NodeError::LaunchFailure(format!("{} refused", address))),
        }
    }
}

pub fn template_cfg(id: &str, labels: &str) -> TemplateConfig {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "image": "ubuntu-22.04",
        "flavor": "m1.small",
        "labels": labels,
    }))
    .unwrap()
}

pub fn template(id: &str, labels: &str) -> Template {
    Template::from_config(template_cfg(id, labels)).unwrap()
}

pub fn network(name: &str, addresses: &[&str]) -> NetworkAddresses {
    NetworkAddresses {
        network: name.to_string(),
        addresses: addresses.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn fast_timing() -> LifecycleTiming {
    LifecycleTiming {
        poll_interval: Duration::from_millis(5),
        active_timeout: Duration::from_secs(2),
    }
}

pub struct Fixture {
    pub provider: Arc<MockProvider>,
    pub cloud: Arc<CloudAccount>,
    pub clouds: Arc<CloudRegistry>,
    pub launcher: Arc<ScriptedLauncher>,
    pub logger: Arc<ActionLogger>,
    pub nodes: Arc<NodeTable>,
    pub lifecycle: Arc<NodeLifecycleManager>,
    pub scheduler: ProvisioningScheduler,
    pub cancel: CancellationToken,
}

pub struct FixtureBuilder {
    provider: MockProvider,
    cap: u32,
    templates: Vec<TemplateConfig>,
    launcher: ScriptedLauncher,
    timing: LifecycleTiming,
    establisher: ConnectivityEstablisher,
    retention: Arc<dyn RetentionPolicy>,
}

impl FixtureBuilder {
    pub fn new() -> Self {
        Self {
            provider: MockProvider::new(),
            cap: 10,
            templates: vec![template_cfg("linux", "linux docker")],
            launcher: ScriptedLauncher::accept_all(),
            timing: fast_timing(),
            establisher: ConnectivityEstablisher::new(2, Duration::from_millis(5)),
            retention: Arc::new(IdleTimeout::default()),
        }
    }

    pub fn provider(mut self, provider: MockProvider) -> Self {
        self.provider = provider;
        self
    }

    pub fn cap(mut self, cap: u32) -> Self {
        self.cap = cap;
        self
    }

    pub fn templates(mut self, templates: Vec<TemplateConfig>) -> Self {
        self.templates = templates;
        self
    }

    pub fn launcher(mut self, launcher: ScriptedLauncher) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn timing(mut self, timing: LifecycleTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn establisher(mut self, establisher: ConnectivityEstablisher) -> Self {
        self.establisher = establisher;
        self
    }

    pub fn build(self) -> Fixture {
        let provider = Arc::new(self.provider);
        let mut registry = CloudRegistry::default();
        let cloud = registry
            .register(CloudAccount::new(
                CLOUD_ID,
                "RegionOne",
                self.cap,
                TemplateRegistry::from_configs(self.templates).unwrap(),
                provider.clone(),
            ))
            .unwrap();
        let clouds = Arc::new(registry);

        let launcher = Arc::new(self.launcher);
        let logger = Arc::new(ActionLogger::default());
        let nodes = Arc::new(NodeTable::new());
        let lifecycle = Arc::new(NodeLifecycleManager::new(
            LauncherRegistry::uniform(launcher.clone()),
            self.establisher,
            self.retention,
            self.timing,
            logger.clone(),
            nodes.clone(),
        ));
        let cancel = CancellationToken::new();
        let scheduler = ProvisioningScheduler::new(clouds.clone(), lifecycle.clone(), 4, cancel.clone());

        Fixture {
            provider,
            cloud,
            clouds,
            launcher,
            logger,
            nodes,
            lifecycle,
            scheduler,
            cancel,
        }
    }
}

pub fn fixture() -> Fixture {
    FixtureBuilder::new().build()
}
