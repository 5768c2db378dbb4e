use crate::{inventory, CloudProvider};
use async_trait::async_trait;
use inventory::{CatalogItem, CreateInstanceRequest, InstanceSnapshot, NetworkAddresses};
use nodelease_common::{NodeError, Result};
use std::sync::{Mutex, MutexGuard};

/// In-memory provider used for local runs and tests.
///
/// Each created instance walks through `boot_sequence`, one status per
/// `get_instance` call, and stays on the last one. Call counters let tests
/// assert exactly which provider operations the engine issued.
pub struct MockProvider {
    state: Mutex<MockState>,
    provider_code: &'static str,
}

struct MockInstance {
    snapshot: InstanceSnapshot,
    sequence: Vec<String>,
    polls: usize,
}

struct MockState {
    instances: Vec<MockInstance>,
    images: Vec<CatalogItem>,
    flavors: Vec<CatalogItem>,
    boot_sequence: Vec<String>,
    networks: Option<Vec<NetworkAddresses>>,
    auth_failure: bool,
    unavailable: bool,
    failing_creates: usize,
    failing_deletes: usize,
    next_address: u32,
    created: Vec<CreateInstanceRequest>,
    create_calls: usize,
    delete_calls: usize,
    stop_calls: usize,
    get_calls: usize,
    list_calls: usize,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                instances: Vec::new(),
                images: vec![
                    CatalogItem {
                        id: "img-0001".to_string(),
                        name: "ubuntu-22.04".to_string(),
                    },
                    CatalogItem {
                        id: "img-0002".to_string(),
                        name: "windows-2022".to_string(),
                    },
                ],
                flavors: vec![
                    CatalogItem {
                        id: "flv-0001".to_string(),
                        name: "m1.small".to_string(),
                    },
                    CatalogItem {
                        id: "flv-0002".to_string(),
                        name: "m1.large".to_string(),
                    },
                ],
                boot_sequence: vec!["BUILD".to_string(), "ACTIVE".to_string()],
                networks: None,
                auth_failure: false,
                unavailable: false,
                failing_creates: 0,
                failing_deletes: 0,
                next_address: 1,
                created: Vec::new(),
                create_calls: 0,
                delete_calls: 0,
                stop_calls: 0,
                get_calls: 0,
                list_calls: 0,
            }),
            provider_code: "mock",
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Statuses returned by successive polls of a newly created instance.
    pub fn with_boot_sequence(self, statuses: &[&str]) -> Self {
        self.state().boot_sequence = statuses.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Fixed network layout for every newly created instance.
    pub fn with_networks(self, networks: Vec<NetworkAddresses>) -> Self {
        self.state().networks = Some(networks);
        self
    }

    /// Register an instance that exists outside the engine's knowledge.
    pub fn seed_instance(&self, name: &str, status: &str, networks: Vec<NetworkAddresses>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.state().instances.push(MockInstance {
            snapshot: InstanceSnapshot {
                id: id.clone(),
                name: name.to_string(),
                status: status.to_string(),
                networks,
            },
            sequence: vec![status.to_string()],
            polls: 0,
        });
        id
    }

    /// Pin the status of an existing instance.
    pub fn set_status(&self, instance_id: &str, status: &str) {
        let mut st = self.state();
        if let Some(inst) = st.instances.iter_mut().find(|i| i.snapshot.id == instance_id) {
            inst.sequence = vec![status.to_string()];
            inst.snapshot.status = status.to_string();
        }
    }

    pub fn set_auth_failure(&self, failing: bool) {
        self.state().auth_failure = failing;
    }

    /// Every call fails with `ProviderUnavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    pub fn fail_next_creates(&self, count: usize) {
        self.state().failing_creates = count;
    }

    pub fn fail_next_deletes(&self, count: usize) {
        self.state().failing_deletes = count;
    }

    pub fn create_calls(&self) -> usize {
        self.state().create_calls
    }

    pub fn delete_calls(&self) -> usize {
        self.state().delete_calls
    }

    pub fn stop_calls(&self) -> usize {
        self.state().stop_calls
    }

    pub fn get_calls(&self) -> usize {
        self.state().get_calls
    }

    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    pub fn live_instance_count(&self) -> usize {
        self.state().instances.len()
    }

    /// Create requests received so far, in order.
    pub fn created_requests(&self) -> Vec<CreateInstanceRequest> {
        self.state().created.clone()
    }

    fn check_available(st: &MockState) -> Result<()> {
        if st.unavailable {
            return Err(NodeError::ProviderUnavailable(
                "mock provider set unavailable".to_string(),
            ));
        }
        if st.auth_failure {
            return Err(NodeError::AuthenticationFailure(
                "mock provider rejected credentials".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    fn provider_code(&self) -> &'static str {
        self.provider_code
    }

    async fn authenticate(&self) -> Result<String> {
        let st = self.state();
        Self::check_available(&st)?;
        Ok(format!("mock-token-{}", uuid::Uuid::new_v4()))
    }

    async fn list_instances(&self) -> Result<Vec<InstanceSnapshot>> {
        let mut st = self.state();
        st.list_calls += 1;
        Self::check_available(&st)?;
        Ok(st.instances.iter().map(|i| i.snapshot.clone()).collect())
    }

    async fn create_instance(&self, request: &CreateInstanceRequest) -> Result<InstanceSnapshot> {
        let mut st = self.state();
        st.create_calls += 1;
        Self::check_available(&st)?;
        if st.failing_creates > 0 {
            st.failing_creates -= 1;
            return Err(NodeError::ProviderUnavailable(
                "mock create_instance failure".to_string(),
            ));
        }
        if !st.images.iter().any(|i| i.id == request.image_ref) {
            return Err(NodeError::InvalidTemplate(format!(
                "unknown image {}",
                request.image_ref
            )));
        }
        if !st.flavors.iter().any(|f| f.id == request.flavor_ref) {
            return Err(NodeError::InvalidTemplate(format!(
                "unknown flavor {}",
                request.flavor_ref
            )));
        }

        let networks = match st.networks.clone() {
            Some(n) => n,
            None => {
                let n = st.next_address;
                st.next_address += 1;
                vec![NetworkAddresses {
                    network: "private".to_string(),
                    addresses: vec![format!("10.0.{}.{}", n / 250, n % 250 + 1)],
                }]
            }
        };
        let sequence = st.boot_sequence.clone();
        let snapshot = InstanceSnapshot {
            id: uuid::Uuid::new_v4().to_string(),
            name: request.name.clone(),
            status: sequence.first().cloned().unwrap_or_else(|| "BUILD".to_string()),
            networks,
        };
        st.created.push(request.clone());
        st.instances.push(MockInstance {
            snapshot: snapshot.clone(),
            sequence,
            polls: 0,
        });
        Ok(snapshot)
    }

    async fn get_instance(&self, instance_id: &str) -> Result<InstanceSnapshot> {
        let mut st = self.state();
        st.get_calls += 1;
        Self::check_available(&st)?;
        let inst = st
            .instances
            .iter_mut()
            .find(|i| i.snapshot.id == instance_id)
            .ok_or_else(|| NodeError::InstanceNotFound(instance_id.to_string()))?;
        if let Some(last) = inst.sequence.len().checked_sub(1) {
            let idx = inst.polls.min(last);
            inst.snapshot.status = inst.sequence[idx].clone();
        }
        inst.polls += 1;
        Ok(inst.snapshot.clone())
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        let mut st = self.state();
        st.delete_calls += 1;
        Self::check_available(&st)?;
        if st.failing_deletes > 0 {
            st.failing_deletes -= 1;
            return Err(NodeError::ProviderUnavailable(
                "mock delete_instance failure".to_string(),
            ));
        }
        let before = st.instances.len();
        st.instances.retain(|i| i.snapshot.id != instance_id);
        if st.instances.len() == before {
            return Err(NodeError::InstanceNotFound(instance_id.to_string()));
        }
        Ok(())
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<bool> {
        let mut st = self.state();
        st.stop_calls += 1;
        Self::check_available(&st)?;
        match st.instances.iter_mut().find(|i| i.snapshot.id == instance_id) {
            Some(inst) => {
                inst.sequence = vec!["SHUTOFF".to_string()];
                inst.snapshot.status = "SHUTOFF".to_string();
                Ok(true)
            }
            None => Err(NodeError::InstanceNotFound(instance_id.to_string())),
        }
    }

    async fn list_images(&self) -> Result<Vec<CatalogItem>> {
        let st = self.state();
        Self::check_available(&st)?;
        Ok(st.images.clone())
    }

    async fn list_flavors(&self) -> Result<Vec<CatalogItem>> {
        let st = self.state();
        Self::check_available(&st)?;
        Ok(st.flavors.clone())
    }
}
