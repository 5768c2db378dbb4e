use async_trait::async_trait;
use nodelease_common::Result;

pub use inventory::{CatalogItem, CreateInstanceRequest, InstanceSnapshot, NetworkAddresses};

/// Compute operations the engine consumes from a cloud account.
///
/// Implementations own authentication and session caching; callers only see
/// instance snapshots. Errors are classified into `NodeError` variants so the
/// lifecycle code can tell "gone" (`InstanceNotFound`) from "try again later"
/// (`ProviderUnavailable`).
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Short provider code ("openstack", "mock").
    fn provider_code(&self) -> &'static str;

    /// Authenticate and return the session token. Also used as a connection test.
    async fn authenticate(&self) -> Result<String>;

    async fn list_instances(&self) -> Result<Vec<InstanceSnapshot>>;

    async fn create_instance(&self, request: &CreateInstanceRequest) -> Result<InstanceSnapshot>;

    async fn get_instance(&self, instance_id: &str) -> Result<InstanceSnapshot>;

    async fn delete_instance(&self, instance_id: &str) -> Result<()>;

    // Optional: stop/poweroff instance before termination
    // Default implementation returns Ok(false) (not supported)
    async fn stop_instance(&self, _instance_id: &str) -> Result<bool> {
        Ok(false)
    }

    async fn list_images(&self) -> Result<Vec<CatalogItem>>;

    async fn list_flavors(&self) -> Result<Vec<CatalogItem>>;

    /// Resolve a human-provided image name or id to the provider's image id.
    async fn resolve_image_ref(&self, name_or_id: &str) -> Result<Option<String>> {
        let images = self.list_images().await?;
        Ok(inventory::resolve_ref(&images, name_or_id))
    }

    /// Resolve a human-provided flavor name or id to the provider's flavor id.
    async fn resolve_flavor_ref(&self, name_or_id: &str) -> Result<Option<String>> {
        let flavors = self.list_flavors().await?;
        Ok(inventory::resolve_ref(&flavors, name_or_id))
    }
}

pub mod inventory {
    use serde::{Deserialize, Serialize};

    /// Addresses of one provider network, in the order the provider returned them.
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct NetworkAddresses {
        pub network: String,
        pub addresses: Vec<String>,
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct InstanceSnapshot {
        pub id: String,
        pub name: String,
        pub status: String,
        pub networks: Vec<NetworkAddresses>,
    }

    impl InstanceSnapshot {
        pub fn is_active(&self) -> bool {
            self.status.eq_ignore_ascii_case("active")
        }

        pub fn is_error(&self) -> bool {
            self.status.eq_ignore_ascii_case("error")
        }

        pub fn address_count(&self) -> usize {
            self.networks.iter().map(|n| n.addresses.len()).sum()
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CatalogItem {
        pub id: String,
        pub name: String,
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CreateInstanceRequest {
        pub name: String,
        pub image_ref: String,
        pub flavor_ref: String,
        pub key_name: Option<String>,
        pub security_groups: Vec<String>,
        pub availability_zone: Option<String>,
    }

    /// First entry whose id or name equals `name_or_id`.
    pub fn resolve_ref(items: &[CatalogItem], name_or_id: &str) -> Option<String> {
        let wanted = name_or_id.trim();
        if wanted.is_empty() {
            return None;
        }
        items
            .iter()
            .find(|item| item.id == wanted || item.name == wanted)
            .map(|item| item.id.clone())
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "openstack")]
pub mod openstack;

#[cfg(test)]
mod tests {
    use super::inventory::*;

    #[test]
    fn resolve_ref_by_id_or_name() {
        let items = vec![
            CatalogItem {
                id: "a1".to_string(),
                name: "ubuntu-22.04".to_string(),
            },
            CatalogItem {
                id: "b2".to_string(),
                name: "debian-12".to_string(),
            },
        ];
        assert_eq!(resolve_ref(&items, "b2").as_deref(), Some("b2"));
        assert_eq!(resolve_ref(&items, "ubuntu-22.04").as_deref(), Some("a1"));
        assert_eq!(resolve_ref(&items, " debian-12 ").as_deref(), Some("b2"));
        assert_eq!(resolve_ref(&items, "centos"), None);
        assert_eq!(resolve_ref(&items, ""), None);
    }

    #[test]
    fn snapshot_status_is_case_insensitive() {
        let mut s = InstanceSnapshot {
            id: "x".to_string(),
            name: "linux".to_string(),
            status: "ACTIVE".to_string(),
            networks: vec![NetworkAddresses {
                network: "private".to_string(),
                addresses: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
            }],
        };
        assert!(s.is_active());
        assert!(!s.is_error());
        assert_eq!(s.address_count(), 2);
        s.status = "error".to_string();
        assert!(s.is_error());
    }
}
