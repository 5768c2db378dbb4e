use nodelease_common::{CloudAccountConfig, NodeError, Result};
use nodelease_providers::CloudProvider;
use std::sync::Arc;

pub struct ProviderManager;

impl ProviderManager {
    /// Provider for a cloud account, by its `provider` code.
    pub fn get_provider(cfg: &CloudAccountConfig) -> Result<Arc<dyn CloudProvider>> {
        match cfg.provider.trim().to_lowercase().as_str() {
            #[cfg(feature = "provider-openstack")]
            "openstack" => {
                let password = cfg.resolve_password().ok_or_else(|| {
                    NodeError::Config(format!("cloud {}: no password or password_file", cfg.id))
                })?;
                if cfg.auth_url.trim().is_empty() || cfg.username.trim().is_empty() {
                    return Err(NodeError::Config(format!(
                        "cloud {}: auth_url and username are required",
                        cfg.id
                    )));
                }
                let provider = nodelease_providers::openstack::OpenStackProvider::new(
                    cfg.auth_url.clone(),
                    cfg.username.clone(),
                    password,
                    cfg.tenant.clone(),
                    cfg.region.clone(),
                )?;
                Ok(Arc::new(provider))
            }
            #[cfg(feature = "provider-mock")]
            "mock" => Ok(Arc::new(nodelease_providers::mock::MockProvider::new())),
            // Add other providers here behind their own feature.
            other => Err(NodeError::Config(format!(
                "cloud {}: provider {:?} is not available in this build",
                cfg.id, other
            ))),
        }
    }
}
