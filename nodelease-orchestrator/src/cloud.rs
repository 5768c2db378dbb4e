use nodelease_common::{CloudAccountConfig, LabelExpr, NodeError, Result};
use nodelease_providers::CloudProvider;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::template::{Template, TemplateRegistry};

/// One provider account and its templates.
pub struct CloudAccount {
    pub id: String,
    pub region: String,
    pub instance_cap: u32,
    pub templates: TemplateRegistry,
    pub provider: Arc<dyn CloudProvider>,
    // Accepted units whose create call has not returned yet.
    in_flight: Arc<AtomicUsize>,
}

/// Counts toward the cap until the create call for its unit has returned.
#[derive(Debug)]
pub struct Reservation {
    counter: Arc<AtomicUsize>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CloudAccount {
    pub fn new(
        id: impl Into<String>,
        region: impl Into<String>,
        instance_cap: u32,
        templates: TemplateRegistry,
        provider: Arc<dyn CloudProvider>,
    ) -> Self {
        Self {
            id: id.into(),
            region: region.into(),
            instance_cap,
            templates,
            provider,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_config(cfg: &CloudAccountConfig, provider: Arc<dyn CloudProvider>) -> Result<Self> {
        let templates = TemplateRegistry::from_configs(cfg.templates.clone())?;
        Ok(Self::new(
            cfg.id.clone(),
            cfg.region.clone(),
            cfg.effective_instance_cap(),
            templates,
            provider,
        ))
    }

    pub fn reserve(&self) -> Reservation {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Reservation {
            counter: self.in_flight.clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Provider-side instance count plus accepted units not yet created.
    pub async fn current_instance_count(&self) -> Result<usize> {
        let listed = self.provider.list_instances().await?.len();
        Ok(listed + self.in_flight())
    }

    pub fn at_capacity(&self, count: usize) -> bool {
        count >= self.instance_cap as usize
    }

    /// Resolve the template's image and flavor against the provider catalog.
    pub async fn validate_template(&self, template: &Template) -> Result<(String, String)> {
        let image_ref = self
            .provider
            .resolve_image_ref(&template.image)
            .await?
            .ok_or_else(|| {
                NodeError::InvalidTemplate(format!(
                    "template {}: image {:?} not found",
                    template.id, template.image
                ))
            })?;
        let flavor_ref = self
            .provider
            .resolve_flavor_ref(&template.flavor)
            .await?
            .ok_or_else(|| {
                NodeError::InvalidTemplate(format!(
                    "template {}: flavor {:?} not found",
                    template.id, template.flavor
                ))
            })?;
        Ok((image_ref, flavor_ref))
    }
}

/// Cloud accounts in declaration order.
#[derive(Default)]
pub struct CloudRegistry {
    clouds: Vec<Arc<CloudAccount>>,
}

impl CloudRegistry {
    pub fn new(clouds: Vec<CloudAccount>) -> Result<Self> {
        let mut registry = Self::default();
        for c in clouds {
            registry.register(c)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, cloud: CloudAccount) -> Result<Arc<CloudAccount>> {
        if self.clouds.iter().any(|c| c.id == cloud.id) {
            return Err(NodeError::Config(format!("duplicate cloud id {}", cloud.id)));
        }
        let cloud = Arc::new(cloud);
        self.clouds.push(cloud.clone());
        Ok(cloud)
    }

    pub fn get(&self, id: &str) -> Result<Arc<CloudAccount>> {
        self.clouds
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| NodeError::CloudNotFound(id.to_string()))
    }

    pub fn list(&self) -> &[Arc<CloudAccount>] {
        &self.clouds
    }

    /// First cloud with a template matching `expr`.
    pub fn first_matching(&self, expr: &LabelExpr) -> Option<(Arc<CloudAccount>, Arc<Template>)> {
        self.clouds
            .iter()
            .find_map(|c| c.templates.match_label(expr).map(|t| (c.clone(), t)))
    }

    pub fn can_provision(&self, expr: &LabelExpr) -> bool {
        self.first_matching(expr).is_some()
    }
}
