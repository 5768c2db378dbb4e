use nodelease_common::{LabelExpr, LabelSet, NodeError, OsFamily, Result, TemplateConfig};
use nodelease_providers::CreateInstanceRequest;
use serde::Serialize;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub const DEFAULT_REMOTE_USER: &str = "root";

/// Node template with labels and groups parsed once at construction.
#[derive(Debug, Clone, Serialize)]
pub struct Template {
    pub id: String,
    pub description: String,
    pub image: String,
    pub flavor: String,
    pub key_name: Option<String>,
    pub security_groups: Vec<String>,
    pub availability_zone: Option<String>,
    pub os_family: OsFamily,
    pub remote_fs: String,
    pub remote_user: String,
    #[serde(skip_serializing)]
    pub remote_password: Option<String>,
    pub private_key_file: Option<String>,
    pub labels: LabelSet,
    pub executors: u32,
    pub stop_on_terminate: bool,
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Template {
    pub fn from_config(cfg: TemplateConfig) -> Result<Self> {
        let id = cfg.id.trim().to_string();
        if id.is_empty() {
            return Err(NodeError::InvalidTemplate("template id is empty".to_string()));
        }
        if cfg.image.trim().is_empty() {
            return Err(NodeError::InvalidTemplate(format!("template {}: image is empty", id)));
        }
        if cfg.flavor.trim().is_empty() {
            return Err(NodeError::InvalidTemplate(format!("template {}: flavor is empty", id)));
        }
        let executors = cfg.executor_count();
        Ok(Self {
            description: cfg.description,
            image: cfg.image.trim().to_string(),
            flavor: cfg.flavor.trim().to_string(),
            key_name: non_empty(cfg.key_name),
            security_groups: cfg
                .security_groups
                .split_whitespace()
                .map(|s| s.to_string())
                .collect(),
            availability_zone: non_empty(cfg.availability_zone),
            os_family: cfg.os_family,
            remote_fs: cfg.remote_fs.trim().to_string(),
            remote_user: non_empty(cfg.remote_user)
                .unwrap_or_else(|| DEFAULT_REMOTE_USER.to_string()),
            remote_password: cfg.remote_password.filter(|p| !p.is_empty()),
            private_key_file: non_empty(cfg.private_key_file),
            labels: LabelSet::parse(&cfg.labels),
            executors,
            stop_on_terminate: cfg.stop_on_terminate,
            id,
        })
    }

    /// Instances are named after their template.
    pub fn create_request(&self, image_ref: String, flavor_ref: String) -> CreateInstanceRequest {
        CreateInstanceRequest {
            name: self.id.clone(),
            image_ref,
            flavor_ref,
            key_name: self.key_name.clone(),
            security_groups: self.security_groups.clone(),
            availability_zone: self.availability_zone.clone(),
        }
    }

    pub fn owns_instance_name(&self, name: &str) -> bool {
        name == self.id || name.starts_with(&format!("{}-", self.id))
    }
}

/// Ordered templates of one cloud account.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: RwLock<Vec<Arc<Template>>>,
}

impl TemplateRegistry {
    pub fn new(templates: Vec<Template>) -> Result<Self> {
        let registry = Self::default();
        for t in templates {
            registry.add(t)?;
        }
        Ok(registry)
    }

    pub fn from_configs(configs: Vec<TemplateConfig>) -> Result<Self> {
        let templates = configs
            .into_iter()
            .map(Template::from_config)
            .collect::<Result<Vec<_>>>()?;
        Self::new(templates)
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<Template>>> {
        self.templates.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<Template>>> {
        self.templates.write().unwrap_or_else(|p| p.into_inner())
    }

    /// First template, in registry order, whose labels satisfy `expr`.
    pub fn match_label(&self, expr: &LabelExpr) -> Option<Arc<Template>> {
        self.read().iter().find(|t| t.labels.satisfies(expr)).cloned()
    }

    pub fn by_id(&self, id: &str) -> Option<Arc<Template>> {
        self.read().iter().find(|t| t.id == id).cloned()
    }

    /// Exact name first, then the `{template_id}-` prefix convention.
    pub fn by_instance_name(&self, name: &str) -> Option<Arc<Template>> {
        let templates = self.read();
        templates
            .iter()
            .find(|t| t.id == name)
            .or_else(|| templates.iter().find(|t| t.owns_instance_name(name)))
            .cloned()
    }

    pub fn add(&self, template: Template) -> Result<Arc<Template>> {
        let mut templates = self.write();
        if templates.iter().any(|t| t.id == template.id) {
            return Err(NodeError::InvalidTemplate(format!(
                "duplicate template id {}",
                template.id
            )));
        }
        let template = Arc::new(template);
        templates.push(template.clone());
        Ok(template)
    }

    pub fn list(&self) -> Vec<Arc<Template>> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
