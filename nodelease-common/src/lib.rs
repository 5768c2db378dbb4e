use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod error;
pub mod labels;

pub use error::{NodeError, Result};
pub use labels::{LabelExpr, LabelSet};

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    #[default]
    Unix,
    Windows,
}

impl OsFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Unix => "unix",
            OsFamily::Windows => "windows",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Requested,     // Accepted by the scheduler, nothing sent to the provider yet
    Booting,       // Create request in flight
    WaitingActive, // Instance exists, polling until ACTIVE/ERROR
    Connecting,    // Opening the control channel
    Connected,     // Serving work
    Idle,          // Connected, nothing assigned
    Terminating,   // Delete requested
    Terminated,    // Instance gone, node must not be reused
    Error,         // Boot/connect failed
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Requested => "requested",
            NodeState::Booting => "booting",
            NodeState::WaitingActive => "waiting_active",
            NodeState::Connecting => "connecting",
            NodeState::Connected => "connected",
            NodeState::Idle => "idle",
            NodeState::Terminating => "terminating",
            NodeState::Terminated => "terminated",
            NodeState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Terminated | NodeState::Error)
    }

    /// Connected or idle: the node holds an open control channel.
    pub fn is_online(&self) -> bool {
        matches!(self, NodeState::Connected | NodeState::Idle)
    }

    /// Allowed edges of the node lifecycle.
    ///
    /// Terminal states have no outgoing edges. `Terminating` can be entered from
    /// any live state so that eviction and operator requests can race an
    /// in-flight boot.
    pub fn can_transition_to(&self, next: NodeState) -> bool {
        use NodeState::*;
        match (self, next) {
            (Terminated, _) | (Error, _) => false,
            (Requested, Booting) => true,
            (Booting, WaitingActive) | (Booting, Error) => true,
            (WaitingActive, Connecting) | (WaitingActive, Error) => true,
            (Connecting, Connected) | (Connecting, Error) => true,
            (Connected, Idle) | (Idle, Connected) => true,
            (Terminating, Terminated) => true,
            (Terminating, _) => false,
            (_, Terminating) => true,
            _ => false,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Persisted records ---

/// Template as declared in the clouds file.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TemplateConfig {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Image id or name, resolved against the provider catalog at boot.
    pub image: String,
    /// Flavor id or name, resolved against the provider catalog at boot.
    pub flavor: String,
    #[serde(default)]
    pub key_name: Option<String>,
    /// Space separated security group names.
    #[serde(default)]
    pub security_groups: String,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub os_family: OsFamily,
    #[serde(default)]
    pub remote_fs: String,
    #[serde(default)]
    pub remote_user: Option<String>,
    #[serde(default)]
    pub remote_password: Option<String>,
    #[serde(default)]
    pub private_key_file: Option<String>,
    /// Space separated capability labels.
    #[serde(default)]
    pub labels: String,
    /// Number or numeric string; anything else falls back to 1.
    #[serde(default)]
    pub num_executors: Option<serde_json::Value>,
    #[serde(default)]
    pub stop_on_terminate: bool,
}

impl TemplateConfig {
    pub fn executor_count(&self) -> u32 {
        let parsed = match &self.num_executors {
            Some(serde_json::Value::Number(n)) => n.as_u64(),
            Some(serde_json::Value::String(s)) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        parsed
            .filter(|n| *n > 0)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(1)
    }
}

/// Cloud account as declared in the clouds file.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CloudAccountConfig {
    pub id: String,
    /// Provider implementation: "openstack" or "mock".
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub auth_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Preferred over `password` when set (Docker/K8s secrets).
    #[serde(default)]
    pub password_file: Option<String>,
    #[serde(default)]
    pub tenant: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub instance_cap: Option<u32>,
    #[serde(default)]
    pub templates: Vec<TemplateConfig>,
}

fn default_provider() -> String {
    "openstack".to_string()
}

impl CloudAccountConfig {
    /// Empty cap means unbounded.
    pub fn effective_instance_cap(&self) -> u32 {
        self.instance_cap.unwrap_or(u32::MAX)
    }

    pub fn resolve_password(&self) -> Option<String> {
        self.password_file
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .and_then(|p| std::fs::read_to_string(p).ok())
            .or_else(|| self.password.clone())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

/// What survives a restart for each node. Everything else is re-resolved.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PersistedNode {
    pub cloud_id: String,
    pub template_id: String,
    pub instance_id: String,
    pub stop_on_terminate: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from: NodeState,
    pub to: NodeState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        for next in [
            NodeState::Booting,
            NodeState::Connected,
            NodeState::Terminating,
            NodeState::Terminated,
            NodeState::Error,
        ] {
            assert!(!NodeState::Terminated.can_transition_to(next));
            assert!(!NodeState::Error.can_transition_to(next));
        }
    }

    #[test]
    fn lifecycle_edges() {
        assert!(NodeState::Requested.can_transition_to(NodeState::Booting));
        assert!(NodeState::Booting.can_transition_to(NodeState::WaitingActive));
        assert!(NodeState::WaitingActive.can_transition_to(NodeState::Connecting));
        assert!(NodeState::Connecting.can_transition_to(NodeState::Connected));
        assert!(NodeState::Connected.can_transition_to(NodeState::Idle));
        assert!(NodeState::Idle.can_transition_to(NodeState::Connected));
        assert!(NodeState::Idle.can_transition_to(NodeState::Terminating));
        assert!(NodeState::Terminating.can_transition_to(NodeState::Terminated));

        // Error only from the boot/connect phase.
        assert!(NodeState::Booting.can_transition_to(NodeState::Error));
        assert!(NodeState::Connecting.can_transition_to(NodeState::Error));
        assert!(!NodeState::Connected.can_transition_to(NodeState::Error));
        assert!(!NodeState::Idle.can_transition_to(NodeState::Error));

        assert!(!NodeState::Connected.can_transition_to(NodeState::Terminated));
        assert!(!NodeState::WaitingActive.can_transition_to(NodeState::Connected));
    }

    #[test]
    fn executor_count_parsing() {
        let mut t: TemplateConfig = serde_json::from_value(serde_json::json!({
            "id": "linux",
            "image": "ubuntu-22.04",
            "flavor": "m1.small"
        }))
        .unwrap();
        assert_eq!(t.executor_count(), 1);

        t.num_executors = Some(serde_json::json!(4));
        assert_eq!(t.executor_count(), 4);
        t.num_executors = Some(serde_json::json!(" 2 "));
        assert_eq!(t.executor_count(), 2);
        t.num_executors = Some(serde_json::json!("many"));
        assert_eq!(t.executor_count(), 1);
        t.num_executors = Some(serde_json::json!(0));
        assert_eq!(t.executor_count(), 1);
    }

    #[test]
    fn cloud_defaults() {
        let c: CloudAccountConfig = serde_json::from_value(serde_json::json!({
            "id": "os1",
            "password": "  secret  "
        }))
        .unwrap();
        assert_eq!(c.provider, "openstack");
        assert_eq!(c.effective_instance_cap(), u32::MAX);
        assert_eq!(c.resolve_password().as_deref(), Some("secret"));
        assert!(c.templates.is_empty());
    }
}
