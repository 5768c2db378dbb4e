use thiserror::Error;

use crate::NodeState;

/// Errors raised by the provisioning and lifecycle engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("cloud not found: {0}")]
    CloudNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// Network or API failure talking to the provider.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The instance reported error status while booting.
    #[error("instance {instance_id} entered error status")]
    BootFailure { instance_id: String },

    /// No address/protocol combination accepted a control channel.
    #[error("no address accepted a control channel after {rounds} round(s), {attempts} failed attempt(s)")]
    ConnectivityExhausted { rounds: u32, attempts: usize },

    /// A single launcher attempt against one address failed.
    #[error("launch failed: {0}")]
    LaunchFailure(String),

    #[error("instance {instance_id} did not become active within {waited_secs}s")]
    ActiveTimeout { instance_id: String, waited_secs: u64 },

    #[error("operation cancelled")]
    Cancelled,

    /// The node was terminated while another operation was in flight.
    #[error("node {0} was terminated")]
    NodeTerminated(String),

    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    #[error("invalid label expression: {0}")]
    InvalidLabelExpression(String),

    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: NodeState, to: NodeState },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl NodeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, NodeError::InstanceNotFound(_))
    }

    /// Stable code used in action logs and API responses.
    pub fn code(&self) -> &'static str {
        match self {
            NodeError::AuthenticationFailure(_) => "AUTHENTICATION_FAILURE",
            NodeError::TemplateNotFound(_) => "TEMPLATE_NOT_FOUND",
            NodeError::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            NodeError::CloudNotFound(_) => "CLOUD_NOT_FOUND",
            NodeError::NodeNotFound(_) => "NODE_NOT_FOUND",
            NodeError::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            NodeError::BootFailure { .. } => "BOOT_FAILURE",
            NodeError::ConnectivityExhausted { .. } => "CONNECTIVITY_EXHAUSTED",
            NodeError::LaunchFailure(_) => "LAUNCH_FAILURE",
            NodeError::ActiveTimeout { .. } => "ACTIVE_TIMEOUT",
            NodeError::Cancelled => "CANCELLED",
            NodeError::NodeTerminated(_) => "NODE_TERMINATED",
            NodeError::InvalidTemplate(_) => "INVALID_TEMPLATE",
            NodeError::InvalidLabelExpression(_) => "INVALID_LABEL_EXPRESSION",
            NodeError::InvalidTransition { .. } => "INVALID_TRANSITION",
            NodeError::Config(_) => "CONFIG",
            NodeError::Internal(_) => "INTERNAL",
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, NodeError>;
