pub mod api;
pub mod cloud;
pub mod config;
pub mod connectivity;
pub mod launcher;
pub mod lifecycle;
pub mod logger;
pub mod node;
pub mod provider_manager;
pub mod provisioning;
pub mod retention;
pub mod state_machine;
pub mod store;
pub mod template;

pub use cloud::{CloudAccount, CloudRegistry};
pub use connectivity::{ConnectOutcome, ConnectivityEstablisher, FailedAttempt};
pub use launcher::{ControlChannel, Launcher, LauncherRegistry};
pub use lifecycle::{Attached, LifecycleTiming, NodeLifecycleManager};
pub use node::{Node, NodeTable};
pub use provisioning::{PendingNode, ProvisioningScheduler};
pub use retention::{IdleTimeout, RetentionMonitor, RetentionPolicy};
pub use template::{Template, TemplateRegistry};
