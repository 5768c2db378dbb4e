use chrono::Utc;
use nodelease_common::{NodeError, Result};
use nodelease_providers::NetworkAddresses;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::launcher::{ControlChannel, Launcher};
use crate::template::Template;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedAttempt {
    pub round: u32,
    pub network: String,
    pub address: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub channel: ControlChannel,
    pub failed_attempts: Vec<FailedAttempt>,
    pub rounds: u32,
}

/// Walks the address list of a booted instance until a launcher accepts one.
#[derive(Debug, Clone)]
pub struct ConnectivityEstablisher {
    pub max_rounds: u32,
    pub round_backoff: Duration,
}

impl Default for ConnectivityEstablisher {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            round_backoff: Duration::from_secs(10),
        }
    }
}

impl ConnectivityEstablisher {
    pub fn new(max_rounds: u32, round_backoff: Duration) -> Self {
        Self {
            max_rounds: max_rounds.max(1),
            round_backoff,
        }
    }

    /// Networks, then addresses, in provider order. The first accepting address
    /// wins and later ones are never tried. A full pass with no success is one
    /// round; rounds are separated by `round_backoff`.
    pub async fn connect(
        &self,
        node_id: &str,
        networks: &[NetworkAddresses],
        launcher: &dyn Launcher,
        template: &Template,
        cancel: &CancellationToken,
    ) -> Result<ConnectOutcome> {
        let mut failed = Vec::new();

        for round in 1..=self.max_rounds {
            for net in networks {
                for address in &net.addresses {
                    if cancel.is_cancelled() {
                        return Err(NodeError::Cancelled);
                    }
                    match launcher.launch(address, template).await {
                        Ok(()) => {
                            info!(
                                node = %node_id,
                                network = %net.network,
                                address = %address,
                                protocol = launcher.protocol(),
                                failed_attempts = failed.len(),
                                "[connectivity] channel open"
                            );
                            return Ok(ConnectOutcome {
                                channel: ControlChannel {
                                    protocol: launcher.protocol().to_string(),
                                    network: net.network.clone(),
                                    address: address.clone(),
                                    user: template.remote_user.clone(),
                                    opened_at: Utc::now(),
                                },
                                failed_attempts: failed,
                                rounds: round,
                            });
                        }
                        Err(e) => {
                            warn!(
                                node = %node_id,
                                round = round,
                                network = %net.network,
                                address = %address,
                                error = %e,
                                "[connectivity] attempt failed"
                            );
                            failed.push(FailedAttempt {
                                round,
                                network: net.network.clone(),
                                address: address.clone(),
                                error: e.to_string(),
                            });
                        }
                    }
                }
            }

            if round < self.max_rounds {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(NodeError::Cancelled),
                    _ = tokio::time::sleep(self.round_backoff) => {}
                }
            }
        }

        Err(NodeError::ConnectivityExhausted {
            rounds: self.max_rounds,
            attempts: failed.len(),
        })
    }
}
