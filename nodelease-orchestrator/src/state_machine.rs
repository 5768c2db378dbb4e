use chrono::Utc;
use nodelease_common::{NodeError, NodeState, Result, StateTransition};
use tracing::{debug, warn};

use crate::logger::ActionLogger;
use crate::node::NodeInner;

fn record(node_id: &str, inner: &mut NodeInner, to: NodeState, reason: &str, logger: &ActionLogger) {
    let from = inner.state;
    inner.state = to;
    inner.history.push(StateTransition {
        from,
        to,
        reason: reason.to_string(),
        at: Utc::now(),
    });
    logger.log_quick(
        "STATE_TRANSITION",
        node_id,
        Some(serde_json::json!({
            "from": from.as_str(),
            "to": to.as_str(),
            "reason": reason,
        })),
    );
    debug!(node = %node_id, from = %from, to = %to, reason = reason, "[state_machine] transition");
}

/// Move a node along one edge of the lifecycle (idempotent).
///
/// Returns `Ok(false)` when the node is already in `to`.
pub fn transition(
    node_id: &str,
    inner: &mut NodeInner,
    to: NodeState,
    reason: &str,
    logger: &ActionLogger,
) -> Result<bool> {
    if inner.state == to {
        return Ok(false);
    }
    if !inner.state.can_transition_to(to) {
        warn!(
            node = %node_id,
            from = %inner.state,
            to = %to,
            "[state_machine] rejected transition"
        );
        return Err(NodeError::InvalidTransition {
            from: inner.state,
            to,
        });
    }
    record(node_id, inner, to, reason, logger);
    Ok(true)
}

/// Place a node directly in `to`, used when wrapping an instance that already exists
/// (attach, rehydrate). Only valid for a node that has not left `Requested`.
pub fn adopt(
    node_id: &str,
    inner: &mut NodeInner,
    to: NodeState,
    reason: &str,
    logger: &ActionLogger,
) -> Result<()> {
    if inner.state != NodeState::Requested {
        return Err(NodeError::InvalidTransition {
            from: inner.state,
            to,
        });
    }
    record(node_id, inner, to, reason, logger);
    Ok(())
}

/// Boot/connect failure. No-op for nodes already terminating or terminal.
pub fn fail(node_id: &str, inner: &mut NodeInner, reason: &str, logger: &ActionLogger) -> bool {
    if inner.state.can_transition_to(NodeState::Error) {
        record(node_id, inner, NodeState::Error, reason, logger);
        true
    } else {
        false
    }
}

/// Enter `Terminating` unless the node is already there or terminal.
pub fn begin_termination(
    node_id: &str,
    inner: &mut NodeInner,
    reason: &str,
    logger: &ActionLogger,
) -> bool {
    if inner.state.is_terminal() || inner.state == NodeState::Terminating {
        return false;
    }
    record(node_id, inner, NodeState::Terminating, reason, logger);
    true
}

/// `Terminating -> Terminated`. `Error` stays `Error`.
pub fn complete_termination(
    node_id: &str,
    inner: &mut NodeInner,
    reason: &str,
    logger: &ActionLogger,
) -> bool {
    if inner.state == NodeState::Terminating {
        record(node_id, inner, NodeState::Terminated, reason, logger);
        true
    } else {
        false
    }
}
