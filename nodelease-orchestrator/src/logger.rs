use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct ActionLogEntry {
    pub id: Uuid,
    pub action_type: String,
    pub component: &'static str,
    pub status: String,
    pub node_id: Option<String>,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

/// Bounded in-memory action log (oldest entries are dropped first).
pub struct ActionLogger {
    entries: Mutex<VecDeque<ActionLogEntry>>,
    capacity: usize,
}

impl Default for ActionLogger {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ActionLogger {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<ActionLogEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn log_event(
        &self,
        action_type: &str,
        status: &str,
        node_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Uuid {
        self.log_event_with_metadata(action_type, status, node_id, error_message, None)
    }

    /// Log event with metadata (context info)
    pub fn log_event_with_metadata(
        &self,
        action_type: &str,
        status: &str,
        node_id: Option<&str>,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Uuid {
        let log_id = Uuid::new_v4();
        let entry = ActionLogEntry {
            id: log_id,
            action_type: action_type.to_string(),
            component: "orchestrator",
            status: status.to_string(),
            node_id: node_id.map(|s| s.to_string()),
            error_message: error_message.map(|s| s.to_string()),
            metadata,
            created_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        };

        let mut entries = self.entries();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        drop(entries);

        tracing::debug!(
            action = action_type,
            status = status,
            node = node_id.unwrap_or("-"),
            log_id = %log_id,
            "[action-log] logged"
        );
        log_id
    }

    pub fn log_event_complete(
        &self,
        log_id: Uuid,
        status: &str,
        duration_ms: u64,
        error_message: Option<&str>,
    ) {
        self.log_event_complete_with_metadata(log_id, status, duration_ms, error_message, None)
    }

    /// Completes an entry. Metadata given here replaces the original when present.
    pub fn log_event_complete_with_metadata(
        &self,
        log_id: Uuid,
        status: &str,
        duration_ms: u64,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) {
        let mut entries = self.entries();
        // Entry may have been evicted from the ring already.
        if let Some(entry) = entries.iter_mut().rev().find(|e| e.id == log_id) {
            entry.status = status.to_string();
            entry.duration_ms = Some(duration_ms);
            entry.error_message = error_message.map(|s| s.to_string());
            if metadata.is_some() {
                entry.metadata = metadata;
            }
            entry.completed_at = Some(Utc::now());
        }
    }

    /// Quick log for one-off events (like state transitions)
    pub fn log_quick(&self, action_type: &str, node_id: &str, details: Option<serde_json::Value>) {
        let id = self.log_event_with_metadata(action_type, "success", Some(node_id), None, details);
        self.log_event_complete(id, "success", 0, None);
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<ActionLogEntry> {
        self.entries().iter().rev().take(limit).cloned().collect()
    }

    /// Entries for one node, oldest first.
    pub fn for_node(&self, node_id: &str) -> Vec<ActionLogEntry> {
        self.entries()
            .iter()
            .filter(|e| e.node_id.as_deref() == Some(node_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
