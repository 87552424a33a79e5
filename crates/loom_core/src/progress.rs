//! Process-wide registry of per-session generation progress.
//!
//! The orchestrator is the only writer for a given session; any number of
//! status pollers read cloned snapshots. Records live in memory only.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::session::SessionStatus;

/// Progress snapshot returned to status pollers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub status: SessionStatus,
    /// Percent complete, 0 to 100
    pub progress: u8,
    pub current_step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    fn pending() -> Self {
        Self {
            status: SessionStatus::Pending,
            progress: 0,
            current_step: "Queued".to_string(),
            error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Shared progress registry.
#[derive(Debug, Default)]
pub struct ProgressStore {
    records: RwLock<HashMap<String, ProgressRecord>>,
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending record for a new session.
    pub fn register(&self, id: &str) -> CoreResult<()> {
        let mut records = self.records.write();
        if records.contains_key(id) {
            return Err(CoreError::InvalidState(format!(
                "progress record already exists for {}",
                id
            )));
        }
        records.insert(id.to_string(), ProgressRecord::pending());
        Ok(())
    }

    /// Start a run: pending or terminal records move to running at 0%.
    ///
    /// The check and the transition happen under one lock, so two callers
    /// racing for the same session cannot both succeed.
    pub fn begin_run(&self, id: &str, step: &str) -> CoreResult<()> {
        let mut records = self.records.write();
        let record = records
            .get_mut(id)
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))?;
        if record.status == SessionStatus::Running {
            return Err(CoreError::SessionBusy(id.to_string()));
        }
        record.status = SessionStatus::Running;
        record.progress = 0;
        record.current_step = step.to_string();
        record.error = None;
        record.updated_at = Utc::now();
        Ok(())
    }

    /// Report progress for a running session. Lower values are ignored.
    pub fn advance(&self, id: &str, progress: u8, step: &str) {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(id) else {
            return;
        };
        if record.status != SessionStatus::Running {
            debug!("Ignoring progress for {} in state {}", id, record.status);
            return;
        }
        record.progress = record.progress.max(progress.min(99));
        record.current_step = step.to_string();
        record.updated_at = Utc::now();
    }

    pub fn complete(&self, id: &str) {
        self.finish(id, SessionStatus::Completed, None);
    }

    pub fn fail(&self, id: &str, error: impl Into<String>) {
        self.finish(id, SessionStatus::Failed, Some(error.into()));
    }

    fn finish(&self, id: &str, status: SessionStatus, error: Option<String>) {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(id) else {
            return;
        };
        record.status = status;
        if status == SessionStatus::Completed {
            record.progress = 100;
            record.current_step = "Completed".to_string();
        }
        record.error = error;
        record.updated_at = Utc::now();
    }

    pub fn get(&self, id: &str) -> Option<ProgressRecord> {
        self.records.read().get(id).cloned()
    }

    pub fn status(&self, id: &str) -> Option<SessionStatus> {
        self.records.read().get(id).map(|r| r.status)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Remove terminal records untouched for longer than `older_than`.
    /// Returns the ids that were dropped.
    pub fn prune_terminal(&self, older_than: Duration) -> Vec<String> {
        let cutoff = match chrono::Duration::from_std(older_than) {
            Ok(age) => Utc::now() - age,
            Err(_) => return Vec::new(),
        };
        let mut records = self.records.write();
        let expired: Vec<String> = records
            .iter()
            .filter(|(_, r)| r.status.is_terminal() && r.updated_at <= cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            records.remove(id);
        }
        if !expired.is_empty() {
            debug!("Pruned {} finished progress records", expired.len());
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let store = ProgressStore::new();
        store.register("a").unwrap();
        assert_eq!(store.status("a"), Some(SessionStatus::Pending));

        store.begin_run("a", "Requirements Analysis").unwrap();
        store.advance("a", 40, "Code Generation");
        let record = store.get("a").unwrap();
        assert_eq!(record.status, SessionStatus::Running);
        assert_eq!(record.progress, 40);
        assert_eq!(record.current_step, "Code Generation");

        store.complete("a");
        let record = store.get("a").unwrap();
        assert_eq!(record.status, SessionStatus::Completed);
        assert_eq!(record.progress, 100);
    }

    #[test]
    fn test_progress_never_decreases_while_running() {
        let store = ProgressStore::new();
        store.register("a").unwrap();
        store.begin_run("a", "start").unwrap();
        store.advance("a", 60, "x");
        store.advance("a", 20, "y");
        assert_eq!(store.get("a").unwrap().progress, 60);
    }

    #[test]
    fn test_begin_run_rejects_running_session() {
        let store = ProgressStore::new();
        store.register("a").unwrap();
        store.begin_run("a", "start").unwrap();
        assert!(matches!(
            store.begin_run("a", "again"),
            Err(CoreError::SessionBusy(_))
        ));
        assert!(matches!(
            store.begin_run("missing", "start"),
            Err(CoreError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_failed_session_can_rerun_from_zero() {
        let store = ProgressStore::new();
        store.register("a").unwrap();
        store.begin_run("a", "start").unwrap();
        store.advance("a", 50, "x");
        store.fail("a", "boom");
        let record = store.get("a").unwrap();
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert_eq!(record.progress, 50);

        store.begin_run("a", "again").unwrap();
        let record = store.get("a").unwrap();
        assert_eq!(record.status, SessionStatus::Running);
        assert_eq!(record.progress, 0);
        assert!(record.error.is_none());
    }

    #[test]
    fn test_prune_only_removes_terminal_records() {
        let store = ProgressStore::new();
        store.register("done").unwrap();
        store.begin_run("done", "s").unwrap();
        store.complete("done");
        store.register("live").unwrap();
        store.begin_run("live", "s").unwrap();

        assert!(store.prune_terminal(Duration::from_secs(3600)).is_empty());
        assert_eq!(store.prune_terminal(Duration::ZERO), vec!["done".to_string()]);
        assert!(store.get("done").is_none());
        assert!(store.get("live").is_some());
    }

    #[test]
    fn test_serializes_camel_case() {
        let store = ProgressStore::new();
        store.register("a").unwrap();
        let json = serde_json::to_value(store.get("a").unwrap()).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["currentStep"], "Queued");
        assert!(json.get("error").is_none());
    }
}
