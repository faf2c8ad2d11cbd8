/*!
# Persistence

Best-effort JSON snapshotting, one file per workflow.
Grounded on the `WorkflowRepository`/`WorkflowExecutionStore` pair from
the workflow extension's disabled storage backend, trimmed down to a
single flat-file store: no transactions, no resume-after-restart
guarantee, a snapshot failure is logged and swallowed rather than
failing the workflow (documented as an Open Question resolution in
DESIGN.md).
*/

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::instance::{StageStatus, WorkflowState};

/// Flat snapshot of a workflow's externally-visible state, written after
/// every state-affecting transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub workflow_id: String,
    pub workflow_name: String,
    pub state: WorkflowState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub progress: f64,
    pub stages: Vec<StageSnapshot>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub name: String,
    pub status: StageStatus,
    pub retry_count: usize,
    pub error: Option<String>,
}

/// Manages on-disk snapshots under a single storage directory. Writes
/// are serialized through one mutex: snapshots are infrequent enough
/// (one per transition) that this is never a throughput bottleneck, and
/// it rules out interleaved partial writes to the same file.
pub struct PersistenceManager {
    dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl PersistenceManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn path_for(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{workflow_id}.json"))
    }

    /// Persists a snapshot, creating the storage directory if needed.
    /// Failures are returned to the caller, which is expected to log and
    /// continue rather than fail the workflow over a storage hiccup.
    pub async fn save(&self, snapshot: &WorkflowSnapshot) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| EngineError::PersistenceFailed(e.to_string()))?;

        let body = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| EngineError::PersistenceFailed(e.to_string()))?;

        let path = self.path_for(&snapshot.workflow_id);
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &body)
            .await
            .map_err(|e| EngineError::PersistenceFailed(e.to_string()))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| EngineError::PersistenceFailed(e.to_string()))?;
        Ok(())
    }

    pub async fn load(&self, workflow_id: &str) -> EngineResult<WorkflowSnapshot> {
        let path = self.path_for(workflow_id);
        let body = tokio::fs::read(&path)
            .await
            .map_err(|_| EngineError::NotFound(workflow_id.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| EngineError::PersistenceFailed(e.to_string()))
    }

    pub async fn delete(&self, workflow_id: &str) -> EngineResult<()> {
        let path = self.path_for(workflow_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::PersistenceFailed(e.to_string())),
        }
    }

    pub async fn list(&self) -> EngineResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::PersistenceFailed(e.to_string())),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EngineError::PersistenceFailed(e.to_string()))?
        {
            if let Some(id) = stem_if_snapshot(&entry.path()) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    pub async fn get_status(&self, workflow_id: &str) -> EngineResult<WorkflowState> {
        self.load(workflow_id).await.map(|s| s.state)
    }

    /// Deletes snapshots older than `retention_days`. Best-effort: a
    /// single unreadable file is logged and skipped rather than aborting
    /// the whole sweep.
    pub async fn cleanup_old(&self, retention_days: u32) -> EngineResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let mut removed = 0;
        for id in self.list().await? {
            match self.load(&id).await {
                Ok(snapshot) if snapshot.saved_at < cutoff => {
                    self.delete(&id).await?;
                    removed += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(workflow_id = %id, error = %e, "skipping unreadable snapshot during cleanup"),
            }
        }
        Ok(removed)
    }
}

fn stem_if_snapshot(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> WorkflowSnapshot {
        WorkflowSnapshot {
            workflow_id: id.to_string(),
            workflow_name: "wf".to_string(),
            state: WorkflowState::Running,
            started_at: Some(Utc::now()),
            ended_at: None,
            progress: 0.5,
            stages: vec![],
            saved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PersistenceManager::new(dir.path());
        manager.save(&sample("wf-1")).await.unwrap();
        let loaded = manager.load("wf-1").await.unwrap();
        assert_eq!(loaded.workflow_id, "wf-1");
        assert_eq!(loaded.state, WorkflowState::Running);
    }

    #[tokio::test]
    async fn load_missing_returns_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PersistenceManager::new(dir.path());
        let err = manager.load("ghost").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_reflects_saved_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PersistenceManager::new(dir.path());
        manager.save(&sample("wf-1")).await.unwrap();
        manager.save(&sample("wf-2")).await.unwrap();
        let mut ids = manager.list().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["wf-1".to_string(), "wf-2".to_string()]);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PersistenceManager::new(dir.path());
        manager.save(&sample("wf-1")).await.unwrap();
        manager.delete("wf-1").await.unwrap();
        manager.delete("wf-1").await.unwrap();
        assert!(manager.list().await.unwrap().is_empty());
    }
}
