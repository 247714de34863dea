//! # State snapshots
//!
//! ## Responsibility
//! Persist the orchestrator's durable state (deployments, open approvals,
//! alarm bindings, escalation tickets, audit trail) as a single JSON
//! document, and read it back on start-up.
//!
//! ## Guarantees
//! - A save never leaves a half-written file behind: data goes to a sibling
//!   `.tmp` file which is then renamed over the target
//! - Loading a path that does not exist yields `Ok(None)`, not an error
//!
//! ## NOT Responsible For
//! - Deciding what goes into a snapshot (see `Orchestrator::snapshot`)
//! - Periodic saving

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::audit::AuditRecord;
use crate::model::{AlarmBinding, ApprovalRequest, Deployment, EscalationTicket};

/// Snapshot format version written by this build.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Snapshot persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading, writing or renaming failed.
    #[error("snapshot I/O at {path}: {source}")]
    Io {
        /// File involved.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not a valid snapshot document.
    #[error("snapshot at {path} is malformed: {source}")]
    Json {
        /// File involved.
        path: String,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// The file was written by an incompatible build.
    #[error("snapshot version {found} is not supported (expected {SNAPSHOT_VERSION})")]
    UnsupportedVersion {
        /// Version found in the file.
        found: u32,
    },
}

/// Everything needed to resume after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Format version.
    pub version: u32,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Deployment records, including history.
    pub deployments: Vec<Deployment>,
    /// Approval requests, pending and resolved.
    pub approvals: Vec<ApprovalRequest>,
    /// Alarm bindings.
    pub bindings: Vec<AlarmBinding>,
    /// Live escalation tickets.
    pub tickets: Vec<EscalationTicket>,
    /// Audit trail.
    pub audit: Vec<AuditRecord>,
}

/// JSON file store for [`StateSnapshot`]s.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Target file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `snapshot`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// [`StoreError::Json`] if encoding fails, [`StoreError::Io`] if the
    /// temporary file cannot be written or renamed.
    pub async fn save(&self, snapshot: &StateSnapshot) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(snapshot).map_err(|source| StoreError::Json {
            path: self.display(),
            source,
        })?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.display().to_string(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| StoreError::Io {
                path: self.display(),
                source,
            })?;

        info!(
            path = %self.path.display(),
            deployments = snapshot.deployments.len(),
            tickets = snapshot.tickets.len(),
            bytes = body.len(),
            "snapshot saved"
        );
        Ok(())
    }

    /// Read the snapshot, or `None` if none has been saved yet.
    ///
    /// # Errors
    ///
    /// [`StoreError::Io`] for read failures other than a missing file,
    /// [`StoreError::Json`] for malformed content and
    /// [`StoreError::UnsupportedVersion`] for a foreign format.
    pub async fn load(&self) -> Result<Option<StateSnapshot>, StoreError> {
        let body = match tokio::fs::read(&self.path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no snapshot on disk");
                return Ok(None);
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.display(),
                    source,
                })
            }
        };

        let snapshot: StateSnapshot =
            serde_json::from_slice(&body).map_err(|source| StoreError::Json {
                path: self.display(),
                source,
            })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::UnsupportedVersion {
                found: snapshot.version,
            });
        }
        Ok(Some(snapshot))
    }

    fn display(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeploymentId, Severity};

    fn snapshot() -> StateSnapshot {
        StateSnapshot {
            version: SNAPSHOT_VERSION,
            taken_at: Utc::now(),
            deployments: vec![Deployment::new(
                DeploymentId::new("dep-1"),
                "abc123",
                "artifact-1",
                Utc::now(),
            )],
            approvals: Vec::new(),
            bindings: vec![AlarmBinding {
                alarm_name: "api-5xx".into(),
                deployment_id: DeploymentId::new("dep-1"),
                severity: Severity::Critical,
            }],
            tickets: Vec::new(),
            audit: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_load_missing_file_is_none() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let store = SnapshotStore::new(dir.path().join("state.json"));
        assert!(store.load().await.expect("test: load").is_none());
    }

    #[tokio::test]
    async fn test_save_then_load_returns_same_state() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let store = SnapshotStore::new(dir.path().join("state.json"));
        let snap = snapshot();

        store.save(&snap).await.expect("test: save");
        let loaded = store.load().await.expect("test: load").expect("test: present");

        assert_eq!(loaded, snap);
        assert!(!dir.path().join("state.tmp").exists());
    }

    #[tokio::test]
    async fn test_malformed_file_is_json_error() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").expect("test: write");

        let err = SnapshotStore::new(&path).load().await.expect_err("test: fail");
        assert!(matches!(err, StoreError::Json { .. }));
    }

    #[tokio::test]
    async fn test_foreign_version_is_rejected() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let store = SnapshotStore::new(dir.path().join("state.json"));
        let mut snap = snapshot();
        snap.version = 99;
        store.save(&snap).await.expect("test: save");

        let err = store.load().await.expect_err("test: fail");
        assert!(matches!(err, StoreError::UnsupportedVersion { found: 99 }));
    }

    #[tokio::test]
    async fn test_save_into_missing_directory_is_io_error() {
        let store = SnapshotStore::new("/definitely/nonexistent/dir/state.json");
        let err = store.save(&snapshot()).await.expect_err("test: fail");
        assert!(matches!(err, StoreError::Io { .. }));
    }
}
