//! # Audit trail
//!
//! ## Responsibility
//! Keep an append-only record of every stage transition, rollback, approval
//! decision and escalation, with timestamp, actor and cause, so the full
//! deployment timeline can be reconstructed after an incident.
//!
//! ## Guarantees
//! - Append-only: records are never edited or removed
//! - Thread-safe: cheap to clone, all clones share one log
//! - Every append is also emitted as a `tracing` event at `info`

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::model::{Actor, ApprovalDecision, DeploymentId, Stage};

/// What an audit record describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditKind {
    /// A deployment moved between stages.
    StageTransition {
        /// Stage before.
        from: Stage,
        /// Stage after.
        to: Stage,
        /// Traffic percentage in effect at the time of the transition.
        traffic_percent: u8,
    },
    /// A rollback call was made.
    Rollback {
        /// Whether the provider confirmed the rollback.
        confirmed: bool,
    },
    /// An approval request was resolved.
    ApprovalDecision {
        /// The resolution.
        decision: ApprovalDecision,
    },
    /// A deployment stopped at the approval gate.
    Halted,
    /// An escalation notification for an alarm.
    Escalation {
        /// Alarm name.
        alarm_name: String,
        /// Sequence number within the breach episode.
        escalation_count: u32,
        /// Whether the dispatcher accepted it.
        delivered: bool,
    },
    /// An escalation ticket was cleared because the alarm recovered.
    EscalationCleared {
        /// Alarm name.
        alarm_name: String,
    },
}

/// One entry in the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When it happened.
    pub at: DateTime<Utc>,
    /// Deployment concerned, if any.
    pub deployment_id: Option<DeploymentId>,
    /// Who caused it.
    pub actor: Actor,
    /// Human-readable cause.
    pub cause: String,
    /// Structured detail.
    pub kind: AuditKind,
}

/// Shared append-only audit log.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    records: Arc<RwLock<Vec<AuditRecord>>>,
}

impl AuditLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn append(&self, record: AuditRecord) {
        tracing::info!(
            deployment_id = record.deployment_id.as_ref().map(|d| d.as_str()).unwrap_or("-"),
            actor = %record.actor,
            cause = %record.cause,
            kind = ?record.kind,
            "audit"
        );
        self.records.write().push(record);
    }

    /// Every record, oldest first.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.read().clone()
    }

    /// Records for one deployment, oldest first.
    pub fn for_deployment(&self, id: &DeploymentId) -> Vec<AuditRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.deployment_id.as_ref() == Some(id))
            .cloned()
            .collect()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// `true` if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Re-seed the log from a persisted snapshot, ahead of anything recorded
    /// since start-up.
    pub(crate) fn restore(&self, mut persisted: Vec<AuditRecord>) {
        let mut records = self.records.write();
        persisted.append(&mut records);
        *records = persisted;
    }
}
