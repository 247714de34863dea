//! # Deployment pipeline
//!
//! ## Responsibility
//! Drive each deployment through
//! `Build → DeployStaging → AwaitApproval → DeployProduction → Succeeded`,
//! composing the infrastructure provider, the [`ApprovalGate`](crate::ApprovalGate),
//! the [`CanaryController`](crate::CanaryController) and the
//! [`AlarmWatcher`](crate::AlarmWatcher).
//!
//! ## Guarantees
//! - Only edges of the stage graph are taken; every one is logged on the
//!   deployment and in the audit trail
//! - One stage transition in flight per deployment (per-deployment lock)
//! - Failures before production end in `Failed` without rollback; failures in
//!   production always attempt a retried rollback
//! - `abort` is idempotent and interrupts soak and approval waits
//!
//! ## NOT Responsible For
//! - Running builds (callers report build results)
//! - Escalating alarms (see [`escalation`](crate::escalation))

use std::time::Duration;

use thiserror::Error;

use crate::approval::ApprovalError;
use crate::model::{DeploymentId, DeploymentStatus, Severity, Stage};

pub mod machine;

pub use machine::{PipelineComponents, PipelineStateMachine};

/// Pipeline behaviour that is not part of a collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// How long an approval request stays open.
    pub approval_timeout: Duration,
    /// Channel for manual-intervention notices.
    pub operator_channel: String,
    /// Alarms bound to every new deployment.
    pub default_alarms: Vec<(String, Severity)>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            approval_timeout: Duration::from_secs(4 * 60 * 60),
            operator_channel: "deploy-operators".to_string(),
            default_alarms: Vec::new(),
        }
    }
}

/// Errors returned by pipeline operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// No deployment with this id.
    #[error("deployment not found: {0}")]
    DeploymentNotFound(DeploymentId),

    /// The current stage has no edge to the requested one.
    #[error("invalid transition for deployment '{deployment_id}': {from} -> {to}")]
    InvalidTransition {
        /// Deployment concerned.
        deployment_id: DeploymentId,
        /// Current stage.
        from: Stage,
        /// Requested stage.
        to: Stage,
    },

    /// The deployment already finished.
    #[error("deployment '{deployment_id}' is already {status:?}")]
    AlreadyTerminal {
        /// Deployment concerned.
        deployment_id: DeploymentId,
        /// Its final status.
        status: DeploymentStatus,
    },

    /// Approved, but a bound alarm is breached (or alarms cannot be read).
    #[error("deployment '{deployment_id}' blocked by alarms: {}", alarms.join(", "))]
    AlarmBlocked {
        /// Deployment concerned.
        deployment_id: DeploymentId,
        /// Breached alarms, or the alarm source failure.
        alarms: Vec<String>,
    },

    /// Approval gate policy violation.
    #[error(transparent)]
    Approval(#[from] ApprovalError),
}
