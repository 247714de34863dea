//! Manual approval gate
//!
//! ## Responsibility
//! Hold one pending approval per deployment, bounded by a wall-clock
//! deadline, and resolve it exactly once.
//!
//! ## Guarantees
//! - At most one `decide` succeeds per request
//! - A pending request past its deadline becomes `timed_out` exactly once,
//!   either on the next sweep or on the first late `decide`
//! - Every resolution is audited and broadcast to subscribers
//!
//! ## NOT Responsible For
//! - Moving the deployment (the pipeline listens for resolutions)

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::DeploymentId;

pub mod gate;

pub use gate::{ApprovalGate, ApprovalResolution};

/// Approval policy violations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApprovalError {
    /// A pending request already exists for the deployment.
    #[error("approval already pending for deployment {0}")]
    AlreadyOpen(DeploymentId),

    /// There is no pending request for the deployment.
    #[error("no pending approval for deployment {0}")]
    NotPending(DeploymentId),

    /// The decision arrived after the deadline; the request is now timed out.
    #[error("approval for deployment {deployment_id} closed at {deadline}")]
    TooLate {
        /// Deployment concerned.
        deployment_id: DeploymentId,
        /// The missed deadline.
        deadline: DateTime<Utc>,
    },
}
