//! External collaborator abstractions
//!
//! The orchestrator never talks to a cloud provider directly. It drives:
//! - [`AlarmSource`]: read-only alarm states
//! - [`InfrastructureProvider`]: traffic shifting, promotion, rollback, health
//! - [`NotificationDispatcher`]: idempotent message delivery to named channels
//!
//! All traits are object-safe and used as `Arc<dyn Trait>`. Implementations
//! must be safe to retry: every call may be repeated after a timeout.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{AlarmRecord, AlarmState, DeploymentId};
use crate::resilience::retry::CallTimeout;

// ============================================================================
// Errors
// ============================================================================

/// Failure of an infrastructure call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InfraError {
    /// Timeout, throttling or 5xx; worth retrying.
    #[error("transient infrastructure error: {0}")]
    Transient(String),

    /// The per-call timeout elapsed.
    #[error("infrastructure call timed out after {0:?}")]
    Timeout(Duration),

    /// The provider refused the request; retrying will not help.
    #[error("infrastructure rejected request: {0}")]
    Rejected(String),
}

impl InfraError {
    /// Whether the retry policy should try again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, InfraError::Rejected(_))
    }
}

impl From<CallTimeout> for InfraError {
    fn from(t: CallTimeout) -> Self {
        InfraError::Timeout(t.0)
    }
}

/// Failure reading alarm states.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AlarmSourceError {
    /// The source could not be reached or answered with an error.
    #[error("alarm source unavailable: {0}")]
    Unavailable(String),
}

/// Failure delivering a notification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The channel is not configured on the dispatcher.
    #[error("unknown notification channel: {0}")]
    UnknownChannel(String),

    /// Delivery failed; the caller may retry with the same message id.
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

// ============================================================================
// Alarm source
// ============================================================================

/// Read-only view of alarm states.
#[async_trait]
pub trait AlarmSource: Send + Sync {
    /// Current state of each named alarm.
    ///
    /// Names unknown to the source are omitted from the result.
    async fn get_alarm_states(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, AlarmRecord>, AlarmSourceError>;

    /// Every alarm currently in `state`.
    async fn alarms_in_state(&self, state: AlarmState)
        -> Result<Vec<AlarmRecord>, AlarmSourceError>;
}

// ============================================================================
// Infrastructure provider
// ============================================================================

/// Target environment for a deploy call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Pre-production environment.
    Staging,
    /// Production environment.
    Production,
}

/// Health reported by the provider for a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Health {
    /// All targets healthy.
    Healthy,
    /// At least one target failing.
    Unhealthy(String),
}

/// Actions the pipeline performs on the underlying platform.
///
/// Every method must be idempotent or check-before-acting.
#[async_trait]
pub trait InfrastructureProvider: Send + Sync {
    /// Roll out `artifact_ref` to `environment` without shifting production traffic.
    async fn deploy(
        &self,
        deployment_id: &DeploymentId,
        environment: Environment,
        artifact_ref: &str,
    ) -> Result<(), InfraError>;

    /// Route `percent` of production traffic to the deployment.
    async fn shift_traffic(&self, deployment_id: &DeploymentId, percent: u8)
        -> Result<(), InfraError>;

    /// Make the deployment the new stable baseline.
    async fn promote(&self, deployment_id: &DeploymentId) -> Result<(), InfraError>;

    /// Restore the previous stable revision.
    async fn rollback(&self, deployment_id: &DeploymentId) -> Result<(), InfraError>;

    /// Current health of the deployment's targets.
    async fn get_health(&self, deployment_id: &DeploymentId) -> Result<Health, InfraError>;
}

// ============================================================================
// Notification dispatcher
// ============================================================================

/// Delivers messages to named channels.
///
/// Implementations deduplicate on `message_id`: sending the same id twice
/// delivers at most once.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    /// Send `payload` to `channel`.
    async fn send(&self, channel: &str, message_id: &str, payload: &str)
        -> Result<(), DispatchError>;
}
