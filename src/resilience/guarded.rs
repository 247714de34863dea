//! Retrying infrastructure facade
//!
//! Every [`InfrastructureProvider`] call made by the pipeline and the canary
//! goes through here: bounded by a per-call timeout, retried per the
//! configured [`RetryPolicy`] while the error is retryable, and counted in
//! `deploy_infra_call_failures_total` once retries are exhausted.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::retry::{retry_with_timeout, RetryPolicy};
use crate::metrics;
use crate::model::DeploymentId;
use crate::ports::{Environment, Health, InfraError, InfrastructureProvider};

/// [`InfrastructureProvider`] wrapped in timeout and retry.
pub struct GuardedInfra {
    provider: Arc<dyn InfrastructureProvider>,
    policy: RetryPolicy,
    per_call: Duration,
}

impl GuardedInfra {
    /// Wrap `provider`.
    pub fn new(
        provider: Arc<dyn InfrastructureProvider>,
        policy: RetryPolicy,
        per_call: Duration,
    ) -> Self {
        Self {
            provider,
            policy,
            per_call,
        }
    }

    /// Retry policy in effect.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// `deploy` with retry.
    ///
    /// # Errors
    /// The last [`InfraError`] once retries are exhausted or on a
    /// non-retryable error.
    pub async fn deploy(
        &self,
        id: &DeploymentId,
        environment: Environment,
        artifact_ref: &str,
    ) -> Result<(), InfraError> {
        let provider = &self.provider;
        self.call("deploy", id, || provider.deploy(id, environment, artifact_ref))
            .await
    }

    /// `shift_traffic` with retry.
    ///
    /// # Errors
    /// See [`deploy`](Self::deploy).
    pub async fn shift_traffic(&self, id: &DeploymentId, percent: u8) -> Result<(), InfraError> {
        let provider = &self.provider;
        self.call("shift_traffic", id, || provider.shift_traffic(id, percent))
            .await
    }

    /// `promote` with retry.
    ///
    /// # Errors
    /// See [`deploy`](Self::deploy).
    pub async fn promote(&self, id: &DeploymentId) -> Result<(), InfraError> {
        let provider = &self.provider;
        self.call("promote", id, || provider.promote(id)).await
    }

    /// `rollback` with retry.
    ///
    /// # Errors
    /// See [`deploy`](Self::deploy).
    pub async fn rollback(&self, id: &DeploymentId) -> Result<(), InfraError> {
        let provider = &self.provider;
        self.call("rollback", id, || provider.rollback(id)).await
    }

    /// `get_health` with retry.
    ///
    /// # Errors
    /// See [`deploy`](Self::deploy).
    pub async fn get_health(&self, id: &DeploymentId) -> Result<Health, InfraError> {
        let provider = &self.provider;
        self.call("get_health", id, || provider.get_health(id)).await
    }

    async fn call<T, F, Fut>(
        &self,
        op: &'static str,
        id: &DeploymentId,
        f: F,
    ) -> Result<T, InfraError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InfraError>>,
    {
        retry_with_timeout(&self.policy, self.per_call, f, InfraError::is_retryable)
            .await
            .map_err(|e| {
                metrics::inc_infra_failure(op);
                warn!(deployment_id = %id, op, error = %e, "infrastructure call failed");
                e
            })
    }
}
