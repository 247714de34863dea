//! Operator control surface
//!
//! The four operator actions (`approve`, `reject`, `abort`, `status`) over a
//! running [`PipelineStateMachine`]. Transport (CLI, HTTP) is left to the
//! embedding binary.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::model::{Actor, AlarmBinding, ApprovalRequest, Deployment, DeploymentId, Verdict};
use crate::pipeline::{PipelineError, PipelineStateMachine};

/// Everything an operator needs to judge a deployment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    /// The deployment record, transition log included.
    pub deployment: Deployment,
    /// Latest approval request, if one was ever opened.
    pub approval: Option<ApprovalRequest>,
    /// Alarms that can roll the deployment back.
    pub bindings: Vec<AlarmBinding>,
}

/// Operator-facing actions.
#[derive(Clone)]
pub struct OperatorConsole {
    pipeline: Arc<PipelineStateMachine>,
}

impl OperatorConsole {
    /// Wrap a pipeline.
    pub fn new(pipeline: Arc<PipelineStateMachine>) -> Self {
        Self { pipeline }
    }

    /// Approve the pending request of `id`.
    ///
    /// # Errors
    /// - [`PipelineError::DeploymentNotFound`] for an unknown id
    /// - [`PipelineError::Approval`] if nothing is pending or the deadline passed
    pub fn approve(
        &self,
        id: &DeploymentId,
        operator: &str,
    ) -> Result<ApprovalRequest, PipelineError> {
        self.decide(id, Verdict::Approve, operator)
    }

    /// Reject the pending request of `id`.
    ///
    /// # Errors
    /// As [`approve`](Self::approve).
    pub fn reject(
        &self,
        id: &DeploymentId,
        operator: &str,
    ) -> Result<ApprovalRequest, PipelineError> {
        self.decide(id, Verdict::Reject, operator)
    }

    fn decide(
        &self,
        id: &DeploymentId,
        verdict: Verdict,
        operator: &str,
    ) -> Result<ApprovalRequest, PipelineError> {
        self.pipeline.status(id)?;
        info!(deployment_id = %id, operator, ?verdict, "operator decision");
        Ok(self.pipeline.gate().decide(id, verdict, operator)?)
    }

    /// Abort and roll back `id`. Idempotent.
    ///
    /// # Errors
    /// [`PipelineError::DeploymentNotFound`] for an unknown id.
    pub async fn abort(
        &self,
        id: &DeploymentId,
        operator: &str,
        reason: &str,
    ) -> Result<Deployment, PipelineError> {
        self.pipeline
            .abort(id, Actor::operator(operator), reason)
            .await
    }

    /// Current state of `id`.
    ///
    /// # Errors
    /// [`PipelineError::DeploymentNotFound`] for an unknown id.
    pub fn status(&self, id: &DeploymentId) -> Result<StatusReport, PipelineError> {
        let deployment = self.pipeline.status(id)?;
        Ok(StatusReport {
            approval: self.pipeline.gate().request(id),
            bindings: self.pipeline.watcher().bindings_for(id),
            deployment,
        })
    }
}
