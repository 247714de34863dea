//! Pipeline State Machine
//!
//! ## Usage
//!
//! ```rust,ignore
//! let pipeline = Arc::new(PipelineStateMachine::new(components, settings));
//! let listener = pipeline.spawn_approval_listener(shutdown_rx);
//!
//! let deployment = pipeline.on_build_complete("abc123", "registry/app@sha256:…");
//! pipeline.advance(&deployment.id).await?;   // staging
//! // operator approves through the gate
//! let done = pipeline.run(&deployment.id).await?;
//! ```
//!
//! Each deployment lives in its own slot: the record behind a read/write lock
//! (so `status` never waits), an async transition lock held for the whole
//! stage action, and a cancel flag that `abort` raises before queuing for the
//! transition lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{PipelineError, PipelineSettings};
use crate::alarm::AlarmWatcher;
use crate::approval::ApprovalGate;
use crate::audit::{AuditKind, AuditLog, AuditRecord};
use crate::canary::{CanaryController, CanaryOutcome};
use crate::clock::{elapsed_between, saturating_after, Clock};
use crate::metrics;
use crate::model::{
    Actor, AlarmBinding, ApprovalDecision, Deployment, DeploymentId, Severity, Stage,
};
use crate::ports::{Environment, Health, NotificationDispatcher};
use crate::resilience::GuardedInfra;

// ─── Slot ─────────────────────────────────────────────────────────────────────

struct DeploymentSlot {
    record: RwLock<Deployment>,
    transition: Mutex<()>,
    cancel: watch::Sender<bool>,
}

impl DeploymentSlot {
    fn new(deployment: Deployment) -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        Arc::new(Self {
            record: RwLock::new(deployment),
            transition: Mutex::new(()),
            cancel,
        })
    }

    fn snapshot(&self) -> Deployment {
        self.record.read().clone()
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// Shared collaborators of the state machine.
pub struct PipelineComponents {
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Infrastructure calls with retry.
    pub infra: Arc<GuardedInfra>,
    /// Alarm evaluation.
    pub watcher: Arc<AlarmWatcher>,
    /// Approval requests.
    pub gate: Arc<ApprovalGate>,
    /// Canary runs.
    pub canary: Arc<CanaryController>,
    /// Operator notifications.
    pub dispatcher: Arc<dyn NotificationDispatcher>,
    /// Audit trail.
    pub audit: AuditLog,
}

// ─── State machine ────────────────────────────────────────────────────────────

/// Owns every deployment and moves it along the stage graph.
pub struct PipelineStateMachine {
    clock: Arc<dyn Clock>,
    infra: Arc<GuardedInfra>,
    watcher: Arc<AlarmWatcher>,
    gate: Arc<ApprovalGate>,
    canary: Arc<CanaryController>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    audit: AuditLog,
    settings: PipelineSettings,
    deployments: DashMap<DeploymentId, Arc<DeploymentSlot>>,
}

impl PipelineStateMachine {
    /// Create an empty pipeline.
    pub fn new(components: PipelineComponents, settings: PipelineSettings) -> Self {
        Self {
            clock: components.clock,
            infra: components.infra,
            watcher: components.watcher,
            gate: components.gate,
            canary: components.canary,
            dispatcher: components.dispatcher,
            audit: components.audit,
            settings,
            deployments: DashMap::new(),
        }
    }

    /// Settings in effect.
    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// The approval gate deployments wait at.
    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    /// The alarm watcher holding deployment bindings.
    pub fn watcher(&self) -> &Arc<AlarmWatcher> {
        &self.watcher
    }

    /// The canary controller used in production.
    pub fn canary(&self) -> &Arc<CanaryController> {
        &self.canary
    }

    // ── Entry points ─────────────────────────────────────────────────────────

    /// Start a deployment for a finished build. It begins in `DeployStaging`
    /// with the configured default alarms bound.
    pub fn on_build_complete(
        &self,
        revision: impl Into<String>,
        artifact_ref: impl Into<String>,
    ) -> Deployment {
        let now = self.clock.now();
        let id = DeploymentId::generate();
        let mut deployment = Deployment::new(id.clone(), revision, artifact_ref, now);
        if deployment
            .transition_to(Stage::DeployStaging, "build complete", Actor::System, now)
            .is_ok()
        {
            self.record_transition(
                &id,
                Stage::Build,
                Stage::DeployStaging,
                0,
                Actor::System,
                "build complete",
                now,
            );
        }

        for (alarm_name, severity) in &self.settings.default_alarms {
            self.watcher.bind(AlarmBinding {
                alarm_name: alarm_name.clone(),
                deployment_id: id.clone(),
                severity: *severity,
            });
        }

        info!(deployment_id = %id, revision = %deployment.revision, "deployment created");
        self.deployments
            .insert(id, DeploymentSlot::new(deployment.clone()));
        deployment
    }

    /// Record a build that failed. The deployment goes straight to `Failed`.
    pub fn on_build_failed(&self, revision: impl Into<String>, reason: &str) -> Deployment {
        let now = self.clock.now();
        let id = DeploymentId::generate();
        let mut deployment = Deployment::new(id.clone(), revision, "", now);
        let cause = format!("build failed: {reason}");
        if deployment
            .transition_to(Stage::Failed, cause.clone(), Actor::System, now)
            .is_ok()
        {
            self.record_transition(
                &id,
                Stage::Build,
                Stage::Failed,
                0,
                Actor::System,
                &cause,
                now,
            );
        }
        self.deployments
            .insert(id, DeploymentSlot::new(deployment.clone()));
        deployment
    }

    /// Bind an extra alarm to a deployment.
    ///
    /// # Errors
    /// [`PipelineError::DeploymentNotFound`] for an unknown id.
    pub fn bind_alarm(
        &self,
        id: &DeploymentId,
        alarm_name: impl Into<String>,
        severity: Severity,
    ) -> Result<(), PipelineError> {
        self.slot(id)?;
        self.watcher.bind(AlarmBinding {
            alarm_name: alarm_name.into(),
            deployment_id: id.clone(),
            severity,
        });
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    /// Current state of a deployment. Never waits on an in-flight transition.
    ///
    /// # Errors
    /// [`PipelineError::DeploymentNotFound`] for an unknown id.
    pub fn status(&self, id: &DeploymentId) -> Result<Deployment, PipelineError> {
        Ok(self.slot(id)?.snapshot())
    }

    /// Every deployment, oldest first.
    pub fn deployments(&self) -> Vec<Deployment> {
        let mut all: Vec<_> = self.deployments.iter().map(|e| e.value().snapshot()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    // ── Stage actions ────────────────────────────────────────────────────────

    /// Perform the current stage's action and move on if it succeeds.
    ///
    /// - `DeployStaging`: deploy, health check, alarm check; any failure
    ///   ends in `Failed`
    /// - `AwaitApproval`: wait for the approval to resolve; approved moves to
    ///   `DeployProduction` unless an alarm is breached, rejected or timed out
    ///   halts the deployment
    /// - `DeployProduction`: run the canary, then promote or roll back
    ///
    /// Returns the deployment as left by the action. An `abort` during the
    /// action returns early with the stage unchanged; `abort` finishes it.
    ///
    /// # Errors
    /// - [`PipelineError::DeploymentNotFound`] for an unknown id
    /// - [`PipelineError::AlreadyTerminal`] once the deployment has finished
    /// - [`PipelineError::AlarmBlocked`] if approved while an alarm is breached
    /// - [`PipelineError::InvalidTransition`] for a deployment still in `Build`
    pub async fn advance(&self, id: &DeploymentId) -> Result<Deployment, PipelineError> {
        let slot = self.slot(id)?;
        let _transition = slot.transition.lock().await;
        let current = slot.snapshot();
        if current.is_terminal() {
            return Err(PipelineError::AlreadyTerminal {
                deployment_id: id.clone(),
                status: current.status,
            });
        }

        debug!(deployment_id = %id, stage = %current.stage, "advancing");
        match current.stage {
            Stage::DeployStaging => self.run_staging(&slot, &current).await?,
            Stage::AwaitApproval => self.run_approval(&slot, id).await?,
            Stage::DeployProduction => self.run_production(&slot, id).await?,
            from => {
                return Err(PipelineError::InvalidTransition {
                    deployment_id: id.clone(),
                    from,
                    to: Stage::DeployStaging,
                })
            }
        }
        Ok(slot.snapshot())
    }

    /// Advance until the deployment is terminal.
    ///
    /// Returns early if the deployment is aborted, after the abort finishes.
    ///
    /// # Errors
    /// As [`advance`](Self::advance), except `AlreadyTerminal`.
    pub async fn run(&self, id: &DeploymentId) -> Result<Deployment, PipelineError> {
        let slot = self.slot(id)?;
        loop {
            let deployment = match self.advance(id).await {
                Ok(deployment) => deployment,
                Err(PipelineError::AlreadyTerminal { .. }) => return Ok(slot.snapshot()),
                Err(e) => return Err(e),
            };
            if deployment.is_terminal() {
                return Ok(deployment);
            }
            if slot.is_cancelled() {
                let _abort_done = slot.transition.lock().await;
                return Ok(slot.snapshot());
            }
        }
    }

    async fn run_staging(
        &self,
        slot: &DeploymentSlot,
        current: &Deployment,
    ) -> Result<(), PipelineError> {
        let id = &current.id;

        let failure = match self
            .infra
            .deploy(id, Environment::Staging, &current.artifact_ref)
            .await
        {
            Err(e) => Some(format!("staging deploy failed: {e}")),
            Ok(()) => match self.infra.get_health(id).await {
                Ok(Health::Healthy) => None,
                Ok(Health::Unhealthy(reason)) => Some(format!("staging unhealthy: {reason}")),
                Err(e) => Some(format!("staging health check failed: {e}")),
            },
        };
        let failure = match failure {
            Some(cause) => Some(cause),
            None => match self.watcher.breached_alarms(id).await {
                Ok(alarms) if alarms.is_empty() => None,
                Ok(alarms) => Some(format!("alarms breached in staging: {}", alarms.join(", "))),
                Err(e) => Some(format!("alarm check failed: {e}")),
            },
        };
        if let Some(cause) = failure {
            return self.transition(slot, Stage::Failed, &cause, Actor::System);
        }

        if slot.is_cancelled() {
            debug!(deployment_id = %id, "abort pending, staging result not applied");
            return Ok(());
        }

        let deadline = saturating_after(self.clock.now(), self.settings.approval_timeout);
        self.gate.open(id, deadline)?;
        self.transition(slot, Stage::AwaitApproval, "staging healthy", Actor::System)
    }

    async fn run_approval(
        &self,
        slot: &DeploymentSlot,
        id: &DeploymentId,
    ) -> Result<(), PipelineError> {
        let mut cancel = slot.cancel.subscribe();
        let decision = match self.gate.request(id).map(|r| r.decision) {
            Some(decision) if decision.is_resolved() => Some(decision),
            Some(_) => self.gate.wait_for_resolution(id, &mut cancel).await?,
            None => {
                let deadline = saturating_after(self.clock.now(), self.settings.approval_timeout);
                self.gate.open(id, deadline)?;
                self.gate.wait_for_resolution(id, &mut cancel).await?
            }
        };

        match decision {
            Some(ApprovalDecision::Approved) => {
                let alarms = match self.watcher.breached_alarms(id).await {
                    Ok(alarms) => alarms,
                    Err(e) => vec![e.to_string()],
                };
                if !alarms.is_empty() {
                    warn!(deployment_id = %id, ?alarms, "approved deployment blocked by alarms");
                    return Err(PipelineError::AlarmBlocked {
                        deployment_id: id.clone(),
                        alarms,
                    });
                }
                let approver = self
                    .gate
                    .request(id)
                    .and_then(|r| r.decided_by)
                    .map(Actor::Operator)
                    .unwrap_or(Actor::System);
                self.transition(slot, Stage::DeployProduction, "approved", approver)
            }
            Some(decision @ (ApprovalDecision::Rejected | ApprovalDecision::TimedOut)) => {
                self.halt(slot, decision);
                Ok(())
            }
            Some(ApprovalDecision::Pending) | None => Ok(()),
        }
    }

    async fn run_production(
        &self,
        slot: &DeploymentSlot,
        id: &DeploymentId,
    ) -> Result<(), PipelineError> {
        let mut cancel = slot.cancel.subscribe();
        let clock = &self.clock;
        let outcome = self
            .canary
            .run(id, &mut cancel, |percent| {
                let mut record = slot.record.write();
                record.traffic_percent = percent;
                record.updated_at = clock.now();
            })
            .await;

        match outcome {
            CanaryOutcome::Completed => {
                if let Err(e) = self.infra.promote(id).await {
                    let cause = format!("promote failed: {e}");
                    return self.rollback_and_finish(slot, id, &cause, Actor::System).await;
                }
                // Promotion may have spent several backoffs; alarms are read again.
                let cause = match self.watcher.breached_alarms(id).await {
                    Ok(alarms) if alarms.is_empty() => None,
                    Ok(alarms) => Some(format!(
                        "alarm breached during promote: {}",
                        alarms.join(", ")
                    )),
                    Err(e) => Some(format!("alarm check after promote failed: {e}")),
                };
                match cause {
                    None => self.transition(
                        slot,
                        Stage::Succeeded,
                        "canary clean, promoted",
                        Actor::System,
                    ),
                    Some(cause) => {
                        warn!(deployment_id = %id, %cause, "promotion not confirmed");
                        self.rollback_and_finish(slot, id, &cause, Actor::System).await
                    }
                }
            }
            CanaryOutcome::Breached { percent, alarms } => {
                let cause = format!("alarm breached at {percent}%: {}", alarms.join(", "));
                self.rollback_and_finish(slot, id, &cause, Actor::System).await
            }
            CanaryOutcome::InfraFailed { percent, error } => {
                let cause = format!("traffic shift failed at {percent}%: {error}");
                self.rollback_and_finish(slot, id, &cause, Actor::System).await
            }
            CanaryOutcome::Aborted { percent } => {
                debug!(deployment_id = %id, percent, "canary interrupted by abort");
                Ok(())
            }
        }
    }

    // ── Abort / rollback ─────────────────────────────────────────────────────

    /// Stop a deployment and roll it back.
    ///
    /// Interrupts any in-progress soak or approval wait, then rolls back from
    /// `DeployStaging`, `AwaitApproval` or `DeployProduction`. A deployment
    /// still in `Build` is marked `Failed` instead. Calls after the first are
    /// no-ops returning the current state.
    ///
    /// # Errors
    /// [`PipelineError::DeploymentNotFound`] for an unknown id.
    pub async fn abort(
        &self,
        id: &DeploymentId,
        actor: Actor,
        reason: &str,
    ) -> Result<Deployment, PipelineError> {
        let slot = self.slot(id)?;
        if slot.snapshot().is_terminal() {
            return Ok(slot.snapshot());
        }

        slot.cancel.send_replace(true);
        let _transition = slot.transition.lock().await;
        let current = slot.snapshot();
        if current.is_terminal() {
            return Ok(current);
        }

        info!(
            deployment_id = %id,
            stage = %current.stage,
            actor = %actor,
            reason,
            "abort requested"
        );
        let cause = format!("aborted: {reason}");
        match current.stage {
            Stage::Build => self.transition(&slot, Stage::Failed, &cause, actor)?,
            Stage::AwaitApproval => {
                self.gate.withdraw(id);
                self.rollback_and_finish(&slot, id, &cause, actor).await?;
            }
            Stage::DeployStaging | Stage::DeployProduction => {
                self.rollback_and_finish(&slot, id, &cause, actor).await?;
            }
            Stage::Succeeded | Stage::Failed | Stage::RolledBack => {}
        }
        Ok(slot.snapshot())
    }

    async fn rollback_and_finish(
        &self,
        slot: &DeploymentSlot,
        id: &DeploymentId,
        cause: &str,
        actor: Actor,
    ) -> Result<(), PipelineError> {
        let confirmed = match self.infra.rollback(id).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    deployment_id = %id,
                    error = %e,
                    fatal = true,
                    "rollback failed after retries, manual intervention required"
                );
                false
            }
        };

        metrics::inc_rollback(confirmed);
        self.audit.append(AuditRecord {
            at: self.clock.now(),
            deployment_id: Some(id.clone()),
            actor: actor.clone(),
            cause: cause.to_string(),
            kind: AuditKind::Rollback { confirmed },
        });

        self.transition(slot, Stage::RolledBack, cause, actor)?;
        {
            let mut record = slot.record.write();
            if confirmed {
                record.traffic_percent = 0;
            } else {
                record.manual_intervention_required = true;
            }
        }

        if !confirmed {
            self.notify_operator(id, cause).await;
        }
        Ok(())
    }

    async fn notify_operator(&self, id: &DeploymentId, cause: &str) {
        let snapshot = match self.status(id) {
            Ok(snapshot) => snapshot,
            Err(_) => return,
        };
        let message_id = format!("manual-intervention/{id}");
        let payload = json!({
            "deployment_id": id,
            "revision": snapshot.revision,
            "stage": snapshot.stage,
            "traffic_percent": snapshot.traffic_percent,
            "cause": cause,
            "manual_intervention_required": true,
        })
        .to_string();

        if let Err(e) = self
            .dispatcher
            .send(&self.settings.operator_channel, &message_id, &payload)
            .await
        {
            error!(deployment_id = %id, error = %e, "operator notification failed");
        }
    }

    // ── Approval halts ───────────────────────────────────────────────────────

    fn halt(&self, slot: &DeploymentSlot, decision: ApprovalDecision) {
        let now = self.clock.now();
        let id = {
            let mut record = slot.record.write();
            if record.is_terminal() || record.stage != Stage::AwaitApproval {
                return;
            }
            record.halt(now);
            record.id.clone()
        };
        let cause = match decision {
            ApprovalDecision::TimedOut => "approval timed out",
            _ => "approval rejected",
        };
        info!(deployment_id = %id, cause, "deployment halted at approval gate");
        self.audit.append(AuditRecord {
            at: now,
            deployment_id: Some(id),
            actor: Actor::System,
            cause: cause.to_string(),
            kind: AuditKind::Halted,
        });
    }

    async fn apply_resolution(&self, id: &DeploymentId, decision: ApprovalDecision) {
        if !matches!(
            decision,
            ApprovalDecision::Rejected | ApprovalDecision::TimedOut
        ) {
            return;
        }
        let Ok(slot) = self.slot(id) else {
            return;
        };
        let _transition = slot.transition.lock().await;
        self.halt(&slot, decision);
    }

    /// Halt every deployment waiting at the gate whose request already
    /// resolved negatively.
    pub async fn reconcile_approvals(&self) {
        let waiting: Vec<DeploymentId> = self
            .deployments
            .iter()
            .filter(|e| {
                let d = e.value().record.read();
                !d.is_terminal() && d.stage == Stage::AwaitApproval
            })
            .map(|e| e.key().clone())
            .collect();
        for id in waiting {
            if let Some(request) = self.gate.request(&id) {
                self.apply_resolution(&id, request.decision).await;
            }
        }
    }

    /// Apply rejected and timed-out approvals as they happen, so deployments
    /// halt even when nobody is blocked in [`advance`](Self::advance).
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn spawn_approval_listener(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        let mut resolutions = self.gate.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = resolutions.recv() => match event {
                        Ok(resolution) => {
                            pipeline
                                .apply_resolution(&resolution.deployment_id, resolution.decision)
                                .await;
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "approval listener lagged, reconciling");
                            pipeline.reconcile_approvals().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => {
                        info!("approval listener shutdown signal received");
                        break;
                    }
                }
            }
        })
    }

    // ── Housekeeping ─────────────────────────────────────────────────────────

    /// Remove terminal deployments last updated at least `retention` ago,
    /// along with their bindings and approval records.
    pub fn archive_terminal(&self, retention: std::time::Duration) -> Vec<DeploymentId> {
        self.archive_terminal_at(self.clock.now(), retention)
    }

    /// [`archive_terminal`](Self::archive_terminal) against an explicit instant.
    pub fn archive_terminal_at(
        &self,
        now: DateTime<Utc>,
        retention: std::time::Duration,
    ) -> Vec<DeploymentId> {
        let expired: Vec<DeploymentId> = self
            .deployments
            .iter()
            .filter(|e| {
                let d = e.value().record.read();
                d.is_terminal() && elapsed_between(d.updated_at, now) >= retention
            })
            .map(|e| e.key().clone())
            .collect();

        for id in &expired {
            self.deployments.remove(id);
            self.watcher.unbind_deployment(id);
            self.gate.forget(id);
            debug!(deployment_id = %id, "deployment archived");
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "terminal deployments archived");
        }
        expired
    }

    /// Every deployment record, for persistence.
    pub fn export(&self) -> Vec<Deployment> {
        self.deployments()
    }

    /// Load persisted deployments. In-flight canaries restart from their
    /// first step on the next `advance`.
    pub fn restore(&self, deployments: Vec<Deployment>) {
        for deployment in deployments {
            self.deployments
                .insert(deployment.id.clone(), DeploymentSlot::new(deployment));
        }
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn slot(&self, id: &DeploymentId) -> Result<Arc<DeploymentSlot>, PipelineError> {
        self.deployments
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| PipelineError::DeploymentNotFound(id.clone()))
    }

    fn transition(
        &self,
        slot: &DeploymentSlot,
        to: Stage,
        cause: &str,
        actor: Actor,
    ) -> Result<(), PipelineError> {
        let now = self.clock.now();
        let (id, entry) = {
            let mut record = slot.record.write();
            let id = record.id.clone();
            let entry = record
                .transition_to(to, cause, actor, now)
                .map(Clone::clone)
                .map_err(|edge| PipelineError::InvalidTransition {
                    deployment_id: id.clone(),
                    from: edge.from,
                    to: edge.to,
                })?;
            (id, entry)
        };
        self.record_transition(
            &id,
            entry.from,
            entry.to,
            entry.traffic_percent,
            entry.actor,
            &entry.cause,
            now,
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn record_transition(
        &self,
        id: &DeploymentId,
        from: Stage,
        to: Stage,
        traffic_percent: u8,
        actor: Actor,
        cause: &str,
        at: DateTime<Utc>,
    ) {
        info!(deployment_id = %id, %from, %to, traffic_percent, cause, "stage transition");
        metrics::inc_transition(from.as_str(), to.as_str());
        self.audit.append(AuditRecord {
            at,
            deployment_id: Some(id.clone()),
            actor,
            cause: cause.to_string(),
            kind: AuditKind::StageTransition {
                from,
                to,
                traffic_percent,
            },
        });
    }
}
