//! Approval Gate
//!
//! ## Usage
//!
//! ```rust,ignore
//! let gate = Arc::new(ApprovalGate::new(clock, audit));
//! gate.open(&id, now + chrono::Duration::hours(4))?;
//!
//! // operator, elsewhere
//! gate.decide(&id, Verdict::Approve, "alice")?;
//!
//! // background
//! let sweeper = gate.spawn_sweeper(Duration::from_secs(60), shutdown_rx);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::ApprovalError;
use crate::audit::{AuditKind, AuditLog, AuditRecord};
use crate::clock::{elapsed_between, Clock};
use crate::metrics;
use crate::model::{Actor, ApprovalDecision, ApprovalRequest, DeploymentId, Verdict};

/// Broadcast when a request is resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalResolution {
    /// Deployment concerned.
    pub deployment_id: DeploymentId,
    /// Final decision (never `Pending`).
    pub decision: ApprovalDecision,
    /// Operator or system.
    pub actor: Actor,
    /// Resolution time.
    pub at: DateTime<Utc>,
}

struct Slot {
    request: ApprovalRequest,
    decision_tx: watch::Sender<ApprovalDecision>,
}

impl Slot {
    fn new(request: ApprovalRequest) -> Self {
        let (decision_tx, _) = watch::channel(request.decision);
        Self {
            request,
            decision_tx,
        }
    }

    fn is_pending(&self) -> bool {
        self.request.decision == ApprovalDecision::Pending
    }

    /// Resolve in place. Caller guarantees the slot is pending.
    fn resolve(
        &mut self,
        decision: ApprovalDecision,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> ApprovalResolution {
        self.request.decision = decision;
        self.request.decided_at = Some(now);
        self.request.decided_by = match &actor {
            Actor::Operator(name) => Some(name.clone()),
            Actor::System => None,
        };
        self.decision_tx.send_replace(decision);
        ApprovalResolution {
            deployment_id: self.request.deployment_id.clone(),
            decision,
            actor,
            at: now,
        }
    }
}

/// Holds approval requests and resolves them exactly once.
pub struct ApprovalGate {
    clock: Arc<dyn Clock>,
    audit: AuditLog,
    slots: Mutex<HashMap<DeploymentId, Slot>>,
    events: broadcast::Sender<ApprovalResolution>,
}

impl ApprovalGate {
    /// Create an empty gate.
    pub fn new(clock: Arc<dyn Clock>, audit: AuditLog) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            clock,
            audit,
            slots: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Open a pending request.
    ///
    /// A previously resolved request for the same deployment is replaced.
    ///
    /// # Errors
    /// [`ApprovalError::AlreadyOpen`] if a request is already pending.
    pub fn open(
        &self,
        id: &DeploymentId,
        deadline: DateTime<Utc>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let now = self.clock.now();
        let mut slots = self.slots.lock();
        if slots.get(id).is_some_and(Slot::is_pending) {
            return Err(ApprovalError::AlreadyOpen(id.clone()));
        }

        let request = ApprovalRequest {
            deployment_id: id.clone(),
            requested_at: now,
            deadline,
            decision: ApprovalDecision::Pending,
            decided_by: None,
            decided_at: None,
        };
        slots.insert(id.clone(), Slot::new(request.clone()));
        info!(deployment_id = %id, %deadline, "approval requested");
        Ok(request)
    }

    /// Record an operator's verdict.
    ///
    /// # Errors
    /// - [`ApprovalError::NotPending`] if no request is pending
    /// - [`ApprovalError::TooLate`] if the deadline has passed; the request is
    ///   marked `timed_out` as a side effect
    pub fn decide(
        &self,
        id: &DeploymentId,
        verdict: Verdict,
        operator: &str,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let now = self.clock.now();
        let (resolution, outcome) = {
            let mut slots = self.slots.lock();
            let slot = match slots.get_mut(id) {
                Some(slot) if slot.is_pending() => slot,
                _ => return Err(ApprovalError::NotPending(id.clone())),
            };

            if now >= slot.request.deadline {
                let deadline = slot.request.deadline;
                let resolution = slot.resolve(ApprovalDecision::TimedOut, Actor::System, now);
                (
                    resolution,
                    Err(ApprovalError::TooLate {
                        deployment_id: id.clone(),
                        deadline,
                    }),
                )
            } else {
                let resolution = slot.resolve(verdict.into(), Actor::operator(operator), now);
                (resolution, Ok(slot.request.clone()))
            }
        };

        self.publish(resolution);
        outcome
    }

    /// Current request for a deployment, pending or resolved.
    pub fn request(&self, id: &DeploymentId) -> Option<ApprovalRequest> {
        self.slots.lock().get(id).map(|s| s.request.clone())
    }

    /// Every pending request.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        self.slots
            .lock()
            .values()
            .filter(|s| s.is_pending())
            .map(|s| s.request.clone())
            .collect()
    }

    /// Wait until the request for `id` is resolved.
    ///
    /// Also enforces the deadline itself, so a waiter never depends on the
    /// sweeper running. Returns `Ok(None)` if `cancel` fires or the request is
    /// withdrawn.
    ///
    /// # Errors
    /// [`ApprovalError::NotPending`] if there is no request for `id`.
    pub async fn wait_for_resolution(
        &self,
        id: &DeploymentId,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Option<ApprovalDecision>, ApprovalError> {
        let (mut decision_rx, deadline) = {
            let slots = self.slots.lock();
            let slot = slots
                .get(id)
                .ok_or_else(|| ApprovalError::NotPending(id.clone()))?;
            (slot.decision_tx.subscribe(), slot.request.deadline)
        };

        loop {
            let remaining = elapsed_between(self.clock.now(), deadline);
            tokio::select! {
                resolved = decision_rx.wait_for(|d| d.is_resolved()) => {
                    return Ok(resolved.ok().map(|d| *d));
                }
                _ = cancel.wait_for(|c| *c) => {
                    debug!(deployment_id = %id, "approval wait cancelled");
                    return Ok(None);
                }
                _ = tokio::time::sleep(remaining) => {
                    self.expire(id, self.clock.now());
                }
            }
        }
    }

    /// Drop a pending request without resolving it. Waiters see `None`.
    pub fn withdraw(&self, id: &DeploymentId) -> bool {
        let mut slots = self.slots.lock();
        if slots.get(id).is_some_and(Slot::is_pending) {
            slots.remove(id);
            debug!(deployment_id = %id, "approval withdrawn");
            true
        } else {
            false
        }
    }

    /// Forget a request entirely (archival).
    pub fn forget(&self, id: &DeploymentId) {
        self.slots.lock().remove(id);
    }

    /// Time out every pending request whose deadline has passed.
    pub fn sweep_expired(&self) -> Vec<DeploymentId> {
        self.sweep_expired_at(self.clock.now())
    }

    /// [`sweep_expired`](Self::sweep_expired) against an explicit instant.
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> Vec<DeploymentId> {
        let resolutions: Vec<_> = {
            let mut slots = self.slots.lock();
            slots
                .values_mut()
                .filter(|s| s.is_pending() && now >= s.request.deadline)
                .map(|s| s.resolve(ApprovalDecision::TimedOut, Actor::System, now))
                .collect()
        };

        let expired = resolutions.iter().map(|r| r.deployment_id.clone()).collect();
        for resolution in resolutions {
            self.publish(resolution);
        }
        expired
    }

    fn expire(&self, id: &DeploymentId, now: DateTime<Utc>) {
        let resolution = {
            let mut slots = self.slots.lock();
            match slots.get_mut(id) {
                Some(slot) if slot.is_pending() && now >= slot.request.deadline => {
                    Some(slot.resolve(ApprovalDecision::TimedOut, Actor::System, now))
                }
                _ => None,
            }
        };
        if let Some(resolution) = resolution {
            self.publish(resolution);
        }
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval` until
    /// `shutdown` flips.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = gate.sweep_expired();
                        if !expired.is_empty() {
                            info!(count = expired.len(), "approval requests timed out");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("approval sweeper shutdown signal received");
                        break;
                    }
                }
            }
        })
    }

    /// Subscribe to resolutions.
    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalResolution> {
        self.events.subscribe()
    }

    /// Every request, for persistence.
    pub fn export(&self) -> Vec<ApprovalRequest> {
        let mut all: Vec<_> = self
            .slots
            .lock()
            .values()
            .map(|s| s.request.clone())
            .collect();
        all.sort_by(|a, b| a.deployment_id.cmp(&b.deployment_id));
        all
    }

    /// Load persisted requests. Deadlines are wall-clock, so a request that
    /// expired while the process was down is timed out on the next sweep.
    pub fn restore(&self, requests: Vec<ApprovalRequest>) {
        let mut slots = self.slots.lock();
        for request in requests {
            slots.insert(request.deployment_id.clone(), Slot::new(request));
        }
    }

    fn publish(&self, resolution: ApprovalResolution) {
        let cause = match resolution.decision {
            ApprovalDecision::TimedOut => "approval deadline passed".to_string(),
            decision => format!("approval {} by {}", decision.as_str(), resolution.actor),
        };
        info!(
            deployment_id = %resolution.deployment_id,
            decision = resolution.decision.as_str(),
            actor = %resolution.actor,
            "approval resolved"
        );
        metrics::inc_approval(resolution.decision.as_str());
        self.audit.append(AuditRecord {
            at: resolution.at,
            deployment_id: Some(resolution.deployment_id.clone()),
            actor: resolution.actor.clone(),
            cause,
            kind: AuditKind::ApprovalDecision {
                decision: resolution.decision,
            },
        });
        // No subscribers is fine.
        let _ = self.events.send(resolution);
    }
}
