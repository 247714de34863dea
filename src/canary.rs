//! # Canary traffic shifting
//!
//! ## Responsibility
//! Drive a deployment's production traffic through an ordered list of
//! percentage steps, soaking after each shift while polling the
//! [`AlarmWatcher`] at a fixed cadence.
//!
//! ## Guarantees
//! - Traffic is never shifted past the step active when a breach is seen
//! - A breach ends the soak immediately; the remainder is not waited out
//! - `abort` (the cancel signal) interrupts a soak wait immediately
//! - An unreadable alarm source counts as a breach
//! - An empty plan shifts straight to 100% and checks alarms once
//! - A clean run always ends at 100%, even if the plan stops short
//!
//! ## NOT Responsible For
//! - Promotion or rollback (the pipeline acts on the [`CanaryOutcome`])

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::alarm::AlarmWatcher;
use crate::model::DeploymentId;
use crate::ports::InfraError;
use crate::resilience::GuardedInfra;

// ─── Plan ─────────────────────────────────────────────────────────────────────

/// One traffic step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanaryStep {
    /// Share of production traffic, 1–100.
    pub percent: u8,
    /// Observation window after the shift.
    pub soak: Duration,
}

/// Ordered traffic steps and the alarm polling cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanaryPlan {
    /// Steps in the order they are applied. Empty means all-at-once.
    pub steps: Vec<CanaryStep>,
    /// How often alarms are checked during a soak.
    pub poll_interval: Duration,
}

impl CanaryPlan {
    /// Plan from explicit steps.
    pub fn new(steps: Vec<CanaryStep>, poll_interval: Duration) -> Self {
        Self {
            steps,
            poll_interval,
        }
    }

    /// Same soak for every percentage.
    pub fn uniform(percents: &[u8], soak: Duration, poll_interval: Duration) -> Self {
        Self::new(
            percents
                .iter()
                .map(|&percent| CanaryStep { percent, soak })
                .collect(),
            poll_interval,
        )
    }

    /// Shift directly to 100%.
    pub fn all_at_once(poll_interval: Duration) -> Self {
        Self::new(Vec::new(), poll_interval)
    }

    /// Total soak time of a clean run.
    pub fn total_soak(&self) -> Duration {
        self.steps.iter().map(|s| s.soak).sum()
    }

    /// Steps actually applied: the plan's own, closed by a 100% step with
    /// no soak when the plan stops short of full traffic.
    fn effective_steps(&self) -> Vec<CanaryStep> {
        let mut steps = self.steps.clone();
        if steps.last().map_or(true, |s| s.percent < 100) {
            steps.push(CanaryStep {
                percent: 100,
                soak: Duration::ZERO,
            });
        }
        steps
    }
}

impl Default for CanaryPlan {
    fn default() -> Self {
        Self::all_at_once(Duration::from_secs(15))
    }
}

// ─── Outcome ──────────────────────────────────────────────────────────────────

/// How a canary run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanaryOutcome {
    /// Every step soaked clean; ready to promote.
    Completed,
    /// A bound alarm fired (or alarms could not be read) at `percent`.
    Breached {
        /// Traffic in effect when the breach was observed.
        percent: u8,
        /// Breached alarm names, or a description of the source failure.
        alarms: Vec<String>,
    },
    /// The cancel signal fired.
    Aborted {
        /// Traffic in effect when cancelled.
        percent: u8,
    },
    /// A traffic shift failed after retries.
    InfraFailed {
        /// Last traffic percentage confirmed.
        percent: u8,
        /// The provider error.
        error: InfraError,
    },
}

enum Soak {
    Clean,
    Breached(Vec<String>),
    Cancelled,
}

// ─── Controller ───────────────────────────────────────────────────────────────

/// Runs canary plans.
pub struct CanaryController {
    infra: Arc<GuardedInfra>,
    watcher: Arc<AlarmWatcher>,
    plan: RwLock<CanaryPlan>,
}

impl CanaryController {
    /// Create a controller.
    pub fn new(infra: Arc<GuardedInfra>, watcher: Arc<AlarmWatcher>, plan: CanaryPlan) -> Self {
        Self {
            infra,
            watcher,
            plan: RwLock::new(plan),
        }
    }

    /// Plan used by the next run.
    pub fn plan(&self) -> CanaryPlan {
        self.plan.read().clone()
    }

    /// Replace the plan. Runs already in progress keep their plan.
    pub fn update_plan(&self, plan: CanaryPlan) {
        *self.plan.write() = plan;
    }

    /// Run the plan for `id`.
    ///
    /// `on_shift` is called with each percentage once the provider confirms
    /// the shift.
    pub async fn run(
        &self,
        id: &DeploymentId,
        cancel: &mut watch::Receiver<bool>,
        mut on_shift: impl FnMut(u8) + Send,
    ) -> CanaryOutcome {
        let plan = self.plan();
        let mut current = 0u8;

        for step in plan.effective_steps() {
            if *cancel.borrow() {
                return CanaryOutcome::Aborted { percent: current };
            }

            if let Err(error) = self.infra.shift_traffic(id, step.percent).await {
                return CanaryOutcome::InfraFailed {
                    percent: current,
                    error,
                };
            }
            current = step.percent;
            on_shift(current);
            info!(
                deployment_id = %id,
                percent = current,
                soak_s = step.soak.as_secs(),
                "traffic shifted"
            );

            match self.soak(id, step.soak, plan.poll_interval, cancel).await {
                Soak::Clean => debug!(deployment_id = %id, percent = current, "soak clean"),
                Soak::Breached(alarms) => {
                    warn!(
                        deployment_id = %id,
                        percent = current,
                        ?alarms,
                        "alarm breached during soak"
                    );
                    return CanaryOutcome::Breached {
                        percent: current,
                        alarms,
                    };
                }
                Soak::Cancelled => return CanaryOutcome::Aborted { percent: current },
            }
        }

        CanaryOutcome::Completed
    }

    async fn soak(
        &self,
        id: &DeploymentId,
        window: Duration,
        poll: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> Soak {
        let deadline = Instant::now() + window;
        loop {
            match self.watcher.breached_alarms(id).await {
                Ok(alarms) if !alarms.is_empty() => return Soak::Breached(alarms),
                Ok(_) => {}
                Err(e) => return Soak::Breached(vec![e.to_string()]),
            }

            let now = Instant::now();
            if now >= deadline {
                return Soak::Clean;
            }

            let wait = poll.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.wait_for(|c| *c) => return Soak::Cancelled,
            }
        }
    }
}
