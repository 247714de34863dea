//! # Orchestrator assembly
//!
//! ## Responsibility
//! Build every component from an [`OrchestratorConfig`] and a set of
//! external collaborators, spawn the background loops, and move state in
//! and out of [`StateSnapshot`]s.
//!
//! ## Guarantees
//! - All components share one [`Clock`] and one [`AuditLog`]
//! - Background loops stop when the shutdown flag flips
//! - Config reloads update the escalation policy and canary plan in place;
//!   running canaries keep the plan they started with
//!
//! ## NOT Responsible For
//! - Watching the config file (see [`ConfigWatcher`](crate::config::watcher::ConfigWatcher))
//! - Choosing when to snapshot

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::alarm::AlarmWatcher;
use crate::approval::ApprovalGate;
use crate::audit::AuditLog;
use crate::canary::CanaryController;
use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::control::OperatorConsole;
use crate::escalation::EscalationScheduler;
use crate::pipeline::{PipelineComponents, PipelineStateMachine};
use crate::ports::{AlarmSource, InfrastructureProvider, NotificationDispatcher};
use crate::resilience::GuardedInfra;
use crate::store::{StateSnapshot, SNAPSHOT_VERSION};

/// The external systems the orchestrator talks to.
pub struct Collaborators {
    /// Alarm states.
    pub alarm_source: Arc<dyn AlarmSource>,
    /// Deploy, traffic and health operations.
    pub infrastructure: Arc<dyn InfrastructureProvider>,
    /// Outbound notifications.
    pub dispatcher: Arc<dyn NotificationDispatcher>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// Handles for all spawned background tasks.
pub struct BackgroundHandles {
    /// Approval deadline sweeper.
    pub sweeper: JoinHandle<()>,
    /// Escalation scheduler loop.
    pub escalation: JoinHandle<()>,
    /// Applies approval resolutions to deployments.
    pub approval_listener: JoinHandle<()>,
    /// Archives terminal deployments past retention.
    pub archiver: JoinHandle<()>,
    /// Applies reloaded configs, when a config stream was supplied.
    pub config: Option<JoinHandle<()>>,
}

impl BackgroundHandles {
    /// Wait for every task to finish.
    pub async fn join(self) {
        let _ = self.sweeper.await;
        let _ = self.escalation.await;
        let _ = self.approval_listener.await;
        let _ = self.archiver.await;
        if let Some(config) = self.config {
            let _ = config.await;
        }
    }
}

/// A fully wired orchestrator instance.
pub struct Orchestrator {
    config: RwLock<OrchestratorConfig>,
    clock: Arc<dyn Clock>,
    audit: AuditLog,
    gate: Arc<ApprovalGate>,
    watcher: Arc<AlarmWatcher>,
    canary: Arc<CanaryController>,
    scheduler: Arc<EscalationScheduler>,
    pipeline: Arc<PipelineStateMachine>,
}

impl Orchestrator {
    /// Wire up every component. Nothing is spawned until
    /// [`spawn_background`](Self::spawn_background).
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            alarm_source,
            infrastructure,
            dispatcher,
            clock,
        } = collaborators;
        let audit = AuditLog::new();

        let infra = Arc::new(GuardedInfra::new(
            infrastructure,
            config.retry_policy(),
            config.call_timeout(),
        ));
        let watcher = Arc::new(AlarmWatcher::new(Arc::clone(&alarm_source), config.cache_ttl()));
        let gate = Arc::new(ApprovalGate::new(Arc::clone(&clock), audit.clone()));
        let canary = Arc::new(CanaryController::new(
            Arc::clone(&infra),
            Arc::clone(&watcher),
            config.canary_plan(),
        ));
        let scheduler = Arc::new(EscalationScheduler::new(
            alarm_source,
            Arc::clone(&dispatcher),
            Arc::clone(&clock),
            audit.clone(),
            config.escalation_policy(),
        ));
        let pipeline = Arc::new(PipelineStateMachine::new(
            PipelineComponents {
                clock: Arc::clone(&clock),
                infra,
                watcher: Arc::clone(&watcher),
                gate: Arc::clone(&gate),
                canary: Arc::clone(&canary),
                dispatcher,
                audit: audit.clone(),
            },
            config.pipeline_settings(),
        ));

        info!(
            pipeline = %config.pipeline.name,
            canary_steps = config.canary.steps.len(),
            default_alarms = config.alarms.bindings.len(),
            "orchestrator assembled"
        );

        Self {
            config: RwLock::new(config),
            clock,
            audit,
            gate,
            watcher,
            canary,
            scheduler,
            pipeline,
        }
    }

    /// Deployment state machine.
    pub fn pipeline(&self) -> &Arc<PipelineStateMachine> {
        &self.pipeline
    }

    /// Operator surface over the pipeline.
    pub fn console(&self) -> OperatorConsole {
        OperatorConsole::new(Arc::clone(&self.pipeline))
    }

    /// Escalation scheduler.
    pub fn scheduler(&self) -> &Arc<EscalationScheduler> {
        &self.scheduler
    }

    /// Approval gate.
    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    /// Shared audit trail.
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Config in effect.
    pub fn config(&self) -> OrchestratorConfig {
        self.config.read().clone()
    }

    /// Apply a reloaded config.
    ///
    /// Escalation policy and canary plan change in place. Approval timeout,
    /// retry, cache and binding settings are fixed at construction and only
    /// take effect on restart.
    pub fn apply_config(&self, new: OrchestratorConfig) {
        let current = self.config.read().clone();
        if current.pipeline != new.pipeline
            || current.resilience != new.resilience
            || current.alarms != new.alarms
            || current.notifications != new.notifications
        {
            warn!("config change outside [canary] and [escalation] needs a restart to apply");
        }
        self.scheduler.update_policy(new.escalation_policy());
        self.canary.update_plan(new.canary_plan());
        info!(pipeline = %new.pipeline.name, "config applied");
        *self.config.write() = new;
    }

    /// Capture durable state.
    pub async fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            version: SNAPSHOT_VERSION,
            taken_at: self.clock.now(),
            deployments: self.pipeline.export(),
            approvals: self.gate.export(),
            bindings: self.watcher.all_bindings(),
            tickets: self.scheduler.tickets().await,
            audit: self.audit.records(),
        }
    }

    /// Load a snapshot into a freshly built orchestrator, then halt any
    /// deployment whose approval was resolved negatively while persisted.
    pub async fn restore(&self, snapshot: StateSnapshot) {
        let StateSnapshot {
            taken_at,
            deployments,
            approvals,
            bindings,
            tickets,
            audit,
            ..
        } = snapshot;
        info!(
            %taken_at,
            deployments = deployments.len(),
            approvals = approvals.len(),
            tickets = tickets.len(),
            "restoring snapshot"
        );

        self.audit.restore(audit);
        self.pipeline.restore(deployments);
        self.gate.restore(approvals);
        for binding in bindings {
            self.watcher.bind(binding);
        }
        self.scheduler.restore(tickets);
        self.pipeline.reconcile_approvals().await;
    }

    /// Spawn the sweeper, escalation loop, approval listener and archiver.
    /// When `config_updates` is given, reloaded configs are applied as they
    /// arrive.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn spawn_background(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
        config_updates: Option<broadcast::Receiver<OrchestratorConfig>>,
    ) -> BackgroundHandles {
        let config = self.config();
        let sweeper = self
            .gate
            .spawn_sweeper(config.sweep_interval(), shutdown.clone());
        let escalation = self.scheduler.spawn(shutdown.clone());
        let approval_listener = self.pipeline.spawn_approval_listener(shutdown.clone());
        let archiver = self.spawn_archiver(shutdown.clone());
        let config = config_updates.map(|updates| self.spawn_config_applier(updates, shutdown));

        BackgroundHandles {
            sweeper,
            escalation,
            approval_listener,
            archiver,
            config,
        }
    }

    fn spawn_archiver(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(orchestrator.config().sweep_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let retention = orchestrator.config().retention();
                        orchestrator.pipeline.archive_terminal(retention);
                    }
                    _ = shutdown.changed() => {
                        info!("archiver shutdown signal received");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_config_applier(
        self: &Arc<Self>,
        mut updates: broadcast::Receiver<OrchestratorConfig>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Ok(config) => orchestrator.apply_config(config),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "config updates lagged, waiting for the next one");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => {
                        info!("config applier shutdown signal received");
                        break;
                    }
                }
            }
        })
    }
}
