//! Shared harness for the integration tests: an [`Orchestrator`] wired to
//! in-memory collaborators and a clock that follows tokio's (possibly
//! paused) timer.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio_deploy_orchestrator::config::loader::load_from_str;
use tokio_deploy_orchestrator::config::OrchestratorConfig;
use tokio_deploy_orchestrator::inmemory::{
    InMemoryAlarmSource, InMemoryDispatcher, InMemoryInfrastructure,
};
use tokio_deploy_orchestrator::{
    AlarmState, Clock, Collaborators, Deployment, DeploymentId, Orchestrator, TokioClock,
};

/// Canary 10/50/100 with 5 minute soaks, 1 hour approvals swept every minute.
pub const SCENARIO_CONFIG: &str = r#"
[pipeline]
name = "checkout"
approval_timeout_s = 3600

[canary]
steps = [
    { percent = 10, soak_s = 300 },
    { percent = 50, soak_s = 300 },
    { percent = 100, soak_s = 300 },
]
poll_interval_s = 15

[approval]
sweep_interval_s = 60

[alarms]
bindings = [{ alarm_name = "api-5xx", severity = "critical" }]

[escalation]
threshold_s = 1800
re_escalation_s = 1800
tick_s = 300
channel = "oncall"

[notifications]
operator_channel = "deploy-operators"
"#;

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub alarms: Arc<InMemoryAlarmSource>,
    pub infra: Arc<InMemoryInfrastructure>,
    pub dispatcher: Arc<InMemoryDispatcher>,
    pub clock: Arc<TokioClock>,
}

pub fn scenario_config() -> OrchestratorConfig {
    load_from_str(SCENARIO_CONFIG, "scenario").expect("test: scenario config is valid")
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(scenario_config())
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        Self::build(config, Arc::new(TokioClock::new()))
    }

    /// Harness whose wall clock starts at `clock`'s origin.
    pub fn build(config: OrchestratorConfig, clock: Arc<TokioClock>) -> Self {
        let alarms = Arc::new(InMemoryAlarmSource::new());
        let infra = Arc::new(InMemoryInfrastructure::new());
        let dispatcher = Arc::new(InMemoryDispatcher::new());
        alarms.set_state("api-5xx", AlarmState::Ok, clock.now());

        let orchestrator = Arc::new(Orchestrator::new(
            config,
            Collaborators {
                alarm_source: alarms.clone(),
                infrastructure: infra.clone(),
                dispatcher: dispatcher.clone(),
                clock: clock.clone(),
            },
        ));
        Self {
            orchestrator,
            alarms,
            infra,
            dispatcher,
            clock,
        }
    }

    /// Build, stage and return a deployment waiting at the approval gate.
    pub async fn staged(&self) -> DeploymentId {
        let pipeline = self.orchestrator.pipeline();
        let dep = pipeline.on_build_complete("abc123", "registry.local/checkout@sha256:beef");
        pipeline
            .advance(&dep.id)
            .await
            .expect("test: staging succeeds");
        dep.id
    }

    pub fn breach(&self, alarm: &str) {
        self.alarms.set_state(alarm, AlarmState::Alarm, self.clock.now());
    }

    pub fn breach_at(&self, alarm: &str, delay: Duration) {
        let alarms = self.alarms.clone();
        let clock = Arc::clone(&self.clock);
        let name = alarm.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            alarms.set_state(&name, AlarmState::Alarm, clock.now());
        });
    }

    /// Poll until the deployment is terminal or `limit` virtual time passes.
    pub async fn wait_terminal(&self, id: &DeploymentId, limit: Duration) -> Deployment {
        let start = tokio::time::Instant::now();
        loop {
            let dep = self
                .orchestrator
                .pipeline()
                .status(id)
                .expect("test: deployment exists");
            if dep.is_terminal() || start.elapsed() >= limit {
                return dep;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}
