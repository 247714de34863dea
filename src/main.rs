//! Demo binary for tokio-deploy-orchestrator
//!
//! Runs one deployment through staging, approval and a canary rollout
//! against in-memory infrastructure, then prints its status report.
//!
//! ## Flags
//!
//! - `--config <path>`: load and hot-reload a TOML config (default: built-in demo config)
//! - `--schema`: print the config JSON Schema and exit
//! - `--breach-at-secs <n>`: fire the bound alarm `n` seconds into production
//! - `--reject`: reject the approval instead of approving it
//! - `--snapshot <path>`: save a state snapshot on exit
//!
//! ## Environment Variables
//!
//! - `RUST_LOG=info`: log level filter

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio_deploy_orchestrator::config::loader::{load_from_file, load_from_str};
use tokio_deploy_orchestrator::config::watcher::ConfigWatcher;
use tokio_deploy_orchestrator::config::{export_schema, OrchestratorConfig};
use tokio_deploy_orchestrator::inmemory::{
    InMemoryAlarmSource, InMemoryDispatcher, InMemoryInfrastructure,
};
use tokio_deploy_orchestrator::{
    init_tracing_with, metrics, AlarmState, Collaborators, Orchestrator, SnapshotStore,
    SystemClock,
};
use tracing::{error, info};

const DEMO_CONFIG: &str = r#"
[pipeline]
name = "demo-service"
approval_timeout_s = 30

[canary]
steps = [
    { percent = 10, soak_s = 3 },
    { percent = 50, soak_s = 3 },
    { percent = 100, soak_s = 3 },
]
poll_interval_s = 1

[alarms]
cache_ttl_ms = 500
bindings = [{ alarm_name = "demo-5xx", severity = "critical" }]

[escalation]
threshold_s = 5
re_escalation_s = 5
tick_s = 1
channel = "oncall"

[notifications]
operator_channel = "deploy-operators"

[resilience]
retry_base_ms = 100
retry_max_ms = 1000
"#;

/// Value following `flag`, if present.
fn arg_value(flag: &str) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1).cloned())
}

/// `true` if `flag` was passed.
fn has_flag(flag: &str) -> bool {
    std::env::args().any(|a| a == flag)
}

fn load_config(path: Option<&PathBuf>) -> Result<OrchestratorConfig, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(path) => load_from_file(path)?,
        None => load_from_str(DEMO_CONFIG, "built-in demo config")?,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if has_flag("--schema") {
        println!("{}", export_schema()?);
        return Ok(());
    }

    let config_path = arg_value("--config").map(PathBuf::from);
    let config = load_config(config_path.as_ref())?;
    let _ = init_tracing_with(config.observability.log_format.as_str());
    metrics::init_metrics()?;

    info!(pipeline = %config.pipeline.name, "starting deploy orchestrator demo");

    let alarms = Arc::new(InMemoryAlarmSource::new());
    let infra = Arc::new(InMemoryInfrastructure::with_latency(Duration::from_millis(50)));
    let dispatcher = Arc::new(InMemoryDispatcher::new());
    for binding in &config.alarms.bindings {
        alarms.set_state(&binding.alarm_name, AlarmState::Ok, Utc::now());
    }

    let orchestrator = Arc::new(Orchestrator::new(
        config,
        Collaborators {
            alarm_source: alarms.clone(),
            infrastructure: infra.clone(),
            dispatcher: dispatcher.clone(),
            clock: Arc::new(SystemClock),
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let config_watcher = match &config_path {
        Some(path) => Some(ConfigWatcher::new(path.clone())?),
        None => None,
    };
    let (_watcher, updates) = match config_watcher {
        Some((watcher, rx)) => (Some(watcher), Some(rx)),
        None => (None, None),
    };
    let handles = orchestrator.spawn_background(shutdown_rx, updates);

    // ── Deployment ───────────────────────────────────────────────────
    let pipeline = Arc::clone(orchestrator.pipeline());
    let console = orchestrator.console();
    let deployment = pipeline.on_build_complete("demo-rev-1", "registry.local/demo@sha256:feed");
    let id = deployment.id.clone();

    pipeline.advance(&id).await?;
    info!(deployment_id = %id, "staging verified, waiting for operator");

    tokio::time::sleep(Duration::from_secs(1)).await;
    if has_flag("--reject") {
        console.reject(&id, "demo-operator")?;
    } else {
        console.approve(&id, "demo-operator")?;
    }

    if let Some(secs) = arg_value("--breach-at-secs").and_then(|s| s.parse::<u64>().ok()) {
        let alarms = alarms.clone();
        let names: Vec<String> = orchestrator
            .config()
            .alarms
            .bindings
            .iter()
            .map(|b| b.alarm_name.clone())
            .collect();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            for name in names {
                info!(alarm = %name, "injecting alarm breach");
                alarms.set_state(&name, AlarmState::Alarm, Utc::now());
            }
        });
    }

    match pipeline.run(&id).await {
        Ok(done) => info!(
            deployment_id = %id,
            stage = done.stage.as_str(),
            status = ?done.status,
            traffic_percent = done.traffic_percent,
            "deployment finished"
        ),
        Err(e) => error!(deployment_id = %id, error = %e, "deployment did not finish"),
    }

    // Let the escalation loop observe any lingering breach.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let report = console.status(&id)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    info!(
        traffic_history = ?infra.traffic_history(&id),
        notifications = dispatcher.delivered().len(),
        audit_records = orchestrator.audit().len(),
        "demo summary"
    );

    if let Some(path) = arg_value("--snapshot") {
        SnapshotStore::new(path)
            .save(&orchestrator.snapshot().await)
            .await?;
    }

    println!("{}", metrics::gather_metrics());

    let _ = shutdown_tx.send(true);
    handles.join().await;
    info!("demo complete");
    Ok(())
}
