//! Snapshot save/restore across orchestrator instances.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{scenario_config, Harness};
use tokio_deploy_orchestrator::{
    AlarmState, Clock, DeploymentStatus, SnapshotStore, Stage, TokioClock,
};

#[tokio::test(start_paused = true)]
async fn test_restart_resumes_pending_approval() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let store = SnapshotStore::new(dir.path().join("state.json"));

    let before = Harness::new();
    let id = before.staged().await;
    store
        .save(&before.orchestrator.snapshot().await)
        .await
        .expect("test: save");
    let audit_before = before.orchestrator.audit().len();
    drop(before);

    let after = Harness::new();
    let snapshot = store
        .load()
        .await
        .expect("test: load")
        .expect("test: snapshot present");
    after.orchestrator.restore(snapshot).await;

    assert_eq!(after.orchestrator.audit().len(), audit_before);
    let report = after.orchestrator.console().status(&id).expect("test: status");
    assert_eq!(report.deployment.stage, Stage::AwaitApproval);
    assert_eq!(report.bindings.len(), 1);

    after
        .orchestrator
        .console()
        .approve(&id, "alice")
        .expect("test: approve after restart");
    let done = after
        .orchestrator
        .pipeline()
        .run(&id)
        .await
        .expect("test: run");
    assert_eq!(done.status, DeploymentStatus::Succeeded);
    assert_eq!(after.infra.traffic_history(&id), vec![10, 50, 100]);
}

#[tokio::test(start_paused = true)]
async fn test_approval_expired_while_down_halts_on_restore() {
    let before = Harness::new();
    let id = before.staged().await;
    let snapshot = before.orchestrator.snapshot().await;

    let two_hours_later = Utc::now() + chrono::Duration::hours(2);
    let after = Harness::build(
        scenario_config(),
        Arc::new(TokioClock::starting_at(two_hours_later)),
    );
    after.orchestrator.restore(snapshot).await;

    let expired = after.orchestrator.gate().sweep_expired();
    assert_eq!(expired, vec![id.clone()]);
    after.orchestrator.pipeline().reconcile_approvals().await;

    let done = after.orchestrator.pipeline().status(&id).expect("test: status");
    assert_eq!(done.status, DeploymentStatus::Failed);
    assert_eq!(done.stage, Stage::AwaitApproval);
}

#[tokio::test(start_paused = true)]
async fn test_escalation_tickets_survive_restart() {
    let before = Harness::new();
    before.breach("db-cpu-high");
    tokio::time::advance(Duration::from_secs(31 * 60)).await;
    let report = before
        .orchestrator
        .scheduler()
        .tick()
        .await
        .expect("test: tick");
    assert_eq!(report.escalated.len(), 1);
    let snapshot = before.orchestrator.snapshot().await;
    assert_eq!(snapshot.tickets.len(), 1);

    let after = Harness::build(
        scenario_config(),
        Arc::new(TokioClock::starting_at(before.clock.now())),
    );
    let since = snapshot.tickets[0].breached_since;
    after.alarms.set_state("db-cpu-high", AlarmState::Alarm, since);
    after.orchestrator.restore(snapshot).await;

    let report = after
        .orchestrator
        .scheduler()
        .tick()
        .await
        .expect("test: tick");
    assert_eq!(report.suppressed, vec!["db-cpu-high".to_string()]);
    assert!(after.dispatcher.delivered().is_empty());
}
