//! End-to-end deployment scenarios through the assembled orchestrator.
//!
//! Every test runs on a paused tokio clock, so soak windows and approval
//! deadlines elapse in virtual time.

mod common;

use std::time::Duration;

use common::Harness;
use tokio::sync::watch;
use tokio_deploy_orchestrator::inmemory::InfraOp;
use tokio_deploy_orchestrator::{
    ApprovalDecision, ApprovalError, AuditKind, DeploymentId, DeploymentStatus, InfraError,
    PipelineError, Stage,
};

// ── Canary outcomes ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_clean_canary_succeeds_after_three_soaks() {
    let h = Harness::new();
    let id = h.staged().await;
    h.orchestrator
        .console()
        .approve(&id, "alice")
        .expect("test: approve");

    let start = tokio::time::Instant::now();
    let done = h
        .orchestrator
        .pipeline()
        .run(&id)
        .await
        .expect("test: run");

    assert_eq!(start.elapsed(), Duration::from_secs(15 * 60));
    assert_eq!(done.stage, Stage::Succeeded);
    assert_eq!(done.status, DeploymentStatus::Succeeded);
    assert_eq!(done.traffic_percent, 100);
    assert_eq!(h.infra.traffic_history(&id), vec![10, 50, 100]);
    assert_eq!(h.infra.count(InfraOp::Promote, &id), 1);
    assert_eq!(h.infra.count(InfraOp::Rollback, &id), 0);
}

#[tokio::test(start_paused = true)]
async fn test_breach_during_second_soak_rolls_back_once() {
    let h = Harness::new();
    let id = h.staged().await;
    h.orchestrator
        .console()
        .approve(&id, "alice")
        .expect("test: approve");

    h.breach_at("api-5xx", Duration::from_secs(7 * 60));
    let done = h
        .orchestrator
        .pipeline()
        .run(&id)
        .await
        .expect("test: run");

    assert_eq!(done.status, DeploymentStatus::RolledBack);
    assert_eq!(done.stage, Stage::RolledBack);
    assert_eq!(done.traffic_percent, 0);
    assert!(!done.manual_intervention_required);
    assert_eq!(h.infra.count(InfraOp::Rollback, &id), 1);
    assert_eq!(h.infra.traffic_history(&id), vec![10, 50]);

    let rolled_back = h
        .orchestrator
        .audit()
        .for_deployment(&id)
        .into_iter()
        .find_map(|r| match r.kind {
            AuditKind::StageTransition {
                to: Stage::RolledBack,
                traffic_percent,
                ..
            } => Some(traffic_percent),
            _ => None,
        });
    assert_eq!(rolled_back, Some(50));
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_rollback_notifies_operators() {
    let h = Harness::new();
    let id = h.staged().await;
    h.orchestrator
        .console()
        .approve(&id, "alice")
        .expect("test: approve");
    h.infra
        .fail_always(InfraOp::Rollback, InfraError::Transient("provider down".into()));
    h.breach("api-5xx");

    let done = h
        .orchestrator
        .pipeline()
        .run(&id)
        .await
        .expect("test: run");

    assert_eq!(done.status, DeploymentStatus::RolledBack);
    assert!(done.manual_intervention_required);
    assert_eq!(h.infra.count(InfraOp::Rollback, &id), 3);

    let notices = h.dispatcher.delivered_to("deploy-operators");
    assert_eq!(notices.len(), 1);
    assert!(notices[0].payload.contains(id.as_str()));
    assert!(h
        .orchestrator
        .audit()
        .for_deployment(&id)
        .iter()
        .any(|r| r.kind == AuditKind::Rollback { confirmed: false }));
}

// ── Staging ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_staging_deploy_rejection_fails_without_rollback() {
    let h = Harness::new();
    h.infra
        .fail_always(InfraOp::Deploy, InfraError::Rejected("quota exceeded".into()));
    let pipeline = h.orchestrator.pipeline();
    let dep = pipeline.on_build_complete("abc123", "app@sha256:1");

    let done = pipeline.advance(&dep.id).await.expect("test: advance");

    assert_eq!(done.status, DeploymentStatus::Failed);
    assert_eq!(h.infra.count(InfraOp::Deploy, &dep.id), 1);
    assert_eq!(h.infra.count(InfraOp::Rollback, &dep.id), 0);
    assert!(h.orchestrator.gate().request(&dep.id).is_none());
}

// ── Approval ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_unanswered_approval_times_out_within_one_sweep() {
    let h = Harness::new();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let _handles = h.orchestrator.spawn_background(shutdown_rx, None);
    let id = h.staged().await;

    let start = tokio::time::Instant::now();
    let done = h.wait_terminal(&id, Duration::from_secs(2 * 3600)).await;

    assert!(start.elapsed() <= Duration::from_secs(3600 + 60 + 1));
    assert_eq!(done.stage, Stage::AwaitApproval);
    assert_eq!(done.status, DeploymentStatus::Failed);
    assert_eq!(h.infra.count(InfraOp::ShiftTraffic, &id), 0);

    let request = h.orchestrator.gate().request(&id).expect("test: request");
    assert_eq!(request.decision, ApprovalDecision::TimedOut);

    let late = h.orchestrator.console().approve(&id, "alice");
    assert!(matches!(late, Err(PipelineError::Approval(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_decisions_resolve_exactly_once() {
    let h = Harness::new();
    let id = h.staged().await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let console = h.orchestrator.console();
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            let operator = format!("op-{i}");
            if i % 2 == 0 {
                console.approve(&id, &operator)
            } else {
                console.reject(&id, &operator)
            }
        }));
    }

    let mut accepted = 0;
    for task in tasks {
        match task.await.expect("test: join") {
            Ok(_) => accepted += 1,
            Err(e) => assert_eq!(
                e,
                PipelineError::Approval(ApprovalError::NotPending(id.clone()))
            ),
        }
    }
    assert_eq!(accepted, 1);
    let decision = h
        .orchestrator
        .gate()
        .request(&id)
        .expect("test: request")
        .decision;
    assert!(decision.is_resolved());
}

#[tokio::test(start_paused = true)]
async fn test_rejection_halts_without_touching_production() {
    let h = Harness::new();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let _handles = h.orchestrator.spawn_background(shutdown_rx, None);
    let id = h.staged().await;

    h.orchestrator
        .console()
        .reject(&id, "bob")
        .expect("test: reject");
    let done = h.wait_terminal(&id, Duration::from_secs(10)).await;

    assert_eq!(done.status, DeploymentStatus::Failed);
    assert_eq!(done.stage, Stage::AwaitApproval);
    assert_eq!(h.infra.count(InfraOp::ShiftTraffic, &id), 0);
    assert!(h
        .orchestrator
        .audit()
        .for_deployment(&id)
        .iter()
        .any(|r| r.kind == AuditKind::Halted));
}

// ── Operator console ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_status_reports_pending_approval_and_bindings() {
    let h = Harness::new();
    let id = h.staged().await;

    let report = h.orchestrator.console().status(&id).expect("test: status");

    assert_eq!(report.deployment.stage, Stage::AwaitApproval);
    let approval = report.approval.expect("test: approval open");
    assert_eq!(approval.decision, ApprovalDecision::Pending);
    assert_eq!(
        approval.deadline - approval.requested_at,
        chrono::Duration::seconds(3600)
    );
    assert_eq!(report.bindings.len(), 1);
    assert_eq!(report.bindings[0].alarm_name, "api-5xx");
}

#[tokio::test(start_paused = true)]
async fn test_console_abort_during_soak_rolls_back() {
    let h = Harness::new();
    let id = h.staged().await;
    let console = h.orchestrator.console();
    console.approve(&id, "alice").expect("test: approve");

    let runner = {
        let pipeline = std::sync::Arc::clone(h.orchestrator.pipeline());
        let id = id.clone();
        tokio::spawn(async move { pipeline.run(&id).await })
    };
    tokio::time::sleep(Duration::from_secs(100)).await;

    let aborted = console
        .abort(&id, "carol", "customer reports")
        .await
        .expect("test: abort");
    assert_eq!(aborted.status, DeploymentStatus::RolledBack);
    assert_eq!(aborted.traffic_percent, 0);
    let last = aborted.transitions.last().expect("test: transitions");
    assert_eq!(last.traffic_percent, 10);
    assert_eq!(last.cause, "aborted: customer reports");

    let finished = runner
        .await
        .expect("test: join")
        .expect("test: run result");
    assert_eq!(finished.status, DeploymentStatus::RolledBack);
    assert_eq!(h.infra.count(InfraOp::Rollback, &id), 1);

    let again = console
        .abort(&id, "carol", "customer reports")
        .await
        .expect("test: second abort");
    assert_eq!(again.transitions.len(), aborted.transitions.len());
}

#[tokio::test(start_paused = true)]
async fn test_console_rejects_unknown_deployment() {
    let h = Harness::new();
    let missing = DeploymentId::new("dep-missing");
    let console = h.orchestrator.console();

    assert_eq!(
        console.approve(&missing, "alice").expect_err("test: unknown"),
        PipelineError::DeploymentNotFound(missing.clone())
    );
    assert!(console.status(&missing).is_err());
    assert!(console.abort(&missing, "alice", "x").await.is_err());
}
