//! Prometheus metrics for the deployment orchestrator.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`inc_transition`, `inc_rollback`, …) are no-ops if `init_metrics` was
//! never called, so every component is safe to run without a registry.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `deploy_stage_transitions_total` | Counter | `from`, `to` |
//! | `deploy_rollbacks_total` | Counter | `outcome` |
//! | `deploy_approval_decisions_total` | Counter | `decision` |
//! | `deploy_escalations_total` | Counter | `outcome` |
//! | `deploy_infra_call_failures_total` | Counter | `op` |
//! | `deploy_alarm_cache_lookups_total` | Counter | `result` |

use crate::OrchestratorError;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the orchestrator, bundled together so they can
/// be stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Stage transitions by edge.
    pub transitions_total: IntCounterVec,
    /// Rollbacks by outcome (`confirmed` / `failed`).
    pub rollbacks_total: IntCounterVec,
    /// Approval resolutions by decision.
    pub approvals_total: IntCounterVec,
    /// Escalation attempts by outcome (`sent` / `failed`).
    pub escalations_total: IntCounterVec,
    /// Failed infrastructure calls (after retries) by operation.
    pub infra_failures_total: IntCounterVec,
    /// Alarm cache lookups by result (`hit` / `miss`).
    pub alarm_cache_total: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, OrchestratorError> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)
        .map_err(|e| OrchestratorError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| OrchestratorError::Other(format!("metrics registration failed: {e}")))?;
    Ok(counter)
}

fn build_metrics() -> Result<Metrics, OrchestratorError> {
    let registry = Registry::new();

    let transitions_total = counter_vec(
        &registry,
        "deploy_stage_transitions_total",
        "Deployment stage transitions",
        &["from", "to"],
    )?;
    let rollbacks_total = counter_vec(
        &registry,
        "deploy_rollbacks_total",
        "Rollback calls by outcome",
        &["outcome"],
    )?;
    let approvals_total = counter_vec(
        &registry,
        "deploy_approval_decisions_total",
        "Approval request resolutions",
        &["decision"],
    )?;
    let escalations_total = counter_vec(
        &registry,
        "deploy_escalations_total",
        "Escalation notifications by outcome",
        &["outcome"],
    )?;
    let infra_failures_total = counter_vec(
        &registry,
        "deploy_infra_call_failures_total",
        "Infrastructure calls that failed after retries",
        &["op"],
    )?;
    let alarm_cache_total = counter_vec(
        &registry,
        "deploy_alarm_cache_lookups_total",
        "Alarm state cache lookups",
        &["result"],
    )?;

    Ok(Metrics {
        registry,
        transitions_total,
        rollbacks_total,
        approvals_total,
        escalations_total,
        infra_failures_total,
        alarm_cache_total,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if metric construction or registry
/// registration fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), OrchestratorError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    // If another thread raced us, the first one wins.
    let _ = METRICS.set(build_metrics()?);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

fn inc(counter: impl Fn(&Metrics) -> &IntCounterVec, labels: &[&str]) {
    if let Some(m) = metrics() {
        if let Ok(c) = counter(m).get_metric_with_label_values(labels) {
            c.inc();
        }
    }
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count a stage transition. No-op before [`init_metrics`].
pub fn inc_transition(from: &str, to: &str) {
    inc(|m| &m.transitions_total, &[from, to]);
}

/// Count a rollback; `confirmed` is whether the provider accepted it.
pub fn inc_rollback(confirmed: bool) {
    let outcome = if confirmed { "confirmed" } else { "failed" };
    inc(|m| &m.rollbacks_total, &[outcome]);
}

/// Count an approval resolution.
pub fn inc_approval(decision: &str) {
    inc(|m| &m.approvals_total, &[decision]);
}

/// Count an escalation attempt; `delivered` is whether dispatch succeeded.
pub fn inc_escalation(delivered: bool) {
    let outcome = if delivered { "sent" } else { "failed" };
    inc(|m| &m.escalations_total, &[outcome]);
}

/// Count an infrastructure call that failed after all retries.
pub fn inc_infra_failure(op: &str) {
    inc(|m| &m.infra_failures_total, &[op]);
}

/// Count an alarm cache lookup.
pub fn inc_alarm_cache(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    inc(|m| &m.alarm_cache_total, &[result]);
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
