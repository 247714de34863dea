//! In-memory collaborators
//!
//! Provides process-local implementations of the collaborator traits:
//! - InMemoryAlarmSource: settable alarm states, optional outage
//! - InMemoryInfrastructure: records every call, scripted failures
//! - InMemoryDispatcher: deduplicates by message id, scripted failures
//!
//! Used by the demo binary and by tests. They are deterministic and never
//! sleep unless latency is configured.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::model::{AlarmRecord, AlarmState, DeploymentId};
use crate::ports::{
    AlarmSource, AlarmSourceError, DispatchError, Environment, Health, InfraError,
    InfrastructureProvider, NotificationDispatcher,
};

// ============================================================================
// Alarm source
// ============================================================================

/// Alarm source backed by a map.
#[derive(Default)]
pub struct InMemoryAlarmSource {
    alarms: Mutex<HashMap<String, AlarmRecord>>,
    unavailable: Mutex<bool>,
    queries: AtomicUsize,
}

impl InMemoryAlarmSource {
    /// Empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or create) an alarm's state.
    pub fn set_state(&self, name: &str, state: AlarmState, since: DateTime<Utc>) {
        self.alarms.lock().insert(
            name.to_string(),
            AlarmRecord {
                alarm_name: name.to_string(),
                state,
                state_since: since,
            },
        );
    }

    /// Simulate an outage: every query fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    /// Number of queries served (both methods).
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), AlarmSourceError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if *self.unavailable.lock() {
            return Err(AlarmSourceError::Unavailable("simulated outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AlarmSource for InMemoryAlarmSource {
    async fn get_alarm_states(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, AlarmRecord>, AlarmSourceError> {
        self.check_available()?;
        let alarms = self.alarms.lock();
        Ok(names
            .iter()
            .filter_map(|n| alarms.get(n).map(|r| (n.clone(), r.clone())))
            .collect())
    }

    async fn alarms_in_state(
        &self,
        state: AlarmState,
    ) -> Result<Vec<AlarmRecord>, AlarmSourceError> {
        self.check_available()?;
        let mut matching: Vec<_> = self
            .alarms
            .lock()
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.alarm_name.cmp(&b.alarm_name));
        Ok(matching)
    }
}

// ============================================================================
// Infrastructure
// ============================================================================

/// Infrastructure operation, used to script failures and inspect calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfraOp {
    /// `deploy`
    Deploy,
    /// `shift_traffic`
    ShiftTraffic,
    /// `promote`
    Promote,
    /// `rollback`
    Rollback,
    /// `get_health`
    GetHealth,
}

/// A recorded infrastructure call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfraCall {
    /// `deploy(id, env, artifact)`
    Deploy(DeploymentId, Environment, String),
    /// `shift_traffic(id, percent)`
    ShiftTraffic(DeploymentId, u8),
    /// `promote(id)`
    Promote(DeploymentId),
    /// `rollback(id)`
    Rollback(DeploymentId),
    /// `get_health(id)`
    GetHealth(DeploymentId),
}

#[derive(Default)]
struct InfraState {
    calls: Vec<InfraCall>,
    failures: HashMap<InfraOp, (Option<usize>, InfraError)>,
    health: HashMap<DeploymentId, Health>,
    traffic: HashMap<DeploymentId, u8>,
}

/// Infrastructure provider that only records what it is asked to do.
#[derive(Default)]
pub struct InMemoryInfrastructure {
    state: Mutex<InfraState>,
    latency: Duration,
}

impl InMemoryInfrastructure {
    /// Provider that succeeds instantly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider whose every call takes `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            state: Mutex::new(InfraState::default()),
            latency,
        }
    }

    /// Fail the next `times` calls of `op` with `error`.
    pub fn fail_next(&self, op: InfraOp, times: usize, error: InfraError) {
        self.state.lock().failures.insert(op, (Some(times), error));
    }

    /// Fail every call of `op` with `error` until [`clear_failures`](Self::clear_failures).
    pub fn fail_always(&self, op: InfraOp, error: InfraError) {
        self.state.lock().failures.insert(op, (None, error));
    }

    /// Remove all scripted failures.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Override the health reported for a deployment.
    pub fn set_health(&self, id: &DeploymentId, health: Health) {
        self.state.lock().health.insert(id.clone(), health);
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<InfraCall> {
        self.state.lock().calls.clone()
    }

    /// Number of calls of `op` for `id`.
    pub fn count(&self, op: InfraOp, id: &DeploymentId) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.op() == op && c.deployment_id() == id)
            .count()
    }

    /// Percentages passed to `shift_traffic` for `id`, in order.
    pub fn traffic_history(&self, id: &DeploymentId) -> Vec<u8> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                InfraCall::ShiftTraffic(d, p) if d == id => Some(*p),
                _ => None,
            })
            .collect()
    }

    /// Current traffic routed to `id` (0 after rollback).
    pub fn traffic_of(&self, id: &DeploymentId) -> u8 {
        self.state.lock().traffic.get(id).copied().unwrap_or(0)
    }

    async fn record(&self, call: InfraCall) -> Result<(), InfraError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.state.lock();
        let op = call.op();
        state.calls.push(call);

        let mut exhausted = false;
        let outcome = match state.failures.get_mut(&op) {
            Some((Some(remaining), error)) if *remaining > 0 => {
                *remaining -= 1;
                exhausted = *remaining == 0;
                Err(error.clone())
            }
            Some((None, error)) => Err(error.clone()),
            _ => Ok(()),
        };
        if exhausted {
            state.failures.remove(&op);
        }
        outcome
    }
}

impl InfraCall {
    fn op(&self) -> InfraOp {
        match self {
            InfraCall::Deploy(..) => InfraOp::Deploy,
            InfraCall::ShiftTraffic(..) => InfraOp::ShiftTraffic,
            InfraCall::Promote(_) => InfraOp::Promote,
            InfraCall::Rollback(_) => InfraOp::Rollback,
            InfraCall::GetHealth(_) => InfraOp::GetHealth,
        }
    }

    fn deployment_id(&self) -> &DeploymentId {
        match self {
            InfraCall::Deploy(id, ..)
            | InfraCall::ShiftTraffic(id, _)
            | InfraCall::Promote(id)
            | InfraCall::Rollback(id)
            | InfraCall::GetHealth(id) => id,
        }
    }
}

#[async_trait]
impl InfrastructureProvider for InMemoryInfrastructure {
    async fn deploy(
        &self,
        deployment_id: &DeploymentId,
        environment: Environment,
        artifact_ref: &str,
    ) -> Result<(), InfraError> {
        self.record(InfraCall::Deploy(
            deployment_id.clone(),
            environment,
            artifact_ref.to_string(),
        ))
        .await
    }

    async fn shift_traffic(
        &self,
        deployment_id: &DeploymentId,
        percent: u8,
    ) -> Result<(), InfraError> {
        self.record(InfraCall::ShiftTraffic(deployment_id.clone(), percent))
            .await?;
        self.state.lock().traffic.insert(deployment_id.clone(), percent);
        Ok(())
    }

    async fn promote(&self, deployment_id: &DeploymentId) -> Result<(), InfraError> {
        self.record(InfraCall::Promote(deployment_id.clone())).await
    }

    async fn rollback(&self, deployment_id: &DeploymentId) -> Result<(), InfraError> {
        self.record(InfraCall::Rollback(deployment_id.clone()))
            .await?;
        self.state.lock().traffic.insert(deployment_id.clone(), 0);
        Ok(())
    }

    async fn get_health(&self, deployment_id: &DeploymentId) -> Result<Health, InfraError> {
        self.record(InfraCall::GetHealth(deployment_id.clone()))
            .await?;
        Ok(self
            .state
            .lock()
            .health
            .get(deployment_id)
            .cloned()
            .unwrap_or(Health::Healthy))
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// A delivered notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    /// Target channel.
    pub channel: String,
    /// Caller-supplied idempotency key.
    pub message_id: String,
    /// Message body.
    pub payload: String,
}

#[derive(Default)]
struct DispatcherState {
    delivered: Vec<Delivered>,
    seen: HashSet<String>,
    fail_remaining: usize,
    attempts: usize,
}

/// Dispatcher that stores deliveries in memory.
#[derive(Default)]
pub struct InMemoryDispatcher {
    state: Mutex<DispatcherState>,
}

impl InMemoryDispatcher {
    /// Empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` sends.
    pub fn fail_next(&self, times: usize) {
        self.state.lock().fail_remaining = times;
    }

    /// Delivered messages, oldest first (duplicates suppressed).
    pub fn delivered(&self) -> Vec<Delivered> {
        self.state.lock().delivered.clone()
    }

    /// Delivered messages on one channel.
    pub fn delivered_to(&self, channel: &str) -> Vec<Delivered> {
        self.state
            .lock()
            .delivered
            .iter()
            .filter(|d| d.channel == channel)
            .cloned()
            .collect()
    }

    /// Total `send` calls, including failed and duplicate ones.
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }
}

#[async_trait]
impl NotificationDispatcher for InMemoryDispatcher {
    async fn send(
        &self,
        channel: &str,
        message_id: &str,
        payload: &str,
    ) -> Result<(), DispatchError> {
        let mut state = self.state.lock();
        state.attempts += 1;
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            return Err(DispatchError::Delivery("simulated delivery failure".into()));
        }
        if !state.seen.insert(message_id.to_string()) {
            tracing::debug!(message_id, "duplicate message suppressed");
            return Ok(());
        }
        state.delivered.push(Delivered {
            channel: channel.to_string(),
            message_id: message_id.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }
}
