//! Escalation Scheduler
//!
//! ## Usage
//!
//! ```rust,ignore
//! let scheduler = Arc::new(EscalationScheduler::new(source, dispatcher, clock, audit, policy));
//! let handle = scheduler.spawn(shutdown_rx);
//! ```
//!
//! Per tick:
//! 1. list alarms in `ALARM`
//! 2. clear tickets of alarms no longer listed
//! 3. escalate each listed alarm older than the threshold, unless it was
//!    escalated within the re-escalation interval
//!
//! Message ids are `escalation/<alarm>/<breached_since>/<count>`, so a retry
//! of the same escalation is deduplicated by the dispatcher.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{EscalationError, EscalationPolicy};
use crate::audit::{AuditKind, AuditLog, AuditRecord};
use crate::clock::{elapsed_between, Clock};
use crate::metrics;
use crate::model::{Actor, AlarmRecord, AlarmState, EscalationTicket};
use crate::ports::{AlarmSource, NotificationDispatcher};

/// What one tick did, by alarm name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Notifications confirmed this tick.
    pub escalated: Vec<String>,
    /// Breached past threshold but escalated too recently.
    pub suppressed: Vec<String>,
    /// Breached but younger than the threshold.
    pub below_threshold: Vec<String>,
    /// Tickets removed because the alarm recovered.
    pub cleared: Vec<String>,
    /// Dispatch attempted and failed; retried next tick.
    pub failed: Vec<String>,
}

#[derive(Serialize)]
struct EscalationNotice<'a> {
    alarm_name: &'a str,
    breached_since: DateTime<Utc>,
    breached_for_s: u64,
    escalation_count: u32,
    first_escalated_at: DateTime<Utc>,
}

type TicketSlot = Arc<Mutex<Option<EscalationTicket>>>;

/// Escalates long-lived alarms.
pub struct EscalationScheduler {
    source: Arc<dyn AlarmSource>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    clock: Arc<dyn Clock>,
    audit: AuditLog,
    policy: RwLock<EscalationPolicy>,
    tickets: DashMap<String, TicketSlot>,
}

impl EscalationScheduler {
    /// Create a scheduler with no tickets.
    pub fn new(
        source: Arc<dyn AlarmSource>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        clock: Arc<dyn Clock>,
        audit: AuditLog,
        policy: EscalationPolicy,
    ) -> Self {
        Self {
            source,
            dispatcher,
            clock,
            audit,
            policy: RwLock::new(policy),
            tickets: DashMap::new(),
        }
    }

    /// Policy in effect.
    pub fn policy(&self) -> EscalationPolicy {
        self.policy.read().clone()
    }

    /// Replace the policy; applies from the next tick.
    pub fn update_policy(&self, policy: EscalationPolicy) {
        info!(
            threshold_s = policy.threshold.as_secs(),
            re_escalation_s = policy.re_escalation_interval.as_secs(),
            channel = %policy.channel,
            "escalation policy updated"
        );
        *self.policy.write() = policy;
    }

    /// Run one scan now.
    ///
    /// # Errors
    /// [`EscalationError::Source`] if breached alarms cannot be listed. No
    /// ticket is touched in that case.
    pub async fn tick(&self) -> Result<TickReport, EscalationError> {
        self.tick_at(self.clock.now()).await
    }

    /// Run one scan as of `now`.
    ///
    /// # Errors
    /// See [`tick`](Self::tick).
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport, EscalationError> {
        let policy = self.policy();
        let breached = self.source.alarms_in_state(AlarmState::Alarm).await?;
        let mut report = TickReport::default();

        let breached_names: HashSet<&str> =
            breached.iter().map(|r| r.alarm_name.as_str()).collect();
        let recovered: Vec<(String, TicketSlot)> = self
            .tickets
            .iter()
            .filter(|e| !breached_names.contains(e.key().as_str()))
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for (name, slot) in recovered {
            let cleared = slot.lock().await.take().is_some();
            self.prune(&name, &slot);
            if cleared {
                info!(alarm = %name, "alarm recovered, escalation ticket cleared");
                self.audit.append(AuditRecord {
                    at: now,
                    deployment_id: None,
                    actor: Actor::System,
                    cause: "alarm left ALARM".to_string(),
                    kind: AuditKind::EscalationCleared {
                        alarm_name: name.clone(),
                    },
                });
                report.cleared.push(name);
            }
        }

        for record in &breached {
            let slot = self.evaluate(record, now, &policy, &mut report).await?;
            self.prune(&record.alarm_name, &slot);
        }

        debug!(
            breached = breached.len(),
            escalated = report.escalated.len(),
            suppressed = report.suppressed.len(),
            failed = report.failed.len(),
            "escalation tick complete"
        );
        Ok(report)
    }

    async fn evaluate(
        &self,
        record: &AlarmRecord,
        now: DateTime<Utc>,
        policy: &EscalationPolicy,
        report: &mut TickReport,
    ) -> Result<TicketSlot, EscalationError> {
        let name = &record.alarm_name;
        let (slot, mut ticket) = self.lock_slot(name).await;

        if ticket
            .as_ref()
            .is_some_and(|t| t.breached_since != record.state_since)
        {
            info!(alarm = %name, since = %record.state_since, "new breach episode, ticket reset");
            *ticket = None;
        }

        let breached_for = elapsed_between(record.state_since, now);
        if breached_for <= policy.threshold {
            report.below_threshold.push(name.clone());
            return Ok(Arc::clone(&slot));
        }

        let due = |t: &EscalationTicket| {
            elapsed_between(t.last_escalated_at, now) > policy.re_escalation_interval
        };
        let (count, first_escalated_at) = match ticket.as_ref() {
            None => (1, now),
            Some(t) if due(t) => (t.escalation_count + 1, t.first_escalated_at),
            Some(t) => {
                debug!(alarm = %name, count = t.escalation_count, "escalation suppressed");
                report.suppressed.push(name.clone());
                return Ok(Arc::clone(&slot));
            }
        };

        let message_id = format!(
            "escalation/{}/{}/{}",
            name,
            record.state_since.to_rfc3339(),
            count
        );
        let payload = serde_json::to_string(&EscalationNotice {
            alarm_name: name,
            breached_since: record.state_since,
            breached_for_s: breached_for.as_secs(),
            escalation_count: count,
            first_escalated_at,
        })?;

        let delivered = match self
            .dispatcher
            .send(&policy.channel, &message_id, &payload)
            .await
        {
            Ok(()) => {
                *ticket = Some(EscalationTicket {
                    alarm_name: name.clone(),
                    breached_since: record.state_since,
                    first_escalated_at,
                    last_escalated_at: now,
                    escalation_count: count,
                });
                info!(alarm = %name, count, channel = %policy.channel, "alarm escalated");
                report.escalated.push(name.clone());
                true
            }
            Err(e) => {
                warn!(
                    alarm = %name,
                    count,
                    error = %e,
                    "escalation dispatch failed, will retry next tick"
                );
                report.failed.push(name.clone());
                false
            }
        };

        metrics::inc_escalation(delivered);
        self.audit.append(AuditRecord {
            at: now,
            deployment_id: None,
            actor: Actor::System,
            cause: format!("alarm breached for {}s", breached_for.as_secs()),
            kind: AuditKind::Escalation {
                alarm_name: name.clone(),
                escalation_count: count,
                delivered,
            },
        });
        drop(ticket);
        Ok(slot)
    }

    /// Lock the ticket slot of `name`, creating it if needed. Retries when
    /// the slot was pruned between lookup and lock.
    async fn lock_slot(
        &self,
        name: &str,
    ) -> (TicketSlot, OwnedMutexGuard<Option<EscalationTicket>>) {
        loop {
            let slot = Arc::clone(self.tickets.entry(name.to_string()).or_default().value());
            let guard = Arc::clone(&slot).lock_owned().await;
            let current = self
                .tickets
                .get(name)
                .is_some_and(|e| Arc::ptr_eq(e.value(), &slot));
            if current {
                return (slot, guard);
            }
        }
    }

    /// Drop the map entry of `name` if it is still `slot`, unlocked and empty.
    fn prune(&self, name: &str, slot: &TicketSlot) {
        self.tickets.remove_if(name, |_, s| {
            Arc::ptr_eq(s, slot) && s.try_lock().is_ok_and(|t| t.is_none())
        });
    }

    /// Live tickets, sorted by alarm name.
    pub async fn tickets(&self) -> Vec<EscalationTicket> {
        let slots: Vec<TicketSlot> = self.tickets.iter().map(|e| Arc::clone(e.value())).collect();
        let mut live = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(ticket) = slot.lock().await.clone() {
                live.push(ticket);
            }
        }
        live.sort_by(|a, b| a.alarm_name.cmp(&b.alarm_name));
        live
    }

    /// Ticket for one alarm.
    pub async fn ticket(&self, alarm_name: &str) -> Option<EscalationTicket> {
        let slot = self.tickets.get(alarm_name).map(|e| Arc::clone(e.value()))?;
        let ticket = slot.lock().await.clone();
        ticket
    }

    /// Load persisted tickets. Timing is derived from their timestamps, so the
    /// sequence resumes where it left off.
    pub fn restore(&self, tickets: Vec<EscalationTicket>) {
        for ticket in tickets {
            self.tickets
                .insert(ticket.alarm_name.clone(), Arc::new(Mutex::new(Some(ticket))));
        }
    }

    /// Tick on the policy's interval until `shutdown` flips.
    ///
    /// A changed `tick_interval` takes effect after the current tick. Scan
    /// failures are logged and the loop carries on.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut period = scheduler.policy().tick_interval;
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.tick().await {
                            warn!(error = %e, "escalation tick failed");
                        }
                        let configured = scheduler.policy().tick_interval;
                        if configured != period {
                            period = configured;
                            ticker = tokio::time::interval_at(
                                tokio::time::Instant::now() + period,
                                period,
                            );
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("escalation scheduler shutdown signal received");
                        break;
                    }
                }
            }
        })
    }
}
