//! Alert escalation
//!
//! ## Responsibility
//! Periodically scan every alarm in `ALARM`, and escalate the ones that have
//! stayed breached past a threshold, re-notifying at a bounded cadence.
//!
//! ## Guarantees
//! - At most one notification per re-escalation interval per unresolved alarm
//! - A ticket only advances on confirmed dispatch; a failed send is retried
//!   on the next eligible tick with the same message id
//! - Recovery clears the ticket, so a new breach starts again at #1
//! - Ticket updates for one alarm are serialized by a per-alarm lock

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ports::AlarmSourceError;

pub mod scheduler;

pub use scheduler::{EscalationScheduler, TickReport};

/// Escalation timing and routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    /// Breach age after which the first notification is sent.
    pub threshold: Duration,
    /// Minimum spacing between notifications for the same breach.
    pub re_escalation_interval: Duration,
    /// Scan cadence of the background loop.
    pub tick_interval: Duration,
    /// Notification channel for escalations.
    pub channel: String,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(30 * 60),
            re_escalation_interval: Duration::from_secs(30 * 60),
            tick_interval: Duration::from_secs(5 * 60),
            channel: "oncall".to_string(),
        }
    }
}

/// Escalation scan failures.
#[derive(Debug, Error)]
pub enum EscalationError {
    /// Breached alarms could not be listed; nothing was escalated this tick.
    #[error("alarm scan failed: {0}")]
    Source(#[from] AlarmSourceError),

    /// The notification body could not be encoded.
    #[error("escalation payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}
