//! # tokio-deploy-orchestrator
//!
//! Deployment control and alert-escalation core over Tokio.
//!
//! ## Architecture
//!
//! ```text
//! BuildSystem ─► PipelineStateMachine ─► DeployStaging ─► AwaitApproval ─► DeployProduction ─► Succeeded
//!                      │                      │                 │                 │
//!                      │                      └─ Failed         └─ ApprovalGate   └─ CanaryController ─► RolledBack
//!                      │                                                             │
//!                      └───────────── InfrastructureProvider ◄───────────────────────┤
//!                                                                                    ▼
//!                                    AlarmSource ◄── AlarmWatcher (TTL cache) ◄── soak polling
//!                                         ▲
//!                                         └── EscalationScheduler ─► NotificationDispatcher
//! ```
//!
//! The external collaborators ([`ports::AlarmSource`],
//! [`ports::InfrastructureProvider`], [`ports::NotificationDispatcher`]) are
//! traits; [`inmemory`] provides implementations for demos and tests.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod alarm;
pub mod approval;
pub mod audit;
pub mod canary;
pub mod clock;
pub mod config;
pub mod control;
pub mod escalation;
pub mod inmemory;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod ports;
pub mod resilience;
pub mod store;

// Re-exports for convenience
pub use alarm::AlarmWatcher;
pub use approval::{ApprovalError, ApprovalGate, ApprovalResolution};
pub use audit::{AuditKind, AuditLog, AuditRecord};
pub use canary::{CanaryController, CanaryOutcome, CanaryPlan, CanaryStep};
pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use config::OrchestratorConfig;
pub use control::{OperatorConsole, StatusReport};
pub use escalation::{EscalationError, EscalationPolicy, EscalationScheduler, TickReport};
pub use model::{
    Actor, AlarmBinding, AlarmRecord, AlarmState, ApprovalDecision, ApprovalRequest, Deployment,
    DeploymentId, DeploymentStatus, EscalationTicket, Severity, Stage, TransitionEntry, Verdict,
};
pub use orchestrator::{BackgroundHandles, Collaborators, Orchestrator};
pub use pipeline::{PipelineComponents, PipelineError, PipelineSettings, PipelineStateMachine};
pub use ports::{
    AlarmSource, AlarmSourceError, DispatchError, Environment, Health, InfraError,
    InfrastructureProvider, NotificationDispatcher,
};
pub use resilience::{GuardedInfra, RetryPolicy};
pub use store::{SnapshotStore, StateSnapshot, StoreError};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```no_run
/// # use tokio_deploy_orchestrator::{init_tracing, OrchestratorError};
/// # fn example() -> Result<(), OrchestratorError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), OrchestratorError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    init_tracing_with(&format)
}

/// Initialise tracing with an explicit format (`"json"` or `"pretty"`).
///
/// Used when the log format comes from the config file rather than the
/// environment.
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if a global subscriber is already set.
pub fn init_tracing_with(format: &str) -> Result<(), OrchestratorError> {
    let result = match format {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| OrchestratorError::Other(format!("tracing init failed: {e}")))
}

/// Top-level orchestrator errors.
///
/// Every component error maps into a variant here so binaries can use a
/// single `Result` type.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Deployment lifecycle failure.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Approval policy violation.
    #[error(transparent)]
    Approval(#[from] ApprovalError),

    /// Escalation scan failure.
    #[error(transparent)]
    Escalation(#[from] EscalationError),

    /// Configuration missing or invalid.
    #[error(transparent)]
    Config(#[from] config::validation::ConfigError),

    /// Snapshot persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}
