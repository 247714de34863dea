//! # Shared data model
//!
//! ## Responsibility
//! Entities shared by every component: deployments and their stage graph,
//! approval requests, alarm bindings and records, escalation tickets.
//!
//! ## Guarantees
//! - Stage transitions only follow the directed graph in [`Stage::can_transition_to`]
//! - Every accepted transition is appended to the deployment's log; the log is
//!   never rewritten
//! - All types are serde-serializable for snapshot persistence

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Identifiers ──────────────────────────────────────────────────────────────

/// Opaque deployment identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(String);

impl DeploymentId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier (`dep-<uuid>`).
    pub fn generate() -> Self {
        Self(format!("dep-{}", uuid::Uuid::new_v4()))
    }

    /// Return the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Actors ───────────────────────────────────────────────────────────────────

/// Who caused an audited event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Actor {
    /// The orchestrator itself (timeouts, alarms, schedulers).
    System,
    /// A named human operator.
    Operator(String),
}

impl Actor {
    /// Shorthand for a named operator.
    pub fn operator(name: impl Into<String>) -> Self {
        Self::Operator(name.into())
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Operator(name) => write!(f, "operator:{name}"),
        }
    }
}

// ─── Stage graph ──────────────────────────────────────────────────────────────

/// Pipeline stage of a deployment.
///
/// ```text
/// Build ─► DeployStaging ─► AwaitApproval ─► DeployProduction ─► Succeeded
///   │           │  │              │                 │
///   ▼           ▼  └──────┐       │                 │
/// Failed ◄──────┘         ▼       ▼                 │
///                      RolledBack ◄─────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Artifact being built; nothing deployed.
    Build,
    /// Deploying to the staging environment.
    DeployStaging,
    /// Waiting for a human decision before production.
    AwaitApproval,
    /// Canary traffic shift in production.
    DeployProduction,
    /// Terminal: fully promoted.
    Succeeded,
    /// Terminal: failed before any production traffic shifted.
    Failed,
    /// Terminal: rolled back.
    RolledBack,
}

impl Stage {
    /// `true` for `Succeeded`, `Failed` and `RolledBack`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Succeeded | Stage::Failed | Stage::RolledBack)
    }

    /// Whether `self → to` is an edge of the stage graph.
    pub fn can_transition_to(self, to: Stage) -> bool {
        use Stage::*;
        matches!(
            (self, to),
            (Build, DeployStaging)
                | (Build, Failed)
                | (DeployStaging, AwaitApproval)
                | (DeployStaging, Failed)
                | (DeployStaging, RolledBack)
                | (AwaitApproval, DeployProduction)
                | (AwaitApproval, RolledBack)
                | (DeployProduction, Succeeded)
                | (DeployProduction, RolledBack)
        )
    }

    /// Stable lowercase label, used for metrics and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Build => "build",
            Stage::DeployStaging => "deploy_staging",
            Stage::AwaitApproval => "await_approval",
            Stage::DeployProduction => "deploy_production",
            Stage::Succeeded => "succeeded",
            Stage::Failed => "failed",
            Stage::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall deployment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Still moving through the pipeline.
    InProgress,
    /// Promoted to 100%.
    Succeeded,
    /// Stopped without a rollback (build/staging failure, rejected or timed-out approval).
    Failed,
    /// Rolled back.
    RolledBack,
}

impl DeploymentStatus {
    fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Succeeded => Self::Succeeded,
            Stage::Failed => Self::Failed,
            Stage::RolledBack => Self::RolledBack,
            _ => Self::InProgress,
        }
    }
}

/// One audited stage transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEntry {
    /// Stage before the transition.
    pub from: Stage,
    /// Stage after the transition.
    pub to: Stage,
    /// When the transition happened.
    pub at: DateTime<Utc>,
    /// Why it happened.
    pub cause: String,
    /// Who caused it.
    pub actor: Actor,
    /// Production traffic percentage in effect when the transition was taken.
    pub traffic_percent: u8,
}

/// Rejected edge of the stage graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalEdge {
    /// Current stage.
    pub from: Stage,
    /// Requested stage.
    pub to: Stage,
}

// ─── Deployment ───────────────────────────────────────────────────────────────

/// A build artifact moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    /// Unique identifier.
    pub id: DeploymentId,
    /// Source revision (commit, tag).
    pub revision: String,
    /// Reference to the built artifact (image digest, bundle URL).
    pub artifact_ref: String,
    /// Current stage.
    pub stage: Stage,
    /// Overall status.
    pub status: DeploymentStatus,
    /// Production traffic routed to this revision, 0–100.
    pub traffic_percent: u8,
    /// Set when a rollback could not be confirmed after retries.
    pub manual_intervention_required: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last mutation.
    pub updated_at: DateTime<Utc>,
    /// Append-only transition log.
    pub transitions: Vec<TransitionEntry>,
}

impl Deployment {
    /// Create a deployment in [`Stage::Build`].
    pub fn new(
        id: DeploymentId,
        revision: impl Into<String>,
        artifact_ref: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            revision: revision.into(),
            artifact_ref: artifact_ref.into(),
            stage: Stage::Build,
            status: DeploymentStatus::InProgress,
            traffic_percent: 0,
            manual_intervention_required: false,
            created_at: now,
            updated_at: now,
            transitions: Vec::new(),
        }
    }

    /// `true` once no further forward progress is possible.
    ///
    /// A deployment halted at the approval gate keeps stage `AwaitApproval`
    /// but is terminal through its `Failed` status.
    pub fn is_terminal(&self) -> bool {
        self.status != DeploymentStatus::InProgress
    }

    /// Take a stage-graph edge and append it to the transition log.
    ///
    /// # Errors
    /// Returns [`IllegalEdge`] if the edge is not in the graph or the
    /// deployment is already terminal. Nothing is recorded in that case.
    pub fn transition_to(
        &mut self,
        to: Stage,
        cause: impl Into<String>,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<&TransitionEntry, IllegalEdge> {
        let from = self.stage;
        if self.is_terminal() || !from.can_transition_to(to) {
            return Err(IllegalEdge { from, to });
        }

        self.transitions.push(TransitionEntry {
            from,
            to,
            at: now,
            cause: cause.into(),
            actor,
            traffic_percent: self.traffic_percent,
        });
        self.stage = to;
        self.status = DeploymentStatus::for_stage(to);
        self.updated_at = now;

        self.transitions.last().ok_or(IllegalEdge { from, to })
    }

    /// Stop forward progress without changing stage.
    pub fn halt(&mut self, now: DateTime<Utc>) {
        self.status = DeploymentStatus::Failed;
        self.updated_at = now;
    }
}

// ─── Approvals ────────────────────────────────────────────────────────────────

/// State of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Waiting for a decision.
    Pending,
    /// Approved by an operator.
    Approved,
    /// Rejected by an operator.
    Rejected,
    /// Deadline passed without a decision.
    TimedOut,
}

impl ApprovalDecision {
    /// `true` for every state except `Pending`.
    pub fn is_resolved(self) -> bool {
        self != ApprovalDecision::Pending
    }

    /// Stable lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::TimedOut => "timed_out",
        }
    }
}

/// An operator's verdict on a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Allow production deployment.
    Approve,
    /// Stop the deployment.
    Reject,
}

impl From<Verdict> for ApprovalDecision {
    fn from(v: Verdict) -> Self {
        match v {
            Verdict::Approve => ApprovalDecision::Approved,
            Verdict::Reject => ApprovalDecision::Rejected,
        }
    }
}

/// Approval request for one deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Deployment waiting at the gate.
    pub deployment_id: DeploymentId,
    /// When the request was opened.
    pub requested_at: DateTime<Utc>,
    /// Decisions after this instant are refused.
    pub deadline: DateTime<Utc>,
    /// Current decision.
    pub decision: ApprovalDecision,
    /// Operator who decided, if any.
    pub decided_by: Option<String>,
    /// When the request was resolved.
    pub decided_at: Option<DateTime<Utc>>,
}

// ─── Alarms ───────────────────────────────────────────────────────────────────

/// Alarm severity on a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Page-worthy.
    Critical,
    /// Degradation.
    Warning,
}

/// Associates an alarm with a deployment it can roll back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlarmBinding {
    /// Alarm name in the alarm source.
    pub alarm_name: String,
    /// Bound deployment.
    pub deployment_id: DeploymentId,
    /// Severity of the alarm for this deployment.
    pub severity: Severity,
}

/// Alarm state as reported by the alarm source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmState {
    /// Healthy.
    Ok,
    /// Breached.
    Alarm,
    /// Not enough datapoints; treated as not breached.
    InsufficientData,
}

/// Current state of a named alarm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmRecord {
    /// Alarm name.
    pub alarm_name: String,
    /// Current state.
    pub state: AlarmState,
    /// When the alarm entered `state`.
    pub state_since: DateTime<Utc>,
}

/// Escalation bookkeeping for one unresolved alarm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationTicket {
    /// Alarm name.
    pub alarm_name: String,
    /// `state_since` of the breach this ticket tracks.
    pub breached_since: DateTime<Utc>,
    /// First confirmed escalation.
    pub first_escalated_at: DateTime<Utc>,
    /// Most recent confirmed escalation.
    pub last_escalated_at: DateTime<Utc>,
    /// Number of confirmed escalations.
    pub escalation_count: u32,
}
