//! # Declarative Orchestrator Configuration
//!
//! ## Responsibility
//! Parse, validate, and hot-reload the TOML file that describes canary
//! steps, approval timing, alarm bindings, escalation policy and retry
//! behaviour. Run the demo with:
//! ```text
//! cargo run -- --config orchestrator.toml
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `OrchestratorConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Hot-reloadable: file changes are detected and validated before applying
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building the runtime components (that belongs to `orchestrator`)
//! - Deciding which reloaded fields apply live (consumers decide)

pub mod loader;
pub mod validation;
pub mod watcher;

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::canary::{CanaryPlan, CanaryStep};
use crate::escalation::EscalationPolicy;
use crate::model::Severity;
use crate::pipeline::PipelineSettings;
use crate::resilience::RetryPolicy;

// ── Default value functions ──────────────────────────────────────────────

/// Default approval window: 4 hours.
fn default_approval_timeout_s() -> u64 {
    4 * 60 * 60
}

/// Default retention of terminal deployments: 7 days.
fn default_retention_s() -> u64 {
    7 * 24 * 60 * 60
}

/// Default soak polling cadence: 15 seconds.
fn default_poll_interval_s() -> u64 {
    15
}

/// Default approval sweep: every minute.
fn default_sweep_interval_s() -> u64 {
    60
}

/// Default alarm cache TTL: 5000ms.
fn default_cache_ttl_ms() -> u64 {
    5000
}

/// Default escalation threshold and re-escalation interval: 30 minutes.
fn default_escalation_window_s() -> u64 {
    30 * 60
}

/// Default escalation tick: 5 minutes.
fn default_tick_s() -> u64 {
    5 * 60
}

/// Default retry attempts: 3.
fn default_retry_attempts() -> u32 {
    3
}

/// Default retry base delay: 2000ms.
fn default_retry_base_ms() -> u64 {
    2000
}

/// Default retry maximum delay: 60000ms.
fn default_retry_max_ms() -> u64 {
    60_000
}

/// Default per-call infrastructure timeout: 10000ms.
fn default_call_timeout_ms() -> u64 {
    10_000
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for an orchestrator instance.
///
/// # Example
///
/// ```toml
/// [pipeline]
/// name = "checkout-service"
///
/// [canary]
/// steps = [{ percent = 10, soak_s = 300 }, { percent = 50, soak_s = 300 }, { percent = 100, soak_s = 300 }]
///
/// [escalation]
/// channel = "oncall"
///
/// [notifications]
/// operator_channel = "deploy-operators"
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OrchestratorConfig {
    /// Pipeline identity and lifecycle timing.
    pub pipeline: PipelineSection,
    /// Canary traffic steps.
    #[serde(default)]
    pub canary: CanaryConfig,
    /// Approval gate sweep.
    #[serde(default)]
    pub approval: ApprovalConfig,
    /// Alarm cache and default bindings.
    #[serde(default)]
    pub alarms: AlarmsConfig,
    /// Escalation timing and channel.
    pub escalation: EscalationConfig,
    /// Operator notifications.
    pub notifications: NotificationsConfig,
    /// Infrastructure call retry and timeout.
    #[serde(default)]
    pub resilience: ResilienceConfig,
    /// Logging.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ── Pipeline ─────────────────────────────────────────────────────────────

/// Pipeline identity and lifecycle timing.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PipelineSection {
    /// Human-readable pipeline name (e.g., "checkout-service").
    pub name: String,
    /// Seconds an approval request stays open.
    #[serde(default = "default_approval_timeout_s")]
    pub approval_timeout_s: u64,
    /// Seconds terminal deployments are kept before archival.
    #[serde(default = "default_retention_s")]
    pub retention_s: u64,
}

// ── Canary ───────────────────────────────────────────────────────────────

/// Canary plan. An empty `steps` list deploys all-at-once.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CanaryConfig {
    /// Traffic steps, strictly ascending, ending at 100.
    #[serde(default)]
    pub steps: Vec<CanaryStepConfig>,
    /// Alarm polling cadence during a soak, in seconds.
    #[serde(default = "default_poll_interval_s")]
    pub poll_interval_s: u64,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            steps: Vec::new(),
            poll_interval_s: default_poll_interval_s(),
        }
    }
}

/// One canary step.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CanaryStepConfig {
    /// Share of production traffic, 1–100.
    pub percent: u8,
    /// Soak window after the shift, in seconds.
    pub soak_s: u64,
}

// ── Approval ─────────────────────────────────────────────────────────────

/// Approval gate settings.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ApprovalConfig {
    /// Seconds between deadline sweeps.
    #[serde(default = "default_sweep_interval_s")]
    pub sweep_interval_s: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            sweep_interval_s: default_sweep_interval_s(),
        }
    }
}

// ── Alarms ───────────────────────────────────────────────────────────────

/// Alarm watcher settings.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct AlarmsConfig {
    /// How long an alarm state is cached, in milliseconds.
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    /// Alarms bound to every new deployment.
    #[serde(default)]
    pub bindings: Vec<AlarmBindingConfig>,
}

impl Default for AlarmsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: default_cache_ttl_ms(),
            bindings: Vec::new(),
        }
    }
}

/// An alarm bound to every deployment.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct AlarmBindingConfig {
    /// Alarm name in the alarm source.
    pub alarm_name: String,
    /// Severity of the binding.
    pub severity: Severity,
}

// ── Escalation ───────────────────────────────────────────────────────────

/// Escalation scheduler settings.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct EscalationConfig {
    /// Breach age, in seconds, before the first escalation.
    #[serde(default = "default_escalation_window_s")]
    pub threshold_s: u64,
    /// Minimum seconds between escalations of the same breach.
    #[serde(default = "default_escalation_window_s")]
    pub re_escalation_s: u64,
    /// Seconds between scans.
    #[serde(default = "default_tick_s")]
    pub tick_s: u64,
    /// Notification channel for escalations.
    pub channel: String,
}

// ── Notifications ────────────────────────────────────────────────────────

/// Operator notification routing.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct NotificationsConfig {
    /// Channel for manual-intervention notices.
    pub operator_channel: String,
}

// ── Resilience ───────────────────────────────────────────────────────────

/// Retry and timeout for infrastructure calls.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ResilienceConfig {
    /// Total attempts per call, including the first.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base delay (ms) for exponential backoff. Must be ≤ `retry_max_ms`.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Maximum delay (ms) cap for exponential backoff.
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// Per-attempt timeout (ms).
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Randomly stretch each backoff by up to 25%.
    #[serde(default)]
    pub retry_jitter: bool,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            retry_jitter: false,
        }
    }
}

// ── Observability ────────────────────────────────────────────────────────

/// Observability configuration.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ObservabilityConfig {
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log output format.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, colorized log output.
    #[default]
    Pretty,
    /// Structured JSON log output for machine consumption.
    Json,
}

impl LogFormat {
    /// Name accepted by [`init_tracing_with`](crate::init_tracing_with).
    pub fn as_str(self) -> &'static str {
        match self {
            LogFormat::Pretty => "pretty",
            LogFormat::Json => "json",
        }
    }
}

// ── Runtime views ────────────────────────────────────────────────────────

impl OrchestratorConfig {
    /// Canary plan for the controller.
    pub fn canary_plan(&self) -> CanaryPlan {
        CanaryPlan::new(
            self.canary
                .steps
                .iter()
                .map(|s| CanaryStep {
                    percent: s.percent,
                    soak: Duration::from_secs(s.soak_s),
                })
                .collect(),
            Duration::from_secs(self.canary.poll_interval_s),
        )
    }

    /// Escalation policy for the scheduler.
    pub fn escalation_policy(&self) -> EscalationPolicy {
        EscalationPolicy {
            threshold: Duration::from_secs(self.escalation.threshold_s),
            re_escalation_interval: Duration::from_secs(self.escalation.re_escalation_s),
            tick_interval: Duration::from_secs(self.escalation.tick_s),
            channel: self.escalation.channel.clone(),
        }
    }

    /// Exponential retry policy for infrastructure calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential_capped(
            self.resilience.retry_attempts as usize,
            Duration::from_millis(self.resilience.retry_base_ms),
            Duration::from_millis(self.resilience.retry_max_ms),
        )
        .with_jitter(self.resilience.retry_jitter)
    }

    /// Per-attempt infrastructure timeout.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.resilience.call_timeout_ms)
    }

    /// Alarm cache TTL.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.alarms.cache_ttl_ms)
    }

    /// Approval sweep cadence.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.approval.sweep_interval_s)
    }

    /// Retention of terminal deployments.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.pipeline.retention_s)
    }

    /// Settings for the pipeline state machine.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            approval_timeout: Duration::from_secs(self.pipeline.approval_timeout_s),
            operator_channel: self.notifications.operator_channel.clone(),
            default_alarms: self
                .alarms
                .bindings
                .iter()
                .map(|b| (b.alarm_name.clone(), b.severity))
                .collect(),
        }
    }
}

/// Export the JSON Schema for `OrchestratorConfig`.
///
/// This enables IDE autocomplete when editing TOML config files.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails (should not
/// happen with well-formed derive macros).
///
/// # Panics
///
/// This function never panics.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(OrchestratorConfig);
    serde_json::to_string_pretty(&schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_TOML: &str = r#"
[pipeline]
name = "checkout"

[escalation]
channel = "oncall"

[notifications]
operator_channel = "deploy-operators"
"#;

    fn minimal() -> OrchestratorConfig {
        toml::from_str(MINIMAL_TOML).expect("test: minimal config parses")
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = minimal();
        assert_eq!(config.canary.poll_interval_s, 15);
        assert!(config.canary.steps.is_empty());
        assert_eq!(config.approval.sweep_interval_s, 60);
        assert_eq!(config.alarms.cache_ttl_ms, 5000);
        assert_eq!(config.escalation.threshold_s, 1800);
        assert_eq!(config.escalation.re_escalation_s, 1800);
        assert_eq!(config.escalation.tick_s, 300);
        assert_eq!(config.resilience.retry_attempts, 3);
        assert_eq!(config.resilience.retry_base_ms, 2000);
        assert_eq!(config.observability.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_empty_steps_become_all_at_once_plan() {
        let plan = minimal().canary_plan();
        assert!(plan.steps.is_empty());
        assert_eq!(plan.poll_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_runtime_views_convert_units() {
        let mut config = minimal();
        config.canary.steps = vec![
            CanaryStepConfig { percent: 10, soak_s: 300 },
            CanaryStepConfig { percent: 100, soak_s: 60 },
        ];
        config.alarms.bindings = vec![AlarmBindingConfig {
            alarm_name: "api-5xx".into(),
            severity: Severity::Critical,
        }];

        let plan = config.canary_plan();
        assert_eq!(plan.steps[0].soak, Duration::from_secs(300));
        assert_eq!(config.escalation_policy().threshold, Duration::from_secs(1800));
        assert_eq!(config.retry_policy().max_attempts, 3);
        assert!(!config.retry_policy().jitter);
        assert_eq!(config.call_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.pipeline_settings().default_alarms,
            vec![("api-5xx".to_string(), Severity::Critical)]
        );
    }

    #[test]
    fn test_retry_jitter_flows_into_policy() {
        let resilience: ResilienceConfig =
            toml::from_str("retry_jitter = true").expect("test: parse");
        assert_eq!(resilience.retry_attempts, 3);

        let mut config = minimal();
        config.resilience = resilience;
        let policy = config.retry_policy();
        assert!(policy.jitter);
        let pause = policy.pause_after(1);
        assert!(pause >= Duration::from_secs(2));
        assert!(pause < Duration::from_millis(2500));
    }

    #[test]
    fn test_log_format_deserializes_from_snake_case() {
        let fmt: LogFormat = serde_json::from_str("\"json\"").expect("test: deserialization");
        assert_eq!(fmt, LogFormat::Json);
        assert_eq!(fmt.as_str(), "json");
    }

    #[test]
    fn test_severity_deserializes_from_snake_case() {
        let binding: AlarmBindingConfig =
            toml::from_str("alarm_name = \"a\"\nseverity = \"warning\"").expect("test: parse");
        assert_eq!(binding.severity, Severity::Warning);
    }

    #[test]
    fn test_export_schema_produces_valid_json() {
        let schema = export_schema().expect("test: schema export");
        let parsed: serde_json::Value =
            serde_json::from_str(&schema).expect("test: schema is valid JSON");
        assert!(parsed.get("properties").is_some() || parsed.get("$ref").is_some());
        assert!(schema.contains("operator_channel"));
    }
}
