//! Semantic checks on a parsed [`OrchestratorConfig`].
//!
//! Serde enforces shape; this module enforces meaning: canary steps that
//! climb to 100%, non-zero intervals, named channels, unique alarm bindings
//! and a sane retry window. [`validate`] reports every problem in one pass,
//! each tagged with the offending field path.

use std::collections::HashSet;

use super::OrchestratorConfig;

/// Why a config could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("{file} is not valid orchestrator TOML: {source}")]
    Parse {
        /// File or source label.
        file: String,
        /// Deserializer error.
        #[source]
        source: toml::de::Error,
    },

    /// [`validate`] found problems; one per line.
    #[error("config rejected:\n{0}")]
    Validation(String),

    /// One field breaks a rule.
    #[error("{field} = {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "canary.steps[1].percent").
        field: String,
        /// Offending value as written.
        value: String,
        /// Rule that was broken.
        reason: String,
    },

    /// File I/O error.
    #[error("cannot read {file}: {source}")]
    Io {
        /// File involved.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: impl Into<String>, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn require_positive(errors: &mut Vec<ConfigError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(invalid(field, 0, "must be at least 1"));
    }
}

fn require_non_empty(errors: &mut Vec<ConfigError>, field: &str, value: &str) {
    if value.trim().is_empty() {
        errors.push(invalid(field, value, "must not be empty"));
    }
}

/// Check every rule on `config`.
///
/// # Errors
///
/// One [`ConfigError::InvalidField`] per violation, in field order.
pub fn validate(config: &OrchestratorConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Pipeline ─────────────────────────────────────────────────────
    require_non_empty(&mut errors, "pipeline.name", &config.pipeline.name);
    require_positive(
        &mut errors,
        "pipeline.approval_timeout_s",
        config.pipeline.approval_timeout_s,
    );

    // ── Canary steps ─────────────────────────────────────────────────
    let mut previous = 0u8;
    for (i, step) in config.canary.steps.iter().enumerate() {
        let field = format!("canary.steps[{i}].percent");
        if !(1..=100).contains(&step.percent) {
            errors.push(invalid(field, step.percent, "must be between 1 and 100"));
        } else if step.percent <= previous {
            errors.push(invalid(field, step.percent, "steps must be strictly ascending"));
        }
        previous = previous.max(step.percent);
    }
    if let Some(last) = config.canary.steps.last() {
        if last.percent != 100 {
            errors.push(invalid(
                format!("canary.steps[{}].percent", config.canary.steps.len() - 1),
                last.percent,
                "final step must reach 100",
            ));
        }
    }
    require_positive(
        &mut errors,
        "canary.poll_interval_s",
        config.canary.poll_interval_s,
    );

    // ── Approval ─────────────────────────────────────────────────────
    require_positive(
        &mut errors,
        "approval.sweep_interval_s",
        config.approval.sweep_interval_s,
    );

    // ── Alarm bindings ───────────────────────────────────────────────
    let mut seen = HashSet::new();
    for (i, binding) in config.alarms.bindings.iter().enumerate() {
        let field = format!("alarms.bindings[{i}].alarm_name");
        if binding.alarm_name.trim().is_empty() {
            errors.push(invalid(field, &binding.alarm_name, "must not be empty"));
        } else if !seen.insert(binding.alarm_name.as_str()) {
            errors.push(invalid(field, &binding.alarm_name, "alarm is bound twice"));
        }
    }

    // ── Escalation ───────────────────────────────────────────────────
    require_positive(&mut errors, "escalation.threshold_s", config.escalation.threshold_s);
    require_positive(
        &mut errors,
        "escalation.re_escalation_s",
        config.escalation.re_escalation_s,
    );
    require_positive(&mut errors, "escalation.tick_s", config.escalation.tick_s);
    require_non_empty(&mut errors, "escalation.channel", &config.escalation.channel);

    // ── Notifications ────────────────────────────────────────────────
    require_non_empty(
        &mut errors,
        "notifications.operator_channel",
        &config.notifications.operator_channel,
    );

    // ── Resilience ───────────────────────────────────────────────────
    if config.resilience.retry_base_ms > config.resilience.retry_max_ms {
        errors.push(invalid(
            "resilience.retry_base_ms",
            config.resilience.retry_base_ms,
            "must be \u{2264} retry_max_ms",
        ));
    }
    if config.resilience.retry_attempts == 0 {
        errors.push(invalid("resilience.retry_attempts", 0, "must be at least 1"));
    }
    require_positive(
        &mut errors,
        "resilience.call_timeout_ms",
        config.resilience.call_timeout_ms,
    );

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;
    use crate::model::Severity;

    /// Known-good config for negative tests to break.
    fn valid_config() -> OrchestratorConfig {
        OrchestratorConfig {
            pipeline: PipelineSection {
                name: "checkout".into(),
                approval_timeout_s: 14_400,
                retention_s: 86_400,
            },
            canary: CanaryConfig {
                steps: vec![
                    CanaryStepConfig { percent: 10, soak_s: 300 },
                    CanaryStepConfig { percent: 50, soak_s: 300 },
                    CanaryStepConfig { percent: 100, soak_s: 300 },
                ],
                poll_interval_s: 15,
            },
            approval: ApprovalConfig { sweep_interval_s: 60 },
            alarms: AlarmsConfig {
                cache_ttl_ms: 5000,
                bindings: vec![AlarmBindingConfig {
                    alarm_name: "api-5xx".into(),
                    severity: Severity::Critical,
                }],
            },
            escalation: EscalationConfig {
                threshold_s: 1800,
                re_escalation_s: 1800,
                tick_s: 300,
                channel: "oncall".into(),
            },
            notifications: NotificationsConfig {
                operator_channel: "deploy-operators".into(),
            },
            resilience: ResilienceConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }

    fn has_field(errors: &[ConfigError], wanted: &str) -> bool {
        errors.iter().any(|e| {
            matches!(e, ConfigError::InvalidField { field, .. } if field == wanted)
        })
    }

    #[test]
    fn test_validate_sample_config_passes() {
        assert!(validate(&valid_config()).is_ok());
    }

    // ── Canary ──────────────────────────────────────────────────────

    #[test]
    fn test_validate_empty_steps_passes() {
        let mut config = valid_config();
        config.canary.steps.clear();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_validate_descending_steps_fail() {
        let mut config = valid_config();
        config.canary.steps[1].percent = 5;
        let errors = validate(&config).expect_err("test: must fail");
        assert!(has_field(&errors, "canary.steps[1].percent"));
    }

    #[test]
    fn test_validate_repeated_step_fails() {
        let mut config = valid_config();
        config.canary.steps[1].percent = 10;
        let errors = validate(&config).expect_err("test: must fail");
        assert!(has_field(&errors, "canary.steps[1].percent"));
    }

    #[test]
    fn test_validate_zero_percent_fails() {
        let mut config = valid_config();
        config.canary.steps[0].percent = 0;
        let errors = validate(&config).expect_err("test: must fail");
        assert!(has_field(&errors, "canary.steps[0].percent"));
    }

    #[test]
    fn test_validate_percent_above_100_fails() {
        let mut config = valid_config();
        config.canary.steps[2].percent = 150;
        let errors = validate(&config).expect_err("test: must fail");
        assert!(has_field(&errors, "canary.steps[2].percent"));
    }

    #[test]
    fn test_validate_last_step_below_100_fails() {
        let mut config = valid_config();
        config.canary.steps.pop();
        let errors = validate(&config).expect_err("test: must fail");
        assert!(has_field(&errors, "canary.steps[1].percent"));
    }

    #[test]
    fn test_validate_zero_poll_interval_fails() {
        let mut config = valid_config();
        config.canary.poll_interval_s = 0;
        let errors = validate(&config).expect_err("test: must fail");
        assert!(has_field(&errors, "canary.poll_interval_s"));
    }

    // ── Timing ──────────────────────────────────────────────────────

    #[test]
    fn test_validate_zero_approval_timeout_fails() {
        let mut config = valid_config();
        config.pipeline.approval_timeout_s = 0;
        let errors = validate(&config).expect_err("test: must fail");
        assert!(has_field(&errors, "pipeline.approval_timeout_s"));
    }

    #[test]
    fn test_validate_zero_sweep_interval_fails() {
        let mut config = valid_config();
        config.approval.sweep_interval_s = 0;
        let errors = validate(&config).expect_err("test: must fail");
        assert!(has_field(&errors, "approval.sweep_interval_s"));
    }

    #[test]
    fn test_validate_zero_escalation_intervals_fail() {
        let mut config = valid_config();
        config.escalation.threshold_s = 0;
        config.escalation.re_escalation_s = 0;
        config.escalation.tick_s = 0;
        let errors = validate(&config).expect_err("test: must fail");
        assert!(has_field(&errors, "escalation.threshold_s"));
        assert!(has_field(&errors, "escalation.re_escalation_s"));
        assert!(has_field(&errors, "escalation.tick_s"));
    }

    // ── Names ───────────────────────────────────────────────────────

    #[test]
    fn test_validate_empty_pipeline_name_fails() {
        let mut config = valid_config();
        config.pipeline.name = "  ".into();
        let errors = validate(&config).expect_err("test: must fail");
        assert!(has_field(&errors, "pipeline.name"));
    }

    #[test]
    fn test_validate_empty_channels_fail() {
        let mut config = valid_config();
        config.escalation.channel = String::new();
        config.notifications.operator_channel = String::new();
        let errors = validate(&config).expect_err("test: must fail");
        assert!(has_field(&errors, "escalation.channel"));
        assert!(has_field(&errors, "notifications.operator_channel"));
    }

    #[test]
    fn test_validate_duplicate_binding_fails() {
        let mut config = valid_config();
        config.alarms.bindings.push(AlarmBindingConfig {
            alarm_name: "api-5xx".into(),
            severity: Severity::Warning,
        });
        let errors = validate(&config).expect_err("test: must fail");
        assert!(has_field(&errors, "alarms.bindings[1].alarm_name"));
    }

    // ── Retry ───────────────────────────────────────────────────────

    #[test]
    fn test_validate_retry_base_exceeds_max_fails() {
        let mut config = valid_config();
        config.resilience.retry_base_ms = 10_000;
        config.resilience.retry_max_ms = 1000;
        let errors = validate(&config).expect_err("test: must fail");
        assert!(has_field(&errors, "resilience.retry_base_ms"));
    }

    #[test]
    fn test_validate_retry_base_equals_max_passes() {
        let mut config = valid_config();
        config.resilience.retry_base_ms = 5000;
        config.resilience.retry_max_ms = 5000;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_validate_retry_attempts_zero_fails() {
        let mut config = valid_config();
        config.resilience.retry_attempts = 0;
        let errors = validate(&config).expect_err("test: must fail");
        assert!(has_field(&errors, "resilience.retry_attempts"));
    }

    #[test]
    fn test_validate_zero_call_timeout_fails() {
        let mut config = valid_config();
        config.resilience.call_timeout_ms = 0;
        let errors = validate(&config).expect_err("test: must fail");
        assert!(has_field(&errors, "resilience.call_timeout_ms"));
    }

    // ── Reporting ───────────────────────────────────────────────────

    #[test]
    fn test_validate_reports_every_violation() {
        let mut config = valid_config();
        config.resilience.retry_base_ms = 99_999;
        config.resilience.retry_max_ms = 100;
        config.canary.steps[0].percent = 0;
        config.pipeline.name = String::new();
        config.escalation.tick_s = 0;
        let errors = validate(&config).expect_err("test: must fail");
        assert!(errors.len() >= 4, "expected >=4 errors, got {}", errors.len());
    }

    #[test]
    fn test_parse_error_names_source() {
        let toml_err =
            toml::from_str::<OrchestratorConfig>("invalid toml [[[").expect_err("test: bad toml");
        let err = ConfigError::Parse {
            file: "test.toml".into(),
            source: toml_err,
        };
        assert!(err.to_string().contains("test.toml"));
    }

    #[test]
    fn test_invalid_field_shows_path_and_value() {
        let err = invalid("resilience.retry_base_ms", 99_999, "must be \u{2264} retry_max_ms");
        let msg = err.to_string();
        assert!(msg.contains("resilience.retry_base_ms"));
        assert!(msg.contains("99999"));
    }

    #[test]
    fn test_io_error_names_file() {
        let err = ConfigError::Io {
            file: "missing.toml".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert!(err.to_string().contains("missing.toml"));
    }
}
