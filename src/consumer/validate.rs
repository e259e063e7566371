//! Schema and semantic validation of consumer configurations
//!
//! Validation works on the canonical JSON document rather than the typed
//! struct, so configurations read from files are checked exactly as they
//! would be submitted.

use crate::consumer::config::ConsumerConfig;
use crate::error::ConsumerResult;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

/// Environment variable that disables validation
pub const NO_VALIDATE_ENV: &str = "NOVALIDATE";

/// Whether a `NOVALIDATE` value asks for validation to be skipped
///
/// Any non-empty value does, including `0` and `false`.
pub fn bypass_requested(value: &str) -> bool {
    !value.is_empty()
}

static ILLEGAL_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.*>\s]").expect("valid regex"));

/// A rules engine over canonical configuration documents
pub trait Validator: Send + Sync {
    /// Return every violation found in the document
    fn validate(&self, document: &Value) -> Vec<String>;
}

/// Built in rule set mirroring the broker's consumer configuration schema
#[derive(Debug, Default, Clone, Copy)]
pub struct SchemaValidator;

impl SchemaValidator {
    fn check_name(doc: &Map<String, Value>, errors: &mut Vec<String>) {
        if let Some(name) = doc.get("durable_name").and_then(Value::as_str) {
            if ILLEGAL_NAME.is_match(name) {
                errors.push("durable_name: can not contain '.', '*', '>' or whitespace".to_string());
            }
        }
    }

    fn check_subjects(doc: &Map<String, Value>, errors: &mut Vec<String>) {
        if let Some(subject) = doc.get("deliver_subject").and_then(Value::as_str) {
            if !valid_subject(subject) {
                errors.push(format!("deliver_subject: '{}' is not a valid subject", subject));
            } else if subject.split('.').any(|t| t == "*" || t == ">") {
                errors.push("deliver_subject: can not contain wildcards".to_string());
            }
        }

        if let Some(subject) = doc.get("filter_subject").and_then(Value::as_str) {
            if !valid_subject(subject) {
                errors.push(format!("filter_subject: '{}' is not a valid subject", subject));
            }
        }
    }

    fn check_policies(doc: &Map<String, Value>, errors: &mut Vec<String>) {
        let policy = doc.get("deliver_policy").and_then(Value::as_str).unwrap_or("all");
        match policy {
            "all" | "last" | "new" | "last_per_subject" => {
                if doc.contains_key("opt_start_seq") || doc.contains_key("opt_start_time") {
                    errors.push(format!(
                        "deliver_policy: {} can not be combined with a start sequence or time",
                        policy
                    ));
                }
            }
            "by_start_sequence" => match doc.get("opt_start_seq").and_then(Value::as_u64) {
                Some(seq) if seq > 0 => {}
                _ => errors.push("opt_start_seq: must be at least 1 for by_start_sequence".to_string()),
            },
            "by_start_time" => {
                if doc.get("opt_start_time").and_then(Value::as_str).is_none() {
                    errors.push("opt_start_time: is required for by_start_time".to_string());
                }
            }
            other => errors.push(format!("deliver_policy: '{}' is not a valid policy", other)),
        }

        if let Some(ack) = doc.get("ack_policy").and_then(Value::as_str) {
            if !matches!(ack, "none" | "all" | "explicit") {
                errors.push(format!("ack_policy: '{}' is not a valid policy", ack));
            }
        }

        if let Some(replay) = doc.get("replay_policy").and_then(Value::as_str) {
            if !matches!(replay, "instant" | "original") {
                errors.push(format!("replay_policy: '{}' is not a valid policy", replay));
            }
        }
    }

    fn check_limits(doc: &Map<String, Value>, errors: &mut Vec<String>) {
        if let Some(max) = doc.get("max_deliver").and_then(Value::as_i64) {
            if max < -1 {
                errors.push("max_deliver: must be -1 or greater".to_string());
            }
        }

        if let Some(max) = doc.get("max_ack_pending").and_then(Value::as_i64) {
            if max < 0 {
                errors.push("max_ack_pending: must be 0 or greater".to_string());
            }
        }

        if let Some(freq) = doc.get("sample_freq").and_then(Value::as_str) {
            let pct = freq.trim_end_matches('%').parse::<u32>();
            if !matches!(pct, Ok(p) if p <= 100) {
                errors.push(format!("sample_freq: '{}' is not a percentage between 0 and 100", freq));
            }
        }
    }

    fn check_modes(doc: &Map<String, Value>, errors: &mut Vec<String>) {
        let push = doc.get("deliver_subject").and_then(Value::as_str).is_some();
        let durable = doc.get("durable_name").and_then(Value::as_str).is_some();
        let rate = doc.get("rate_limit_bps").and_then(Value::as_u64).unwrap_or(0);

        if rate > 0 && !push {
            errors.push("rate_limit_bps: rate limits are only possible on push consumers".to_string());
        }

        if !durable && !push {
            errors.push("deliver_subject: ephemeral consumers must be push-based".to_string());
        }
    }
}

fn valid_subject(subject: &str) -> bool {
    !subject.is_empty()
        && !subject.chars().any(char::is_whitespace)
        && subject.split('.').all(|token| !token.is_empty())
}

impl Validator for SchemaValidator {
    fn validate(&self, document: &Value) -> Vec<String> {
        let Some(doc) = document.as_object() else {
            return vec!["configuration must be an object".to_string()];
        };

        let mut errors = Vec::new();
        Self::check_name(doc, &mut errors);
        Self::check_subjects(doc, &mut errors);
        Self::check_policies(doc, &mut errors);
        Self::check_limits(doc, &mut errors);
        Self::check_modes(doc, &mut errors);
        errors
    }
}

/// Outcome of validating a configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    /// Whether the configuration passed
    pub valid: bool,
    /// Human readable violations
    pub errors: Vec<String>,
    /// Canonical form that was validated
    pub canonical: String,
}

/// Runs configurations through a [`Validator`], honouring the bypass toggle
pub struct ConfigValidator {
    rules: Box<dyn Validator>,
    bypass: bool,
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new(Box::new(SchemaValidator))
    }
}

impl ConfigValidator {
    /// Create a validator over a rule set
    pub fn new(rules: Box<dyn Validator>) -> Self {
        Self { rules, bypass: false }
    }

    /// Declare every configuration valid without running the rules
    pub fn bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    /// Bypass when the `NOVALIDATE` environment variable is set
    pub fn from_env() -> Self {
        let bypass = std::env::var_os(NO_VALIDATE_ENV)
            .is_some_and(|v| bypass_requested(&v.to_string_lossy()));
        Self::default().bypass(bypass)
    }

    /// Validate a configuration, never modifying it
    pub fn validate(&self, config: &ConsumerConfig) -> ConsumerResult<ValidationReport> {
        let canonical = config.to_canonical_json()?;

        if self.bypass {
            debug!("configuration validation bypassed");
            return Ok(ValidationReport {
                valid: true,
                errors: Vec::new(),
                canonical,
            });
        }

        let errors = self.rules.validate(&config.to_document()?);
        Ok(ValidationReport {
            valid: errors.is_empty(),
            errors,
            canonical,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::config::{AckPolicy, DeliverPolicy};
    use serde_json::json;

    fn pull() -> ConsumerConfig {
        ConsumerConfig {
            durable_name: Some("PULL".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_pull_consumer() {
        let report = ConfigValidator::default().validate(&pull()).unwrap();
        assert!(report.valid, "{:?}", report.errors);
        assert!(report.canonical.contains("\"durable_name\": \"PULL\""));
    }

    #[test]
    fn test_collects_every_violation() {
        let config = ConsumerConfig {
            durable_name: None,
            rate_limit_bps: 1024,
            max_deliver: -5,
            deliver_policy: DeliverPolicy::ByStartSequence(0),
            ..Default::default()
        };
        let report = ConfigValidator::default().validate(&config).unwrap();
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 4, "{:?}", report.errors);
    }

    #[test]
    fn test_bypass_declares_valid() {
        let config = ConsumerConfig {
            durable_name: None,
            ..Default::default()
        };
        let report = ConfigValidator::default().bypass(true).validate(&config).unwrap();
        assert!(report.valid);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_validation_does_not_mutate() {
        let config = ConsumerConfig {
            ack_policy: AckPolicy::None,
            max_deliver: 7,
            ..pull()
        };
        let before = config.clone();
        ConfigValidator::default().validate(&config).unwrap();
        assert_eq!(config, before);
    }

    #[test]
    fn test_raw_documents() {
        let rules = SchemaValidator;
        assert!(rules.validate(&json!({"durable_name": "X", "ack_wait": 5})).is_empty());
        assert!(!rules.validate(&json!({"durable_name": "X", "deliver_subject": "out.>"})).is_empty());
        assert!(!rules.validate(&json!({"durable_name": "X", "sample_freq": "150"})).is_empty());
        assert_eq!(rules.validate(&json!([])), vec!["configuration must be an object"]);
    }
}
