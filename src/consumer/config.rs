//! Consumer configuration structures and their canonical serialized form

use crate::error::{ConsumerError, ConsumerResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Where in the stream a new consumer starts delivering from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliverPolicy {
    /// Every message held by the stream
    #[default]
    All,
    /// Only the last message
    Last,
    /// Only messages published after the consumer was created
    New,
    /// Starting at a stream sequence
    ByStartSequence(u64),
    /// Starting at a point in time
    ByStartTime(DateTime<Utc>),
    /// The last message for every subject
    LastPerSubject,
}

impl DeliverPolicy {
    fn wire_name(&self) -> &'static str {
        match self {
            DeliverPolicy::All => "all",
            DeliverPolicy::Last => "last",
            DeliverPolicy::New => "new",
            DeliverPolicy::ByStartSequence(_) => "by_start_sequence",
            DeliverPolicy::ByStartTime(_) => "by_start_time",
            DeliverPolicy::LastPerSubject => "last_per_subject",
        }
    }
}

/// Acknowledgement policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    /// Nothing is acknowledged, every message is delivered once
    #[default]
    None,
    /// Acknowledging a message acknowledges all before it
    All,
    /// Every message is acknowledged individually
    Explicit,
}

impl FromStr for AckPolicy {
    type Err = ConsumerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(AckPolicy::None),
            "all" => Ok(AckPolicy::All),
            "explicit" => Ok(AckPolicy::Explicit),
            _ => Err(ConsumerError::input(format!("invalid ack policy '{}'", s))),
        }
    }
}

impl fmt::Display for AckPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AckPolicy::None => "None",
            AckPolicy::All => "All",
            AckPolicy::Explicit => "Explicit",
        })
    }
}

/// Rate at which stored messages are replayed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicy {
    /// As fast as possible
    #[default]
    Instant,
    /// At the rate they were originally received
    Original,
}

impl FromStr for ReplayPolicy {
    type Err = ConsumerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "instant" => Ok(ReplayPolicy::Instant),
            "original" => Ok(ReplayPolicy::Original),
            _ => Err(ConsumerError::input(format!("invalid replay policy '{}'", s))),
        }
    }
}

impl fmt::Display for ReplayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReplayPolicy::Instant => "Instant",
            ReplayPolicy::Original => "Original",
        })
    }
}

/// Consumer configuration as submitted to the broker
///
/// Serializes to the broker's JSON API shape, which is also the format of
/// configuration files written with `--output` and read with `--config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireConfig", try_from = "WireConfig")]
pub struct ConsumerConfig {
    /// Durable name, `None` for ephemeral consumers
    pub durable_name: Option<String>,
    /// Push delivery subject, `None` for pull consumers
    pub deliver_subject: Option<String>,
    /// Only deliver messages matching this subject
    pub filter_subject: Option<String>,
    /// Starting point in the stream
    pub deliver_policy: DeliverPolicy,
    /// Acknowledgement policy
    pub ack_policy: AckPolicy,
    /// How long the broker waits for an acknowledgement, zero for the broker default
    pub ack_wait: Duration,
    /// Replay policy
    pub replay_policy: ReplayPolicy,
    /// Maximum delivery attempts, -1 for unlimited
    pub max_deliver: i64,
    /// Maximum outstanding acknowledgements, 0 for unlimited
    pub max_ack_pending: i64,
    /// Push delivery rate limit in bits per second, 0 for unlimited
    pub rate_limit_bps: u64,
    /// Percentage of acknowledgements sampled for monitoring
    pub sample_frequency: Option<u8>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            durable_name: None,
            deliver_subject: None,
            filter_subject: None,
            deliver_policy: DeliverPolicy::All,
            ack_policy: AckPolicy::Explicit,
            ack_wait: Duration::ZERO,
            replay_policy: ReplayPolicy::Instant,
            max_deliver: 0,
            max_ack_pending: 0,
            rate_limit_bps: 0,
            sample_frequency: None,
        }
    }
}

impl ConsumerConfig {
    /// True when no delivery subject is set
    pub fn is_pull_mode(&self) -> bool {
        self.deliver_subject.is_none()
    }

    /// True when messages are pushed to a delivery subject
    pub fn is_push_mode(&self) -> bool {
        self.deliver_subject.is_some()
    }

    /// True when the consumer has no durable name
    pub fn is_ephemeral(&self) -> bool {
        self.durable_name.is_none()
    }

    /// Canonical indented JSON form
    pub fn to_canonical_json(&self) -> ConsumerResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Canonical form as a JSON document
    pub fn to_document(&self) -> ConsumerResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parse a configuration from canonical JSON
    pub fn from_json(data: &str) -> ConsumerResult<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// Load a configuration file, YAML when the extension says so and JSON otherwise
    ///
    /// Keys this tool does not manage are logged and dropped.
    pub fn from_file(path: impl AsRef<Path>) -> ConsumerResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)?;
        let document: serde_json::Value = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&data)?,
            _ => serde_json::from_str(&data)?,
        };

        let ignored = unknown_fields(&document);
        if !ignored.is_empty() {
            warn!(path = %path.display(), fields = ?ignored, "ignoring unknown consumer configuration fields");
        }
        Ok(serde_json::from_value(document)?)
    }

    /// Write the canonical form to a file
    pub fn write_file(&self, path: impl AsRef<Path>) -> ConsumerResult<()> {
        std::fs::write(path, self.to_canonical_json()?)?;
        Ok(())
    }
}

const KNOWN_FIELDS: &[&str] = &[
    "durable_name",
    "deliver_subject",
    "deliver_policy",
    "opt_start_seq",
    "opt_start_time",
    "ack_policy",
    "ack_wait",
    "max_deliver",
    "filter_subject",
    "replay_policy",
    "rate_limit_bps",
    "sample_freq",
    "max_ack_pending",
];

/// Top level keys of a configuration document that are not consumer settings
pub fn unknown_fields(document: &serde_json::Value) -> Vec<String> {
    document
        .as_object()
        .map(|doc| {
            doc.keys()
                .filter(|k| !KNOWN_FIELDS.contains(&k.as_str()))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

/// Flat representation matching the broker API
#[derive(Debug, Serialize, Deserialize)]
struct WireConfig {
    #[serde(default, skip_serializing_if = "is_blank", deserialize_with = "non_empty")]
    durable_name: Option<String>,
    #[serde(default, skip_serializing_if = "is_blank", deserialize_with = "non_empty")]
    deliver_subject: Option<String>,
    #[serde(default = "default_deliver_policy")]
    deliver_policy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    opt_start_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    opt_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    ack_policy: AckPolicy,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    ack_wait: u64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    max_deliver: i64,
    #[serde(default, skip_serializing_if = "is_blank", deserialize_with = "non_empty")]
    filter_subject: Option<String>,
    #[serde(default)]
    replay_policy: ReplayPolicy,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    rate_limit_bps: u64,
    #[serde(default, skip_serializing_if = "is_blank", deserialize_with = "non_empty")]
    sample_freq: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    max_ack_pending: i64,
}

fn default_deliver_policy() -> String {
    "all".to_string()
}

fn is_blank(s: &Option<String>) -> bool {
    s.as_deref().map_or(true, str::is_empty)
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn non_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

/// Parse a sample frequency such as `"50"` or `"50%"`
pub fn parse_sample_frequency(s: &str) -> Result<u8, String> {
    let trimmed = s.trim().trim_end_matches('%');
    let pct: u8 = trimmed
        .parse()
        .map_err(|_| format!("invalid sample frequency '{}'", s))?;
    if pct > 100 {
        return Err(format!("sample frequency {} is not between 0 and 100", pct));
    }
    Ok(pct)
}

impl From<ConsumerConfig> for WireConfig {
    fn from(cfg: ConsumerConfig) -> Self {
        let (opt_start_seq, opt_start_time) = match cfg.deliver_policy {
            DeliverPolicy::ByStartSequence(seq) => (Some(seq), None),
            DeliverPolicy::ByStartTime(t) => (None, Some(t)),
            _ => (None, None),
        };

        Self {
            durable_name: cfg.durable_name,
            deliver_subject: cfg.deliver_subject,
            deliver_policy: cfg.deliver_policy.wire_name().to_string(),
            opt_start_seq,
            opt_start_time,
            ack_policy: cfg.ack_policy,
            ack_wait: u64::try_from(cfg.ack_wait.as_nanos()).unwrap_or(u64::MAX),
            max_deliver: cfg.max_deliver,
            filter_subject: cfg.filter_subject,
            replay_policy: cfg.replay_policy,
            rate_limit_bps: cfg.rate_limit_bps,
            sample_freq: cfg.sample_frequency.map(|p| p.to_string()),
            max_ack_pending: cfg.max_ack_pending,
        }
    }
}

impl TryFrom<WireConfig> for ConsumerConfig {
    type Error = String;

    fn try_from(wire: WireConfig) -> Result<Self, Self::Error> {
        let deliver_policy = match wire.deliver_policy.as_str() {
            "all" | "" => DeliverPolicy::All,
            "last" => DeliverPolicy::Last,
            "new" => DeliverPolicy::New,
            "last_per_subject" => DeliverPolicy::LastPerSubject,
            "by_start_sequence" => DeliverPolicy::ByStartSequence(wire.opt_start_seq.unwrap_or(0)),
            "by_start_time" => DeliverPolicy::ByStartTime(
                wire.opt_start_time
                    .ok_or_else(|| "deliver policy by_start_time requires opt_start_time".to_string())?,
            ),
            other => return Err(format!("unknown deliver policy '{}'", other)),
        };

        let sample_frequency = wire
            .sample_freq
            .as_deref()
            .map(parse_sample_frequency)
            .transpose()?;

        Ok(Self {
            durable_name: wire.durable_name,
            deliver_subject: wire.deliver_subject,
            filter_subject: wire.filter_subject,
            deliver_policy,
            ack_policy: wire.ack_policy,
            ack_wait: Duration::from_nanos(wire.ack_wait),
            replay_policy: wire.replay_policy,
            max_deliver: wire.max_deliver,
            max_ack_pending: wire.max_ack_pending,
            rate_limit_bps: wire.rate_limit_bps,
            sample_frequency,
        })
    }
}
