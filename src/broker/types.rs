//! Data exchanged with the broker

use crate::consumer::config::ConsumerConfig;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Durations on the wire are integer nanoseconds
pub(crate) mod nanos {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        // servers report negative ages for peers they have never heard from
        let n = i64::deserialize(d)?;
        Ok(Duration::from_nanos(n.max(0) as u64))
    }
}

/// Consumer and stream sequence pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceInfo {
    /// Consumer-local sequence
    #[serde(default)]
    pub consumer_seq: u64,
    /// Stream sequence
    #[serde(default)]
    pub stream_seq: u64,
}

/// A member of a consumer's replication group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Server name
    pub name: String,
    /// Whether the peer is up to date
    #[serde(default)]
    pub current: bool,
    /// Time since the peer was last seen, zero when never seen
    #[serde(default, with = "nanos")]
    pub active: Duration,
}

/// Cluster membership attached to clustered consumers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    /// Cluster name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Current leader
    #[serde(default)]
    pub leader: String,
    /// Followers
    #[serde(default)]
    pub replicas: Vec<PeerInfo>,
}

/// Runtime state of a consumer, re-read from the broker on every query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    /// Stream the consumer reads from
    pub stream_name: String,
    /// Consumer name, assigned by the broker for ephemeral consumers
    pub name: String,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Active configuration
    pub config: ConsumerConfig,
    /// Last delivered message
    #[serde(default)]
    pub delivered: SequenceInfo,
    /// Highest contiguous acknowledged message
    #[serde(default)]
    pub ack_floor: SequenceInfo,
    /// Messages awaiting acknowledgement
    #[serde(default)]
    pub num_ack_pending: u64,
    /// Messages delivered more than once
    #[serde(default)]
    pub num_redelivered: u64,
    /// Outstanding pull requests
    #[serde(default)]
    pub num_waiting: u64,
    /// Messages not yet delivered
    #[serde(default)]
    pub num_pending: u64,
    /// Cluster membership, absent for single-replica consumers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterInfo>,
}

/// Stream configuration fields the tool cares about
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamSummary {
    /// Stream name
    pub name: String,
    /// Subjects the stream captures
    #[serde(default)]
    pub subjects: Vec<String>,
}

/// Stream counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    /// Stored messages
    #[serde(default)]
    pub messages: u64,
    /// Stored bytes
    #[serde(default)]
    pub bytes: u64,
    /// First sequence
    #[serde(default)]
    pub first_seq: u64,
    /// Last sequence
    #[serde(default)]
    pub last_seq: u64,
    /// Number of consumers
    #[serde(default)]
    pub consumer_count: u64,
}

/// Stream description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Configuration
    pub config: StreamSummary,
    /// Counters
    #[serde(default)]
    pub state: StreamState,
}

/// A message received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Subject the message was published on
    pub subject: String,
    /// Reply subject, the acknowledgement address for consumer deliveries
    pub reply: Option<String>,
    /// Headers in arrival order
    pub headers: Vec<(String, String)>,
    /// Body
    pub payload: Bytes,
}

impl Message {
    /// Create a message without reply or headers
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: Vec::new(),
            payload: payload.into(),
        }
    }

    /// Set the reply subject
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Append a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Delivery metadata encoded in the reply subject
    pub fn metadata(&self) -> Option<MessageMetadata> {
        MessageMetadata::parse(self.reply.as_deref()?)
    }
}

/// Delivery details of a consumer message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    /// JetStream domain, if any
    pub domain: Option<String>,
    /// Stream name
    pub stream: String,
    /// Consumer name
    pub consumer: String,
    /// Delivery attempt count
    pub delivered: u64,
    /// Stream sequence
    pub stream_sequence: u64,
    /// Consumer sequence
    pub consumer_sequence: u64,
    /// Time the message was stored
    pub timestamp: DateTime<Utc>,
    /// Messages left for the consumer after this one
    pub pending: u64,
}

impl MessageMetadata {
    /// Parse `$JS.ACK.<stream>.<consumer>.<delivered>.<sseq>.<cseq>.<ts>.<pending>`
    /// or the longer form carrying a domain and account hash
    pub fn parse(reply: &str) -> Option<Self> {
        let tokens: Vec<&str> = reply.split('.').collect();
        if tokens.len() < 9 || tokens[0] != "$JS" || tokens[1] != "ACK" {
            return None;
        }

        let (domain, rest) = match tokens.len() {
            9 => (None, &tokens[2..]),
            n if n >= 11 => {
                let domain = Some(tokens[2]).filter(|d| *d != "_").map(str::to_string);
                (domain, &tokens[4..])
            }
            _ => return None,
        };

        let nanos: i64 = rest[5].parse().ok()?;
        Some(Self {
            domain,
            stream: rest[0].to_string(),
            consumer: rest[1].to_string(),
            delivered: rest[2].parse().ok()?,
            stream_sequence: rest[3].parse().ok()?,
            consumer_sequence: rest[4].parse().ok()?,
            timestamp: Utc.timestamp_nanos(nanos),
            pending: rest[6].parse().ok()?,
        })
    }

    /// Encode as a reply subject
    pub fn to_reply(&self) -> String {
        format!(
            "$JS.ACK.{}.{}.{}.{}.{}.{}.{}",
            self.stream,
            self.consumer,
            self.delivered,
            self.stream_sequence,
            self.consumer_sequence,
            self.timestamp.timestamp_nanos_opt().unwrap_or_default(),
            self.pending
        )
    }
}
