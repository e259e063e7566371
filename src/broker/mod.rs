//! The broker as seen by consumer management
//!
//! Storage, replication and transport belong to the broker and its client
//! library. This module narrows them to the handful of operations the tool
//! needs, so the core components can run against a live JetStream server or
//! the in-process [`MemoryBroker`].

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;
pub mod types;

pub use memory::MemoryBroker;
#[cfg(feature = "nats")]
pub use nats::NatsBroker;
pub use types::{
    ClusterInfo, ConsumerInfo, Message, MessageMetadata, PeerInfo, SequenceInfo, StreamInfo,
    StreamState, StreamSummary,
};

use crate::consumer::config::{AckPolicy, ConsumerConfig};
use crate::error::{ConsumerError, ConsumerResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;

/// Messages delivered to a subscription
pub type MessageStream = BoxStream<'static, Message>;

/// Operations consumed from the broker
#[async_trait]
pub trait Broker: Send + Sync {
    /// Describe a stream
    async fn stream_info(&self, stream: &str) -> ConsumerResult<StreamInfo>;

    /// Names of every stream
    async fn stream_names(&self) -> ConsumerResult<Vec<String>>;

    /// Names of the consumers defined on a stream
    async fn consumer_names(&self, stream: &str) -> ConsumerResult<Vec<String>>;

    /// Current configuration and runtime state of a consumer
    async fn consumer_info(&self, stream: &str, consumer: &str) -> ConsumerResult<ConsumerInfo>;

    /// Create a consumer, returning its initial state
    async fn create_consumer(&self, stream: &str, config: &ConsumerConfig) -> ConsumerResult<ConsumerInfo>;

    /// Delete a consumer
    async fn delete_consumer(&self, stream: &str, consumer: &str) -> ConsumerResult<()>;

    /// Ask the consumer's current leader to give up leadership
    async fn leader_step_down(&self, stream: &str, consumer: &str) -> ConsumerResult<()>;

    /// Request one message from a pull consumer, waiting at most `expiry`
    async fn fetch_next(&self, stream: &str, consumer: &str, expiry: Duration) -> ConsumerResult<Message>;

    /// Receive every message published to a subject
    async fn subscribe(&self, subject: &str) -> ConsumerResult<MessageStream>;

    /// Reply to a message with an empty body
    async fn respond_empty(&self, message: &Message) -> ConsumerResult<()>;

    /// Push buffered outbound data to the broker
    async fn flush(&self) -> ConsumerResult<()>;
}

pub(crate) fn reply_subject(message: &Message) -> ConsumerResult<&str> {
    message.reply.as_deref().ok_or_else(|| ConsumerError::Ack {
        subject: message.subject.clone(),
        reason: "message has no reply subject".to_string(),
    })
}

/// A loaded consumer on a stream
///
/// The configuration is a snapshot taken when the handle was loaded; runtime
/// state is fetched from the broker on every call to [`ConsumerHandle::state`].
#[derive(Clone)]
pub struct ConsumerHandle {
    broker: Arc<dyn Broker>,
    stream: String,
    name: String,
    config: ConsumerConfig,
}

impl std::fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("stream", &self.stream)
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

impl ConsumerHandle {
    /// Wrap consumer information returned by the broker
    pub fn new(broker: Arc<dyn Broker>, info: &ConsumerInfo) -> Self {
        Self {
            broker,
            stream: info.stream_name.clone(),
            name: info.name.clone(),
            config: info.config.clone(),
        }
    }

    /// Stream name
    pub fn stream_name(&self) -> &str {
        &self.stream
    }

    /// Consumer name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration at load time
    pub fn configuration(&self) -> &ConsumerConfig {
        &self.config
    }

    /// True for pull consumers
    pub fn is_pull_mode(&self) -> bool {
        self.config.is_pull_mode()
    }

    /// True for push consumers
    pub fn is_push_mode(&self) -> bool {
        self.config.is_push_mode()
    }

    /// Acknowledgement policy
    pub fn ack_policy(&self) -> AckPolicy {
        self.config.ack_policy
    }

    /// Acknowledgement wait
    pub fn ack_wait(&self) -> Duration {
        self.config.ack_wait
    }

    /// Push delivery subject
    pub fn delivery_subject(&self) -> Option<&str> {
        self.config.deliver_subject.as_deref()
    }

    /// Broker this consumer lives on
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Fetch fresh runtime state
    pub async fn state(&self) -> ConsumerResult<ConsumerInfo> {
        self.broker.consumer_info(&self.stream, &self.name).await
    }

    /// Request a leader election
    pub async fn request_leader_step_down(&self) -> ConsumerResult<()> {
        self.broker.leader_step_down(&self.stream, &self.name).await
    }

    /// Delete the consumer
    pub async fn delete(&self) -> ConsumerResult<()> {
        self.broker.delete_consumer(&self.stream, &self.name).await
    }
}
