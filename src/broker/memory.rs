//! In-process broker
//!
//! Holds streams, consumers and messages in memory and follows the same
//! delivery and acknowledgement rules as a JetStream server closely enough
//! to exercise the tool without one. Failure injection and election timing
//! can be scripted per consumer.

use crate::broker::types::{
    ClusterInfo, ConsumerInfo, Message, MessageMetadata, PeerInfo, SequenceInfo, StreamInfo,
    StreamState, StreamSummary,
};
use crate::broker::{reply_subject, Broker, MessageStream};
use crate::consumer::config::{AckPolicy, ConsumerConfig, DeliverPolicy};
use crate::error::{ConsumerError, ConsumerResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    subject: String,
    headers: Vec<(String, String)>,
    payload: Bytes,
    time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Election {
    Idle,
    Pending { polls_left: usize },
}

#[derive(Debug)]
struct MemoryConsumer {
    info: ConsumerInfo,
    pending: VecDeque<u64>,
    unacked: BTreeMap<u64, u64>,
    /// Polls after a step-down before the new leader is visible, `None` to never elect
    elect_after: Option<usize>,
    election: Election,
}

#[derive(Debug)]
struct MemoryStream {
    subjects: Vec<String>,
    messages: Vec<StoredMessage>,
    consumers: BTreeMap<String, MemoryConsumer>,
}

#[derive(Debug, Default)]
struct State {
    streams: BTreeMap<String, MemoryStream>,
    raw: HashMap<String, Vec<Message>>,
    acknowledged: Vec<String>,
    fail_acks: bool,
    fail_info: usize,
    step_downs: usize,
    info_requests: usize,
    flushes: usize,
}

/// Broker that lives entirely in memory
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
}

/// Simple subject matching with `*` and `>` wildcards
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut f = filter.split('.');
    let mut s = subject.split('.');
    loop {
        match (f.next(), s.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn not_found(stream: &str, consumer: Option<&str>) -> ConsumerError {
    match consumer {
        Some(c) => ConsumerError::NotFound(format!("consumer {} > {}", stream, c)),
        None => ConsumerError::NotFound(format!("stream {}", stream)),
    }
}

impl MemoryStream {
    fn initial_sequences(&self, config: &ConsumerConfig) -> VecDeque<u64> {
        let matching: Vec<&StoredMessage> = self
            .messages
            .iter()
            .filter(|m| {
                config
                    .filter_subject
                    .as_deref()
                    .map_or(true, |f| subject_matches(f, &m.subject))
            })
            .collect();

        match config.deliver_policy {
            DeliverPolicy::All => matching.iter().map(|m| m.seq).collect(),
            DeliverPolicy::New => VecDeque::new(),
            DeliverPolicy::Last => matching.last().map(|m| m.seq).into_iter().collect(),
            DeliverPolicy::ByStartSequence(start) => {
                matching.iter().filter(|m| m.seq >= start).map(|m| m.seq).collect()
            }
            DeliverPolicy::ByStartTime(start) => {
                matching.iter().filter(|m| m.time >= start).map(|m| m.seq).collect()
            }
            DeliverPolicy::LastPerSubject => {
                let mut last: BTreeMap<&str, u64> = BTreeMap::new();
                for m in &matching {
                    last.insert(&m.subject, m.seq);
                }
                let mut seqs: Vec<u64> = last.into_values().collect();
                seqs.sort_unstable();
                seqs.into_iter().collect()
            }
        }
    }

    fn stored(&self, seq: u64) -> Option<&StoredMessage> {
        self.messages.iter().find(|m| m.seq == seq)
    }
}

impl MemoryConsumer {
    /// Hand out the next pending message, recording it as delivered
    fn deliver(&mut self, stream: &MemoryStream) -> Option<Message> {
        let seq = self.pending.pop_front()?;
        let stored = stream.stored(seq)?;

        self.info.delivered = SequenceInfo {
            consumer_seq: self.info.delivered.consumer_seq + 1,
            stream_seq: seq,
        };
        self.info.num_pending = self.pending.len() as u64;
        if self.info.config.ack_policy != AckPolicy::None {
            self.unacked.insert(seq, self.info.delivered.consumer_seq);
            self.info.num_ack_pending = self.unacked.len() as u64;
        } else {
            self.info.ack_floor = self.info.delivered;
        }

        let metadata = MessageMetadata {
            domain: None,
            stream: self.info.stream_name.clone(),
            consumer: self.info.name.clone(),
            delivered: 1,
            stream_sequence: seq,
            consumer_sequence: self.info.delivered.consumer_seq,
            timestamp: stored.time,
            pending: self.info.num_pending,
        };

        Some(Message {
            subject: stored.subject.clone(),
            reply: Some(metadata.to_reply()),
            headers: stored.headers.clone(),
            payload: stored.payload.clone(),
        })
    }

    fn acknowledge(&mut self, metadata: &MessageMetadata) {
        let acked: Vec<u64> = match self.info.config.ack_policy {
            AckPolicy::All => self
                .unacked
                .range(..=metadata.stream_sequence)
                .map(|(seq, _)| *seq)
                .collect(),
            _ => vec![metadata.stream_sequence],
        };
        for seq in acked {
            self.unacked.remove(&seq);
        }
        self.info.num_ack_pending = self.unacked.len() as u64;

        // floor sits just below the oldest outstanding delivery
        self.info.ack_floor = match self.unacked.iter().next() {
            Some((sseq, cseq)) => SequenceInfo {
                consumer_seq: cseq.saturating_sub(1),
                stream_seq: sseq.saturating_sub(1),
            },
            None => self.info.delivered,
        };
    }

    fn poll_election(&mut self) {
        if let Election::Pending { polls_left } = self.election {
            if polls_left <= 1 {
                self.elect();
                self.election = Election::Idle;
            } else {
                self.election = Election::Pending { polls_left: polls_left - 1 };
            }
        }
    }

    fn elect(&mut self) {
        let Some(cluster) = self.info.cluster.as_mut() else {
            return;
        };
        if cluster.replicas.is_empty() {
            return;
        }
        let next = cluster.replicas.remove(0);
        let previous = std::mem::replace(&mut cluster.leader, next.name);
        cluster.replicas.push(PeerInfo {
            name: previous,
            current: true,
            active: Duration::ZERO,
        });
        debug!(leader = %cluster.leader, "memory broker elected new leader");
    }
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a stream capturing the given subjects
    pub fn add_stream(&self, name: &str, subjects: &[&str]) {
        self.state.lock().streams.insert(
            name.to_string(),
            MemoryStream {
                subjects: subjects.iter().map(|s| s.to_string()).collect(),
                messages: Vec::new(),
                consumers: BTreeMap::new(),
            },
        );
    }

    /// Store a message in the stream capturing `subject`, returning its sequence
    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> ConsumerResult<u64> {
        self.publish_with_headers(subject, Vec::new(), payload)
    }

    /// Store a message with headers
    pub fn publish_with_headers(
        &self,
        subject: &str,
        headers: Vec<(String, String)>,
        payload: impl Into<Bytes>,
    ) -> ConsumerResult<u64> {
        let mut state = self.state.lock();
        let stream = state
            .streams
            .values_mut()
            .find(|s| s.subjects.iter().any(|f| subject_matches(f, subject)))
            .ok_or_else(|| ConsumerError::NotFound(format!("no stream captures {}", subject)))?;

        let seq = stream.messages.last().map_or(1, |m| m.seq + 1);
        stream.messages.push(StoredMessage {
            seq,
            subject: subject.to_string(),
            headers,
            payload: payload.into(),
            time: Utc::now(),
        });

        for consumer in stream.consumers.values_mut() {
            let wanted = consumer
                .info
                .config
                .filter_subject
                .as_deref()
                .map_or(true, |f| subject_matches(f, subject));
            if wanted {
                consumer.pending.push_back(seq);
                consumer.info.num_pending = consumer.pending.len() as u64;
            }
        }

        Ok(seq)
    }

    /// Queue a message for subscribers of `subject` outside of any stream
    pub fn push_raw(&self, subject: &str, message: Message) {
        self.state
            .lock()
            .raw
            .entry(subject.to_string())
            .or_default()
            .push(message);
    }

    /// Attach cluster membership to a consumer
    pub fn set_cluster(&self, stream: &str, consumer: &str, cluster: ClusterInfo) -> ConsumerResult<()> {
        self.with_consumer(stream, consumer, |c| c.info.cluster = Some(cluster))
    }

    /// Make a step-down visible after `polls` state requests, or never with `None`
    pub fn elect_after(&self, stream: &str, consumer: &str, polls: Option<usize>) -> ConsumerResult<()> {
        self.with_consumer(stream, consumer, |c| c.elect_after = polls)
    }

    /// Fail the next `count` consumer state requests
    pub fn fail_next_info(&self, count: usize) {
        self.state.lock().fail_info = count;
    }

    /// Fail every acknowledgement
    pub fn fail_acks(&self, fail: bool) {
        self.state.lock().fail_acks = fail;
    }

    /// Number of step-down requests received
    pub fn step_down_requests(&self) -> usize {
        self.state.lock().step_downs
    }

    /// Number of consumer state requests received
    pub fn info_requests(&self) -> usize {
        self.state.lock().info_requests
    }

    /// Reply subjects that were acknowledged, in order
    pub fn acknowledged(&self) -> Vec<String> {
        self.state.lock().acknowledged.clone()
    }

    /// Number of flushes
    pub fn flushes(&self) -> usize {
        self.state.lock().flushes
    }

    fn with_consumer<T>(
        &self,
        stream: &str,
        consumer: &str,
        f: impl FnOnce(&mut MemoryConsumer) -> T,
    ) -> ConsumerResult<T> {
        let mut state = self.state.lock();
        let s = state.streams.get_mut(stream).ok_or_else(|| not_found(stream, None))?;
        let c = s
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| not_found(stream, Some(consumer)))?;
        Ok(f(c))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn stream_info(&self, stream: &str) -> ConsumerResult<StreamInfo> {
        let state = self.state.lock();
        let s = state.streams.get(stream).ok_or_else(|| not_found(stream, None))?;
        Ok(StreamInfo {
            config: StreamSummary {
                name: stream.to_string(),
                subjects: s.subjects.clone(),
            },
            state: StreamState {
                messages: s.messages.len() as u64,
                bytes: s.messages.iter().map(|m| m.payload.len() as u64).sum(),
                first_seq: s.messages.first().map_or(0, |m| m.seq),
                last_seq: s.messages.last().map_or(0, |m| m.seq),
                consumer_count: s.consumers.len() as u64,
            },
        })
    }

    async fn stream_names(&self) -> ConsumerResult<Vec<String>> {
        Ok(self.state.lock().streams.keys().cloned().collect())
    }

    async fn consumer_names(&self, stream: &str) -> ConsumerResult<Vec<String>> {
        let state = self.state.lock();
        let s = state.streams.get(stream).ok_or_else(|| not_found(stream, None))?;
        Ok(s.consumers.keys().cloned().collect())
    }

    async fn consumer_info(&self, stream: &str, consumer: &str) -> ConsumerResult<ConsumerInfo> {
        let mut state = self.state.lock();
        state.info_requests += 1;
        if state.fail_info > 0 {
            state.fail_info -= 1;
            return Err(ConsumerError::broker("consumer state temporarily unavailable"));
        }

        let s = state.streams.get_mut(stream).ok_or_else(|| not_found(stream, None))?;
        let c = s
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| not_found(stream, Some(consumer)))?;
        c.poll_election();
        Ok(c.info.clone())
    }

    async fn create_consumer(&self, stream: &str, config: &ConsumerConfig) -> ConsumerResult<ConsumerInfo> {
        let mut state = self.state.lock();
        let generated = format!("EPH{}", &Uuid::new_v4().simple().to_string()[..8]).to_uppercase();

        let s = state.streams.get_mut(stream).ok_or_else(|| not_found(stream, None))?;
        let name = config.durable_name.clone().unwrap_or(generated);

        if let Some(existing) = s.consumers.get(&name) {
            if existing.info.config == *config {
                return Ok(existing.info.clone());
            }
            return Err(ConsumerError::broker(format!("consumer name {} already in use", name)));
        }

        let pending = s.initial_sequences(config);
        let info = ConsumerInfo {
            stream_name: stream.to_string(),
            name: name.clone(),
            created: Utc::now(),
            config: config.clone(),
            delivered: SequenceInfo::default(),
            ack_floor: SequenceInfo::default(),
            num_ack_pending: 0,
            num_redelivered: 0,
            num_waiting: 0,
            num_pending: pending.len() as u64,
            cluster: None,
        };

        s.consumers.insert(
            name,
            MemoryConsumer {
                info: info.clone(),
                pending,
                unacked: BTreeMap::new(),
                elect_after: Some(1),
                election: Election::Idle,
            },
        );
        Ok(info)
    }

    async fn delete_consumer(&self, stream: &str, consumer: &str) -> ConsumerResult<()> {
        let mut state = self.state.lock();
        let s = state.streams.get_mut(stream).ok_or_else(|| not_found(stream, None))?;
        s.consumers
            .remove(consumer)
            .map(|_| ())
            .ok_or_else(|| not_found(stream, Some(consumer)))
    }

    async fn leader_step_down(&self, stream: &str, consumer: &str) -> ConsumerResult<()> {
        let mut state = self.state.lock();
        state.step_downs += 1;
        let s = state.streams.get_mut(stream).ok_or_else(|| not_found(stream, None))?;
        let c = s
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| not_found(stream, Some(consumer)))?;

        if c.info.cluster.is_none() {
            return Err(ConsumerError::broker("consumer is not clustered"));
        }
        if let Some(polls) = c.elect_after {
            c.election = Election::Pending { polls_left: polls };
        }
        Ok(())
    }

    async fn fetch_next(&self, stream: &str, consumer: &str, expiry: Duration) -> ConsumerResult<Message> {
        let delivered = {
            let mut state = self.state.lock();
            let s = state.streams.get_mut(stream).ok_or_else(|| not_found(stream, None))?;
            let mut c = s
                .consumers
                .remove(consumer)
                .ok_or_else(|| not_found(stream, Some(consumer)))?;
            if c.info.config.is_push_mode() {
                s.consumers.insert(consumer.to_string(), c);
                return Err(ConsumerError::broker(format!(
                    "consumer {} > {} is not a pull consumer",
                    stream, consumer
                )));
            }
            let message = c.deliver(s);
            s.consumers.insert(consumer.to_string(), c);
            message
        };

        match delivered {
            Some(message) => Ok(message),
            None => {
                tokio::time::sleep(expiry).await;
                Err(ConsumerError::Timeout(format!(
                    "no message received from {} > {} within {:?}",
                    stream, consumer, expiry
                )))
            }
        }
    }

    async fn subscribe(&self, subject: &str) -> ConsumerResult<MessageStream> {
        let mut state = self.state.lock();
        let mut messages = state.raw.remove(subject).unwrap_or_default();

        for s in state.streams.values_mut() {
            let names: Vec<String> = s
                .consumers
                .iter()
                .filter(|(_, c)| c.info.config.deliver_subject.as_deref() == Some(subject))
                .map(|(n, _)| n.clone())
                .collect();
            for name in names {
                if let Some(mut c) = s.consumers.remove(&name) {
                    while let Some(message) = c.deliver(s) {
                        messages.push(message);
                    }
                    s.consumers.insert(name, c);
                }
            }
        }

        // The subscription ends once everything queued so far is drained.
        Ok(futures::stream::iter(messages).boxed())
    }

    async fn respond_empty(&self, message: &Message) -> ConsumerResult<()> {
        let reply = reply_subject(message)?.to_string();
        let mut state = self.state.lock();
        if state.fail_acks {
            return Err(ConsumerError::Ack {
                subject: reply,
                reason: "connection closed".to_string(),
            });
        }

        if let Some(meta) = MessageMetadata::parse(&reply) {
            if let Some(c) = state
                .streams
                .get_mut(&meta.stream)
                .and_then(|s| s.consumers.get_mut(&meta.consumer))
            {
                c.acknowledge(&meta);
            }
        }
        state.acknowledged.push(reply);
        Ok(())
    }

    async fn flush(&self) -> ConsumerResult<()> {
        self.state.lock().flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pull_config(name: &str) -> ConsumerConfig {
        ConsumerConfig {
            durable_name: Some(name.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches("orders.*", "orders.new"));
        assert!(subject_matches("orders.>", "orders.new.eu"));
        assert!(subject_matches("orders.new", "orders.new"));
        assert!(!subject_matches("orders.*", "orders.new.eu"));
        assert!(!subject_matches("orders.>", "orders"));
        assert!(!subject_matches("orders.new", "orders.old"));
    }

    #[tokio::test]
    async fn test_pull_delivery_and_ack() {
        let broker = MemoryBroker::new();
        broker.add_stream("ORDERS", &["orders.>"]);
        broker.publish("orders.new", "one").unwrap();
        broker.create_consumer("ORDERS", &pull_config("PULL")).await.unwrap();
        broker.publish("orders.new", "two").unwrap();

        let first = broker
            .fetch_next("ORDERS", "PULL", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(first.payload, Bytes::from("one"));
        let meta = first.metadata().unwrap();
        assert_eq!(meta.stream_sequence, 1);
        assert_eq!(meta.pending, 1);

        broker.respond_empty(&first).await.unwrap();
        let info = broker.consumer_info("ORDERS", "PULL").await.unwrap();
        assert_eq!(info.num_ack_pending, 0);
        assert_eq!(info.ack_floor.stream_seq, 1);
        assert_eq!(info.num_pending, 1);
    }

    #[tokio::test]
    async fn test_deliver_new_skips_existing() {
        let broker = MemoryBroker::new();
        broker.add_stream("ORDERS", &["orders.>"]);
        broker.publish("orders.new", "old").unwrap();
        let config = ConsumerConfig {
            deliver_policy: DeliverPolicy::New,
            ..pull_config("NEW")
        };
        let info = broker.create_consumer("ORDERS", &config).await.unwrap();
        assert_eq!(info.num_pending, 0);
    }

    #[tokio::test]
    async fn test_ephemeral_names_are_generated() {
        let broker = MemoryBroker::new();
        broker.add_stream("ORDERS", &["orders.>"]);
        let config = ConsumerConfig {
            deliver_subject: Some("out".into()),
            ..Default::default()
        };
        let info = broker.create_consumer("ORDERS", &config).await.unwrap();
        assert!(info.name.starts_with("EPH"));
    }

    #[tokio::test]
    async fn test_missing_stream() {
        let broker = MemoryBroker::new();
        let err = broker.consumer_names("NOPE").await.unwrap_err();
        assert!(matches!(err, ConsumerError::NotFound(_)));
    }
}
