//! JetStream backend over a NATS connection
//!
//! Speaks the JetStream JSON API directly on `$JS.API.*` subjects through
//! the core client, so every request and response can be traced verbatim.

use crate::broker::types::{ConsumerInfo, Message, StreamInfo};
use crate::broker::{reply_subject, Broker, MessageStream};
use crate::consumer::config::ConsumerConfig;
use crate::error::{ConsumerError, ConsumerResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

const API_PREFIX: &str = "$JS.API";

/// Extra time allowed for the server to answer after a pull expires
const EXPIRY_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct ApiError {
    code: u16,
    #[serde(default)]
    description: String,
}

/// Decode an API response, surfacing server errors before the body is parsed
fn decode<T: DeserializeOwned>(subject: &str, payload: &[u8]) -> ConsumerResult<T> {
    let mut document: serde_json::Value = serde_json::from_slice(payload)?;

    if let Some(error) = document.get_mut("error").map(serde_json::Value::take) {
        if !error.is_null() {
            let error: ApiError = serde_json::from_value(error)?;
            return Err(match error.code {
                404 => ConsumerError::NotFound(error.description),
                _ => ConsumerError::broker(format!("{} (code {})", error.description, error.code)),
            });
        }
    }

    serde_json::from_value(document)
        .map_err(|e| ConsumerError::broker(format!("unexpected response to {}: {}", subject, e)))
}

#[derive(Debug, Deserialize)]
struct StreamNamesResponse {
    #[serde(default)]
    streams: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct NamesResponse {
    #[serde(default)]
    consumers: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct SuccessResponse {
    #[serde(default)]
    success: bool,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    stream_name: &'a str,
    config: &'a ConsumerConfig,
}

#[derive(Serialize)]
struct NextRequest {
    batch: usize,
    expires: u64,
}

/// Broker reached through a NATS server with JetStream enabled
#[derive(Debug, Clone)]
pub struct NatsBroker {
    client: async_nats::Client,
    timeout: Duration,
    trace: bool,
}

impl NatsBroker {
    /// Connect to `server`
    pub async fn connect(server: &str, timeout: Duration, trace: bool) -> ConsumerResult<Self> {
        let client = async_nats::ConnectOptions::new()
            .name("jetctl")
            .request_timeout(Some(timeout))
            .connect(server)
            .await
            .map_err(|e| ConsumerError::broker(format!("could not connect to {}: {}", server, e)))?;
        info!(server, "connected");

        Ok(Self { client, timeout, trace })
    }

    async fn request<T: DeserializeOwned>(&self, subject: String, body: Bytes) -> ConsumerResult<T> {
        if self.trace {
            debug!(">>> {}: {}", subject, String::from_utf8_lossy(&body));
        }

        let response = tokio::time::timeout(self.timeout, self.client.request(subject.clone(), body))
            .await
            .map_err(|_| ConsumerError::Timeout(format!("no response to {}", subject)))?
            .map_err(|e| ConsumerError::broker(format!("{}: {}", subject, e)))?;

        if self.trace {
            debug!("<<< {}: {}", subject, String::from_utf8_lossy(&response.payload));
        }

        decode(&subject, &response.payload)
    }
}

fn convert(message: async_nats::Message) -> Message {
    let headers = message
        .headers
        .as_ref()
        .map(|h| {
            h.iter()
                .flat_map(|(name, values)| {
                    values
                        .iter()
                        .map(move |v| (name.to_string(), v.as_str().to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    Message {
        subject: message.subject.to_string(),
        reply: message.reply.map(|r| r.to_string()),
        headers,
        payload: message.payload,
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn stream_info(&self, stream: &str) -> ConsumerResult<StreamInfo> {
        self.request(format!("{}.STREAM.INFO.{}", API_PREFIX, stream), Bytes::new())
            .await
    }

    async fn stream_names(&self) -> ConsumerResult<Vec<String>> {
        let names: StreamNamesResponse = self
            .request(format!("{}.STREAM.NAMES", API_PREFIX), Bytes::from_static(b"{}"))
            .await?;
        let mut names = names.streams.unwrap_or_default();
        names.sort();
        Ok(names)
    }

    async fn consumer_names(&self, stream: &str) -> ConsumerResult<Vec<String>> {
        let names: NamesResponse = self
            .request(
                format!("{}.CONSUMER.NAMES.{}", API_PREFIX, stream),
                Bytes::from_static(b"{}"),
            )
            .await?;
        let mut names = names.consumers.unwrap_or_default();
        names.sort();
        Ok(names)
    }

    async fn consumer_info(&self, stream: &str, consumer: &str) -> ConsumerResult<ConsumerInfo> {
        self.request(
            format!("{}.CONSUMER.INFO.{}.{}", API_PREFIX, stream, consumer),
            Bytes::new(),
        )
        .await
    }

    async fn create_consumer(&self, stream: &str, config: &ConsumerConfig) -> ConsumerResult<ConsumerInfo> {
        let subject = match &config.durable_name {
            Some(durable) => format!("{}.CONSUMER.DURABLE.CREATE.{}.{}", API_PREFIX, stream, durable),
            None => format!("{}.CONSUMER.CREATE.{}", API_PREFIX, stream),
        };
        let body = serde_json::to_vec(&CreateRequest {
            stream_name: stream,
            config,
        })?;
        self.request(subject, body.into()).await
    }

    async fn delete_consumer(&self, stream: &str, consumer: &str) -> ConsumerResult<()> {
        let res: SuccessResponse = self
            .request(
                format!("{}.CONSUMER.DELETE.{}.{}", API_PREFIX, stream, consumer),
                Bytes::new(),
            )
            .await?;
        if !res.success {
            return Err(ConsumerError::broker(format!("could not delete {} > {}", stream, consumer)));
        }
        Ok(())
    }

    async fn leader_step_down(&self, stream: &str, consumer: &str) -> ConsumerResult<()> {
        let res: SuccessResponse = self
            .request(
                format!("{}.CONSUMER.LEADER.STEPDOWN.{}.{}", API_PREFIX, stream, consumer),
                Bytes::new(),
            )
            .await?;
        if !res.success {
            return Err(ConsumerError::broker("leader step down was not accepted"));
        }
        Ok(())
    }

    async fn fetch_next(&self, stream: &str, consumer: &str, expiry: Duration) -> ConsumerResult<Message> {
        let inbox = self.client.new_inbox();
        let mut sub = self
            .client
            .subscribe(inbox.clone())
            .await
            .map_err(|e| ConsumerError::broker(e.to_string()))?;
        sub.unsubscribe_after(1)
            .await
            .map_err(|e| ConsumerError::broker(e.to_string()))?;

        let subject = format!("{}.CONSUMER.MSG.NEXT.{}.{}", API_PREFIX, stream, consumer);
        let body = serde_json::to_vec(&NextRequest {
            batch: 1,
            expires: u64::try_from(expiry.as_nanos()).unwrap_or(u64::MAX),
        })?;
        if self.trace {
            debug!(">>> {}: {}", subject, String::from_utf8_lossy(&body));
        }
        self.client
            .publish_with_reply(subject, inbox, body.into())
            .await
            .map_err(|e| ConsumerError::broker(e.to_string()))?;

        let timed_out = || {
            ConsumerError::Timeout(format!(
                "no message received from {} > {} within {:?}",
                stream, consumer, expiry
            ))
        };

        let message = tokio::time::timeout(expiry + EXPIRY_GRACE, sub.next())
            .await
            .map_err(|_| timed_out())?
            .ok_or_else(timed_out)?;

        // status replies (408 request expired, 404 no messages) carry no payload
        if let Some(status) = message.status {
            debug!(status = %status, "pull request ended without a message");
            return Err(timed_out());
        }

        Ok(convert(message))
    }

    async fn subscribe(&self, subject: &str) -> ConsumerResult<MessageStream> {
        let sub = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| ConsumerError::broker(e.to_string()))?;
        Ok(sub.map(convert).boxed())
    }

    async fn respond_empty(&self, message: &Message) -> ConsumerResult<()> {
        let reply = reply_subject(message)?.to_string();
        if self.trace {
            debug!(">>> {}: (empty)", reply);
        }
        self.client
            .publish(reply.clone(), Bytes::new())
            .await
            .map_err(|e| ConsumerError::Ack {
                subject: reply,
                reason: e.to_string(),
            })
    }

    async fn flush(&self) -> ConsumerResult<()> {
        self.client
            .flush()
            .await
            .map_err(|e| ConsumerError::broker(e.to_string()))
    }
}
