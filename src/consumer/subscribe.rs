//! Push mode subscription

use crate::broker::ConsumerHandle;
use crate::consumer::config::AckPolicy;
use crate::consumer::render::{self, humanize_duration, Delivery};
use crate::error::{ConsumerError, ConsumerResult};
use futures::StreamExt;
use std::future::Future;
use std::io::Write;
use tracing::{debug, info, warn};

/// Options for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Acknowledge every message
    pub ack: bool,
    /// Print bodies only
    pub raw: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { ack: true, raw: false }
    }
}

/// Counters for a finished subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionSummary {
    /// Messages received
    pub received: u64,
    /// Successful acknowledgements
    pub acknowledged: u64,
    /// Failed acknowledgements
    pub ack_failures: u64,
}

/// Receives messages pushed to a consumer's delivery subject
#[derive(Debug)]
pub struct MessageSubscriber<'a> {
    consumer: &'a ConsumerHandle,
    options: SubscribeOptions,
}

impl<'a> MessageSubscriber<'a> {
    /// Subscriber for a push consumer
    ///
    /// Acknowledgement is switched off for consumers that do not acknowledge.
    pub fn new(consumer: &'a ConsumerHandle, mut options: SubscribeOptions) -> Self {
        if consumer.ack_policy() == AckPolicy::None {
            options.ack = false;
        }
        Self { consumer, options }
    }

    /// Effective options
    pub fn options(&self) -> SubscribeOptions {
        self.options
    }

    /// Receive until the subscription ends
    pub async fn run(&self, out: &mut dyn Write) -> ConsumerResult<SubscriptionSummary> {
        self.run_until(out, std::future::pending::<()>()).await
    }

    /// Receive until the subscription ends or `shutdown` completes
    pub async fn run_until<F>(&self, out: &mut dyn Write, shutdown: F) -> ConsumerResult<SubscriptionSummary>
    where
        F: Future<Output = ()>,
    {
        let subject = self.consumer.delivery_subject().ok_or_else(|| {
            ConsumerError::input(format!(
                "consumer {} > {} is not a push consumer",
                self.consumer.stream_name(),
                self.consumer.name()
            ))
        })?;

        if !self.options.raw {
            writeln!(
                out,
                "Subscribing to topic {} auto acknowledgement: {}\n",
                subject, self.options.ack
            )?;
            writeln!(out, "Consumer Info:")?;
            writeln!(out, "  Ack Policy: {}", self.consumer.ack_policy())?;
            if self.consumer.ack_policy() != AckPolicy::None {
                writeln!(out, "    Ack Wait: {}", humanize_duration(self.consumer.ack_wait()))?;
            }
            writeln!(out)?;
        }

        let broker = self.consumer.broker();
        let mut messages = broker.subscribe(subject).await?;
        info!(subject, ack = self.options.ack, "subscribed");

        let mut summary = SubscriptionSummary::default();
        tokio::pin!(shutdown);

        loop {
            let message = tokio::select! {
                _ = &mut shutdown => {
                    debug!("subscription interrupted");
                    break;
                }
                next = messages.next() => match next {
                    Some(message) => message,
                    None => break,
                },
            };
            summary.received += 1;

            render::message(out, &message, Delivery::Pushed, self.options.raw)?;

            if !self.options.ack {
                continue;
            }

            match broker.respond_empty(&message).await {
                Ok(()) => summary.acknowledged += 1,
                Err(e) => {
                    summary.ack_failures += 1;
                    let reply = message.reply.as_deref().unwrap_or("");
                    warn!(reply, error = %e, "acknowledgement failed");
                    writeln!(out, "Acknowledging message via subject {} failed: {}", reply, e)?;
                }
            }
        }

        info!(
            received = summary.received,
            acknowledged = summary.acknowledged,
            failures = summary.ack_failures,
            "subscription ended"
        );
        Ok(summary)
    }
}
