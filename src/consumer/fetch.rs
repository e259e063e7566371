//! Pull mode retrieval of single messages

use crate::broker::{ConsumerHandle, Message};
use crate::consumer::render::{self, humanize_duration, Delivery};
use crate::error::{ConsumerResult, ErrorContext};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use std::time::Duration;
use tracing::{debug, info};

/// Options for a single fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// Acknowledge the message after rendering it
    pub ack: bool,
    /// Print the body only
    pub raw: bool,
    /// Upper bound of the random delay before acknowledging, zero for none
    pub ack_wait: Duration,
    /// How long to wait for a message
    pub expiry: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            ack: true,
            raw: false,
            ack_wait: Duration::ZERO,
            expiry: Duration::from_secs(5),
        }
    }
}

/// What a fetch did
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    /// The message received
    pub message: Message,
    /// Delay observed before acknowledging, `None` when not acknowledged
    pub ack_delay: Option<Duration>,
}

/// Requests one message from a pull consumer and optionally acknowledges it
pub struct MessageFetcher<R = StdRng> {
    rng: R,
}

impl MessageFetcher<StdRng> {
    /// Fetcher with an entropy seeded random source
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }
}

impl Default for MessageFetcher<StdRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng> MessageFetcher<R> {
    /// Fetcher drawing acknowledgement delays from `rng`
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }

    /// Uniform delay in `[0, ack_wait)`
    pub fn ack_delay(&mut self, ack_wait: Duration) -> Duration {
        let nanos = u64::try_from(ack_wait.as_nanos()).unwrap_or(u64::MAX);
        if nanos == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.rng.gen_range(0..nanos))
    }

    /// Fetch, render and optionally acknowledge the next message
    ///
    /// A missing message is a timeout error and nothing is rendered.
    /// Acknowledgement failures are returned to the caller.
    pub async fn fetch(
        &mut self,
        consumer: &ConsumerHandle,
        options: FetchOptions,
        out: &mut dyn Write,
    ) -> ConsumerResult<Fetched> {
        let message = consumer
            .broker()
            .fetch_next(consumer.stream_name(), consumer.name(), options.expiry)
            .await
            .context("no message received")?;
        debug!(subject = %message.subject, "received message");

        render::message(out, &message, Delivery::Pulled, options.raw)?;

        if !options.ack {
            return Ok(Fetched {
                message,
                ack_delay: None,
            });
        }

        let delay = self.ack_delay(options.ack_wait);
        if !delay.is_zero() {
            debug!(delay = ?delay, "delaying acknowledgement");
            tokio::time::sleep(delay).await;
        }

        let broker = consumer.broker();
        broker
            .respond_empty(&message)
            .await
            .context("could not acknowledge message")?;
        broker.flush().await?;
        info!(subject = %message.subject, "acknowledged message");

        if !options.raw {
            if delay.is_zero() {
                writeln!(out, "\nAcknowledged message")?;
            } else {
                writeln!(out, "\nAcknowledged message after {} delay", humanize_duration(delay))?;
            }
            writeln!(out)?;
        }

        Ok(Fetched {
            message,
            ack_delay: Some(delay),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_delay_bounds() {
        let mut fetcher = MessageFetcher::with_rng(StdRng::seed_from_u64(7));
        assert_eq!(fetcher.ack_delay(Duration::ZERO), Duration::ZERO);
        for _ in 0..1000 {
            assert!(fetcher.ack_delay(Duration::from_millis(10)) < Duration::from_millis(10));
        }
    }

    #[test]
    fn test_seeded_delays_repeat() {
        let mut a = MessageFetcher::with_rng(StdRng::seed_from_u64(42));
        let mut b = MessageFetcher::with_rng(StdRng::seed_from_u64(42));
        let wait = Duration::from_secs(30);
        assert_eq!(a.ack_delay(wait), b.ack_delay(wait));
    }
}
