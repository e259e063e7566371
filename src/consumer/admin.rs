//! Consumer administration commands
//!
//! Each operation runs against a [`Session`] and writes its report to the
//! supplied output.

use crate::broker::ConsumerHandle;
use crate::consumer::builder::{ConfigBuilder, ConsumerFlags, NonInteractive};
use crate::consumer::config::ConsumerConfig;
use crate::consumer::fetch::{FetchOptions, MessageFetcher};
use crate::consumer::render;
use crate::consumer::stepdown::{LeaderStepDown, StepDownReport};
use crate::consumer::subscribe::{MessageSubscriber, SubscribeOptions, SubscriptionSummary};
use crate::consumer::validate::ValidationReport;
use crate::error::{ConsumerError, ConsumerResult, ErrorContext};
use crate::session::Session;
use rand::Rng;
use std::future::Future;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

/// Result of `sub`, which depends on the consumer's mode
#[derive(Debug, Clone, PartialEq)]
pub enum SubOutcome {
    /// A pull consumer served one message
    Fetched,
    /// A push consumer subscription ended
    Subscribed(SubscriptionSummary),
}

/// Administration operations over a session
#[derive(Debug, Clone, Copy)]
pub struct ConsumerAdmin<'a> {
    session: &'a Session,
}

fn fail_invalid(report: ValidationReport) -> ConsumerResult<ValidationReport> {
    if report.valid {
        Ok(report)
    } else {
        Err(ConsumerError::Validation {
            errors: report.errors,
        })
    }
}

impl<'a> ConsumerAdmin<'a> {
    /// Operations on `session`
    pub fn new(session: &'a Session) -> Self {
        Self { session }
    }

    /// Print the canonical form and check it without creating anything
    pub fn validate_only(&self, config: &ConsumerConfig, out: &mut dyn Write) -> ConsumerResult<()> {
        let report = self.session.validator().validate(config)?;
        writeln!(out, "{}", report.canonical)?;
        writeln!(out)?;
        fail_invalid(report)?;
        writeln!(out, "Configuration is a valid Consumer")?;
        Ok(())
    }

    /// Write a valid configuration to `path` for later `--config` use
    pub fn save(&self, config: &ConsumerConfig, path: &Path) -> ConsumerResult<()> {
        fail_invalid(self.session.validator().validate(config)?)?;
        config
            .write_file(path)
            .with_context(|| format!("could not write {}", path.display()))?;
        info!(path = %path.display(), "saved consumer configuration");
        Ok(())
    }

    /// Create a consumer and show it
    pub async fn create(
        &self,
        stream: &str,
        config: &ConsumerConfig,
        out: &mut dyn Write,
    ) -> ConsumerResult<ConsumerHandle> {
        let created = self.session.create_consumer(stream, config).await?;
        self.show(&created, out).await?;
        Ok(created)
    }

    /// Copy `source` to `destination`, changing only the supplied flags
    pub async fn copy(
        &self,
        stream: &str,
        source: &str,
        destination: &str,
        flags: ConsumerFlags,
        out: &mut dyn Write,
    ) -> ConsumerResult<ConsumerHandle> {
        let original = self.session.load_consumer(stream, source).await?;

        let mut prompter = NonInteractive;
        let config = ConfigBuilder::new(flags, &mut prompter).copy_from(original.configuration(), destination)?;

        let created = self
            .session
            .create_consumer(stream, &config)
            .await
            .context("consumer copy failed")?;
        info!(stream, source, consumer = created.name(), "copied consumer");

        if config.durable_name.is_some() {
            self.show(&created, out).await?;
        }
        Ok(created)
    }

    /// Show a consumer, as JSON when `json` is set
    pub async fn info(&self, stream: &str, consumer: &str, json: bool, out: &mut dyn Write) -> ConsumerResult<()> {
        let handle = self.session.load_consumer(stream, consumer).await?;
        if json {
            let state = handle.state().await?;
            writeln!(out, "{}", serde_json::to_string_pretty(&state)?)?;
            return Ok(());
        }
        self.show(&handle, out).await
    }

    async fn show(&self, handle: &ConsumerHandle, out: &mut dyn Write) -> ConsumerResult<()> {
        let state = handle
            .state()
            .await
            .with_context(|| format!("could not load Consumer {} > {}", handle.stream_name(), handle.name()))?;
        render::consumer_info(out, &state)
    }

    /// List consumer names of a stream
    pub async fn list(&self, stream: &str, json: bool, out: &mut dyn Write) -> ConsumerResult<Vec<String>> {
        self.session.load_stream(stream).await?;
        let names = self
            .session
            .consumer_names(stream)
            .await
            .context("could not load Consumers")?;

        if json {
            writeln!(out, "{}", serde_json::to_string_pretty(&names)?)?;
        } else {
            render::consumer_list(out, stream, &names)?;
        }
        Ok(names)
    }

    /// Delete a consumer
    ///
    /// Interactive confirmation is up to the caller.
    pub async fn remove(&self, stream: &str, consumer: &str) -> ConsumerResult<()> {
        let handle = self.session.load_consumer(stream, consumer).await?;
        handle.delete().await?;
        info!(stream, consumer, "deleted consumer");
        Ok(())
    }

    /// Tabulate every consumer of a stream
    ///
    /// Consumers whose state cannot be read are logged and left out.
    pub async fn report(&self, stream: &str, raw: bool, out: &mut dyn Write) -> ConsumerResult<usize> {
        let info = self.session.load_stream(stream).await?;
        writeln!(
            out,
            "Consumer report for {} with {} consumers\n",
            stream, info.state.consumer_count
        )?;

        let mut rows = Vec::new();
        for name in self.session.consumer_names(stream).await? {
            match self.session.broker().consumer_info(stream, &name).await {
                Ok(state) => rows.push(state),
                Err(e) => warn!(consumer = %name, error = %e, "Could not obtain consumer state"),
            }
        }

        writeln!(out, "{}", render::report_table(info.state.messages, &rows, raw))?;
        Ok(rows.len())
    }

    /// Force a leader election and show the consumer afterwards
    pub async fn step_down(
        &self,
        stream: &str,
        consumer: &str,
        json: bool,
        out: &mut dyn Write,
    ) -> ConsumerResult<StepDownReport> {
        let handle = self.session.load_consumer(stream, consumer).await?;
        let report = LeaderStepDown::new(&handle).run().await?;

        if json {
            writeln!(out, "{}", serde_json::to_string_pretty(&report.state)?)?;
        } else {
            writeln!(out, "{}", report.outcome)?;
            writeln!(out)?;
            render::consumer_info(out, &report.state)?;
        }
        Ok(report)
    }

    /// Retrieve the next message of a pull consumer
    pub async fn next<R: Rng>(
        &self,
        fetcher: &mut MessageFetcher<R>,
        stream: &str,
        consumer: &str,
        options: FetchOptions,
        out: &mut dyn Write,
    ) -> ConsumerResult<()> {
        let handle = self.session.load_consumer(stream, consumer).await?;
        if !handle.is_pull_mode() {
            return Err(ConsumerError::input(format!(
                "consumer {} > {} is not a pull consumer",
                stream, consumer
            )));
        }
        fetcher.fetch(&handle, options, out).await?;
        Ok(())
    }

    /// Pull one message or subscribe, depending on the consumer's mode
    pub async fn sub<R, F>(
        &self,
        fetcher: &mut MessageFetcher<R>,
        stream: &str,
        consumer: &str,
        options: SubscribeOptions,
        out: &mut dyn Write,
        shutdown: F,
    ) -> ConsumerResult<SubOutcome>
    where
        R: Rng,
        F: Future<Output = ()>,
    {
        let handle = self.session.load_consumer(stream, consumer).await?;

        if handle.is_pull_mode() {
            let fetch = FetchOptions {
                ack: options.ack,
                raw: options.raw,
                ack_wait: std::time::Duration::ZERO,
                expiry: self.session.settings().timeout,
            };
            fetcher.fetch(&handle, fetch, out).await?;
            return Ok(SubOutcome::Fetched);
        }

        let summary = MessageSubscriber::new(&handle, options)
            .run_until(out, shutdown)
            .await?;
        Ok(SubOutcome::Subscribed(summary))
    }
}
