//! The context every command runs in

use crate::broker::{Broker, ConsumerHandle, StreamInfo};
use crate::consumer::builder::Prompter;
use crate::consumer::config::ConsumerConfig;
use crate::consumer::validate::ConfigValidator;
use crate::error::{ConsumerError, ConsumerResult, ErrorContext};
use crate::settings::Settings;
use std::sync::Arc;
use tracing::{debug, info};

/// A broker connection together with the settings it was opened with
#[derive(Clone)]
pub struct Session {
    broker: Arc<dyn Broker>,
    settings: Settings,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("settings", &self.settings).finish()
    }
}

impl Session {
    /// Create a session over an existing broker
    pub fn new(broker: Arc<dyn Broker>, settings: Settings) -> Self {
        Self { broker, settings }
    }

    /// Connect to the server named in the settings
    #[cfg(feature = "nats")]
    pub async fn connect(settings: Settings) -> ConsumerResult<Self> {
        let broker =
            crate::broker::NatsBroker::connect(&settings.server, settings.timeout, settings.trace).await?;
        Ok(Self::new(Arc::new(broker), settings))
    }

    /// Settings in effect
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The broker
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Validator honouring the bypass setting
    pub fn validator(&self) -> ConfigValidator {
        ConfigValidator::default().bypass(self.settings.no_validate)
    }

    /// Look up a stream
    pub async fn load_stream(&self, stream: &str) -> ConsumerResult<StreamInfo> {
        self.broker
            .stream_info(stream)
            .await
            .with_context(|| format!("could not load stream {}", stream))
    }

    /// Look up a consumer
    pub async fn load_consumer(&self, stream: &str, consumer: &str) -> ConsumerResult<ConsumerHandle> {
        let info = self
            .broker
            .consumer_info(stream, consumer)
            .await
            .with_context(|| format!("could not load consumer {} > {}", stream, consumer))?;
        debug!(stream, consumer, "loaded consumer");
        Ok(ConsumerHandle::new(self.broker.clone(), &info))
    }

    /// Names of every stream
    pub async fn stream_names(&self) -> ConsumerResult<Vec<String>> {
        self.broker.stream_names().await.context("could not load Streams")
    }

    /// Use `given` or have the operator pick a stream
    pub async fn select_stream(&self, given: Option<String>, prompter: &mut dyn Prompter) -> ConsumerResult<String> {
        if let Some(stream) = given.filter(|s| !s.is_empty()) {
            return Ok(stream);
        }
        let names = self.stream_names().await?;
        if names.is_empty() {
            return Err(ConsumerError::NotFound("no Streams defined".to_string()));
        }
        prompter.choose("Stream", &names)
    }

    /// Use `given` or have the operator pick a consumer of `stream`
    pub async fn select_consumer(
        &self,
        stream: &str,
        given: Option<String>,
        prompter: &mut dyn Prompter,
    ) -> ConsumerResult<String> {
        if let Some(consumer) = given.filter(|c| !c.is_empty()) {
            return Ok(consumer);
        }
        let names = self
            .consumer_names(stream)
            .await
            .with_context(|| format!("could not load Consumers of {}", stream))?;
        if names.is_empty() {
            return Err(ConsumerError::NotFound(format!("no Consumers defined on {}", stream)));
        }
        prompter.choose("Consumer", &names)
    }

    /// Names of the consumers on a stream
    pub async fn consumer_names(&self, stream: &str) -> ConsumerResult<Vec<String>> {
        self.broker.consumer_names(stream).await
    }

    /// Submit a configuration
    pub async fn create_consumer(&self, stream: &str, config: &ConsumerConfig) -> ConsumerResult<ConsumerHandle> {
        let info = self
            .broker
            .create_consumer(stream, config)
            .await
            .context("consumer creation failed")?;
        info!(stream, consumer = %info.name, "created consumer");
        Ok(ConsumerHandle::new(self.broker.clone(), &info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::consumer::builder::{MockPrompter, NonInteractive};

    #[tokio::test]
    async fn test_create_and_load() {
        let broker = Arc::new(MemoryBroker::new());
        broker.add_stream("ORDERS", &["orders.>"]);
        let session = Session::new(broker, Settings::default());

        let config = ConsumerConfig {
            durable_name: Some("NEW".into()),
            ..Default::default()
        };
        let created = session.create_consumer("ORDERS", &config).await.unwrap();
        assert_eq!(created.name(), "NEW");

        let loaded = session.load_consumer("ORDERS", "NEW").await.unwrap();
        assert!(loaded.is_pull_mode());
        assert_eq!(loaded.configuration(), &config);
    }

    #[tokio::test]
    async fn test_missing_consumer_keeps_kind() {
        let broker = Arc::new(MemoryBroker::new());
        broker.add_stream("ORDERS", &["orders.>"]);
        let session = Session::new(broker, Settings::default());

        let err = session.load_consumer("ORDERS", "GONE").await.unwrap_err();
        assert!(matches!(err, ConsumerError::NotFound(_)));
        assert!(err.to_string().contains("could not load consumer ORDERS > GONE"));
    }

    #[tokio::test]
    async fn test_missing_names_are_picked_from_the_broker() {
        let broker = Arc::new(MemoryBroker::new());
        broker.add_stream("ORDERS", &["orders.>"]);
        broker.add_stream("AUDIT", &["audit.>"]);
        let session = Session::new(broker, Settings::default());

        let mut prompter = MockPrompter::new();
        prompter
            .expect_choose()
            .times(1)
            .returning(|what, options| {
                assert_eq!(what, "Stream");
                assert_eq!(options, ["AUDIT".to_string(), "ORDERS".to_string()]);
                Ok(options[1].clone())
            });
        let stream = session.select_stream(None, &mut prompter).await.unwrap();
        assert_eq!(stream, "ORDERS");

        let given = session
            .select_stream(Some("AUDIT".into()), &mut NonInteractive)
            .await
            .unwrap();
        assert_eq!(given, "AUDIT");
    }

    #[tokio::test]
    async fn test_consumer_selection_without_candidates() {
        let broker = Arc::new(MemoryBroker::new());
        broker.add_stream("ORDERS", &["orders.>"]);
        let session = Session::new(broker, Settings::default());

        let err = session
            .select_consumer("ORDERS", None, &mut MockPrompter::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::NotFound(_)));

        session
            .create_consumer(
                "ORDERS",
                &ConsumerConfig {
                    durable_name: Some("NEW".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let err = session
            .select_consumer("ORDERS", Some(String::new()), &mut NonInteractive)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Consumer name is required");
    }

    #[test]
    fn test_validator_follows_settings() {
        let broker = Arc::new(MemoryBroker::new());
        let session = Session::new(
            broker,
            Settings {
                no_validate: true,
                ..Default::default()
            },
        );
        let report = session.validator().validate(&ConsumerConfig::default()).unwrap();
        assert!(report.valid);
    }
}
