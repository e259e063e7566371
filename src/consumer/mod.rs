//! Consumer configuration, administration and message flow
//!
//! A configuration is resolved by [`ConfigBuilder`], optionally checked by
//! [`ConfigValidator`] and submitted through a [`Session`](crate::session::Session).
//! The resulting [`ConsumerHandle`](crate::broker::ConsumerHandle) drives
//! [`MessageFetcher`] for pull consumers, [`MessageSubscriber`] for push
//! consumers and [`LeaderStepDown`] for clustered ones.
//!
//! # Example
//!
//! ```no_run
//! use jetctl::broker::MemoryBroker;
//! use jetctl::consumer::{ConfigBuilder, ConsumerFlags, FetchOptions, MessageFetcher, NonInteractive};
//! use jetctl::session::Session;
//! use jetctl::settings::Settings;
//! use std::sync::Arc;
//!
//! # async fn example() -> jetctl::error::ConsumerResult<()> {
//! let broker = Arc::new(MemoryBroker::new());
//! broker.add_stream("ORDERS", &["orders.>"]);
//! let session = Session::new(broker.clone(), Settings::default());
//!
//! let flags = ConsumerFlags {
//!     name: Some("NEW".into()),
//!     pull: true,
//!     start_policy: Some("all".into()),
//!     filter_subject: Some(String::new()),
//!     ..Default::default()
//! };
//! let config = ConfigBuilder::new(flags, &mut NonInteractive).build()?;
//! let consumer = session.create_consumer("ORDERS", &config).await?;
//!
//! broker.publish("orders.new", "{}")?;
//! MessageFetcher::new()
//!     .fetch(&consumer, FetchOptions::default(), &mut std::io::stdout())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod builder;
pub mod config;
pub mod fetch;
pub mod policy;
pub mod render;
pub mod stepdown;
pub mod subscribe;
pub mod validate;

pub use admin::{ConsumerAdmin, SubOutcome};
pub use builder::{validate_durable_name, ConfigBuilder, ConsumerFlags, NonInteractive, Prompter, Question};
pub use config::{AckPolicy, ConsumerConfig, DeliverPolicy, ReplayPolicy};
pub use fetch::{FetchOptions, Fetched, MessageFetcher};
pub use policy::{parse_duration, parse_start_policy};
pub use stepdown::{LeaderStepDown, StepDownOutcome, StepDownReport, POLL_INTERVAL, STEP_DOWN_ATTEMPTS};
pub use subscribe::{MessageSubscriber, SubscribeOptions, SubscriptionSummary};
pub use validate::{
    bypass_requested, ConfigValidator, SchemaValidator, ValidationReport, Validator, NO_VALIDATE_ENV,
};
