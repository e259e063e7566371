//! Consumer management for JetStream streams
//!
//! This library resolves, validates and submits consumer configurations,
//! retrieves messages through pull and push consumers with optional jittered
//! acknowledgement, and coordinates leader step-down on clustered consumers.
//!
//! The broker is reached through the [`broker::Broker`] trait. A NATS backend
//! is available with the `nats` feature; [`broker::MemoryBroker`] runs fully
//! in process.
//!
//! # Example
//!
//! ```no_run
//! use jetctl::broker::MemoryBroker;
//! use jetctl::consumer::{ConsumerAdmin, ConsumerConfig};
//! use jetctl::session::Session;
//! use jetctl::settings::Settings;
//! use std::sync::Arc;
//!
//! # async fn example() -> jetctl::error::ConsumerResult<()> {
//! let broker = Arc::new(MemoryBroker::new());
//! broker.add_stream("ORDERS", &["orders.>"]);
//! let session = Session::new(broker, Settings::default());
//!
//! let config = ConsumerConfig {
//!     durable_name: Some("NEW".into()),
//!     ..Default::default()
//! };
//! ConsumerAdmin::new(&session)
//!     .create("ORDERS", &config, &mut std::io::stdout())
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]

/// Broker interface and implementations
pub mod broker;

/// Consumer configuration and message flow
pub mod consumer;

/// Error types
pub mod error;

/// Command context
pub mod session;

/// Tool settings
pub mod settings;

pub use broker::{Broker, ConsumerHandle};
pub use error::{ConsumerError, ConsumerResult};
pub use session::Session;
pub use settings::{LogSettings, Settings};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over the configured level. Logs go to stderr
/// so they never mix with command output.
pub fn init_tracing(settings: &LogSettings) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));
    let registry = tracing_subscriber::registry().with(filter);

    if settings.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
