//! rmid - Robot Movement Interface daemon library
//!
//! Manages any number of concurrent links to robot controllers, translates
//! command batches into each controller's wire protocol through pluggable
//! translators, and publishes an aggregated joint-state observation at a fixed
//! rate.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use rmid::{ConsoleTelemetry, Command, CommandBatch, Driver, DriverConfig, TranslatorCatalog};
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DriverConfig::load_from_path("config/rmid.yaml")?;
//!     let mut driver = Driver::new(
//!         config,
//!         TranslatorCatalog::with_builtins(),
//!         Arc::new(ConsoleTelemetry::pretty()),
//!     );
//!     driver.start()?;
//!
//!     let batch = CommandBatch::new("robot0", vec![Command::new("PTP").with_pose("JOINTS", vec![0.0; 6])]);
//!     driver.route(batch)?;
//!
//!     driver.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **EventLoopRuntime**: one dedicated thread driving all connection I/O
//! - **ConnectionRegistry**: thread-safe id/namespace to connection mapping
//! - **CommandRouter**: resolves batch targets and posts them onto the loop
//! - **TelemetryPublisher**: fixed-rate aggregation on its own thread
//! - **TranslatorCatalog**: protocol translators resolved by package and name

pub mod command;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod event_loop;
pub mod json_output;
pub mod json_translator;
pub mod publisher;
pub mod registry;
pub mod router;
pub mod stream;
pub mod telemetry;
pub mod text_translator;
pub mod translator;
pub mod zenoh_publisher;

#[cfg(test)]
mod test_support;

pub use command::{BatchTarget, Command, CommandBatch, CommandResult, ConnectionId, ResultEvent};
pub use config::{ConnectionConfig, DriverConfig};
pub use connection::ConnectionState;
pub use driver::{Driver, FailedEntry};
pub use error::{DriverError, Result};
pub use event_loop::{EventLoopRuntime, LoopHandle};
pub use publisher::TelemetryPublisher;
pub use registry::{ConnectionRecord, ConnectionRegistry};
pub use router::{Accepted, CommandRouter};
pub use stream::{CommandStream, StreamStats};
pub use telemetry::{
    AggregatedObservation, ConsoleTelemetry, NoOpTelemetry, TelemetrySink, TelemetrySnapshot,
};
pub use translator::{Decoded, ProtocolTranslator, TranslatorCatalog};
pub use zenoh_publisher::ZenohBridge;
