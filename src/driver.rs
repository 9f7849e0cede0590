//! Driver - top-level wrapper tying the runtime pieces together
//!
//! Owns the event loop thread, the connection registry, the command router
//! and the telemetry publisher, and brings them up and down in order.

use crate::command::{CommandBatch, ConnectionId, ResultEvent};
use crate::config::{ConnectionConfig, DriverConfig};
use crate::event_loop::EventLoopRuntime;
use crate::publisher::TelemetryPublisher;
use crate::registry::ConnectionRegistry;
use crate::router::{Accepted, CommandRouter};
use crate::telemetry::{NoOpTelemetry, TelemetrySink};
use crate::translator::TranslatorCatalog;
use crate::{DriverError, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// A configured connection entry that could not be added at startup
#[derive(Debug, Clone)]
pub struct FailedEntry {
    pub index: usize,
    pub host: String,
    pub error: String,
}

struct Running {
    event_loop: EventLoopRuntime,
    registry: Arc<ConnectionRegistry>,
    router: CommandRouter,
    publisher: TelemetryPublisher,
}

pub struct Driver {
    config: DriverConfig,
    catalog: Arc<TranslatorCatalog>,
    sink: Arc<dyn TelemetrySink>,
    running: Option<Running>,
    failed_entries: Vec<FailedEntry>,
}

impl Driver {
    pub fn new(
        config: DriverConfig,
        catalog: TranslatorCatalog,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            config,
            catalog: Arc::new(catalog),
            sink,
            running: None,
            failed_entries: Vec::new(),
        }
    }

    /// Built-in translators, no telemetry output
    pub fn with_defaults(config: DriverConfig) -> Self {
        Self::new(
            config,
            TranslatorCatalog::with_builtins(),
            Arc::new(NoOpTelemetry),
        )
    }

    /// Start the loop, add every configured connection and begin publishing.
    ///
    /// A bad connection entry is logged and recorded in
    /// [`failed_entries`](Self::failed_entries); it does not stop the others.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        self.config.validate()?;
        info!(
            "Starting driver with {} configured connections",
            self.config.connections.len()
        );

        let event_loop = EventLoopRuntime::start()?;
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::clone(&self.catalog),
            event_loop.handle(),
        ));

        self.failed_entries.clear();
        for (index, entry) in self.config.connections.iter().enumerate() {
            match registry.add(entry) {
                Ok(id) => info!("Configured connection {} -> {}:{}", id, entry.host, entry.port),
                Err(e) => {
                    error!("Connection entry {} ({}) rejected: {}", index, entry.host, e);
                    self.failed_entries.push(FailedEntry {
                        index,
                        host: entry.host.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let publisher = TelemetryPublisher::start(
            Arc::clone(&registry),
            Arc::clone(&self.sink),
            self.config.publish_rate_hz,
        )?;
        let router = CommandRouter::new(Arc::clone(&registry));

        self.running = Some(Running {
            event_loop,
            registry,
            router,
            publisher,
        });
        info!("Driver started");
        Ok(())
    }

    fn running(&self) -> Result<&Running> {
        self.running.as_ref().ok_or(DriverError::EventLoopStopped)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn failed_entries(&self) -> &[FailedEntry] {
        &self.failed_entries
    }

    pub fn registry(&self) -> Result<Arc<ConnectionRegistry>> {
        Ok(Arc::clone(&self.running()?.registry))
    }

    pub fn router(&self) -> Result<CommandRouter> {
        Ok(self.running()?.router.clone())
    }

    pub fn add_connection(&self, config: &ConnectionConfig) -> Result<ConnectionId> {
        self.running()?.registry.add(config)
    }

    pub fn remove_connection(&self, id: ConnectionId) -> Result<()> {
        self.running()?.registry.remove(id)
    }

    pub fn reconnect(&self, id: ConnectionId) -> Result<()> {
        self.running()?.registry.reconnect(id)
    }

    pub fn route(&self, batch: CommandBatch) -> Result<Accepted> {
        self.running()?.router.route(batch)
    }

    pub fn subscribe_results(&self) -> Result<broadcast::Receiver<ResultEvent>> {
        Ok(self.running()?.registry.subscribe_results())
    }

    /// Stop publishing, close every session and join both threads
    pub fn shutdown(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        info!("Shutting down driver");

        running.publisher.stop();
        for record in running.registry.snapshot() {
            if let Err(e) = running.registry.remove(record.id()) {
                warn!("Failed to retire connection {}: {}", record.id(), e);
            }
        }
        running.event_loop.shutdown();
        info!("Driver stopped");
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::connection::ConnectionState;
    use crate::telemetry::ChannelTelemetry;
    use crate::test_support::{wait_for_state, FakeController};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_bad_entries_do_not_block_startup() {
        let controller = FakeController::bind().await;
        let config = DriverConfig {
            connections: vec![
                ConnectionConfig::new("127.0.0.1", 0, "rmi_text::TextCommandRegister", vec![]),
                ConnectionConfig::new("127.0.0.1", 1, "missing::Plugin", vec![]),
                controller.config("rmi_text::TextCommandRegister", 2),
            ],
            ..DriverConfig::default()
        };

        let mut driver = Driver::with_defaults(config);
        driver.start().unwrap();

        let failed: Vec<usize> = driver.failed_entries().iter().map(|f| f.index).collect();
        assert_eq!(failed, vec![0, 1]);

        let registry = driver.registry().unwrap();
        assert_eq!(registry.len(), 1);
        let record = registry.snapshot().remove(0);
        let _stream = controller.accept().await;
        assert!(wait_for_state(&record, ConnectionState::Live).await);

        driver.shutdown();
        assert!(!driver.is_running());
        assert_eq!(record.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_not_started_reports_stopped() {
        let driver = Driver::with_defaults(DriverConfig::default());
        let result = driver.route(CommandBatch::new(ConnectionId(0), vec![]));
        assert!(matches!(result, Err(DriverError::EventLoopStopped)));
    }

    #[tokio::test]
    async fn test_zero_rate_fails_start() {
        let config = DriverConfig {
            publish_rate_hz: 0,
            ..DriverConfig::default()
        };
        let mut driver = Driver::with_defaults(config);
        assert!(driver.start().unwrap_err().is_configuration());
        assert!(!driver.is_running());
    }

    #[tokio::test]
    async fn test_end_to_end_command_and_telemetry() {
        let controller = FakeController::bind().await;
        let (sink, mut observations) = ChannelTelemetry::new();
        let config = DriverConfig {
            publish_rate_hz: 50,
            connections: vec![controller.config("rmi_text::TextCommandRegister", 2).with_namespace("arm")],
            ..DriverConfig::default()
        };

        let mut driver = Driver::new(config, TranslatorCatalog::with_builtins(), Arc::new(sink));
        driver.start().unwrap();
        let mut results = driver.subscribe_results().unwrap();

        let mut stream = controller.accept().await;
        let record = driver.registry().unwrap().find("arm").unwrap();
        assert!(wait_for_state(&record, ConnectionState::Live).await);

        let accepted = driver
            .route(CommandBatch::new("arm", vec![Command::new("PTP").with_id(3)]))
            .unwrap();
        assert_eq!(accepted.commands, 1);

        stream.write_all(b"result 3 0 done\njoints 1.0 2.0\n").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .expect("no result event")
            .unwrap();
        assert_eq!(event.namespace, "arm");
        assert_eq!(event.result.command_id, 3);

        let observation = loop {
            let observation = tokio::time::timeout(Duration::from_secs(5), observations.recv())
                .await
                .expect("no observation")
                .unwrap();
            if !observation.is_empty() {
                break observation;
            }
        };
        let (names, positions) = observation.joint_state();
        assert_eq!(names, vec!["j1".to_string(), "j2".to_string()]);
        assert_eq!(positions, vec![1.0, 2.0]);
    }
}
