//! Zenoh Bridge
//!
//! Publishes aggregated observations as JSON on the configured telemetry
//! key expression and, optionally, accepts command batches published as JSON
//! on a command key expression.

use crate::telemetry::{AggregatedObservation, TelemetrySink};
use async_trait::async_trait;

#[cfg(feature = "zenoh-integration")]
use {
    crate::command::CommandBatch,
    crate::router::CommandRouter,
    anyhow::{anyhow, Context, Result},
    std::sync::Arc,
    tracing::{debug, info, warn},
    zenoh::{pubsub::Publisher, Session},
};

/// Key expression command batches are read from
pub const DEFAULT_COMMAND_KEY: &str = "rmid/commands";

/// Zenoh session plus the telemetry publisher
#[cfg(feature = "zenoh-integration")]
#[derive(Clone)]
pub struct ZenohBridge {
    publisher: Arc<Publisher<'static>>,
    session: Arc<Session>,
    topic: String,
}

#[cfg(feature = "zenoh-integration")]
impl ZenohBridge {
    pub async fn open(topic: &str) -> Result<Self> {
        info!("Opening Zenoh session for telemetry on {}", topic);

        let session = zenoh::open(zenoh::Config::default())
            .await
            .map_err(|e| anyhow!("Failed to open Zenoh session: {}", e))?;

        let publisher = session
            .declare_publisher(topic.to_string())
            .await
            .map_err(|e| anyhow!("Failed to create telemetry publisher: {}", e))?;

        Ok(Self {
            publisher: Arc::new(publisher),
            session: Arc::new(session),
            topic: topic.to_string(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Route every batch published on `key` until the session closes
    pub fn spawn_command_listener(&self, key: &str, router: CommandRouter) -> tokio::task::JoinHandle<()> {
        let session = Arc::clone(&self.session);
        let key = key.to_string();

        tokio::spawn(async move {
            let subscriber = match session.declare_subscriber(key.clone()).await {
                Ok(subscriber) => subscriber,
                Err(e) => {
                    warn!("Failed to subscribe to {}: {}", key, e);
                    return;
                }
            };
            info!("Listening for command batches on {}", key);

            while let Ok(sample) = subscriber.recv_async().await {
                let batch = match serde_json::from_slice::<CommandBatch>(&sample.payload().to_bytes()) {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!("Ignoring malformed batch on {}: {}", key, e);
                        continue;
                    }
                };
                let target = batch.target.to_string();
                match router.route(batch) {
                    Ok(accepted) => debug!(
                        "Zenoh batch of {} commands routed to {}",
                        accepted.commands, accepted.connection_id
                    ),
                    Err(e) => warn!("Zenoh batch for {} rejected: {}", target, e),
                }
            }
            info!("Command listener on {} stopped", key);
        })
    }
}

#[cfg(feature = "zenoh-integration")]
#[async_trait]
impl TelemetrySink for ZenohBridge {
    async fn publish(&self, observation: &AggregatedObservation) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(observation).context("Failed to serialize observation")?;

        self.publisher
            .put(payload)
            .await
            .map_err(|e| anyhow!("Failed to publish observation: {}", e))?;

        debug!("Published observation {} to {}", observation.sequence, self.topic);
        Ok(())
    }
}

#[cfg(not(feature = "zenoh-integration"))]
#[derive(Clone)]
pub struct ZenohBridge;

#[cfg(not(feature = "zenoh-integration"))]
impl ZenohBridge {
    pub async fn open(_topic: &str) -> anyhow::Result<Self> {
        Err(anyhow::anyhow!(
            "Zenoh integration not enabled. Enable with --features zenoh-integration"
        ))
    }

    pub fn topic(&self) -> &str {
        ""
    }

    pub fn spawn_command_listener(
        &self,
        _key: &str,
        _router: crate::router::CommandRouter,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async {})
    }
}

#[cfg(not(feature = "zenoh-integration"))]
#[async_trait]
impl TelemetrySink for ZenohBridge {
    async fn publish(&self, _observation: &AggregatedObservation) -> anyhow::Result<()> {
        Ok(())
    }
}
