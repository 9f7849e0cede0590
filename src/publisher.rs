//! Fixed-rate telemetry publisher
//!
//! Runs on its own OS thread with its own small runtime, so a burst of
//! commands or slow socket I/O never shifts a tick. Each tick samples the
//! latest snapshot of every live connection and emits one
//! [`AggregatedObservation`] to the configured sink.

use crate::connection::ConnectionState;
use crate::registry::ConnectionRegistry;
use crate::telemetry::{now_seconds, AggregatedObservation, TelemetrySink};
use crate::{DriverError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub struct TelemetryPublisher {
    shutdown_signal: Arc<AtomicBool>,
    wake: Arc<Notify>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl TelemetryPublisher {
    /// Spawn the publish thread ticking `rate_hz` times per second
    pub fn start(
        registry: Arc<ConnectionRegistry>,
        sink: Arc<dyn TelemetrySink>,
        rate_hz: u32,
    ) -> Result<Self> {
        if rate_hz == 0 {
            return Err(DriverError::Configuration(
                "publish rate must be a positive integer".to_string(),
            ));
        }

        let period = Duration::from_secs_f64(1.0 / rate_hz as f64);
        let shutdown_signal = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());

        let thread_shutdown = Arc::clone(&shutdown_signal);
        let thread_wake = Arc::clone(&wake);
        let thread = std::thread::Builder::new()
            .name("rmid-publish".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Failed to build telemetry runtime: {}", e);
                        return;
                    }
                };
                runtime.block_on(run_publish_loop(
                    registry,
                    sink,
                    period,
                    thread_shutdown,
                    thread_wake,
                ));
            })?;

        info!("Telemetry publisher started at {}Hz", rate_hz);
        Ok(Self {
            shutdown_signal,
            wake,
            thread: Some(thread),
        })
    }

    /// Collect the current snapshot of every live connection.
    ///
    /// Never waits on a connection: one without a snapshot yet, or not
    /// `Live`, is simply left out.
    pub fn sample(registry: &ConnectionRegistry, sequence: u64) -> AggregatedObservation {
        let mut snapshots = Vec::new();
        registry.for_each(|record| {
            if record.state() != ConnectionState::Live {
                return;
            }
            if let Some(snapshot) = record.latest_telemetry() {
                snapshots.push(snapshot);
            }
        });

        AggregatedObservation {
            sequence,
            timestamp: now_seconds(),
            snapshots,
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|thread| !thread.is_finished())
    }

    /// Stop ticking and join the thread
    pub fn stop(&mut self) {
        self.shutdown_signal.store(true, Ordering::Relaxed);
        self.wake.notify_one();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Telemetry publisher thread panicked");
            }
            info!("Telemetry publisher stopped");
        }
    }
}

impl Drop for TelemetryPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_publish_loop(
    registry: Arc<ConnectionRegistry>,
    sink: Arc<dyn TelemetrySink>,
    period: Duration,
    shutdown_signal: Arc<AtomicBool>,
    wake: Arc<Notify>,
) {
    let mut interval = tokio::time::interval(period);
    // Stay on the original tick grid if a publish overruns
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sequence = 0u64;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = wake.notified() => {}
        }
        if shutdown_signal.load(Ordering::Relaxed) {
            break;
        }

        let observation = TelemetryPublisher::sample(&registry, sequence);
        debug!(
            "Tick {}: {} snapshots",
            observation.sequence,
            observation.snapshots.len()
        );
        if let Err(e) = sink.publish(&observation).await {
            warn!("Telemetry sink failed on tick {}: {}", sequence, e);
        }
        sequence += 1;
    }
}
