//! rmid - Robot Movement Interface daemon
//!
//! Connects to every configured robot controller, reads command batches as
//! JSON lines on stdin and publishes aggregated joint states to the selected
//! telemetry sink.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rmid::json_output::{output_event, ResultOutput};
use rmid::zenoh_publisher::DEFAULT_COMMAND_KEY;
use rmid::{
    CommandStream, ConsoleTelemetry, Driver, DriverConfig, NoOpTelemetry, TelemetrySink,
    TranslatorCatalog, ZenohBridge,
};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Sink {
    /// Discard observations
    None,
    /// JSON lines on stdout
    Console,
    /// Publish on the configured Zenoh key expression
    Zenoh,
}

#[derive(Parser)]
#[command(name = "rmid")]
#[command(about = "Robot Movement Interface daemon - multi-robot command routing and telemetry")]
#[command(version)]
struct Args {
    /// Path to the driver configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the configured telemetry rate in Hz
    #[arg(long)]
    publish_rate: Option<u32>,

    /// Where aggregated observations go
    #[arg(long, value_enum, default_value_t = Sink::None)]
    sink: Sink,
}

impl Args {
    fn get_config_path(&self) -> String {
        self.config
            .clone()
            .or_else(|| std::env::var("DEFAULT_CONFIG_PATH").ok())
            .unwrap_or_else(|| "config/rmid.yaml".to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.get_config_path();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    info!("Robot Movement Interface daemon");
    info!("Using config: {}", config_path);

    let mut config = DriverConfig::load_from_path(&config_path).context("Failed to load configuration")?;
    if let Some(rate) = args.publish_rate {
        config.publish_rate_hz = rate;
    }

    let mut zenoh = None;
    let sink: Arc<dyn TelemetrySink> = match args.sink {
        Sink::None => Arc::new(NoOpTelemetry),
        Sink::Console => Arc::new(ConsoleTelemetry::new()),
        Sink::Zenoh => {
            let bridge = ZenohBridge::open(&config.telemetry_topic).await?;
            zenoh = Some(bridge.clone());
            Arc::new(bridge)
        }
    };

    let mut driver = Driver::new(config, TranslatorCatalog::with_builtins(), sink);
    driver.start().context("Failed to start driver")?;
    for failed in driver.failed_entries() {
        warn!("Connection entry {} ({}) skipped: {}", failed.index, failed.host, failed.error);
    }

    let router = driver.router()?;
    let listener = zenoh
        .as_ref()
        .map(|bridge| bridge.spawn_command_listener(DEFAULT_COMMAND_KEY, router.clone()));

    let mut results = driver.subscribe_results()?;
    let result_printer = tokio::spawn(async move {
        loop {
            match results.recv().await {
                Ok(event) => output_event(&ResultOutput::new(event)),
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {} result events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut stream = CommandStream::new(BufReader::new(tokio::io::stdin()), router);
    let stats = stream
        .run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Interrupted"),
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        })
        .await;
    info!("{} batches accepted, {} rejected", stats.accepted, stats.rejected);

    info!("Performing graceful shutdown");
    if let Some(listener) = listener {
        listener.abort();
    }
    result_printer.abort();
    driver.shutdown();

    info!("Shutdown complete");
    Ok(())
}
