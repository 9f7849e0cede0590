//! Command streaming
//!
//! Reads newline-delimited JSON [`CommandBatch`]es from any async reader
//! (stdin in the daemon), routes each exactly once and reports the outcome as
//! JSON events.

use crate::command::CommandBatch;
use crate::json_output::{output_event, BatchEvent, ErrorEvent};
use crate::router::CommandRouter;
use crate::Result;
use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

/// What happened to one input line
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    Blank,
    Accepted,
    Rejected(String),
    Malformed(String),
}

/// Counters over a stream's lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub lines: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub malformed: u64,
}

pub struct CommandStream<R> {
    reader: R,
    router: CommandRouter,
    emit_events: bool,
    stats: StreamStats,
}

impl<R> CommandStream<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R, router: CommandRouter) -> Self {
        Self {
            reader,
            router,
            emit_events: true,
            stats: StreamStats::default(),
        }
    }

    /// Suppress JSON events on stdout
    pub fn quiet(mut self) -> Self {
        self.emit_events = false;
        self
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Process lines until EOF. A bad line is reported and skipped; only a
    /// read failure on the underlying reader ends the stream early.
    pub async fn run(&mut self) -> Result<StreamStats> {
        info!("Reading command batches");
        let mut buffer = Vec::new();

        loop {
            buffer.clear();
            if self.reader.read_until(b'\n', &mut buffer).await? == 0 {
                break;
            }
            self.stats.lines += 1;
            let outcome = match std::str::from_utf8(&buffer) {
                Ok(line) => self.handle_line(line.trim()),
                Err(e) => self.malformed(format!("line is not valid UTF-8: {}", e)),
            };
            debug!("Line {}: {:?}", self.stats.lines, outcome);
        }

        info!(
            "Command stream ended: {} accepted, {} rejected, {} malformed",
            self.stats.accepted, self.stats.rejected, self.stats.malformed
        );
        Ok(self.stats.clone())
    }

    /// Process input, then keep serving after EOF until `shutdown` resolves.
    ///
    /// Input ending does not stop the daemon; connections, telemetry and
    /// other command sources stay up until shutdown.
    pub async fn run_until<F>(&mut self, shutdown: F) -> StreamStats
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        tokio::select! {
            outcome = self.run() => {
                match outcome {
                    Ok(stats) => info!("Input closed after {} lines, still serving", stats.lines),
                    Err(e) => warn!("Command input failed, still serving: {}", e),
                }
                shutdown.await;
            }
            _ = &mut shutdown => {}
        }
        self.stats.clone()
    }

    fn malformed(&mut self, message: String) -> LineOutcome {
        self.stats.malformed += 1;
        warn!("Line {}: {}", self.stats.lines, message);
        if self.emit_events {
            output_event(&ErrorEvent::new(self.stats.lines, &message));
        }
        LineOutcome::Malformed(message)
    }

    /// Parse and route one line
    pub fn handle_line(&mut self, line: &str) -> LineOutcome {
        if line.is_empty() || line.starts_with('#') {
            return LineOutcome::Blank;
        }

        let batch: CommandBatch = match serde_json::from_str(line) {
            Ok(batch) => batch,
            Err(e) => return self.malformed(format!("invalid command batch: {}", e)),
        };

        let target = batch.target.to_string();
        let commands = batch.commands.len();

        match self.router.route(batch) {
            Ok(accepted) => {
                self.stats.accepted += 1;
                if self.emit_events {
                    output_event(&BatchEvent::accepted(&target, &accepted));
                }
                LineOutcome::Accepted
            }
            Err(e) => {
                self.stats.rejected += 1;
                let message = e.to_string();
                warn!("Batch for {} rejected: {}", target, message);
                if self.emit_events {
                    output_event(&BatchEvent::rejected(&target, commands, &message));
                }
                LineOutcome::Rejected(message)
            }
        }
    }
}
