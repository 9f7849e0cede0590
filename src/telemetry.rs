//! Telemetry data and sink abstraction
//!
//! Provides the per-connection joint snapshot, the aggregated per-tick
//! observation, and a trait-based sink so the publisher can emit to any
//! transport (stdout, Zenoh, an in-process channel, ...).

use crate::command::ConnectionId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Seconds since the Unix epoch, millisecond resolution
pub fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// A named joint position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointPosition {
    pub name: String,
    pub position: f64,
}

/// Latest decoded joint state of one connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub connection_id: ConnectionId,
    pub namespace: String,
    /// Wire timestamp: when the daemon decoded the frame
    pub timestamp: f64,
    pub joints: Vec<JointPosition>,
}

impl TelemetrySnapshot {
    /// Pair decoded positions with configured joint names.
    ///
    /// Pairs beyond the shorter of the two lists are dropped.
    pub fn aligned(
        connection_id: ConnectionId,
        namespace: &str,
        joint_names: &[String],
        positions: &[f64],
        timestamp: f64,
    ) -> Self {
        let joints = joint_names
            .iter()
            .zip(positions.iter())
            .map(|(name, &position)| JointPosition {
                name: name.clone(),
                position,
            })
            .collect();

        Self {
            connection_id,
            namespace: namespace.to_string(),
            timestamp,
            joints,
        }
    }

    pub fn position(&self, joint: &str) -> Option<f64> {
        self.joints.iter().find(|j| j.name == joint).map(|j| j.position)
    }
}

/// All current snapshots across live connections at one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedObservation {
    /// Tick counter, starting at 0
    pub sequence: u64,
    pub timestamp: f64,
    pub snapshots: Vec<TelemetrySnapshot>,
}

impl AggregatedObservation {
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn snapshot(&self, connection_id: ConnectionId) -> Option<&TelemetrySnapshot> {
        self.snapshots.iter().find(|s| s.connection_id == connection_id)
    }

    /// Flatten into parallel name/position lists, joint-state style
    pub fn joint_state(&self) -> (Vec<String>, Vec<f64>) {
        self.snapshots
            .iter()
            .flat_map(|s| s.joints.iter())
            .map(|j| (j.name.clone(), j.position))
            .unzip()
    }
}

/// Destination of aggregated observations.
///
/// Errors are logged by the publisher and never stop the tick loop.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn publish(&self, observation: &AggregatedObservation) -> anyhow::Result<()>;
}

/// Discards every observation
#[derive(Debug, Clone)]
pub struct NoOpTelemetry;

#[async_trait]
impl TelemetrySink for NoOpTelemetry {
    async fn publish(&self, _observation: &AggregatedObservation) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Prints every observation to stdout as JSON
#[derive(Debug, Clone)]
pub struct ConsoleTelemetry {
    pub pretty_print: bool,
}

impl ConsoleTelemetry {
    pub fn new() -> Self {
        Self { pretty_print: false }
    }

    pub fn pretty() -> Self {
        Self { pretty_print: true }
    }
}

impl Default for ConsoleTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetrySink for ConsoleTelemetry {
    async fn publish(&self, observation: &AggregatedObservation) -> anyhow::Result<()> {
        if self.pretty_print {
            println!("{}", serde_json::to_string_pretty(observation)?);
        } else {
            println!("{}", serde_json::to_string(observation)?);
        }
        Ok(())
    }
}

/// Forwards observations into an in-process channel
#[derive(Debug, Clone)]
pub struct ChannelTelemetry {
    sender: mpsc::UnboundedSender<AggregatedObservation>,
}

impl ChannelTelemetry {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AggregatedObservation>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl TelemetrySink for ChannelTelemetry {
    async fn publish(&self, observation: &AggregatedObservation) -> anyhow::Result<()> {
        self.sender
            .send(observation.clone())
            .map_err(|_| anyhow::anyhow!("telemetry receiver dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_alignment_truncates_to_shorter_list() {
        let joints = names(&["a1", "a2", "a3"]);

        let short = TelemetrySnapshot::aligned(ConnectionId(0), "r", &joints, &[1.0, 2.0], 10.0);
        assert_eq!(short.joints.len(), 2);
        assert_eq!(short.position("a2"), Some(2.0));
        assert_eq!(short.position("a3"), None);

        let long = TelemetrySnapshot::aligned(ConnectionId(0), "r", &joints, &[1.0, 2.0, 3.0, 4.0], 10.0);
        assert_eq!(long.joints.len(), 3);
        assert_eq!(long.position("a3"), Some(3.0));
    }

    #[test]
    fn test_joint_state_flattening() {
        let observation = AggregatedObservation {
            sequence: 0,
            timestamp: 1.0,
            snapshots: vec![
                TelemetrySnapshot::aligned(ConnectionId(0), "a", &names(&["a1"]), &[0.5], 1.0),
                TelemetrySnapshot::aligned(ConnectionId(1), "b", &names(&["b1", "b2"]), &[1.5, 2.5], 1.0),
            ],
        };

        let (joint_names, positions) = observation.joint_state();
        assert_eq!(joint_names, names(&["a1", "b1", "b2"]));
        assert_eq!(positions, vec![0.5, 1.5, 2.5]);
        assert!(observation.snapshot(ConnectionId(1)).is_some());
        assert!(observation.snapshot(ConnectionId(2)).is_none());
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut receiver) = ChannelTelemetry::new();
        let observation = AggregatedObservation {
            sequence: 4,
            timestamp: now_seconds(),
            snapshots: vec![],
        };

        sink.publish(&observation).await.unwrap();
        assert_eq!(receiver.recv().await.unwrap().sequence, 4);

        drop(receiver);
        assert!(sink.publish(&observation).await.is_err());
    }
}
