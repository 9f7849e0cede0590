//! Abstract motion commands, batches and results
//!
//! These are the vendor-neutral shapes that flow between the command source,
//! the router and the protocol translators.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Registry-assigned identifier of a robot connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single abstract motion instruction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Command {
    /// Caller-chosen id; 0 lets the translator assign one
    pub command_id: u32,
    /// Instruction kind, e.g. `PTP`, `LIN`, `WAIT`, `SETTING`
    pub command_type: String,
    pub pose_reference: String,
    /// `JOINTS`, `QUATERNION`, `EULER_INTRINSIC_ZYX`, ...
    pub pose_type: String,
    pub pose: Vec<f64>,
    pub velocity_type: String,
    pub velocity: Vec<f64>,
    pub blending_type: String,
    pub blending: Vec<f64>,
    pub additional_parameters: Vec<String>,
}

impl Command {
    pub fn new(command_type: &str) -> Self {
        Self {
            command_type: command_type.to_string(),
            ..Default::default()
        }
    }

    pub fn with_pose(mut self, pose_type: &str, pose: Vec<f64>) -> Self {
        self.pose_type = pose_type.to_string();
        self.pose = pose;
        self
    }

    pub fn with_velocity(mut self, velocity_type: &str, velocity: Vec<f64>) -> Self {
        self.velocity_type = velocity_type.to_string();
        self.velocity = velocity;
        self
    }

    pub fn with_id(mut self, command_id: u32) -> Self {
        self.command_id = command_id;
        self
    }
}

/// Destination of a batch: a connection id or its namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchTarget {
    Id(ConnectionId),
    Namespace(String),
}

impl fmt::Display for BatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchTarget::Id(id) => write!(f, "#{}", id),
            BatchTarget::Namespace(namespace) => write!(f, "{}", namespace),
        }
    }
}

impl From<ConnectionId> for BatchTarget {
    fn from(id: ConnectionId) -> Self {
        BatchTarget::Id(id)
    }
}

impl From<&str> for BatchTarget {
    fn from(namespace: &str) -> Self {
        BatchTarget::Namespace(namespace.to_string())
    }
}

/// Ordered commands routed as one unit to a single connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandBatch {
    pub target: BatchTarget,
    pub commands: Vec<Command>,
}

impl CommandBatch {
    pub fn new(target: impl Into<BatchTarget>, commands: Vec<Command>) -> Self {
        Self {
            target: target.into(),
            commands,
        }
    }
}

/// Controller reply to a command, as decoded by a translator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: u32,
    /// 0 on success, vendor-specific otherwise
    pub result_code: i32,
    #[serde(default)]
    pub additional_information: String,
}

/// A decoded result tagged with the connection that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEvent {
    pub connection_id: ConnectionId,
    pub namespace: String,
    pub result: CommandResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_target_parses_id_or_namespace() {
        let by_id: CommandBatch =
            serde_json::from_str(r#"{"target": 3, "commands": [{"command_type": "PTP"}]}"#).unwrap();
        assert_eq!(by_id.target, BatchTarget::Id(ConnectionId(3)));
        assert_eq!(by_id.commands[0].command_type, "PTP");
        assert!(by_id.commands[0].pose.is_empty());

        let by_namespace: CommandBatch =
            serde_json::from_str(r#"{"target": "cell_a", "commands": []}"#).unwrap();
        assert_eq!(by_namespace.target, BatchTarget::Namespace("cell_a".to_string()));
    }

    #[test]
    fn test_target_display() {
        assert_eq!(BatchTarget::Id(ConnectionId(7)).to_string(), "#7");
        assert_eq!(BatchTarget::from("robot0").to_string(), "robot0");
    }
}
