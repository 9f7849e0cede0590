//! JSON Output for the command stream
//!
//! Structured, line-oriented events describing what happened to each inbound
//! batch and each decoded controller result, for consumption by external
//! tools.

use crate::command::{ConnectionId, ResultEvent};
use crate::router::Accepted;
use crate::telemetry::now_seconds;
use serde::{Deserialize, Serialize};

/// Outcome of routing one inbound line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Accepted,
    Rejected,
}

/// Batch routing event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub status: BatchStatus,
    /// Target as written by the sender
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
    pub commands: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Malformed input event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    /// 1-based input line number
    pub line: u64,
    pub error: String,
}

/// Decoded controller result, passed through
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultOutput {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(flatten)]
    pub event: ResultEvent,
}

impl BatchEvent {
    pub fn accepted(target: &str, accepted: &Accepted) -> Self {
        Self {
            timestamp: now_seconds(),
            event_type: "batch".to_string(),
            status: BatchStatus::Accepted,
            target: target.to_string(),
            connection_id: Some(accepted.connection_id),
            commands: accepted.commands,
            error: None,
        }
    }

    pub fn rejected(target: &str, commands: usize, error: &str) -> Self {
        Self {
            timestamp: now_seconds(),
            event_type: "batch".to_string(),
            status: BatchStatus::Rejected,
            target: target.to_string(),
            connection_id: None,
            commands,
            error: Some(error.to_string()),
        }
    }
}

impl ErrorEvent {
    pub fn new(line: u64, error: &str) -> Self {
        Self {
            timestamp: now_seconds(),
            event_type: "error".to_string(),
            line,
            error: error.to_string(),
        }
    }
}

impl ResultOutput {
    pub fn new(event: ResultEvent) -> Self {
        Self {
            timestamp: now_seconds(),
            event_type: "result".to_string(),
            event,
        }
    }
}

/// Print any serializable event as one JSON line on stdout
pub fn output_event<T: Serialize>(event: &T) {
    match serde_json::to_string(event) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::warn!("Failed to serialize event: {}", e),
    }
}
