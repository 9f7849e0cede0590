//! Newline-delimited JSON translator (`rmi_json::JsonCommandRegister`)

use crate::command::{Command, CommandResult};
use crate::translator::{frame_text, Decoded, ProtocolTranslator};
use crate::{DriverError, Result};
use serde::Deserialize;

pub const PACKAGE: &str = "rmi_json";
pub const LOOKUP_NAME: &str = "rmi_json::JsonCommandRegister";

/// Inbound frame shapes: `{"joints": [...]}`, `{"result": {...}}`, `{"info": "..."}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Frame {
    Joints(Vec<f64>),
    Result(CommandResult),
    Info(#[allow(dead_code)] String),
}

#[derive(Debug, Default)]
pub struct JsonTranslator;

impl JsonTranslator {
    pub fn new() -> Self {
        Self
    }
}

impl ProtocolTranslator for JsonTranslator {
    fn name(&self) -> &str {
        LOOKUP_NAME
    }

    fn encode(&mut self, command: &Command) -> Result<Vec<u8>> {
        let mut frame = serde_json::to_vec(command)?;
        frame.push(b'\n');
        Ok(frame)
    }

    fn decode(&mut self, frame: &[u8]) -> Result<Decoded> {
        let text = frame_text(frame)?.trim();
        if text.is_empty() {
            return Ok(Decoded::Ignored);
        }

        let frame: Frame = serde_json::from_str(text)
            .map_err(|e| DriverError::Protocol(format!("bad JSON frame '{}': {}", text, e)))?;

        Ok(match frame {
            Frame::Joints(positions) => Decoded::JointPositions(positions),
            Frame::Result(result) => Decoded::Result(result),
            Frame::Info(_) => Decoded::Ignored,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_single_json_line() {
        let mut translator = JsonTranslator::new();
        let frame = translator
            .encode(&Command::new("PTP").with_pose("JOINTS", vec![0.5]))
            .unwrap();

        assert_eq!(frame.last(), Some(&b'\n'));
        assert_eq!(frame.iter().filter(|&&b| b == b'\n').count(), 1);

        let parsed: Command = serde_json::from_slice(&frame[..frame.len() - 1]).unwrap();
        assert_eq!(parsed.command_type, "PTP");
        assert_eq!(parsed.pose, vec![0.5]);
    }

    #[test]
    fn test_decode_frames() {
        let mut translator = JsonTranslator::new();

        assert_eq!(
            translator.decode(b"{\"joints\": [1.0, 2.0]}\n").unwrap(),
            Decoded::JointPositions(vec![1.0, 2.0])
        );
        assert_eq!(
            translator
                .decode(b"{\"result\": {\"command_id\": 3, \"result_code\": -1}}\n")
                .unwrap(),
            Decoded::Result(CommandResult {
                command_id: 3,
                result_code: -1,
                additional_information: String::new(),
            })
        );
        assert_eq!(translator.decode(b"{\"info\": \"hello\"}\n").unwrap(), Decoded::Ignored);
        assert!(translator.decode(b"{\"unknown\": 1}\n").is_err());
        assert!(translator.decode(b"not json\n").is_err());
    }
}
