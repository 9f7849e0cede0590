//! ASCII line protocol translator (`rmi_text::TextCommandRegister`)
//!
//! Outbound:
//! ```text
//! cmd <id> <type> [<pose_type> <p0> <p1> ...] [: <velocity_type> <v0> ...] [| <blending_type> <b0> ...]
//! ```
//! `pose_reference` and `additional_parameters` have no place in this
//! protocol and are not sent; use the JSON translator when a controller
//! needs them.
//!
//! Inbound:
//! ```text
//! joints <q0> <q1> ...
//! result <id> <code> [free text]
//! info <free text>
//! ```

use crate::command::{Command, CommandResult};
use crate::translator::{frame_text, Decoded, ProtocolTranslator};
use crate::{DriverError, Result};

pub const PACKAGE: &str = "rmi_text";
pub const LOOKUP_NAME: &str = "rmi_text::TextCommandRegister";

pub struct TextTranslator {
    /// Next id handed to commands submitted with `command_id == 0`
    next_sequence: u32,
}

impl TextTranslator {
    pub fn new() -> Self {
        Self { next_sequence: 1 }
    }

    fn assign_id(&mut self, command: &Command) -> u32 {
        if command.command_id != 0 {
            return command.command_id;
        }
        let id = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1).max(1);
        id
    }
}

impl Default for TextTranslator {
    fn default() -> Self {
        Self::new()
    }
}

fn push_values(line: &mut String, kind: &str, values: &[f64]) {
    line.push(' ');
    line.push_str(if kind.is_empty() { "-" } else { kind });
    for value in values {
        line.push(' ');
        line.push_str(&value.to_string());
    }
}

fn parse_f64(token: &str) -> Result<f64> {
    token
        .parse::<f64>()
        .map_err(|_| DriverError::Protocol(format!("invalid number '{}'", token)))
}

impl ProtocolTranslator for TextTranslator {
    fn name(&self) -> &str {
        LOOKUP_NAME
    }

    fn encode(&mut self, command: &Command) -> Result<Vec<u8>> {
        let command_type = command.command_type.trim();
        if command_type.is_empty() || command_type.contains(char::is_whitespace) {
            return Err(DriverError::Protocol(format!(
                "command type '{}' cannot be encoded",
                command.command_type
            )));
        }

        let id = self.assign_id(command);
        let mut line = format!("cmd {} {}", id, command_type);

        if !command.pose.is_empty() {
            push_values(&mut line, &command.pose_type, &command.pose);
        }
        if !command.velocity.is_empty() {
            line.push_str(" :");
            push_values(&mut line, &command.velocity_type, &command.velocity);
        }
        if !command.blending.is_empty() {
            line.push_str(" |");
            push_values(&mut line, &command.blending_type, &command.blending);
        }
        line.push('\n');

        Ok(line.into_bytes())
    }

    fn decode(&mut self, frame: &[u8]) -> Result<Decoded> {
        let text = frame_text(frame)?.trim();
        let mut tokens = text.split_whitespace();

        match tokens.next() {
            None => Ok(Decoded::Ignored),
            Some("info") => Ok(Decoded::Ignored),
            Some("joints") => {
                let positions = tokens.map(parse_f64).collect::<Result<Vec<_>>>()?;
                Ok(Decoded::JointPositions(positions))
            }
            Some("result") => {
                let command_id = tokens
                    .next()
                    .and_then(|t| t.parse::<u32>().ok())
                    .ok_or_else(|| DriverError::Protocol(format!("malformed result '{}'", text)))?;
                let result_code = tokens
                    .next()
                    .and_then(|t| t.parse::<i32>().ok())
                    .ok_or_else(|| DriverError::Protocol(format!("malformed result '{}'", text)))?;
                let additional_information = tokens.collect::<Vec<_>>().join(" ");

                Ok(Decoded::Result(CommandResult {
                    command_id,
                    result_code,
                    additional_information,
                }))
            }
            Some(other) => Err(DriverError::Protocol(format!("unknown frame kind '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_assigns_sequence_ids() {
        let mut translator = TextTranslator::new();

        let first = translator
            .encode(&Command::new("PTP").with_pose("JOINTS", vec![0.0, 1.5]))
            .unwrap();
        assert_eq!(String::from_utf8(first).unwrap(), "cmd 1 PTP JOINTS 0 1.5\n");

        let explicit = translator.encode(&Command::new("WAIT").with_id(42)).unwrap();
        assert_eq!(String::from_utf8(explicit).unwrap(), "cmd 42 WAIT\n");

        let second = translator
            .encode(&Command::new("LIN").with_velocity("", vec![0.25]))
            .unwrap();
        assert_eq!(String::from_utf8(second).unwrap(), "cmd 2 LIN : - 0.25\n");
    }

    #[test]
    fn test_encode_blending_section() {
        let mut translator = TextTranslator::new();
        let command = Command {
            blending_type: "BLENDING_PERCENT".to_string(),
            blending: vec![50.0],
            ..Command::new("PTP").with_pose("JOINTS", vec![0.5]).with_id(3)
        };

        let line = translator.encode(&command).unwrap();
        assert_eq!(
            String::from_utf8(line).unwrap(),
            "cmd 3 PTP JOINTS 0.5 | BLENDING_PERCENT 50\n"
        );
    }

    #[test]
    fn test_instances_keep_independent_counters() {
        let mut a = TextTranslator::new();
        let mut b = TextTranslator::new();

        a.encode(&Command::new("PTP")).unwrap();
        a.encode(&Command::new("PTP")).unwrap();
        let from_b = b.encode(&Command::new("PTP")).unwrap();
        assert_eq!(String::from_utf8(from_b).unwrap(), "cmd 1 PTP\n");
    }

    #[test]
    fn test_encode_rejects_bad_command_type() {
        let mut translator = TextTranslator::new();
        assert!(translator.encode(&Command::new("")).is_err());
        assert!(translator.encode(&Command::new("MOVE NOW")).is_err());
    }

    #[test]
    fn test_decode_frames() {
        let mut translator = TextTranslator::new();

        assert_eq!(
            translator.decode(b"joints 0.1 -0.2 3\r\n").unwrap(),
            Decoded::JointPositions(vec![0.1, -0.2, 3.0])
        );
        assert_eq!(
            translator.decode(b"result 7 0 motion done\n").unwrap(),
            Decoded::Result(CommandResult {
                command_id: 7,
                result_code: 0,
                additional_information: "motion done".to_string(),
            })
        );
        assert_eq!(translator.decode(b"info controller ready\n").unwrap(), Decoded::Ignored);
        assert_eq!(translator.decode(b"\n").unwrap(), Decoded::Ignored);

        assert!(translator.decode(b"joints 0.1 abc\n").is_err());
        assert!(translator.decode(b"result x\n").is_err());
        assert!(translator.decode(b"bogus 1\n").is_err());
    }
}
