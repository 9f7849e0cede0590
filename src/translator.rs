//! Protocol translator plugin boundary
//!
//! A [`ProtocolTranslator`] turns abstract [`Command`]s into vendor wire bytes
//! and vendor frames back into results or joint telemetry. Translators are
//! looked up at connection-creation time by package qualifier and lookup
//! name through a [`TranslatorCatalog`], a name-to-factory table.
//!
//! Adding a vendor takes two steps:
//! 1. Implement [`ProtocolTranslator`]
//! 2. Register a factory with [`TranslatorCatalog::register`]

use crate::command::{Command, CommandResult};
use crate::{DriverError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// What a single inbound frame decoded to
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Reply to a previously sent command
    Result(CommandResult),
    /// Joint positions in controller order
    JointPositions(Vec<f64>),
    /// Frame understood but carries nothing for the runtime (keepalive, banner)
    Ignored,
}

/// Vendor-specific encode/decode capability set.
///
/// One instance is bound to exactly one connection and is only ever called
/// from that connection's session, so implementations may keep session
/// counters without locking.
pub trait ProtocolTranslator: Send {
    /// Lookup name this instance was registered under
    fn name(&self) -> &str;

    /// Encode one command into a complete wire frame
    fn encode(&mut self, command: &Command) -> Result<Vec<u8>>;

    /// Decode one complete frame, as delimited by [`frame_len`](Self::frame_len)
    fn decode(&mut self, frame: &[u8]) -> Result<Decoded>;

    /// Length of the first complete frame in `buffer`, delimiter included.
    ///
    /// Defaults to newline-delimited frames.
    fn frame_len(&self, buffer: &[u8]) -> Option<usize> {
        buffer.iter().position(|&b| b == b'\n').map(|pos| pos + 1)
    }
}

/// Constructor stored in the catalog
pub type TranslatorFactory = Arc<dyn Fn() -> Box<dyn ProtocolTranslator> + Send + Sync>;

/// Name-to-factory table of available translators
#[derive(Clone, Default)]
pub struct TranslatorCatalog {
    factories: HashMap<(String, String), TranslatorFactory>,
}

impl TranslatorCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog preloaded with the translators shipped in this crate
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.register(
            crate::text_translator::PACKAGE,
            crate::text_translator::LOOKUP_NAME,
            || Box::new(crate::text_translator::TextTranslator::new()),
        );
        catalog.register(
            crate::json_translator::PACKAGE,
            crate::json_translator::LOOKUP_NAME,
            || Box::new(crate::json_translator::JsonTranslator::new()),
        );
        catalog
    }

    /// Register a factory under `package` / `lookup_name`, replacing any previous one
    pub fn register<F>(&mut self, package: &str, lookup_name: &str, factory: F)
    where
        F: Fn() -> Box<dyn ProtocolTranslator> + Send + Sync + 'static,
    {
        self.factories.insert(
            (package.trim().to_string(), lookup_name.trim().to_string()),
            Arc::new(factory),
        );
    }

    /// Instantiate a fresh translator. Every call yields an independent instance.
    pub fn load(&self, package: &str, lookup_name: &str) -> Result<Box<dyn ProtocolTranslator>> {
        let key = (package.trim().to_string(), lookup_name.trim().to_string());
        let factory = self.factories.get(&key).ok_or_else(|| {
            DriverError::Configuration(format!(
                "no translator '{}' in package '{}' (available: {})",
                lookup_name,
                package,
                self.names().join(", ")
            ))
        })?;

        Ok(factory())
    }

    pub fn contains(&self, package: &str, lookup_name: &str) -> bool {
        self.factories
            .contains_key(&(package.trim().to_string(), lookup_name.trim().to_string()))
    }

    /// Registered translators as `package/lookup_name`, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .keys()
            .map(|(package, lookup_name)| format!("{}/{}", package, lookup_name))
            .collect();
        names.sort();
        names
    }
}

/// Split a newline-terminated frame into trimmed UTF-8 text
pub(crate) fn frame_text(frame: &[u8]) -> Result<&str> {
    std::str::from_utf8(frame)
        .map(|text| text.trim_end_matches(['\r', '\n']))
        .map_err(|e| DriverError::Protocol(format!("frame is not UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTranslator;

    impl ProtocolTranslator for EchoTranslator {
        fn name(&self) -> &str {
            "echo"
        }

        fn encode(&mut self, command: &Command) -> Result<Vec<u8>> {
            Ok(format!("{}\n", command.command_type).into_bytes())
        }

        fn decode(&mut self, _frame: &[u8]) -> Result<Decoded> {
            Ok(Decoded::Ignored)
        }
    }

    #[test]
    fn test_builtins_registered() {
        let catalog = TranslatorCatalog::with_builtins();
        assert!(catalog.contains("rmi_text", "rmi_text::TextCommandRegister"));
        assert!(catalog.contains("rmi_json", "rmi_json::JsonCommandRegister"));
        assert_eq!(catalog.names().len(), 2);
    }

    #[test]
    fn test_unknown_translator_is_configuration_error() {
        let catalog = TranslatorCatalog::with_builtins();
        let err = catalog.load("rmi_text", "nonexistent-plugin").err().unwrap();
        assert!(err.is_configuration());

        // Right name, wrong package qualifier
        let err = catalog.load("rmi_json", "rmi_text::TextCommandRegister").err().unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_custom_registration() {
        let mut catalog = TranslatorCatalog::new();
        catalog.register("acme", "acme::Echo", || Box::new(EchoTranslator));

        let mut translator = catalog.load("acme", "acme::Echo").unwrap();
        assert_eq!(translator.name(), "echo");
        assert_eq!(translator.encode(&Command::new("PTP")).unwrap(), b"PTP\n");
    }

    #[test]
    fn test_default_framing_is_newline() {
        let translator = EchoTranslator;
        assert_eq!(translator.frame_len(b"abc\ndef"), Some(4));
        assert_eq!(translator.frame_len(b"partial"), None);
    }
}
