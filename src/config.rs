//! Configuration loading for the driver and its robot connections

use crate::{DriverError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::info;

pub const DEFAULT_PUBLISH_RATE_HZ: u32 = 30;
pub const DEFAULT_HOST: &str = "192.168.100.100";
pub const DEFAULT_PORT: u32 = 30000;
pub const DEFAULT_PLUGIN_PACKAGE: &str = "rmi_text";
pub const DEFAULT_PLUGIN_LOOKUP_NAME: &str = "rmi_text::TextCommandRegister";
pub const DEFAULT_TELEMETRY_TOPIC: &str = "rmid/joint_states";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverConfig {
    /// Telemetry ticks per second
    #[serde(default = "default_publish_rate")]
    pub publish_rate_hz: u32,
    /// Key expression used by pub/sub telemetry sinks
    #[serde(default = "default_telemetry_topic")]
    pub telemetry_topic: String,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

/// One robot controller link
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Routing name for command batches; `robot<id>` when omitted
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    /// Kept wider than `u16` so out-of-range values surface as configuration errors
    #[serde(default = "default_port")]
    pub port: u32,
    #[serde(default = "default_plugin_package")]
    pub plugin_package: String,
    #[serde(default = "default_plugin_lookup_name")]
    pub plugin_lookup_name: String,
    /// Joint names, in the order the controller reports positions
    #[serde(default)]
    pub joints: Vec<String>,
}

fn default_publish_rate() -> u32 {
    DEFAULT_PUBLISH_RATE_HZ
}

fn default_telemetry_topic() -> String {
    DEFAULT_TELEMETRY_TOPIC.to_string()
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u32 {
    DEFAULT_PORT
}

fn default_plugin_package() -> String {
    DEFAULT_PLUGIN_PACKAGE.to_string()
}

fn default_plugin_lookup_name() -> String {
    DEFAULT_PLUGIN_LOOKUP_NAME.to_string()
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            publish_rate_hz: DEFAULT_PUBLISH_RATE_HZ,
            telemetry_topic: default_telemetry_topic(),
            connections: Vec::new(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            host: default_host(),
            port: DEFAULT_PORT,
            plugin_package: default_plugin_package(),
            plugin_lookup_name: default_plugin_lookup_name(),
            joints: Vec::new(),
        }
    }
}

impl DriverConfig {
    /// Load configuration from a YAML file
    pub fn load_from_path(config_path: &str) -> Result<Self> {
        let contents = fs::read_to_string(config_path).map_err(|e| {
            DriverError::Configuration(format!("Failed to read {}: {}", config_path, e))
        })?;

        let config = Self::load_from_str(&contents)?;
        info!("Loaded config from {}", config_path);
        Ok(config)
    }

    /// Parse configuration from a YAML string
    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: DriverConfig = serde_yaml::from_str(contents)?;
        config.validate()?;

        for (index, connection) in config.connections.iter().enumerate() {
            info!(
                "Connection entry {}: {}:{} via {}/{} ({} joints)",
                index,
                connection.host,
                connection.port,
                connection.plugin_package,
                connection.plugin_lookup_name,
                connection.joints.len()
            );
        }
        Ok(config)
    }

    /// Check process-wide settings.
    ///
    /// Connection entries are not checked here: a bad entry only fails that
    /// connection when it is added.
    pub fn validate(&self) -> Result<()> {
        if self.publish_rate_hz == 0 {
            return Err(DriverError::Configuration(
                "publish_rate_hz must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }
}

impl ConnectionConfig {
    pub fn new(host: &str, port: u32, plugin_lookup_name: &str, joints: Vec<String>) -> Self {
        let plugin_package = plugin_lookup_name
            .split("::")
            .next()
            .unwrap_or(plugin_lookup_name)
            .to_string();

        Self {
            namespace: None,
            host: host.to_string(),
            port,
            plugin_package,
            plugin_lookup_name: plugin_lookup_name.to_string(),
            joints,
        }
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Validate host and port, returning the port narrowed to `u16`
    pub fn validate(&self) -> Result<u16> {
        if self.host.trim().is_empty() {
            return Err(DriverError::Configuration("host must not be empty".to_string()));
        }

        match u16::try_from(self.port) {
            Ok(port) if port != 0 => Ok(port),
            _ => Err(DriverError::Configuration(format!(
                "port {} is outside 1-65535",
                self.port
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = DriverConfig::load_from_str("connections:\n  - joints: [a1, a2]\n").unwrap();

        assert_eq!(config.publish_rate_hz, 30);
        assert_eq!(config.telemetry_topic, DEFAULT_TELEMETRY_TOPIC);
        assert_eq!(config.connections.len(), 1);

        let connection = &config.connections[0];
        assert_eq!(connection.host, "192.168.100.100");
        assert_eq!(connection.port, 30000);
        assert_eq!(connection.plugin_package, "rmi_text");
        assert_eq!(connection.plugin_lookup_name, "rmi_text::TextCommandRegister");
        assert_eq!(connection.joints, vec!["a1".to_string(), "a2".to_string()]);
        assert!(connection.namespace.is_none());
    }

    #[test]
    fn test_zero_publish_rate_rejected() {
        let result = DriverConfig::load_from_str("publish_rate_hz: 0\n");
        assert!(matches!(result, Err(DriverError::Configuration(_))));
    }

    #[test]
    fn test_port_range_validation() {
        let mut connection = ConnectionConfig::default();
        assert_eq!(connection.validate().unwrap(), 30000);

        connection.port = 0;
        assert!(connection.validate().unwrap_err().is_configuration());

        connection.port = 70000;
        assert!(connection.validate().unwrap_err().is_configuration());

        connection.port = 65535;
        assert_eq!(connection.validate().unwrap(), 65535);

        connection.host = "  ".to_string();
        assert!(connection.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn test_new_derives_package_from_lookup_name() {
        let connection = ConnectionConfig::new("10.0.0.5", 4000, "rmi_json::JsonCommandRegister", vec![]);
        assert_eq!(connection.plugin_package, "rmi_json");
        assert_eq!(connection.plugin_lookup_name, "rmi_json::JsonCommandRegister");
    }

    #[test]
    fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "publish_rate_hz: 50\nconnections:\n  - namespace: cell_a\n    host: 127.0.0.1\n    port: 4100\n    plugin_package: rmi_json\n    plugin_lookup_name: rmi_json::JsonCommandRegister\n    joints: [j1]\n"
        )
        .unwrap();

        let config = DriverConfig::load_from_path(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.publish_rate_hz, 50);
        assert_eq!(config.connections[0].namespace.as_deref(), Some("cell_a"));
        assert_eq!(config.connections[0].port, 4100);
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let result = DriverConfig::load_from_path("/nonexistent/rmid.yaml");
        assert!(matches!(result, Err(DriverError::Configuration(_))));
    }

    #[test]
    fn test_shipped_config_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/rmid.yaml");
        let config = DriverConfig::load_from_path(path).unwrap();

        assert_eq!(config.connections.len(), 2);
        assert_eq!(config.connections[1].plugin_package, "rmi_json");
        assert!(config.connections.iter().all(|c| c.validate().is_ok()));
    }
}
