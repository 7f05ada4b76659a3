//! Daemon configuration file
//!
//! ```toml
//! [server]
//! address = "0.0.0.0"
//! port = 7000
//! buffer_size = 8192
//! backlog = 50
//!
//! [udp]
//! port = 8000
//!
//! [probe]
//! address = "127.0.0.1"
//! port = 7000
//! greeting = "hello"
//! ```
//!
//! Every section is optional; a missing section disables that handler.

use std::path::{Path, PathBuf};

use dotlink_core::SocketOptions;
use serde::{Deserialize, Serialize};

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Nothing to run: enable [server], [udp] or [probe]")]
    Empty,
}

/// Outbound client that connects once and sends a greeting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(flatten)]
    pub target: SocketOptions,
    #[serde(default = "default_greeting")]
    pub greeting: String,
}

fn default_greeting() -> String {
    "hello from dotlink".to_string()
}

/// Top-level daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub server: Option<SocketOptions>,
    pub udp: Option<SocketOptions>,
    pub probe: Option<ProbeConfig>,
}

impl DaemonConfig {
    /// Server on the default port, UDP on the default datagram port
    pub fn standard() -> Self {
        Self {
            server: Some(SocketOptions::server(dotlink_core::DEFAULT_STREAM_PORT)),
            udp: Some(SocketOptions::datagram(dotlink_core::DEFAULT_DATAGRAM_PORT)),
            probe: None,
        }
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: DaemonConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if config.server.is_none() && config.udp.is_none() && config.probe.is_none() {
            return Err(ConfigError::Empty);
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_full_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
address = "127.0.0.1"
port = 7100
backlog = 10

[udp]
port = 8100
buffer_size = 1500

[probe]
address = "127.0.0.1"
port = 7100
greeting = "hi"
"#
        )
        .unwrap();

        let config = DaemonConfig::load(file.path()).unwrap();
        let server = config.server.unwrap();
        assert_eq!(server.address, "127.0.0.1");
        assert_eq!(server.port, 7100);
        assert_eq!(server.backlog, 10);
        assert_eq!(server.buffer_size, dotlink_core::DEFAULT_BUFFER_SIZE);

        let udp = config.udp.unwrap();
        assert_eq!(udp.port, 8100);
        assert_eq!(udp.buffer_size, 1500);

        let probe = config.probe.unwrap();
        assert_eq!(probe.target.port, 7100);
        assert_eq!(probe.greeting, "hi");
    }

    #[test]
    fn test_out_of_range_values_survive_parsing() {
        // Range checks belong to the handlers, which report them as events
        let config = DaemonConfig::parse("[server]\nport = 70000", Path::new("x.toml")).unwrap();
        assert_eq!(config.server.unwrap().port, 70000);
    }

    #[test]
    fn test_empty_config_rejected() {
        let err = DaemonConfig::parse("", Path::new("empty.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Empty));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = DaemonConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_bad_toml() {
        let err = DaemonConfig::parse("[server\nport = 1", Path::new("bad.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_standard() {
        let config = DaemonConfig::standard();
        assert_eq!(config.server.unwrap().port, 7000);
        assert_eq!(config.udp.unwrap().port, 8000);
        assert!(config.probe.is_none());
    }
}
