//! Process configuration
//!
//! Settings come from an optional TOML file, then the command line
//! overrides the listen address, the initial peer and the author name.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

use scribble_net::{NodeConfig, PeerAddress, DEFAULT_PORT};

/// Name attached to segments when none is configured
pub const DEFAULT_AUTHOR: &str = "anonymous";

#[derive(Debug, Parser)]
#[command(name = "scribble", about = "Serverless shared whiteboard peer")]
pub struct Args {
    /// Host to listen on and announce to peers
    pub host: Option<String>,

    /// TCP listen port [default: 9000]
    pub port: Option<u16>,

    /// Peer to dial at startup
    #[arg(value_name = "PEER_HOST:PEER_PORT")]
    pub peer: Option<PeerAddress>,

    /// TOML configuration file
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Name attached to the segments you draw
    #[arg(long, short = 'a')]
    pub author: Option<String>,
}

/// Everything the binary needs to run a node
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_author")]
    pub author: String,
    pub node: NodeConfig,
}

fn default_author() -> String {
    DEFAULT_AUTHOR.to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the final configuration from parsed arguments
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => {
                let Some(host) = args.host.clone() else {
                    return Err(ConfigError::Invalid(
                        "expected HOST [PORT] or --config PATH".to_string(),
                    ));
                };
                AppConfig {
                    author: default_author(),
                    node: NodeConfig::new(PeerAddress::new(host, DEFAULT_PORT)),
                }
            }
        };

        match (args.host, args.port) {
            (Some(host), port) => {
                config.node.listen = PeerAddress::new(host, port.unwrap_or(DEFAULT_PORT))
            }
            (None, Some(_)) => {
                return Err(ConfigError::Invalid("PORT given without HOST".to_string()))
            }
            (None, None) => {}
        }
        if let Some(peer) = args.peer {
            config.node.initial_peer = Some(peer);
        }
        if let Some(author) = args.author {
            config.author = author;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.node.listen.host.is_empty() {
            return Err(ConfigError::Invalid("listen host is empty".to_string()));
        }
        if self.author.trim().is_empty() {
            return Err(ConfigError::Invalid("author is empty".to_string()));
        }
        if self.node.initial_peer.as_ref() == Some(&self.node.listen) {
            return Err(ConfigError::Invalid(format!(
                "initial peer {} is this node's own address",
                self.node.listen
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("scribble").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn test_positional_arguments() {
        let config = AppConfig::from_args(args(&["127.0.0.1", "9001", "127.0.0.1:9000"])).unwrap();

        assert_eq!(config.node.listen, PeerAddress::new("127.0.0.1", 9001));
        assert_eq!(
            config.node.initial_peer,
            Some(PeerAddress::new("127.0.0.1", 9000))
        );
        assert_eq!(config.author, DEFAULT_AUTHOR);
    }

    #[test]
    fn test_port_defaults() {
        let config = AppConfig::from_args(args(&["0.0.0.0"])).unwrap();
        assert_eq!(config.node.listen, PeerAddress::new("0.0.0.0", DEFAULT_PORT));
        assert!(config.node.initial_peer.is_none());
    }

    #[test]
    fn test_missing_listen_address_is_rejected() {
        let result = AppConfig::from_args(args(&[]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_peer_argument_is_rejected() {
        let result = Args::try_parse_from(["scribble", "127.0.0.1", "9001", "nowhere"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_own_address_as_peer_is_rejected() {
        let result = AppConfig::from_args(args(&["127.0.0.1", "9000", "127.0.0.1:9000"]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file_with_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
author = "alice"

[node]
send_timeout_ms = 500

[node.listen]
host = "127.0.0.1"
port = 9000
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap();
        let config = AppConfig::from_args(args(&["--config", path, "--author", "bob"])).unwrap();

        assert_eq!(config.author, "bob");
        assert_eq!(config.node.listen, PeerAddress::new("127.0.0.1", 9000));
        assert_eq!(config.node.send_timeout_ms, 500);
        assert_eq!(config.node.dial_attempts, 3);
    }

    #[test]
    fn test_invalid_toml_is_reported() {
        let result = AppConfig::from_toml("author = ");
        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let result = AppConfig::load(&dir.path().join("missing.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
