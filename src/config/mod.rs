//! Runtime configuration.
//!
//! Precedence: defaults < JSON config file < CLI flags.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::network::DEFAULT_PORT;

pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Fully resolved configuration shared by both roles.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Port the receiver binds and the sender connects to
    pub port: u16,
    /// Network read / file read chunk size in bytes
    pub chunk_size: usize,
    /// Upper bound on any single network read or write
    #[serde(deserialize_with = "human_duration")]
    pub io_timeout: Duration,
    pub send: SendSection,
    pub receive: ReceiveSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SendSection {
    pub host: String,
    pub directory: PathBuf,
    /// Consecutive reconnects allowed before the sender gives up
    pub reconnect_attempts: u32,
    #[serde(deserialize_with = "human_duration")]
    pub reconnect_delay: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReceiveSection {
    pub bind: String,
    pub directory: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            io_timeout: Duration::from_secs(30),
            send: SendSection::default(),
            receive: ReceiveSection::default(),
        }
    }
}

impl Default for SendSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            directory: PathBuf::from("client_files"),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl Default for ReceiveSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            directory: PathBuf::from("server_files"),
        }
    }
}

impl Config {
    /// Load from an optional JSON file, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                Self::from_json(&raw)
                    .with_context(|| format!("Invalid config {}", path.display()))?
            }
            None => Self::default(),
        };

        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.chunk_size > 0, "chunk_size must be greater than zero");
        ensure!(!self.io_timeout.is_zero(), "io_timeout must be greater than zero");
        Ok(())
    }
}

fn human_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}
