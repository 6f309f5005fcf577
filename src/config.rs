// src/config.rs

//! Manages client configuration: loading from TOML, defaults, and validation.

use crate::connection::{ConnectionOptions, Credential, Endpoint};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::warn;

/// Client settings. Every field is optional in the file.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Sent with `AUTH` right after connecting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Selected with `SELECT` right after connecting when non-zero.
    #[serde(default)]
    pub database: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Name of the event loop thread.
    #[serde(default = "default_reactor_name")]
    pub reactor_name: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7878
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_reactor_name() -> String {
    "spineldb-reactor".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            password: None,
            database: 0,
            log_level: default_log_level(),
            reactor_name: default_reactor_name(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the settings for values no connection could work with.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.reactor_name.trim().is_empty() {
            return Err(anyhow!("reactor_name cannot be empty"));
        }
        if let Some(password) = &self.password
            && password.is_empty()
        {
            warn!("An empty password is configured; AUTH will be sent with an empty secret.");
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    pub fn credential(&self) -> Credential {
        Credential::from(self.password.clone())
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            credential: self.credential(),
            database: self.database,
        }
    }
}
