//! Configuration system.
//!
//! Loads engine configuration from JSON strings/files.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::physics::PhysicsConfig;

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Server listen address, e.g. `127.0.0.1:40000`.
    pub server_addr: String,
    /// Fixed simulation tick rate.
    pub tick_hz: u32,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default)]
    pub motd: String,
    /// Player name (client only).
    #[serde(default = "default_player_name")]
    pub player_name: String,
    /// World hosted by the server / joined by the client.
    #[serde(default)]
    pub world: WorldConfig,
    /// Extension message names, registered by the server in this order.
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub physics: PhysicsConfig,
    /// How often scheduled tile reversions are checked.
    #[serde(default = "default_reversion_poll_ms")]
    pub reversion_poll_ms: u64,
}

/// Initial world settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldConfig {
    pub name: String,
    pub width: i32,
    pub height: i32,
    #[serde(default)]
    pub description: String,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            name: "lobby".to_string(),
            width: 64,
            height: 32,
            description: String::new(),
        }
    }
}

fn default_server_name() -> String {
    "tilenet".to_string()
}

fn default_player_name() -> String {
    "Player".to_string()
}

fn default_reversion_poll_ms() -> u64 {
    50
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:40000".to_string(),
            tick_hz: 60,
            server_name: default_server_name(),
            motd: String::new(),
            player_name: default_player_name(),
            world: WorldConfig::default(),
            extensions: Vec::new(),
            physics: PhysicsConfig::default(),
            reversion_poll_ms: default_reversion_poll_ms(),
        }
    }
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg = Self::from_json_str(&text)
            .with_context(|| format!("parse config {}", path.display()))?;
        cfg.validate()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(cfg)
    }

    /// Checks values serde cannot: physics parameters and tick rate.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.tick_hz > 0, "tick_hz must be positive");
        self.physics.validate().context("physics")
    }
}
