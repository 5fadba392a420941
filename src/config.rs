// Copyright 2026 btserial contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving application settings.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::bluetooth::SPP_UUID;

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,

    /// Per-connection settings.
    pub connection: ConnectionConfig,

    /// Terminal output settings.
    pub terminal: TerminalConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Adapter name (e.g. "hci0"). The default adapter when unset.
    pub adapter: Option<String>,

    /// RFCOMM channel the remote serial service listens on.
    pub rfcomm_channel: u8,

    /// Service the remote end is expected to advertise.
    pub service_uuid: Uuid,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            rfcomm_channel: 1,
            service_uuid: SPP_UUID,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Size of the buffer handed to each read. Not a framing boundary.
    pub read_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024,
        }
    }
}

/// How received bytes are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    Text,
    Hex,
    Json,
}

/// Appended to each line typed into the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    #[default]
    Lf,
    Crlf,
    None,
}

impl LineEnding {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            LineEnding::Lf => b"\n",
            LineEnding::Crlf => b"\r\n",
            LineEnding::None => b"",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub display: DisplayMode,

    /// Prefix each printed event with the local time.
    pub timestamps: bool,

    pub line_ending: LineEnding,
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("btserial")
}

impl Config {
    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        config_dir().join("config.toml")
    }

    /// Load configuration from the default location or create it.
    pub fn load() -> Result<Self> {
        let config_path = Self::default_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::load_from(&config_path)
    }

    /// Load configuration from `path`, writing defaults there if it is missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            let config = Self::default();
            config.save_to(path)?;
            config
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection.read_buffer_size == 0 {
            bail!("connection.read_buffer_size must be greater than zero");
        }
        if !(1..=30).contains(&self.bluetooth.rfcomm_channel) {
            bail!(
                "bluetooth.rfcomm_channel must be between 1 and 30, got {}",
                self.bluetooth.rfcomm_channel
            );
        }
        Ok(())
    }
}
