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

//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{Config, DisplayMode};

/// Serial terminal over Bluetooth RFCOMM.
#[derive(Parser, Debug, Clone)]
#[command(name = "btserial")]
#[command(about = "Talk to Bluetooth serial devices")]
#[command(version)]
pub struct Cli {
    /// Configuration file. Defaults to the user config directory.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// RFCOMM channel of the remote serial service.
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=30))]
    pub channel: Option<u8>,

    /// How received bytes are printed.
    #[arg(long, value_enum)]
    pub display: Option<DisplayMode>,

    /// Prefix output with the local time.
    #[arg(long)]
    pub timestamps: bool,

    /// Also print data written to peers.
    #[arg(long)]
    pub echo_sent: bool,

    /// Use in-process echo peers instead of BlueZ.
    #[arg(long)]
    pub loopback: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Peer addresses, e.g. 00:11:22:33:44:55.
    #[arg(required = true)]
    pub peers: Vec<String>,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Apply command-line overrides on top of the loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(channel) = self.channel {
            config.bluetooth.rfcomm_channel = channel;
        }
        if let Some(display) = self.display {
            config.terminal.display = display;
        }
        if self.timestamps {
            config.terminal.timestamps = true;
        }
    }

    pub fn log_directive(&self) -> &'static str {
        if self.verbose {
            "btserial=debug"
        } else {
            "btserial=info"
        }
    }
}

/// Commands typed at the terminal instead of peer data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalCommand {
    /// Power the adapter on or off.
    SetAdapter(bool),
    /// Print the adapter power state.
    AdapterState,
}

impl TerminalCommand {
    /// Parse a command line; anything else is data for the peers.
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        if words.next()? != ":adapter" {
            return None;
        }
        let command = match words.next()? {
            "on" => TerminalCommand::SetAdapter(true),
            "off" => TerminalCommand::SetAdapter(false),
            "state" => TerminalCommand::AdapterState,
            _ => return None,
        };
        words.next().is_none().then_some(command)
    }
}
