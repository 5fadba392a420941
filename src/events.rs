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

//! Rendering of connection events for the terminal.

use anyhow::Result;
use chrono::{DateTime, Local};

use crate::bluetooth::{ConnectionEvent, EventKind};
use crate::config::{DisplayMode, TerminalConfig};
use crate::link::AdapterState;

/// Turns events into output lines.
pub struct EventPrinter {
    display: DisplayMode,
    timestamps: bool,
    show_sent: bool,
}

impl EventPrinter {
    pub fn new(config: &TerminalConfig) -> Self {
        Self {
            display: config.display,
            timestamps: config.timestamps,
            show_sent: false,
        }
    }

    /// Also print `DATA_SENT` events (always shown in JSON mode).
    pub fn with_sent(mut self, show_sent: bool) -> Self {
        self.show_sent = show_sent;
        self
    }

    /// Render `event`, or `None` if it is not shown in this mode.
    pub fn render(&self, event: &ConnectionEvent) -> Result<Option<String>> {
        self.render_at(event, Local::now())
    }

    fn render_at(&self, event: &ConnectionEvent, now: DateTime<Local>) -> Result<Option<String>> {
        if self.display == DisplayMode::Json {
            let mut value = serde_json::to_value(event)?;
            if self.timestamps {
                value["timestamp"] = serde_json::Value::String(now.to_rfc3339());
            }
            return Ok(Some(serde_json::to_string(&value)?));
        }

        let body = match &event.kind {
            EventKind::DataReceived(data) => self.format_data(data),
            EventKind::DataSent(data) if self.show_sent => {
                format!("> {}", self.format_data(data))
            }
            EventKind::DataSent(_) => return Ok(None),
            kind => format!("[{}] {}", event.peer_id, kind.name()),
        };

        if self.timestamps {
            Ok(Some(format!("{} {}", now.format("%H:%M:%S%.3f"), body)))
        } else {
            Ok(Some(body))
        }
    }

    /// Render an adapter power change.
    pub fn render_adapter(&self, state: AdapterState) -> Result<String> {
        self.render_adapter_at(state, Local::now())
    }

    fn render_adapter_at(&self, state: AdapterState, now: DateTime<Local>) -> Result<String> {
        if self.display == DisplayMode::Json {
            let mut value = serde_json::json!({ "event": "ADAPTER_STATE", "data": state });
            if self.timestamps {
                value["timestamp"] = serde_json::Value::String(now.to_rfc3339());
            }
            return Ok(serde_json::to_string(&value)?);
        }

        let body = format!("[adapter] {}", state);
        if self.timestamps {
            Ok(format!("{} {}", now.format("%H:%M:%S%.3f"), body))
        } else {
            Ok(body)
        }
    }

    fn format_data(&self, data: &[u8]) -> String {
        match self.display {
            DisplayMode::Hex => hex::encode(data),
            _ => String::from_utf8_lossy(data)
                .trim_end_matches(['\r', '\n'])
                .to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(kind: EventKind) -> ConnectionEvent {
        ConnectionEvent {
            peer_id: "AA:BB:CC:DD:EE:FF".to_string(),
            kind,
        }
    }

    fn printer(display: DisplayMode, timestamps: bool) -> EventPrinter {
        EventPrinter::new(&TerminalConfig {
            display,
            timestamps,
            ..Default::default()
        })
    }

    #[test]
    fn test_text_mode() {
        let printer = printer(DisplayMode::Text, false);
        let line = printer
            .render(&event(EventKind::DataReceived(b"hello\r\n".to_vec())))
            .unwrap();
        assert_eq!(line.as_deref(), Some("hello"));

        let line = printer.render(&event(EventKind::ConnectionLost)).unwrap();
        assert_eq!(line.as_deref(), Some("[AA:BB:CC:DD:EE:FF] CONNECTION_LOST"));
    }

    #[test]
    fn test_sent_hidden_by_default() {
        let printer = printer(DisplayMode::Text, false);
        let sent = event(EventKind::DataSent(b"ping".to_vec()));
        assert_eq!(printer.render(&sent).unwrap(), None);

        let printer = printer.with_sent(true);
        assert_eq!(printer.render(&sent).unwrap().as_deref(), Some("> ping"));
    }

    #[test]
    fn test_hex_mode() {
        let printer = printer(DisplayMode::Hex, false);
        let line = printer
            .render(&event(EventKind::DataReceived(vec![0x41, 0x42, 0x0a])))
            .unwrap();
        assert_eq!(line.as_deref(), Some("41420a"));
    }

    #[test]
    fn test_json_mode_with_timestamp() {
        let printer = printer(DisplayMode::Json, true);
        let now = Local.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let line = printer
            .render_at(&event(EventKind::Connected), now)
            .unwrap()
            .unwrap();

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "CONNECTED");
        assert_eq!(value["peer_id"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(value["timestamp"], now.to_rfc3339());
    }

    #[test]
    fn test_timestamp_prefix() {
        let printer = printer(DisplayMode::Text, true);
        let now = Local.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let line = printer
            .render_at(&event(EventKind::Connected), now)
            .unwrap()
            .unwrap();
        assert_eq!(line, "03:04:05.000 [AA:BB:CC:DD:EE:FF] CONNECTED");
    }

    #[test]
    fn test_adapter_state_lines() {
        let printer = printer(DisplayMode::Text, false);
        assert_eq!(
            printer.render_adapter(AdapterState::Disabled).unwrap(),
            "[adapter] DISABLED"
        );

        let printer = self::printer(DisplayMode::Json, true);
        let now = Local.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let line = printer
            .render_adapter_at(AdapterState::Enabled, now)
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "ADAPTER_STATE");
        assert_eq!(value["data"], "ENABLED");
        assert_eq!(value["timestamp"], now.to_rfc3339());
    }
}
