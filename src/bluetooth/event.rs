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

//! Notifications emitted by a connection.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// What happened on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// Handshake succeeded, the session is reading.
    Connected,
    /// Caller-initiated disconnect.
    Disconnected,
    /// The read path failed without a prior `disconnect()`.
    ConnectionLost,
    /// The handshake failed.
    ConnectionFailed,
    /// Bytes written to the peer.
    DataSent(Vec<u8>),
    /// Bytes returned by a single read.
    DataReceived(Vec<u8>),
}

impl EventKind {
    /// The connection is idle after this event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Disconnected | EventKind::ConnectionLost | EventKind::ConnectionFailed
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Connected => "CONNECTED",
            EventKind::Disconnected => "DISCONNECTED",
            EventKind::ConnectionLost => "CONNECTION_LOST",
            EventKind::ConnectionFailed => "CONNECTION_FAILED",
            EventKind::DataSent(_) => "DATA_SENT",
            EventKind::DataReceived(_) => "DATA_RECEIVED",
        }
    }
}

/// A notification tagged with the peer it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionEvent {
    pub peer_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Sending half of a notification stream.
pub type EventSender = mpsc::UnboundedSender<ConnectionEvent>;

/// Receiving half of a notification stream.
pub type EventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Emits events for one peer.
#[derive(Debug, Clone)]
pub(crate) struct Notifier {
    peer_id: String,
    tx: EventSender,
}

impl Notifier {
    pub(crate) fn new(peer_id: impl Into<String>, tx: EventSender) -> Self {
        Self {
            peer_id: peer_id.into(),
            tx,
        }
    }

    /// Emit an event. Never blocks, so it is safe under the state guard.
    pub(crate) fn emit(&self, kind: EventKind) {
        debug!(peer = %self.peer_id, event = kind.name(), "Notify");
        let event = ConnectionEvent {
            peer_id: self.peer_id.clone(),
            kind,
        };
        if self.tx.send(event).is_err() {
            debug!(peer = %self.peer_id, "Event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        assert!(EventKind::ConnectionLost.is_terminal());
        assert!(EventKind::Disconnected.is_terminal());
        assert!(!EventKind::Connected.is_terminal());
        assert!(!EventKind::DataReceived(vec![1]).is_terminal());
    }

    #[test]
    fn test_notifier_tags_peer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = Notifier::new("AA:BB", tx);
        notifier.emit(EventKind::DataSent(b"hi".to_vec()));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.peer_id, "AA:BB");
        assert_eq!(event.kind, EventKind::DataSent(b"hi".to_vec()));
    }

    #[test]
    fn test_emit_without_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        Notifier::new("peer", tx).emit(EventKind::Connected);
    }

    #[test]
    fn test_json_shape() {
        let event = ConnectionEvent {
            peer_id: "peerX".to_string(),
            kind: EventKind::DataReceived(vec![0x41, 0x42]),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["peer_id"], "peerX");
        assert_eq!(json["event"], "DATA_RECEIVED");
        assert_eq!(json["data"], serde_json::json!([65, 66]));

        let connected = ConnectionEvent {
            peer_id: "peerX".to_string(),
            kind: EventKind::Connected,
        };
        let json = serde_json::to_value(&connected).unwrap();
        assert_eq!(json["event"], "CONNECTED");
    }
}
