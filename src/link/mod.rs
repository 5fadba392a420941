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

//! Byte-stream transports.
//!
//! A [`Transport`] turns a peer id into a [`Link`]: an unconnected
//! bidirectional byte stream. Closing a link wakes every pending call on it
//! with an error, which is the only way connections cancel work.

mod memory;
mod rfcomm;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::sync::watch;

use crate::bluetooth::ServiceMetadata;
use crate::error::ConnectError;

pub use memory::{HandshakePolicy, MemoryPeer, MemoryTransport};
pub use rfcomm::RfcommTransport;

/// Descriptive data gathered when a peer is resolved. Best effort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: String,
    pub display_name: String,
    pub vendor_info: String,
}

/// A peer the transport knows how to reach.
pub struct ResolvedPeer {
    pub info: PeerInfo,
    pub link: Arc<dyn Link>,
}

/// Power state of the local adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdapterState {
    Enabled,
    Disabled,
}

impl AdapterState {
    pub fn from_powered(powered: bool) -> Self {
        if powered {
            AdapterState::Enabled
        } else {
            AdapterState::Disabled
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, AdapterState::Enabled)
    }

    pub fn name(&self) -> &'static str {
        match self {
            AdapterState::Enabled => "ENABLED",
            AdapterState::Disabled => "DISABLED",
        }
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Platform capability for reaching peers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Resolve a peer id into a connectable link.
    async fn resolve(&self, peer_id: &str) -> Result<ResolvedPeer, ConnectError>;

    /// Stop any discovery that would slow down a connect. Best effort.
    async fn cancel_discovery(&self) {}

    /// Follow adapter power changes. The receiver starts at the current state.
    fn watch_adapter(&self) -> watch::Receiver<AdapterState>;

    fn adapter_state(&self) -> AdapterState {
        let rx = self.watch_adapter();
        let state = *rx.borrow();
        state
    }

    /// Power the adapter on or off. The new state is also published to
    /// [`watch_adapter`](Transport::watch_adapter) receivers.
    async fn set_adapter_powered(&self, powered: bool) -> io::Result<()>;
}

/// One socket-like connection to a peer.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    /// Perform the connect handshake.
    async fn connect(&self) -> io::Result<()>;

    /// Read whatever is available into `buf`. `Ok(0)` means end of stream.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `data`.
    async fn write(&self, data: &[u8]) -> io::Result<()>;

    /// Close the link. Idempotent; unblocks pending `connect`/`read`/`write`.
    fn close(&self);

    /// Device class and advertised service UUIDs.
    async fn service_metadata(&self) -> ServiceMetadata;
}

/// Latched close flag shared by the link implementations.
#[derive(Debug)]
pub(crate) struct CloseSignal {
    tx: watch::Sender<bool>,
}

impl CloseSignal {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Returns `true` on the first call only.
    pub(crate) fn close(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `close()` has been called.
    pub(crate) async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Publish `state` if it differs from the current one.
pub(crate) fn publish_adapter_state(tx: &watch::Sender<AdapterState>, state: AdapterState) -> bool {
    tx.send_if_modified(|current| {
        if *current == state {
            false
        } else {
            *current = state;
            true
        }
    })
}

/// Error returned by operations interrupted by `close()`.
pub(crate) fn link_closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "link closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_adapter_state() {
        assert_eq!(AdapterState::from_powered(true), AdapterState::Enabled);
        assert!(!AdapterState::from_powered(false).is_enabled());
        assert_eq!(AdapterState::Disabled.to_string(), "DISABLED");
        assert_eq!(
            serde_json::to_string(&AdapterState::Enabled).unwrap(),
            "\"ENABLED\""
        );
    }

    #[test]
    fn test_publish_skips_unchanged_state() {
        let (tx, mut rx) = watch::channel(AdapterState::Enabled);
        assert!(!publish_adapter_state(&tx, AdapterState::Enabled));
        assert!(!rx.has_changed().unwrap());

        assert!(publish_adapter_state(&tx, AdapterState::Disabled));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), AdapterState::Disabled);
    }

    #[test]
    fn test_close_is_latched() {
        let signal = CloseSignal::new();
        assert!(!signal.is_closed());
        assert!(signal.close());
        assert!(!signal.close());
        assert!(signal.is_closed());
    }

    #[tokio::test]
    async fn test_closed_wakes_waiter() {
        let signal = Arc::new(CloseSignal::new());
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.closed().await })
        };
        tokio::task::yield_now().await;
        signal.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_after_close_returns_immediately() {
        let signal = CloseSignal::new();
        signal.close();
        tokio::time::timeout(Duration::from_secs(1), signal.closed())
            .await
            .unwrap();
    }
}
