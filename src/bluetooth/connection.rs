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

//! Per-peer connection controller.
//!
//! The controller owns a single slot holding at most one worker: a connect
//! task while `Connecting`, a read/write session while `Connected`. State is
//! derived from the slot, so the two can never disagree. Every worker carries
//! the attempt number it was started for; its completion is only applied if
//! the slot still holds that attempt. Workers replaced by `connect()`,
//! `disconnect()` or `destroy()` therefore finish silently.

use parking_lot::{Mutex, RwLock};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use super::connect_worker::ConnectTask;
use super::device_class::ServiceMetadata;
use super::event::{EventKind, EventSender, Notifier};
use super::session::Session;
use crate::config::ConnectionConfig;
use crate::error::{ConnectError, SendError};
use crate::link::{Link, PeerInfo, Transport};
use crate::state::LinkState;

/// Outcome of a successful `send()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the peer.
    Sent,
    /// Not connected; the bytes were discarded.
    Dropped,
}

enum Slot {
    Idle,
    Connecting(ConnectTask),
    Connected(Arc<Session>),
}

impl Slot {
    fn state(&self) -> LinkState {
        match self {
            Slot::Idle => LinkState::Disconnected,
            Slot::Connecting(_) => LinkState::Connecting,
            Slot::Connected(_) => LinkState::Connected,
        }
    }

    /// Stop whatever occupies the slot without marking it deliberate.
    fn cancel(self) {
        match self {
            Slot::Idle => {}
            Slot::Connecting(task) => task.cancel(),
            Slot::Connected(session) => session.cancel(),
        }
    }
}

struct PeerDetails {
    info: PeerInfo,
    capabilities: ServiceMetadata,
}

/// State shared between the controller and its workers.
pub(crate) struct Shared {
    transport: Arc<dyn Transport>,
    events: EventSender,
    settings: ConnectionConfig,
    peer_id: OnceLock<String>,
    peer: RwLock<Option<PeerDetails>>,
    slot: Mutex<Slot>,
    next_attempt: AtomicU64,
    destroyed: AtomicBool,
}

impl Shared {
    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn notifier(&self) -> Notifier {
        let peer_id = self.peer_id.get().cloned().unwrap_or_default();
        Notifier::new(peer_id, self.events.clone())
    }

    fn peer_label(&self) -> &str {
        self.peer_id.get().map(String::as_str).unwrap_or("<unbound>")
    }

    /// Hand the open link from the connect task to a new session.
    pub(crate) fn handshake_succeeded(self: &Arc<Self>, attempt: u64, link: Arc<dyn Link>) {
        let mut slot = self.slot.lock();
        match &*slot {
            Slot::Connecting(task) if task.attempt() == attempt => {}
            _ => {
                debug!(attempt, "Handshake finished for a superseded attempt");
                link.close();
                return;
            }
        }

        let notifier = self.notifier();
        let session = Session::new(attempt, link, notifier.clone());
        *slot = Slot::Connected(session.clone());
        info!(peer = %self.peer_label(), attempt, "Connected");

        // CONNECTED goes out before the reader can emit anything
        notifier.emit(EventKind::Connected);
        session.start_reader(self.clone(), self.settings.read_buffer_size);
    }

    pub(crate) fn handshake_failed(&self, attempt: u64, error: io::Error) {
        let mut slot = self.slot.lock();
        match &*slot {
            Slot::Connecting(task) if task.attempt() == attempt => {}
            _ => {
                debug!(attempt, "Cancelled connect attempt ended: {}", error);
                return;
            }
        }

        *slot = Slot::Idle;
        warn!(peer = %self.peer_label(), attempt, "Connection failed: {}", error);
        self.notifier().emit(EventKind::ConnectionFailed);
    }

    pub(crate) fn session_lost(&self, attempt: u64, error: io::Error) {
        let mut slot = self.slot.lock();
        match &*slot {
            Slot::Connected(session) if session.attempt() == attempt => {}
            _ => {
                debug!(attempt, "Superseded session ended: {}", error);
                return;
            }
        }

        std::mem::replace(&mut *slot, Slot::Idle).cancel();
        warn!(peer = %self.peer_label(), attempt, "Connection lost: {}", error);
        self.notifier().emit(EventKind::ConnectionLost);
    }
}

/// A serial connection to one remote peer.
///
/// Outcomes of `connect()` and everything the peer sends arrive as
/// [`ConnectionEvent`](super::ConnectionEvent)s on the channel passed to
/// [`Connection::new`]. Dropping the connection destroys it.
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub fn new(
        transport: Arc<dyn Transport>,
        events: EventSender,
        settings: ConnectionConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                events,
                settings,
                peer_id: OnceLock::new(),
                peer: RwLock::new(None),
                slot: Mutex::new(Slot::Idle),
                next_attempt: AtomicU64::new(1),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Start connecting to `peer_id`.
    ///
    /// Returns once the connect task is running; the outcome arrives as
    /// `Connected` or `ConnectionFailed`. Any in-flight attempt or open
    /// session is cancelled first and finishes without a notification.
    pub async fn connect(&self, peer_id: &str) -> Result<(), ConnectError> {
        let shared = &self.shared;
        if shared.destroyed.load(Ordering::SeqCst) {
            return Err(ConnectError::Destroyed);
        }
        if let Some(bound) = shared.peer_id.get() {
            if bound != peer_id {
                return Err(ConnectError::PeerMismatch {
                    bound: bound.clone(),
                    requested: peer_id.to_string(),
                });
            }
        }

        let resolved = shared.transport.resolve(peer_id).await?;
        let capabilities = resolved.link.service_metadata().await;

        let bound = shared.peer_id.get_or_init(|| peer_id.to_string());
        if bound != peer_id {
            resolved.link.close();
            return Err(ConnectError::PeerMismatch {
                bound: bound.clone(),
                requested: peer_id.to_string(),
            });
        }

        let attempt = shared.next_attempt.fetch_add(1, Ordering::SeqCst);
        let mut slot = shared.slot.lock();
        if shared.destroyed.load(Ordering::SeqCst) {
            resolved.link.close();
            return Err(ConnectError::Destroyed);
        }

        std::mem::replace(&mut *slot, Slot::Idle).cancel();
        *shared.peer.write() = Some(PeerDetails {
            info: resolved.info,
            capabilities,
        });
        *slot = Slot::Connecting(ConnectTask::spawn(attempt, resolved.link, shared.clone()));
        info!(peer = %peer_id, attempt, "Connecting");

        Ok(())
    }

    /// Write `data` to the peer if connected.
    ///
    /// Not being connected is not an error: the bytes are dropped and no
    /// notification is emitted. A failed write is returned to the caller and
    /// leaves the session up.
    pub async fn send(&self, data: &[u8]) -> Result<Delivery, SendError> {
        let session = match &*self.shared.slot.lock() {
            Slot::Connected(session) => session.clone(),
            _ => {
                debug!(peer = %self.shared.peer_label(), "Not connected, dropping {} bytes", data.len());
                return Ok(Delivery::Dropped);
            }
        };

        if let Err(e) = session.write(data).await {
            warn!(peer = %self.shared.peer_label(), "Write failed: {}", e);
            return Err(SendError::Write(e));
        }
        Ok(Delivery::Sent)
    }

    /// Tear down the current attempt or session and emit `Disconnected`.
    ///
    /// Emits on every call, including when already disconnected.
    pub fn disconnect(&self) {
        let shared = &self.shared;
        if shared.destroyed.load(Ordering::SeqCst) {
            debug!("disconnect() after destroy() ignored");
            return;
        }

        let mut slot = shared.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Idle) {
            Slot::Idle => {}
            Slot::Connecting(task) => task.cancel(),
            Slot::Connected(session) => session.close(),
        }
        info!(peer = %shared.peer_label(), "Disconnected");
        shared.notifier().emit(EventKind::Disconnected);
    }

    /// Cancel any worker without further notifications. Terminal.
    pub fn destroy(&self) {
        let shared = &self.shared;
        if shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut slot = shared.slot.lock();
        std::mem::replace(&mut *slot, Slot::Idle).cancel();
        debug!(peer = %shared.peer_label(), "Connection destroyed");
    }

    pub fn state(&self) -> LinkState {
        self.shared.slot.lock().state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    /// Peer this connection is bound to, once a `connect()` resolved it.
    pub fn peer_id(&self) -> Option<String> {
        self.shared.peer_id.get().cloned()
    }

    /// Name and vendor data captured by the last `connect()`.
    pub fn peer_info(&self) -> Option<PeerInfo> {
        self.shared.peer.read().as_ref().map(|peer| peer.info.clone())
    }

    /// Service metadata captured by the last `connect()`.
    pub fn peer_capabilities(&self) -> Option<ServiceMetadata> {
        self.shared
            .peer
            .read()
            .as_ref()
            .map(|peer| peer.capabilities.clone())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::{ConnectionEvent, EventReceiver};
    use crate::link::{HandshakePolicy, MemoryPeer, MemoryTransport};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<MemoryTransport>, MemoryPeer, Connection, EventReceiver) {
        let transport = Arc::new(MemoryTransport::new());
        let peer = transport.add_peer("peerX", "Peer X");
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection::new(transport.clone(), tx, ConnectionConfig::default());
        (transport, peer, connection, rx)
    }

    async fn next_kind(rx: &mut EventReceiver) -> EventKind {
        let event: ConnectionEvent = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        event.kind
    }

    async fn assert_quiet(rx: &mut EventReceiver) {
        let result = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(result.is_err(), "unexpected event: {:?}", result);
    }

    #[tokio::test]
    async fn test_initial_state() {
        let (_transport, _peer, connection, _rx) = setup();
        assert_eq!(connection.state(), LinkState::Disconnected);
        assert_eq!(connection.peer_id(), None);
        assert_eq!(connection.peer_capabilities(), None);
    }

    #[tokio::test]
    async fn test_connect_returns_before_handshake() {
        let (_transport, peer, connection, mut rx) = setup();
        peer.set_handshake(HandshakePolicy::Stall);

        connection.connect("peerX").await.unwrap();
        assert_eq!(connection.state(), LinkState::Connecting);
        assert_quiet(&mut rx).await;
        assert_eq!(connection.state(), LinkState::Connecting);
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_cancels_silently() {
        let (_transport, peer, connection, mut rx) = setup();
        peer.set_handshake(HandshakePolicy::Stall);

        connection.connect("peerX").await.unwrap();
        connection.disconnect();

        assert_eq!(next_kind(&mut rx).await, EventKind::Disconnected);
        assert_quiet(&mut rx).await;
        assert_eq!(connection.state(), LinkState::Disconnected);
        assert_eq!(peer.live_links(), 0);
    }

    #[tokio::test]
    async fn test_peer_mismatch() {
        let (transport, _peer, connection, mut rx) = setup();
        transport.add_peer("peerY", "Peer Y");

        connection.connect("peerX").await.unwrap();
        assert_eq!(next_kind(&mut rx).await, EventKind::Connected);

        let err = connection.connect("peerY").await.unwrap_err();
        assert!(matches!(err, ConnectError::PeerMismatch { .. }));
        assert!(connection.is_connected());
        assert_eq!(connection.peer_id().as_deref(), Some("peerX"));
    }

    #[tokio::test]
    async fn test_invalid_peer_does_not_bind() {
        let (_transport, _peer, connection, mut rx) = setup();

        let err = connection.connect("ghost").await.unwrap_err();
        assert!(matches!(err, ConnectError::InvalidPeer(_)));
        assert_eq!(connection.peer_id(), None);
        assert_quiet(&mut rx).await;

        connection.connect("peerX").await.unwrap();
        assert_eq!(next_kind(&mut rx).await, EventKind::Connected);
    }

    #[tokio::test]
    async fn test_handshake_cancels_discovery() {
        let (transport, _peer, connection, mut rx) = setup();
        connection.connect("peerX").await.unwrap();
        assert_eq!(next_kind(&mut rx).await, EventKind::Connected);
        assert_eq!(transport.discovery_cancels(), 1);
    }

    #[tokio::test]
    async fn test_eof_is_connection_lost() {
        let (_transport, peer, connection, mut rx) = setup();
        connection.connect("peerX").await.unwrap();
        assert_eq!(next_kind(&mut rx).await, EventKind::Connected);

        peer.hang_up();
        assert_eq!(next_kind(&mut rx).await, EventKind::ConnectionLost);
        assert_eq!(connection.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_reads_follow_buffer_size() {
        let transport = Arc::new(MemoryTransport::new());
        let peer = transport.add_peer("peerX", "Peer X");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let settings = ConnectionConfig {
            read_buffer_size: 4,
        };
        let connection = Connection::new(transport.clone(), tx, settings);

        connection.connect("peerX").await.unwrap();
        assert_eq!(next_kind(&mut rx).await, EventKind::Connected);

        peer.push(b"0123456789".to_vec());
        assert_eq!(next_kind(&mut rx).await, EventKind::DataReceived(b"0123".to_vec()));
        assert_eq!(next_kind(&mut rx).await, EventKind::DataReceived(b"4567".to_vec()));
        assert_eq!(next_kind(&mut rx).await, EventKind::DataReceived(b"89".to_vec()));
    }

    #[tokio::test]
    async fn test_drop_destroys() {
        let (_transport, peer, connection, mut rx) = setup();
        connection.connect("peerX").await.unwrap();
        assert_eq!(next_kind(&mut rx).await, EventKind::Connected);

        drop(connection);
        assert_eq!(peer.live_links(), 0);

        // Every sender is gone once the reader has stopped
        let result = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(matches!(result, Err(_) | Ok(None)), "unexpected event: {:?}", result);
    }
}
