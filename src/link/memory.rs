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

//! In-process transport with scriptable peers.
//!
//! Each [`MemoryPeer`] plays the remote side: it decides how handshakes end,
//! feeds inbound bytes or read errors to the most recent link, and captures
//! everything written to it. Used by the tests and by `--loopback`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::{
    link_closed, publish_adapter_state, AdapterState, CloseSignal, Link, PeerInfo, ResolvedPeer,
    Transport,
};
use crate::bluetooth::ServiceMetadata;
use crate::error::ConnectError;

type Inbound = io::Result<Vec<u8>>;

/// How a peer answers the connect handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakePolicy {
    #[default]
    Accept,
    /// Fail with `ConnectionRefused`.
    Refuse,
    /// Never answer; only `close()` ends the handshake.
    Stall,
}

/// Transport whose peers live in this process.
pub struct MemoryTransport {
    peers: Mutex<HashMap<String, MemoryPeer>>,
    discovery_cancels: AtomicUsize,
    powered: Arc<AtomicBool>,
    adapter_tx: watch::Sender<AdapterState>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (adapter_tx, _) = watch::channel(AdapterState::Enabled);
        Self {
            peers: Mutex::new(HashMap::new()),
            discovery_cancels: AtomicUsize::new(0),
            powered: Arc::new(AtomicBool::new(true)),
            adapter_tx,
        }
    }

    /// Register a reachable peer.
    pub fn add_peer(&self, peer_id: &str, display_name: &str) -> MemoryPeer {
        let info = PeerInfo {
            peer_id: peer_id.to_string(),
            display_name: display_name.to_string(),
            vendor_info: String::new(),
        };
        let peer = MemoryPeer::new(info, self.powered.clone());
        self.peers.lock().insert(peer_id.to_string(), peer.clone());
        peer
    }

    pub fn remove_peer(&self, peer_id: &str) -> Option<MemoryPeer> {
        self.peers.lock().remove(peer_id)
    }

    /// Number of `cancel_discovery` calls so far.
    pub fn discovery_cancels(&self) -> usize {
        self.discovery_cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn resolve(&self, peer_id: &str) -> Result<ResolvedPeer, ConnectError> {
        let peer = self
            .peers
            .lock()
            .get(peer_id)
            .cloned()
            .ok_or_else(|| ConnectError::InvalidPeer(peer_id.to_string()))?;

        let info = peer.shared.info.lock().clone();
        let link = peer.open_link();
        Ok(ResolvedPeer { info, link })
    }

    async fn cancel_discovery(&self) {
        self.discovery_cancels.fetch_add(1, Ordering::SeqCst);
    }

    fn watch_adapter(&self) -> watch::Receiver<AdapterState> {
        self.adapter_tx.subscribe()
    }

    /// Powering off drops every open link and makes new handshakes fail.
    async fn set_adapter_powered(&self, powered: bool) -> io::Result<()> {
        let state = AdapterState::from_powered(powered);
        if self.powered.swap(powered, Ordering::SeqCst) == powered {
            return Ok(());
        }
        info!("Memory adapter {}", state);

        if !powered {
            let peers: Vec<_> = self.peers.lock().values().cloned().collect();
            for peer in peers {
                peer.power_lost();
            }
        }
        publish_adapter_state(&self.adapter_tx, state);
        Ok(())
    }
}

struct PeerShared {
    info: Mutex<PeerInfo>,
    metadata: Mutex<ServiceMetadata>,
    policy: Mutex<HandshakePolicy>,
    write_error: Mutex<Option<io::ErrorKind>>,
    /// Feeds the most recently opened link.
    inbound: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    /// Links still alive and not closed; pruned on every open.
    links: Mutex<Vec<Weak<MemoryLink>>>,
    links_opened: AtomicUsize,
    adapter_powered: Arc<AtomicBool>,
}

/// Remote side of a [`MemoryTransport`] peer.
#[derive(Clone)]
pub struct MemoryPeer {
    shared: Arc<PeerShared>,
}

impl MemoryPeer {
    fn new(info: PeerInfo, adapter_powered: Arc<AtomicBool>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(PeerShared {
                info: Mutex::new(info),
                metadata: Mutex::new(ServiceMetadata::default()),
                policy: Mutex::new(HandshakePolicy::default()),
                write_error: Mutex::new(None),
                inbound: Mutex::new(None),
                outbound_tx,
                outbound_rx: tokio::sync::Mutex::new(outbound_rx),
                links: Mutex::new(Vec::new()),
                links_opened: AtomicUsize::new(0),
                adapter_powered,
            }),
        }
    }

    fn open_link(&self) -> Arc<MemoryLink> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.inbound.lock() = Some(tx);

        let link = Arc::new(MemoryLink {
            peer: self.shared.clone(),
            signal: CloseSignal::new(),
            connected: AtomicBool::new(false),
            inbound: tokio::sync::Mutex::new(InboundQueue {
                rx,
                pending: Vec::new(),
            }),
        });

        let mut links = self.shared.links.lock();
        links.retain(|weak| weak.upgrade().is_some_and(|link| !link.signal.is_closed()));
        links.push(Arc::downgrade(&link));
        self.shared.links_opened.fetch_add(1, Ordering::SeqCst);
        link
    }

    fn alive_links(&self) -> Vec<Arc<MemoryLink>> {
        self.shared
            .links
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn set_handshake(&self, policy: HandshakePolicy) {
        *self.shared.policy.lock() = policy;
    }

    pub fn set_metadata(&self, metadata: ServiceMetadata) {
        *self.shared.metadata.lock() = metadata;
    }

    pub fn set_vendor_info(&self, vendor_info: &str) {
        self.shared.info.lock().vendor_info = vendor_info.to_string();
    }

    /// Make every write fail with `kind`, or succeed again with `None`.
    pub fn fail_writes(&self, kind: Option<io::ErrorKind>) {
        *self.shared.write_error.lock() = kind;
    }

    /// Queue bytes for the current link. Returns `false` if nothing is listening.
    pub fn push(&self, data: impl Into<Vec<u8>>) -> bool {
        self.send_inbound(Ok(data.into()))
    }

    /// Make the current link's next read fail.
    pub fn fail_read(&self, kind: io::ErrorKind) -> bool {
        self.send_inbound(Err(io::Error::new(kind, "injected read failure")))
    }

    /// End the current link's stream; its reads return `Ok(0)`.
    pub fn hang_up(&self) {
        self.shared.inbound.lock().take();
    }

    /// Fail the open link's reads and abort pending handshakes.
    fn power_lost(&self) {
        self.fail_read(io::ErrorKind::NotConnected);
        for link in self.alive_links() {
            if !link.connected.load(Ordering::SeqCst) {
                link.close();
            }
        }
    }

    fn send_inbound(&self, item: Inbound) -> bool {
        match self.shared.inbound.lock().as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Next chunk written to this peer.
    pub async fn next_written(&self) -> Option<Vec<u8>> {
        self.shared.outbound_rx.lock().await.recv().await
    }

    pub fn try_next_written(&self) -> Option<Vec<u8>> {
        self.shared.outbound_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Links ever opened to this peer.
    pub fn links_opened(&self) -> usize {
        self.shared.links_opened.load(Ordering::SeqCst)
    }

    /// Links not yet closed, whether or not their handshake finished.
    pub fn live_links(&self) -> usize {
        self.alive_links()
            .iter()
            .filter(|link| !link.signal.is_closed())
            .count()
    }

    /// Links with a finished handshake that are still open.
    pub fn open_links(&self) -> usize {
        self.alive_links().iter().filter(|link| link.is_open()).count()
    }

    /// Link entries still tracked for this peer.
    pub fn tracked_links(&self) -> usize {
        self.shared.links.lock().len()
    }
}

struct InboundQueue {
    rx: mpsc::UnboundedReceiver<Inbound>,
    /// Bytes of the last chunk that did not fit the caller's buffer.
    pending: Vec<u8>,
}

impl InboundQueue {
    fn drain_into(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        n
    }
}

struct MemoryLink {
    peer: Arc<PeerShared>,
    signal: CloseSignal,
    connected: AtomicBool,
    inbound: tokio::sync::Mutex<InboundQueue>,
}

impl MemoryLink {
    fn is_open(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.signal.is_closed()
    }
}

#[async_trait]
impl Link for MemoryLink {
    async fn connect(&self) -> io::Result<()> {
        if self.signal.is_closed() {
            return Err(link_closed());
        }
        if !self.peer.adapter_powered.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "adapter powered off",
            ));
        }

        let policy = *self.peer.policy.lock();
        match policy {
            HandshakePolicy::Accept => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            HandshakePolicy::Refuse => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "peer refused connection",
            )),
            HandshakePolicy::Stall => {
                self.signal.closed().await;
                Err(link_closed())
            }
        }
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.inbound.lock().await;
        if self.signal.is_closed() {
            return Err(link_closed());
        }
        if !inbound.pending.is_empty() {
            return Ok(inbound.drain_into(buf));
        }

        let next = tokio::select! {
            biased;
            _ = self.signal.closed() => return Err(link_closed()),
            next = inbound.rx.recv() => next,
        };

        match next {
            Some(Ok(data)) => {
                inbound.pending = data;
                Ok(inbound.drain_into(buf))
            }
            Some(Err(e)) => Err(e),
            None => Ok(0),
        }
    }

    async fn write(&self, data: &[u8]) -> io::Result<()> {
        if self.signal.is_closed() {
            return Err(link_closed());
        }
        if let Some(kind) = *self.peer.write_error.lock() {
            return Err(io::Error::new(kind, "injected write failure"));
        }
        let _ = self.peer.outbound_tx.send(data.to_vec());
        Ok(())
    }

    fn close(&self) {
        if self.signal.close() {
            debug!("Memory link closed");
        }
    }

    async fn service_metadata(&self) -> ServiceMetadata {
        self.peer.metadata.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn resolve(transport: &MemoryTransport, peer_id: &str) -> Arc<dyn Link> {
        match transport.resolve(peer_id).await {
            Ok(resolved) => resolved.link,
            Err(e) => panic!("resolve failed: {e}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_peer_is_invalid() {
        let transport = MemoryTransport::new();
        let result = transport.resolve("nobody").await;
        assert!(matches!(result, Err(ConnectError::InvalidPeer(id)) if id == "nobody"));
    }

    #[tokio::test]
    async fn test_resolve_carries_info() {
        let transport = MemoryTransport::new();
        let peer = transport.add_peer("peerX", "Peer X");
        peer.set_vendor_info("ACME");

        let resolved = transport.resolve("peerX").await.unwrap();
        assert_eq!(resolved.info.display_name, "Peer X");
        assert_eq!(resolved.info.vendor_info, "ACME");
        assert_eq!(peer.links_opened(), 1);
    }

    #[tokio::test]
    async fn test_handshake_policies() {
        let transport = MemoryTransport::new();
        let peer = transport.add_peer("peerX", "Peer X");

        let link = resolve(&transport, "peerX").await;
        link.connect().await.unwrap();
        assert_eq!(peer.open_links(), 1);

        peer.set_handshake(HandshakePolicy::Refuse);
        let link = resolve(&transport, "peerX").await;
        let err = link.connect().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_close_unblocks_stalled_handshake() {
        let transport = MemoryTransport::new();
        let peer = transport.add_peer("peerX", "Peer X");
        peer.set_handshake(HandshakePolicy::Stall);

        let link = resolve(&transport, "peerX").await;
        let pending = {
            let link = link.clone();
            tokio::spawn(async move { link.connect().await })
        };
        tokio::task::yield_now().await;
        link.close();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(peer.live_links(), 0);
    }

    #[tokio::test]
    async fn test_read_splits_large_chunks() {
        let transport = MemoryTransport::new();
        let peer = transport.add_peer("peerX", "Peer X");
        let link = resolve(&transport, "peerX").await;
        link.connect().await.unwrap();

        assert!(peer.push(b"abcdef".to_vec()));
        let mut buf = [0u8; 4];
        assert_eq!(link.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(link.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[tokio::test]
    async fn test_read_errors_and_eof() {
        let transport = MemoryTransport::new();
        let peer = transport.add_peer("peerX", "Peer X");
        let link = resolve(&transport, "peerX").await;
        let mut buf = [0u8; 8];

        peer.fail_read(io::ErrorKind::ConnectionReset);
        let err = link.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);

        peer.hang_up();
        assert_eq!(link.read(&mut buf).await.unwrap(), 0);
        assert!(!peer.push(b"late".to_vec()));
    }

    #[tokio::test]
    async fn test_close_unblocks_read() {
        let transport = MemoryTransport::new();
        let _peer = transport.add_peer("peerX", "Peer X");
        let link = resolve(&transport, "peerX").await;

        let pending = {
            let link = link.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                link.read(&mut buf).await
            })
        };
        tokio::task::yield_now().await;
        link.close();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_writes_are_captured() {
        let transport = MemoryTransport::new();
        let peer = transport.add_peer("peerX", "Peer X");
        let link = resolve(&transport, "peerX").await;

        link.write(b"hello").await.unwrap();
        assert_eq!(peer.next_written().await, Some(b"hello".to_vec()));

        peer.fail_writes(Some(io::ErrorKind::BrokenPipe));
        let err = link.write(b"nope").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(peer.try_next_written(), None);

        link.close();
        peer.fail_writes(None);
        assert!(link.write(b"closed").await.is_err());
    }

    #[tokio::test]
    async fn test_discovery_cancels_counted() {
        let transport = MemoryTransport::new();
        transport.cancel_discovery().await;
        transport.cancel_discovery().await;
        assert_eq!(transport.discovery_cancels(), 2);
    }

    #[tokio::test]
    async fn test_closed_links_are_released() {
        let transport = MemoryTransport::new();
        let peer = transport.add_peer("peerX", "Peer X");

        for _ in 0..5 {
            let link = resolve(&transport, "peerX").await;
            link.connect().await.unwrap();
            link.close();
        }
        let link = resolve(&transport, "peerX").await;

        assert_eq!(peer.links_opened(), 6);
        assert_eq!(peer.tracked_links(), 1);
        assert_eq!(peer.live_links(), 1);

        let weak = Arc::downgrade(&link);
        drop(link);
        assert!(weak.upgrade().is_none());
        assert_eq!(peer.live_links(), 0);
    }

    #[tokio::test]
    async fn test_adapter_power_off() {
        let transport = MemoryTransport::new();
        let peer = transport.add_peer("peerX", "Peer X");
        let mut adapter = transport.watch_adapter();
        assert_eq!(transport.adapter_state(), AdapterState::Enabled);

        let open = resolve(&transport, "peerX").await;
        open.connect().await.unwrap();

        transport.set_adapter_powered(false).await.unwrap();
        adapter.changed().await.unwrap();
        assert_eq!(*adapter.borrow(), AdapterState::Disabled);
        assert_eq!(transport.adapter_state(), AdapterState::Disabled);

        let mut buf = [0u8; 8];
        let err = open.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        let link = resolve(&transport, "peerX").await;
        let err = link.connect().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        transport.set_adapter_powered(true).await.unwrap();
        assert_eq!(transport.adapter_state(), AdapterState::Enabled);
        let link = resolve(&transport, "peerX").await;
        link.connect().await.unwrap();
    }

    #[tokio::test]
    async fn test_power_off_aborts_pending_handshake() {
        let transport = MemoryTransport::new();
        let peer = transport.add_peer("peerX", "Peer X");
        peer.set_handshake(HandshakePolicy::Stall);

        let link = resolve(&transport, "peerX").await;
        let pending = {
            let link = link.clone();
            tokio::spawn(async move { link.connect().await })
        };
        tokio::task::yield_now().await;
        transport.set_adapter_powered(false).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
        assert_eq!(peer.live_links(), 0);
    }
}
