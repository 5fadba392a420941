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

//! Registry of connections keyed by peer id.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::connection::{Connection, Delivery};
use super::event::{ConnectionEvent, EventReceiver, EventSender};
use crate::config::ConnectionConfig;
use crate::error::{ManagerError, ManagerResult};
use crate::link::Transport;

type Registry = Arc<Mutex<HashMap<String, Arc<Connection>>>>;

/// Owns one [`Connection`] per peer and forwards their events.
///
/// Entries are removed once their connection goes idle after a failure,
/// loss or disconnect.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    settings: ConnectionConfig,
    connections: Registry,
    internal_tx: EventSender,
}

impl ConnectionManager {
    /// Create a manager. Events of every managed connection arrive on the
    /// returned receiver.
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: ConnectionConfig,
    ) -> (Self, EventReceiver) {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connections: Registry = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(Self::pump(internal_rx, event_tx, connections.clone()));

        let manager = Self {
            transport,
            settings,
            connections,
            internal_tx,
        };
        (manager, event_rx)
    }

    async fn pump(
        mut internal_rx: EventReceiver,
        event_tx: EventSender,
        connections: Registry,
    ) {
        while let Some(event) = internal_rx.recv().await {
            if event.kind.is_terminal() {
                Self::release_if_idle(&connections, &event);
            }
            if event_tx.send(event).is_err() {
                debug!("Manager event receiver dropped");
            }
        }
    }

    fn release_if_idle(connections: &Registry, event: &ConnectionEvent) {
        let mut connections = connections.lock();
        let idle = connections
            .get(&event.peer_id)
            .map(|connection| !connection.state().is_active())
            .unwrap_or(false);
        if idle {
            connections.remove(&event.peer_id);
            debug!(peer = %event.peer_id, "Released connection");
        }
    }

    /// Connect to `peer_id`, reusing an idle entry for the same peer.
    pub async fn connect(&self, peer_id: &str) -> ManagerResult<()> {
        let (connection, created) = {
            let mut connections = self.connections.lock();
            match connections.get(peer_id) {
                Some(existing) if existing.state().is_active() => {
                    debug!(peer = %peer_id, "Already connecting or connected");
                    return Ok(());
                }
                Some(existing) => (existing.clone(), false),
                None => {
                    let connection = Arc::new(Connection::new(
                        self.transport.clone(),
                        self.internal_tx.clone(),
                        self.settings.clone(),
                    ));
                    connections.insert(peer_id.to_string(), connection.clone());
                    (connection, true)
                }
            }
        };

        info!(peer = %peer_id, reused = !created, "Connect requested");
        let result = connection.connect(peer_id).await;

        let mut connections = self.connections.lock();
        let registered = connections
            .get(peer_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, &connection));
        match result {
            Ok(()) => {
                // The pump may have released the idle entry while the peer
                // was resolving. An idle connection here has already
                // reported its outcome and is not registered again.
                if !registered && connection.state().is_active() {
                    if connections.contains_key(peer_id) {
                        debug!(peer = %peer_id, "Superseded by a newer connection");
                    } else {
                        debug!(peer = %peer_id, "Registering connection again");
                        connections.insert(peer_id.to_string(), connection.clone());
                    }
                }
                Ok(())
            }
            Err(e) => {
                if registered && !connection.state().is_active() {
                    connections.remove(peer_id);
                }
                Err(e.into())
            }
        }
    }

    /// Disconnect `peer_id`. Returns `false` for unknown peers.
    pub fn disconnect(&self, peer_id: &str) -> bool {
        let connection = self.connections.lock().get(peer_id).cloned();
        match connection {
            Some(connection) => {
                info!(peer = %peer_id, "Disconnect requested");
                connection.disconnect();
                true
            }
            None => false,
        }
    }

    /// Send to one peer.
    pub async fn send(&self, peer_id: &str, data: &[u8]) -> ManagerResult<Delivery> {
        let connection = self
            .connections
            .lock()
            .get(peer_id)
            .cloned()
            .ok_or_else(|| ManagerError::PeerNotFound(peer_id.to_string()))?;
        Ok(connection.send(data).await?)
    }

    /// Send to every connected peer. Returns how many writes succeeded.
    pub async fn broadcast(&self, data: &[u8]) -> usize {
        let connections: Vec<_> = self.connections.lock().values().cloned().collect();
        let mut sent = 0;
        for connection in connections {
            match connection.send(data).await {
                Ok(Delivery::Sent) => sent += 1,
                Ok(Delivery::Dropped) => {}
                Err(e) => debug!(peer = ?connection.peer_id(), "Broadcast write failed: {}", e),
            }
        }
        sent
    }

    /// Peer ids with a registered connection, sorted.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<_> = self.connections.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.connections
            .lock()
            .get(peer_id)
            .is_some_and(|connection| connection.is_connected())
    }

    pub fn connection(&self, peer_id: &str) -> Option<Arc<Connection>> {
        self.connections.lock().get(peer_id).cloned()
    }

    /// Destroy every connection. No further events are emitted for them.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.connections.lock().drain().collect();
        info!("Shutting down {} connection(s)", drained.len());
        for (_, connection) in drained {
            connection.destroy();
        }
    }
}
