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

//! Bluetooth RFCOMM transport backed by BlueZ.

use anyhow::Result;
use async_trait::async_trait;
use bluer::rfcomm::stream::{OwnedReadHalf, OwnedWriteHalf};
use bluer::rfcomm::{SocketAddr, Stream};
use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, Device, Session};
use futures::{pin_mut, Stream as EventStream, StreamExt};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::{
    link_closed, publish_adapter_state, AdapterState, CloseSignal, Link, PeerInfo, ResolvedPeer,
    Transport,
};
use crate::bluetooth::ServiceMetadata;
use crate::error::ConnectError;

/// Reaches peers by Bluetooth address over RFCOMM.
pub struct RfcommTransport {
    _session: Session,
    adapter: Adapter,
    channel: u8,
    adapter_tx: Arc<watch::Sender<AdapterState>>,
}

impl RfcommTransport {
    /// Open a BlueZ session on `adapter_name` (or the default adapter).
    pub async fn new(adapter_name: Option<&str>, channel: u8) -> Result<Self> {
        info!("Initializing RFCOMM transport...");

        let session = Session::new().await?;
        debug!("BlueZ session created");

        let adapter = match adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        let state = AdapterState::from_powered(adapter.is_powered().await?);
        let (adapter_tx, _) = watch::channel(state);
        let adapter_tx = Arc::new(adapter_tx);
        tokio::spawn(watch_power(adapter.clone(), adapter_tx.clone()));

        Ok(Self {
            _session: session,
            adapter,
            channel,
            adapter_tx,
        })
    }

    /// Address of the local adapter.
    pub async fn address(&self) -> Result<Address> {
        Ok(self.adapter.address().await?)
    }
}

#[async_trait]
impl Transport for RfcommTransport {
    async fn resolve(&self, peer_id: &str) -> Result<ResolvedPeer, ConnectError> {
        let address: Address = peer_id
            .parse()
            .map_err(|_| ConnectError::InvalidPeer(peer_id.to_string()))?;
        let device = self.adapter.device(address).map_err(|e| {
            warn!("No device for {}: {}", address, e);
            ConnectError::InvalidPeer(peer_id.to_string())
        })?;

        let display_name = device.alias().await.unwrap_or_default();
        let vendor_info = match device.modalias().await {
            Ok(Some(modalias)) => format!(
                "{} vendor {:04x} product {:04x}",
                modalias.source, modalias.vendor, modalias.product
            ),
            _ => String::new(),
        };

        let link = RfcommLink {
            device,
            target: SocketAddr::new(address, self.channel),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            signal: CloseSignal::new(),
        };

        Ok(ResolvedPeer {
            info: PeerInfo {
                peer_id: peer_id.to_string(),
                display_name,
                vendor_info,
            },
            link: Arc::new(link),
        })
    }

    async fn cancel_discovery(&self) {
        // BlueZ discovery sessions belong to whoever started them
        match self.adapter.is_discovering().await {
            Ok(true) => debug!("Adapter is discovering, connect may be slow"),
            Ok(false) => {}
            Err(e) => debug!("Could not query discovery state: {}", e),
        }
    }

    fn watch_adapter(&self) -> watch::Receiver<AdapterState> {
        self.adapter_tx.subscribe()
    }

    async fn set_adapter_powered(&self, powered: bool) -> io::Result<()> {
        info!("Setting adapter {} powered={}", self.adapter.name(), powered);
        self.adapter
            .set_powered(powered)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        // The property change also arrives through the event stream
        publish_adapter_state(&self.adapter_tx, AdapterState::from_powered(powered));
        Ok(())
    }
}

/// Publish `Powered` property changes until the adapter goes away.
async fn watch_power(adapter: Adapter, adapter_tx: Arc<watch::Sender<AdapterState>>) {
    let events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("Cannot follow adapter events: {}", e);
            return;
        }
    };
    // Catch changes between the initial query and the subscription
    if let Ok(powered) = adapter.is_powered().await {
        publish_adapter_state(&adapter_tx, AdapterState::from_powered(powered));
    }
    pump_power_events(events, &adapter_tx).await;
}

async fn pump_power_events(
    events: impl EventStream<Item = AdapterEvent>,
    adapter_tx: &watch::Sender<AdapterState>,
) {
    pin_mut!(events);
    while let Some(event) = events.next().await {
        if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
            let state = AdapterState::from_powered(powered);
            if publish_adapter_state(adapter_tx, state) {
                info!("Bluetooth adapter {}", state);
            }
        }
    }
    debug!("Adapter event stream ended");
}

struct RfcommLink {
    device: Device,
    target: SocketAddr,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    signal: CloseSignal,
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "RFCOMM stream not connected")
}

#[async_trait]
impl Link for RfcommLink {
    async fn connect(&self) -> io::Result<()> {
        if self.signal.is_closed() {
            return Err(link_closed());
        }

        debug!("Connecting RFCOMM stream to {:?}", self.target);
        let stream = tokio::select! {
            biased;
            _ = self.signal.closed() => return Err(link_closed()),
            stream = Stream::connect(self.target) => stream?,
        };

        let (reader, writer) = stream.into_split();
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);

        // close() may have run while the halves were being installed
        if self.signal.is_closed() {
            self.reader.lock().await.take();
            self.writer.lock().await.take();
            return Err(link_closed());
        }
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.reader.lock().await;
        if self.signal.is_closed() {
            guard.take();
            return Err(link_closed());
        }

        let outcome = {
            let reader = guard.as_mut().ok_or_else(not_connected)?;
            tokio::select! {
                biased;
                _ = self.signal.closed() => None,
                read = reader.read(buf) => Some(read),
            }
        };

        match outcome {
            Some(read) => read,
            None => {
                guard.take();
                Err(link_closed())
            }
        }
    }

    async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        if self.signal.is_closed() {
            guard.take();
            return Err(link_closed());
        }

        let outcome = {
            let writer = guard.as_mut().ok_or_else(not_connected)?;
            tokio::select! {
                biased;
                _ = self.signal.closed() => None,
                written = async {
                    writer.write_all(data).await?;
                    writer.flush().await
                } => Some(written),
            }
        };

        match outcome {
            Some(written) => written,
            None => {
                guard.take();
                Err(link_closed())
            }
        }
    }

    fn close(&self) {
        if !self.signal.close() {
            return;
        }
        debug!("Closing RFCOMM link to {:?}", self.target);

        // Halves held by a pending call are dropped when that call wakes up
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }

    async fn service_metadata(&self) -> ServiceMetadata {
        let class = match self.device.class().await {
            Ok(class) => class.unwrap_or_default(),
            Err(e) => {
                debug!("Device class unavailable: {}", e);
                0
            }
        };
        let uuids = match self.device.uuids().await {
            Ok(uuids) => uuids.unwrap_or_default(),
            Err(e) => {
                debug!("Device UUIDs unavailable: {}", e);
                Default::default()
            }
        };
        ServiceMetadata::from_class_of_device(class, uuids)
    }
}
