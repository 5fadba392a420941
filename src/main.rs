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

//! btserial terminal

use anyhow::{bail, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use btserial::bluetooth::{ConnectionManager, EventKind};
use btserial::cli::{Cli, TerminalCommand};
use btserial::config::{BluetoothConfig, Config};
use btserial::events::EventPrinter;
use btserial::link::{MemoryTransport, RfcommTransport, Transport};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // Logs go to stderr so stdout carries only peer traffic
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(cli.log_directive().parse()?),
        )
        .init();

    info!("Starting btserial v{}...", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    cli.apply(&mut config);
    config.validate()?;
    info!("Configuration loaded");

    let transport = if cli.loopback {
        info!("Using loopback peers");
        loopback_transport(&cli.peers)
    } else {
        rfcomm_transport(&config.bluetooth).await?
    };

    let mut adapter = transport.watch_adapter();
    info!("Bluetooth adapter {}", *adapter.borrow_and_update());

    let (manager, mut events) =
        ConnectionManager::new(transport.clone(), config.connection.clone());
    for peer in &cli.peers {
        if let Err(e) = manager.connect(peer).await {
            error!(peer = %peer, "Cannot connect: {}", e);
        }
    }
    if manager.peers().is_empty() {
        bail!("none of the given peers could be connected");
    }

    let printer = EventPrinter::new(&config.terminal).with_sent(cli.echo_sent);
    let line_ending = config.terminal.line_ending;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut watching_adapter = true;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if let Some(command) = TerminalCommand::parse(&line) {
                            run_command(transport.as_ref(), &printer, command).await?;
                            continue;
                        }
                        let mut data = line.into_bytes();
                        data.extend_from_slice(line_ending.as_bytes());
                        if manager.broadcast(&data).await == 0 {
                            warn!("No connected peer, input dropped");
                        }
                    }
                    None => {
                        info!("Input closed");
                        break;
                    }
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if event.kind == EventKind::Connected {
                    check_service(&manager, &event.peer_id, &config.bluetooth.service_uuid);
                }
                if let Some(line) = printer.render(&event)? {
                    println!("{}", line);
                }
                if event.kind.is_terminal() && manager.peers().is_empty() {
                    info!("No peers left");
                    break;
                }
            }
            changed = adapter.changed(), if watching_adapter => {
                if changed.is_err() {
                    warn!("Adapter state is no longer reported");
                    watching_adapter = false;
                    continue;
                }
                let state = *adapter.borrow_and_update();
                println!("{}", printer.render_adapter(state)?);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    manager.shutdown();
    info!("btserial stopped");
    Ok(())
}

async fn run_command(
    transport: &dyn Transport,
    printer: &EventPrinter,
    command: TerminalCommand,
) -> Result<()> {
    match command {
        TerminalCommand::SetAdapter(powered) => {
            // The resulting change is printed by the adapter watch
            if let Err(e) = transport.set_adapter_powered(powered).await {
                error!("Cannot switch adapter power: {}", e);
            }
        }
        TerminalCommand::AdapterState => {
            println!("{}", printer.render_adapter(transport.adapter_state())?);
        }
    }
    Ok(())
}

/// Warn when a peer does not advertise the service we expect to talk to.
fn check_service(manager: &ConnectionManager, peer_id: &str, service: &Uuid) {
    let Some(capabilities) = manager
        .connection(peer_id)
        .and_then(|connection| connection.peer_capabilities())
    else {
        return;
    };
    // Nothing advertised usually means SDP was never browsed
    if !capabilities.advertised_capability_ids.is_empty() && !capabilities.advertises(service) {
        warn!(
            peer = %peer_id,
            class = capabilities.major_device_class.label(),
            "Peer does not advertise service {}",
            service
        );
    }
}

async fn rfcomm_transport(config: &BluetoothConfig) -> Result<Arc<dyn Transport>> {
    let transport = RfcommTransport::new(config.adapter.as_deref(), config.rfcomm_channel).await?;
    info!(
        "Using adapter {} on RFCOMM channel {}",
        transport.address().await?,
        config.rfcomm_channel
    );
    Ok(Arc::new(transport))
}

/// Peers that write back whatever they receive.
fn loopback_transport(peers: &[String]) -> Arc<dyn Transport> {
    let transport = MemoryTransport::new();
    for peer_id in peers {
        let peer = transport.add_peer(peer_id, &format!("Loopback {}", peer_id));
        tokio::spawn(async move {
            while let Some(data) = peer.next_written().await {
                peer.push(data);
            }
        });
    }
    Arc::new(transport)
}
