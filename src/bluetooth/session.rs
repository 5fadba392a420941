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

//! Read/write session over an open link.

use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::connection::Shared;
use super::event::{EventKind, Notifier};
use crate::link::Link;

/// Owns the open link of a connected peer.
///
/// A read failure is a connection loss unless `close()` ran first; after a
/// deliberate close the failure is expected and nothing is reported.
pub(crate) struct Session {
    attempt: u64,
    link: Arc<dyn Link>,
    notifier: Notifier,
    /// Set by `close()` only.
    closed_deliberately: AtomicBool,
    /// Set by `close()` and `cancel()`; stops data delivery. Held while
    /// emitting data events so none can follow the teardown.
    shut: Mutex<bool>,
}

impl Session {
    pub(crate) fn new(attempt: u64, link: Arc<dyn Link>, notifier: Notifier) -> Arc<Self> {
        Arc::new(Self {
            attempt,
            link,
            notifier,
            closed_deliberately: AtomicBool::new(false),
            shut: Mutex::new(false),
        })
    }

    pub(crate) fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Spawn the read loop.
    pub(crate) fn start_reader(self: &Arc<Self>, controller: Arc<Shared>, buffer_size: usize) {
        let session = self.clone();
        tokio::spawn(async move {
            session.read_loop(controller, buffer_size).await;
        });
    }

    async fn read_loop(self: Arc<Self>, controller: Arc<Shared>, buffer_size: usize) {
        debug!(attempt = self.attempt, "Read loop started");
        let mut buf = vec![0u8; buffer_size.max(1)];

        loop {
            match self.link.read(&mut buf).await {
                Ok(0) => {
                    info!(attempt = self.attempt, "Stream closed by remote");
                    let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "end of stream");
                    self.read_failed(&controller, eof);
                    break;
                }
                Ok(n) => {
                    if !self.emit_unless_shut(EventKind::DataReceived(buf[..n].to_vec())) {
                        break;
                    }
                }
                Err(e) => {
                    self.read_failed(&controller, e);
                    break;
                }
            }
        }

        debug!(attempt = self.attempt, "Read loop finished");
    }

    fn read_failed(&self, controller: &Shared, error: io::Error) {
        if self.closed_deliberately.load(Ordering::SeqCst) {
            debug!(attempt = self.attempt, "Read ended after close: {}", error);
            return;
        }
        controller.session_lost(self.attempt, error);
    }

    /// Write all of `data`, then emit `DataSent`. Failures leave the session up.
    ///
    /// Nothing is emitted if the session was shut while the write was in
    /// flight, so `DataSent` never follows `Disconnected`.
    pub(crate) async fn write(&self, data: &[u8]) -> io::Result<()> {
        self.link.write(data).await?;
        if !self.emit_unless_shut(EventKind::DataSent(data.to_vec())) {
            debug!(attempt = self.attempt, "Write finished after close");
        }
        Ok(())
    }

    fn emit_unless_shut(&self, kind: EventKind) -> bool {
        let shut = self.shut.lock();
        if *shut {
            return false;
        }
        self.notifier.emit(kind);
        true
    }

    /// Deliberate close: the resulting read failure is not a loss.
    pub(crate) fn close(&self) {
        if !self.closed_deliberately.swap(true, Ordering::SeqCst) {
            debug!(attempt = self.attempt, "Closing session");
        }
        self.cancel();
    }

    /// Close the link without marking the close as deliberate.
    pub(crate) fn cancel(&self) {
        *self.shut.lock() = true;
        self.link.close();
    }
}
