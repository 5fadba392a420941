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

//! Connect handshake task.

use std::sync::Arc;
use tracing::debug;

use super::connection::Shared;
use crate::link::Link;

/// Handle to an in-flight connect attempt, held in the controller's slot.
pub(crate) struct ConnectTask {
    attempt: u64,
    link: Arc<dyn Link>,
}

impl ConnectTask {
    /// Start the handshake for `attempt`. The task reports back to the
    /// controller exactly once, success or failure.
    pub(crate) fn spawn(attempt: u64, link: Arc<dyn Link>, controller: Arc<Shared>) -> Self {
        let worker_link = link.clone();
        tokio::spawn(async move {
            run(attempt, worker_link, controller).await;
        });
        Self { attempt, link }
    }

    pub(crate) fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Close the link so the pending handshake fails.
    pub(crate) fn cancel(&self) {
        debug!(attempt = self.attempt, "Cancelling connect attempt");
        self.link.close();
    }
}

async fn run(attempt: u64, link: Arc<dyn Link>, controller: Arc<Shared>) {
    debug!(attempt, "Connect worker started");

    controller.transport().cancel_discovery().await;

    match link.connect().await {
        Ok(()) => {
            debug!(attempt, "Handshake complete");
            controller.handshake_succeeded(attempt, link);
        }
        Err(e) => {
            // Half-open link; close errors are not reported
            link.close();
            controller.handshake_failed(attempt, e);
        }
    }

    debug!(attempt, "Connect worker finished");
}
