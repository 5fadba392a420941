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

//! Error types returned by the connection API.
//!
//! Handshake failures and read-path losses never show up here: they are
//! reported asynchronously as notifications.

use std::io;
use thiserror::Error;

/// Errors returned synchronously from `connect()`.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The transport could not turn the peer id into a connectable handle.
    #[error("Invalid peer: {0}")]
    InvalidPeer(String),

    /// The connection is already bound to another peer.
    #[error("Connection is bound to {bound}, cannot connect to {requested}")]
    PeerMismatch { bound: String, requested: String },

    /// `destroy()` was called on this connection.
    #[error("Connection destroyed")]
    Destroyed,
}

/// Errors returned from `send()`.
#[derive(Debug, Error)]
pub enum SendError {
    /// The transport rejected the write. The session stays up.
    #[error("Write failed: {0}")]
    Write(#[from] io::Error),
}

/// Errors returned by the connection manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// No connection is registered for this peer.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Send(#[from] SendError),
}

/// Result type for manager operations.
pub type ManagerResult<T> = Result<T, ManagerError>;
