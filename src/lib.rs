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

//! Bluetooth RFCOMM serial connections.
//!
//! A [`bluetooth::Connection`] manages the lifecycle of one peer: connect,
//! read/write, disconnect. Progress is reported as
//! [`bluetooth::ConnectionEvent`]s on a channel supplied by the caller.

pub mod bluetooth;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod link;
pub mod state;
