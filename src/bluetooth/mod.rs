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

//! Bluetooth serial connections.
//!
//! A [`Connection`] drives one peer through connect, read/write and
//! disconnect, reporting everything as [`ConnectionEvent`]s. The
//! [`ConnectionManager`] keeps one connection per peer.

mod connect_worker;
mod connection;
mod device_class;
mod event;
mod manager;
mod session;

pub use connection::{Connection, Delivery};
pub use device_class::{MajorDeviceClass, ServiceClass, ServiceMetadata, SPP_UUID};
pub use event::{ConnectionEvent, EventKind, EventReceiver, EventSender};
pub use manager::ConnectionManager;
