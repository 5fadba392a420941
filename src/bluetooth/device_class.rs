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

//! Class of Device decoding and the service metadata exposed per peer.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Standard Serial Port Profile UUID.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// Major device class (bits 8..12 of the Class of Device).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MajorDeviceClass {
    Misc,
    Computer,
    Phone,
    Networking,
    AudioVideo,
    Peripheral,
    Imaging,
    Wearable,
    Toy,
    Health,
    Uncategorized,
    #[default]
    Unknown,
}

impl MajorDeviceClass {
    pub fn from_class_of_device(cod: u32) -> Self {
        match (cod >> 8) & 0x1F {
            0x00 => MajorDeviceClass::Misc,
            0x01 => MajorDeviceClass::Computer,
            0x02 => MajorDeviceClass::Phone,
            0x03 => MajorDeviceClass::Networking,
            0x04 => MajorDeviceClass::AudioVideo,
            0x05 => MajorDeviceClass::Peripheral,
            0x06 => MajorDeviceClass::Imaging,
            0x07 => MajorDeviceClass::Wearable,
            0x08 => MajorDeviceClass::Toy,
            0x09 => MajorDeviceClass::Health,
            0x1F => MajorDeviceClass::Uncategorized,
            _ => MajorDeviceClass::Unknown,
        }
    }

    /// Short human readable name.
    pub fn label(&self) -> &'static str {
        match self {
            MajorDeviceClass::Misc => "Misc",
            MajorDeviceClass::Computer => "PC",
            MajorDeviceClass::Phone => "Phone",
            MajorDeviceClass::Networking => "Networking",
            MajorDeviceClass::AudioVideo => "AV",
            MajorDeviceClass::Peripheral => "Peripheral",
            MajorDeviceClass::Imaging => "Imaging",
            MajorDeviceClass::Wearable => "Wearable",
            MajorDeviceClass::Toy => "Toy",
            MajorDeviceClass::Health => "Health",
            MajorDeviceClass::Uncategorized => "Uncategorized",
            MajorDeviceClass::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for MajorDeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Major service class (one bit each in bits 13..23 of the Class of Device).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceClass {
    LimitedDiscoverability,
    Positioning,
    Networking,
    Render,
    Capture,
    ObjectTransfer,
    Audio,
    Telephony,
    Information,
}

const SERVICE_CLASS_BITS: [(u32, ServiceClass); 9] = [
    (1 << 13, ServiceClass::LimitedDiscoverability),
    (1 << 16, ServiceClass::Positioning),
    (1 << 17, ServiceClass::Networking),
    (1 << 18, ServiceClass::Render),
    (1 << 19, ServiceClass::Capture),
    (1 << 20, ServiceClass::ObjectTransfer),
    (1 << 21, ServiceClass::Audio),
    (1 << 22, ServiceClass::Telephony),
    (1 << 23, ServiceClass::Information),
];

impl ServiceClass {
    /// All service classes whose bit is set in `cod`.
    pub fn from_class_of_device(cod: u32) -> BTreeSet<ServiceClass> {
        SERVICE_CLASS_BITS
            .iter()
            .filter(|(bit, _)| cod & bit != 0)
            .map(|(_, class)| *class)
            .collect()
    }

    pub fn label(&self) -> &'static str {
        match self {
            ServiceClass::LimitedDiscoverability => "Limited Discoverability",
            ServiceClass::Positioning => "Positioning",
            ServiceClass::Networking => "Networking",
            ServiceClass::Render => "Render",
            ServiceClass::Capture => "Capture",
            ServiceClass::ObjectTransfer => "Transfer",
            ServiceClass::Audio => "Audio",
            ServiceClass::Telephony => "Telephony",
            ServiceClass::Information => "Information",
        }
    }
}

impl fmt::Display for ServiceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Capabilities a peer advertises, captured once per `connect()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceMetadata {
    pub major_device_class: MajorDeviceClass,
    pub major_service_classes: BTreeSet<ServiceClass>,
    pub advertised_capability_ids: BTreeSet<Uuid>,
}

impl ServiceMetadata {
    /// Build metadata from a raw Class of Device and the advertised UUIDs.
    pub fn from_class_of_device(cod: u32, uuids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            major_device_class: MajorDeviceClass::from_class_of_device(cod),
            major_service_classes: ServiceClass::from_class_of_device(cod),
            advertised_capability_ids: uuids.into_iter().collect(),
        }
    }

    pub fn advertises(&self, uuid: &Uuid) -> bool {
        self.advertised_capability_ids.contains(uuid)
    }

    pub fn supports_serial_port(&self) -> bool {
        self.advertises(&SPP_UUID)
    }
}
