// Copyright 2026 Bosun Contributors
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

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::SlotId;

/// Kind of compute device exposed by an agent slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Cpu,
    Cuda,
    Rocm,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Cpu => f.write_str("cpu"),
            DeviceType::Cuda => f.write_str("cuda"),
            DeviceType::Rocm => f.write_str("rocm"),
        }
    }
}

/// A single allocatable compute device (GPU, CPU core group, ...) on an agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: SlotId,
    pub brand: String,
    pub uuid: String,
    pub device_type: DeviceType,
}

impl Device {
    pub fn new(id: impl Into<SlotId>, brand: &str, uuid: &str, device_type: DeviceType) -> Self {
        Self {
            id: id.into(),
            brand: brand.to_owned(),
            uuid: uuid.to_owned(),
            device_type,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.id, self.brand, self.device_type)
    }
}
