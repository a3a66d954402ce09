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
use uuid::Uuid;

macro_rules! def_str_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(
            Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

def_str_id! {
    /// Identifies one accepted resource request for its whole lifetime. Never reused.
    AllocationId
}

def_str_id! {
    /// Identifies the task (experiment trial, command, shell, ...) behind a request.
    TaskId
}

def_str_id! {
    /// Identifies the job a set of requests belongs to; scheduling policy is carried per job.
    JobId
}

def_str_id! {
    /// Identifies an agent machine in the fleet.
    AgentId
}

def_str_id! {
    /// Identifies a running container on an agent.
    ContainerId
}

def_str_id! {
    /// Identifies one portion of an allocation, i.e. one container's worth of resources.
    ResourceId
}

impl AllocationId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl ContainerId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl From<&ContainerId> for ResourceId {
    fn from(id: &ContainerId) -> Self {
        Self(id.as_str().to_owned())
    }
}

/// Index of a single allocatable device slot on an agent.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SlotId(pub i32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for SlotId {
    fn from(id: i32) -> Self {
        SlotId(id)
    }
}

/// Permission scope of a streamable row. Scope `0` is reserved for global access.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AccessScopeId(pub i32);

impl AccessScopeId {
    /// The scope granting visibility into every workspace.
    pub const GLOBAL: AccessScopeId = AccessScopeId(0);
}

impl fmt::Display for AccessScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_unique() {
        assert_ne!(AllocationId::new_random(), AllocationId::new_random());
        assert_ne!(ContainerId::new_random(), ContainerId::new_random());
    }

    #[test]
    fn test_resource_id_from_container_id() {
        let cid = ContainerId::from("c-1");
        assert_eq!(ResourceId::from(&cid).as_str(), "c-1");
    }

    #[test]
    fn test_serde_transparent() {
        let id = JobId::from("job-7");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"job-7\"");
        assert_eq!(serde_json::from_str::<JobId>("\"job-7\"").unwrap(), id);
    }
}
