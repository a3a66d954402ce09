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

use serde::Deserialize;

use crate::rm::fitting::SoftConstraint;

/// Priority assigned to a group when the pool's priority scheduler has no
/// explicit default configured.
pub const DEFAULT_SCHEDULING_PRIORITY: i32 = 42;

fn default_max_aux_containers_per_agent() -> usize {
    100
}

fn default_priority() -> i32 {
    DEFAULT_SCHEDULING_PRIORITY
}

fn default_max_instances() -> usize {
    5
}

/// Static configuration of one resource pool.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourcePoolConfig {
    pub pool_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default = "default_max_aux_containers_per_agent")]
    pub max_aux_containers_per_agent: usize,
    #[serde(default)]
    pub provider: Option<ProviderConfig>,
}

impl ResourcePoolConfig {
    pub fn new(pool_name: impl Into<String>) -> Self {
        Self {
            pool_name: pool_name.into(),
            description: String::new(),
            scheduler: SchedulerConfig::default(),
            max_aux_containers_per_agent: default_max_aux_containers_per_agent(),
            provider: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(rename = "type", default)]
    pub kind: SchedulerKind,
    #[serde(default)]
    pub fitting_policy: SoftConstraint,
    #[serde(default)]
    pub allow_heterogeneous_fits: bool,
    #[serde(default)]
    pub priority: Option<PrioritySchedulerConfig>,
}

impl SchedulerConfig {
    /// The default priority for groups in this pool, when priority scheduling
    /// is in effect.
    pub fn default_priority(&self) -> i32 {
        self.priority
            .as_ref()
            .map(|p| p.default_priority)
            .unwrap_or(DEFAULT_SCHEDULING_PRIORITY)
    }

    pub fn preemption_enabled(&self) -> bool {
        self.priority.as_ref().is_some_and(|p| p.preemption)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    #[default]
    FairShare,
    Priority,
    RoundRobin,
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerKind::FairShare => f.write_str("fair_share"),
            SchedulerKind::Priority => f.write_str("priority"),
            SchedulerKind::RoundRobin => f.write_str("round_robin"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrioritySchedulerConfig {
    #[serde(default = "default_priority")]
    pub default_priority: i32,
    #[serde(default)]
    pub preemption: bool,
}

impl Default for PrioritySchedulerConfig {
    fn default() -> Self {
        Self {
            default_priority: default_priority(),
            preemption: false,
        }
    }
}

/// Autoscaling provisioner block. At most one provider may be set.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    #[serde(default)]
    pub aws: Option<InstanceTypeConfig>,
    #[serde(default)]
    pub gcp: Option<InstanceTypeConfig>,
}

impl ProviderConfig {
    /// Slot count of a single freshly provisioned instance, or zero when no
    /// provider is configured in enough detail to know.
    pub fn slots_per_instance(&self) -> usize {
        self.aws
            .as_ref()
            .or(self.gcp.as_ref())
            .map(|t| t.slots_per_instance)
            .unwrap_or(0)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceTypeConfig {
    #[serde(default)]
    pub instance_type: String,
    pub slots_per_instance: usize,
}
