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

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bosun_common::device::{Device, DeviceType};
use bosun_common::id::{AgentId, ContainerId, SlotId};
use parking_lot::{Mutex, RwLock};

use crate::error::{MetaError, MetaResult};
use crate::rm::informer::NodeSummary;

/// One allocatable slot of an agent, together with its current occupant.
#[derive(Clone, Debug, PartialEq)]
pub struct SlotState {
    pub device: Device,
    pub container_id: Option<ContainerId>,
}

/// Point-in-time view of one agent. Snapshots handed to the scheduler are
/// read-only within a tick; the cache holding them is replaced, never mutated.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentState {
    agent_id: AgentId,
    pub label: Option<String>,
    pub enabled: bool,
    pub draining: bool,
    pub slot_states: BTreeMap<SlotId, SlotState>,
    pub zero_slot_containers: HashSet<ContainerId>,
    pub max_zero_slot_containers: usize,
}

impl AgentState {
    pub fn new(
        agent_id: AgentId,
        label: Option<String>,
        devices: Vec<Device>,
        max_zero_slot_containers: usize,
    ) -> Self {
        let slot_states = devices
            .into_iter()
            .map(|device| {
                (
                    device.id,
                    SlotState {
                        device,
                        container_id: None,
                    },
                )
            })
            .collect();
        Self {
            agent_id,
            label,
            enabled: true,
            draining: false,
            slot_states,
            zero_slot_containers: HashSet::new(),
            max_zero_slot_containers,
        }
    }

    /// Stable copy of the agent id.
    pub fn agent_id(&self) -> AgentId {
        self.agent_id.clone()
    }

    pub fn schedulable(&self) -> bool {
        self.enabled && !self.draining
    }

    pub fn num_slots(&self) -> usize {
        self.slot_states.len()
    }

    pub fn num_used_slots(&self) -> usize {
        self.slot_states
            .values()
            .filter(|s| s.container_id.is_some())
            .count()
    }

    pub fn num_empty_slots(&self) -> usize {
        self.num_slots() - self.num_used_slots()
    }

    pub fn num_zero_slot_containers_free(&self) -> usize {
        self.max_zero_slot_containers
            .saturating_sub(self.zero_slot_containers.len())
    }

    pub fn idle(&self) -> bool {
        self.num_used_slots() == 0 && self.zero_slot_containers.is_empty()
    }

    /// The device kind this agent exposes. Agents are homogeneous; mixed-device
    /// agents are not modeled.
    pub fn device_type(&self) -> Option<DeviceType> {
        self.slot_states.values().next().map(|s| s.device.device_type)
    }

    /// Free slot ids in slot order, skipping `exclude`.
    pub fn free_slots(&self, exclude: &HashSet<SlotId>) -> Vec<SlotId> {
        self.slot_states
            .iter()
            .filter(|(id, s)| s.container_id.is_none() && !exclude.contains(id))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Reserves `slots` devices (or an aux container when `slots == 0`) for
    /// `container_id`. Fails without mutating when the agent cannot satisfy
    /// the reservation.
    pub fn allocate_slots(
        &mut self,
        slots: usize,
        exclude: &HashSet<SlotId>,
        container_id: &ContainerId,
    ) -> MetaResult<Vec<Device>> {
        if slots == 0 {
            if self.num_zero_slot_containers_free() == 0 {
                return Err(MetaError::reserve(
                    self.agent_id(),
                    "no free aux container capacity",
                ));
            }
            self.zero_slot_containers.insert(container_id.clone());
            return Ok(vec![]);
        }

        let free = self.free_slots(exclude);
        if free.len() < slots {
            return Err(MetaError::reserve(
                self.agent_id(),
                format!("{} free slots, {} requested", free.len(), slots),
            ));
        }
        let mut devices = Vec::with_capacity(slots);
        for slot_id in free.into_iter().take(slots) {
            let slot = self
                .slot_states
                .get_mut(&slot_id)
                .expect("free slot listed above");
            slot.container_id = Some(container_id.clone());
            devices.push(slot.device.clone());
        }
        Ok(devices)
    }

    /// Frees everything held by `container_id`. Idempotent.
    pub fn deallocate_container(&mut self, container_id: &ContainerId) {
        for slot in self.slot_states.values_mut() {
            if slot.container_id.as_ref() == Some(container_id) {
                slot.container_id = None;
            }
        }
        self.zero_slot_containers.remove(container_id);
    }

    /// Merges metadata and device inventory reported by the cluster substrate.
    /// Reservations made through the pool are preserved; container bindings the
    /// substrate reports are added, never cleared (removal flows through
    /// deallocation or agent loss).
    fn merge_node(&mut self, node: &NodeSummary) {
        self.label = node.label.clone();
        self.enabled = node.enabled;
        self.draining = node.draining;
        self.max_zero_slot_containers = node.max_zero_slot_containers;

        let reported: HashSet<SlotId> = node.devices.iter().map(|d| d.id).collect();
        self.slot_states.retain(|id, _| reported.contains(id));
        for device in &node.devices {
            self.slot_states.entry(device.id).or_insert_with(|| SlotState {
                device: device.clone(),
                container_id: None,
            });
        }
        for (container_id, slot_ids) in &node.containers {
            for slot_id in slot_ids {
                if let Some(slot) = self.slot_states.get_mut(slot_id) {
                    slot.container_id = Some(container_id.clone());
                }
            }
        }
    }
}

/// Live handle to one agent. The pool reserves and frees devices through it;
/// the informer updates it as the substrate reports changes.
pub struct Agent {
    id: AgentId,
    state: Mutex<AgentState>,
}

impl Agent {
    pub fn new(state: AgentState) -> Self {
        Self {
            id: state.agent_id(),
            state: Mutex::new(state),
        }
    }

    /// Stable copy of the agent id.
    pub fn id(&self) -> AgentId {
        self.id.clone()
    }

    pub fn state_snapshot(&self) -> AgentState {
        self.state.lock().clone()
    }

    pub fn allocate_free_devices(
        &self,
        slots: usize,
        exclude: &HashSet<SlotId>,
        container_id: &ContainerId,
    ) -> MetaResult<Vec<Device>> {
        self.state.lock().allocate_slots(slots, exclude, container_id)
    }

    pub fn deallocate_container(&self, container_id: &ContainerId) {
        self.state.lock().deallocate_container(container_id);
    }

    pub fn update_from(&self, node: &NodeSummary) {
        self.state.lock().merge_node(node);
    }
}

/// Registry of live agents, written by the informer and read by the pools.
#[derive(Clone, Default)]
pub struct AgentService {
    agents: Arc<RwLock<HashMap<AgentId, Arc<Agent>>>>,
}

impl AgentService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &AgentId) -> Option<Arc<Agent>> {
        self.agents.read().get(id).cloned()
    }

    /// Fresh by-id snapshot of every agent, built once per scheduling tick.
    pub fn list_states(&self) -> HashMap<AgentId, AgentState> {
        self.agents
            .read()
            .iter()
            .map(|(id, agent)| (id.clone(), agent.state_snapshot()))
            .collect()
    }

    pub fn upsert(&self, node: &NodeSummary) {
        let mut agents = self.agents.write();
        match agents.get(&node.agent_id) {
            Some(agent) => agent.update_from(node),
            None => {
                let mut state = AgentState::new(
                    node.agent_id.clone(),
                    node.label.clone(),
                    node.devices.clone(),
                    node.max_zero_slot_containers,
                );
                state.enabled = node.enabled;
                state.draining = node.draining;
                let agent = Agent::new(state);
                agent.update_from(node);
                agents.insert(node.agent_id.clone(), Arc::new(agent));
            }
        }
    }

    pub fn remove(&self, id: &AgentId) -> Option<Arc<Agent>> {
        self.agents.write().remove(id)
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use bosun_common::device::{Device, DeviceType};

    pub(crate) fn cuda_devices(n: usize) -> Vec<Device> {
        (0..n)
            .map(|i| Device::new(i as i32, "nvidia", &format!("gpu-{i}"), DeviceType::Cuda))
            .collect()
    }

    pub(crate) fn cpu_devices(n: usize) -> Vec<Device> {
        (0..n)
            .map(|i| Device::new(i as i32, "intel", &format!("cpu-{i}"), DeviceType::Cpu))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::test_utils::cuda_devices;
    use super::*;

    fn agent_state(id: &str, slots: usize) -> AgentState {
        AgentState::new(AgentId::from(id), None, cuda_devices(slots), 10)
    }

    #[test]
    fn test_allocate_and_deallocate() {
        let mut state = agent_state("a0", 4);
        let cid = ContainerId::new_random();
        let devices = state
            .allocate_slots(2, &HashSet::new(), &cid)
            .unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(state.num_empty_slots(), 2);

        state.deallocate_container(&cid);
        assert_eq!(state.num_empty_slots(), 4);
    }

    #[test]
    fn test_allocate_insufficient_slots_is_untouched() {
        let mut state = agent_state("a0", 2);
        let cid = ContainerId::new_random();
        let err = state.allocate_slots(3, &HashSet::new(), &cid).unwrap_err();
        assert_matches!(err, MetaError::Reserve { .. });
        assert_eq!(state.num_empty_slots(), 2);
    }

    #[test]
    fn test_blacklisted_slots_are_skipped() {
        let mut state = agent_state("a0", 3);
        let exclude: HashSet<SlotId> = [SlotId(0)].into_iter().collect();
        let cid = ContainerId::new_random();
        let devices = state.allocate_slots(2, &exclude, &cid).unwrap();
        assert!(devices.iter().all(|d| d.id != SlotId(0)));
    }

    #[test]
    fn test_zero_slot_capacity() {
        let mut state = agent_state("a0", 1);
        state.max_zero_slot_containers = 1;
        let c1 = ContainerId::new_random();
        let c2 = ContainerId::new_random();
        state.allocate_slots(0, &HashSet::new(), &c1).unwrap();
        let err = state.allocate_slots(0, &HashSet::new(), &c2).unwrap_err();
        assert_matches!(err, MetaError::Reserve { .. });
    }

    #[test]
    fn test_service_snapshot_is_detached() {
        let service = AgentService::new();
        let agent = Arc::new(Agent::new(agent_state("a0", 2)));
        service.agents.write().insert(agent.id(), agent.clone());

        let states = service.list_states();
        let cid = ContainerId::new_random();
        agent
            .allocate_free_devices(1, &HashSet::new(), &cid)
            .unwrap();
        // The earlier snapshot does not observe the reservation.
        assert_eq!(states[&AgentId::from("a0")].num_empty_slots(), 2);
        assert_eq!(service.list_states()[&AgentId::from("a0")].num_empty_slots(), 1);
    }
}
