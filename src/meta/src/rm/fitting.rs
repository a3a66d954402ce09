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

//! Pure placement search: given a request and the tick's agent snapshots,
//! produce per-agent slot counts or nothing. All candidate orderings tie-break
//! lexicographically by agent id so replays converge.

use std::collections::HashMap;

use bosun_common::device::DeviceType;
use bosun_common::id::AgentId;
use itertools::Itertools;
use serde::Deserialize;

use crate::rm::agent::AgentState;
use crate::rm::message::AllocateRequest;

/// Preference applied when several agents could host a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftConstraint {
    /// Prefer the agent left with the fewest free slots (packing).
    #[default]
    BestFit,
    /// Prefer the agent left with the most free slots (spreading).
    WorstFit,
}

/// One agent's share of a placement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FittingState {
    pub agent_id: AgentId,
    pub slots: usize,
}

/// Finds a placement for `req` against the snapshot, or returns an empty list
/// when none exists. Single-agent placements are preferred; requests spanning
/// agents require `single_agent` to be unset and, unless
/// `allow_heterogeneous_fits`, a single device kind across all chosen agents.
pub fn find_fits(
    req: &AllocateRequest,
    agent_states: &HashMap<AgentId, AgentState>,
    soft_constraint: SoftConstraint,
    allow_heterogeneous_fits: bool,
) -> Vec<FittingState> {
    let candidates: Vec<&AgentState> = agent_states
        .values()
        .filter(|state| state.schedulable())
        .filter(|state| state.label == req.label)
        .sorted_by_key(|state| state.agent_id())
        .collect();

    if req.slots_needed == 0 {
        return fit_zero_slot(&candidates, soft_constraint);
    }

    if let Some(fit) = fit_single_agent(req, &candidates, soft_constraint) {
        return vec![fit];
    }
    if req.fitting_requirements.single_agent {
        return vec![];
    }
    fit_distributed(req, &candidates, allow_heterogeneous_fits)
}

fn fit_zero_slot(
    candidates: &[&AgentState],
    soft_constraint: SoftConstraint,
) -> Vec<FittingState> {
    candidates
        .iter()
        .filter(|state| state.num_zero_slot_containers_free() > 0)
        .min_by_key(|state| match soft_constraint {
            SoftConstraint::BestFit => state.num_zero_slot_containers_free(),
            SoftConstraint::WorstFit => usize::MAX - state.num_zero_slot_containers_free(),
        })
        .map(|state| {
            vec![FittingState {
                agent_id: state.agent_id(),
                slots: 0,
            }]
        })
        .unwrap_or_default()
}

fn fit_single_agent(
    req: &AllocateRequest,
    candidates: &[&AgentState],
    soft_constraint: SoftConstraint,
) -> Option<FittingState> {
    candidates
        .iter()
        .map(|state| {
            (
                state,
                state.free_slots(&req.fitting_requirements.blacklist).len(),
            )
        })
        .filter(|(_, free)| *free >= req.slots_needed)
        // `min_by_key` keeps the first of equal keys; candidates are already
        // sorted by agent id.
        .min_by_key(|(_, free)| match soft_constraint {
            SoftConstraint::BestFit => *free,
            SoftConstraint::WorstFit => usize::MAX - *free,
        })
        .map(|(state, _)| FittingState {
            agent_id: state.agent_id(),
            slots: req.slots_needed,
        })
}

fn fit_distributed(
    req: &AllocateRequest,
    candidates: &[&AgentState],
    allow_heterogeneous_fits: bool,
) -> Vec<FittingState> {
    if allow_heterogeneous_fits {
        return span_agents(req, candidates);
    }
    // Try one device kind at a time, in a fixed order.
    for device_type in [DeviceType::Cpu, DeviceType::Cuda, DeviceType::Rocm] {
        let of_kind: Vec<&AgentState> = candidates
            .iter()
            .filter(|state| state.device_type() == Some(device_type))
            .copied()
            .collect();
        let fits = span_agents(req, &of_kind);
        if !fits.is_empty() {
            return fits;
        }
    }
    vec![]
}

/// Greedily spans agents ordered by free capacity (largest first, id
/// tie-break) until the request is covered.
fn span_agents(req: &AllocateRequest, candidates: &[&AgentState]) -> Vec<FittingState> {
    let ordered = candidates
        .iter()
        .map(|state| {
            (
                state,
                state.free_slots(&req.fitting_requirements.blacklist).len(),
            )
        })
        .filter(|(_, free)| *free > 0)
        .sorted_by_key(|(state, free)| (usize::MAX - *free, state.agent_id()));

    let mut fits = vec![];
    let mut remaining = req.slots_needed;
    for (state, free) in ordered {
        let take = free.min(remaining);
        fits.push(FittingState {
            agent_id: state.agent_id(),
            slots: take,
        });
        remaining -= take;
        if remaining == 0 {
            return fits;
        }
    }
    vec![]
}
