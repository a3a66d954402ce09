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

use std::collections::HashMap;
use std::sync::Arc;

use bosun_common::id::JobId;
use parking_lot::Mutex;

use crate::error::MetaResult;

/// Per-job scheduling policy carrier. Created lazily on the first request for
/// a job, destroyed when the job's last allocation ends.
#[derive(Clone, Debug, PartialEq)]
pub struct Group {
    pub job_id: JobId,
    pub max_slots: Option<usize>,
    pub weight: f64,
    /// Lower values are more urgent. In priority mode every group has one
    /// (the pool applies its configured default on creation).
    pub priority: Option<i32>,
}

impl Group {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            max_slots: None,
            weight: 1.0,
            priority: None,
        }
    }
}

pub type Groups = HashMap<JobId, Group>;

/// Callback applied when a job's priority is changed from inside the pool
/// (e.g. by a move), so the owning workload can follow along or veto.
pub type PriorityChanger = Arc<dyn Fn(i32) -> MetaResult<()> + Send + Sync>;

type OnDeleteHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct RegistryEntry {
    changer: Option<PriorityChanger>,
    on_delete: Vec<OnDeleteHook>,
}

/// Process-wide registry keyed by job id. It decouples pools from the
/// workloads they schedule: workloads register a [`PriorityChanger`], pools
/// register cleanup hooks fired when the job is deleted. Hooks run under no
/// registry lock so they may call back into a pool.
#[derive(Clone, Default)]
pub struct GroupPriorityChangeRegistry {
    inner: Arc<Mutex<HashMap<JobId, RegistryEntry>>>,
}

impl GroupPriorityChangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, job_id: JobId, changer: PriorityChanger) {
        self.inner.lock().entry(job_id).or_default().changer = Some(changer);
    }

    pub fn load(&self, job_id: &JobId) -> Option<PriorityChanger> {
        self.inner
            .lock()
            .get(job_id)
            .and_then(|entry| entry.changer.clone())
    }

    pub fn on_delete(&self, job_id: JobId, hook: impl FnOnce() + Send + 'static) {
        self.inner
            .lock()
            .entry(job_id)
            .or_default()
            .on_delete
            .push(Box::new(hook));
    }

    /// Removes the job and fires its delete hooks.
    pub fn delete(&self, job_id: &JobId) {
        let entry = self.inner.lock().remove(job_id);
        if let Some(entry) = entry {
            for hook in entry.on_delete {
                hook();
            }
        }
    }
}
