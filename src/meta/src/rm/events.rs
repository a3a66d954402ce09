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

use bosun_common::id::AllocationId;
use parking_lot::RwLock;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::rm::message::ResourceEvent;

/// Fan-out of per-allocation events to their watchers (usually the allocation
/// state machine living in the task layer).
///
/// For a given allocation id, watchers observe events in the order the pool
/// published them. Senders whose receiver has gone away are dropped on the next
/// publish.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<RwLock<HashMap<AllocationId, Vec<UnboundedSender<ResourceEvent>>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, allocation_id: &AllocationId) -> UnboundedReceiver<ResourceEvent> {
        let (tx, rx) = unbounded_channel();
        self.inner
            .write()
            .entry(allocation_id.clone())
            .or_default()
            .push(tx);
        rx
    }

    pub fn publish(&self, allocation_id: &AllocationId, event: ResourceEvent) {
        let mut inner = self.inner.write();
        let Some(senders) = inner.get_mut(allocation_id) else {
            tracing::debug!(allocation_id = %allocation_id, ?event, "dropping event without watchers");
            return;
        };
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        if senders.is_empty() {
            inner.remove(allocation_id);
        }
    }

    /// Forgets every watcher of an allocation. Called when the allocation is
    /// fully closed.
    pub fn remove(&self, allocation_id: &AllocationId) {
        self.inner.write().remove(allocation_id);
    }
}
