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

//! Long-lived watch over the cluster substrate's node inventory. Lists once,
//! then follows a resilient watch from the returned resource version, applying
//! node events to the agent registry and nudging the pools to reschedule.
//!
//! Event order is deterministic within the pool actor, but replays across
//! watch reconnects may observe a different interleaving; consumers must not
//! rely on cross-reconnect ordering.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bosun_common::device::Device;
use bosun_common::id::{AgentId, ContainerId, SlotId};
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::watch;

use crate::error::MetaResult;
use crate::rm::agent::AgentService;
use crate::rm::resource_pool::ResourcePoolHandle;

/// Version token of the substrate's inventory; watches resume from it.
pub type ResourceVersion = u64;

const REWATCH_BACKOFF: Duration = Duration::from_secs(1);

/// One node as reported by the substrate.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeSummary {
    pub agent_id: AgentId,
    pub label: Option<String>,
    pub enabled: bool,
    pub draining: bool,
    pub devices: Vec<Device>,
    pub max_zero_slot_containers: usize,
    /// Containers the node reports as already bound to slots.
    pub containers: HashMap<ContainerId, Vec<SlotId>>,
}

impl NodeSummary {
    pub fn new(agent_id: impl Into<AgentId>, devices: Vec<Device>) -> Self {
        Self {
            agent_id: agent_id.into(),
            label: None,
            enabled: true,
            draining: false,
            devices,
            max_zero_slot_containers: 100,
            containers: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeEvent {
    Added(NodeSummary),
    Modified(NodeSummary),
    Deleted(AgentId),
}

/// The substrate inventory interface (a collaborator; pod/container drivers
/// live behind it).
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    async fn list_nodes(&self) -> MetaResult<(Vec<NodeSummary>, ResourceVersion)>;

    async fn watch_nodes(
        &self,
        from: ResourceVersion,
    ) -> MetaResult<BoxStream<'static, MetaResult<(ResourceVersion, NodeEvent)>>>;
}

pub struct AgentInformer {
    client: Arc<dyn ClusterClient>,
    agent_service: AgentService,
    pools: Vec<ResourcePoolHandle>,
    done: watch::Receiver<bool>,
}

impl AgentInformer {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        agent_service: AgentService,
        pools: Vec<ResourcePoolHandle>,
        done: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            agent_service,
            pools,
            done,
        }
    }

    /// Runs until the done signal fires. List and watch failures are logged
    /// and retried; they never tear the informer down.
    pub async fn run(mut self) {
        tracing::info!("agent informer is starting");
        let mut version = loop {
            match self.client.list_nodes().await {
                Ok((nodes, version)) => {
                    for node in &nodes {
                        self.agent_service.upsert(node);
                    }
                    self.notify_pools();
                    break version;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "listing nodes failed, retrying");
                    if self.sleep_or_done(REWATCH_BACKOFF).await {
                        return;
                    }
                }
            }
        };

        loop {
            let mut stream = match self.client.watch_nodes(version).await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(error = %err, version, "opening node watch failed, retrying");
                    if self.sleep_or_done(REWATCH_BACKOFF).await {
                        return;
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    changed = self.done.changed() => {
                        if changed.is_err() || *self.done.borrow() {
                            tracing::info!("agent informer stopped");
                            return;
                        }
                    }
                    event = stream.next() => match event {
                        Some(Ok((new_version, event))) => {
                            version = new_version;
                            self.apply(event);
                        }
                        Some(Err(err)) => {
                            tracing::warn!(error = %err, "node watch emitted error, re-watching");
                            break;
                        }
                        None => {
                            tracing::warn!("node watch ended unexpectedly, re-watching");
                            break;
                        }
                    }
                }
            }

            if self.sleep_or_done(REWATCH_BACKOFF).await {
                return;
            }
        }
    }

    fn apply(&self, event: NodeEvent) {
        match event {
            NodeEvent::Added(node) | NodeEvent::Modified(node) => {
                tracing::debug!(agent_id = %node.agent_id, "node upserted");
                self.agent_service.upsert(&node);
            }
            NodeEvent::Deleted(agent_id) => {
                tracing::debug!(agent_id = %agent_id, "node deleted");
                self.agent_service.remove(&agent_id);
            }
        }
        self.notify_pools();
    }

    fn notify_pools(&self) {
        for pool in &self.pools {
            pool.agent_updated();
        }
    }

    /// Returns true when the done signal fired during the wait.
    async fn sleep_or_done(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            changed = self.done.changed() => changed.is_err() || *self.done.borrow(),
        }
    }
}
