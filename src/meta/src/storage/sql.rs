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

use anyhow::Context;
use async_trait::async_trait;
use bosun_common::id::{AllocationId, JobId};
use rust_decimal::Decimal;
use sea_orm::sea_query::OnConflict;
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, EntityTrait, QueryFilter,
    QueryOrder, Statement,
};

use super::SnapshotStore;
use crate::error::MetaResult;
use crate::model::prelude::{ContainerSnapshot, ResourcesState};
use crate::model::{container_snapshot, resources_state};
use crate::rm::message::ContainerResource;

/// [`SnapshotStore`] backed by the relational meta store.
pub struct SqlStore {
    db: DatabaseConnection,
}

impl SqlStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SnapshotStore for SqlStore {
    async fn persist_container(
        &self,
        allocation_id: &AllocationId,
        resource: &ContainerResource,
    ) -> MetaResult<()> {
        let state = resources_state::ActiveModel {
            resource_id: Set(resource.resource_id.as_str().to_owned()),
            allocation_id: Set(allocation_id.as_str().to_owned()),
            started: Set(resource.started),
            exited: Set(resource.exited),
        };
        ResourcesState::insert(state)
            .on_conflict(
                OnConflict::column(resources_state::Column::ResourceId)
                    .update_columns([
                        resources_state::Column::Started,
                        resources_state::Column::Exited,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;

        let devices =
            serde_json::to_value(&resource.devices).context("encoding reserved devices")?;
        let snapshot = container_snapshot::ActiveModel {
            container_id: Set(resource.container_id.as_str().to_owned()),
            resource_id: Set(resource.resource_id.as_str().to_owned()),
            allocation_id: Set(allocation_id.as_str().to_owned()),
            agent_id: Set(resource.agent_id.as_str().to_owned()),
            devices: Set(devices),
        };
        ContainerSnapshot::insert(snapshot)
            .on_conflict(
                OnConflict::column(container_snapshot::Column::ContainerId)
                    .update_columns([
                        container_snapshot::Column::AgentId,
                        container_snapshot::Column::Devices,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn load_container_snapshots(
        &self,
        allocation_id: &AllocationId,
    ) -> MetaResult<Vec<ContainerResource>> {
        let states: HashMap<String, resources_state::Model> = ResourcesState::find()
            .filter(resources_state::Column::AllocationId.eq(allocation_id.as_str()))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| (row.resource_id.clone(), row))
            .collect();

        let snapshots = ContainerSnapshot::find()
            .filter(container_snapshot::Column::AllocationId.eq(allocation_id.as_str()))
            .order_by_asc(container_snapshot::Column::ContainerId)
            .all(&self.db)
            .await?;

        snapshots
            .into_iter()
            .map(|row| {
                let devices = serde_json::from_value(row.devices)
                    .context("decoding persisted devices")?;
                let (started, exited) = states
                    .get(&row.resource_id)
                    .map(|s| (s.started, s.exited))
                    .unwrap_or_default();
                Ok(ContainerResource {
                    resource_id: row.resource_id.into(),
                    container_id: row.container_id.into(),
                    agent_id: row.agent_id.into(),
                    devices,
                    started,
                    exited,
                })
            })
            .collect()
    }

    async fn remove_allocation(&self, allocation_id: &AllocationId) -> MetaResult<()> {
        ContainerSnapshot::delete_many()
            .filter(container_snapshot::Column::AllocationId.eq(allocation_id.as_str()))
            .exec(&self.db)
            .await?;
        ResourcesState::delete_many()
            .filter(resources_state::Column::AllocationId.eq(allocation_id.as_str()))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn update_job_position(&self, job_id: &JobId, position: Decimal) -> MetaResult<()> {
        // The jobs table belongs to the job infrastructure; only the queue
        // position column is ours to write.
        self.db
            .execute(Statement::from_sql_and_values(
                DbBackend::Postgres,
                "UPDATE jobs SET queue_position = $1::numeric WHERE job_id = $2",
                [position.to_string().into(), job_id.as_str().into()],
            ))
            .await?;
        Ok(())
    }
}
