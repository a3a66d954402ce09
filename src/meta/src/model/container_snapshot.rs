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

use sea_orm::entity::prelude::*;

/// `devices` holds the JSON-encoded device list the container reserved, so a
/// restore can rebuild the exact placement without consulting the agent.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "container_snapshots")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub container_id: String,
    pub resource_id: String,
    pub allocation_id: String,
    pub agent_id: String,
    pub devices: Json,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::resources_state::Entity",
        from = "Column::ResourceId",
        to = "super::resources_state::Column::ResourceId",
        on_update = "NoAction",
        on_delete = "Cascade"
    )]
    ResourcesState,
}

impl Related<super::resources_state::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ResourcesState.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
