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

use async_trait::async_trait;
use bosun_common::id::{AccessScopeId, AllocationId, TaskId};
use bosun_common::user::User;
use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, Statement};
use serde::{Deserialize, Serialize};

use crate::error::{MetaError, MetaResult};
use crate::stream::auth::{AccessScopeSet, StreamAuthz};
use crate::stream::known::process_known;
use crate::stream::sql::{in_list, scope_clause, spec_clause};
use crate::stream::subscription::EntityFilter;
use crate::stream::{DeleteMsg, StreamEntity, StreamUpdate};

pub const CHECKPOINTS_DELETE_KEY: &str = "checkpoints_deleted";
pub const CHECKPOINTS_UPSERT_KEY: &str = "checkpoint";

/// One checkpoint row as streamed to clients. The workspace scope and the
/// filter-level ids ride along for filtering but are not serialized.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMsg {
    pub id: i64,
    pub uuid: String,
    pub task_id: TaskId,
    pub allocation_id: Option<AllocationId>,
    pub report_time: Option<DateTime<Utc>>,
    pub state: String,
    pub resources: serde_json::Value,
    pub metadata: serde_json::Value,
    pub size: i64,
    pub seq: i64,

    #[serde(skip)]
    pub workspace_id: AccessScopeId,
    #[serde(skip)]
    pub trial_id: i64,
    #[serde(skip)]
    pub experiment_id: i64,
}

impl StreamEntity for CheckpointMsg {
    const UPSERT_KEY: &'static str = CHECKPOINTS_UPSERT_KEY;
    const DELETE_KEY: &'static str = CHECKPOINTS_DELETE_KEY;

    fn id(&self) -> i64 {
        self.id
    }

    fn seq_num(&self) -> i64 {
        self.seq
    }

    fn workspace_id(&self) -> AccessScopeId {
        self.workspace_id
    }
}

/// What a user submits to define a checkpoint subscription.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CheckpointSubscriptionSpec {
    #[serde(default)]
    pub trial_ids: Vec<i64>,
    #[serde(default)]
    pub experiment_ids: Vec<i64>,
    #[serde(default)]
    pub since: i64,
}

impl CheckpointSubscriptionSpec {
    /// An empty filter set means "no subscription".
    pub fn is_empty(&self) -> bool {
        self.trial_ids.is_empty() && self.experiment_ids.is_empty()
    }
}

/// Row access for checkpoints (relational in production, in-memory in tests).
#[async_trait]
pub trait CheckpointSource: Send + Sync + 'static {
    /// Ids currently matching the spec, ascending. `spec.since` is ignored:
    /// catch-up needs membership, not the change set.
    async fn matching_ids(
        &self,
        spec: &CheckpointSubscriptionSpec,
        scopes: &AccessScopeSet,
    ) -> MetaResult<Vec<i64>>;

    /// Hydrates full rows, permission-filtered.
    async fn load(&self, ids: &[i64], scopes: &AccessScopeSet) -> MetaResult<Vec<CheckpointMsg>>;

    /// Rows matching the spec with `seq > spec.since`, permission-filtered.
    async fn load_since(
        &self,
        spec: &CheckpointSubscriptionSpec,
        scopes: &AccessScopeSet,
    ) -> MetaResult<Vec<CheckpointMsg>>;
}

/// Computes the catch-up batch for a (re)connecting subscriber: what it knows
/// but should not (one delete), then everything it is missing (one upsert per
/// row).
pub async fn collect_startup_msgs(
    source: &dyn CheckpointSource,
    authz: &dyn StreamAuthz,
    user: &User,
    known: &str,
    spec: &CheckpointSubscriptionSpec,
) -> MetaResult<Vec<StreamUpdate>> {
    if spec.is_empty() {
        return Ok(vec![StreamUpdate::Delete(DeleteMsg {
            key: CHECKPOINTS_DELETE_KEY,
            deleted: known.to_owned(),
        })]);
    }

    let scopes = authz.checkpoint_streamable_scopes(user).await?;
    let exist = source.matching_ids(spec, &scopes).await?;
    let (missing, appeared) = process_known(known, &exist)?;

    let rows = if appeared.is_empty() {
        vec![]
    } else {
        source.load(&appeared, &scopes).await?
    };

    let mut out = Vec::with_capacity(rows.len() + 1);
    out.push(StreamUpdate::Delete(DeleteMsg {
        key: CHECKPOINTS_DELETE_KEY,
        deleted: missing,
    }));
    out.extend(rows.iter().map(StreamEntity::upsert_msg));
    Ok(out)
}

/// Scrapes the rows a freshly submitted spec already matches, respecting its
/// `since` watermark. Used when a subscription is added mid-stream.
pub async fn collect_subscription_mod_msgs(
    source: &dyn CheckpointSource,
    spec: &CheckpointSubscriptionSpec,
    scopes: &AccessScopeSet,
) -> MetaResult<Vec<StreamUpdate>> {
    if spec.is_empty() {
        return Ok(vec![]);
    }
    let rows = source.load_since(spec, scopes).await?;
    Ok(rows.iter().map(StreamEntity::upsert_msg).collect())
}

/// Full catch-up for a (re)connecting subscriber: the membership diff plus the
/// re-upsert of rows changed past the client's `since` watermark, deletions
/// first. A client holding stale content for an id it already knows is healed
/// by the `since` scrape.
pub async fn collect_catch_up_msgs(
    source: &dyn CheckpointSource,
    authz: &dyn StreamAuthz,
    user: &User,
    known: &str,
    spec: &CheckpointSubscriptionSpec,
) -> MetaResult<Vec<StreamUpdate>> {
    if spec.is_empty() {
        return Ok(vec![StreamUpdate::Delete(DeleteMsg {
            key: CHECKPOINTS_DELETE_KEY,
            deleted: known.to_owned(),
        })]);
    }

    let scopes = authz.checkpoint_streamable_scopes(user).await?;
    let exist = source.matching_ids(spec, &scopes).await?;
    let (missing, appeared) = process_known(known, &exist)?;

    let mut rows: std::collections::BTreeMap<i64, CheckpointMsg> = std::collections::BTreeMap::new();
    if !appeared.is_empty() {
        for row in source.load(&appeared, &scopes).await? {
            rows.insert(row.id, row);
        }
    }
    for row in source.load_since(spec, &scopes).await? {
        rows.insert(row.id, row);
    }

    let mut out = Vec::with_capacity(rows.len() + 1);
    out.push(StreamUpdate::Delete(DeleteMsg {
        key: CHECKPOINTS_DELETE_KEY,
        deleted: missing,
    }));
    out.extend(rows.values().map(StreamEntity::upsert_msg));
    Ok(out)
}

/// Builds the live filter from a defensive copy of the spec's id sets.
pub fn make_filter(spec: &CheckpointSubscriptionSpec) -> MetaResult<EntityFilter<CheckpointMsg>> {
    if spec.is_empty() {
        return Err(MetaError::InvalidResourcesRequest(
            "empty checkpoint subscription spec".to_owned(),
        ));
    }
    for &id in spec.trial_ids.iter().chain(&spec.experiment_ids) {
        if id <= 0 {
            return Err(MetaError::InvalidResourcesRequest(format!(
                "invalid subscription id: {id}"
            )));
        }
    }
    let trial_ids: std::collections::HashSet<i64> = spec.trial_ids.iter().copied().collect();
    let experiment_ids: std::collections::HashSet<i64> =
        spec.experiment_ids.iter().copied().collect();

    Ok(Box::new(move |msg: &CheckpointMsg| {
        trial_ids.contains(&msg.trial_id) || experiment_ids.contains(&msg.experiment_id)
    }))
}

/// Builds the permission filter from the user's accessible scopes.
pub async fn make_permission_filter(
    authz: &dyn StreamAuthz,
    user: &User,
) -> MetaResult<EntityFilter<CheckpointMsg>> {
    let scopes = authz.checkpoint_streamable_scopes(user).await?;
    if scopes.global {
        return Ok(Box::new(|_| true));
    }
    Ok(Box::new(move |msg: &CheckpointMsg| {
        scopes.permits(msg.workspace_id)
    }))
}

/// [`CheckpointSource`] over the relational store.
pub struct SqlCheckpointSource {
    db: DatabaseConnection,
}

impl SqlCheckpointSource {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CheckpointSource for SqlCheckpointSource {
    async fn matching_ids(
        &self,
        spec: &CheckpointSubscriptionSpec,
        scopes: &AccessScopeSet,
    ) -> MetaResult<Vec<i64>> {
        let sql = format!(
            "SELECT c.id AS id FROM checkpoints_v2 c \
             JOIN trial_id_task_id ON trial_id_task_id.task_id = c.task_id \
             JOIN trials ON trial_id_task_id.trial_id = trials.id \
             JOIN experiments ON trials.experiment_id = experiments.id \
             JOIN projects ON experiments.project_id = projects.id \
             WHERE ({}) AND ({}) ORDER BY c.id ASC",
            scope_clause(scopes),
            spec_clause(
                "trials.id",
                "trials.experiment_id",
                &spec.trial_ids,
                &spec.experiment_ids,
            ),
        );
        let rows = self
            .db
            .query_all(Statement::from_string(DbBackend::Postgres, sql))
            .await?;
        rows.iter()
            .map(|row| row.try_get::<i64>("", "id").map_err(Into::into))
            .collect()
    }

    async fn load(&self, ids: &[i64], scopes: &AccessScopeSet) -> MetaResult<Vec<CheckpointMsg>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let sql = format!(
            "SELECT c.id AS id, c.uuid AS uuid, c.task_id AS task_id, \
             c.allocation_id AS allocation_id, c.report_time AS report_time, \
             c.state AS state, c.resources AS resources, c.metadata AS metadata, \
             c.size AS size, c.seq AS seq, projects.workspace_id AS workspace_id, \
             trials.id AS trial_id, trials.experiment_id AS experiment_id \
             FROM checkpoints_v2 c \
             JOIN trial_id_task_id ON trial_id_task_id.task_id = c.task_id \
             JOIN trials ON trial_id_task_id.trial_id = trials.id \
             JOIN experiments ON trials.experiment_id = experiments.id \
             JOIN projects ON experiments.project_id = projects.id \
             WHERE ({}) AND c.id IN ({}) ORDER BY c.id ASC",
            scope_clause(scopes),
            in_list(ids),
        );
        let rows = self
            .db
            .query_all(Statement::from_string(DbBackend::Postgres, sql))
            .await?;
        rows.iter()
            .map(|row| {
                Ok(CheckpointMsg {
                    id: row.try_get("", "id")?,
                    uuid: row.try_get("", "uuid")?,
                    task_id: TaskId::from(row.try_get::<String>("", "task_id")?),
                    allocation_id: row
                        .try_get::<Option<String>>("", "allocation_id")?
                        .map(AllocationId::from),
                    report_time: row.try_get("", "report_time")?,
                    state: row.try_get("", "state")?,
                    resources: row.try_get("", "resources")?,
                    metadata: row.try_get("", "metadata")?,
                    size: row.try_get("", "size")?,
                    seq: row.try_get("", "seq")?,
                    workspace_id: AccessScopeId(row.try_get::<i32>("", "workspace_id")?),
                    trial_id: row.try_get("", "trial_id")?,
                    experiment_id: row.try_get("", "experiment_id")?,
                })
            })
            .collect()
    }

    async fn load_since(
        &self,
        spec: &CheckpointSubscriptionSpec,
        scopes: &AccessScopeSet,
    ) -> MetaResult<Vec<CheckpointMsg>> {
        let sql = format!(
            "SELECT c.id AS id FROM checkpoints_v2 c \
             JOIN trial_id_task_id ON trial_id_task_id.task_id = c.task_id \
             JOIN trials ON trial_id_task_id.trial_id = trials.id \
             JOIN experiments ON trials.experiment_id = experiments.id \
             JOIN projects ON experiments.project_id = projects.id \
             WHERE ({}) AND ({}) AND c.seq > {} ORDER BY c.id ASC",
            scope_clause(scopes),
            spec_clause(
                "trials.id",
                "trials.experiment_id",
                &spec.trial_ids,
                &spec.experiment_ids,
            ),
            spec.since,
        );
        let rows = self
            .db
            .query_all(Statement::from_string(DbBackend::Postgres, sql))
            .await?;
        let ids: Vec<i64> = rows
            .iter()
            .map(|row| row.try_get::<i64>("", "id"))
            .collect::<Result<_, _>>()?;
        self.load(&ids, scopes).await
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    /// In-memory [`CheckpointSource`] over a fixed table.
    pub(crate) struct MemCheckpointSource(pub Vec<CheckpointMsg>);

    #[async_trait]
    impl CheckpointSource for MemCheckpointSource {
        async fn matching_ids(
            &self,
            spec: &CheckpointSubscriptionSpec,
            scopes: &AccessScopeSet,
        ) -> MetaResult<Vec<i64>> {
            let mut ids: Vec<i64> = self
                .0
                .iter()
                .filter(|msg| scopes.permits(msg.workspace_id))
                .filter(|msg| {
                    spec.trial_ids.contains(&msg.trial_id)
                        || spec.experiment_ids.contains(&msg.experiment_id)
                })
                .map(|msg| msg.id)
                .collect();
            ids.sort_unstable();
            Ok(ids)
        }

        async fn load(
            &self,
            ids: &[i64],
            scopes: &AccessScopeSet,
        ) -> MetaResult<Vec<CheckpointMsg>> {
            Ok(self
                .0
                .iter()
                .filter(|msg| ids.contains(&msg.id) && scopes.permits(msg.workspace_id))
                .cloned()
                .collect())
        }

        async fn load_since(
            &self,
            spec: &CheckpointSubscriptionSpec,
            scopes: &AccessScopeSet,
        ) -> MetaResult<Vec<CheckpointMsg>> {
            let ids = self.matching_ids(spec, scopes).await?;
            let mut rows = self.load(&ids, scopes).await?;
            rows.retain(|msg| msg.seq > spec.since);
            Ok(rows)
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::test_utils::MemCheckpointSource;
    use super::*;
    use crate::stream::auth::test_utils::FixedScopes;

    fn checkpoint(id: i64, trial_id: i64, workspace: i32) -> CheckpointMsg {
        CheckpointMsg {
            id,
            uuid: format!("uuid-{id}"),
            trial_id,
            experiment_id: 100 + trial_id,
            workspace_id: AccessScopeId(workspace),
            seq: id,
            ..CheckpointMsg::default()
        }
    }

    fn w1_table() -> MemCheckpointSource {
        // Workspace 1 holds {10,11,12}; workspace 2 holds {20,21}.
        MemCheckpointSource(vec![
            checkpoint(10, 1, 1),
            checkpoint(11, 1, 1),
            checkpoint(12, 2, 1),
            checkpoint(20, 3, 2),
            checkpoint(21, 3, 2),
        ])
    }

    #[tokio::test]
    async fn test_catch_up_deletes_then_upserts() {
        let source = w1_table();
        let authz = FixedScopes(vec![AccessScopeId(1)]);
        let user = User::new(1, "alice");
        let spec = CheckpointSubscriptionSpec {
            trial_ids: vec![1, 2, 3],
            ..Default::default()
        };

        let out = collect_startup_msgs(&source, &authz, &user, "10,99", &spec)
            .await
            .unwrap();

        // One delete first, then one upsert per appeared row; {20,21} never
        // appear despite matching the spec.
        assert_eq!(out.len(), 3);
        assert_matches!(
            &out[0],
            StreamUpdate::Delete(DeleteMsg { deleted, .. }) if deleted == "99"
        );
        let upserted: Vec<i64> = out[1..]
            .iter()
            .map(|update| match update {
                StreamUpdate::Upsert(upsert) => upsert.msg["id"].as_i64().unwrap(),
                StreamUpdate::Delete(_) => panic!("deletes must precede upserts"),
            })
            .collect();
        assert_eq!(upserted, vec![11, 12]);
    }

    #[tokio::test]
    async fn test_full_catch_up_heals_stale_known_rows() {
        let source = w1_table();
        let authz = FixedScopes(vec![AccessScopeId(1)]);
        let user = User::new(1, "alice");
        let spec = CheckpointSubscriptionSpec {
            trial_ids: vec![1, 2, 3],
            since: 0,
            ..Default::default()
        };

        let out = collect_catch_up_msgs(&source, &authz, &user, "10,99", &spec)
            .await
            .unwrap();

        // With since=0, even the known id 10 is re-upserted: the client's
        // content for it may be stale.
        assert_matches!(
            &out[0],
            StreamUpdate::Delete(DeleteMsg { deleted, .. }) if deleted == "99"
        );
        let upserted: Vec<i64> = out[1..]
            .iter()
            .map(|update| match update {
                StreamUpdate::Upsert(upsert) => upsert.msg["id"].as_i64().unwrap(),
                StreamUpdate::Delete(_) => panic!("deletes must precede upserts"),
            })
            .collect();
        assert_eq!(upserted, vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn test_subscription_mod_msgs_respect_since() {
        let source = w1_table();
        let spec = CheckpointSubscriptionSpec {
            trial_ids: vec![1, 2],
            since: 11,
            ..Default::default()
        };
        let scopes = AccessScopeSet::workspaces([AccessScopeId(1)]);
        let out = collect_subscription_mod_msgs(&source, &spec, &scopes)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], checkpoint(12, 2, 1).upsert_msg());
    }

    #[tokio::test]
    async fn test_empty_spec_clears_known() {
        let source = w1_table();
        let authz = FixedScopes(vec![AccessScopeId(1)]);
        let user = User::new(1, "alice");

        let out = collect_startup_msgs(
            &source,
            &authz,
            &user,
            "10-12",
            &CheckpointSubscriptionSpec::default(),
        )
        .await
        .unwrap();
        assert_eq!(
            out,
            vec![StreamUpdate::Delete(DeleteMsg {
                key: CHECKPOINTS_DELETE_KEY,
                deleted: "10-12".to_owned(),
            })]
        );
    }

    #[tokio::test]
    async fn test_filters() {
        let spec = CheckpointSubscriptionSpec {
            trial_ids: vec![1],
            experiment_ids: vec![103],
            ..Default::default()
        };
        let filter = make_filter(&spec).unwrap();
        assert!(filter(&checkpoint(10, 1, 1)));
        assert!(filter(&checkpoint(20, 3, 2)));
        assert!(!filter(&checkpoint(12, 2, 1)));

        assert!(make_filter(&CheckpointSubscriptionSpec::default()).is_err());
        let invalid = CheckpointSubscriptionSpec {
            trial_ids: vec![0],
            ..Default::default()
        };
        assert!(make_filter(&invalid).is_err());
    }

    #[tokio::test]
    async fn test_permission_filter_blocks_other_workspaces() {
        let authz = FixedScopes(vec![AccessScopeId(1)]);
        let user = User::new(1, "alice");
        let filter = make_permission_filter(&authz, &user).await.unwrap();
        assert!(filter(&checkpoint(10, 1, 1)));
        assert!(!filter(&checkpoint(20, 3, 2)));

        let mut admin = User::new(2, "root");
        admin.is_admin = true;
        let filter = make_permission_filter(&authz, &admin).await.unwrap();
        assert!(filter(&checkpoint(20, 3, 2)));
    }
}
