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
use bosun_common::id::AccessScopeId;
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

pub const METRICS_DELETE_KEY: &str = "metrics_deleted";
pub const METRICS_UPSERT_KEY: &str = "metric";

/// One metric report row as streamed to clients.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricMsg {
    pub id: i64,
    pub trial_id: i64,
    pub trial_run_id: i64,
    pub end_time: Option<DateTime<Utc>>,
    pub metrics: serde_json::Value,
    pub total_batches: i64,
    pub metric_group: String,
    pub archived: bool,
    pub seq: i64,

    #[serde(skip)]
    pub workspace_id: AccessScopeId,
    #[serde(skip)]
    pub experiment_id: i64,
}

impl StreamEntity for MetricMsg {
    const UPSERT_KEY: &'static str = METRICS_UPSERT_KEY;
    const DELETE_KEY: &'static str = METRICS_DELETE_KEY;

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

/// What a user submits to define a metric subscription.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MetricSubscriptionSpec {
    #[serde(default)]
    pub trial_ids: Vec<i64>,
    #[serde(default)]
    pub experiment_ids: Vec<i64>,
    #[serde(default)]
    pub since: i64,
}

impl MetricSubscriptionSpec {
    pub fn is_empty(&self) -> bool {
        self.trial_ids.is_empty() && self.experiment_ids.is_empty()
    }
}

/// Row access for metrics (relational in production, in-memory in tests).
#[async_trait]
pub trait MetricSource: Send + Sync + 'static {
    async fn matching_ids(
        &self,
        spec: &MetricSubscriptionSpec,
        scopes: &AccessScopeSet,
    ) -> MetaResult<Vec<i64>>;

    async fn load(&self, ids: &[i64], scopes: &AccessScopeSet) -> MetaResult<Vec<MetricMsg>>;

    async fn load_since(
        &self,
        spec: &MetricSubscriptionSpec,
        scopes: &AccessScopeSet,
    ) -> MetaResult<Vec<MetricMsg>>;
}

/// Membership diff for a (re)connecting subscriber: one delete for what it
/// wrongly holds, an upsert per row it is missing.
pub async fn collect_startup_msgs(
    source: &dyn MetricSource,
    authz: &dyn StreamAuthz,
    user: &User,
    known: &str,
    spec: &MetricSubscriptionSpec,
) -> MetaResult<Vec<StreamUpdate>> {
    if spec.is_empty() {
        return Ok(vec![StreamUpdate::Delete(DeleteMsg {
            key: METRICS_DELETE_KEY,
            deleted: known.to_owned(),
        })]);
    }

    let scopes = authz.metric_streamable_scopes(user).await?;
    let exist = source.matching_ids(spec, &scopes).await?;
    let (missing, appeared) = process_known(known, &exist)?;

    let rows = if appeared.is_empty() {
        vec![]
    } else {
        source.load(&appeared, &scopes).await?
    };

    let mut out = Vec::with_capacity(rows.len() + 1);
    out.push(StreamUpdate::Delete(DeleteMsg {
        key: METRICS_DELETE_KEY,
        deleted: missing,
    }));
    out.extend(rows.iter().map(StreamEntity::upsert_msg));
    Ok(out)
}

/// Upserts for rows a freshly submitted spec already matches past its `since`
/// watermark.
pub async fn collect_subscription_mod_msgs(
    source: &dyn MetricSource,
    spec: &MetricSubscriptionSpec,
    scopes: &AccessScopeSet,
) -> MetaResult<Vec<StreamUpdate>> {
    if spec.is_empty() {
        return Ok(vec![]);
    }
    let rows = source.load_since(spec, scopes).await?;
    Ok(rows.iter().map(StreamEntity::upsert_msg).collect())
}

/// Builds the live filter from a defensive copy of the spec's id sets.
pub fn make_filter(spec: &MetricSubscriptionSpec) -> MetaResult<EntityFilter<MetricMsg>> {
    if spec.is_empty() {
        return Err(MetaError::InvalidResourcesRequest(
            "empty metric subscription spec".to_owned(),
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

    Ok(Box::new(move |msg: &MetricMsg| {
        trial_ids.contains(&msg.trial_id) || experiment_ids.contains(&msg.experiment_id)
    }))
}

/// Builds the permission filter from the user's accessible scopes.
pub async fn make_permission_filter(
    authz: &dyn StreamAuthz,
    user: &User,
) -> MetaResult<EntityFilter<MetricMsg>> {
    let scopes = authz.metric_streamable_scopes(user).await?;
    if scopes.global {
        return Ok(Box::new(|_| true));
    }
    Ok(Box::new(move |msg: &MetricMsg| {
        scopes.permits(msg.workspace_id)
    }))
}

/// [`MetricSource`] over the relational store.
pub struct SqlMetricSource {
    db: DatabaseConnection,
}

impl SqlMetricSource {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn query_ids(&self, where_clause: String) -> MetaResult<Vec<i64>> {
        let sql = format!(
            "SELECT metrics.id AS id FROM metrics \
             JOIN trials ON metrics.trial_id = trials.id \
             JOIN experiments ON trials.experiment_id = experiments.id \
             JOIN projects ON experiments.project_id = projects.id \
             WHERE {where_clause} ORDER BY metrics.id ASC",
        );
        let rows = self
            .db
            .query_all(Statement::from_string(DbBackend::Postgres, sql))
            .await?;
        rows.iter()
            .map(|row| row.try_get::<i64>("", "id").map_err(Into::into))
            .collect()
    }
}

#[async_trait]
impl MetricSource for SqlMetricSource {
    async fn matching_ids(
        &self,
        spec: &MetricSubscriptionSpec,
        scopes: &AccessScopeSet,
    ) -> MetaResult<Vec<i64>> {
        self.query_ids(format!(
            "({}) AND ({})",
            scope_clause(scopes),
            spec_clause(
                "metrics.trial_id",
                "trials.experiment_id",
                &spec.trial_ids,
                &spec.experiment_ids,
            ),
        ))
        .await
    }

    async fn load(&self, ids: &[i64], scopes: &AccessScopeSet) -> MetaResult<Vec<MetricMsg>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let sql = format!(
            "SELECT metrics.id AS id, metrics.trial_id AS trial_id, \
             metrics.trial_run_id AS trial_run_id, metrics.end_time AS end_time, \
             metrics.metrics AS metrics, metrics.total_batches AS total_batches, \
             metrics.metric_group AS metric_group, metrics.archived AS archived, \
             metrics.seq AS seq, projects.workspace_id AS workspace_id, \
             trials.experiment_id AS experiment_id \
             FROM metrics \
             JOIN trials ON metrics.trial_id = trials.id \
             JOIN experiments ON trials.experiment_id = experiments.id \
             JOIN projects ON experiments.project_id = projects.id \
             WHERE ({}) AND metrics.id IN ({}) ORDER BY metrics.id ASC",
            scope_clause(scopes),
            in_list(ids),
        );
        let rows = self
            .db
            .query_all(Statement::from_string(DbBackend::Postgres, sql))
            .await?;
        rows.iter()
            .map(|row| {
                Ok(MetricMsg {
                    id: row.try_get("", "id")?,
                    trial_id: row.try_get("", "trial_id")?,
                    trial_run_id: row.try_get("", "trial_run_id")?,
                    end_time: row.try_get("", "end_time")?,
                    metrics: row.try_get("", "metrics")?,
                    total_batches: row.try_get("", "total_batches")?,
                    metric_group: row.try_get("", "metric_group")?,
                    archived: row.try_get("", "archived")?,
                    seq: row.try_get("", "seq")?,
                    workspace_id: AccessScopeId(row.try_get::<i32>("", "workspace_id")?),
                    experiment_id: row.try_get("", "experiment_id")?,
                })
            })
            .collect()
    }

    async fn load_since(
        &self,
        spec: &MetricSubscriptionSpec,
        scopes: &AccessScopeSet,
    ) -> MetaResult<Vec<MetricMsg>> {
        let ids = self
            .query_ids(format!(
                "({}) AND ({}) AND metrics.seq > {}",
                scope_clause(scopes),
                spec_clause(
                    "metrics.trial_id",
                    "trials.experiment_id",
                    &spec.trial_ids,
                    &spec.experiment_ids,
                ),
                spec.since,
            ))
            .await?;
        self.load(&ids, scopes).await
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::stream::auth::test_utils::FixedScopes;

    struct MemMetricSource(Vec<MetricMsg>);

    #[async_trait]
    impl MetricSource for MemMetricSource {
        async fn matching_ids(
            &self,
            spec: &MetricSubscriptionSpec,
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

        async fn load(&self, ids: &[i64], scopes: &AccessScopeSet) -> MetaResult<Vec<MetricMsg>> {
            Ok(self
                .0
                .iter()
                .filter(|msg| ids.contains(&msg.id) && scopes.permits(msg.workspace_id))
                .cloned()
                .collect())
        }

        async fn load_since(
            &self,
            spec: &MetricSubscriptionSpec,
            scopes: &AccessScopeSet,
        ) -> MetaResult<Vec<MetricMsg>> {
            let ids = self.matching_ids(spec, scopes).await?;
            let mut rows = self.load(&ids, scopes).await?;
            rows.retain(|msg| msg.seq > spec.since);
            Ok(rows)
        }
    }

    fn metric(id: i64, trial_id: i64, workspace: i32) -> MetricMsg {
        MetricMsg {
            id,
            trial_id,
            experiment_id: 100 + trial_id,
            workspace_id: AccessScopeId(workspace),
            seq: id,
            ..MetricMsg::default()
        }
    }

    #[tokio::test]
    async fn test_startup_msgs_scoped_and_ordered() {
        let source = MemMetricSource(vec![
            metric(1, 1, 1),
            metric(2, 1, 1),
            metric(3, 1, 2),
        ]);
        let authz = FixedScopes(vec![AccessScopeId(1)]);
        let user = User::new(1, "alice");
        let spec = MetricSubscriptionSpec {
            trial_ids: vec![1],
            ..Default::default()
        };

        let out = collect_startup_msgs(&source, &authz, &user, "2,3", &spec)
            .await
            .unwrap();
        // Id 3 lives in an inaccessible workspace: it is deleted from the
        // client's set, never upserted.
        assert_eq!(out.len(), 2);
        assert_matches!(
            &out[0],
            StreamUpdate::Delete(DeleteMsg { deleted, .. }) if deleted == "3"
        );
        assert_eq!(out[1], metric(1, 1, 1).upsert_msg());
    }

    #[tokio::test]
    async fn test_empty_spec_emits_single_delete() {
        let source = MemMetricSource(vec![]);
        let authz = FixedScopes(vec![]);
        let user = User::new(1, "alice");
        let out = collect_startup_msgs(
            &source,
            &authz,
            &user,
            "1-5",
            &MetricSubscriptionSpec::default(),
        )
        .await
        .unwrap();
        assert_eq!(
            out,
            vec![StreamUpdate::Delete(DeleteMsg {
                key: METRICS_DELETE_KEY,
                deleted: "1-5".to_owned(),
            })]
        );
    }

    #[tokio::test]
    async fn test_filter_matches_trials_and_experiments() {
        let spec = MetricSubscriptionSpec {
            trial_ids: vec![1],
            experiment_ids: vec![105],
            ..Default::default()
        };
        let filter = make_filter(&spec).unwrap();
        assert!(filter(&metric(1, 1, 1)));
        assert!(filter(&metric(9, 5, 1)));
        assert!(!filter(&metric(2, 2, 1)));
    }
}
