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

//! The live subscription engine. For each streamable table it computes the
//! smallest correct catch-up batch for a (re)connecting subscriber, then fans
//! out change-feed rows through pure, per-subscriber filters.
//!
//! Catch-up always emits deletions before upserts so a client's state never
//! transiently contains stale rows.

use bosun_common::id::AccessScopeId;
use serde::Serialize;

pub mod auth;
pub mod checkpoints;
pub mod heartbeat;
pub mod known;
pub mod metrics;
pub(crate) mod sql;
pub mod subscription;

/// Recommended cap on one framed message handed to the transport.
pub const MAX_MESSAGE_SIZE: usize = 128 << 20;

#[derive(Clone, Debug, PartialEq)]
pub struct UpsertMsg {
    pub json_key: &'static str,
    pub msg: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeleteMsg {
    pub key: &'static str,
    /// Range-encoded ids, e.g. `"1-3,7"`.
    pub deleted: String,
}

/// One message toward a subscriber.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamUpdate {
    Upsert(UpsertMsg),
    Delete(DeleteMsg),
}

/// A row of a streamable table: immutable key, monotonically increasing
/// sequence number, and a workspace permission scope. `seq` strictly increases
/// per table, so all subscribers observe the same order.
pub trait StreamEntity: Clone + Serialize + Send + Sync + 'static {
    const UPSERT_KEY: &'static str;
    const DELETE_KEY: &'static str;

    fn id(&self) -> i64;
    fn seq_num(&self) -> i64;
    fn workspace_id(&self) -> AccessScopeId;

    fn upsert_msg(&self) -> StreamUpdate {
        StreamUpdate::Upsert(UpsertMsg {
            json_key: Self::UPSERT_KEY,
            // Rows are plain structs; serialization cannot fail.
            msg: serde_json::to_value(self).expect("streamable row serializes"),
        })
    }

    fn delete_msg(&self) -> StreamUpdate {
        StreamUpdate::Delete(DeleteMsg {
            key: Self::DELETE_KEY,
            deleted: self.id().to_string(),
        })
    }
}

/// One change-feed record: the row image before and after the change. Inserts
/// have no `before`, deletions no `after`.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent<T> {
    pub before: Option<T>,
    pub after: Option<T>,
}

impl<T> ChangeEvent<T> {
    pub fn insert(row: T) -> Self {
        Self {
            before: None,
            after: Some(row),
        }
    }

    pub fn update(before: T, after: T) -> Self {
        Self {
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn delete(row: T) -> Self {
        Self {
            before: Some(row),
            after: None,
        }
    }
}
