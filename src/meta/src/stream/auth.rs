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

use std::collections::HashSet;

use async_trait::async_trait;
use bosun_common::id::AccessScopeId;
use bosun_common::user::User;

use crate::error::MetaResult;

/// The workspaces a user may stream from; `global` short-circuits them all.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessScopeSet {
    pub global: bool,
    pub workspaces: HashSet<AccessScopeId>,
}

impl AccessScopeSet {
    pub fn global() -> Self {
        Self {
            global: true,
            workspaces: HashSet::new(),
        }
    }

    pub fn workspaces(ids: impl IntoIterator<Item = AccessScopeId>) -> Self {
        Self {
            global: false,
            workspaces: ids.into_iter().collect(),
        }
    }

    pub fn permits(&self, scope: AccessScopeId) -> bool {
        self.global || self.workspaces.contains(&scope)
    }
}

/// RBAC lookup of streamable scopes (a collaborator; the actual role tables
/// live behind it).
#[async_trait]
pub trait StreamAuthz: Send + Sync + 'static {
    async fn checkpoint_streamable_scopes(&self, user: &User) -> MetaResult<AccessScopeSet>;
    async fn metric_streamable_scopes(&self, user: &User) -> MetaResult<AccessScopeSet>;
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    /// Grants fixed scopes to everyone; admins get global access.
    pub(crate) struct FixedScopes(pub Vec<AccessScopeId>);

    #[async_trait]
    impl StreamAuthz for FixedScopes {
        async fn checkpoint_streamable_scopes(&self, user: &User) -> MetaResult<AccessScopeSet> {
            if user.is_admin {
                return Ok(AccessScopeSet::global());
            }
            Ok(AccessScopeSet::workspaces(self.0.iter().copied()))
        }

        async fn metric_streamable_scopes(&self, user: &User) -> MetaResult<AccessScopeSet> {
            self.checkpoint_streamable_scopes(user).await
        }
    }
}
