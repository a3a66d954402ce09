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

//! WHERE-clause builders shared by the entity SQL sources. Filter ids are
//! validated integers rendered inline; binding arrays portably across
//! backends is not worth the trouble here.

use crate::stream::auth::AccessScopeSet;

pub(crate) fn in_list(ids: &[i64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn scope_clause(scopes: &AccessScopeSet) -> String {
    if scopes.global {
        "TRUE".to_owned()
    } else if scopes.workspaces.is_empty() {
        "FALSE".to_owned()
    } else {
        let mut ids: Vec<i32> = scopes.workspaces.iter().map(|s| s.0).collect();
        ids.sort_unstable();
        format!(
            "projects.workspace_id IN ({})",
            ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
        )
    }
}

pub(crate) fn spec_clause(
    trial_column: &str,
    experiment_column: &str,
    trial_ids: &[i64],
    experiment_ids: &[i64],
) -> String {
    let mut parts = vec![];
    if !trial_ids.is_empty() {
        parts.push(format!("{trial_column} IN ({})", in_list(trial_ids)));
    }
    if !experiment_ids.is_empty() {
        parts.push(format!("{experiment_column} IN ({})", in_list(experiment_ids)));
    }
    parts.join(" OR ")
}

#[cfg(test)]
mod tests {
    use bosun_common::id::AccessScopeId;

    use super::*;

    #[test]
    fn test_clauses() {
        assert_eq!(scope_clause(&AccessScopeSet::global()), "TRUE");
        assert_eq!(scope_clause(&AccessScopeSet::default()), "FALSE");
        assert_eq!(
            scope_clause(&AccessScopeSet::workspaces([
                AccessScopeId(2),
                AccessScopeId(1)
            ])),
            "projects.workspace_id IN (1,2)"
        );
        assert_eq!(
            spec_clause("trials.id", "trials.experiment_id", &[1, 2], &[]),
            "trials.id IN (1,2)"
        );
        assert_eq!(
            spec_clause("trials.id", "trials.experiment_id", &[1], &[7]),
            "trials.id IN (1) OR trials.experiment_id IN (7)"
        );
    }
}
