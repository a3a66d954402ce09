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

use bosun_common::id::AgentId;
use thiserror::Error;

/// A specialized Result type for control-plane operations.
pub type MetaResult<T> = std::result::Result<T, MetaError>;

/// The error type for control-plane operations.
///
/// Transient downstream errors are retried only by long-lived watchers; request
/// handlers classify and surface them instead.
#[derive(Error, Debug)]
pub enum MetaError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid resources request: {0}")]
    InvalidResourcesRequest(String),

    #[error("restore failed: {0}")]
    Restore(String),

    #[error("agent {agent_id} refused reservation: {reason}")]
    Reserve { agent_id: AgentId, reason: String },

    #[error("persistence failure: {0}")]
    Persistence(#[from] sea_orm::DbErr),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("provisioner failure: {0}")]
    Provisioner(String),

    #[error("{0} channel closed")]
    Unavailable(&'static str),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MetaError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn reserve(agent_id: AgentId, reason: impl Into<String>) -> Self {
        Self::Reserve {
            agent_id,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MetaError::not_found("job", "j-1");
        assert_eq!(err.to_string(), "job j-1 not found");

        let err = MetaError::reserve(AgentId::from("a0"), "no free slots");
        assert_eq!(
            err.to_string(),
            "agent a0 refused reservation: no free slots"
        );
    }
}
