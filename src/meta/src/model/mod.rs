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

//! Persisted models for the two tables the control plane owns logically:
//! `resources_state` (one row per placed resource) and `container_snapshots`
//! (one row per container backing a resource). Both are written before any
//! allocated event is published, so a restart can rebuild pool state from them.

pub mod container_snapshot;
pub mod prelude;
pub mod resources_state;
