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

//! The compact inventory of ids a subscriber claims to already hold, encoded
//! as sorted comma-separated ranges (`"1-3,7,10-12"`).

use std::collections::HashSet;

use anyhow::anyhow;

use crate::error::{MetaError, MetaResult};

/// Parses a known set into a sorted, deduplicated id list.
pub fn parse_known(known: &str) -> MetaResult<Vec<i64>> {
    let mut ids = vec![];
    for part in known.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((start, end)) => {
                let start: i64 = start
                    .parse()
                    .map_err(|_| MetaError::Internal(anyhow!("invalid known range {part:?}")))?;
                let end: i64 = end
                    .parse()
                    .map_err(|_| MetaError::Internal(anyhow!("invalid known range {part:?}")))?;
                if start > end {
                    return Err(MetaError::Internal(anyhow!("invalid known range {part:?}")));
                }
                ids.extend(start..=end);
            }
            None => ids.push(
                part.parse()
                    .map_err(|_| MetaError::Internal(anyhow!("invalid known id {part:?}")))?,
            ),
        }
    }
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

/// Encodes a sorted id list back into range form.
pub fn encode_known(ids: impl IntoIterator<Item = i64>) -> String {
    let mut out = String::new();
    let mut run: Option<(i64, i64)> = None;
    let mut flush = |run: &mut Option<(i64, i64)>, out: &mut String| {
        if let Some((start, end)) = run.take() {
            if !out.is_empty() {
                out.push(',');
            }
            if start == end {
                out.push_str(&start.to_string());
            } else {
                out.push_str(&format!("{start}-{end}"));
            }
        }
    };
    for id in ids {
        run = match run {
            Some((start, end)) if id == end + 1 => Some((start, id)),
            Some(_) => {
                flush(&mut run, &mut out);
                Some((id, id))
            }
            None => Some((id, id)),
        };
    }
    flush(&mut run, &mut out);
    out
}

/// Diffs the known set against the table's current membership. Returns the ids
/// the client holds but should not (range-encoded, ready for a delete message)
/// and the ids it is missing (to be hydrated into upserts).
pub fn process_known(known: &str, exist: &[i64]) -> MetaResult<(String, Vec<i64>)> {
    let known_ids = parse_known(known)?;
    let known_set: HashSet<i64> = known_ids.iter().copied().collect();
    let exist_set: HashSet<i64> = exist.iter().copied().collect();

    let missing = encode_known(known_ids.into_iter().filter(|id| !exist_set.contains(id)));
    let mut appeared: Vec<i64> = exist
        .iter()
        .copied()
        .filter(|id| !known_set.contains(id))
        .collect();
    appeared.sort_unstable();
    appeared.dedup();
    Ok((missing, appeared))
}
