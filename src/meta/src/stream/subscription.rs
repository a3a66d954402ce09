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

//! Live fan-out of change-feed rows to subscribers. Filters are pure closures
//! over defensive copies of the subscription spec, so they run off the spec
//! owner's thread without synchronization.

use tokio::sync::mpsc;

use crate::stream::{ChangeEvent, StreamEntity, StreamUpdate};

/// Decides, for one row, whether a subscriber should see it.
pub type EntityFilter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

const SUBSCRIBER_BUFFER: usize = 64;

struct Subscriber<T> {
    filter: EntityFilter<T>,
    permission: EntityFilter<T>,
    tx: mpsc::Sender<StreamUpdate>,
}

impl<T: StreamEntity> Subscriber<T> {
    /// The message this subscriber should receive for one change, if any. A
    /// row that falls out of the filtered-and-permitted set is observed as a
    /// deletion; a row that was never visible is not observed at all.
    fn message_for(&self, event: &ChangeEvent<T>) -> Option<StreamUpdate> {
        let visible = |row: &T| (self.filter)(row) && (self.permission)(row);
        match (&event.before, &event.after) {
            (_, Some(after)) if visible(after) => Some(after.upsert_msg()),
            (Some(before), _) if visible(before) => Some(before.delete_msg()),
            _ => None,
        }
    }
}

/// Per-entity fan-out. Each subscriber observes its own filtered sequence, in
/// feed order; subscribers whose receiver went away are dropped on the next
/// broadcast.
pub struct Publisher<T> {
    subscribers: Vec<Subscriber<T>>,
}

impl<T: StreamEntity> Publisher<T> {
    pub fn new() -> Self {
        Self {
            subscribers: vec![],
        }
    }

    pub fn subscribe(
        &mut self,
        filter: EntityFilter<T>,
        permission: EntityFilter<T>,
    ) -> mpsc::Receiver<StreamUpdate> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.push(Subscriber {
            filter,
            permission,
            tx,
        });
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Delivers a batch of change-feed records to every subscriber.
    pub async fn broadcast(&mut self, events: &[ChangeEvent<T>]) {
        let mut closed = vec![];
        for (index, subscriber) in self.subscribers.iter().enumerate() {
            for event in events {
                let Some(update) = subscriber.message_for(event) else {
                    continue;
                };
                if subscriber.tx.send(update).await.is_err() {
                    closed.push(index);
                    break;
                }
            }
        }
        for index in closed.into_iter().rev() {
            self.subscribers.swap_remove(index);
        }
    }
}

impl<T: StreamEntity> Default for Publisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use bosun_common::id::AccessScopeId;

    use super::*;
    use crate::stream::metrics::MetricMsg;

    fn metric(id: i64, trial_id: i64, workspace: i32) -> MetricMsg {
        MetricMsg {
            id,
            trial_id,
            workspace_id: AccessScopeId(workspace),
            ..MetricMsg::default()
        }
    }

    fn trial_filter(trial_id: i64) -> EntityFilter<MetricMsg> {
        Box::new(move |msg: &MetricMsg| msg.trial_id == trial_id)
    }

    fn allow_all() -> EntityFilter<MetricMsg> {
        Box::new(|_| true)
    }

    #[tokio::test]
    async fn test_broadcast_applies_both_filters() {
        let mut publisher = Publisher::new();
        let mut rx = publisher.subscribe(
            trial_filter(1),
            Box::new(|msg: &MetricMsg| msg.workspace_id == AccessScopeId(7)),
        );

        publisher
            .broadcast(&[
                ChangeEvent::insert(metric(10, 1, 7)),
                ChangeEvent::insert(metric(11, 2, 7)),
                ChangeEvent::insert(metric(12, 1, 8)),
            ])
            .await;
        drop(publisher);

        let mut seen = vec![];
        while let Some(update) = rx.recv().await {
            seen.push(update);
        }
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], metric(10, 1, 7).upsert_msg());
    }

    #[tokio::test]
    async fn test_row_leaving_the_set_is_observed_as_delete() {
        let mut publisher = Publisher::new();
        let mut rx = publisher.subscribe(trial_filter(1), allow_all());

        let before = metric(10, 1, 7);
        let mut after = before.clone();
        after.trial_id = 2;
        publisher
            .broadcast(&[ChangeEvent::update(before.clone(), after)])
            .await;
        drop(publisher);

        assert_eq!(rx.recv().await.unwrap(), before.delete_msg());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_dropped() {
        let mut publisher = Publisher::new();
        let rx = publisher.subscribe(allow_all(), allow_all());
        drop(rx);

        publisher
            .broadcast(&[ChangeEvent::insert(metric(10, 1, 7))])
            .await;
        assert_eq!(publisher.subscriber_count(), 0);
    }
}
