// Copyright 2026 The teltubby Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! C4: the album aggregator. Groups items sharing `(chat_id, group_id)`
//! into a single batch, closed by a per-group timer or a max-items
//! sentinel, whichever comes first. One owner task per open group; groups
//! aggregate in parallel, mutations within a group are serialized by the
//! bucket's mutex.
//!
//! Late arrivals for a group that has already closed open a *new* bucket
//! under the same key rather than being merged into the emitted batch —
//! the aggregator has no way to retroactively amend a batch it already
//! handed to the caller, and merging would make "emitted whole or not at
//! all" a lie.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::Instrument as _;

#[derive(Debug, Clone, Copy)]
pub struct AggregatorConfig {
    pub window: Duration,
    pub max_items: usize,
}

/// What the aggregator needs to know about one incoming item to group and
/// order it. Implemented by the pipeline's message-unit item type.
pub trait Groupable: Send + 'static {
    fn chat_id(&self) -> i64;
    fn group_id(&self) -> Option<String>;
    /// Transport-assigned sequence used as the primary ordering key
    /// within a group (e.g. the item's message id).
    fn sequence(&self) -> i64;
}

struct Bucket<T> {
    items: Vec<(i64, u64, T)>,
    generation: u64,
}

/// Groups incoming items and emits closed batches on `receiver()`. Items
/// with no group id are emitted immediately as a single-item batch.
pub struct Aggregator<T: Groupable> {
    config: AggregatorConfig,
    buckets: Arc<Mutex<HashMap<(i64, String), Bucket<T>>>>,
    arrival_counter: Arc<AtomicU64>,
    emit_tx: mpsc::UnboundedSender<Vec<T>>,
}

impl<T: Groupable> Aggregator<T> {
    #[must_use]
    pub fn new(config: AggregatorConfig) -> (Self, mpsc::UnboundedReceiver<Vec<T>>) {
        let (emit_tx, emit_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                buckets: Arc::new(Mutex::new(HashMap::new())),
                arrival_counter: Arc::new(AtomicU64::new(0)),
                emit_tx,
            },
            emit_rx,
        )
    }

    /// Feeds one item in. For grouped items this may open a new bucket
    /// (and arm its close timer) or append to an already-open one.
    pub async fn push(&self, item: T) {
        let Some(group_id) = item.group_id() else {
            let _ = self.emit_tx.send(vec![item]);
            return;
        };
        let key = (item.chat_id(), group_id);
        let arrival = self.arrival_counter.fetch_add(1, Ordering::Relaxed);
        let sequence = item.sequence();

        let mut buckets = self.buckets.lock().await;
        let close_now = match buckets.get_mut(&key) {
            Some(bucket) => {
                bucket.items.push((sequence, arrival, item));
                bucket.items.len() >= self.config.max_items
            }
            None => {
                let generation = arrival;
                buckets.insert(
                    key.clone(),
                    Bucket {
                        items: vec![(sequence, arrival, item)],
                        generation,
                    },
                );
                self.arm_close_timer(key.clone(), generation);
                false
            }
        };
        if close_now {
            if let Some(bucket) = buckets.remove(&key) {
                drop(buckets);
                self.emit(bucket);
            }
        }
    }

    /// Spawns the per-bucket close timer. Deliberately detached (not a
    /// [`teltubby_util::task::JoinHandleDropGuard`]): the bucket map entry,
    /// keyed by `generation`, is what decides whether this timer's firing
    /// still applies, not the task's own lifetime.
    fn arm_close_timer(&self, key: (i64, String), generation: u64) {
        let buckets = self.buckets.clone();
        let emit_tx = self.emit_tx.clone();
        let window = self.config.window;
        tokio::spawn(
            async move {
                tokio::time::sleep(window).await;
                let mut buckets = buckets.lock().await;
                match buckets.get(&key) {
                    Some(bucket) if bucket.generation == generation => {}
                    _ => return,
                }
                if let Some(bucket) = buckets.remove(&key) {
                    drop(buckets);
                    let mut items: Vec<_> = bucket.items;
                    items.sort_by_key(|(sequence, arrival, _)| (*sequence, *arrival));
                    let _ = emit_tx.send(items.into_iter().map(|(_, _, item)| item).collect());
                }
            }
            .instrument(tracing::info_span!("album_close_timer")),
        );
    }

    fn emit(&self, bucket: Bucket<T>) {
        let mut items = bucket.items;
        items.sort_by_key(|(sequence, arrival, _)| (*sequence, *arrival));
        let _ = self.emit_tx.send(items.into_iter().map(|(_, _, item)| item).collect());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestItem {
        chat_id: i64,
        group_id: Option<String>,
        sequence: i64,
        label: &'static str,
    }

    impl Groupable for TestItem {
        fn chat_id(&self) -> i64 {
            self.chat_id
        }
        fn group_id(&self) -> Option<String> {
            self.group_id.clone()
        }
        fn sequence(&self) -> i64 {
            self.sequence
        }
    }

    #[tokio::test]
    async fn ungrouped_item_emits_immediately() {
        let (agg, mut rx) = Aggregator::new(AggregatorConfig {
            window: Duration::from_secs(5),
            max_items: 10,
        });
        agg.push(TestItem { chat_id: 1, group_id: None, sequence: 1, label: "a" }).await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].label, "a");
    }

    #[tokio::test]
    async fn grouped_items_close_on_max_items() {
        let (agg, mut rx) = Aggregator::new(AggregatorConfig {
            window: Duration::from_secs(30),
            max_items: 2,
        });
        agg.push(TestItem { chat_id: 1, group_id: Some("g".into()), sequence: 1, label: "a" }).await;
        agg.push(TestItem { chat_id: 1, group_id: Some("g".into()), sequence: 2, label: "b" }).await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.iter().map(|i| i.label).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn grouped_items_close_on_timer_and_sort_by_sequence() {
        let (agg, mut rx) = Aggregator::new(AggregatorConfig {
            window: Duration::from_millis(50),
            max_items: 10,
        });
        agg.push(TestItem { chat_id: 1, group_id: Some("g".into()), sequence: 3, label: "c" }).await;
        agg.push(TestItem { chat_id: 1, group_id: Some("g".into()), sequence: 1, label: "a" }).await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.iter().map(|i| i.label).collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn late_arrival_after_close_opens_a_fresh_bucket() {
        let (agg, mut rx) = Aggregator::new(AggregatorConfig {
            window: Duration::from_millis(20),
            max_items: 10,
        });
        agg.push(TestItem { chat_id: 1, group_id: Some("g".into()), sequence: 1, label: "a" }).await;
        let first_batch = rx.recv().await.unwrap();
        assert_eq!(first_batch.len(), 1);

        agg.push(TestItem { chat_id: 1, group_id: Some("g".into()), sequence: 2, label: "b" }).await;
        let second_batch = rx.recv().await.unwrap();
        assert_eq!(second_batch.len(), 1);
        assert_eq!(second_batch[0].label, "b");
    }
}
