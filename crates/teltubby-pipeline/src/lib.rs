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

//! C5: the ingestion pipeline. [`commit::Pipeline`] is the entry point the
//! bot surface and the queue worker both drive; [`types`] is the shared
//! data model between a raw aggregated unit and its resolved archive form.

pub mod commit;
pub mod json;
pub mod metrics;
pub mod types;

pub use commit::{Pipeline, PipelineConfig, PreValidationFailure, UnitOutcome};
pub use metrics::PipelineMetrics;
pub use types::{ArchiveUnit, DedupReason, Item, ItemOutcome, ItemResult, MessageUnit, SCHEMA_VERSION};

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::registry::Registry;
    use std::sync::Arc;
    use teltubby_dedup::{pool, DedupIndex};
    use teltubby_queue::fakes::InMemoryQueue;
    use teltubby_store::fakes::InMemoryObjectStore;
    use teltubby_transport::fakes::InMemoryBotTransport;
    use teltubby_transport::{FileHandle, MediaKind};
    use tokio::sync::watch;

    async fn test_pipeline() -> (Pipeline, Arc<InMemoryObjectStore>, Arc<InMemoryBotTransport>, watch::Sender<teltubby_quota::QuotaState>) {
        let pool = pool::connect_in_memory().await.unwrap();
        let dedup = Arc::new(DedupIndex::new(pool));
        let store = Arc::new(InMemoryObjectStore::new());
        let queue: Arc<dyn teltubby_queue::Queue> = Arc::new(InMemoryQueue::default());
        let bot = Arc::new(InMemoryBotTransport::default());
        let (quota_tx, quota_rx) = watch::channel(teltubby_quota::QuotaState::Open);
        let mut registry = Registry::default();
        let metrics = Arc::new(PipelineMetrics::register(&mut registry));
        let config = PipelineConfig {
            bucket: "teltubby".to_string(),
            max_file_bytes: 4 * 1024 * 1024 * 1024,
            inline_limit_bytes: 50 * 1024 * 1024,
            max_filename_len: 120,
            max_key_len: 512,
            max_job_retries: 3,
        };
        let pipeline = Pipeline::new(store.clone(), dedup, queue, bot.clone(), quota_rx, metrics, config);
        (pipeline, store, bot, quota_tx)
    }

    fn sample_unit(message_id: i64, file_id: &str, unique_id: &str, bytes: &'static [u8]) -> MessageUnit {
        MessageUnit {
            chat_id: 1,
            message_id,
            media_group_id: None,
            curator_user_id: 9,
            message_timestamp: chrono::Utc::now(),
            chat_title: Some("Curators".to_string()),
            chat_username: None,
            sender_id: 9,
            sender_username: Some("alice".to_string()),
            forward_origin: None,
            caption_plain: Some("a lovely photo".to_string()),
            caption_entities: vec![],
            entities: vec![],
            items: vec![Item {
                ordinal: 1,
                kind: MediaKind::Photo,
                handle: FileHandle {
                    file_id: file_id.to_string(),
                    file_unique_id: unique_id.to_string(),
                    size_hint_bytes: Some(bytes.len() as u64),
                    kind: MediaKind::Photo,
                    original_filename: Some("photo.jpg".to_string()),
                    mime_type: Some("image/jpeg".to_string()),
                    width: Some(800),
                    height: Some(600),
                    duration_secs: None,
                },
            }],
        }
    }

    #[tokio::test]
    async fn single_item_unit_commits_and_writes_message_json() {
        let (pipeline, store, bot, _quota_tx) = test_pipeline().await;
        bot.files.lock().unwrap().insert("f1".to_string(), bytes::Bytes::from_static(b"hello jpeg bytes"));
        let unit = sample_unit(100, "f1", "u1", b"hello jpeg bytes");

        let outcome = pipeline.commit_unit(unit).await.unwrap();
        match outcome {
            UnitOutcome::Committed { unit, queued_job_ids } => {
                assert!(queued_job_ids.is_empty());
                assert_eq!(unit.files_count(), 1);
                let message_json_key = format!("{}message.json", unit.prefix);
                assert!(store.contents(&message_json_key).is_some());
            }
            other => panic!("expected Committed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resubmitting_identical_bytes_is_marked_duplicate() {
        let (pipeline, _store, bot, _quota_tx) = test_pipeline().await;
        bot.files.lock().unwrap().insert("f1".to_string(), bytes::Bytes::from_static(b"same bytes"));
        bot.files.lock().unwrap().insert("f2".to_string(), bytes::Bytes::from_static(b"same bytes"));

        let first = sample_unit(1, "f1", "u1", b"same bytes");
        let first_outcome = pipeline.commit_unit(first).await.unwrap();
        let first_key = match first_outcome {
            UnitOutcome::Committed { unit, .. } => unit.items[0].s3_key.clone().unwrap(),
            other => panic!("expected Committed, got {other:?}"),
        };

        let second = sample_unit(2, "f2", "u2", b"same bytes");
        let second_outcome = pipeline.commit_unit(second).await.unwrap();
        match second_outcome {
            UnitOutcome::Committed { unit, .. } => {
                assert_eq!(unit.unit_duplicate_of(), Some((first_key, DedupReason::Sha256)));
            }
            other => panic!("expected Committed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversize_item_is_rejected_before_any_upload() {
        let (pipeline, store, _bot, _quota_tx) = test_pipeline().await;
        let mut unit = sample_unit(3, "f1", "u1", b"irrelevant");
        unit.items[0].handle.size_hint_bytes = Some(8 * 1024 * 1024 * 1024);

        let outcome = pipeline.commit_unit(unit).await.unwrap();
        match outcome {
            UnitOutcome::Rejected { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].reason, "oversize_configured");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
        assert!(store.list_prefix("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn quota_full_refuses_admission_without_touching_the_store() {
        let (pipeline, store, bot, quota_tx) = test_pipeline().await;
        quota_tx.send(teltubby_quota::QuotaState::Closed).unwrap();
        bot.files.lock().unwrap().insert("f1".to_string(), bytes::Bytes::from_static(b"data"));
        let unit = sample_unit(4, "f1", "u1", b"data");

        let outcome = pipeline.commit_unit(unit).await.unwrap();
        assert!(matches!(outcome, UnitOutcome::QuotaFull));
        assert!(store.list_prefix("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversize_compared_to_inline_limit_is_split_into_a_queued_job() {
        let (pipeline, store, bot, _quota_tx) = test_pipeline().await;
        let mut unit = sample_unit(5, "f1", "u1", b"data");
        unit.items[0].handle.size_hint_bytes = Some(80 * 1024 * 1024);
        bot.files.lock().unwrap().insert("f1".to_string(), bytes::Bytes::from_static(b"data"));

        let outcome = pipeline.commit_unit(unit).await.unwrap();
        match outcome {
            UnitOutcome::Committed { unit, queued_job_ids } => {
                assert_eq!(queued_job_ids.len(), 1);
                assert!(unit.items.is_empty());
            }
            other => panic!("expected Committed with a queued job, got {other:?}"),
        }
        assert!(store.list_prefix("").await.unwrap().is_empty());
    }
}
