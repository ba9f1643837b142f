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

//! C8: the queue worker. [`Worker::run_envelope`] is the ten-step
//! algorithm run against one delivery's parsed payload; it never touches
//! the broker directly, so it's exercised in tests against the in-memory
//! queue/store/transport fakes. The broker-facing ack/nack decision lives
//! one layer up, in the binary that owns the `lapin::Consumer`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use teltubby_dedup::DedupIndex;
use teltubby_error::{make_err, Code, Error, ResultExt};
use teltubby_layout::NameContext;
use teltubby_pipeline::json;
use teltubby_pipeline::types::{ArchiveUnit, DedupReason, Item, ItemOutcome, ItemResult, MessageUnit};
use teltubby_queue::{Job, JobPublisher, JobState, Queue, QueueEnvelope};
use teltubby_store::ObjectStore;
use teltubby_transport::{extension_for, BotTransport, FileHandle, MediaKind, UserTransport};
use teltubby_util::buf_channel::make_buf_channel_pair;
use teltubby_util::digest::StreamingHasher;
use teltubby_util::metrics::KindLabel;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use uuid::Uuid;

use crate::metrics::WorkerMetrics;
use crate::session::SessionState;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub bucket: String,
    pub max_filename_len: usize,
    pub max_key_len: usize,
    /// Base delay before a transient-failure requeue; the worker sleeps
    /// `base * retry_count` in-process, since the broker topology has no
    /// delayed-message plugin configured.
    pub requeue_base_delay: Duration,
}

/// What happened to one delivery, once it's been fully handled. Mirrors
/// `teltubby_pipeline::UnitOutcome`'s granularity but for exactly one item.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The job row didn't exist locally; a broker-level bug or a row lost
    /// to a database wipe. Permanent: reject without requeue.
    UnknownJob,
    /// The job was already resolved (e.g. an operator cancelled it between
    /// publish and delivery); nothing to do.
    AckedNoWork,
    /// The user-protocol session is down; the delivery is nacked with
    /// requeue and no retry is consumed.
    HeldForSession,
    /// `CANCELLATION_REQUESTED` was observed at a checkpoint.
    Cancelled,
    /// A transient failure with retries remaining; republished with an
    /// incremented retry count.
    Requeued { retry_count: u32 },
    /// Retries exhausted, or a permanent failure. Reject without requeue;
    /// the broker's dead-letter topology routes it to `failed_jobs`.
    Failed { reason: String },
    /// Uploaded and registered as a new object.
    Stored { s3_key: String },
    /// Resolved as a duplicate of an existing object; no bytes uploaded.
    Duplicate { duplicate_of: String },
}

pub struct Worker {
    store: Arc<dyn ObjectStore>,
    dedup: Arc<DedupIndex>,
    queue: Arc<dyn Queue>,
    publisher: Arc<dyn JobPublisher>,
    transport: Arc<dyn UserTransport>,
    bot: Arc<dyn BotTransport>,
    session: watch::Receiver<SessionState>,
    metrics: Arc<WorkerMetrics>,
    config: WorkerConfig,
}

impl Worker {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        dedup: Arc<DedupIndex>,
        queue: Arc<dyn Queue>,
        publisher: Arc<dyn JobPublisher>,
        transport: Arc<dyn UserTransport>,
        bot: Arc<dyn BotTransport>,
        session: watch::Receiver<SessionState>,
        metrics: Arc<WorkerMetrics>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            dedup,
            queue,
            publisher,
            transport,
            bot,
            session,
            metrics,
            config,
        }
    }

    /// Runs the ten-step algorithm for one already-parsed delivery.
    pub async fn run_envelope(&self, envelope: QueueEnvelope) -> Result<RunOutcome, Error> {
        let job = match self.queue.get(envelope.job_id).await? {
            Some(job) => job,
            None => return Ok(self.finish_outcome(RunOutcome::UnknownJob)),
        };
        if job.state != JobState::Pending {
            return Ok(self.finish_outcome(RunOutcome::AckedNoWork));
        }
        if !self.session.borrow().is_active() {
            return Ok(self.finish_outcome(RunOutcome::HeldForSession));
        }

        self.queue.record_state(envelope.job_id, JobState::Processing, None).await?;

        if self.cancellation_requested(envelope.job_id).await? {
            self.queue.record_state(envelope.job_id, JobState::Cancelled, None).await?;
            return Ok(self.finish_outcome(RunOutcome::Cancelled));
        }

        match self.process(&envelope).await {
            Ok(outcome) => {
                self.queue.record_state(envelope.job_id, JobState::Completed, None).await?;
                let text = completion_text(&outcome);
                let _ = self.bot.send_ack(envelope.chat_id, &text).await;
                Ok(self.finish_outcome(outcome))
            }
            Err(err) if err.kind == Some("cancelled") => {
                self.queue.record_state(envelope.job_id, JobState::Cancelled, None).await?;
                Ok(self.finish_outcome(RunOutcome::Cancelled))
            }
            Err(err) if !is_transient(&err) => {
                self.queue
                    .record_state(envelope.job_id, JobState::Failed, Some(&err.to_string()))
                    .await?;
                Ok(self.finish_outcome(RunOutcome::Failed { reason: err.to_string() }))
            }
            Err(err) => self.requeue_or_fail(&envelope, &job, &err).await,
        }
    }

    async fn requeue_or_fail(&self, envelope: &QueueEnvelope, job: &Job, err: &Error) -> Result<RunOutcome, Error> {
        let retry_count = envelope.job_metadata.retry_count + 1;
        if retry_count > envelope.job_metadata.max_retries {
            self.queue
                .record_state(envelope.job_id, JobState::Failed, Some(&err.to_string()))
                .await?;
            return Ok(self.finish_outcome(RunOutcome::Failed { reason: err.to_string() }));
        }

        tokio::time::sleep(self.config.requeue_base_delay * retry_count).await;

        let mut republished = envelope.clone();
        republished.job_metadata.retry_count = retry_count;
        self.publisher.republish(&republished).await.err_tip(|| "republishing job for retry")?;
        self.queue.record_state(job.job_id, JobState::Pending, None).await?;
        Ok(self.finish_outcome(RunOutcome::Requeued { retry_count }))
    }

    async fn cancellation_requested(&self, job_id: Uuid) -> Result<bool, Error> {
        Ok(self.queue.get(job_id).await?.map(|j| j.cancellation_requested).unwrap_or(false))
    }

    async fn process(&self, envelope: &QueueEnvelope) -> Result<RunOutcome, Error> {
        let unit = unit_from_envelope(envelope);
        let item = &unit.items[0];
        let ctx = name_context(&unit);
        let prefix = teltubby_layout::prefix_for(&ctx.as_ctx());

        if let Some(sha256) = self.dedup.lookup_by_unique_id(&item.handle.file_unique_id).await? {
            if let Some(record) = self.dedup.lookup_by_hash(&sha256).await? {
                self.record_dedup_hit(DedupReason::UniqueId);
                let duplicate_of = record.s3_key.clone();
                self.write_unit_metadata(
                    &unit,
                    &prefix,
                    item,
                    ItemOutcome::Duplicate { duplicate_of: duplicate_of.clone(), reason: DedupReason::UniqueId },
                    Some(record.size as u64),
                    None,
                )
                .await?;
                return Ok(RunOutcome::Duplicate { duplicate_of });
            }
        }

        if self.cancellation_requested(envelope.job_id).await? {
            return Err(make_err!(Code::Cancelled, "cancelled before fetch").with_kind("cancelled"));
        }

        let mut body = self
            .transport
            .download(&item.handle)
            .await
            .err_tip(|| "downloading via user-protocol transport")?;
        let staged = tempfile::NamedTempFile::new().err_tip(|| "creating staging file for download")?;
        let mut staged_file =
            tokio::fs::File::create(staged.path()).await.err_tip(|| "opening staging file")?;
        let mut hasher = StreamingHasher::new();
        loop {
            let chunk = body.recv().await.err_tip(|| "reading user-protocol stream")?;
            if chunk.is_empty() {
                break;
            }
            hasher.update(&chunk);
            staged_file.write_all(&chunk).await.err_tip(|| "writing staging file")?;
        }
        staged_file.flush().await.err_tip(|| "flushing staging file")?;
        drop(staged_file);
        let digest = hasher.finalize();
        let sha256 = digest.hash_str();

        if let Some(record) = self.dedup.lookup_by_hash(&sha256).await? {
            self.record_dedup_hit(DedupReason::Sha256);
            let duplicate_of = record.s3_key.clone();
            self.write_unit_metadata(
                &unit,
                &prefix,
                item,
                ItemOutcome::Duplicate { duplicate_of: duplicate_of.clone(), reason: DedupReason::Sha256 },
                Some(record.size as u64),
                None,
            )
            .await?;
            return Ok(RunOutcome::Duplicate { duplicate_of });
        }

        if self.cancellation_requested(envelope.job_id).await? {
            return Err(make_err!(Code::Cancelled, "cancelled before upload").with_kind("cancelled"));
        }

        let ext = extension_for(&item.handle);
        let filename = teltubby_layout::filename_for(&ctx.as_ctx(), item.ordinal, &ext, self.config.max_filename_len);
        let key = teltubby_layout::key_for(&prefix, &filename, self.config.max_key_len);
        let mime = item.handle.mime_type.clone().unwrap_or_else(|| "application/octet-stream".to_string());
        let size_bytes = digest.size_bytes;

        self.store
            .put_file(&key, staged.path(), &mime)
            .await
            .err_tip(|| "uploading via object store")?;

        match self.dedup.register(&sha256, &key, size_bytes as i64, &mime, Some(&item.handle.file_unique_id)).await {
            Ok(()) => {
                self.write_unit_metadata(
                    &unit,
                    &prefix,
                    item,
                    ItemOutcome::Stored { sha256, size_bytes },
                    Some(size_bytes),
                    Some(key.clone()),
                )
                .await?;
                Ok(RunOutcome::Stored { s3_key: key })
            }
            Err(err) if err.kind == Some("dedup_conflict") => {
                let _ = self.store.delete(&key).await;
                let record = match self.dedup.lookup_by_hash(&sha256).await? {
                    Some(record) => record,
                    None => return Err(err.tip("dedup_conflict but no winning record found")),
                };
                self.record_dedup_hit(DedupReason::Sha256);
                let duplicate_of = record.s3_key.clone();
                self.write_unit_metadata(
                    &unit,
                    &prefix,
                    item,
                    ItemOutcome::Duplicate { duplicate_of: duplicate_of.clone(), reason: DedupReason::Sha256 },
                    Some(record.size as u64),
                    None,
                )
                .await?;
                Ok(RunOutcome::Duplicate { duplicate_of })
            }
            Err(err) => Err(err),
        }
    }

    async fn write_unit_metadata(
        &self,
        unit: &MessageUnit,
        prefix: &str,
        item: &Item,
        outcome: ItemOutcome,
        size_bytes: Option<u64>,
        s3_key: Option<String>,
    ) -> Result<(), Error> {
        let handle = &item.handle;
        let archived = ArchiveUnit {
            prefix: prefix.to_string(),
            items: vec![ItemResult {
                ordinal: item.ordinal,
                kind: item.kind,
                mime_type: handle.mime_type.clone(),
                size_bytes,
                width: handle.width,
                height: handle.height,
                duration_secs: handle.duration_secs,
                file_id: handle.file_id.clone(),
                file_unique_id: handle.file_unique_id.clone(),
                original_filename: handle.original_filename.clone(),
                s3_key,
                outcome,
            }],
            notes: None,
        };
        let artifact = json::build(&self.config.bucket, unit, &archived, Utc::now());
        let payload = serde_json::to_vec_pretty(&artifact).err_tip(|| "encoding message.json")?;
        let key = format!("{prefix}message.json");
        let (mut tx, rx) = make_buf_channel_pair();
        let send_task = tokio::spawn(async move {
            let _ = tx.send(bytes::Bytes::from(payload)).await;
            let _ = tx.send_eof().await;
        });
        let result = self.store.put(&key, rx, "application/json").await;
        let _ = send_task.await;
        result
    }

    fn record_dedup_hit(&self, reason: DedupReason) {
        let kind = match reason {
            DedupReason::UniqueId => "unique_id",
            DedupReason::Sha256 => "sha256",
        };
        self.metrics.dedup_hits.get_or_create(&KindLabel { kind: kind.to_string() }).inc();
    }

    fn finish_outcome(&self, outcome: RunOutcome) -> RunOutcome {
        self.metrics
            .jobs_by_outcome
            .get_or_create(&KindLabel { kind: outcome_label(&outcome).to_string() })
            .inc();
        outcome
    }
}

fn is_transient(err: &Error) -> bool {
    matches!(err.code, Code::Unavailable | Code::Internal)
}

fn outcome_label(outcome: &RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::UnknownJob => "unknown_job",
        RunOutcome::AckedNoWork => "acked_no_work",
        RunOutcome::HeldForSession => "held_for_session",
        RunOutcome::Cancelled => "cancelled",
        RunOutcome::Requeued { .. } => "requeued",
        RunOutcome::Failed { .. } => "failed",
        RunOutcome::Stored { .. } => "stored",
        RunOutcome::Duplicate { .. } => "duplicate",
    }
}

fn completion_text(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Stored { s3_key } => format!("archived large file to {s3_key}"),
        RunOutcome::Duplicate { duplicate_of } => format!("already archived (duplicate of {duplicate_of})"),
        _ => "large file job finished".to_string(),
    }
}

fn unit_from_envelope(envelope: &QueueEnvelope) -> MessageUnit {
    let info = &envelope.file_info;
    MessageUnit {
        chat_id: envelope.chat_id,
        message_id: envelope.message_id,
        media_group_id: envelope.telegram_context.media_group_id.clone(),
        curator_user_id: envelope.user_id,
        message_timestamp: envelope.job_metadata.created_at,
        chat_title: None,
        chat_username: None,
        sender_id: envelope.user_id,
        sender_username: None,
        forward_origin: envelope.telegram_context.forward_origin.clone(),
        caption_plain: envelope.telegram_context.caption.clone(),
        caption_entities: vec![],
        entities: envelope.telegram_context.entities.clone().unwrap_or_default(),
        items: vec![Item {
            ordinal: 1,
            kind: media_kind_from_str(&info.file_type),
            handle: FileHandle {
                file_id: info.file_id.clone(),
                file_unique_id: info.file_unique_id.clone(),
                size_hint_bytes: info.file_size,
                kind: media_kind_from_str(&info.file_type),
                original_filename: info.file_name.clone(),
                mime_type: info.mime_type.clone(),
                width: None,
                height: None,
                duration_secs: None,
            },
        }],
    }
}

fn media_kind_from_str(kind: &str) -> MediaKind {
    match kind {
        "photo" => MediaKind::Photo,
        "video" => MediaKind::Video,
        "document" => MediaKind::Document,
        "audio" => MediaKind::Audio,
        "voice" => MediaKind::Voice,
        "animation" => MediaKind::Animation,
        "video_note" => MediaKind::VideoNote,
        "sticker" => MediaKind::Sticker,
        _ => MediaKind::Other,
    }
}


struct NameContextOwned {
    message_timestamp: chrono::DateTime<Utc>,
    message_id: i64,
    media_group_id: Option<String>,
    chat_slug_source: String,
    sender: String,
    caption: Option<String>,
}

impl NameContextOwned {
    fn as_ctx(&self) -> NameContext<'_> {
        NameContext {
            message_timestamp: self.message_timestamp,
            message_id: self.message_id,
            media_group_id: self.media_group_id.as_deref(),
            chat_slug_source: &self.chat_slug_source,
            sender: &self.sender,
            caption: self.caption.as_deref(),
        }
    }
}

fn name_context(unit: &MessageUnit) -> NameContextOwned {
    NameContextOwned {
        message_timestamp: unit.message_timestamp,
        message_id: unit.message_id,
        media_group_id: unit.media_group_id.clone(),
        chat_slug_source: unit.chat_slug_source(),
        sender: unit.sender_slug_source(),
        caption: unit.caption_plain.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use teltubby_dedup::pool;
    use teltubby_error::Code;
    use teltubby_queue::fakes::InMemoryQueue;
    use teltubby_queue::{FileInfo, NewJob, TelegramContext};
    use teltubby_store::fakes::InMemoryObjectStore;
    use teltubby_transport::fakes::InMemoryBotTransport;
    use teltubby_util::buf_channel::DropCloserReadHalf;

    struct FakeUserTransport {
        files: std::sync::Mutex<std::collections::HashMap<String, bytes::Bytes>>,
        fail_with: Option<Error>,
    }

    #[async_trait]
    impl UserTransport for FakeUserTransport {
        async fn download(&self, handle: &FileHandle) -> Result<DropCloserReadHalf, Error> {
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            let data = self.files.lock().unwrap().get(&handle.file_id).cloned().unwrap();
            let (mut tx, rx) = make_buf_channel_pair();
            tokio::spawn(async move {
                let _ = tx.send(data).await;
                let _ = tx.send_eof().await;
            });
            Ok(rx)
        }

        async fn probe_session(&self) -> Result<bool, Error> {
            Ok(true)
        }
    }

    async fn harness(
        transport: Arc<FakeUserTransport>,
    ) -> (Worker, Arc<InMemoryQueue>, Arc<InMemoryObjectStore>, Arc<InMemoryBotTransport>) {
        let pool = pool::connect_in_memory().await.unwrap();
        let dedup = Arc::new(DedupIndex::new(pool));
        let store = Arc::new(InMemoryObjectStore::new());
        let queue = Arc::new(InMemoryQueue::default());
        let bot = Arc::new(InMemoryBotTransport::default());
        let (_tx, rx) = watch::channel(SessionState::Active);
        let mut registry = prometheus_client::registry::Registry::default();
        let metrics = Arc::new(WorkerMetrics::register(&mut registry));
        let config = WorkerConfig {
            bucket: "teltubby".to_string(),
            max_filename_len: 120,
            max_key_len: 512,
            requeue_base_delay: Duration::from_millis(1),
        };
        let worker = Worker::new(
            store.clone(),
            dedup,
            queue.clone() as Arc<dyn Queue>,
            queue.clone() as Arc<dyn JobPublisher>,
            transport,
            bot.clone(),
            rx,
            metrics,
            config,
        );
        (worker, queue, store, bot)
    }

    fn sample_envelope() -> NewJob {
        NewJob {
            user_id: 9,
            chat_id: 1,
            message_id: 100,
            file_info: FileInfo {
                file_id: "f1".into(),
                file_unique_id: "u1".into(),
                file_size: Some(80 * 1024 * 1024),
                file_type: "video".into(),
                file_name: Some("clip.mp4".into()),
                mime_type: Some("video/mp4".into()),
            },
            telegram_context: TelegramContext::default(),
            priority: 0,
            max_retries: 3,
        }
    }

    #[tokio::test]
    async fn stores_a_fresh_large_file_and_writes_message_json() {
        let transport = Arc::new(FakeUserTransport {
            files: std::sync::Mutex::new(
                [("f1".to_string(), bytes::Bytes::from_static(b"big file contents"))].into_iter().collect(),
            ),
            fail_with: None,
        });
        let (worker, queue, store, _bot) = harness(transport).await;
        let job_id = queue.enqueue(sample_envelope()).await.unwrap();
        let envelope = queue.get(job_id).await.unwrap().unwrap().envelope;

        let outcome = worker.run_envelope(envelope).await.unwrap();
        match outcome {
            RunOutcome::Stored { s3_key } => {
                assert!(store.contents(&s3_key).is_some());
                let message_key = s3_key.rsplit_once('/').unwrap().0.to_string() + "/message.json";
                assert!(store.contents(&message_key).is_some());
            }
            other => panic!("expected Stored, got {other:?}"),
        }
        assert_eq!(queue.get(job_id).await.unwrap().unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn unknown_job_id_is_reported_as_such() {
        let transport = Arc::new(FakeUserTransport { files: Default::default(), fail_with: None });
        let (worker, queue, _store, _bot) = harness(transport).await;
        let ghost_envelope = {
            let job_id = queue.enqueue(sample_envelope()).await.unwrap();
            let mut envelope = queue.get(job_id).await.unwrap().unwrap().envelope;
            envelope.job_id = Uuid::new_v4();
            envelope
        };
        let outcome = worker.run_envelope(ghost_envelope).await.unwrap();
        assert!(matches!(outcome, RunOutcome::UnknownJob));
    }

    #[tokio::test]
    async fn transient_failure_requeues_with_incremented_retry_count() {
        let transport = Arc::new(FakeUserTransport {
            files: Default::default(),
            fail_with: Some(make_err!(Code::Unavailable, "network blip")),
        });
        let (worker, queue, _store, _bot) = harness(transport).await;
        let job_id = queue.enqueue(sample_envelope()).await.unwrap();
        let envelope = queue.get(job_id).await.unwrap().unwrap().envelope;

        let outcome = worker.run_envelope(envelope).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Requeued { retry_count: 1 }));
        assert_eq!(queue.get(job_id).await.unwrap().unwrap().state, JobState::Pending);
        assert_eq!(queue.republished.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_goes_straight_to_failed() {
        let transport = Arc::new(FakeUserTransport {
            files: Default::default(),
            fail_with: Some(make_err!(Code::InvalidArgument, "unsupported kind")),
        });
        let (worker, queue, _store, _bot) = harness(transport).await;
        let job_id = queue.enqueue(sample_envelope()).await.unwrap();
        let envelope = queue.get(job_id).await.unwrap().unwrap().envelope;

        let outcome = worker.run_envelope(envelope).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert_eq!(queue.get(job_id).await.unwrap().unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn already_cancelled_job_is_acked_without_work() {
        let transport = Arc::new(FakeUserTransport { files: Default::default(), fail_with: None });
        let (worker, queue, _store, _bot) = harness(transport).await;
        let job_id = queue.enqueue(sample_envelope()).await.unwrap();
        queue.cancel(job_id).await.unwrap();
        let envelope = queue.get(job_id).await.unwrap().unwrap().envelope;

        let outcome = worker.run_envelope(envelope).await.unwrap();
        assert!(matches!(outcome, RunOutcome::AckedNoWork));
    }
}
