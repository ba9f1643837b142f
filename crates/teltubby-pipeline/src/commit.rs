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

//! C5: the ingestion pipeline. Owns the per-unit algorithm (admission,
//! pre-validation, routing, fetch-hash-dedup-upload, metadata commit, ack)
//! that the bot-side inline path drives directly and the queue worker
//! drives one item at a time for its single-item units.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use teltubby_dedup::DedupIndex;
use teltubby_error::{Error, ResultExt};
use teltubby_layout::NameContext;
use teltubby_queue::{FileInfo, NewJob, Queue, TelegramContext};
use teltubby_quota::QuotaState;
use teltubby_router::{Route, SizeProbe};
use teltubby_store::ObjectStore;
use teltubby_transport::{extension_for, BotTransport, FileHandle, MediaKind};
use teltubby_util::buf_channel::make_buf_channel_pair;
use teltubby_util::digest::StreamingHasher;
use teltubby_util::metrics::KindLabel;
use tokio::sync::watch;
use uuid::Uuid;

use crate::json;
use crate::metrics::PipelineMetrics;
use crate::types::{ArchiveUnit, DedupReason, Item, ItemOutcome, ItemResult, MessageUnit};

/// Everything the per-unit algorithm needs to know that isn't already part
/// of the collaborators themselves.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub bucket: String,
    pub max_file_bytes: u64,
    pub inline_limit_bytes: u64,
    pub max_filename_len: usize,
    pub max_key_len: usize,
    pub max_job_retries: u32,
}

/// What pre-validation found wrong with one item, before any upload begins.
#[derive(Debug, Clone)]
pub struct PreValidationFailure {
    pub ordinal: u32,
    pub reason: String,
}

/// The result of attempting to commit one unit.
#[derive(Debug, Clone)]
pub enum UnitOutcome {
    /// The quota gate was closed; nothing was attempted.
    QuotaFull,
    /// At least one item failed pre-validation; no upload was attempted
    /// for any item in the unit (P6).
    Rejected { failures: Vec<PreValidationFailure> },
    /// The unit's inline items resolved and `message.json` was written.
    /// `queued_job_ids` lists any oversize items split out to the queue.
    Committed { unit: ArchiveUnit, queued_job_ids: Vec<Uuid> },
    /// Every inline item resolved, but writing `message.json` itself
    /// failed. The uploaded objects and their dedup records stand; an
    /// operator must reconcile.
    MetadataWriteFailed { unit: ArchiveUnit, queued_job_ids: Vec<Uuid>, error: String },
}

pub struct Pipeline {
    store: Arc<dyn ObjectStore>,
    dedup: Arc<DedupIndex>,
    queue: Arc<dyn Queue>,
    bot: Arc<dyn BotTransport>,
    quota: watch::Receiver<QuotaState>,
    metrics: Arc<PipelineMetrics>,
    config: PipelineConfig,
}

struct BotSizeProbe<'a>(&'a dyn BotTransport);

#[async_trait]
impl SizeProbe for BotSizeProbe<'_> {
    async fn confirms_too_big(&self, file_id: &str) -> Result<bool, Error> {
        self.0.confirms_too_big(file_id).await
    }
}

impl Pipeline {
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        dedup: Arc<DedupIndex>,
        queue: Arc<dyn Queue>,
        bot: Arc<dyn BotTransport>,
        quota: watch::Receiver<QuotaState>,
        metrics: Arc<PipelineMetrics>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            dedup,
            queue,
            bot,
            quota,
            metrics,
            config,
        }
    }

    pub async fn commit_unit(&self, unit: MessageUnit) -> Result<UnitOutcome, Error> {
        if !self.quota.borrow().is_open() {
            return Ok(UnitOutcome::QuotaFull);
        }

        if let Some(failures) = self.pre_validate(&unit) {
            return Ok(UnitOutcome::Rejected { failures });
        }

        let (inline_items, queue_items) = self.split_by_route(&unit).await;

        let unit_ctx = self.name_context(&unit, unit.media_group_id.as_deref(), unit.caption_plain.as_deref());
        let prefix = teltubby_layout::prefix_for(&unit_ctx.as_ctx());

        let mut queued_job_ids = Vec::with_capacity(queue_items.len());
        for item in &queue_items {
            match self.enqueue_item(&unit, item).await {
                Ok(job_id) => queued_job_ids.push(job_id),
                Err(err) => {
                    tracing::warn!(error = %err, ordinal = item.ordinal, "failed to enqueue oversize item");
                }
            }
        }

        let mut results = Vec::with_capacity(inline_items.len());
        for item in &inline_items {
            let result = self.resolve_inline_item(&prefix, &unit, item).await;
            self.metrics
                .items_by_outcome
                .get_or_create(&KindLabel {
                    kind: outcome_label(&result.outcome).to_string(),
                })
                .inc();
            results.push(result);
        }

        let notes = partial_failure_notes(&results);
        let mut archived = ArchiveUnit {
            prefix: prefix.clone(),
            items: results,
            notes,
        };

        if archived.items.is_empty() {
            // Every item was routed to the queue; nothing to commit here.
            self.metrics.units_committed.inc();
            return Ok(UnitOutcome::Committed { unit: archived, queued_job_ids });
        }

        let artifact = json::build(&self.config.bucket, &unit, &archived, Utc::now());
        let payload = serde_json::to_vec_pretty(&artifact).err_tip(|| "encoding message.json")?;
        let key = format!("{prefix}message.json");
        let (mut tx, rx) = make_buf_channel_pair();
        let send_task = tokio::spawn(async move {
            let _ = tx.send(bytes::Bytes::from(payload)).await;
            let _ = tx.send_eof().await;
        });
        let write_result = self.store.put(&key, rx, "application/json").await;
        let _ = send_task.await;

        self.metrics.units_committed.inc();
        self.metrics.bytes_uploaded.inc_by(archived.total_bytes_uploaded());

        match write_result {
            Ok(()) => Ok(UnitOutcome::Committed { unit: archived, queued_job_ids }),
            Err(err) => {
                archived.notes = Some(append_note(archived.notes.take(), "metadata_write_failed"));
                Ok(UnitOutcome::MetadataWriteFailed {
                    unit: archived,
                    queued_job_ids,
                    error: err.to_string(),
                })
            }
        }
    }

    fn pre_validate(&self, unit: &MessageUnit) -> Option<Vec<PreValidationFailure>> {
        let failures: Vec<PreValidationFailure> = unit
            .items
            .iter()
            .filter_map(|item| match item.handle.size_hint_bytes {
                Some(size) if size > self.config.max_file_bytes => Some(PreValidationFailure {
                    ordinal: item.ordinal,
                    reason: "oversize_configured".to_string(),
                }),
                _ => None,
            })
            .collect();
        if failures.is_empty() {
            None
        } else {
            Some(failures)
        }
    }

    async fn split_by_route(&self, unit: &MessageUnit) -> (Vec<Item>, Vec<Item>) {
        let probe = BotSizeProbe(self.bot.as_ref());
        let mut inline = Vec::new();
        let mut queue = Vec::new();
        for item in &unit.items {
            let route = teltubby_router::route(
                item.handle.size_hint_bytes,
                self.config.inline_limit_bytes,
                &item.handle.file_id,
                &probe,
            )
            .await;
            match route {
                Route::Inline => inline.push(item.clone()),
                Route::Queue => queue.push(item.clone()),
            }
        }
        (inline, queue)
    }

    async fn enqueue_item(&self, unit: &MessageUnit, item: &Item) -> Result<Uuid, Error> {
        let new_job = NewJob {
            user_id: unit.curator_user_id,
            chat_id: unit.chat_id,
            message_id: unit.message_id,
            file_info: FileInfo {
                file_id: item.handle.file_id.clone(),
                file_unique_id: item.handle.file_unique_id.clone(),
                file_size: item.handle.size_hint_bytes,
                file_type: media_kind_str(item.kind).to_string(),
                file_name: item.handle.original_filename.clone(),
                mime_type: item.handle.mime_type.clone(),
            },
            telegram_context: TelegramContext {
                forward_origin: unit.forward_origin.clone(),
                caption: unit.caption_plain.clone(),
                entities: Some(unit.entities.clone()),
                media_group_id: unit.media_group_id.clone(),
            },
            priority: 0,
            max_retries: self.config.max_job_retries,
        };
        self.queue.enqueue(new_job).await
    }

    async fn resolve_inline_item(&self, prefix: &str, unit: &MessageUnit, item: &Item) -> ItemResult {
        let handle = &item.handle;
        let base = ItemResultBase {
            ordinal: item.ordinal,
            kind: item.kind,
            mime_type: handle.mime_type.clone(),
            width: handle.width,
            height: handle.height,
            duration_secs: handle.duration_secs,
            file_id: handle.file_id.clone(),
            file_unique_id: handle.file_unique_id.clone(),
            original_filename: handle.original_filename.clone(),
        };

        if let Ok(Some(sha256)) = self.dedup.lookup_by_unique_id(&handle.file_unique_id).await {
            if let Ok(Some(record)) = self.dedup.lookup_by_hash(&sha256).await {
                self.record_dedup_hit(DedupReason::UniqueId);
                return base.into_result(
                    Some(record.size as u64),
                    None,
                    ItemOutcome::Duplicate { duplicate_of: record.s3_key, reason: DedupReason::UniqueId },
                );
            }
        }

        let fetched = match self.bot.fetch(handle).await {
            Ok(mut body) => {
                let mut hasher = StreamingHasher::new();
                let mut buf = Vec::new();
                let mut read_err = None;
                loop {
                    match body.recv().await {
                        Ok(chunk) if chunk.is_empty() => break,
                        Ok(chunk) => {
                            hasher.update(&chunk);
                            buf.extend_from_slice(&chunk);
                        }
                        Err(err) => {
                            read_err = Some(err);
                            break;
                        }
                    }
                }
                match read_err {
                    Some(err) => Err(err),
                    None => Ok((hasher.finalize(), buf)),
                }
            }
            Err(err) => Err(err),
        };

        let (digest, buf) = match fetched {
            Ok(pair) => pair,
            Err(err) => {
                return base.into_result(None, None, ItemOutcome::Failed { reason: err.to_string() });
            }
        };
        let sha256 = digest.hash_str();

        if let Ok(Some(record)) = self.dedup.lookup_by_hash(&sha256).await {
            self.record_dedup_hit(DedupReason::Sha256);
            return base.into_result(
                Some(record.size as u64),
                None,
                ItemOutcome::Duplicate { duplicate_of: record.s3_key, reason: DedupReason::Sha256 },
            );
        }

        let ctx = self.name_context(unit, unit.media_group_id.as_deref(), unit.caption_plain.as_deref());
        let ext = extension_for(handle);
        let filename = teltubby_layout::filename_for(&ctx.as_ctx(), item.ordinal, &ext, self.config.max_filename_len);
        let key = teltubby_layout::key_for(prefix, &filename, self.config.max_key_len);
        let mime = handle.mime_type.clone().unwrap_or_else(|| "application/octet-stream".to_string());
        let size_bytes = digest.size_bytes;

        match self.upload(&key, buf, &mime).await {
            Ok(()) => {
                match self
                    .dedup
                    .register(&sha256, &key, size_bytes as i64, &mime, Some(&handle.file_unique_id))
                    .await
                {
                    Ok(()) => base.into_result(
                        Some(size_bytes),
                        Some(key),
                        ItemOutcome::Stored { sha256, size_bytes },
                    ),
                    Err(err) if err.kind == Some("dedup_conflict") => {
                        let _ = self.store.delete(&key).await;
                        match self.dedup.lookup_by_hash(&sha256).await {
                            Ok(Some(record)) => {
                                self.record_dedup_hit(DedupReason::Sha256);
                                base.into_result(
                                    Some(record.size as u64),
                                    None,
                                    ItemOutcome::Duplicate { duplicate_of: record.s3_key, reason: DedupReason::Sha256 },
                                )
                            }
                            _ => base.into_result(None, None, ItemOutcome::Failed { reason: err.to_string() }),
                        }
                    }
                    Err(err) => base.into_result(None, None, ItemOutcome::Failed { reason: err.to_string() }),
                }
            }
            Err(err) => base.into_result(None, None, ItemOutcome::Failed { reason: err.to_string() }),
        }
    }

    /// `ObjectStore::put` already retries transient failures internally
    /// (1s/3s/9s backoff over the store's own transient/permanent
    /// classification); a final `Err` here means the retries were
    /// exhausted or the failure was permanent, either way final for this
    /// item per the unit's failure policy.
    async fn upload(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), Error> {
        let (mut tx, rx) = make_buf_channel_pair();
        let send_task = tokio::spawn(async move {
            if !body.is_empty() {
                let _ = tx.send(bytes::Bytes::from(body)).await;
            }
            let _ = tx.send_eof().await;
        });
        let result = self.store.put(key, rx, content_type).await;
        let _ = send_task.await;
        result
    }

    fn name_context<'a>(&self, unit: &'a MessageUnit, media_group_id: Option<&'a str>, caption: Option<&'a str>) -> NameContextOwned {
        NameContextOwned {
            message_timestamp: unit.message_timestamp,
            message_id: unit.message_id,
            media_group_id: media_group_id.map(str::to_string),
            chat_slug_source: unit.chat_slug_source(),
            sender: unit.sender_slug_source(),
            caption: caption.map(str::to_string),
        }
    }

    fn record_dedup_hit(&self, reason: DedupReason) {
        let kind = match reason {
            DedupReason::UniqueId => "unique_id",
            DedupReason::Sha256 => "sha256",
        };
        self.metrics.dedup_hits.get_or_create(&KindLabel { kind: kind.to_string() }).inc();
    }
}

/// Owns the strings a borrowed [`NameContext`] needs, so callers building
/// one from `MessageUnit` derived data (slugs computed on the fly) don't
/// fight the borrow checker over temporaries.
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

struct ItemResultBase {
    ordinal: u32,
    kind: MediaKind,
    mime_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration_secs: Option<u32>,
    file_id: String,
    file_unique_id: String,
    original_filename: Option<String>,
}

impl ItemResultBase {
    fn into_result(self, size_bytes: Option<u64>, s3_key: Option<String>, outcome: ItemOutcome) -> ItemResult {
        ItemResult {
            ordinal: self.ordinal,
            kind: self.kind,
            mime_type: self.mime_type,
            size_bytes,
            width: self.width,
            height: self.height,
            duration_secs: self.duration_secs,
            file_id: self.file_id,
            file_unique_id: self.file_unique_id,
            original_filename: self.original_filename,
            s3_key,
            outcome,
        }
    }
}

fn media_kind_str(kind: MediaKind) -> &'static str {
    use MediaKind::*;
    match kind {
        Photo => "photo",
        Video => "video",
        Document => "document",
        Audio => "audio",
        Voice => "voice",
        Animation => "animation",
        VideoNote => "video_note",
        Sticker => "sticker",
        Other => "other",
    }
}

fn outcome_label(outcome: &ItemOutcome) -> &'static str {
    match outcome {
        ItemOutcome::Stored { .. } => "stored",
        ItemOutcome::Duplicate { .. } => "duplicate",
        ItemOutcome::Queued { .. } => "queued",
        ItemOutcome::Skipped { .. } => "skipped",
        ItemOutcome::Failed { .. } => "failed",
    }
}

fn partial_failure_notes(results: &[ItemResult]) -> Option<String> {
    let failed: Vec<u32> = results
        .iter()
        .filter(|r| matches!(r.outcome, ItemOutcome::Failed { .. }))
        .map(|r| r.ordinal)
        .collect();
    if failed.is_empty() {
        None
    } else {
        Some(format!("items failed and were skipped from this archive: {failed:?}"))
    }
}

fn append_note(existing: Option<String>, addition: &str) -> String {
    match existing {
        Some(existing) => format!("{existing}; {addition}"),
        None => addition.to_string(),
    }
}
