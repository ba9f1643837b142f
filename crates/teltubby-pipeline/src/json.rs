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

//! The `message.json` artifact (schema v1.0), the commit point of the
//! ingestion pipeline: once this object exists, the sibling set of
//! non-duplicate keys it lists is the durable record of the unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ArchiveUnit, DedupReason, ItemOutcome, MessageUnit, SCHEMA_VERSION};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageJson {
    pub schema_version: String,
    pub archive_timestamp_utc: DateTime<Utc>,
    pub message_timestamp_utc: DateTime<Utc>,
    pub bucket: String,
    pub base_path: String,
    pub files_count: u64,
    pub total_bytes_uploaded: u64,
    pub keys: Vec<String>,
    pub duplicate_of: Option<String>,
    pub dedup_reason: Option<DedupReason>,
    pub notes: Option<String>,
    pub telegram: TelegramJson,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramJson {
    pub message_id: i64,
    pub media_group_id: Option<String>,
    pub chat_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_username: Option<String>,
    pub sender_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_origin: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption_plain: Option<String>,
    pub caption_entities: Vec<serde_json::Value>,
    pub entities: Vec<serde_json::Value>,
    pub items: Vec<ItemJson>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemJson {
    pub ordinal: u32,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    pub file_id: String,
    pub file_unique_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_filename: Option<String>,
    pub sha256: String,
    pub s3_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_reason: Option<DedupReason>,
}

/// Builds the artifact for a unit that has already been fully resolved
/// (every item is `Stored` or `Duplicate`; `Queued`/`Skipped`/`Failed`
/// items are omitted per I4 — they have no key to list).
#[must_use]
pub fn build(bucket: &str, unit: &MessageUnit, archived: &ArchiveUnit, archive_timestamp_utc: DateTime<Utc>) -> MessageJson {
    let mut keys = Vec::new();
    let mut items = Vec::new();
    for item in &archived.items {
        let (sha256, s3_key, duplicate_of, dedup_reason) = match &item.outcome {
            ItemOutcome::Stored { sha256, .. } => (sha256.clone(), item.s3_key.clone().unwrap_or_default(), None, None),
            ItemOutcome::Duplicate { duplicate_of, reason } => {
                (String::new(), duplicate_of.clone(), Some(duplicate_of.clone()), Some(*reason))
            }
            ItemOutcome::Queued { .. } | ItemOutcome::Skipped { .. } | ItemOutcome::Failed { .. } => continue,
        };
        if duplicate_of.is_none() {
            keys.push(s3_key.clone());
        }
        items.push(ItemJson {
            ordinal: item.ordinal,
            kind: media_kind_str(item.kind).to_string(),
            mime_type: item.mime_type.clone(),
            size_bytes: item.size_bytes,
            width: item.width,
            height: item.height,
            duration: item.duration_secs,
            file_id: item.file_id.clone(),
            file_unique_id: item.file_unique_id.clone(),
            original_filename: item.original_filename.clone(),
            sha256,
            s3_key,
            duplicate_of,
            dedup_reason,
        });
    }

    let (unit_duplicate_of, unit_dedup_reason) = match archived.unit_duplicate_of() {
        Some((key, reason)) => (Some(key), Some(reason)),
        None => (None, None),
    };

    MessageJson {
        schema_version: SCHEMA_VERSION.to_string(),
        archive_timestamp_utc,
        message_timestamp_utc: unit.message_timestamp,
        bucket: bucket.to_string(),
        base_path: archived.prefix.clone(),
        files_count: archived.files_count() as u64,
        total_bytes_uploaded: archived.total_bytes_uploaded(),
        keys,
        duplicate_of: unit_duplicate_of,
        dedup_reason: unit_dedup_reason,
        notes: archived.notes.clone(),
        telegram: TelegramJson {
            message_id: unit.message_id,
            media_group_id: unit.media_group_id.clone(),
            chat_id: unit.chat_id,
            chat_title: unit.chat_title.clone(),
            chat_username: unit.chat_username.clone(),
            sender_id: unit.sender_id,
            sender_username: unit.sender_username.clone(),
            forward_origin: unit.forward_origin.clone(),
            caption_plain: unit.caption_plain.clone(),
            caption_entities: unit.caption_entities.clone(),
            entities: unit.entities.clone(),
            items,
        },
    }
}

fn media_kind_str(kind: teltubby_transport::MediaKind) -> &'static str {
    use teltubby_transport::MediaKind::*;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ArchiveUnit, Item, ItemResult};
    use chrono::TimeZone;
    use teltubby_transport::{FileHandle, MediaKind};

    fn sample_unit() -> MessageUnit {
        MessageUnit {
            chat_id: 100,
            message_id: 7,
            media_group_id: None,
            curator_user_id: 1,
            message_timestamp: Utc.with_ymd_and_hms(2026, 7, 27, 10, 0, 0).unwrap(),
            chat_title: Some("Curators".to_string()),
            chat_username: None,
            sender_id: 42,
            sender_username: Some("alice".to_string()),
            forward_origin: None,
            caption_plain: None,
            caption_entities: vec![],
            entities: vec![],
            items: vec![Item {
                ordinal: 1,
                kind: MediaKind::Photo,
                handle: FileHandle {
                    file_id: "f1".into(),
                    file_unique_id: "u1".into(),
                    size_hint_bytes: Some(1024),
                    kind: MediaKind::Photo,
                    original_filename: None,
                    mime_type: Some("image/jpeg".into()),
                    width: None,
                    height: None,
                    duration_secs: None,
                },
            }],
        }
    }

    #[test]
    fn stored_item_is_listed_in_keys_with_no_duplicate_of() {
        let unit = sample_unit();
        let archived = ArchiveUnit {
            prefix: "teltubby/2026/07/curators/7/".to_string(),
            items: vec![ItemResult {
                ordinal: 1,
                kind: MediaKind::Photo,
                mime_type: Some("image/jpeg".into()),
                size_bytes: Some(1024),
                width: None,
                height: None,
                duration_secs: None,
                file_id: "f1".into(),
                file_unique_id: "u1".into(),
                original_filename: None,
                s3_key: Some("teltubby/2026/07/curators/7/photo.jpg".into()),
                outcome: ItemOutcome::Stored {
                    sha256: "abc".into(),
                    size_bytes: 1024,
                },
            }],
            notes: None,
        };
        let rendered = build("teltubby", &unit, &archived, Utc.with_ymd_and_hms(2026, 7, 27, 10, 0, 5).unwrap());
        assert_eq!(rendered.keys, vec!["teltubby/2026/07/curators/7/photo.jpg".to_string()]);
        assert_eq!(rendered.duplicate_of, None);
        assert_eq!(rendered.files_count, 1);
    }

    #[test]
    fn duplicate_item_contributes_no_key_but_carries_dedup_reason() {
        let unit = sample_unit();
        let archived = ArchiveUnit {
            prefix: "teltubby/2026/07/curators/7/".to_string(),
            items: vec![ItemResult {
                ordinal: 1,
                kind: MediaKind::Photo,
                mime_type: Some("image/jpeg".into()),
                size_bytes: Some(1024),
                width: None,
                height: None,
                duration_secs: None,
                file_id: "f1".into(),
                file_unique_id: "u1".into(),
                original_filename: None,
                s3_key: None,
                outcome: ItemOutcome::Duplicate {
                    duplicate_of: "teltubby/2026/07/curators/3/photo.jpg".into(),
                    reason: DedupReason::Sha256,
                },
            }],
            notes: None,
        };
        let rendered = build("teltubby", &unit, &archived, Utc.with_ymd_and_hms(2026, 7, 27, 10, 0, 5).unwrap());
        assert!(rendered.keys.is_empty());
        assert_eq!(rendered.duplicate_of, Some("teltubby/2026/07/curators/3/photo.jpg".to_string()));
        assert_eq!(rendered.dedup_reason, Some(DedupReason::Sha256));
        assert_eq!(rendered.telegram.items[0].dedup_reason, Some(DedupReason::Sha256));
    }
}
