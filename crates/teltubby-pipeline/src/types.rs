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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use teltubby_transport::{FileHandle, MediaKind};

pub const SCHEMA_VERSION: &str = "1.0";

/// One media payload within a [`MessageUnit`], before it has been
/// resolved against the dedup index or the object store.
#[derive(Debug, Clone)]
pub struct Item {
    pub ordinal: u32,
    pub kind: MediaKind,
    pub handle: FileHandle,
}

/// The atomic archival object the aggregator hands to the pipeline. A
/// unit with no items is never constructed — callers drop it upstream.
#[derive(Debug, Clone)]
pub struct MessageUnit {
    pub chat_id: i64,
    pub message_id: i64,
    pub media_group_id: Option<String>,
    pub curator_user_id: i64,
    pub message_timestamp: DateTime<Utc>,
    pub chat_title: Option<String>,
    pub chat_username: Option<String>,
    pub sender_id: i64,
    pub sender_username: Option<String>,
    pub forward_origin: Option<serde_json::Value>,
    pub caption_plain: Option<String>,
    pub caption_entities: Vec<serde_json::Value>,
    pub entities: Vec<serde_json::Value>,
    pub items: Vec<Item>,
}

impl MessageUnit {
    /// Prefers the forward-origin chat's username/title; falls back to
    /// the curator's own identity when the origin is hidden.
    #[must_use]
    pub fn chat_slug_source(&self) -> String {
        self.chat_username
            .clone()
            .or_else(|| self.chat_title.clone())
            .or_else(|| self.sender_username.clone())
            .unwrap_or_else(|| self.sender_id.to_string())
    }

    #[must_use]
    pub fn sender_slug_source(&self) -> String {
        self.sender_username.clone().unwrap_or_else(|| self.sender_id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupReason {
    UniqueId,
    Sha256,
}

/// What happened to one item by the time the unit commits.
#[derive(Debug, Clone)]
pub enum ItemOutcome {
    Stored { sha256: String, size_bytes: u64 },
    Duplicate { duplicate_of: String, reason: DedupReason },
    /// Routed to the queue as an independent job instead of being resolved
    /// inline; it has no entry in this unit's `message.json`.
    Queued { job_id: uuid::Uuid },
    Skipped { reason: String },
    Failed { reason: String },
}

/// One item's outcome plus the context needed to render its
/// `message.json` entry.
#[derive(Debug, Clone)]
pub struct ItemResult {
    pub ordinal: u32,
    pub kind: MediaKind,
    pub mime_type: Option<String>,
    pub size_bytes: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_secs: Option<u32>,
    pub file_id: String,
    pub file_unique_id: String,
    pub original_filename: Option<String>,
    pub s3_key: Option<String>,
    pub outcome: ItemOutcome,
}

/// The fully resolved unit, ready to be serialized as `message.json` and
/// reported back to the curator.
#[derive(Debug, Clone)]
pub struct ArchiveUnit {
    pub prefix: String,
    pub items: Vec<ItemResult>,
    pub notes: Option<String>,
}

impl ArchiveUnit {
    #[must_use]
    pub fn files_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Stored { .. }))
            .count()
    }

    #[must_use]
    pub fn total_bytes_uploaded(&self) -> u64 {
        self.items
            .iter()
            .filter_map(|i| match &i.outcome {
                ItemOutcome::Stored { size_bytes, .. } => Some(*size_bytes),
                _ => None,
            })
            .sum()
    }

    /// Unit-level `duplicate_of`: set only when *every* item that wasn't
    /// skipped/failed/queued is a duplicate, and all of them duplicate the
    /// very same prior key (the unit as a whole mirrors another). Per-item
    /// duplication detail always lives on `items[k]` regardless.
    #[must_use]
    pub fn unit_duplicate_of(&self) -> Option<(String, DedupReason)> {
        let resolved: Vec<_> = self
            .items
            .iter()
            .filter(|i| !matches!(i.outcome, ItemOutcome::Skipped { .. } | ItemOutcome::Failed { .. } | ItemOutcome::Queued { .. }))
            .collect();
        if resolved.is_empty() {
            return None;
        }
        let mut reference: Option<(String, DedupReason)> = None;
        for item in &resolved {
            match &item.outcome {
                ItemOutcome::Duplicate { duplicate_of, reason } => match &reference {
                    None => reference = Some((duplicate_of.clone(), *reason)),
                    Some((key, _)) if key == duplicate_of => {}
                    Some(_) => return None,
                },
                _ => return None,
            }
        }
        reference
    }
}
