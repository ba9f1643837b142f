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

//! What a real chat-transport listener would hand to the aggregator: one
//! message carrying exactly one media attachment. `build_unit` folds a
//! batch the aggregator has already closed and sorted back into the
//! atomic unit the pipeline commits.

use chrono::{DateTime, Utc};
use teltubby_aggregator::Groupable;
use teltubby_pipeline::{Item, MessageUnit};
use teltubby_transport::{FileHandle, MediaKind};

#[derive(Debug, Clone)]
pub struct IncomingMessage {
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
    pub kind: MediaKind,
    pub handle: FileHandle,
}

impl Groupable for IncomingMessage {
    fn chat_id(&self) -> i64 {
        self.chat_id
    }

    fn group_id(&self) -> Option<String> {
        self.media_group_id.clone()
    }

    fn sequence(&self) -> i64 {
        self.message_id
    }
}

/// Folds one already-closed, already-sorted album batch into the unit the
/// pipeline commits atomically. Chat-level fields (caption, forward
/// origin, sender identity) are taken from the first message in the
/// batch, which carries the album's representative caption in the
/// transport's own convention.
///
/// The aggregator never emits an empty batch, so this panics rather than
/// returning a `Result` a caller could plausibly mishandle.
#[must_use]
pub fn build_unit(batch: Vec<IncomingMessage>) -> MessageUnit {
    let head = &batch[0];
    let chat_id = head.chat_id;
    let message_id = head.message_id;
    let media_group_id = head.media_group_id.clone();
    let curator_user_id = head.curator_user_id;
    let message_timestamp = head.message_timestamp;
    let chat_title = head.chat_title.clone();
    let chat_username = head.chat_username.clone();
    let sender_id = head.sender_id;
    let sender_username = head.sender_username.clone();
    let forward_origin = head.forward_origin.clone();
    let caption_plain = head.caption_plain.clone();
    let caption_entities = head.caption_entities.clone();
    let entities = head.entities.clone();

    let items = batch
        .into_iter()
        .enumerate()
        .map(|(index, msg)| Item {
            ordinal: index as u32 + 1,
            kind: msg.kind,
            handle: msg.handle,
        })
        .collect();

    MessageUnit {
        chat_id,
        message_id,
        media_group_id,
        curator_user_id,
        message_timestamp,
        chat_title,
        chat_username,
        sender_id,
        sender_username,
        forward_origin,
        caption_plain,
        caption_entities,
        entities,
        items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(message_id: i64, group: Option<&str>, caption: Option<&str>) -> IncomingMessage {
        IncomingMessage {
            chat_id: 1,
            message_id,
            media_group_id: group.map(str::to_string),
            curator_user_id: 9,
            message_timestamp: Utc::now(),
            chat_title: Some("Curators".to_string()),
            chat_username: None,
            sender_id: 9,
            sender_username: Some("alice".to_string()),
            forward_origin: None,
            caption_plain: caption.map(str::to_string),
            caption_entities: vec![],
            entities: vec![],
            kind: MediaKind::Photo,
            handle: FileHandle {
                file_id: format!("f{message_id}"),
                file_unique_id: format!("u{message_id}"),
                size_hint_bytes: Some(1024),
                kind: MediaKind::Photo,
                original_filename: None,
                mime_type: Some("image/jpeg".to_string()),
                width: None,
                height: None,
                duration_secs: None,
            },
        }
    }

    #[test]
    fn single_message_becomes_a_one_item_unit() {
        let unit = build_unit(vec![message(100, None, Some("hello"))]);
        assert_eq!(unit.message_id, 100);
        assert_eq!(unit.items.len(), 1);
        assert_eq!(unit.items[0].ordinal, 1);
        assert_eq!(unit.caption_plain.as_deref(), Some("hello"));
    }

    #[test]
    fn album_batch_assigns_ordinals_in_batch_order() {
        let batch = vec![
            message(10, Some("g"), Some("album caption")),
            message(11, Some("g"), None),
            message(12, Some("g"), None),
        ];
        let unit = build_unit(batch);
        assert_eq!(unit.media_group_id.as_deref(), Some("g"));
        assert_eq!(unit.items.iter().map(|i| i.ordinal).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(unit.items[2].handle.file_id, "f12");
        assert_eq!(unit.caption_plain.as_deref(), Some("album caption"));
    }
}
