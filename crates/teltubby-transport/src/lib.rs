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

//! Capability interfaces for everything the chat transport provides:
//! fetching bytes inline (bot path), fetching bytes out of band (worker
//! path), and notifying curators/admins. The pipeline and worker crates
//! program against these traits, never against a concrete bot library, so
//! both can be exercised with in-memory fakes in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use teltubby_error::Error;
use teltubby_util::buf_channel::DropCloserReadHalf;

/// Everything the layout builder and pipeline need to know about one
/// transport-side file, independent of whether it arrived inline or via
/// the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHandle {
    pub file_id: String,
    pub file_unique_id: String,
    pub size_hint_bytes: Option<u64>,
    pub kind: MediaKind,
    pub original_filename: Option<String>,
    pub mime_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_secs: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Animation,
    VideoNote,
    Sticker,
    Other,
}

/// The extension to archive a file under: the transport filename's own
/// extension verbatim (even if it disagrees with the declared MIME type),
/// falling back to a MIME-derived guess only when the transport gave no
/// filename or no extension. Shared by the inline and queued upload paths
/// so the same `FileHandle` always resolves to the same extension
/// regardless of which path handled it.
#[must_use]
pub fn extension_for(handle: &FileHandle) -> String {
    if let Some(name) = &handle.original_filename {
        if let Some((_, ext)) = name.rsplit_once('.') {
            if !ext.is_empty() {
                return ext.to_string();
            }
        }
    }
    match handle.mime_type.as_deref() {
        Some("image/jpeg") => "jpg".to_string(),
        Some("image/png") => "png".to_string(),
        Some("image/webp") => "webp".to_string(),
        Some("video/mp4") => "mp4".to_string(),
        Some("video/quicktime") => "mov".to_string(),
        Some("audio/ogg") => "ogg".to_string(),
        Some("audio/mpeg") => "mp3".to_string(),
        Some("application/zip") => "zip".to_string(),
        _ => "bin".to_string(),
    }
}

/// The bot-protocol path: fetches media inline, bounded by the transport's
/// own small-file limit, and delivers acks/refusals back to the chat.
#[async_trait]
pub trait BotTransport: Send + Sync {
    async fn fetch(&self, handle: &FileHandle) -> Result<DropCloserReadHalf, Error>;
    async fn send_ack(&self, chat_id: i64, text: &str) -> Result<(), Error>;
    /// A cheap, idempotent metadata-only call confirming whether the
    /// transport itself refuses to hand back a fetchable stream for this
    /// file because it's too large. The declared size hint is untrusted;
    /// this is the authoritative fallback the size router uses.
    async fn confirms_too_big(&self, file_id: &str) -> Result<bool, Error>;
}

/// The user-protocol path the queue worker uses for oversize media.
#[async_trait]
pub trait UserTransport: Send + Sync {
    async fn download(&self, handle: &FileHandle) -> Result<DropCloserReadHalf, Error>;
    /// `true` if the session is authenticated and usable.
    async fn probe_session(&self) -> Result<bool, Error>;
}

/// The out-of-band channel the worker and quota gate use to page a human.
#[async_trait]
pub trait AdminNotifier: Send + Sync {
    async fn notify(&self, text: &str) -> Result<(), Error>;
}

/// The default `AdminNotifier`: the actual chat-based delivery (DMing the
/// configured admin ids) is the bot transport's job and out of scope here,
/// so until a real one is wired in, paging a human means putting it where
/// a human watching the process logs will see it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAdminNotifier;

#[async_trait]
impl AdminNotifier for LoggingAdminNotifier {
    async fn notify(&self, text: &str) -> Result<(), Error> {
        tracing::warn!(target: "teltubby::admin_notify", "{text}");
        Ok(())
    }
}

/// The default `BotTransport`: the real bot-protocol wire client is out
/// of scope here, so every call fails loudly except the acks, which are
/// merely logged — a missing ack shouldn't look like a pipeline bug.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableBotTransport;

#[async_trait]
impl BotTransport for UnavailableBotTransport {
    async fn fetch(&self, handle: &FileHandle) -> Result<DropCloserReadHalf, Error> {
        Err(teltubby_error::make_err!(
            teltubby_error::Code::Unavailable,
            "no bot transport wired in; cannot fetch file {}",
            handle.file_id
        ))
    }

    async fn send_ack(&self, chat_id: i64, text: &str) -> Result<(), Error> {
        tracing::info!(chat_id, text, "no bot transport wired in; ack logged only");
        Ok(())
    }

    async fn confirms_too_big(&self, _file_id: &str) -> Result<bool, Error> {
        Ok(false)
    }
}

/// The default `UserTransport`: the real user-protocol (MTProto) session
/// is out of scope here. `probe_session` reports unhealthy rather than
/// healthy, so a worker wired with this placeholder holds job pulls
/// instead of claiming a session it doesn't have.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableUserTransport;

#[async_trait]
impl UserTransport for UnavailableUserTransport {
    async fn download(&self, handle: &FileHandle) -> Result<DropCloserReadHalf, Error> {
        Err(teltubby_error::make_err!(
            teltubby_error::Code::Unavailable,
            "no user-protocol transport wired in; cannot download file {}",
            handle.file_id
        ))
    }

    async fn probe_session(&self) -> Result<bool, Error> {
        Ok(false)
    }
}

#[cfg(any(test, feature = "test-fakes"))]
pub mod fakes {
    use super::*;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use teltubby_util::buf_channel::make_buf_channel_pair;

    #[derive(Default)]
    pub struct InMemoryBotTransport {
        pub files: Mutex<HashMap<String, Bytes>>,
        pub acks: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl BotTransport for InMemoryBotTransport {
        async fn fetch(&self, handle: &FileHandle) -> Result<DropCloserReadHalf, Error> {
            let data = self
                .files
                .lock()
                .unwrap()
                .get(&handle.file_id)
                .cloned()
                .ok_or_else(|| {
                    teltubby_error::make_err!(teltubby_error::Code::NotFound, "no fake file {}", handle.file_id)
                })?;
            let (mut tx, rx) = make_buf_channel_pair();
            tokio::spawn(async move {
                let _ = tx.send(data).await;
                let _ = tx.send_eof().await;
            });
            Ok(rx)
        }

        async fn send_ack(&self, chat_id: i64, text: &str) -> Result<(), Error> {
            self.acks.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }

        async fn confirms_too_big(&self, _file_id: &str) -> Result<bool, Error> {
            Ok(false)
        }
    }

    #[derive(Default)]
    pub struct InMemoryAdminNotifier {
        pub messages: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AdminNotifier for InMemoryAdminNotifier {
        async fn notify(&self, text: &str) -> Result<(), Error> {
            self.messages.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }
}
