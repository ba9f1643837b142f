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
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// I6: the only legal edges in the job state graph. `Processing ->
    /// Pending` is the worker's own transient-failure requeue (distinct
    /// from the terminal-state `retry`/`reset_to_pending` path, which is
    /// the one operator-initiated edge back to `Pending` handled
    /// separately by [`crate::Queue::retry`]).
    #[must_use]
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Processing)
                | (JobState::Processing, JobState::Pending)
                | (JobState::Processing, JobState::Completed)
                | (JobState::Processing, JobState::Failed)
                | (JobState::Processing, JobState::Cancelled)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_id: String,
    pub file_unique_id: String,
    pub file_size: Option<u64>,
    pub file_type: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramContext {
    pub forward_origin: Option<serde_json::Value>,
    pub caption: Option<String>,
    pub entities: Option<Vec<serde_json::Value>>,
    pub media_group_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub created_at: DateTime<Utc>,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// The exact wire envelope published to the broker (and re-published
/// verbatim on retry): JSON with `job_id`, `user_id`, `chat_id`,
/// `message_id`, `file_info`, `telegram_context`, `job_metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEnvelope {
    pub job_id: Uuid,
    pub user_id: i64,
    pub chat_id: i64,
    pub message_id: i64,
    pub file_info: FileInfo,
    pub telegram_context: TelegramContext,
    pub job_metadata: JobMetadata,
}

/// Caller-supplied fields for a new job; `enqueue` fills in the id and
/// bookkeeping.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: i64,
    pub chat_id: i64,
    pub message_id: i64,
    pub file_info: FileInfo,
    pub telegram_context: TelegramContext,
    pub priority: i32,
    pub max_retries: u32,
}

/// The local job row: the source of truth for admin commands and UI,
/// independent of whatever the broker currently believes.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: Uuid,
    pub envelope: QueueEnvelope,
    pub state: JobState,
    pub cancellation_requested: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
