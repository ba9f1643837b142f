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

//! The local job table. Shares its SQLite file with the dedup index
//! (`teltubby_dedup::pool`) but owns its own migration and its own
//! single-writer discipline.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use teltubby_error::{make_err, Code, Error, ResultExt};
use uuid::Uuid;

use crate::types::{Job, JobState, QueueEnvelope};

pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Opens `database_path` and applies this crate's migrations on top of
    /// whatever `teltubby-dedup` has already applied.
    pub async fn connect(database_path: &str) -> Result<Self, Error> {
        let pool = teltubby_dedup::pool::connect(database_path).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .err_tip(|| "running queue migrations")?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_pending(&self, envelope: &QueueEnvelope) -> Result<(), Error> {
        let payload = serde_json::to_string(envelope).err_tip(|| "serializing job envelope")?;
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO jobs (job_id, user_id, chat_id, message_id, payload_json, state, \
             cancellation_requested, retry_count, max_retries, priority, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 'PENDING', 0, 0, ?, ?, ?, ?)",
        )
        .bind(envelope.job_id.to_string())
        .bind(envelope.user_id)
        .bind(envelope.chat_id)
        .bind(envelope.message_id)
        .bind(&payload)
        .bind(envelope.job_metadata.max_retries)
        .bind(envelope.job_metadata.priority)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .err_tip(|| "inserting job row")?;
        Ok(())
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<Job>, Error> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT job_id, payload_json, state, cancellation_requested, last_error, created_at, updated_at \
             FROM jobs WHERE job_id = ?",
        )
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .err_tip(|| "fetching job row")?;
        row.map(TryInto::try_into).transpose()
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<Job>, Error> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT job_id, payload_json, state, cancellation_requested, last_error, created_at, updated_at \
             FROM jobs ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .err_tip(|| "listing job rows")?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Applies a state transition, enforcing I6. `retry` bypasses this via
    /// [`JobStore::reset_to_pending`] since PENDING-from-terminal is the
    /// one sanctioned exception.
    pub async fn transition(&self, job_id: Uuid, next: JobState, err: Option<&str>) -> Result<(), Error> {
        let job = self
            .get(job_id)
            .await?
            .ok_or_else(|| make_err!(Code::NotFound, "no such job: {job_id}"))?;
        if !job.state.can_transition_to(next) {
            return Err(make_err!(
                Code::InvalidArgument,
                "illegal job transition {:?} -> {:?}",
                job.state,
                next
            ));
        }
        self.write_state(job_id, next, err).await
    }

    /// Marks cancellation as merely requested for a job already
    /// `Processing`; the state itself doesn't change until the worker
    /// notices and finishes the transition cooperatively.
    pub async fn request_cancellation(&self, job_id: Uuid) -> Result<(), Error> {
        sqlx::query("UPDATE jobs SET cancellation_requested = 1, updated_at = ? WHERE job_id = ?")
            .bind(Utc::now())
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await
            .err_tip(|| "requesting cancellation")?;
        Ok(())
    }

    pub async fn mark_cancelled_if_pending(&self, job_id: Uuid) -> Result<bool, Error> {
        let job = self
            .get(job_id)
            .await?
            .ok_or_else(|| make_err!(Code::NotFound, "no such job: {job_id}"))?;
        if job.state != JobState::Pending {
            return Ok(false);
        }
        self.write_state(job_id, JobState::Cancelled, None).await?;
        Ok(true)
    }

    /// The one sanctioned PENDING-from-terminal edge, used by `retry`.
    pub async fn reset_to_pending(&self, job_id: Uuid) -> Result<QueueEnvelope, Error> {
        let job = self
            .get(job_id)
            .await?
            .ok_or_else(|| make_err!(Code::NotFound, "no such job: {job_id}"))?;
        if !job.state.is_terminal() {
            return Err(make_err!(
                Code::InvalidArgument,
                "can only retry a terminal job, current state is {:?}",
                job.state
            ));
        }
        self.write_state(job_id, JobState::Pending, None).await?;
        sqlx::query("UPDATE jobs SET cancellation_requested = 0 WHERE job_id = ?")
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await
            .err_tip(|| "clearing cancellation flag on retry")?;
        Ok(job.envelope)
    }

    async fn write_state(&self, job_id: Uuid, state: JobState, err: Option<&str>) -> Result<(), Error> {
        let state_str = serde_json::to_value(state)
            .err_tip(|| "encoding job state")?
            .as_str()
            .expect("JobState serializes to a string")
            .to_string();
        sqlx::query("UPDATE jobs SET state = ?, last_error = ?, updated_at = ? WHERE job_id = ?")
            .bind(state_str)
            .bind(err)
            .bind(Utc::now())
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await
            .err_tip(|| "updating job state")?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: String,
    payload_json: String,
    state: String,
    cancellation_requested: bool,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Self, Error> {
        let envelope: QueueEnvelope =
            serde_json::from_str(&row.payload_json).err_tip(|| "decoding stored job payload")?;
        let state: JobState = serde_json::from_value(serde_json::Value::String(row.state))
            .err_tip(|| "decoding stored job state")?;
        Ok(Job {
            job_id: row.job_id.parse().err_tip(|| "parsing job id")?,
            envelope,
            state,
            cancellation_requested: row.cancellation_requested,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
