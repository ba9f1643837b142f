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

//! C2: the dedup index. A single SQLite database (shared with the job
//! table in `teltubby-queue`) holding the authoritative SHA-256 -> key
//! mapping plus the unique-id fast path, behind a single-writer
//! discipline enforced by serializing all writes through one `DedupIndex`
//! handle per process.

pub mod pool;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use teltubby_error::{make_err, Code, Error, ResultExt};

/// A row from `files`: the canonical record for one stored binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupRecord {
    pub sha256: String,
    pub s3_key: String,
    pub size: i64,
    pub mime: String,
    pub created_at: DateTime<Utc>,
}

pub struct DedupIndex {
    pool: SqlitePool,
}

impl DedupIndex {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fast path: does `unique_id` already map to a known hash? Avoids a
    /// download entirely when it hits.
    pub async fn lookup_by_unique_id(&self, unique_id: &str) -> Result<Option<String>, Error> {
        let row = sqlx::query_scalar::<_, String>("SELECT sha256 FROM tg_map WHERE unique_id = ?")
            .bind(unique_id)
            .fetch_optional(&self.pool)
            .await
            .err_tip(|| "lookup_by_unique_id")?;
        Ok(row)
    }

    /// Authoritative path: the stored key for a given content hash.
    pub async fn lookup_by_hash(&self, sha256: &str) -> Result<Option<DedupRecord>, Error> {
        let row = sqlx::query_as::<_, (String, String, i64, String, DateTime<Utc>)>(
            "SELECT sha256, s3_key, size, mime, created_at FROM files WHERE sha256 = ?",
        )
        .bind(sha256)
        .fetch_optional(&self.pool)
        .await
        .err_tip(|| "lookup_by_hash")?;
        Ok(row.map(|(sha256, s3_key, size, mime, created_at)| DedupRecord {
            sha256,
            s3_key,
            size,
            mime,
            created_at,
        }))
    }

    /// Inserts a fresh record. Idempotent: registering the same
    /// `(sha256, s3_key)` twice is a no-op. Registering a `sha256` that
    /// already maps to a *different* key is a dedup conflict: the caller
    /// must treat the existing entry as canonical and discard its own
    /// upload.
    ///
    /// The insert-or-ignore and the conflict check run inside a single
    /// transaction, so the `pool`'s single physical connection can't be
    /// handed to a second concurrent caller between the two statements —
    /// that's what actually makes this the one logical writer, not the
    /// pool's connection limit by itself.
    pub async fn register(
        &self,
        sha256: &str,
        s3_key: &str,
        size: i64,
        mime: &str,
        unique_id: Option<&str>,
    ) -> Result<(), Error> {
        let mut tx = self.pool.begin().await.err_tip(|| "beginning register transaction")?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO files (sha256, s3_key, size, mime, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(sha256)
        .bind(s3_key)
        .bind(size)
        .bind(mime)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .err_tip(|| "inserting into files")?
        .rows_affected()
            > 0;

        if !inserted {
            let existing_s3_key = sqlx::query_scalar::<_, String>("SELECT s3_key FROM files WHERE sha256 = ?")
                .bind(sha256)
                .fetch_one(&mut *tx)
                .await
                .err_tip(|| "reading back existing files row")?;
            if existing_s3_key != s3_key {
                return Err(make_err!(
                    Code::AlreadyExists,
                    "sha256 {sha256} already maps to {existing_s3_key}"
                )
                .with_kind("dedup_conflict"));
            }
        }

        if let Some(unique_id) = unique_id {
            sqlx::query("INSERT OR IGNORE INTO tg_map (unique_id, sha256) VALUES (?, ?)")
                .bind(unique_id)
                .bind(sha256)
                .execute(&mut *tx)
                .await
                .err_tip(|| "inserting into tg_map")?;
        }

        tx.commit().await.err_tip(|| "committing register transaction")?;
        Ok(())
    }

    /// Idempotent audit record for a processed message, used by admin
    /// queries. Does not itself perform dedup.
    pub async fn record_message(
        &self,
        chat_id: i64,
        message_id: i64,
        media_group_id: Option<&str>,
    ) -> Result<(), Error> {
        sqlx::query(
            "INSERT OR IGNORE INTO messages (message_id, chat_id, media_group_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(message_id)
        .bind(chat_id)
        .bind(media_group_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .err_tip(|| "recording message")?;
        Ok(())
    }

    /// Admin-triggered compaction.
    pub async fn vacuum(&self) -> Result<(), Error> {
        sqlx::query("VACUUM").execute(&self.pool).await.err_tip(|| "vacuum")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_index() -> DedupIndex {
        let pool = pool::connect_in_memory().await.unwrap();
        DedupIndex::new(pool)
    }

    #[tokio::test]
    async fn register_then_lookup_by_hash_round_trips() {
        let index = test_index().await;
        index
            .register("abc123", "teltubby/2026/07/chat/1/foo.jpg", 1024, "image/jpeg", None)
            .await
            .unwrap();
        let record = index.lookup_by_hash("abc123").await.unwrap().unwrap();
        assert_eq!(record.s3_key, "teltubby/2026/07/chat/1/foo.jpg");
    }

    #[tokio::test]
    async fn register_is_idempotent_for_the_same_key() {
        let index = test_index().await;
        index.register("abc123", "key1", 10, "image/jpeg", Some("uid1")).await.unwrap();
        index.register("abc123", "key1", 10, "image/jpeg", Some("uid1")).await.unwrap();
        assert_eq!(index.lookup_by_unique_id("uid1").await.unwrap(), Some("abc123".to_string()));
    }

    #[tokio::test]
    async fn register_conflicting_key_is_rejected() {
        let index = test_index().await;
        index.register("abc123", "key1", 10, "image/jpeg", None).await.unwrap();
        let err = index.register("abc123", "key2", 10, "image/jpeg", None).await.unwrap_err();
        assert_eq!(err.kind, Some("dedup_conflict"));
    }

    #[tokio::test]
    async fn lookup_by_unique_id_fast_path() {
        let index = test_index().await;
        index.register("abc123", "key1", 10, "image/jpeg", Some("uid1")).await.unwrap();
        assert_eq!(index.lookup_by_unique_id("uid1").await.unwrap(), Some("abc123".to_string()));
        assert_eq!(index.lookup_by_unique_id("missing").await.unwrap(), None);
    }
}
