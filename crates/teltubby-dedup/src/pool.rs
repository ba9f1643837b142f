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

//! Shared SQLite bootstrap. `teltubby-queue` opens the same database file
//! through [`connect`] and layers its own job-table migrations on top, so
//! the dedup index and the local job table live in one file with one
//! connection pool, matching the single-writer discipline the dedup
//! engine requires.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use teltubby_error::{Error, ResultExt};

/// Opens (creating if needed) the database at `database_path` and applies
/// this crate's migrations.
pub async fn connect(database_path: &str) -> Result<SqlitePool, Error> {
    if let Some(parent) = Path::new(database_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).err_tip(|| "creating database directory")?;
        }
    }
    let options = SqliteConnectOptions::new()
        .filename(database_path)
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .err_tip(|| format!("opening sqlite database at {database_path}"))?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .err_tip(|| "running dedup migrations")?;
    Ok(pool)
}

/// An in-memory database, used by tests across the workspace that need a
/// real `DedupIndex` without touching disk.
pub async fn connect_in_memory() -> Result<SqlitePool, Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .err_tip(|| "opening in-memory sqlite database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .err_tip(|| "running dedup migrations")?;
    Ok(pool)
}
