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

//! Process-wide configuration, read once at startup and threaded as an
//! immutable value from the entry point. Nothing in this workspace
//! re-reads the environment after [`Config::from_env`] returns.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use teltubby_error::{make_input_err, Error, ResultExt};

/// Retry configuration shared by every backend that talks to a remote
/// service (object store, broker). Exponential with jitter, matching the
/// teacher's `backends::Retry`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Retry {
    /// Maximum number of retries until retrying stops. Zero means a single
    /// attempt, no retry.
    pub max_retries: usize,
    /// Base delay in seconds for exponential backoff.
    pub delay_secs: f32,
    /// Jitter as a fraction (0.0..=1.0) applied to each computed delay.
    pub jitter: f32,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_secs: 1.0,
            jitter: 0.5,
        }
    }
}

/// Immutable, process-wide configuration. Constructed once in `main()` and
/// passed down as an explicit collaborator (never a global/lazy static),
/// per the design note on avoiding global mutable config.
#[derive(Clone, Debug)]
pub struct Config {
    // -- curators / admission --
    pub curator_user_ids: Vec<i64>,
    pub admin_user_ids: Vec<i64>,

    // -- object store --
    pub s3_endpoint: Option<String>,
    pub s3_region: String,
    pub s3_bucket: String,
    pub s3_key_prefix: String,
    pub bucket_quota_bytes: Option<u64>,
    pub quota_cache_ttl_secs: u64,
    pub store_retry: Retry,

    // -- dedup / local persistence --
    pub database_path: String,

    // -- layout --
    pub max_filename_len: usize,
    pub max_key_len: usize,

    // -- album aggregation --
    pub album_window_secs: u64,
    pub album_max_items: usize,

    // -- routing / size limits --
    pub max_file_gb: u64,
    pub inline_limit_bytes: u64,

    // -- concurrency --
    pub concurrency: usize,
    pub worker_concurrency: usize,
    pub io_timeout_secs: u64,

    // -- queue --
    pub amqp_url: String,
    pub amqp_large_files_queue: String,
    pub amqp_failed_jobs_queue: String,
    pub max_job_retries: usize,

    // -- quota gate --
    pub quota_poll_interval_secs: u64,

    // -- worker session health --
    pub session_probe_interval_secs: u64,

    // -- ambient: observability --
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_addr: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

const DEFAULT_CONCURRENCY_CAP: usize = 32;

impl Config {
    /// Reads every environment flag named in the specification's §6 table,
    /// applying the documented default when unset. Called exactly once,
    /// from `main()`.
    pub fn from_env() -> Result<Self, Error> {
        let curator_user_ids = parse_id_list(&env_var_or("CURATOR_USER_IDS", ""))?;
        let admin_user_ids = parse_id_list(&env_var_or("ADMIN_USER_IDS", ""))?;

        let concurrency = env_var_or("CONCURRENCY", "8")
            .parse::<usize>()
            .err_tip(|| "Invalid CONCURRENCY")?
            .clamp(1, DEFAULT_CONCURRENCY_CAP);

        let log_format = match env_var_or("LOG_FORMAT", "pretty").as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            curator_user_ids,
            admin_user_ids,
            s3_endpoint: env::var("S3_ENDPOINT").ok(),
            s3_region: env_var_or("S3_REGION", "us-east-1"),
            s3_bucket: env_var_or("S3_BUCKET", "teltubby"),
            s3_key_prefix: env_var_or("S3_KEY_PREFIX", "teltubby/"),
            bucket_quota_bytes: env::var("BUCKET_QUOTA_BYTES")
                .ok()
                .map(|v| v.parse::<u64>())
                .transpose()
                .err_tip(|| "Invalid BUCKET_QUOTA_BYTES")?,
            quota_cache_ttl_secs: env_var_parse_or("QUOTA_CACHE_TTL_SECONDS", 30)?,
            store_retry: Retry::default(),
            database_path: env_var_or("DATABASE_PATH", "./data/teltubby.sqlite3"),
            max_filename_len: 120,
            max_key_len: 512,
            album_window_secs: env_var_parse_or("ALBUM_WINDOW_SECONDS", 2)?,
            album_max_items: env_var_parse_or("ALBUM_MAX_ITEMS", 10)?,
            max_file_gb: env_var_parse_or("MAX_FILE_GB", 4)?,
            inline_limit_bytes: env_var_parse_or("INLINE_LIMIT_BYTES", 50 * 1024 * 1024)?,
            concurrency,
            worker_concurrency: env_var_parse_or("WORKER_CONCURRENCY", 1)?,
            io_timeout_secs: env_var_parse_or("IO_TIMEOUT_SECONDS", 60)?,
            amqp_url: env_var_or("AMQP_URL", "amqp://127.0.0.1:5672/%2f"),
            amqp_large_files_queue: env_var_or("AMQP_LARGE_FILES_QUEUE", "large_files"),
            amqp_failed_jobs_queue: env_var_or("AMQP_FAILED_JOBS_QUEUE", "failed_jobs"),
            max_job_retries: env_var_parse_or("MAX_JOB_RETRIES", 3)?,
            quota_poll_interval_secs: env_var_parse_or("QUOTA_POLL_INTERVAL_SECONDS", 30)?,
            session_probe_interval_secs: env_var_parse_or("SESSION_PROBE_INTERVAL_SECONDS", 60)?,
            log_level: env_var_or("LOG_LEVEL", "info"),
            log_format,
            metrics_addr: env_var_or("METRICS_ADDR", "0.0.0.0:8081"),
        })
    }

    #[must_use]
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    #[must_use]
    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_gb * 1024 * 1024 * 1024
    }

    #[must_use]
    pub fn is_curator(&self, user_id: i64) -> bool {
        self.curator_user_ids.contains(&user_id)
    }

    #[must_use]
    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_user_ids.contains(&user_id)
    }
}

fn env_var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_var_parse_or<T>(name: &str, default: T) -> Result<T, Error>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|e| make_input_err!("Invalid {name}: {e}")),
        Err(_) => Ok(default),
    }
}

fn parse_id_list(raw: &str) -> Result<Vec<i64>, Error> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<i64>().map_err(|e| make_input_err!("Invalid id '{s}': {e}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_id_list_handles_empty_and_whitespace() {
        assert_eq!(parse_id_list("").unwrap(), Vec::<i64>::new());
        assert_eq!(parse_id_list(" 1, 2 ,3").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn parse_id_list_rejects_garbage() {
        assert!(parse_id_list("1,abc").is_err());
    }
}
