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

//! C1: the object store gateway. Keyed blob I/O against the bucket, plus
//! usage/quota queries, behind a capability trait so the rest of the
//! pipeline never depends on `aws-sdk-s3` directly.

pub mod retry;
pub mod s3;

use std::path::Path;

use async_trait::async_trait;
use teltubby_error::Error;
use teltubby_util::buf_channel::DropCloserReadHalf;

/// Classification of a failure observed while talking to the backing
/// store, used to decide whether the caller should retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFailure {
    /// Network blip, 5xx, timeout: safe to retry.
    Transient,
    /// 4xx other than throttling: retrying won't help.
    Permanent,
}

/// Bucket usage as last observed by the gateway. `used_ratio` is `None`
/// when the backend doesn't expose a quota (most S3-compatible providers
/// don't), in which case the quota gate treats usage as unbounded (open).
#[derive(Debug, Clone, Copy, Default)]
pub struct BucketUsage {
    pub used_bytes: u64,
    pub quota_bytes: Option<u64>,
}

impl BucketUsage {
    #[must_use]
    pub fn used_ratio(&self) -> Option<f64> {
        self.quota_bytes.map(|quota| {
            if quota == 0 {
                1.0
            } else {
                self.used_bytes as f64 / quota as f64
            }
        })
    }
}

/// The capability interface the rest of the workspace programs against.
/// Private ACL is implied on every `put`; this trait has no way to request
/// a public object, by design (see spec Non-goals: "no public URLs").
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Streams `body` to `key` under a private ACL, tagging the object
    /// with `content_type`. The whole payload is never buffered at once;
    /// `body` is drained chunk by chunk.
    async fn put(
        &self,
        key: &str,
        body: DropCloserReadHalf,
        content_type: &str,
    ) -> Result<(), Error>;

    /// Streams `path` to `key` directly off disk, without reading it into
    /// memory first. This is the path the queue worker uses for large
    /// files it has already downloaded locally; `put` is reserved for the
    /// inline bot path, where payloads are small enough to buffer.
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<(), Error>;

    /// Returns the object's size if it exists, `None` if it doesn't.
    async fn head(&self, key: &str) -> Result<Option<u64>, Error>;

    /// Streams the object's bytes out through a buffered channel.
    async fn get_stream(&self, key: &str) -> Result<DropCloserReadHalf, Error>;

    async fn delete(&self, key: &str) -> Result<(), Error>;

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, Error>;

    /// Current usage, subject to the gateway's own caching policy
    /// (`quota_cache_ttl_secs`) so frequent callers (the quota gate) don't
    /// hammer the bucket's listing API.
    async fn bucket_usage(&self) -> Result<BucketUsage, Error>;
}

#[cfg(any(test, feature = "test-fakes"))]
pub mod fakes {
    use super::*;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use teltubby_util::buf_channel::make_buf_channel_pair;

    /// In-memory `ObjectStore` used by every downstream crate's unit
    /// tests, matching the teacher's own pattern of testing stores against
    /// capability interfaces rather than a live backend.
    #[derive(Default)]
    pub struct InMemoryObjectStore {
        objects: Mutex<HashMap<String, Bytes>>,
        pub quota_bytes: Option<u64>,
    }

    impl InMemoryObjectStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn contents(&self, key: &str) -> Option<Bytes> {
            self.objects.lock().unwrap().get(key).cloned()
        }
    }

    #[async_trait]
    impl ObjectStore for InMemoryObjectStore {
        async fn put(
            &self,
            key: &str,
            mut body: DropCloserReadHalf,
            _content_type: &str,
        ) -> Result<(), Error> {
            let mut buf = Vec::new();
            loop {
                let chunk = body.recv().await?;
                if chunk.is_empty() {
                    break;
                }
                buf.extend_from_slice(&chunk);
            }
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), Bytes::from(buf));
            Ok(())
        }

        async fn put_file(&self, key: &str, path: &std::path::Path, _content_type: &str) -> Result<(), Error> {
            let data = tokio::fs::read(path)
                .await
                .map_err(|e| teltubby_error::make_err!(teltubby_error::Code::Internal, "{e}"))?;
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), Bytes::from(data));
            Ok(())
        }

        async fn head(&self, key: &str) -> Result<Option<u64>, Error> {
            Ok(self.objects.lock().unwrap().get(key).map(|b| b.len() as u64))
        }

        async fn get_stream(&self, key: &str) -> Result<DropCloserReadHalf, Error> {
            let data = self
                .objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| {
                    teltubby_error::make_err!(teltubby_error::Code::NotFound, "no such key: {key}")
                })?;
            let (mut tx, rx) = make_buf_channel_pair();
            tokio::spawn(async move {
                let _ = tx.send(data).await;
                let _ = tx.send_eof().await;
            });
            Ok(rx)
        }

        async fn delete(&self, key: &str) -> Result<(), Error> {
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }

        async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, Error> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }

        async fn bucket_usage(&self) -> Result<BucketUsage, Error> {
            let used_bytes = self.objects.lock().unwrap().values().map(|b| b.len() as u64).sum();
            Ok(BucketUsage {
                used_bytes,
                quota_bytes: self.quota_bytes,
            })
        }
    }
}
