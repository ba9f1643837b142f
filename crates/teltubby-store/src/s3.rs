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

//! `S3ObjectStore`: the concrete [`crate::ObjectStore`] backed by any
//! S3-compatible endpoint, reached through `aws-sdk-s3`. Every write goes
//! out with a private ACL; there is no code path that can make an object
//! public.

use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::TryStreamExt as _;
use teltubby_config::{Config, Retry as RetryConfig};
use teltubby_error::{make_err, Code, Error, ResultExt};
use teltubby_util::buf_channel::DropCloserReadHalf;

use crate::retry::{retry, ExponentialBackoff, RetryResult};
use crate::{BucketUsage, ObjectStore};

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    key_prefix: String,
    quota_bytes: Option<u64>,
    retry: RetryConfig,
    quota_cache_ttl: Duration,
    usage_cache: Mutex<Option<(Instant, BucketUsage)>>,
}

impl S3ObjectStore {
    pub async fn from_config(config: &Config) -> Result<Self, Error> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(config.s3_region.clone()));
        if let Some(endpoint) = &config.s3_endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.s3_endpoint.is_some())
            .build();
        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.s3_bucket.clone(),
            key_prefix: config.s3_key_prefix.clone(),
            quota_bytes: config.bucket_quota_bytes,
            retry: config.store_retry.clone(),
            quota_cache_ttl: Duration::from_secs(config.quota_cache_ttl_secs),
            usage_cache: Mutex::new(None),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(&self.retry)
    }
}

/// Buckets a raw SDK error into retryable vs. not, mirroring the
/// status-code triage the gateway applies to every S3 call.
fn classify<E, R>(err: &SdkError<E, R>) -> bool
where
    R: std::fmt::Debug,
{
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => true,
        SdkError::ResponseError(resp) => {
            let status = resp.raw().status().as_u16();
            status == 429 || status >= 500
        }
        SdkError::ServiceError(service_err) => {
            let status = service_err.raw().status().as_u16();
            status == 429 || status >= 500
        }
        SdkError::ConstructionFailure(_) => false,
        _ => false,
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        key: &str,
        mut body: DropCloserReadHalf,
        content_type: &str,
    ) -> Result<(), Error> {
        // Inline-path payloads are bounded by `inline_limit_bytes` upstream,
        // so buffering the whole object here is safe. Large files go
        // through `put_file` instead, which never touches memory.
        let mut buf = Vec::new();
        loop {
            let chunk = body.recv().await.err_tip(|| "reading item body for upload")?;
            if chunk.is_empty() {
                break;
            }
            buf.extend_from_slice(&chunk);
        }
        let full_key = self.full_key(key);
        let content_type = content_type.to_string();
        retry(self.backoff(), || {
            let body = Bytes::from(buf.clone());
            let full_key = full_key.clone();
            let content_type = content_type.clone();
            async move {
                let result = self
                    .client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(&full_key)
                    .acl(ObjectCannedAcl::Private)
                    .content_type(content_type)
                    .body(ByteStream::from(body))
                    .send()
                    .await;
                match result {
                    Ok(_) => RetryResult::Ok(()),
                    Err(err) if classify(&err) => {
                        RetryResult::Retry(make_err!(Code::Unavailable, "s3 put_object: {err}"))
                    }
                    Err(err) => RetryResult::Err(make_err!(Code::Internal, "s3 put_object: {err}")),
                }
            }
        })
        .await
    }

    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<(), Error> {
        let full_key = self.full_key(key);
        let content_type = content_type.to_string();
        retry(self.backoff(), || {
            let full_key = full_key.clone();
            let content_type = content_type.clone();
            let path = path.to_path_buf();
            async move {
                let body = match ByteStream::from_path(&path).await {
                    Ok(body) => body,
                    Err(err) => {
                        return RetryResult::Err(make_err!(Code::Internal, "reading {path:?}: {err}"))
                    }
                };
                let result = self
                    .client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(&full_key)
                    .acl(ObjectCannedAcl::Private)
                    .content_type(content_type)
                    .body(body)
                    .send()
                    .await;
                match result {
                    Ok(_) => RetryResult::Ok(()),
                    Err(err) if classify(&err) => {
                        RetryResult::Retry(make_err!(Code::Unavailable, "s3 put_object: {err}"))
                    }
                    Err(err) => RetryResult::Err(make_err!(Code::Internal, "s3 put_object: {err}")),
                }
            }
        })
        .await
    }

    async fn head(&self, key: &str) -> Result<Option<u64>, Error> {
        let full_key = self.full_key(key);
        retry(self.backoff(), || {
            let full_key = full_key.clone();
            async move {
                let result = self.client.head_object().bucket(&self.bucket).key(&full_key).send().await;
                match result {
                    Ok(output) => RetryResult::Ok(Some(output.content_length().unwrap_or_default() as u64)),
                    Err(SdkError::ServiceError(e)) if e.raw().status().as_u16() == 404 => {
                        RetryResult::Ok(None)
                    }
                    Err(err) if classify(&err) => {
                        RetryResult::Retry(make_err!(Code::Unavailable, "s3 head_object: {err}"))
                    }
                    Err(err) => RetryResult::Err(make_err!(Code::Internal, "s3 head_object: {err}")),
                }
            }
        })
        .await
    }

    async fn get_stream(&self, key: &str) -> Result<DropCloserReadHalf, Error> {
        let full_key = self.full_key(key);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|err| make_err!(Code::NotFound, "s3 get_object {full_key}: {err}"))?;

        let (mut tx, rx) = teltubby_util::buf_channel::make_buf_channel_pair();
        let mut body = output.body;
        tokio::spawn(async move {
            loop {
                match body.try_next().await {
                    Ok(Some(chunk)) => {
                        if tx.send(chunk).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send_eof().await;
                        return;
                    }
                    Err(_) => return,
                }
            }
        });
        Ok(rx)
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let full_key = self.full_key(key);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|err| make_err!(Code::Internal, "s3 delete_object {full_key}: {err}"))?;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let full_prefix = self.full_key(prefix);
        let mut keys = Vec::new();
        let mut continuation_token = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }
            let output = request
                .send()
                .await
                .map_err(|err| make_err!(Code::Internal, "s3 list_objects_v2: {err}"))?;
            for object in output.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
            if output.is_truncated().unwrap_or(false) {
                continuation_token = output.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }
        Ok(keys)
    }

    async fn bucket_usage(&self) -> Result<BucketUsage, Error> {
        if let Some((observed_at, usage)) = *self.usage_cache.lock().unwrap() {
            if observed_at.elapsed() < self.quota_cache_ttl {
                return Ok(usage);
            }
        }

        let full_prefix = self.full_key("");
        let mut used_bytes = 0u64;
        let mut continuation_token = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }
            let output = request
                .send()
                .await
                .map_err(|err| make_err!(Code::Internal, "s3 list_objects_v2: {err}"))?;
            for object in output.contents() {
                used_bytes += object.size().unwrap_or_default() as u64;
            }
            if output.is_truncated().unwrap_or(false) {
                continuation_token = output.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        let usage = BucketUsage {
            used_bytes,
            quota_bytes: self.quota_bytes,
        };
        *self.usage_cache.lock().unwrap() = Some((Instant::now(), usage));
        Ok(usage)
    }
}
