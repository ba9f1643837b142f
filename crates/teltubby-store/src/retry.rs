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

//! Jittered exponential backoff, shared by the object store gateway and
//! the ingestion pipeline's per-item upload retries. Both need the same
//! "1s, 3s, 9s" shape; this is the one place that shape is defined.

use std::time::Duration;

use rand::Rng;
use teltubby_config::Retry as RetryConfig;

/// An iterator of delays: `delay_secs * 3^attempt`, jittered by `+/- jitter/2`.
pub struct ExponentialBackoff {
    attempt: u32,
    base: Duration,
    jitter: f32,
    max_retries: usize,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            attempt: 0,
            base: Duration::from_secs_f32(config.delay_secs.max(0.0)),
            jitter: config.jitter.clamp(0.0, 1.0),
            max_retries: config.max_retries,
        }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt as usize >= self.max_retries {
            return None;
        }
        let factor = 3u32.pow(self.attempt);
        let delay = self.base.mul_f32(factor as f32);
        self.attempt += 1;
        let min = 1.0 - self.jitter / 2.0;
        let max = 1.0 + self.jitter / 2.0;
        let jittered = delay.mul_f32(rand::thread_rng().gen_range(min..=max));
        Some(jittered)
    }
}

/// Runs `attempt` until it returns `RetryResult::Ok`/`Err`, sleeping
/// between attempts according to `backoff`. A `RetryResult::Retry` keeps
/// going until `backoff` is exhausted, at which point the last retry error
/// is surfaced.
pub enum RetryResult<T, E> {
    Ok(T),
    Retry(E),
    Err(E),
}

pub async fn retry<T, E, F, Fut>(backoff: ExponentialBackoff, mut attempt: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = RetryResult<T, E>>,
{
    let mut delays = backoff;
    let mut last_err = None;
    loop {
        match attempt().await {
            RetryResult::Ok(value) => return Ok(value),
            RetryResult::Err(err) => return Err(err),
            RetryResult::Retry(err) => {
                last_err = Some(err);
                match delays.next() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => return Err(last_err.expect("just set above")),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_respects_max_retries() {
        let config = RetryConfig {
            max_retries: 3,
            delay_secs: 1.0,
            jitter: 0.0,
        };
        let delays: Vec<Duration> = ExponentialBackoff::new(&config).collect();
        assert_eq!(delays.len(), 3);
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(3));
        assert_eq!(delays[2], Duration::from_secs(9));
    }

    #[tokio::test]
    async fn retry_gives_up_after_exhausting_backoff() {
        let config = RetryConfig {
            max_retries: 2,
            delay_secs: 0.0,
            jitter: 0.0,
        };
        let mut attempts = 0;
        let result: Result<(), &str> = retry(ExponentialBackoff::new(&config), || {
            attempts += 1;
            async move { RetryResult::Retry("still failing") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 3); // initial + 2 retries
    }
}
