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

//! C6: classifies an item as `inline` (bot path) or `queue` (worker
//! path). The declared size hint is untrusted; when it's ambiguous the
//! router falls back to a cheap, idempotent probe against the transport.

use async_trait::async_trait;
use teltubby_error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Inline,
    Queue,
}

/// A metadata-only probe the router uses when the declared size hint
/// alone isn't decisive. Implemented by the bot transport; a test double
/// can simulate "transport says too big" without touching the network.
#[async_trait]
pub trait SizeProbe: Send + Sync {
    /// Returns `Ok(true)` if the transport confirms the file is too large
    /// to fetch inline, `Ok(false)` if it's fetchable, and `Err` on a
    /// genuine probe failure (treated as non-authoritative by the caller).
    async fn confirms_too_big(&self, file_id: &str) -> Result<bool, Error>;
}

/// Routes a single item given its declared size hint. `size_hint_bytes`
/// may be absent (some transports omit it for certain kinds); absence is
/// treated the same as "not decisively over the limit" and falls through
/// to the probe.
pub async fn route(
    size_hint_bytes: Option<u64>,
    inline_limit_bytes: u64,
    file_id: &str,
    probe: &dyn SizeProbe,
) -> Route {
    if let Some(size) = size_hint_bytes {
        if size > inline_limit_bytes {
            return Route::Queue;
        }
    }
    match probe.confirms_too_big(file_id).await {
        Ok(true) => Route::Queue,
        Ok(false) | Err(_) => Route::Inline,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(bool);

    #[async_trait]
    impl SizeProbe for FixedProbe {
        async fn confirms_too_big(&self, _file_id: &str) -> Result<bool, Error> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn size_hint_above_limit_routes_to_queue_without_probing() {
        let probe = FixedProbe(false);
        let route = route(Some(100), 50, "f1", &probe).await;
        assert_eq!(route, Route::Queue);
    }

    #[tokio::test]
    async fn size_hint_within_limit_but_probe_confirms_too_big_routes_to_queue() {
        let probe = FixedProbe(true);
        let route = route(Some(10), 50, "f1", &probe).await;
        assert_eq!(route, Route::Queue);
    }

    #[tokio::test]
    async fn size_hint_within_limit_and_probe_ok_routes_inline() {
        let probe = FixedProbe(false);
        let route = route(Some(10), 50, "f1", &probe).await;
        assert_eq!(route, Route::Inline);
    }

    #[tokio::test]
    async fn missing_size_hint_falls_back_to_probe() {
        let probe = FixedProbe(true);
        let route = route(None, 50, "f1", &probe).await;
        assert_eq!(route, Route::Queue);
    }

    #[tokio::test]
    async fn exactly_at_limit_is_inline() {
        let probe = FixedProbe(false);
        let route = route(Some(50), 50, "f1", &probe).await;
        assert_eq!(route, Route::Inline);
    }
}
