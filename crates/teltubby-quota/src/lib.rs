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

//! C9: the quota gate. Polls the object store gateway for bucket usage
//! and exposes a cheap, lock-free snapshot (`watch::Receiver`) that the
//! pipeline's admission check and the worker's job-pull loop both read
//! without themselves touching the bucket.

use std::sync::Arc;
use std::time::Duration;

use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use teltubby_store::ObjectStore;
use teltubby_util::task::JoinHandleDropGuard;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaState {
    Open,
    Closed,
}

impl QuotaState {
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, QuotaState::Open)
    }
}

pub struct QuotaGate {
    state_rx: watch::Receiver<QuotaState>,
    _poller: JoinHandleDropGuard<()>,
}

impl QuotaGate {
    /// Spawns the polling task and returns a gate whose `state()` reflects
    /// the most recently observed usage. An unknown quota (the backend
    /// doesn't report one) is treated as always-open.
    pub fn spawn(store: Arc<dyn ObjectStore>, poll_interval: Duration, registry: &mut Registry) -> Self {
        let (state_tx, state_rx) = watch::channel(QuotaState::Open);
        let ratio_gauge: Gauge<f64, std::sync::atomic::AtomicU64> = Gauge::default();
        registry.register(
            "teltubby_bucket_used_ratio",
            "Fraction of configured bucket quota in use, as of the last poll",
            ratio_gauge.clone(),
        );

        let poller = teltubby_util::spawn!("quota-poller", async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                match store.bucket_usage().await {
                    Ok(usage) => {
                        let ratio = usage.used_ratio().unwrap_or(0.0);
                        ratio_gauge.set((ratio * 1000.0).round() / 1000.0);
                        let new_state = if ratio >= 1.0 { QuotaState::Closed } else { QuotaState::Open };
                        if state_tx.send(new_state).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "quota poll failed; leaving state unchanged");
                    }
                }
            }
        });

        Self {
            state_rx,
            _poller: poller,
        }
    }

    #[must_use]
    pub fn state(&self) -> QuotaState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<QuotaState> {
        self.state_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teltubby_store::fakes::InMemoryObjectStore;

    #[tokio::test]
    async fn gate_closes_once_usage_reaches_quota() {
        let mut store = InMemoryObjectStore::new();
        store.quota_bytes = Some(10);
        let (mut tx, rx) = teltubby_util::buf_channel::make_buf_channel_pair();
        tokio::spawn(async move {
            let _ = tx.send(bytes::Bytes::from_static(b"0123456789")).await;
            let _ = tx.send_eof().await;
        });
        store.put("k", rx, "application/octet-stream").await.unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(store);

        let mut registry = Registry::default();
        let gate = QuotaGate::spawn(store, Duration::from_millis(10), &mut registry);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(gate.state(), QuotaState::Closed);
    }

    #[tokio::test]
    async fn gate_stays_open_when_quota_unknown() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let mut registry = Registry::default();
        let gate = QuotaGate::spawn(store, Duration::from_millis(10), &mut registry);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(gate.state(), QuotaState::Open);
    }
}
