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

//! Periodic user-protocol session health probing. Mirrors
//! `teltubby_quota::QuotaGate`'s shape: a background poller publishes a
//! cheap `watch::Receiver` snapshot that the run loop reads without
//! itself touching the session.

use std::sync::Arc;
use std::time::Duration;

use teltubby_transport::{AdminNotifier, UserTransport};
use teltubby_util::task::JoinHandleDropGuard;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Hold,
}

impl SessionState {
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Active)
    }
}

pub struct SessionGate {
    state_rx: watch::Receiver<SessionState>,
    _poller: JoinHandleDropGuard<()>,
}

impl SessionGate {
    /// Spawns the polling task. Starts `Active`; flips to `Hold` on the
    /// first failed probe and pages admins exactly on that transition, not
    /// on every subsequent failed poll.
    pub fn spawn(transport: Arc<dyn UserTransport>, admin: Arc<dyn AdminNotifier>, poll_interval: Duration) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Active);

        let poller = teltubby_util::spawn!("session-health-poller", async move {
            let mut interval = tokio::time::interval(poll_interval);
            let mut last = SessionState::Active;
            loop {
                interval.tick().await;
                let healthy = transport.probe_session().await.unwrap_or(false);
                let next = if healthy { SessionState::Active } else { SessionState::Hold };
                if next != last {
                    if next == SessionState::Hold {
                        let _ = admin.notify("user-protocol session invalidated; worker is holding job pulls").await;
                        tracing::warn!("user-protocol session invalidated, holding job processing");
                    } else {
                        tracing::info!("user-protocol session recovered, resuming job processing");
                    }
                    last = next;
                }
                if state_tx.send(next).is_err() {
                    return;
                }
            }
        });

        Self {
            state_rx,
            _poller: poller,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use teltubby_error::Error;
    use teltubby_transport::fakes::InMemoryAdminNotifier;
    use teltubby_util::buf_channel::DropCloserReadHalf;
    use teltubby_transport::FileHandle;

    struct FlakyTransport {
        healthy: AtomicBool,
    }

    #[async_trait]
    impl UserTransport for FlakyTransport {
        async fn download(&self, _handle: &FileHandle) -> Result<DropCloserReadHalf, Error> {
            unimplemented!("not exercised by this test")
        }

        async fn probe_session(&self) -> Result<bool, Error> {
            Ok(self.healthy.load(Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn flips_to_hold_and_notifies_admin_once() {
        let transport = Arc::new(FlakyTransport { healthy: AtomicBool::new(false) });
        let admin = Arc::new(InMemoryAdminNotifier::default());
        let gate = SessionGate::spawn(transport, admin.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(gate.state(), SessionState::Hold);
        assert_eq!(admin.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stays_active_while_probe_succeeds() {
        let transport = Arc::new(FlakyTransport { healthy: AtomicBool::new(true) });
        let admin = Arc::new(InMemoryAdminNotifier::default());
        let gate = SessionGate::spawn(transport, admin, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(gate.state(), SessionState::Active);
    }
}
