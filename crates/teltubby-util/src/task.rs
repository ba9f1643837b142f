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

use tokio::task::JoinHandle;

/// Wraps a [`JoinHandle`] so the spawned task is aborted when the guard is
/// dropped, instead of being left to run detached. Long-lived background
/// tasks (the aggregator reaper, the quota poller, the matching loop) are
/// all held behind one of these so shutdown is just "drop everything".
pub struct JoinHandleDropGuard<T> {
    handle: JoinHandle<T>,
}

impl<T> JoinHandleDropGuard<T> {
    #[must_use]
    pub fn new(handle: JoinHandle<T>) -> Self {
        Self { handle }
    }
}

impl<T> Drop for JoinHandleDropGuard<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawns a named task. Naming every long-lived task makes `tokio-console`
/// output (and panics) legible; this is the one place tasks are spawned
/// across the workspace's long-running loops.
#[macro_export]
macro_rules! spawn {
    ($name:expr, $fut:expr) => {{
        use tracing::Instrument as _;
        $crate::task::JoinHandleDropGuard::new(tokio::spawn(
            async move { $fut.await }.instrument(tracing::info_span!("task", name = $name)),
        ))
    }};
}
