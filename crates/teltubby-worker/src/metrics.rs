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

//! Counters for job outcomes, labeled the same way `teltubby-pipeline`
//! labels item outcomes so the two surfaces read consistently on one
//! dashboard.

use prometheus_client::registry::Registry;
use teltubby_util::metrics::{new_kind_counter, KindCounter};

pub struct WorkerMetrics {
    pub jobs_by_outcome: KindCounter,
    pub dedup_hits: KindCounter,
}

impl WorkerMetrics {
    #[must_use]
    pub fn register(registry: &mut Registry) -> Self {
        let jobs_by_outcome = new_kind_counter(
            registry,
            "teltubby_worker_jobs_total",
            "Queue jobs processed by the worker, labeled by outcome",
        );
        let dedup_hits = new_kind_counter(
            registry,
            "teltubby_worker_dedup_hits_total",
            "Queue jobs resolved as duplicates, labeled by dedup reason",
        );
        Self { jobs_by_outcome, dedup_hits }
    }
}
