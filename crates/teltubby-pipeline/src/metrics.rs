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

//! Counters for the observable side effects §4.5 calls out: messages
//! processed, bytes uploaded, dedup hits, and skipped/failed items.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;
use teltubby_util::metrics::{new_kind_counter, KindCounter};

pub struct PipelineMetrics {
    pub units_committed: Counter,
    pub bytes_uploaded: Counter,
    pub dedup_hits: KindCounter,
    pub items_by_outcome: KindCounter,
}

impl PipelineMetrics {
    #[must_use]
    pub fn register(registry: &mut Registry) -> Self {
        let units_committed = Counter::default();
        registry.register(
            "teltubby_units_committed_total",
            "Archive units that reached a committed or rejected outcome",
            units_committed.clone(),
        );
        let bytes_uploaded = Counter::default();
        registry.register(
            "teltubby_bytes_uploaded_total",
            "Total bytes written to the object store by the pipeline",
            bytes_uploaded.clone(),
        );
        let dedup_hits = new_kind_counter(
            registry,
            "teltubby_dedup_hits_total",
            "Items resolved as duplicates, labeled by dedup reason",
        );
        let items_by_outcome = new_kind_counter(
            registry,
            "teltubby_items_total",
            "Items processed by the pipeline, labeled by outcome",
        );
        Self {
            units_committed,
            bytes_uploaded,
            dedup_hits,
            items_by_outcome,
        }
    }
}
