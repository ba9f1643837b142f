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

//! Thin wrapper around `prometheus-client` so every component registers
//! its counters the same way instead of hand-rolling exposition text.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// A counter keyed by a single `kind` label, the shape used everywhere an
/// error-kind tag needs a matching metric (item skips, dedup hits, job
/// state transitions, ...).
pub type KindCounter = Family<KindLabel, Counter>;

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct KindLabel {
    pub kind: String,
}

#[must_use]
pub fn new_kind_counter(registry: &mut Registry, name: &str, help: &str) -> KindCounter {
    let counter = KindCounter::default();
    registry.register(name, help, counter.clone());
    counter
}

pub fn render(registry: &Registry) -> String {
    let mut buf = String::new();
    // `encode` only fails on a `fmt::Write` error, which a `String` never
    // produces.
    encode(&mut buf, registry).expect("encoding metrics into a String cannot fail");
    buf
}
