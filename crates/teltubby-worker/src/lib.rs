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

//! C8: the queue worker library. The binary that owns the `lapin`
//! consumer parses each delivery into a `QueueEnvelope` and drives
//! [`Worker::run_envelope`]; everything broker-specific (ack, nack,
//! requeue-with-delay) stays in that thin integration layer, one level
//! above what's tested here.

pub mod metrics;
pub mod session;
pub mod worker;

pub use metrics::WorkerMetrics;
pub use session::{SessionGate, SessionState};
pub use worker::{RunOutcome, Worker, WorkerConfig};
