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

//! The bot-protocol entry point: wires every in-scope collaborator
//! together and drives the admission path from a stream of
//! [`IncomingMessage`]s.
//!
//! The chat transport itself — the wire protocol a real bot library would
//! speak to Telegram, and the listener that turns updates into
//! [`IncomingMessage`]s — is an external collaborator out of scope here
//! (the same boundary `teltubby_transport::UnavailableBotTransport` marks).
//! This crate owns everything on the archive side of that boundary:
//! quota, dedup, routing, aggregation, storage, metadata, and the
//! health/metrics surface.

pub mod incoming;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use prometheus_client::registry::Registry;
use teltubby_aggregator::{Aggregator, AggregatorConfig};
use teltubby_config::Config;
use teltubby_dedup::DedupIndex;
use teltubby_error::{Error, ResultExt};
use teltubby_pipeline::{Pipeline, PipelineConfig, PipelineMetrics};
use teltubby_queue::{AmqpQueue, Queue};
use teltubby_quota::QuotaGate;
use teltubby_service::{HealthState, MetricsServer};
use teltubby_store::s3::S3ObjectStore;
use teltubby_store::ObjectStore;
use teltubby_transport::{BotTransport, UnavailableBotTransport};
use tokio::sync::{mpsc, Semaphore};

pub use incoming::{build_unit, IncomingMessage};

/// Connects every collaborator, starts the health/metrics listener, and
/// drives `incoming_rx` through the aggregator and pipeline until a
/// shutdown signal arrives. Returns once shutdown completes cleanly.
pub async fn run(config: Config, mut incoming_rx: mpsc::Receiver<IncomingMessage>) -> Result<(), Error> {
    let mut registry = Registry::default();

    let store: Arc<dyn ObjectStore> = Arc::new(
        S3ObjectStore::from_config(&config)
            .await
            .err_tip(|| "connecting to object store")?,
    );
    let dedup_pool = teltubby_dedup::pool::connect(&config.database_path)
        .await
        .err_tip(|| "opening dedup database")?;
    let dedup = Arc::new(DedupIndex::new(dedup_pool));
    let job_store = teltubby_queue::store::JobStore::connect(&config.database_path)
        .await
        .err_tip(|| "opening job store")?;
    let queue: Arc<dyn Queue> = Arc::new(
        AmqpQueue::connect(
            &config.amqp_url,
            &config.amqp_large_files_queue,
            &config.amqp_failed_jobs_queue,
            job_store,
        )
        .await
        .err_tip(|| "connecting to amqp broker")?,
    );
    let bot: Arc<dyn BotTransport> = Arc::new(UnavailableBotTransport);

    let quota_gate = QuotaGate::spawn(
        store.clone(),
        Duration::from_secs(config.quota_poll_interval_secs),
        &mut registry,
    );
    let pipeline_metrics = Arc::new(PipelineMetrics::register(&mut registry));
    let pipeline = Arc::new(Pipeline::new(
        store,
        dedup,
        queue,
        bot,
        quota_gate.subscribe(),
        pipeline_metrics,
        PipelineConfig {
            bucket: config.s3_bucket.clone(),
            max_file_bytes: config.max_file_bytes(),
            inline_limit_bytes: config.inline_limit_bytes,
            max_filename_len: config.max_filename_len,
            max_key_len: config.max_key_len,
            max_job_retries: config.max_job_retries as u32,
        },
    ));

    let (aggregator, mut emit_rx) = Aggregator::new(AggregatorConfig {
        window: Duration::from_secs(config.album_window_secs),
        max_items: config.album_max_items,
    });

    let _admission_task = teltubby_util::spawn!("bot-admission-loop", async move {
        while let Some(message) = incoming_rx.recv().await {
            aggregator.push(message).await;
        }
    });

    let health = Arc::new(HealthState::new());
    let registry = Arc::new(registry);
    let metrics_addr: SocketAddr = config
        .metrics_addr
        .parse()
        .err_tip(|| format!("parsing METRICS_ADDR {}", config.metrics_addr))?;
    let _metrics_server = MetricsServer::spawn(metrics_addr, registry, health.clone())?;
    health.set_ready(true);

    let semaphore = Arc::new(Semaphore::new(config.concurrency));
    let commit_loop = async {
        while let Some(batch) = emit_rx.recv().await {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore is never closed while the commit loop runs");
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let unit = build_unit(batch);
                match pipeline.commit_unit(unit).await {
                    Ok(outcome) => tracing::info!(?outcome, "unit commit finished"),
                    Err(err) => tracing::error!(error = %err, "unit commit failed"),
                }
            });
        }
    };

    tokio::select! {
        () = commit_loop => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}
