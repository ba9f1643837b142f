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

//! The queue-worker entry point: owns the `lapin::Consumer` and the
//! broker-facing ack/nack decision that `teltubby_worker::Worker` itself
//! deliberately stays out of.
//!
//! The user-protocol (MTProto) session and the bot-protocol ack channel
//! are both external collaborators out of scope here, same as in
//! `teltubby-bot`; this binary wires them as
//! `teltubby_transport::{UnavailableUserTransport, UnavailableBotTransport}`
//! and leans on `SessionGate` holding job pulls until a real session is
//! plugged in.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use prometheus_client::registry::Registry;
use teltubby_config::Config;
use teltubby_dedup::DedupIndex;
use teltubby_error::{Error, ResultExt};
use teltubby_queue::{AmqpQueue, JobPublisher, Queue, QueueEnvelope};
use teltubby_service::{HealthState, MetricsServer};
use teltubby_store::s3::S3ObjectStore;
use teltubby_store::ObjectStore;
use teltubby_transport::{AdminNotifier, BotTransport, LoggingAdminNotifier, UnavailableBotTransport, UnavailableUserTransport, UserTransport};
use teltubby_worker::{RunOutcome, SessionGate, Worker, WorkerConfig, WorkerMetrics};
use tokio::sync::Semaphore;

/// What a finished (or failed) `run_envelope` call means for the
/// delivery's broker-level disposition. Kept as a pure function of the
/// outcome so it's testable without a running broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    NackRequeue,
}

#[must_use]
pub fn ack_decision(result: &Result<RunOutcome, Error>) -> AckDecision {
    match result {
        Ok(RunOutcome::HeldForSession) => AckDecision::NackRequeue,
        Ok(_) => AckDecision::Ack,
        Err(_) => AckDecision::NackRequeue,
    }
}

/// Connects every collaborator, starts the health/metrics listener, and
/// consumes the broker queue until a shutdown signal arrives.
pub async fn run(config: Config) -> Result<(), Error> {
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
    let queue = Arc::new(
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
    let user_transport: Arc<dyn UserTransport> = Arc::new(UnavailableUserTransport);
    let admin: Arc<dyn AdminNotifier> = Arc::new(LoggingAdminNotifier);

    let session = SessionGate::spawn(
        user_transport.clone(),
        admin,
        Duration::from_secs(config.session_probe_interval_secs),
    );
    let worker_metrics = Arc::new(WorkerMetrics::register(&mut registry));
    let worker = Arc::new(Worker::new(
        store,
        dedup,
        queue.clone() as Arc<dyn Queue>,
        queue.clone() as Arc<dyn JobPublisher>,
        user_transport,
        bot,
        session.subscribe(),
        worker_metrics,
        WorkerConfig {
            bucket: config.s3_bucket.clone(),
            max_filename_len: config.max_filename_len,
            max_key_len: config.max_key_len,
            requeue_base_delay: Duration::from_secs(1),
        },
    ));

    let health = Arc::new(HealthState::new());
    let registry = Arc::new(registry);
    let metrics_addr: SocketAddr = config
        .metrics_addr
        .parse()
        .err_tip(|| format!("parsing METRICS_ADDR {}", config.metrics_addr))?;
    let _metrics_server = MetricsServer::spawn(metrics_addr, registry, health.clone())?;
    health.set_ready(true);

    let consumer_tag = format!("teltubby-worker-{}", uuid::Uuid::new_v4());
    let mut consumer = queue.consumer(&consumer_tag).await.err_tip(|| "starting broker consumer")?;
    let semaphore = Arc::new(Semaphore::new(config.worker_concurrency));

    let consume_loop = async {
        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(err) => {
                    tracing::error!(error = %err, "broker consumer stream error");
                    continue;
                }
            };

            if !session.state().is_active() {
                if let Err(err) = delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await {
                    tracing::error!(error = %err, "failed to nack while session is on hold");
                }
                continue;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore is never closed while the consume loop runs");
            let worker = worker.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let envelope: QueueEnvelope = match serde_json::from_slice(&delivery.data) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        tracing::error!(error = %err, "malformed job envelope; dropping without requeue");
                        let _ = delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await;
                        return;
                    }
                };

                let result = worker.run_envelope(envelope).await;
                if let Ok(outcome) = &result {
                    tracing::info!(?outcome, "job finished");
                }
                if let Err(err) = &result {
                    tracing::error!(error = %err, "run_envelope failed");
                }

                let ack_result = match ack_decision(&result) {
                    AckDecision::Ack => delivery.ack(BasicAckOptions::default()).await,
                    AckDecision::NackRequeue => delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await,
                };
                if let Err(err) = ack_result {
                    tracing::error!(error = %err, "failed to settle delivery with the broker");
                }
            });
        }
    };

    tokio::select! {
        () = consume_loop => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use teltubby_error::{make_err, Code};

    #[test]
    fn held_for_session_requeues_without_consuming_a_retry() {
        let result = Ok(RunOutcome::HeldForSession);
        assert_eq!(ack_decision(&result), AckDecision::NackRequeue);
    }

    #[test]
    fn stored_and_duplicate_and_terminal_outcomes_ack() {
        assert_eq!(ack_decision(&Ok(RunOutcome::Stored { s3_key: "k".into() })), AckDecision::Ack);
        assert_eq!(ack_decision(&Ok(RunOutcome::Duplicate { duplicate_of: "k".into() })), AckDecision::Ack);
        assert_eq!(ack_decision(&Ok(RunOutcome::Failed { reason: "boom".into() })), AckDecision::Ack);
        assert_eq!(ack_decision(&Ok(RunOutcome::Requeued { retry_count: 1 })), AckDecision::Ack);
    }

    #[test]
    fn infra_level_error_requeues() {
        let result: Result<RunOutcome, Error> = Err(make_err!(Code::Unavailable, "queue.get failed"));
        assert_eq!(ack_decision(&result), AckDecision::NackRequeue);
    }
}
