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

//! Topology and the concrete [`crate::Queue`] implementation: a durable
//! `large_files` queue with a `failed_jobs` dead-letter queue, persistent
//! messages, manual acks, prefetch 1.

use async_trait::async_trait;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use teltubby_error::{make_err, Code, Error, ResultExt};
use uuid::Uuid;

use crate::store::JobStore;
use crate::types::{Job, JobMetadata, JobState, NewJob, QueueEnvelope};
use crate::Queue;

const MAIN_EXCHANGE: &str = "large_files_exchange";
const DLX_EXCHANGE: &str = "failed_jobs_exchange";

pub struct AmqpQueue {
    channel: Channel,
    store: JobStore,
    large_files_queue: String,
    failed_jobs_queue: String,
}

impl AmqpQueue {
    pub async fn connect(amqp_url: &str, large_files_queue: &str, failed_jobs_queue: &str, store: JobStore) -> Result<Self, Error> {
        let connection = Connection::connect(amqp_url, ConnectionProperties::default())
            .await
            .err_tip(|| "connecting to amqp broker")?;
        let channel = connection.create_channel().await.err_tip(|| "opening amqp channel")?;
        declare_topology(&channel, large_files_queue, failed_jobs_queue).await?;
        Ok(Self {
            channel,
            store,
            large_files_queue: large_files_queue.to_string(),
            failed_jobs_queue: failed_jobs_queue.to_string(),
        })
    }

    #[must_use]
    pub fn large_files_queue(&self) -> &str {
        &self.large_files_queue
    }

    /// Opens a prefetch-1 consumer on the main queue. Ack/nack of each
    /// delivery is the caller's responsibility (the worker binary's
    /// integration layer, not this crate or `teltubby-worker`).
    pub async fn consumer(&self, consumer_tag: &str) -> Result<Consumer, Error> {
        self.channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .err_tip(|| "setting consumer prefetch")?;
        self.channel
            .basic_consume(
                &self.large_files_queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .err_tip(|| "starting amqp consumer")
    }

    pub async fn publish(&self, envelope: &QueueEnvelope) -> Result<(), Error> {
        let payload = serde_json::to_vec(envelope).err_tip(|| "encoding job envelope")?;
        self.channel
            .basic_publish(
                MAIN_EXCHANGE,
                &self.large_files_queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .err_tip(|| "publishing job to broker")?
            .await
            .err_tip(|| "awaiting broker publish confirmation")?;
        Ok(())
    }
}

async fn declare_topology(channel: &Channel, large_files_queue: &str, failed_jobs_queue: &str) -> Result<(), Error> {
    channel
        .exchange_declare(
            DLX_EXCHANGE,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .err_tip(|| "declaring dead-letter exchange")?;
    channel
        .queue_declare(
            failed_jobs_queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .err_tip(|| "declaring dead-letter queue")?;
    channel
        .queue_bind(
            failed_jobs_queue,
            DLX_EXCHANGE,
            failed_jobs_queue,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .err_tip(|| "binding dead-letter queue")?;

    channel
        .exchange_declare(
            MAIN_EXCHANGE,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .err_tip(|| "declaring main exchange")?;
    let mut main_args = FieldTable::default();
    main_args.insert("x-dead-letter-exchange".into(), DLX_EXCHANGE.into());
    main_args.insert("x-dead-letter-routing-key".into(), failed_jobs_queue.into());
    channel
        .queue_declare(
            large_files_queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            main_args,
        )
        .await
        .err_tip(|| "declaring main queue")?;
    channel
        .queue_bind(
            large_files_queue,
            MAIN_EXCHANGE,
            large_files_queue,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .err_tip(|| "binding main queue")?;
    Ok(())
}

#[async_trait]
impl Queue for AmqpQueue {
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, Error> {
        let job_id = Uuid::new_v4();
        let envelope = QueueEnvelope {
            job_id,
            user_id: job.user_id,
            chat_id: job.chat_id,
            message_id: job.message_id,
            file_info: job.file_info,
            telegram_context: job.telegram_context,
            job_metadata: JobMetadata {
                created_at: chrono::Utc::now(),
                priority: job.priority,
                retry_count: 0,
                max_retries: job.max_retries,
            },
        };
        self.store.insert_pending(&envelope).await?;
        if let Err(publish_err) = self.publish(&envelope).await {
            self.store
                .transition(job_id, JobState::Failed, Some("enqueue_failed"))
                .await
                .err_tip(|| "marking job failed after publish error")?;
            return Err(publish_err.with_kind("enqueue_failed"));
        }
        Ok(job_id)
    }

    async fn record_state(&self, job_id: Uuid, new_state: JobState, err: Option<&str>) -> Result<(), Error> {
        self.store.transition(job_id, new_state, err).await
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<Job>, Error> {
        self.store.list_recent(limit).await
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, Error> {
        self.store.get(job_id).await
    }

    async fn retry(&self, job_id: Uuid) -> Result<(), Error> {
        let envelope = self.store.reset_to_pending(job_id).await?;
        self.publish(&envelope).await
    }

    async fn cancel(&self, job_id: Uuid) -> Result<(), Error> {
        if self.store.mark_cancelled_if_pending(job_id).await? {
            return Ok(());
        }
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| make_err!(Code::NotFound, "no such job: {job_id}"))?;
        if job.state == JobState::Processing {
            self.store.request_cancellation(job_id).await?;
            return Ok(());
        }
        Err(make_err!(
            Code::InvalidArgument,
            "cannot cancel job in state {:?}",
            job.state
        ))
    }
}
