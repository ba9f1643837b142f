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

//! C7: the job queue client. A durable AMQP topology fronts a local
//! SQLite job table that is the source of truth for admin reads — per I5,
//! no queue message may exist whose job id is unknown locally.

pub mod amqp;
pub mod store;
pub mod types;

pub use amqp::AmqpQueue;
pub use types::{FileInfo, Job, JobMetadata, JobState, NewJob, QueueEnvelope, TelegramContext};

use async_trait::async_trait;
use teltubby_error::Error;
use uuid::Uuid;

#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, Error>;
    async fn record_state(&self, job_id: Uuid, new_state: JobState, err: Option<&str>) -> Result<(), Error>;
    async fn list_recent(&self, limit: i64) -> Result<Vec<Job>, Error>;
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, Error>;
    async fn retry(&self, job_id: Uuid) -> Result<(), Error>;
    async fn cancel(&self, job_id: Uuid) -> Result<(), Error>;
}

/// Re-publishing a job envelope (a transient-failure requeue with an
/// incremented retry count) is broker plumbing, not part of the admin-facing
/// `Queue` surface — split out so the worker can depend on it without
/// pulling in `list_recent`/`cancel`/etc.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn republish(&self, envelope: &QueueEnvelope) -> Result<(), Error>;
}

#[async_trait]
impl JobPublisher for AmqpQueue {
    async fn republish(&self, envelope: &QueueEnvelope) -> Result<(), Error> {
        self.publish(envelope).await
    }
}

#[cfg(any(test, feature = "test-fakes"))]
pub mod fakes {
    use super::*;
    use std::sync::Mutex;
    use teltubby_error::make_err;

    /// In-memory `Queue` with no broker: publishes are no-ops, so tests
    /// exercise the job state graph without an AMQP dependency.
    #[derive(Default)]
    pub struct InMemoryQueue {
        jobs: Mutex<Vec<Job>>,
        pub republished: Mutex<Vec<QueueEnvelope>>,
    }

    #[async_trait]
    impl JobPublisher for InMemoryQueue {
        async fn republish(&self, envelope: &QueueEnvelope) -> Result<(), Error> {
            self.republished.lock().unwrap().push(envelope.clone());
            Ok(())
        }
    }

    #[async_trait]
    impl Queue for InMemoryQueue {
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
            let now = chrono::Utc::now();
            self.jobs.lock().unwrap().push(Job {
                job_id,
                envelope,
                state: JobState::Pending,
                cancellation_requested: false,
                last_error: None,
                created_at: now,
                updated_at: now,
            });
            Ok(job_id)
        }

        async fn record_state(&self, job_id: Uuid, new_state: JobState, err: Option<&str>) -> Result<(), Error> {
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs
                .iter_mut()
                .find(|j| j.job_id == job_id)
                .ok_or_else(|| make_err!(teltubby_error::Code::NotFound, "no such job"))?;
            if !job.state.can_transition_to(new_state) {
                return Err(make_err!(
                    teltubby_error::Code::InvalidArgument,
                    "illegal transition {:?} -> {:?}",
                    job.state,
                    new_state
                ));
            }
            job.state = new_state;
            job.last_error = err.map(str::to_string);
            job.updated_at = chrono::Utc::now();
            Ok(())
        }

        async fn list_recent(&self, limit: i64) -> Result<Vec<Job>, Error> {
            let jobs = self.jobs.lock().unwrap();
            Ok(jobs.iter().rev().take(limit.max(0) as usize).cloned().collect())
        }

        async fn get(&self, job_id: Uuid) -> Result<Option<Job>, Error> {
            Ok(self.jobs.lock().unwrap().iter().find(|j| j.job_id == job_id).cloned())
        }

        async fn retry(&self, job_id: Uuid) -> Result<(), Error> {
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs
                .iter_mut()
                .find(|j| j.job_id == job_id)
                .ok_or_else(|| make_err!(teltubby_error::Code::NotFound, "no such job"))?;
            if !job.state.is_terminal() {
                return Err(make_err!(teltubby_error::Code::InvalidArgument, "job not terminal"));
            }
            job.state = JobState::Pending;
            job.cancellation_requested = false;
            job.updated_at = chrono::Utc::now();
            Ok(())
        }

        async fn cancel(&self, job_id: Uuid) -> Result<(), Error> {
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs
                .iter_mut()
                .find(|j| j.job_id == job_id)
                .ok_or_else(|| make_err!(teltubby_error::Code::NotFound, "no such job"))?;
            match job.state {
                JobState::Pending => {
                    job.state = JobState::Cancelled;
                    job.updated_at = chrono::Utc::now();
                    Ok(())
                }
                JobState::Processing => {
                    job.cancellation_requested = true;
                    Ok(())
                }
                _ => Err(make_err!(teltubby_error::Code::InvalidArgument, "cannot cancel job in state {:?}", job.state)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::InMemoryQueue;
    use super::*;

    fn sample_job() -> NewJob {
        NewJob {
            user_id: 1,
            chat_id: 2,
            message_id: 3,
            file_info: FileInfo {
                file_id: "f1".into(),
                file_unique_id: "u1".into(),
                file_size: Some(80 * 1024 * 1024),
                file_type: "video".into(),
                file_name: None,
                mime_type: None,
            },
            telegram_context: TelegramContext::default(),
            priority: 0,
            max_retries: 3,
        }
    }

    #[tokio::test]
    async fn enqueue_creates_a_pending_job() {
        let queue = InMemoryQueue::default();
        let job_id = queue.enqueue(sample_job()).await.unwrap();
        let job = queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
    }

    #[tokio::test]
    async fn completed_job_cannot_transition_back_to_pending_without_retry() {
        let queue = InMemoryQueue::default();
        let job_id = queue.enqueue(sample_job()).await.unwrap();
        queue.record_state(job_id, JobState::Processing, None).await.unwrap();
        queue.record_state(job_id, JobState::Completed, None).await.unwrap();
        let err = queue.record_state(job_id, JobState::Pending, None).await.unwrap_err();
        assert_eq!(err.code, teltubby_error::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn retry_moves_a_failed_job_back_to_pending() {
        let queue = InMemoryQueue::default();
        let job_id = queue.enqueue(sample_job()).await.unwrap();
        queue.record_state(job_id, JobState::Processing, None).await.unwrap();
        queue.record_state(job_id, JobState::Failed, Some("upload_permanent")).await.unwrap();
        queue.retry(job_id).await.unwrap();
        let job = queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
    }

    #[tokio::test]
    async fn cancel_on_pending_marks_cancelled_immediately() {
        let queue = InMemoryQueue::default();
        let job_id = queue.enqueue(sample_job()).await.unwrap();
        queue.cancel(job_id).await.unwrap();
        assert_eq!(queue.get(job_id).await.unwrap().unwrap().state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn cancel_on_processing_is_only_advisory() {
        let queue = InMemoryQueue::default();
        let job_id = queue.enqueue(sample_job()).await.unwrap();
        queue.record_state(job_id, JobState::Processing, None).await.unwrap();
        queue.cancel(job_id).await.unwrap();
        let job = queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Processing);
        assert!(job.cancellation_requested);
    }
}
