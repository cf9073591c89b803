//! Intake worker: decomposes a chapter transcode request into per-bitrate
//! jobs plus one master-playlist job.
//!
//! Consumes the three priority-routed intake queues. Delivery is
//! at-least-once, so decomposition is idempotent: bitrates that already
//! have a completed rendition are skipped, and a request whose bitrates
//! are all done acks without touching the encoder.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use lapin::options::BasicAckOptions;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::models::{BitrateJob, ChapterTranscodeRequest, MasterJob, Priority};
use crate::queue::{broker::intake_queue_name, Broker, WorkQueue};
use crate::repo;

/// Escalation cap: a message that keeps failing is retried through the low
/// queue at most this many times.
const MAX_INTAKE_RETRIES: u32 = 3;

/// Head start the bitrate pipelines get before master assembly begins
/// polling for completed renditions.
const MASTER_DISPATCH_DELAY_MS: u64 = 5_000;

pub struct IntakeWorker {
    db: PgPool,
    broker: Arc<Broker>,
    bitrate_queues: HashMap<u32, WorkQueue>,
    master_queue: WorkQueue,
    segment_duration: u32,
}

impl IntakeWorker {
    pub fn new(
        db: PgPool,
        broker: Arc<Broker>,
        bitrate_queues: HashMap<u32, WorkQueue>,
        master_queue: WorkQueue,
        segment_duration: u32,
    ) -> Self {
        Self {
            db,
            broker,
            bitrate_queues,
            master_queue,
            segment_duration,
        }
    }

    /// Consume all three intake queues until shutdown. Each queue gets its
    /// own channel so prefetch=1 applies per queue.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut tasks = Vec::new();
        for priority in [Priority::High, Priority::Normal, Priority::Low] {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                worker.consume_queue(priority, shutdown).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn consume_queue(&self, priority: Priority, mut shutdown: watch::Receiver<bool>) {
        let queue = intake_queue_name(priority);
        loop {
            if *shutdown.borrow() {
                break;
            }

            let mut consumer = match self.broker.consumer(&queue, "intake-worker").await {
                Ok(consumer) => consumer,
                Err(e) => {
                    error!("Failed to consume {}: {}; retrying in 5s", queue, e);
                    tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                    continue;
                }
            };
            info!("Intake worker listening on {}", queue);

            loop {
                let delivery = tokio::select! {
                    delivery = consumer.next() => delivery,
                    _ = shutdown.changed() => break,
                };
                let Some(delivery) = delivery else { break };

                match delivery {
                    Ok(delivery) => {
                        let request =
                            match serde_json::from_slice::<ChapterTranscodeRequest>(&delivery.data)
                            {
                                Ok(request) => request,
                                Err(e) => {
                                    // A malformed message will never parse; drop it.
                                    error!("Unparseable intake message on {}: {}", queue, e);
                                    let _ = delivery.ack(BasicAckOptions::default()).await;
                                    continue;
                                }
                            };

                        match self.process(&request).await {
                            Ok(()) => {
                                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                                    error!("Failed to ack intake message: {}", e);
                                }
                            }
                            Err(e) => {
                                self.handle_failure(&request, &e).await;
                                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                                    error!("Failed to ack intake message: {}", e);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Intake consumer error on {}: {}", queue, e);
                        tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
                        break;
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }
            warn!("Intake consumer on {} stopped, reconnecting", queue);
        }
        info!("Intake worker on {} stopped", queue);
    }

    /// Fan a request out into bitrate jobs and a delayed master job.
    async fn process(&self, request: &ChapterTranscodeRequest) -> Result<()> {
        let chapter_id = &request.chapter.id;
        let completed = repo::renditions::completed_bitrates(&self.db, chapter_id).await?;
        let todo = pending_bitrates(&request.bitrates, &completed);

        if todo.is_empty() {
            info!(
                chapter_id = %chapter_id,
                "All requested bitrates already transcoded, nothing to do"
            );
            return Ok(());
        }

        let job_row = repo::jobs::create_processing(&self.db, chapter_id).await?;
        info!(
            chapter_id = %chapter_id,
            job_id = %job_row.id,
            bitrates = ?todo,
            "Dispatching bitrate jobs"
        );

        let now_ms = Utc::now().timestamp_millis();
        let priority = request.priority.numeric();
        let mut dispatched = Vec::new();

        for bitrate in &todo {
            let Some(queue) = self.bitrate_queues.get(bitrate) else {
                warn!(
                    chapter_id = %chapter_id,
                    bitrate,
                    "No work queue for requested bitrate, skipping"
                );
                continue;
            };

            let job = BitrateJob {
                chapter_id: chapter_id.clone(),
                input_path: request.chapter.file_path.clone(),
                output_dir: format!("bit_transcode/{}", chapter_id),
                bitrate: *bitrate,
                segment_duration: self.segment_duration,
                user_id: request.user_id.clone(),
            };
            let payload = serde_json::to_string(&job)
                .map_err(|e| crate::error::AppError::Queue(format!("serialize bitrate job: {}", e)))?;
            queue
                .enqueue(&job.job_id(now_ms), &payload, priority, 0)
                .await?;
            dispatched.push(*bitrate);
        }

        if !dispatched.is_empty() {
            let master = MasterJob {
                chapter_id: chapter_id.clone(),
                output_dir: format!("bit_transcode/{}", chapter_id),
                variant_bitrates: dispatched.clone(),
            };
            let payload = serde_json::to_string(&master)
                .map_err(|e| crate::error::AppError::Queue(format!("serialize master job: {}", e)))?;
            self.master_queue
                .enqueue(
                    &format!("{}-master-{}", chapter_id, now_ms),
                    &payload,
                    priority,
                    MASTER_DISPATCH_DELAY_MS,
                )
                .await?;
        }

        Ok(())
    }

    /// A failed decomposition is escalated once through the low-priority
    /// queue with an incremented retry count; after the cap it is dropped.
    /// Either way the current job row is marked failed so the chapter's
    /// authoritative status reflects the error.
    async fn handle_failure(&self, request: &ChapterTranscodeRequest, error: &crate::error::AppError) {
        let chapter_id = &request.chapter.id;
        let retry_count = request.retry_count.unwrap_or(0);

        if let Err(db_err) = repo::jobs::fail_latest_for_chapter(
            &self.db,
            chapter_id,
            &format!("intake failed: {}", error),
        )
        .await
        {
            error!(chapter_id = %chapter_id, "Failed to record intake failure: {}", db_err);
        }

        if retry_count >= MAX_INTAKE_RETRIES {
            error!(
                chapter_id = %chapter_id,
                retry_count, "Intake retries exhausted, dropping request: {}", error
            );
            return;
        }

        let mut retry = request.clone();
        retry.retry_count = Some(retry_count + 1);
        retry.priority = Priority::Low;
        retry.timestamp = Utc::now();

        match self.broker.publish_transcode_request(&retry).await {
            Ok(()) => warn!(
                chapter_id = %chapter_id,
                retry_count = retry_count + 1,
                "Intake failed ({}), escalated to low-priority queue",
                error
            ),
            Err(publish_err) => error!(
                chapter_id = %chapter_id,
                "Failed to escalate intake request: {} (original error: {})",
                publish_err,
                error
            ),
        }
    }
}

/// Bitrates still missing a completed rendition, in request order.
fn pending_bitrates(requested: &[u32], completed: &[u32]) -> Vec<u32> {
    let mut seen = Vec::new();
    for bitrate in requested {
        if !completed.contains(bitrate) && !seen.contains(bitrate) {
            seen.push(*bitrate);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_is_requested_minus_completed() {
        assert_eq!(pending_bitrates(&[64, 128, 256], &[128]), vec![64, 256]);
    }

    #[test]
    fn pending_is_empty_when_everything_is_done() {
        assert!(pending_bitrates(&[64, 128], &[64, 128, 256]).is_empty());
    }

    #[test]
    fn pending_dedupes_repeated_requests() {
        assert_eq!(pending_bitrates(&[64, 64, 128], &[]), vec![64, 128]);
    }
}
