//! Master worker: the fan-in step. Waits for the first completed variant
//! rendition, then writes the chapter's master playlist.
//!
//! Partial success is deliberate: a chapter with one finished bitrate is
//! streamable, and the read path regenerates richer master playlists as
//! further renditions land.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::models::MasterJob;
use crate::queue::{ActiveJob, JobHandler, WorkQueue};
use crate::repo;
use crate::services::hls;
use crate::services::streaming::PLAYLIST_CONTENT_TYPE;
use crate::storage::ObjectStorage;

const POLL_INTERVAL_SECS: u64 = 5;
const POLL_DEADLINE_SECS: u64 = 30 * 60;

pub struct MasterWorker {
    db: PgPool,
    storage: Arc<dyn ObjectStorage>,
}

impl MasterWorker {
    pub fn new(db: PgPool, storage: Arc<dyn ObjectStorage>) -> Self {
        Self { db, storage }
    }

    /// Poll until at least one of the variant bitrates completes, bounded
    /// by the deadline. Returns the completed subset, ascending.
    async fn await_renditions(&self, job: &MasterJob) -> Result<Vec<u32>> {
        let deadline = tokio::time::Instant::now()
            + tokio::time::Duration::from_secs(POLL_DEADLINE_SECS);

        loop {
            let completed = repo::renditions::completed_bitrates(&self.db, &job.chapter_id).await?;
            let ready: Vec<u32> = completed
                .into_iter()
                .filter(|b| job.variant_bitrates.contains(b))
                .collect();
            if !ready.is_empty() {
                return Ok(ready);
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(AppError::Deadline(format!(
                    "no rendition completed for chapter {} within {}s",
                    job.chapter_id, POLL_DEADLINE_SECS
                )));
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(POLL_INTERVAL_SECS)).await;
        }
    }
}

#[async_trait]
impl JobHandler for MasterWorker {
    async fn handle(&self, job: &ActiveJob, queue: &WorkQueue) -> Result<()> {
        let master_job: MasterJob = serde_json::from_str(&job.payload)
            .map_err(|e| AppError::Validation(format!("unparseable master job: {}", e)))?;

        queue.set_progress(&job.id, 10).await?;
        let ready = self.await_renditions(&master_job).await?;
        queue.set_progress(&job.id, 30).await?;

        if ready.len() < master_job.variant_bitrates.len() {
            warn!(
                chapter_id = %master_job.chapter_id,
                ready = ?ready,
                requested = ?master_job.variant_bitrates,
                "Writing partial master playlist"
            );
        }

        let playlist = hls::master_playlist(&ready, None);
        let key = format!("{}/master.m3u8", master_job.output_dir);
        self.storage
            .upload(&key, playlist.into(), PLAYLIST_CONTENT_TYPE)
            .await?;

        queue.set_progress(&job.id, 100).await?;
        info!(
            chapter_id = %master_job.chapter_id,
            variants = ?ready,
            "Master playlist written"
        );
        Ok(())
    }
}
