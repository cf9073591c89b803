//! Bitrate worker: turns one staged source file into an HLS rendition at a
//! single bitrate.
//!
//! Runs with concurrency 2 per bitrate queue. Every step is idempotent:
//! a rendition that already completed short-circuits, the upsert on
//! (chapter_id, bitrate) reconciles racing workers, and failures surface
//! through the queue's retry policy without touching sibling bitrates.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::BitrateJob;
use crate::queue::{ActiveJob, JobHandler, WorkQueue};
use crate::repo;
use crate::services::streaming::{PLAYLIST_CONTENT_TYPE, SEGMENT_CONTENT_TYPE};
use crate::services::HlsTranscoder;
use crate::storage::ObjectStorage;

pub struct BitrateWorker {
    db: PgPool,
    storage: Arc<dyn ObjectStorage>,
    transcoder: HlsTranscoder,
    /// Scratch root for staged inputs and (for remote storage) encoder
    /// output before upload.
    staging_root: PathBuf,
    /// Full ladder; completing the last missing rung marks the chapter
    /// job row completed.
    configured_bitrates: Vec<u32>,
    development: bool,
}

impl BitrateWorker {
    pub fn new(
        db: PgPool,
        storage: Arc<dyn ObjectStorage>,
        transcoder: HlsTranscoder,
        staging_root: PathBuf,
        configured_bitrates: Vec<u32>,
        development: bool,
    ) -> Self {
        Self {
            db,
            storage,
            transcoder,
            staging_root,
            configured_bitrates,
            development,
        }
    }

    async fn process(&self, job: &BitrateJob, queue: &WorkQueue, queue_job_id: &str) -> Result<()> {
        let chapter_id = &job.chapter_id;
        queue.set_progress(queue_job_id, 10).await?;
        let job_row_id = self.current_job_row(chapter_id).await;
        self.report_db_progress(job_row_id, 10).await;

        // Re-delivery of an already-finished job is a no-op.
        if repo::renditions::get_completed(&self.db, chapter_id, job.bitrate)
            .await?
            .is_some()
        {
            info!(chapter_id = %chapter_id, bitrate = job.bitrate, "Rendition already completed, skipping");
            queue.set_progress(queue_job_id, 100).await?;
            return Ok(());
        }

        let staged_input = self.stage_input(&job.input_path).await?;
        queue.set_progress(queue_job_id, 30).await?;
        self.report_db_progress(job_row_id, 30).await;

        let prefix = job.rendition_prefix();
        // A disk-backed provider lets the encoder write artifacts in place;
        // otherwise encode to scratch and upload afterwards.
        let in_place = self.storage.local_path(&prefix);
        let out_dir = in_place
            .clone()
            .unwrap_or_else(|| self.staging_root.join(&prefix));

        let encode_result = self
            .encode(job, queue, queue_job_id, job_row_id, &staged_input, &out_dir)
            .await;

        // The staged copy is scratch either way.
        self.cleanup_staged(&staged_input).await;

        encode_result?;

        if in_place.is_none() {
            self.upload_artifacts(&out_dir, &prefix).await?;
        }

        let playlist_key = format!("{}/playlist.m3u8", prefix);
        repo::renditions::upsert_completed(
            &self.db,
            chapter_id,
            job.bitrate,
            &self.storage.url(&playlist_key),
            &prefix,
            self.storage.provider(),
        )
        .await?;

        queue.set_progress(queue_job_id, 100).await?;
        self.finish_job_row(chapter_id, job_row_id).await?;

        info!(chapter_id = %chapter_id, bitrate = job.bitrate, "Rendition completed");
        Ok(())
    }

    async fn encode(
        &self,
        job: &BitrateJob,
        queue: &WorkQueue,
        queue_job_id: &str,
        job_row_id: Option<Uuid>,
        staged_input: &Path,
        out_dir: &Path,
    ) -> Result<()> {
        let total_duration_ms = self.transcoder.probe_duration_ms(staged_input).await;

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<u8>();
        let progress_task = {
            let queue = queue.clone();
            let queue_job_id = queue_job_id.to_string();
            let db = self.db.clone();
            tokio::spawn(async move {
                let mut last_db_step = 0u8;
                while let Some(encoder_pct) = progress_rx.recv().await {
                    // Encoder progress occupies the 30..90 band of the job.
                    let job_pct = 30 + (encoder_pct as u16 * 60 / 100) as u8;
                    let _ = queue.set_progress(&queue_job_id, job_pct).await;

                    // Coarse DB updates, one per 10-point step.
                    let step = job_pct / 10;
                    if step > last_db_step {
                        last_db_step = step;
                        if let Some(id) = job_row_id {
                            let _ = repo::jobs::update_progress(&db, id, job_pct as i32).await;
                        }
                    }
                }
            })
        };

        let result = self
            .transcoder
            .transcode_to_hls(
                staged_input,
                out_dir,
                job.bitrate,
                job.segment_duration,
                total_duration_ms,
                progress_tx,
            )
            .await;

        let _ = progress_task.await;
        result
    }

    /// Make the source available on the local disk and return the staged
    /// scratch path the encoder reads from.
    async fn stage_input(&self, input_path: &str) -> Result<PathBuf> {
        let file_name = Path::new(input_path)
            .file_name()
            .ok_or_else(|| AppError::Validation(format!("invalid input path: {}", input_path)))?
            .to_string_lossy()
            .into_owned();
        let temp_dir = self.staging_root.join("temp");
        tokio::fs::create_dir_all(&temp_dir)
            .await
            .map_err(|e| AppError::Storage(format!("create {:?}: {}", temp_dir, e)))?;
        let staged = temp_dir.join(format!(
            "temp_{}_{}",
            Utc::now().timestamp_millis(),
            file_name
        ));

        if self.development {
            // Development mirrors the source next to the provider root so
            // repeated runs skip the download.
            let mirror = self.staging_root.join(input_path);
            if !path_exists(&mirror).await {
                if !self.storage.exists(input_path).await? {
                    return Err(AppError::InputMissing(input_path.to_string()));
                }
                let data = self.storage.download(input_path).await?;
                if let Some(parent) = mirror.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| AppError::Storage(format!("create {:?}: {}", parent, e)))?;
                }
                tokio::fs::write(&mirror, &data)
                    .await
                    .map_err(|e| AppError::Storage(format!("write {:?}: {}", mirror, e)))?;
                debug!("Mirrored source {} to {:?}", input_path, mirror);
            }
            tokio::fs::copy(&mirror, &staged)
                .await
                .map_err(|e| AppError::Storage(format!("stage {:?}: {}", mirror, e)))?;
        } else {
            if !self.storage.exists(input_path).await? {
                return Err(AppError::InputMissing(input_path.to_string()));
            }
            let data = self.storage.download(input_path).await?;
            tokio::fs::write(&staged, &data)
                .await
                .map_err(|e| AppError::Storage(format!("write {:?}: {}", staged, e)))?;
        }

        Ok(staged)
    }

    /// Push encoder output to remote storage with the right MIME types,
    /// then drop the local copies.
    async fn upload_artifacts(&self, out_dir: &Path, prefix: &str) -> Result<()> {
        let mut entries = tokio::fs::read_dir(out_dir)
            .await
            .map_err(|e| AppError::Storage(format!("read {:?}: {}", out_dir, e)))?;

        let mut uploaded = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::Storage(format!("read {:?}: {}", out_dir, e)))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let content_type = if name.ends_with(".m3u8") {
                PLAYLIST_CONTENT_TYPE
            } else if name.ends_with(".ts") {
                SEGMENT_CONTENT_TYPE
            } else {
                continue;
            };

            let data = tokio::fs::read(entry.path())
                .await
                .map_err(|e| AppError::Storage(format!("read {:?}: {}", entry.path(), e)))?;
            self.storage
                .upload(&format!("{}/{}", prefix, name), data.into(), content_type)
                .await?;
            uploaded += 1;
        }

        if let Err(e) = tokio::fs::remove_dir_all(out_dir).await {
            warn!("Failed to clean encoder output {:?}: {}", out_dir, e);
        }
        debug!("Uploaded {} artifacts under {}", uploaded, prefix);
        Ok(())
    }

    async fn cleanup_staged(&self, staged: &Path) {
        if let Err(e) = tokio::fs::remove_file(staged).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove staged input {:?}: {}", staged, e);
            }
        }
        // Drop the temp directory when this was the last staged file.
        let temp_dir = self.staging_root.join("temp");
        let _ = tokio::fs::remove_dir(&temp_dir).await;
    }

    async fn current_job_row(&self, chapter_id: &str) -> Option<Uuid> {
        match repo::jobs::latest_for_chapter(&self.db, chapter_id).await {
            Ok(job) => job.map(|j| j.id),
            Err(e) => {
                warn!(chapter_id = %chapter_id, "Failed to load job row: {}", e);
                None
            }
        }
    }

    async fn report_db_progress(&self, job_row_id: Option<Uuid>, progress: i32) {
        if let Some(id) = job_row_id {
            if let Err(e) = repo::jobs::update_progress(&self.db, id, progress).await {
                warn!("Failed to update job progress: {}", e);
            }
        }
    }

    /// Completing the final rung of the ladder finishes the chapter job.
    async fn finish_job_row(&self, chapter_id: &str, job_row_id: Option<Uuid>) -> Result<()> {
        let completed = repo::renditions::completed_bitrates(&self.db, chapter_id).await?;
        let all_done = self
            .configured_bitrates
            .iter()
            .all(|b| completed.contains(b));
        if all_done {
            if let Some(id) = job_row_id {
                repo::jobs::mark_completed(&self.db, id).await?;
            }
        }
        Ok(())
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[async_trait]
impl JobHandler for BitrateWorker {
    async fn handle(&self, job: &ActiveJob, queue: &WorkQueue) -> Result<()> {
        let bitrate_job: BitrateJob = serde_json::from_str(&job.payload)
            .map_err(|e| AppError::Validation(format!("unparseable bitrate job: {}", e)))?;

        let result = self.process(&bitrate_job, queue, &job.id).await;

        if let Err(e) = &result {
            // The chapter's authoritative row records which bitrate broke.
            let message = format!("{}k: {}", bitrate_job.bitrate, e);
            if let Err(db_err) =
                repo::jobs::fail_latest_for_chapter(&self.db, &bitrate_job.chapter_id, &message)
                    .await
            {
                warn!(
                    chapter_id = %bitrate_job.chapter_id,
                    "Failed to record bitrate failure: {}",
                    db_err
                );
            }
        }

        result
    }
}
