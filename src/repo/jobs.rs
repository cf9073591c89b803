use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{JobStatus, TranscodingJob};

/// Insert a fresh job row for an intake pass, already in `processing`.
pub async fn create_processing(pool: &PgPool, chapter_id: &str) -> Result<TranscodingJob> {
    let job = sqlx::query_as::<_, TranscodingJob>(
        "INSERT INTO transcoding_jobs (chapter_id, status, progress, started_at)
         VALUES ($1, 'processing', 0, NOW())
         RETURNING *",
    )
    .bind(chapter_id)
    .fetch_one(pool)
    .await?;
    Ok(job)
}

pub async fn update_progress(pool: &PgPool, id: Uuid, progress: i32) -> Result<()> {
    sqlx::query(
        "UPDATE transcoding_jobs
         SET progress = $2, updated_at = NOW()
         WHERE id = $1",
    )
    .bind(id)
    .bind(progress.clamp(0, 100))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_completed(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE transcoding_jobs
         SET status = 'completed', progress = 100, completed_at = NOW(), updated_at = NOW()
         WHERE id = $1",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_failed(pool: &PgPool, id: Uuid, error_message: &str) -> Result<()> {
    sqlx::query(
        "UPDATE transcoding_jobs
         SET status = 'failed', completed_at = NOW(), error_message = $2, updated_at = NOW()
         WHERE id = $1",
    )
    .bind(id)
    .bind(error_message)
    .execute(pool)
    .await?;
    Ok(())
}

/// The authoritative row for a chapter: newest by `created_at`.
pub async fn latest_for_chapter(pool: &PgPool, chapter_id: &str) -> Result<Option<TranscodingJob>> {
    let job = sqlx::query_as::<_, TranscodingJob>(
        "SELECT * FROM transcoding_jobs
         WHERE chapter_id = $1
         ORDER BY created_at DESC
         LIMIT 1",
    )
    .bind(chapter_id)
    .fetch_optional(pool)
    .await?;
    Ok(job)
}

/// Mark the latest job row for a chapter as failed, if one exists.
pub async fn fail_latest_for_chapter(
    pool: &PgPool,
    chapter_id: &str,
    error_message: &str,
) -> Result<()> {
    if let Some(job) = latest_for_chapter(pool, chapter_id).await? {
        if job.status != JobStatus::Completed {
            mark_failed(pool, job.id, error_message).await?;
        }
    }
    Ok(())
}
