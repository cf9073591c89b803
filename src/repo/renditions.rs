use sqlx::PgPool;

use crate::error::Result;
use crate::models::TranscodedChapter;

/// Bitrates with a completed rendition, ascending.
pub async fn completed_bitrates(pool: &PgPool, chapter_id: &str) -> Result<Vec<u32>> {
    let rows: Vec<(i32,)> = sqlx::query_as(
        "SELECT bitrate FROM transcoded_chapters
         WHERE chapter_id = $1 AND status = 'completed'
         ORDER BY bitrate ASC",
    )
    .bind(chapter_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(b,)| b as u32).collect())
}

pub async fn get(
    pool: &PgPool,
    chapter_id: &str,
    bitrate: u32,
) -> Result<Option<TranscodedChapter>> {
    let rendition = sqlx::query_as::<_, TranscodedChapter>(
        "SELECT * FROM transcoded_chapters WHERE chapter_id = $1 AND bitrate = $2",
    )
    .bind(chapter_id)
    .bind(bitrate as i32)
    .fetch_optional(pool)
    .await?;
    Ok(rendition)
}

pub async fn get_completed(
    pool: &PgPool,
    chapter_id: &str,
    bitrate: u32,
) -> Result<Option<TranscodedChapter>> {
    let rendition = sqlx::query_as::<_, TranscodedChapter>(
        "SELECT * FROM transcoded_chapters
         WHERE chapter_id = $1 AND bitrate = $2 AND status = 'completed'",
    )
    .bind(chapter_id)
    .bind(bitrate as i32)
    .fetch_optional(pool)
    .await?;
    Ok(rendition)
}

/// Completed renditions for a chapter, ascending by bitrate.
pub async fn completed_for_chapter(
    pool: &PgPool,
    chapter_id: &str,
) -> Result<Vec<TranscodedChapter>> {
    let renditions = sqlx::query_as::<_, TranscodedChapter>(
        "SELECT * FROM transcoded_chapters
         WHERE chapter_id = $1 AND status = 'completed'
         ORDER BY bitrate ASC",
    )
    .bind(chapter_id)
    .fetch_all(pool)
    .await?;
    Ok(renditions)
}

/// Record a completed rendition. The unique (chapter_id, bitrate) key makes
/// racing workers converge: last writer wins on the mutable fields.
pub async fn upsert_completed(
    pool: &PgPool,
    chapter_id: &str,
    bitrate: u32,
    playlist_url: &str,
    segments_path: &str,
    storage_provider: &str,
) -> Result<TranscodedChapter> {
    let rendition = sqlx::query_as::<_, TranscodedChapter>(
        "INSERT INTO transcoded_chapters
             (chapter_id, bitrate, playlist_url, segments_path, storage_provider, status)
         VALUES ($1, $2, $3, $4, $5, 'completed')
         ON CONFLICT (chapter_id, bitrate) DO UPDATE SET
             playlist_url = EXCLUDED.playlist_url,
             segments_path = EXCLUDED.segments_path,
             storage_provider = EXCLUDED.storage_provider,
             status = 'completed',
             updated_at = NOW()
         RETURNING *",
    )
    .bind(chapter_id)
    .bind(bitrate as i32)
    .bind(playlist_url)
    .bind(segments_path)
    .bind(storage_provider)
    .fetch_one(pool)
    .await?;
    Ok(rendition)
}

/// Every bitrate with a rendition row, regardless of status.
pub async fn bitrates_for_chapter(pool: &PgPool, chapter_id: &str) -> Result<Vec<u32>> {
    let rows: Vec<(i32,)> = sqlx::query_as(
        "SELECT bitrate FROM transcoded_chapters WHERE chapter_id = $1 ORDER BY bitrate ASC",
    )
    .bind(chapter_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(b,)| b as u32).collect())
}

/// Drop all rendition rows for a chapter. Returns the number removed.
pub async fn delete_for_chapter(pool: &PgPool, chapter_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM transcoded_chapters WHERE chapter_id = $1")
        .bind(chapter_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
