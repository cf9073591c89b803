use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[sqlx(rename = "pending")]
    Pending,
    #[sqlx(rename = "processing")]
    Processing,
    #[sqlx(rename = "completed")]
    Completed,
    #[sqlx(rename = "failed")]
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Bookkeeping row for one pass over a chapter. A chapter may accumulate
/// several rows across re-submissions; the newest by `created_at` wins.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TranscodingJob {
    pub id: Uuid,
    pub chapter_id: String,
    pub status: JobStatus,
    pub progress: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Unit of work on a `transcode:{bitrate}k` queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitrateJob {
    pub chapter_id: String,
    pub input_path: String,
    /// Storage key prefix the rendition lands under, e.g. `bit_transcode/{id}`.
    pub output_dir: String,
    pub bitrate: u32,
    pub segment_duration: u32,
    pub user_id: Option<String>,
}

impl BitrateJob {
    /// Deduplicating queue job id.
    pub fn job_id(&self, enqueued_at_ms: i64) -> String {
        format!("{}-{}k-{}", self.chapter_id, self.bitrate, enqueued_at_ms)
    }

    /// Storage key prefix for this rendition's playlist and segments.
    pub fn rendition_prefix(&self) -> String {
        format!("{}/{}k", self.output_dir, self.bitrate)
    }
}

/// Fan-in step: assemble the master playlist once at least one of the
/// variant renditions has completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterJob {
    pub chapter_id: String,
    pub output_dir: String,
    pub variant_bitrates: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_job_id_embeds_chapter_bitrate_and_timestamp() {
        let job = BitrateJob {
            chapter_id: "ch-9".to_string(),
            input_path: "audiobooks/bk/ch-9.mp3".to_string(),
            output_dir: "bit_transcode/ch-9".to_string(),
            bitrate: 128,
            segment_duration: 10,
            user_id: None,
        };
        assert_eq!(job.job_id(1700000000000), "ch-9-128k-1700000000000");
        assert_eq!(job.rendition_prefix(), "bit_transcode/ch-9/128k");
    }
}
