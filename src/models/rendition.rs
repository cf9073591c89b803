use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::JobStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum RenditionStatus {
    #[sqlx(rename = "processing")]
    Processing,
    #[sqlx(rename = "completed")]
    Completed,
    #[sqlx(rename = "failed")]
    Failed,
}

/// A completed (or in-flight) bitrate version of a chapter. Unique per
/// `(chapter_id, bitrate)`; `Completed` implies the playlist and all
/// segments exist in object storage.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TranscodedChapter {
    pub id: Uuid,
    pub chapter_id: String,
    pub bitrate: i32,
    pub playlist_url: String,
    pub segments_path: String,
    pub storage_provider: String,
    pub status: RenditionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeState {
    Pending,
    Processing,
    Completed,
    Partial,
    Failed,
    NotStarted,
}

/// Read-path status report for a chapter.
#[derive(Debug, Clone, Serialize)]
pub struct StreamingStatus {
    pub chapter_id: String,
    pub available_bitrates: Vec<u32>,
    pub transcoding_status: TranscodeState,
    pub can_stream: bool,
    /// Bandwidth (bits/s) needed for the highest available rendition.
    pub estimated_bandwidth: u64,
}

impl StreamingStatus {
    /// Derive the chapter-level state from completed renditions and the
    /// latest job row. A strict subset of the configured ladder reports
    /// `partial`; otherwise the job row is authoritative.
    pub fn derive(
        chapter_id: &str,
        available: &[u32],
        configured: &[u32],
        latest_job: Option<JobStatus>,
    ) -> Self {
        let all_done = !configured.is_empty()
            && configured.iter().all(|b| available.contains(b));
        let transcoding_status = if !available.is_empty() && !all_done {
            TranscodeState::Partial
        } else {
            match latest_job {
                Some(JobStatus::Pending) => TranscodeState::Pending,
                Some(JobStatus::Processing) => TranscodeState::Processing,
                Some(JobStatus::Completed) => TranscodeState::Completed,
                Some(JobStatus::Failed) => TranscodeState::Failed,
                None => TranscodeState::NotStarted,
            }
        };

        StreamingStatus {
            chapter_id: chapter_id.to_string(),
            available_bitrates: available.to_vec(),
            transcoding_status,
            can_stream: !available.is_empty(),
            estimated_bandwidth: available.iter().max().map(|b| *b as u64 * 1000).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LADDER: &[u32] = &[64, 128, 256];

    #[test]
    fn no_renditions_and_no_job_is_not_started() {
        let status = StreamingStatus::derive("c", &[], LADDER, None);
        assert_eq!(status.transcoding_status, TranscodeState::NotStarted);
        assert!(!status.can_stream);
        assert_eq!(status.estimated_bandwidth, 0);
    }

    #[test]
    fn subset_of_ladder_is_partial() {
        let status =
            StreamingStatus::derive("c", &[64, 256], LADDER, Some(JobStatus::Failed));
        assert_eq!(status.transcoding_status, TranscodeState::Partial);
        assert!(status.can_stream);
        assert_eq!(status.estimated_bandwidth, 256_000);
    }

    #[test]
    fn full_ladder_follows_job_row() {
        let status =
            StreamingStatus::derive("c", &[64, 128, 256], LADDER, Some(JobStatus::Completed));
        assert_eq!(status.transcoding_status, TranscodeState::Completed);
    }

    #[test]
    fn no_renditions_follows_job_row() {
        let status = StreamingStatus::derive("c", &[], LADDER, Some(JobStatus::Processing));
        assert_eq!(status.transcoding_status, TranscodeState::Processing);
        assert!(!status.can_stream);
    }
}
