use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse scheduling class carried by intake messages. Maps to both a
/// routing key on the intake exchange and a numeric broker priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn routing_key(&self) -> &'static str {
        match self {
            Priority::High => "priority",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    pub fn numeric(&self) -> u8 {
        match self {
            Priority::High => 10,
            Priority::Normal => 5,
            Priority::Low => 1,
        }
    }
}

/// Chapter descriptor as published by the ingestion service. Opaque to this
/// system apart from `id`, `file_path` and `duration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterMetadata {
    pub id: String,
    pub audiobook_id: String,
    pub title: String,
    pub description: Option<String>,
    pub chapter_number: i32,
    /// Duration in seconds.
    pub duration: f64,
    pub file_path: String,
    pub file_size: i64,
    pub start_position: f64,
    pub end_position: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Intake message consumed from the transcoding exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterTranscodeRequest {
    pub chapter: ChapterMetadata,
    pub bitrates: Vec<u32>,
    pub priority: Priority,
    pub user_id: Option<String>,
    pub retry_count: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl ChapterTranscodeRequest {
    pub fn message_id(&self) -> String {
        format!("{}-{}", self.chapter.id, self.timestamp.timestamp_millis())
    }
}

/// Published on `audiobook.chapters.deleted` when a chapter is removed
/// upstream; triggers the full purge of renditions, artifacts and cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterDeletion {
    pub chapter_id: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_maps_to_broker_numeric() {
        assert_eq!(Priority::High.numeric(), 10);
        assert_eq!(Priority::Normal.numeric(), 5);
        assert_eq!(Priority::Low.numeric(), 1);
    }

    #[test]
    fn deserializes_intake_message_without_optional_fields() {
        let raw = r#"{
            "chapter": {
                "id": "ch-1",
                "audiobook_id": "bk-1",
                "title": "Chapter One",
                "chapter_number": 1,
                "duration": 60.5,
                "file_path": "audiobooks/bk-1/ch-1.mp3",
                "file_size": 1048576,
                "start_position": 0.0,
                "end_position": 60.5,
                "created_at": "2024-01-01T00:00:00Z",
                "updated_at": "2024-01-01T00:00:00Z"
            },
            "bitrates": [64, 128],
            "priority": "high",
            "timestamp": "2024-01-02T03:04:05Z"
        }"#;

        let req: ChapterTranscodeRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.chapter.id, "ch-1");
        assert_eq!(req.bitrates, vec![64, 128]);
        assert_eq!(req.priority, Priority::High);
        assert!(req.user_id.is_none());
        assert!(req.retry_count.is_none());
        assert_eq!(req.message_id(), format!("ch-1-{}", req.timestamp.timestamp_millis()));
    }
}
