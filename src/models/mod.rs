pub mod chapter;
pub mod job;
pub mod rendition;

pub use chapter::{ChapterDeletion, ChapterMetadata, ChapterTranscodeRequest, Priority};
pub use job::{BitrateJob, JobStatus, MasterJob, TranscodingJob};
pub use rendition::{RenditionStatus, StreamingStatus, TranscodeState, TranscodedChapter};
