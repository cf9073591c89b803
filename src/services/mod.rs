pub mod cache;
pub mod hls;
pub mod streaming;
pub mod transcoder;

pub use cache::StreamCache;
pub use streaming::StreamingService;
pub use transcoder::HlsTranscoder;
