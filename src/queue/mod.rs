pub mod broker;
pub mod work_queue;

pub use broker::Broker;
pub use work_queue::{ActiveJob, JobHandler, WorkQueue};

/// Work-queue name for one bitrate pipeline, e.g. `transcode:128k`.
pub fn bitrate_queue_name(bitrate: u32) -> String {
    format!("transcode:{}k", bitrate)
}

/// Work-queue name for the master-playlist fan-in step.
pub const MASTER_QUEUE: &str = "transcode:master";
