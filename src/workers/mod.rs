pub mod bitrate;
pub mod deletion;
pub mod intake;
pub mod master;

pub use bitrate::BitrateWorker;
pub use deletion::DeletionWorker;
pub use intake::IntakeWorker;
pub use master::MasterWorker;

/// Consumers per bitrate queue; encoding is CPU/IO bound.
pub const BITRATE_CONCURRENCY: usize = 2;
/// The master fan-in runs strictly serialized.
pub const MASTER_CONCURRENCY: usize = 1;
