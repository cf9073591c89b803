pub mod jobs;
pub mod renditions;
