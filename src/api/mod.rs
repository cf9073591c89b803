pub mod health;
pub mod middleware;
pub mod streaming;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::PgPool;

use crate::queue::Broker;
use crate::services::{StreamCache, StreamingService};
use crate::storage::ObjectStorage;

pub struct AppState {
    pub db: PgPool,
    pub streaming: Arc<StreamingService>,
    pub cache: Arc<StreamCache>,
    pub storage: Arc<dyn ObjectStorage>,
    pub broker: Arc<Broker>,
}

/// Streaming read-path routes, mounted under `/api/v1/stream`.
pub fn stream_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/chapters/:chapter_id/master.m3u8",
            get(streaming::get_master_playlist),
        )
        .route(
            "/chapters/:chapter_id/:bitrate/playlist.m3u8",
            get(streaming::get_variant_playlist),
        )
        .route(
            "/chapters/:chapter_id/:bitrate/segments/:segment_id",
            get(streaming::get_segment),
        )
        .route("/chapters/:chapter_id/status", get(streaming::get_status))
        .route("/chapters/:chapter_id/preload", post(streaming::preload_chapter))
        .route("/analytics", get(streaming::get_analytics))
        .route("/health", get(health::health))
}
