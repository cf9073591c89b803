use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::middleware::RequireUser;
use crate::api::AppState;
use crate::error::{AppError, Result};
use crate::models::StreamingStatus;
use crate::services::streaming::{PLAYLIST_CONTENT_TYPE, SEGMENT_CONTENT_TYPE};

#[derive(Debug, Deserialize)]
pub struct MasterPlaylistQuery {
    /// Client's measured bandwidth in bits per second.
    pub bandwidth: Option<u64>,
    /// Explicitly preferred variant bitrate in kbps.
    pub bitrate: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PreloadRequest {
    pub bitrate: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyticsQuery {
    #[serde(rename = "chapterId")]
    pub chapter_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PreloadResponse {
    pub chapter_id: String,
    pub bitrate: u32,
    pub status: &'static str,
    pub segments_loaded: u32,
}

pub async fn get_master_playlist(
    State(state): State<Arc<AppState>>,
    RequireUser(_user_id): RequireUser,
    Path(chapter_id): Path<String>,
    Query(query): Query<MasterPlaylistQuery>,
) -> Result<Response> {
    let playlist = state
        .streaming
        .master_playlist(&chapter_id, query.bandwidth, query.bitrate)
        .await?;
    Ok(playlist_response(playlist, 300))
}

pub async fn get_variant_playlist(
    State(state): State<Arc<AppState>>,
    RequireUser(_user_id): RequireUser,
    Path((chapter_id, bitrate)): Path<(String, String)>,
) -> Result<Response> {
    let bitrate = parse_bitrate(&bitrate)?;
    let playlist = state.streaming.variant_playlist(&chapter_id, bitrate).await?;
    Ok(playlist_response(playlist, 60))
}

pub async fn get_segment(
    State(state): State<Arc<AppState>>,
    RequireUser(_user_id): RequireUser,
    Path((chapter_id, bitrate, segment_id)): Path<(String, String, String)>,
) -> Result<Response> {
    let bitrate = parse_bitrate(&bitrate)?;
    let data = state.streaming.segment(&chapter_id, bitrate, &segment_id).await?;

    Ok((
        [
            (header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE.to_string()),
            (header::CACHE_CONTROL, "public, max-age=3600".to_string()),
            (header::ACCEPT_RANGES, "bytes".to_string()),
        ],
        data,
    )
        .into_response())
}

pub async fn get_status(
    State(state): State<Arc<AppState>>,
    RequireUser(_user_id): RequireUser,
    Path(chapter_id): Path<String>,
) -> Result<Json<StreamingStatus>> {
    Ok(Json(state.streaming.status(&chapter_id).await?))
}

pub async fn preload_chapter(
    State(state): State<Arc<AppState>>,
    RequireUser(_user_id): RequireUser,
    Path(chapter_id): Path<String>,
    body: Option<Json<PreloadRequest>>,
) -> Result<Json<PreloadResponse>> {
    let bitrate = body
        .and_then(|Json(req)| req.bitrate)
        .unwrap_or_else(|| state.streaming.default_bitrate());

    let segments_loaded = state.streaming.preload(&chapter_id, bitrate).await?;
    Ok(Json(PreloadResponse {
        chapter_id,
        bitrate,
        status: "preloaded",
        segments_loaded,
    }))
}

pub async fn get_analytics(
    State(state): State<Arc<AppState>>,
    RequireUser(_user_id): RequireUser,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<serde_json::Value>> {
    let cache = state.streaming.analytics();
    Ok(Json(json!({
        "chapter_id": query.chapter_id,
        "cache": cache,
    })))
}

/// Path bitrates come in as `128` from API clients and as `128k` from
/// players resolving relative playlist URIs; accept both.
fn parse_bitrate(raw: &str) -> Result<u32> {
    raw.strip_suffix('k')
        .unwrap_or(raw)
        .parse()
        .map_err(|_| AppError::Validation(format!("Invalid bitrate: {}", raw)))
}

fn playlist_response(playlist: String, max_age: u32) -> Response {
    (
        [
            (header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE.to_string()),
            (
                header::CACHE_CONTROL,
                format!("public, max-age={}", max_age),
            ),
        ],
        playlist,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_param_accepts_plain_and_k_suffixed() {
        assert_eq!(parse_bitrate("128").unwrap(), 128);
        assert_eq!(parse_bitrate("128k").unwrap(), 128);
    }

    #[test]
    fn bitrate_param_rejects_garbage() {
        assert!(matches!(parse_bitrate("fast"), Err(AppError::Validation(_))));
        assert!(matches!(parse_bitrate(""), Err(AppError::Validation(_))));
    }
}
