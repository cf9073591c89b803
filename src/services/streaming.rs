//! Streaming read path: master/variant playlists, segments, status and
//! preload. Reads go cache -> object storage, with rendition availability
//! checked against the database of record.

use std::sync::Arc;

use bytes::Bytes;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::models::{StreamingStatus, TranscodedChapter};
use crate::repo;
use crate::services::cache::{CacheAnalytics, StreamCache};
use crate::services::hls;
use crate::storage::ObjectStorage;

pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
pub const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

/// Upper bound on segments pushed into the cache per preload request.
const PRELOAD_SEGMENT_LIMIT: usize = 10;

pub struct StreamingService {
    db: PgPool,
    cache: Arc<StreamCache>,
    storage: Arc<dyn ObjectStorage>,
    configured_bitrates: Vec<u32>,
    segment_duration: u32,
}

impl StreamingService {
    pub fn new(
        db: PgPool,
        cache: Arc<StreamCache>,
        storage: Arc<dyn ObjectStorage>,
        configured_bitrates: Vec<u32>,
        segment_duration: u32,
    ) -> Self {
        Self {
            db,
            cache,
            storage,
            configured_bitrates,
            segment_duration,
        }
    }

    /// On-the-fly master playlist for a chapter, annotated with the
    /// recommended variant. 404 when no rendition has completed.
    pub async fn master_playlist(
        &self,
        chapter_id: &str,
        client_bandwidth: Option<u64>,
        preferred_bitrate: Option<u32>,
    ) -> Result<String> {
        let cache_key = StreamCache::playlist_key(chapter_id, "master");
        if let Some(cached) = self.cache.get(&cache_key).await {
            return Ok(String::from_utf8_lossy(&cached).into_owned());
        }

        let available = repo::renditions::completed_bitrates(&self.db, chapter_id).await?;
        if available.is_empty() {
            return Err(AppError::NotFound(format!(
                "No renditions available for chapter {}",
                chapter_id
            )));
        }

        let recommended = hls::select_recommended(&available, preferred_bitrate, client_bandwidth);
        let playlist = hls::master_playlist(&available, Some(recommended));

        self.cache
            .put(&cache_key, &Bytes::from(playlist.clone()), PLAYLIST_CONTENT_TYPE)
            .await;
        debug!(chapter_id, recommended, "Generated master playlist");
        Ok(playlist)
    }

    /// Variant playlist for one completed rendition, regenerated from the
    /// storage listing on cache miss.
    pub async fn variant_playlist(&self, chapter_id: &str, bitrate: u32) -> Result<String> {
        let rendition = self.require_completed(chapter_id, bitrate).await?;

        let cache_key = StreamCache::playlist_key(chapter_id, &bitrate.to_string());
        if let Some(cached) = self.cache.get(&cache_key).await {
            return Ok(String::from_utf8_lossy(&cached).into_owned());
        }

        let segments = self.segment_names(&rendition).await?;
        if segments.is_empty() {
            return Err(AppError::NotFound(format!(
                "No segments in storage for chapter {} at {}k",
                chapter_id, bitrate
            )));
        }

        let playlist = hls::variant_playlist(&segments, self.segment_duration);
        self.cache
            .put(&cache_key, &Bytes::from(playlist.clone()), PLAYLIST_CONTENT_TYPE)
            .await;
        Ok(playlist)
    }

    /// One MPEG-TS segment, cache-through.
    pub async fn segment(
        &self,
        chapter_id: &str,
        bitrate: u32,
        segment_name: &str,
    ) -> Result<Bytes> {
        if segment_name.contains('/') || segment_name.contains("..") {
            return Err(AppError::Validation(format!(
                "invalid segment name: {}",
                segment_name
            )));
        }
        let rendition = self.require_completed(chapter_id, bitrate).await?;

        let segment_id = StreamCache::segment_id_from_name(chapter_id, bitrate, segment_name);
        let cache_key = StreamCache::segment_key(&segment_id);
        if let Some(cached) = self.cache.get(&cache_key).await {
            return Ok(cached);
        }

        let storage_key = format!("{}/{}", rendition.segments_path, segment_name);
        let data = self.storage.download(&storage_key).await?;
        self.cache.put(&cache_key, &data, SEGMENT_CONTENT_TYPE).await;
        Ok(data)
    }

    pub async fn status(&self, chapter_id: &str) -> Result<StreamingStatus> {
        let available = repo::renditions::completed_bitrates(&self.db, chapter_id).await?;
        let latest_job = repo::jobs::latest_for_chapter(&self.db, chapter_id).await?;
        Ok(StreamingStatus::derive(
            chapter_id,
            &available,
            &self.configured_bitrates,
            latest_job.map(|j| j.status),
        ))
    }

    /// Warm the cache with the first segments of a rendition. Returns how
    /// many were loaded; repeating the call re-caches the same keys with
    /// the same bytes.
    pub async fn preload(&self, chapter_id: &str, bitrate: u32) -> Result<u32> {
        let rendition = self.require_completed(chapter_id, bitrate).await?;
        let segments = self.segment_names(&rendition).await?;

        let mut loaded = 0;
        for name in segments.iter().take(PRELOAD_SEGMENT_LIMIT) {
            let storage_key = format!("{}/{}", rendition.segments_path, name);
            let data = self.storage.download(&storage_key).await?;
            let segment_id = StreamCache::segment_id_from_name(chapter_id, bitrate, name);
            self.cache
                .put(&StreamCache::segment_key(&segment_id), &data, SEGMENT_CONTENT_TYPE)
                .await;
            loaded += 1;
        }

        info!(chapter_id, bitrate, loaded, "Preloaded chapter segments");
        Ok(loaded)
    }

    pub fn analytics(&self) -> CacheAnalytics {
        self.cache.analytics()
    }

    pub fn default_bitrate(&self) -> u32 {
        let ladder = &self.configured_bitrates;
        if ladder.contains(&128) {
            128
        } else {
            ladder.get(ladder.len() / 2).copied().unwrap_or(128)
        }
    }

    async fn require_completed(&self, chapter_id: &str, bitrate: u32) -> Result<TranscodedChapter> {
        repo::renditions::get_completed(&self.db, chapter_id, bitrate)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Chapter {} has no completed {}k rendition",
                    chapter_id, bitrate
                ))
            })
    }

    /// Sorted `segment_*.ts` names under the rendition's storage prefix.
    async fn segment_names(&self, rendition: &TranscodedChapter) -> Result<Vec<String>> {
        let keys = self.storage.list(&rendition.segments_path).await?;
        let prefix = format!("{}/", rendition.segments_path);
        let mut names: Vec<String> = keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(|s| s.to_string()))
            .filter(|name| name.starts_with("segment_") && name.ends_with(".ts"))
            .collect();
        names.sort();
        Ok(names)
    }
}
