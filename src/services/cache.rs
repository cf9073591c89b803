//! Redis cache fronting object storage on the streaming read path.
//!
//! Cache failures are never fatal: every error is counted, logged and the
//! caller falls through to storage. Each cached value carries a `{key}:meta`
//! sidecar describing the payload for debugging and analytics tooling.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::Utc;
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::Serialize;
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
}

/// Per-process cache analytics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CacheAnalytics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub errors: u64,
    pub hit_rate: f64,
}

pub struct StreamCache {
    redis: ConnectionManager,
    ttl_secs: u64,
    counters: CacheCounters,
}

impl StreamCache {
    pub fn new(redis: ConnectionManager, ttl_secs: u64) -> Self {
        Self {
            redis,
            ttl_secs,
            counters: CacheCounters::default(),
        }
    }

    pub fn playlist_key(chapter_id: &str, variant: &str) -> String {
        format!("stream:playlist:{}:{}", chapter_id, variant)
    }

    pub fn segment_key(segment_id: &str) -> String {
        format!("stream:segment:{}", segment_id)
    }

    /// Canonical segment id: `{chapter_id}_{bitrate}_{NNN}`.
    pub fn segment_id(chapter_id: &str, bitrate: u32, index: u32) -> String {
        format!("{}_{}_{:03}", chapter_id, bitrate, index)
    }

    /// Derive the canonical segment id from a playlist file name like
    /// `segment_007.ts`. Falls back to the raw name when it doesn't match.
    pub fn segment_id_from_name(chapter_id: &str, bitrate: u32, file_name: &str) -> String {
        segment_index(file_name)
            .map(|idx| Self::segment_id(chapter_id, bitrate, idx))
            .unwrap_or_else(|| format!("{}_{}_{}", chapter_id, bitrate, file_name))
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let mut conn = self.redis.clone();
        match conn.get::<_, Option<Vec<u8>>>(key).await {
            Ok(Some(data)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(Bytes::from(data))
            }
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!("Cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    pub async fn put(&self, key: &str, data: &Bytes, content_type: &str) {
        let mut conn = self.redis.clone();
        let ttl = self.ttl_secs;

        if let Err(e) = conn.set_ex::<_, _, ()>(key, data.as_ref(), ttl).await {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!("Cache write failed for {}: {}", key, e);
            return;
        }

        let meta = serde_json::json!({
            "content_type": content_type,
            "size": data.len(),
            "cached_at": Utc::now().to_rfc3339(),
            "ttl": self.ttl_secs,
        });
        if let Err(e) = conn
            .set_ex::<_, _, ()>(format!("{}:meta", key), meta.to_string(), ttl)
            .await
        {
            warn!("Cache meta write failed for {}: {}", key, e);
        }

        self.counters.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(&[key.to_string(), format!("{}:meta", key)]).await?;
        Ok(())
    }

    /// Drop every cached playlist and segment for a chapter.
    pub async fn purge_chapter(&self, chapter_id: &str, bitrates: &[u32]) -> Result<u64> {
        let mut purged = 0;

        self.delete(&Self::playlist_key(chapter_id, "master")).await?;
        purged += 1;
        for bitrate in bitrates {
            self.delete(&Self::playlist_key(chapter_id, &bitrate.to_string()))
                .await?;
            purged += 1;
        }

        // Segment keys are discovered by pattern; SCAN keeps Redis happy
        // even with large keyspaces.
        let pattern = format!("stream:segment:{}_*", chapter_id);
        let mut scan_conn = self.redis.clone();
        let keys: Vec<String> = {
            let mut iter = scan_conn.scan_match::<_, String>(&pattern).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        let mut conn = self.redis.clone();
        for key in keys {
            conn.del::<_, ()>(&[key.clone(), format!("{}:meta", key)]).await?;
            purged += 1;
        }
        Ok(purged)
    }

    pub fn analytics(&self) -> CacheAnalytics {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheAnalytics {
            hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    /// Connectivity probe for the health endpoint.
    pub async fn probe(&self) -> Result<()> {
        let mut conn = self.redis.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

/// Parse the numeric index out of `segment_NNN.ts`.
fn segment_index(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix("segment_")?
        .strip_suffix(".ts")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_keys_follow_the_wire_format() {
        assert_eq!(
            StreamCache::playlist_key("ch-1", "master"),
            "stream:playlist:ch-1:master"
        );
        assert_eq!(
            StreamCache::playlist_key("ch-1", "128"),
            "stream:playlist:ch-1:128"
        );
        assert_eq!(
            StreamCache::segment_key("ch-1_128_004"),
            "stream:segment:ch-1_128_004"
        );
    }

    #[test]
    fn segment_ids_are_zero_padded() {
        assert_eq!(StreamCache::segment_id("ch-1", 128, 4), "ch-1_128_004");
        assert_eq!(StreamCache::segment_id("ch-1", 64, 123), "ch-1_64_123");
    }

    #[test]
    fn segment_id_derives_from_playlist_file_name() {
        assert_eq!(
            StreamCache::segment_id_from_name("ch-1", 128, "segment_007.ts"),
            "ch-1_128_007"
        );
        // Unrecognized names stay addressable, just not canonical.
        assert_eq!(
            StreamCache::segment_id_from_name("ch-1", 128, "intro.ts"),
            "ch-1_128_intro.ts"
        );
    }

    #[test]
    fn segment_index_rejects_foreign_names() {
        assert_eq!(segment_index("segment_012.ts"), Some(12));
        assert_eq!(segment_index("segment_abc.ts"), None);
        assert_eq!(segment_index("clip_000.ts"), None);
    }
}
