//! Pluggable object storage.
//!
//! All HLS artifacts and source files live behind the [`ObjectStorage`]
//! trait so workers and the read path never care whether bytes sit on a
//! local disk or in an S3 bucket. The provider is selected once at startup
//! from `STORAGE_PROVIDER`.

pub mod local;
pub mod s3;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ObjectMetadata {
    pub size: u64,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Provider name recorded on rendition rows ("local" or "s3").
    fn provider(&self) -> &'static str;

    async fn upload(&self, key: &str, data: Bytes, content_type: &str) -> Result<()>;

    async fn download(&self, key: &str) -> Result<Bytes>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// All keys under a prefix, sorted lexicographically.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn metadata(&self, key: &str) -> Result<ObjectMetadata>;

    async fn copy(&self, from: &str, to: &str) -> Result<()>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Public URL for a key.
    fn url(&self, key: &str) -> String;

    /// Filesystem path for a key when the provider is disk-backed. Lets the
    /// encoder write artifacts in place instead of a staged upload.
    fn local_path(&self, _key: &str) -> Option<PathBuf> {
        None
    }

    /// Connectivity probe for the health endpoint.
    async fn probe(&self) -> Result<()>;

    /// Remove every object under a prefix. Returns the number deleted.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let keys = self.list(prefix).await?;
        let mut deleted = 0;
        for key in keys {
            self.delete(&key).await?;
            deleted += 1;
        }
        Ok(deleted)
    }
}

/// Build the configured provider.
pub async fn from_config(config: &Config) -> Result<Arc<dyn ObjectStorage>> {
    match config.storage_provider.as_str() {
        "s3" => Ok(Arc::new(s3::S3Storage::from_config(config).await?)),
        _ => Ok(Arc::new(local::LocalStorage::new(
            config.storage_local_path.clone(),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Flat keyspace with literal string-prefix listing, the way an S3
    /// bucket matches `list_objects_v2` prefixes (no directory boundaries).
    struct FlatKeyStorage {
        objects: Mutex<BTreeMap<String, Bytes>>,
    }

    impl FlatKeyStorage {
        fn new() -> Self {
            Self {
                objects: Mutex::new(BTreeMap::new()),
            }
        }
    }

    #[async_trait]
    impl ObjectStorage for FlatKeyStorage {
        fn provider(&self) -> &'static str {
            "flat"
        }

        async fn upload(&self, key: &str, data: Bytes, _content_type: &str) -> Result<()> {
            self.objects.lock().unwrap().insert(key.to_string(), data);
            Ok(())
        }

        async fn download(&self, key: &str) -> Result<Bytes> {
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| AppError::NotFound(format!("object not found: {}", key)))
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }

        async fn exists(&self, key: &str) -> Result<bool> {
            Ok(self.objects.lock().unwrap().contains_key(key))
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }

        async fn metadata(&self, key: &str) -> Result<ObjectMetadata> {
            let data = self.download(key).await?;
            Ok(ObjectMetadata {
                size: data.len() as u64,
                content_type: None,
                last_modified: None,
            })
        }

        async fn copy(&self, from: &str, to: &str) -> Result<()> {
            let data = self.download(from).await?;
            self.upload(to, data, "").await
        }

        async fn rename(&self, from: &str, to: &str) -> Result<()> {
            self.copy(from, to).await?;
            self.delete(from).await
        }

        fn url(&self, key: &str) -> String {
            format!("/{}", key)
        }

        async fn probe(&self) -> Result<()> {
            Ok(())
        }
    }

    async fn seed_chapters(storage: &FlatKeyStorage) {
        for key in [
            "bit_transcode/ch-1/master.m3u8",
            "bit_transcode/ch-1/64k/playlist.m3u8",
            "bit_transcode/ch-1/64k/segment_000.ts",
            "bit_transcode/ch-10/master.m3u8",
            "bit_transcode/ch-10/64k/playlist.m3u8",
            "bit_transcode/ch-10/64k/segment_000.ts",
        ] {
            storage.upload(key, Bytes::from("x"), "text/plain").await.unwrap();
        }
    }

    #[tokio::test]
    async fn slash_bound_delete_prefix_spares_sibling_chapters() {
        let storage = FlatKeyStorage::new();
        seed_chapters(&storage).await;

        let deleted = storage.delete_prefix("bit_transcode/ch-1/").await.unwrap();

        assert_eq!(deleted, 3);
        assert!(storage.list("bit_transcode/ch-1/").await.unwrap().is_empty());
        // Chapter ch-10 shares the string prefix "ch-1" but sits behind a
        // different delimiter; it must survive untouched.
        assert_eq!(storage.list("bit_transcode/ch-10/").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unbounded_prefix_collides_across_chapters() {
        let storage = FlatKeyStorage::new();
        seed_chapters(&storage).await;

        // The hazard the trailing slash exists to prevent: a bare prefix
        // matches every chapter id that merely starts with "ch-1".
        let listed = storage.list("bit_transcode/ch-1").await.unwrap();
        assert_eq!(listed.len(), 6);
    }
}
