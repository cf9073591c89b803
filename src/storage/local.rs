use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs;

use crate::error::{AppError, Result};
use crate::storage::{ObjectMetadata, ObjectStorage};

/// Disk-backed provider rooted at a base directory. Keys map directly to
/// relative paths, so multi-process writers are safe as long as they own
/// disjoint key prefixes.
pub struct LocalStorage {
    base: PathBuf,
}

impl LocalStorage {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        // Reject traversal out of the base directory.
        let relative = Path::new(key);
        if relative.components().any(|c| {
            matches!(
                c,
                std::path::Component::ParentDir | std::path::Component::RootDir
            )
        }) {
            return Err(AppError::Validation(format!("invalid storage key: {}", key)));
        }
        Ok(self.base.join(relative))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Storage(format!("create dir {:?}: {}", parent, e)))?;
        }
        Ok(())
    }

    fn key_of(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.base)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    fn provider(&self) -> &'static str {
        "local"
    }

    async fn upload(&self, key: &str, data: Bytes, _content_type: &str) -> Result<()> {
        let path = self.resolve(key)?;
        Self::ensure_parent(&path).await?;
        fs::write(&path, &data)
            .await
            .map_err(|e| AppError::Storage(format!("write {}: {}", key, e)))
    }

    async fn download(&self, key: &str) -> Result<Bytes> {
        let path = self.resolve(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::NotFound(format!("object not found: {}", key)))
            }
            Err(e) => Err(AppError::Storage(format!("read {}: {}", key, e))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            // Deleting something already gone is a no-op.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Storage(format!("delete {}: {}", key, e))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        Ok(fs::try_exists(&path)
            .await
            .map_err(|e| AppError::Storage(format!("stat {}: {}", key, e)))?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.resolve(prefix)?;
        if !fs::try_exists(&root)
            .await
            .map_err(|e| AppError::Storage(format!("stat {}: {}", prefix, e)))?
        {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| AppError::Storage(format!("read dir {:?}: {}", dir, e)))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| AppError::Storage(format!("read dir {:?}: {}", dir, e)))?
            {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Some(key) = self.key_of(&path) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn metadata(&self, key: &str) -> Result<ObjectMetadata> {
        let path = self.resolve(key)?;
        let meta = fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::NotFound(format!("object not found: {}", key))
            } else {
                AppError::Storage(format!("stat {}: {}", key, e))
            }
        })?;
        let last_modified = meta
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t));
        Ok(ObjectMetadata {
            size: meta.len(),
            content_type: None,
            last_modified,
        })
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        Self::ensure_parent(&dst).await?;
        fs::copy(&src, &dst)
            .await
            .map_err(|e| AppError::Storage(format!("copy {} -> {}: {}", from, to, e)))?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        Self::ensure_parent(&dst).await?;
        fs::rename(&src, &dst)
            .await
            .map_err(|e| AppError::Storage(format!("rename {} -> {}: {}", from, to, e)))
    }

    fn url(&self, key: &str) -> String {
        format!("/{}", key)
    }

    fn local_path(&self, key: &str) -> Option<PathBuf> {
        self.resolve(key).ok()
    }

    async fn probe(&self) -> Result<()> {
        fs::create_dir_all(&self.base)
            .await
            .map_err(|e| AppError::Storage(format!("storage root {:?}: {}", self.base, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        (dir, storage)
    }

    #[tokio::test]
    async fn upload_download_round_trip() {
        let (_dir, storage) = storage();
        storage
            .upload("bit_transcode/c1/64k/playlist.m3u8", Bytes::from("#EXTM3U"), "application/vnd.apple.mpegurl")
            .await
            .unwrap();
        let data = storage.download("bit_transcode/c1/64k/playlist.m3u8").await.unwrap();
        assert_eq!(&data[..], b"#EXTM3U");
    }

    #[tokio::test]
    async fn download_missing_is_not_found() {
        let (_dir, storage) = storage();
        let err = storage.download("nope.ts").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_returns_sorted_keys_under_prefix() {
        let (_dir, storage) = storage();
        for name in ["segment_002.ts", "segment_000.ts", "segment_001.ts"] {
            storage
                .upload(&format!("bit_transcode/c1/64k/{}", name), Bytes::from("x"), "video/mp2t")
                .await
                .unwrap();
        }
        storage
            .upload("bit_transcode/c2/64k/segment_000.ts", Bytes::from("x"), "video/mp2t")
            .await
            .unwrap();

        let keys = storage.list("bit_transcode/c1").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "bit_transcode/c1/64k/segment_000.ts",
                "bit_transcode/c1/64k/segment_001.ts",
                "bit_transcode/c1/64k/segment_002.ts",
            ]
        );
    }

    #[tokio::test]
    async fn delete_prefix_removes_all_artifacts() {
        let (_dir, storage) = storage();
        for key in [
            "bit_transcode/c1/master.m3u8",
            "bit_transcode/c1/64k/playlist.m3u8",
            "bit_transcode/c1/64k/segment_000.ts",
        ] {
            storage.upload(key, Bytes::from("x"), "text/plain").await.unwrap();
        }

        let deleted = storage.delete_prefix("bit_transcode/c1").await.unwrap();
        assert_eq!(deleted, 3);
        assert!(storage.list("bit_transcode/c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let (_dir, storage) = storage();
        let err = storage.download("../outside").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn copy_and_rename() {
        let (_dir, storage) = storage();
        storage.upload("a/src.ts", Bytes::from("abc"), "video/mp2t").await.unwrap();
        storage.copy("a/src.ts", "b/copy.ts").await.unwrap();
        assert!(storage.exists("a/src.ts").await.unwrap());
        assert!(storage.exists("b/copy.ts").await.unwrap());

        storage.rename("a/src.ts", "c/moved.ts").await.unwrap();
        assert!(!storage.exists("a/src.ts").await.unwrap());
        assert_eq!(&storage.download("c/moved.ts").await.unwrap()[..], b"abc");
    }
}
