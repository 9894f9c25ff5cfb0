//! Filesystem blob store.

use crate::config::StorageProviderKind;
use crate::storage::{BlobStore, StorageError, StorageLocator, ensure_provider};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Stores blobs as files under a root directory.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Create a store rooted at `root`; directories are created on first write.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn full_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn provider(&self) -> StorageProviderKind {
        StorageProviderKind::Local
    }

    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<StorageLocator, StorageError> {
        let full_path = self.full_path(key)?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to a sibling temp file, then rename into place.
        let mut temp_name = full_path.as_os_str().to_owned();
        temp_name.push(format!(".{}.tmp", uuid::Uuid::new_v4()));
        let temp_path = PathBuf::from(temp_name);

        let mut file = fs::File::create(&temp_path).await?;
        let written = async {
            file.write_all(&bytes).await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        if let Err(err) = fs::rename(&temp_path, &full_path).await {
            tracing::warn!(from = %temp_path.display(), to = %full_path.display(), error = %err, "Blob rename failed");
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }

        tracing::debug!(key, bytes = bytes.len(), "Stored blob on local disk");
        Ok(StorageLocator {
            provider: StorageProviderKind::Local,
            key: key.to_string(),
        })
    }

    async fn get(&self, locator: &StorageLocator) -> Result<Vec<u8>, StorageError> {
        ensure_provider(locator, StorageProviderKind::Local)?;
        let full_path = self.full_path(&locator.key)?;
        match fs::read(&full_path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(locator.key.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn put_then_get_returns_same_bytes() {
        let dir = TempDir::new().expect("temp dir");
        let store = LocalBlobStore::new(dir.path());

        let locator = store
            .put("uploads/7/doc.pdf", b"%PDF-1.4 body".to_vec(), "application/pdf")
            .await
            .expect("put");
        assert_eq!(locator.provider, StorageProviderKind::Local);
        assert_eq!(locator.key, "uploads/7/doc.pdf");

        let bytes = store.get(&locator).await.expect("get");
        assert_eq!(bytes, b"%PDF-1.4 body");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("uploads/7"))
            .expect("dir")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let dir = TempDir::new().expect("temp dir");
        let store = LocalBlobStore::new(dir.path());
        let locator = StorageLocator {
            provider: StorageProviderKind::Local,
            key: "uploads/1/absent.pdf".into(),
        };
        assert!(matches!(
            store.get(&locator).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn keys_cannot_escape_the_root() {
        let dir = TempDir::new().expect("temp dir");
        let store = LocalBlobStore::new(dir.path());
        for key in ["../outside.pdf", "/etc/passwd", "uploads/../../x", ""] {
            assert!(matches!(
                store.put(key, vec![1], "application/pdf").await,
                Err(StorageError::InvalidKey(_))
            ));
        }
    }

    #[tokio::test]
    async fn s3_locator_is_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let store = LocalBlobStore::new(dir.path());
        let locator = StorageLocator {
            provider: StorageProviderKind::S3,
            key: "uploads/1/doc.pdf".into(),
        };
        assert!(matches!(
            store.get(&locator).await,
            Err(StorageError::ProviderMismatch { .. })
        ));
    }
}
