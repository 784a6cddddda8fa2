use std::path::{Component, Path, PathBuf};
use bytes::Bytes;
use super::{Storage, StorageError};
use async_trait::async_trait;
use tokio::{fs, io::AsyncWriteExt};

// Local filesystem storage
#[derive(Clone, Debug)]
pub struct LocalStorage {
    root: PathBuf, // `<base>/files`, every key resolves inside it
}

impl LocalStorage {
    /// Creates a new LocalStorage instance and ensures the files directory exists
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = base_path.as_ref().join("files");
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Resolves a key to a path under the root, refusing anything that could escape it.
    fn get_full_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let is_plain = !key.is_empty()
            && !key.contains('\\')
            && relative.components().all(|c| matches!(c, Component::Normal(_)));
        if !is_plain {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn upload(&self, key: &str, content: Bytes) -> Result<String, StorageError> {
        let full_path = self.get_full_path(key)?;

        // Ensure parent directories exist
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&full_path).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;

        tracing::debug!("Saved file at {:?}", full_path);

        Ok(key.to_string())
    }

    async fn download(&self, key: &str) -> Result<Bytes, StorageError> {
        let full_path = self.get_full_path(key)?;

        match fs::read(&full_path).await {
            Ok(content) => Ok(Bytes::from(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(StorageError::IoError(e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let full_path = self.get_full_path(key)?;

        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::IoError(e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let full_path = self.get_full_path(key)?;
        Ok(fs::try_exists(&full_path).await?)
    }
}
