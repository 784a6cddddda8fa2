// Submodules for local file system storage and S3 storage
mod local;
mod s3;

pub use local::LocalStorage;
pub use s3::S3Storage;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::{
    config::Config,
    models::{Scope, StorageKind},
    utils::{get_file_extension, secure_filename},
};

// Storage error types
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Io Error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Upload Error: {0}")]
    UploadError(String),

    #[error("Download Error: {0}")]
    DownloadError(String),

    #[error("Delete Error: {0}")]
    DeleteError(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Storage backend not configured: {0}")]
    Unconfigured(StorageKind),
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Store `content` under `key`, replacing anything already there.
    /// Returns the key the bytes were written under.
    async fn upload(&self, key: &str, content: Bytes) -> Result<String, StorageError>;

    /// Fails with `StorageError::NotFound` when nothing is stored under `key`.
    async fn download(&self, key: &str) -> Result<Bytes, StorageError>;

    /// Returns `true` when an object was removed, `false` when none existed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

// Enum to represent storage backends
#[derive(Clone)]
pub enum StorageBackend {
    Local(LocalStorage),
    S3(S3Storage),
}

// Delegates calls to the chosen backend
#[async_trait]
impl Storage for StorageBackend {
    async fn upload(&self, key: &str, content: Bytes) -> Result<String, StorageError> {
        match self {
            StorageBackend::Local(s) => s.upload(key, content).await,
            StorageBackend::S3(s) => s.upload(key, content).await,
        }
    }

    async fn download(&self, key: &str) -> Result<Bytes, StorageError> {
        match self {
            StorageBackend::Local(s) => s.download(key).await,
            StorageBackend::S3(s) => s.download(key).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        match self {
            StorageBackend::Local(s) => s.delete(key).await,
            StorageBackend::S3(s) => s.delete(key).await,
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self {
            StorageBackend::Local(s) => s.exists(key).await,
            StorageBackend::S3(s) => s.exists(key).await,
        }
    }
}

/// The backends a deployment can reach, plus the one new blobs are written to.
///
/// Files remember which kind holds their bytes, so a deployment that switched
/// primary backend keeps reading old files as long as both stay configured.
#[derive(Clone)]
pub struct StorageSet {
    primary: StorageKind,
    local: Option<StorageBackend>,
    remote: Option<StorageBackend>,
}

impl StorageSet {
    pub fn local_only(local: LocalStorage) -> Self {
        Self {
            primary: StorageKind::Local,
            local: Some(StorageBackend::Local(local)),
            remote: None,
        }
    }

    pub fn new(primary: StorageKind, local: Option<LocalStorage>, remote: Option<S3Storage>) -> Self {
        Self {
            primary,
            local: local.map(StorageBackend::Local),
            remote: remote.map(StorageBackend::S3),
        }
    }

    pub fn primary(&self) -> StorageKind {
        self.primary
    }

    pub fn backend(&self, kind: StorageKind) -> Result<&StorageBackend, StorageError> {
        let backend = match kind {
            StorageKind::Local => self.local.as_ref(),
            StorageKind::Remote => self.remote.as_ref(),
        };
        backend.ok_or(StorageError::Unconfigured(kind))
    }
}

/// Builds a fresh, collision-free key for a blob. The client-supplied name
/// only contributes its extension (local) or a sanitized form (remote).
pub fn generate_key(kind: StorageKind, scope: &Scope, original_name: &str) -> String {
    let id = Uuid::new_v4();
    match kind {
        StorageKind::Local => match get_file_extension(original_name) {
            Some(ext) => format!("{}.{}", id, secure_filename(&ext)),
            None => id.to_string(),
        },
        StorageKind::Remote => {
            let name = secure_filename(original_name);
            match scope {
                Scope::Team(team_id) => format!("teams/{}/files/{}_{}", team_id, id, name),
                Scope::Personal(user) => {
                    format!("users/{}/files/{}_{}", secure_filename(user), id, name)
                }
            }
        }
    }
}

// Initialize the storage backends based on config
pub async fn init_storage(config: &Config) -> Result<StorageSet, StorageError> {
    info!("Initializing Local storage at {}", config.upload_dir);
    let local = LocalStorage::new(&config.upload_dir).await?;

    if config.use_s3 {
        info!("Initializing S3 storage");
        let remote = S3Storage::new(config).await;
        Ok(StorageSet::new(StorageKind::Remote, Some(local), Some(remote)))
    } else {
        Ok(StorageSet::local_only(local))
    }
}
