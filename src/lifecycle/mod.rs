//! File lifecycle core: uploads, version history, the recycle bin, folders
//! and the activity trail. Every operation takes its scope and the caller's
//! capabilities explicitly; nothing here reads ambient session state.

mod activity;
mod files;
mod folders;
mod recycle;
mod versions;

pub use activity::ActivityLog;
pub use files::FileStore;
pub use folders::FolderTree;
pub use recycle::BinManager;
pub use versions::VersionLedger;

use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;
use uuid::Uuid;

use crate::{
    clock::Clock,
    config::Config,
    error::AppError,
    models::{File, Scope, StorageKind},
    repository::FileRepository,
    storage::{Storage, StorageSet},
};

/// Identity used for changes nobody asked for directly, such as bin sweeps.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub default_retention_days: i64,
    pub max_file_size: u64,
    pub allowed_extensions: Vec<String>,
}

impl From<&Config> for LifecycleSettings {
    fn from(config: &Config) -> Self {
        Self {
            default_retention_days: config.bin_retention_days,
            max_file_size: config.max_file_size,
            allowed_extensions: config.allowed_extensions.clone(),
        }
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        LifecycleSettings::from(&Config::default())
    }
}

/// Collaborators shared by every lifecycle component.
pub struct LifecycleContext {
    pub repo: Arc<dyn FileRepository>,
    pub storage: StorageSet,
    pub clock: Arc<dyn Clock>,
    pub settings: LifecycleSettings,
}

impl LifecycleContext {
    /// The file in any non-purged state.
    async fn file(&self, id: Uuid) -> Result<File, AppError> {
        self.repo.get_file(id).await?.ok_or_else(|| AppError::file_not_found(id))
    }

    /// The file, provided it is not in the bin.
    async fn active_file(&self, id: Uuid) -> Result<File, AppError> {
        let file = self.file(id).await?;
        if file.is_deleted {
            return Err(AppError::file_not_found(id));
        }
        Ok(file)
    }

    async fn retention_days(&self, scope: &Scope) -> Result<i64, AppError> {
        let configured = match scope {
            Scope::Team(team_id) => self.repo.retention_days(*team_id).await?,
            Scope::Personal(_) => None,
        };
        Ok(configured.unwrap_or(self.settings.default_retention_days))
    }

    fn check_size(&self, size: usize) -> Result<(), AppError> {
        if size as u64 > self.settings.max_file_size {
            return Err(AppError::PayloadTooLarge(format!(
                "File size {} exceeds maximum limit of {} bytes",
                size, self.settings.max_file_size
            )));
        }
        Ok(())
    }

    async fn read_blob(&self, kind: StorageKind, key: &str) -> Result<Bytes, AppError> {
        Ok(self.storage.backend(kind)?.download(key).await?)
    }

    async fn write_blob(&self, kind: StorageKind, key: &str, content: Bytes) -> Result<(), AppError> {
        let backend = self.storage.backend(kind)?;
        backend.upload(key, content).await.map_err(|e| {
            tracing::error!("Error writing blob {} to {} storage: {}", key, kind, e);
            AppError::StorageUnavailable(e.to_string())
        })?;
        Ok(())
    }

    /// Removes a blob nothing points at any more. Failure leaves an orphan, not
    /// an inconsistency, so it is only logged.
    async fn discard_blob(&self, kind: StorageKind, key: &str) {
        let result = match self.storage.backend(kind) {
            Ok(backend) => backend.delete(key).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Could not remove unreferenced blob {} from {} storage: {}", key, kind, e);
        }
    }
}

fn require(granted: bool, action: &str) -> Result<(), AppError> {
    if granted {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!("not permitted to {action}")))
    }
}

/// Entry point bundling the lifecycle components over one shared context.
#[derive(Clone)]
pub struct Drive {
    pub files: FileStore,
    pub versions: VersionLedger,
    pub bin: BinManager,
    pub folders: FolderTree,
    pub activity: ActivityLog,
}

impl Drive {
    pub fn new(ctx: LifecycleContext) -> Self {
        let ctx = Arc::new(ctx);
        Self {
            files: FileStore::new(ctx.clone()),
            versions: VersionLedger::new(ctx.clone()),
            bin: BinManager::new(ctx.clone()),
            folders: FolderTree::new(ctx.clone()),
            activity: ActivityLog::new(ctx),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    use super::{Drive, LifecycleContext, LifecycleSettings};
    use crate::{
        clock::ManualClock,
        repository::MemoryRepository,
        storage::{LocalStorage, StorageSet},
    };

    pub struct Harness {
        pub drive: Drive,
        pub clock: Arc<ManualClock>,
        pub dir: TempDir,
    }

    pub async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let local = LocalStorage::new(dir.path()).await.unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()));
        let drive = Drive::new(LifecycleContext {
            repo: Arc::new(MemoryRepository::new()),
            storage: StorageSet::local_only(local),
            clock: clock.clone(),
            settings: LifecycleSettings::default(),
        });
        Harness { drive, clock, dir }
    }

    impl Harness {
        /// Path of a stored local blob.
        pub fn blob_path(&self, key: &str) -> std::path::PathBuf {
            self.dir.path().join("files").join(key)
        }
    }
}
