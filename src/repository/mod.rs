// Record store implementations: PostgreSQL for deployments, memory for tests and local runs
mod memory;
mod postgres;

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{Activity, File, Folder, Scope, Version, VersionContent},
};

/// Everything a new version needs besides its number, which the store assigns.
#[derive(Debug, Clone)]
pub struct VersionDraft {
    pub content: VersionContent,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    /// Blob that holds the file's bytes once this version is current.
    pub storage_key: String,
    pub file_size: i64,
    pub checksum: String,
}

/// Result of a successful append.
#[derive(Debug, Clone)]
pub struct AppendedVersion {
    pub file: File,
    pub version: Version,
    /// Storage key that was current before this append, read under the same lock.
    pub previous_key: String,
}

/// A binned file removed from the store, with every blob it referenced.
#[derive(Debug, Clone)]
pub struct PurgedFile {
    pub file: File,
    /// Current storage key first, then version blobs, deduplicated.
    pub blob_keys: Vec<String>,
}

impl PurgedFile {
    fn new(file: File, versions: &[Version]) -> Self {
        let mut blob_keys = vec![file.storage_key.clone()];
        for key in versions.iter().filter_map(|v| v.content.blob_key()) {
            if !blob_keys.iter().any(|k| k == key) {
                blob_keys.push(key.to_string());
            }
        }
        Self { file, blob_keys }
    }
}

/// Outcome of an idempotent state change.
#[derive(Debug, Clone)]
pub enum Transition {
    Changed(File),
    Unchanged(File),
}

impl Transition {
    pub fn into_file(self) -> File {
        match self {
            Transition::Changed(file) | Transition::Unchanged(file) => file,
        }
    }

    pub fn changed(&self) -> bool {
        matches!(self, Transition::Changed(_))
    }
}

/// Persistent relational store for files, versions, folders and activity.
///
/// Every method taking an `Activity` writes it in the same transaction as the
/// change it describes, and only when that change actually happens.
#[async_trait]
pub trait FileRepository: Send + Sync {
    /// Inserts a file at version 1, optionally with its first version. Fails with
    /// `Conflict` when its storage key is already referenced by another file or
    /// version.
    async fn insert_file(
        &self,
        file: &File,
        initial: Option<&Version>,
        activity: &Activity,
    ) -> Result<(), AppError>;

    async fn get_file(&self, id: Uuid) -> Result<Option<File>, AppError>;

    /// Non-deleted files in `scope` directly inside `folder_id` (`None` = root),
    /// most recently updated first.
    async fn list_active(&self, scope: &Scope, folder_id: Option<Uuid>) -> Result<Vec<File>, AppError>;

    /// Deleted files in `scope` (every scope when `None`), most recently deleted first.
    async fn list_deleted(&self, scope: Option<&Scope>) -> Result<Vec<File>, AppError>;

    async fn mark_deleted(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        activity: &Activity,
    ) -> Result<Transition, AppError>;

    async fn clear_deleted(&self, id: Uuid, activity: &Activity) -> Result<Transition, AppError>;

    /// Assigns the next version number and bumps the file's counter atomically,
    /// serialized against other appends to the same file.
    async fn append_version(
        &self,
        file_id: Uuid,
        draft: &VersionDraft,
        activity: &Activity,
    ) -> Result<AppendedVersion, AppError>;

    async fn latest_version(&self, file_id: Uuid) -> Result<Option<Version>, AppError>;

    /// Versions, highest number first.
    async fn list_versions(&self, file_id: Uuid) -> Result<Vec<Version>, AppError>;

    /// Whether any version of the file stores its content under `key`.
    async fn blob_referenced(&self, file_id: Uuid, key: &str) -> Result<bool, AppError>;

    /// Removes a binned file and its versions in one step and reports the blobs
    /// they referenced. Fails with `InvalidState` when the file is active and
    /// `NotFound` when it does not exist.
    async fn delete_file(&self, id: Uuid, activity: &Activity) -> Result<PurgedFile, AppError>;

    async fn insert_folder(&self, folder: &Folder, activity: &Activity) -> Result<(), AppError>;

    async fn get_folder(&self, id: Uuid) -> Result<Option<Folder>, AppError>;

    /// Direct children of `parent_id` (`None` = root) ordered by name.
    async fn list_folders(&self, team_id: Uuid, parent_id: Option<Uuid>) -> Result<Vec<Folder>, AppError>;

    /// Re-parents a folder, checking under the write that `parent_id` is neither
    /// the folder itself nor one of its descendants (`InvalidState`).
    async fn set_folder_parent(
        &self,
        id: Uuid,
        parent_id: Option<Uuid>,
        activity: &Activity,
    ) -> Result<Folder, AppError>;

    async fn retention_days(&self, team_id: Uuid) -> Result<Option<i64>, AppError>;

    async fn set_retention_days(&self, team_id: Uuid, days: i64) -> Result<(), AppError>;

    /// Newest first.
    async fn list_activity(&self, scope: &Scope, limit: i64) -> Result<Vec<Activity>, AppError>;
}
