use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{AppendedVersion, FileRepository, PurgedFile, Transition, VersionDraft};
use crate::{
    error::AppError,
    models::{Activity, File, Folder, Scope, Version},
};

#[derive(Default)]
struct State {
    files: HashMap<Uuid, File>,
    // Ascending by version_number
    versions: HashMap<Uuid, Vec<Version>>,
    folders: HashMap<Uuid, Folder>,
    retention: HashMap<Uuid, i64>,
    activity: Vec<Activity>,
}

/// Process-local record store. One lock guards all state, so every write is
/// serialized and observed atomically.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl State {
    fn key_in_use(&self, key: &str) -> bool {
        self.files.values().any(|f| f.storage_key == key)
            || self
                .versions
                .values()
                .flatten()
                .any(|v| v.content.blob_key() == Some(key))
    }

    /// Whether `candidate` is `id` or lies below it.
    fn in_subtree(&self, id: Uuid, candidate: Uuid) -> bool {
        let mut next = Some(candidate);
        let mut steps = 0;
        while let Some(current) = next {
            if current == id || steps > self.folders.len() {
                return true;
            }
            next = self.folders.get(&current).and_then(|f| f.parent_id);
            steps += 1;
        }
        false
    }
}

#[async_trait]
impl FileRepository for MemoryRepository {
    async fn insert_file(
        &self,
        file: &File,
        initial: Option<&Version>,
        activity: &Activity,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if state.files.contains_key(&file.id) {
            return Err(AppError::Conflict(format!("file {} already exists", file.id)));
        }
        if state.key_in_use(&file.storage_key) {
            return Err(AppError::Conflict(format!(
                "stored object {} already belongs to another file",
                file.storage_key
            )));
        }
        state.files.insert(file.id, file.clone());
        state.versions.insert(file.id, initial.into_iter().cloned().collect());
        state.activity.push(activity.clone());
        Ok(())
    }

    async fn get_file(&self, id: Uuid) -> Result<Option<File>, AppError> {
        Ok(self.state.lock().await.files.get(&id).cloned())
    }

    async fn list_active(&self, scope: &Scope, folder_id: Option<Uuid>) -> Result<Vec<File>, AppError> {
        let state = self.state.lock().await;
        let mut files: Vec<File> = state
            .files
            .values()
            .filter(|f| !f.is_deleted && f.folder_id == folder_id && scope.contains(f))
            .cloned()
            .collect();
        files.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.created_at.cmp(&a.created_at)));
        Ok(files)
    }

    async fn list_deleted(&self, scope: Option<&Scope>) -> Result<Vec<File>, AppError> {
        let state = self.state.lock().await;
        let mut files: Vec<File> = state
            .files
            .values()
            .filter(|f| f.is_deleted && scope.is_none_or(|s| s.contains(f)))
            .cloned()
            .collect();
        files.sort_by(|a, b| b.deleted_at.cmp(&a.deleted_at));
        Ok(files)
    }

    async fn mark_deleted(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        activity: &Activity,
    ) -> Result<Transition, AppError> {
        let mut state = self.state.lock().await;
        let file = state.files.get_mut(&id).ok_or_else(|| AppError::file_not_found(id))?;
        if file.is_deleted {
            return Ok(Transition::Unchanged(file.clone()));
        }
        file.is_deleted = true;
        file.deleted_at = Some(at);
        let file = file.clone();
        state.activity.push(activity.clone());
        Ok(Transition::Changed(file))
    }

    async fn clear_deleted(&self, id: Uuid, activity: &Activity) -> Result<Transition, AppError> {
        let mut state = self.state.lock().await;
        let file = state.files.get_mut(&id).ok_or_else(|| AppError::file_not_found(id))?;
        if !file.is_deleted {
            return Ok(Transition::Unchanged(file.clone()));
        }
        file.is_deleted = false;
        file.deleted_at = None;
        let file = file.clone();
        state.activity.push(activity.clone());
        Ok(Transition::Changed(file))
    }

    async fn append_version(
        &self,
        file_id: Uuid,
        draft: &VersionDraft,
        activity: &Activity,
    ) -> Result<AppendedVersion, AppError> {
        let mut state = self.state.lock().await;
        let State { files, versions, activity: log, .. } = &mut *state;

        let file = files
            .get_mut(&file_id)
            .filter(|f| !f.is_deleted)
            .ok_or_else(|| AppError::file_not_found(file_id))?;
        let history = versions.entry(file_id).or_default();

        let next = history.last().map_or(1, |v| v.version_number + 1);
        if history.iter().any(|v| v.version_number == next) {
            return Err(AppError::Conflict(format!(
                "version {next} of file {file_id} already exists"
            )));
        }

        let version = Version {
            id: Uuid::new_v4(),
            file_id,
            version_number: next,
            content: draft.content.clone(),
            created_by: draft.created_by.clone(),
            created_at: draft.created_at,
        };
        history.push(version.clone());

        let previous_key = std::mem::replace(&mut file.storage_key, draft.storage_key.clone());
        file.version = next;
        file.file_size = draft.file_size;
        file.checksum = Some(draft.checksum.clone());
        file.updated_at = draft.created_at;
        log.push(activity.clone());

        Ok(AppendedVersion { file: file.clone(), version, previous_key })
    }

    async fn latest_version(&self, file_id: Uuid) -> Result<Option<Version>, AppError> {
        let state = self.state.lock().await;
        Ok(state.versions.get(&file_id).and_then(|v| v.last().cloned()))
    }

    async fn list_versions(&self, file_id: Uuid) -> Result<Vec<Version>, AppError> {
        let state = self.state.lock().await;
        let mut versions = state.versions.get(&file_id).cloned().unwrap_or_default();
        versions.reverse();
        Ok(versions)
    }

    async fn blob_referenced(&self, file_id: Uuid, key: &str) -> Result<bool, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .versions
            .get(&file_id)
            .is_some_and(|v| v.iter().any(|v| v.content.blob_key() == Some(key))))
    }

    async fn delete_file(&self, id: Uuid, activity: &Activity) -> Result<PurgedFile, AppError> {
        let mut state = self.state.lock().await;
        match state.files.get(&id) {
            None => return Err(AppError::file_not_found(id)),
            Some(file) if !file.is_deleted => {
                return Err(AppError::InvalidState(format!("file {id} is not in the bin")));
            }
            Some(_) => {}
        }
        let versions = state.versions.remove(&id).unwrap_or_default();
        let file = state.files.remove(&id).ok_or_else(|| AppError::file_not_found(id))?;
        state.activity.push(activity.clone());
        Ok(PurgedFile::new(file, &versions))
    }

    async fn insert_folder(&self, folder: &Folder, activity: &Activity) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        state.folders.insert(folder.id, folder.clone());
        state.activity.push(activity.clone());
        Ok(())
    }

    async fn get_folder(&self, id: Uuid) -> Result<Option<Folder>, AppError> {
        Ok(self.state.lock().await.folders.get(&id).cloned())
    }

    async fn list_folders(&self, team_id: Uuid, parent_id: Option<Uuid>) -> Result<Vec<Folder>, AppError> {
        let state = self.state.lock().await;
        let mut folders: Vec<Folder> = state
            .folders
            .values()
            .filter(|f| f.team_id == team_id && f.parent_id == parent_id)
            .cloned()
            .collect();
        folders.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(folders)
    }

    async fn set_folder_parent(
        &self,
        id: Uuid,
        parent_id: Option<Uuid>,
        activity: &Activity,
    ) -> Result<Folder, AppError> {
        let mut state = self.state.lock().await;
        if !state.folders.contains_key(&id) {
            return Err(AppError::folder_not_found(id));
        }
        if let Some(parent_id) = parent_id {
            if !state.folders.contains_key(&parent_id) {
                return Err(AppError::folder_not_found(parent_id));
            }
            if state.in_subtree(id, parent_id) {
                return Err(AppError::InvalidState(format!(
                    "folder {} cannot move into itself or its own subfolder",
                    id
                )));
            }
        }
        let folder = state.folders.get_mut(&id).ok_or_else(|| AppError::folder_not_found(id))?;
        folder.parent_id = parent_id;
        let folder = folder.clone();
        state.activity.push(activity.clone());
        Ok(folder)
    }

    async fn retention_days(&self, team_id: Uuid) -> Result<Option<i64>, AppError> {
        Ok(self.state.lock().await.retention.get(&team_id).copied())
    }

    async fn set_retention_days(&self, team_id: Uuid, days: i64) -> Result<(), AppError> {
        self.state.lock().await.retention.insert(team_id, days);
        Ok(())
    }

    async fn list_activity(&self, scope: &Scope, limit: i64) -> Result<Vec<Activity>, AppError> {
        let state = self.state.lock().await;
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(state
            .activity
            .iter()
            .rev()
            .filter(|a| scope.owns_activity(a))
            .take(limit)
            .cloned()
            .collect())
    }
}
