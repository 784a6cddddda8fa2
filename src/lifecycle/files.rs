use std::sync::Arc;

use bytes::Bytes;
use chrono::Duration;
use tracing::info;
use uuid::Uuid;

use super::{LifecycleContext, require};
use crate::{
    error::AppError,
    models::{
        Activity, ActivityAction, Capabilities, File, FileKind, FileState, FileView,
        InitialContent, NewFile, Scope, Version, VersionContent,
    },
    storage::generate_key,
    utils::{calculate_sha256, get_file_extension},
};

/// Metadata operations over file records.
#[derive(Clone)]
pub struct FileStore {
    ctx: Arc<LifecycleContext>,
}

impl FileStore {
    pub(super) fn new(ctx: Arc<LifecycleContext>) -> Self {
        Self { ctx }
    }

    /// Records a new upload at version 1. Text uploads also get Version #1.
    pub async fn create_file(
        &self,
        new: NewFile,
        content: InitialContent,
        actor: &str,
        caps: Capabilities,
    ) -> Result<File, AppError> {
        require(caps.can_upload, "upload files")?;

        if let Scope::Personal(owner) = &new.scope {
            if owner != actor {
                return Err(AppError::Forbidden("personal files belong to their uploader".into()));
            }
        }

        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::BadRequest("No file provided".into()));
        }

        let extension = get_file_extension(&name)
            .ok_or_else(|| AppError::BadRequest("Invalid file extension".into()))?;
        if !self.ctx.settings.allowed_extensions.contains(&extension) {
            return Err(AppError::UnSupportedMediaType(format!(
                "File extension .{} is not allowed",
                extension
            )));
        }

        self.check_folder(&new.scope, new.folder_id).await?;

        let (storage_kind, storage_key, bytes, fresh) = match content {
            InitialContent::Bytes(bytes) => {
                self.ctx.check_size(bytes.len())?;
                let kind = self.ctx.storage.primary();
                let key = generate_key(kind, &new.scope, &name);
                self.ctx.write_blob(kind, &key, bytes.clone()).await?;
                (kind, key, bytes, true)
            }
            InitialContent::Stored { kind, key } => {
                let bytes = self.ctx.read_blob(kind, &key).await?;
                self.ctx.check_size(bytes.len())?;
                (kind, key, bytes, false)
            }
        };

        let now = self.ctx.clock.now();
        let kind = FileKind::from_filename(&name);
        let file = File {
            id: Uuid::new_v4(),
            name,
            storage_key,
            storage_kind,
            file_size: bytes.len() as i64,
            kind,
            mime_type: new.mime_type.unwrap_or_else(|| "application/octet-stream".into()),
            checksum: Some(calculate_sha256(&bytes)),
            team_id: new.scope.team_id(),
            folder_id: new.folder_id,
            uploaded_by: actor.to_string(),
            is_deleted: false,
            deleted_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        let initial = match (kind, std::str::from_utf8(&bytes)) {
            (FileKind::Text, Ok(text)) => Some(Version {
                id: Uuid::new_v4(),
                file_id: file.id,
                version_number: 1,
                content: VersionContent::Text(text.to_string()),
                created_by: actor.to_string(),
                created_at: now,
            }),
            _ => None,
        };

        let activity = Activity::for_file(
            &file,
            actor,
            ActivityAction::UploadFile,
            format!("Uploaded \"{}\"", file.name),
            now,
        );

        if let Err(e) = self.ctx.repo.insert_file(&file, initial.as_ref(), &activity).await {
            if fresh {
                self.ctx.discard_blob(file.storage_kind, &file.storage_key).await;
            }
            return Err(e);
        }

        info!("File uploaded: {} ({} bytes)", file.id, file.file_size);
        Ok(file)
    }

    async fn check_folder(&self, scope: &Scope, folder_id: Option<Uuid>) -> Result<(), AppError> {
        let Some(folder_id) = folder_id else {
            return Ok(());
        };
        let Scope::Team(team_id) = scope else {
            return Err(AppError::BadRequest("personal files cannot be placed in folders".into()));
        };
        let folder = self
            .ctx
            .repo
            .get_folder(folder_id)
            .await?
            .ok_or_else(|| AppError::folder_not_found(folder_id))?;
        if folder.team_id != *team_id {
            return Err(AppError::BadRequest(format!(
                "folder {} belongs to another team",
                folder_id
            )));
        }
        Ok(())
    }

    /// Metadata for an active or binned file.
    pub async fn get(&self, file_id: Uuid) -> Result<File, AppError> {
        self.ctx.file(file_id).await
    }

    pub async fn list_active(&self, scope: &Scope, folder_id: Option<Uuid>) -> Result<Vec<File>, AppError> {
        self.ctx.repo.list_active(scope, folder_id).await
    }

    /// An active file with its current text, for text files.
    pub async fn view(&self, file_id: Uuid) -> Result<FileView, AppError> {
        let file = self.ctx.active_file(file_id).await?;
        if file.kind != FileKind::Text {
            return Ok(FileView { file, content: None });
        }

        let latest = self.ctx.repo.latest_version(file.id).await?;
        let content = match latest.as_ref().and_then(|v| v.content.text()) {
            Some(text) => text.to_string(),
            None => {
                let bytes = self.ctx.read_blob(file.storage_kind, &file.storage_key).await?;
                String::from_utf8_lossy(&bytes).into_owned()
            }
        };
        Ok(FileView { file, content: Some(content) })
    }

    /// Current bytes of an active file.
    pub async fn download(&self, file_id: Uuid) -> Result<(File, Bytes), AppError> {
        let file = self.ctx.active_file(file_id).await?;
        let bytes = self.ctx.read_blob(file.storage_kind, &file.storage_key).await?;
        Ok((file, bytes))
    }

    /// Moves a file to the bin. Deleting a binned file again is a no-op.
    pub async fn soft_delete(
        &self,
        file_id: Uuid,
        actor: &str,
        caps: Capabilities,
    ) -> Result<File, AppError> {
        require(caps.can_delete, "delete files")?;
        let file = self.ctx.file(file_id).await?;

        let now = self.ctx.clock.now();
        let activity = Activity::for_file(
            &file,
            actor,
            ActivityAction::DeleteFile,
            format!("Deleted \"{}\"", file.name),
            now,
        );
        let transition = self.ctx.repo.mark_deleted(file_id, now, &activity).await?;
        if transition.changed() {
            info!("File moved to bin: {}", file_id);
        }
        Ok(transition.into_file())
    }

    /// Takes a file back out of the bin while its retention window is open.
    pub async fn restore(
        &self,
        file_id: Uuid,
        actor: &str,
        caps: Capabilities,
    ) -> Result<File, AppError> {
        require(caps.can_delete, "restore files")?;
        let file = self.ctx.file(file_id).await?;

        let FileState::Deleted { at } = file.state() else {
            return Ok(file);
        };

        let now = self.ctx.clock.now();
        let retention = self.ctx.retention_days(&file.scope()).await?;
        if now - at >= Duration::days(retention) {
            return Err(AppError::Expired(format!(
                "file {} was deleted more than {} days ago",
                file_id, retention
            )));
        }

        let activity = Activity::for_file(
            &file,
            actor,
            ActivityAction::RestoreFile,
            format!("Restored \"{}\"", file.name),
            now,
        );
        let transition = self.ctx.repo.clear_deleted(file_id, &activity).await?;
        if transition.changed() {
            info!("File restored from bin: {}", file_id);
        }
        Ok(transition.into_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::Clock, lifecycle::test_support::harness, models::NewContent};

    const USER: &str = "alice";

    fn upload(scope: Scope, name: &str) -> NewFile {
        NewFile { scope, folder_id: None, name: name.into(), mime_type: None }
    }

    #[tokio::test]
    async fn text_upload_creates_first_version() {
        let h = harness().await;
        let team = Scope::Team(Uuid::new_v4());

        let file = h
            .drive
            .files
            .create_file(
                upload(team, "notes.txt"),
                InitialContent::Bytes(Bytes::from_static(b"hello")),
                USER,
                Capabilities::all(),
            )
            .await
            .unwrap();

        assert_eq!(file.version, 1);
        assert_eq!(file.kind, FileKind::Text);
        assert_eq!(file.file_size, 5);
        assert!(file.storage_key.ends_with(".txt"));
        assert!(h.blob_path(&file.storage_key).exists());

        let history = h.drive.versions.history(file.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, VersionContent::Text("hello".into()));
    }

    #[tokio::test]
    async fn binary_upload_has_no_version_rows() {
        let h = harness().await;
        let file = h
            .drive
            .files
            .create_file(
                upload(Scope::Personal(USER.into()), "photo.png"),
                InitialContent::Bytes(Bytes::from_static(&[0x89, 0x50, 0x4e, 0x47])),
                USER,
                Capabilities::all(),
            )
            .await
            .unwrap();

        assert_eq!(file.kind, FileKind::Image);
        assert_eq!(file.version, 1);
        assert!(h.drive.versions.latest(file.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_disallowed_extension_and_oversize() {
        let h = harness().await;
        let scope = Scope::Personal(USER.into());

        let err = h
            .drive
            .files
            .create_file(
                upload(scope.clone(), "run.exe"),
                InitialContent::Bytes(Bytes::from_static(b"MZ")),
                USER,
                Capabilities::all(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnSupportedMediaType(_)));

        let too_big = Bytes::from(vec![b'a'; 16 * 1024 * 1024 + 1]);
        let err = h
            .drive
            .files
            .create_file(upload(scope, "big.txt"), InitialContent::Bytes(too_big), USER, Capabilities::all())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PayloadTooLarge(_)));
    }

    #[tokio::test]
    async fn upload_requires_capability() {
        let h = harness().await;
        let err = h
            .drive
            .files
            .create_file(
                upload(Scope::Team(Uuid::new_v4()), "notes.txt"),
                InitialContent::Bytes(Bytes::from_static(b"x")),
                USER,
                Capabilities::read_only(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn stored_blob_must_exist() {
        let h = harness().await;
        let err = h
            .drive
            .files
            .create_file(
                upload(Scope::Personal(USER.into()), "notes.txt"),
                InitialContent::Stored {
                    kind: crate::models::StorageKind::Local,
                    key: "missing.txt".into(),
                },
                USER,
                Capabilities::all(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn stored_blob_cannot_be_shared_between_files() {
        let h = harness().await;
        let caps = Capabilities::all();
        let scope = Scope::Personal(USER.into());
        let first = h
            .drive
            .files
            .create_file(
                upload(scope.clone(), "photo.png"),
                InitialContent::Bytes(Bytes::from_static(&[0x89, 0x50])),
                USER,
                caps,
            )
            .await
            .unwrap();

        let err = h
            .drive
            .files
            .create_file(
                upload(scope.clone(), "copy.png"),
                InitialContent::Stored { kind: first.storage_kind, key: first.storage_key.clone() },
                USER,
                caps,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert!(h.blob_path(&first.storage_key).exists());

        // A superseded binary version still owns its blob
        let v1 = h
            .drive
            .versions
            .append_version(first.id, NewContent::Binary(Bytes::from_static(&[0x89, 0x51])), USER, caps)
            .await
            .unwrap();
        h.drive
            .versions
            .append_version(first.id, NewContent::Binary(Bytes::from_static(&[0x89, 0x52])), USER, caps)
            .await
            .unwrap();
        let old_key = v1.content.blob_key().unwrap().to_string();
        let err = h
            .drive
            .files
            .create_file(
                upload(scope.clone(), "old.png"),
                InitialContent::Stored { kind: first.storage_kind, key: old_key },
                USER,
                caps,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(h.drive.files.list_active(&scope, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_active_is_scoped_and_newest_first() {
        let h = harness().await;
        let team = Scope::Team(Uuid::new_v4());
        let other = Scope::Team(Uuid::new_v4());
        let caps = Capabilities::all();
        let bytes = || InitialContent::Bytes(Bytes::from_static(b"x"));

        let older = h.drive.files.create_file(upload(team.clone(), "a.txt"), bytes(), USER, caps).await.unwrap();
        h.clock.advance(Duration::minutes(1));
        let newer = h.drive.files.create_file(upload(team.clone(), "b.txt"), bytes(), USER, caps).await.unwrap();
        h.drive.files.create_file(upload(other, "c.txt"), bytes(), USER, caps).await.unwrap();
        h.clock.advance(Duration::minutes(1));
        let gone = h.drive.files.create_file(upload(team.clone(), "d.txt"), bytes(), USER, caps).await.unwrap();
        h.drive.files.soft_delete(gone.id, USER, caps).await.unwrap();

        let listed: Vec<Uuid> = h
            .drive
            .files
            .list_active(&team, None)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(listed, vec![newer.id, older.id]);
    }

    #[tokio::test]
    async fn soft_delete_is_idempotent_and_logged_once() {
        let h = harness().await;
        let team_id = Uuid::new_v4();
        let caps = Capabilities::all();
        let file = h
            .drive
            .files
            .create_file(
                upload(Scope::Team(team_id), "notes.txt"),
                InitialContent::Bytes(Bytes::from_static(b"hello")),
                USER,
                caps,
            )
            .await
            .unwrap();

        let first = h.drive.files.soft_delete(file.id, USER, caps).await.unwrap();
        assert!(first.is_deleted);
        assert_eq!(first.deleted_at, Some(h.clock.now()));

        h.clock.advance(Duration::hours(1));
        let second = h.drive.files.soft_delete(file.id, USER, caps).await.unwrap();
        assert_eq!(second.deleted_at, first.deleted_at);

        let deletes = h
            .drive
            .activity
            .recent(&Scope::Team(team_id), 50)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.action == ActivityAction::DeleteFile)
            .count();
        assert_eq!(deletes, 1);
    }

    #[tokio::test]
    async fn binned_files_cannot_be_viewed_or_downloaded() {
        let h = harness().await;
        let caps = Capabilities::all();
        let file = h
            .drive
            .files
            .create_file(
                upload(Scope::Personal(USER.into()), "notes.txt"),
                InitialContent::Bytes(Bytes::from_static(b"hello")),
                USER,
                caps,
            )
            .await
            .unwrap();

        let view = h.drive.files.view(file.id).await.unwrap();
        assert_eq!(view.content.as_deref(), Some("hello"));

        h.drive.files.soft_delete(file.id, USER, caps).await.unwrap();
        assert!(matches!(h.drive.files.view(file.id).await, Err(AppError::NotFound(_))));
        assert!(matches!(h.drive.files.download(file.id).await, Err(AppError::NotFound(_))));
        assert!(h.drive.files.get(file.id).await.unwrap().is_deleted);
    }

    #[tokio::test]
    async fn restore_within_window_and_after() {
        let h = harness().await;
        let caps = Capabilities::all();
        let scope = Scope::Personal(USER.into());
        let bytes = || InitialContent::Bytes(Bytes::from_static(b"hello"));

        let file = h.drive.files.create_file(upload(scope.clone(), "a.txt"), bytes(), USER, caps).await.unwrap();
        h.drive.files.soft_delete(file.id, USER, caps).await.unwrap();
        h.clock.advance(Duration::days(29));
        let restored = h.drive.files.restore(file.id, USER, caps).await.unwrap();
        assert!(!restored.is_deleted);
        assert_eq!(restored.deleted_at, None);

        // Restoring an active file changes nothing
        let again = h.drive.files.restore(file.id, USER, caps).await.unwrap();
        assert_eq!(again, restored);

        h.drive.files.soft_delete(file.id, USER, caps).await.unwrap();
        h.clock.advance(Duration::days(30));
        let err = h.drive.files.restore(file.id, USER, caps).await.unwrap_err();
        assert!(matches!(err, AppError::Expired(_)));
    }

    #[tokio::test]
    async fn team_retention_override_applies_to_restore() {
        let h = harness().await;
        let caps = Capabilities::all();
        let team_id = Uuid::new_v4();
        h.drive.bin.set_retention_days(team_id, 7, caps).await.unwrap();

        let file = h
            .drive
            .files
            .create_file(
                upload(Scope::Team(team_id), "a.txt"),
                InitialContent::Bytes(Bytes::from_static(b"x")),
                USER,
                caps,
            )
            .await
            .unwrap();
        h.drive.files.soft_delete(file.id, USER, caps).await.unwrap();
        h.clock.advance(Duration::days(7));

        assert!(matches!(
            h.drive.files.restore(file.id, USER, caps).await,
            Err(AppError::Expired(_))
        ));
    }

    #[tokio::test]
    async fn personal_folder_placement_is_rejected() {
        let h = harness().await;
        let new = NewFile {
            scope: Scope::Personal(USER.into()),
            folder_id: Some(Uuid::new_v4()),
            name: "a.txt".into(),
            mime_type: None,
        };
        let err = h
            .drive
            .files
            .create_file(new, InitialContent::Bytes(Bytes::from_static(b"x")), USER, Capabilities::all())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
