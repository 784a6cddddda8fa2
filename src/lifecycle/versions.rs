use std::sync::Arc;

use bytes::Bytes;
use tracing::{info, warn};
use uuid::Uuid;

use super::{LifecycleContext, require};
use crate::{
    error::AppError,
    models::{Activity, ActivityAction, Capabilities, FileKind, NewContent, Version, VersionContent},
    repository::VersionDraft,
    storage::generate_key,
    utils::calculate_sha256,
};

/// Append-only, numbered content history per file.
#[derive(Clone)]
pub struct VersionLedger {
    ctx: Arc<LifecycleContext>,
}

impl VersionLedger {
    pub(super) fn new(ctx: Arc<LifecycleContext>) -> Self {
        Self { ctx }
    }

    /// Records new content for an active file.
    ///
    /// The bytes are written to a fresh blob before any metadata changes, so a
    /// backend failure aborts the edit with nothing recorded. The number is
    /// assigned inside the repository transaction.
    pub async fn append_version(
        &self,
        file_id: Uuid,
        content: NewContent,
        actor: &str,
        caps: Capabilities,
    ) -> Result<Version, AppError> {
        require(caps.can_edit, "edit files")?;
        let file = self.ctx.active_file(file_id).await?;

        let bytes = match &content {
            NewContent::Text(text) => Bytes::from(text.clone()),
            NewContent::Binary(_) if file.kind == FileKind::Text => {
                return Err(AppError::BadRequest("text files only accept text content".into()));
            }
            NewContent::Binary(bytes) => bytes.clone(),
        };
        self.ctx.check_size(bytes.len())?;

        let kind = file.storage_kind;
        let key = generate_key(kind, &file.scope(), &file.name);
        self.ctx.write_blob(kind, &key, bytes.clone()).await?;

        let now = self.ctx.clock.now();
        let draft = VersionDraft {
            content: match content {
                NewContent::Text(text) => VersionContent::Text(text),
                NewContent::Binary(_) => VersionContent::Blob(key.clone()),
            },
            created_by: actor.to_string(),
            created_at: now,
            storage_key: key.clone(),
            file_size: bytes.len() as i64,
            checksum: calculate_sha256(&bytes),
        };
        let activity = Activity::for_file(
            &file,
            actor,
            ActivityAction::EditFile,
            format!("Edited \"{}\"", file.name),
            now,
        );

        let appended = match self.ctx.repo.append_version(file_id, &draft, &activity).await {
            Ok(appended) => appended,
            Err(e) => {
                self.ctx.discard_blob(kind, &key).await;
                return Err(e);
            }
        };

        // The superseded blob stays only while a version still points at it
        match self.ctx.repo.blob_referenced(file_id, &appended.previous_key).await {
            Ok(false) => self.ctx.discard_blob(kind, &appended.previous_key).await,
            Ok(true) => {}
            Err(e) => warn!("Could not check references to {}: {}", appended.previous_key, e),
        }

        info!(
            "File {} now at version {}",
            file_id, appended.version.version_number
        );
        Ok(appended.version)
    }

    /// Highest-numbered version, if the file has any.
    pub async fn latest(&self, file_id: Uuid) -> Result<Option<Version>, AppError> {
        self.ctx.file(file_id).await?;
        self.ctx.repo.latest_version(file_id).await
    }

    /// All versions, newest first.
    pub async fn history(&self, file_id: Uuid) -> Result<Vec<Version>, AppError> {
        self.ctx.file(file_id).await?;
        self.ctx.repo.list_versions(file_id).await
    }
}
