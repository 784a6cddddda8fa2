use std::{collections::HashMap, sync::Arc};

use chrono::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::{LifecycleContext, SYSTEM_ACTOR, require};
use crate::{
    error::AppError,
    models::{
        Activity, ActivityAction, BinEntry, Capabilities, File, PurgeFailure, PurgeReport, Scope,
    },
};

const MAX_RETENTION_DAYS: i64 = 3650;

/// Recycle bin: Active -> Deleted -> Purged.
#[derive(Clone)]
pub struct BinManager {
    ctx: Arc<LifecycleContext>,
}

impl BinManager {
    pub(super) fn new(ctx: Arc<LifecycleContext>) -> Self {
        Self { ctx }
    }

    pub async fn retention_days(&self, scope: &Scope) -> Result<i64, AppError> {
        self.ctx.retention_days(scope).await
    }

    pub async fn set_retention_days(
        &self,
        team_id: Uuid,
        days: i64,
        caps: Capabilities,
    ) -> Result<(), AppError> {
        require(caps.can_delete, "change bin retention")?;
        if !(1..=MAX_RETENTION_DAYS).contains(&days) {
            return Err(AppError::BadRequest(format!(
                "retention must be between 1 and {} days",
                MAX_RETENTION_DAYS
            )));
        }
        self.ctx.repo.set_retention_days(team_id, days).await?;
        info!("Team {} bin retention set to {} days", team_id, days);
        Ok(())
    }

    /// Binned files in scope, most recently deleted first.
    pub async fn list_bin(&self, scope: &Scope) -> Result<Vec<BinEntry>, AppError> {
        let retention = Duration::days(self.ctx.retention_days(scope).await?);
        let now = self.ctx.clock.now();

        let entries = self
            .ctx
            .repo
            .list_deleted(Some(scope))
            .await?
            .into_iter()
            .filter_map(|file| {
                let expires_at = file.deleted_at? + retention;
                let days_remaining = (expires_at - now).num_days().max(0);
                Some(BinEntry { file, expires_at, days_remaining })
            })
            .collect();
        Ok(entries)
    }

    /// Permanently destroys a binned file, its versions and its stored bytes.
    pub async fn purge(&self, file_id: Uuid, actor: &str, caps: Capabilities) -> Result<File, AppError> {
        require(caps.can_delete, "purge files")?;
        let file = self.ctx.file(file_id).await?;
        self.purge_file(file, actor).await
    }

    /// Purges every binned file whose retention window has elapsed.
    /// Failures are reported per file; the sweep carries on past them.
    pub async fn sweep(&self) -> Result<PurgeReport, AppError> {
        let now = self.ctx.clock.now();
        let mut retention: HashMap<Option<Uuid>, Duration> = HashMap::new();
        let mut expired = Vec::new();

        for file in self.ctx.repo.list_deleted(None).await? {
            let Some(deleted_at) = file.deleted_at else {
                continue;
            };
            let window = match retention.get(&file.team_id) {
                Some(window) => *window,
                None => {
                    let window = Duration::days(self.ctx.retention_days(&file.scope()).await?);
                    retention.insert(file.team_id, window);
                    window
                }
            };
            if now - deleted_at >= window {
                expired.push(file);
            }
        }

        let report = self.purge_all(expired, SYSTEM_ACTOR).await;
        info!(
            "Bin sweep purged {} file(s), {} failure(s)",
            report.purged.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Purges everything in the scope's bin now, regardless of retention.
    pub async fn empty_bin(
        &self,
        scope: &Scope,
        actor: &str,
        caps: Capabilities,
    ) -> Result<PurgeReport, AppError> {
        require(caps.can_delete, "empty the bin")?;
        let binned = self.ctx.repo.list_deleted(Some(scope)).await?;
        Ok(self.purge_all(binned, actor).await)
    }

    async fn purge_all(&self, files: Vec<File>, actor: &str) -> PurgeReport {
        let mut report = PurgeReport::default();
        for file in files {
            let file_id = file.id;
            match self.purge_file(file, actor).await {
                Ok(_) => report.purged.push(file_id),
                Err(e) => {
                    warn!("Failed to purge file {}: {}", file_id, e);
                    report.failed.push(PurgeFailure { file_id, error: e.to_string() });
                }
            }
        }
        report
    }

    async fn purge_file(&self, file: File, actor: &str) -> Result<File, AppError> {
        if !file.is_deleted {
            return Err(AppError::InvalidState(format!(
                "file {} must be in the bin before it can be purged",
                file.id
            )));
        }

        let activity = Activity::for_file(
            &file,
            actor,
            ActivityAction::PurgeFile,
            format!("Permanently deleted \"{}\"", file.name),
            self.ctx.clock.now(),
        );
        // The record goes first, so a racing restore either wins outright or finds nothing
        let purged = self.ctx.repo.delete_file(file.id, &activity).await?;

        for key in &purged.blob_keys {
            self.ctx.discard_blob(purged.file.storage_kind, key).await;
        }
        info!("File purged: {} ({} blob(s))", purged.file.id, purged.blob_keys.len());
        Ok(purged.file)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{
        lifecycle::test_support::{Harness, harness},
        models::{InitialContent, NewContent, NewFile},
    };

    const USER: &str = "carol";

    async fn upload(h: &Harness, scope: &Scope, name: &str) -> File {
        h.drive
            .files
            .create_file(
                NewFile { scope: scope.clone(), folder_id: None, name: name.into(), mime_type: None },
                InitialContent::Bytes(Bytes::from(format!("content of {name}"))),
                USER,
                Capabilities::all(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn purge_destroys_record_versions_and_blobs() {
        let h = harness().await;
        let caps = Capabilities::all();
        let scope = Scope::Team(Uuid::new_v4());
        let file = upload(&h, &scope, "notes.txt").await;
        h.drive
            .versions
            .append_version(file.id, NewContent::Text("second".into()), USER, caps)
            .await
            .unwrap();
        let current = h.drive.files.get(file.id).await.unwrap();

        h.drive.files.soft_delete(file.id, USER, caps).await.unwrap();
        h.drive.bin.purge(file.id, USER, caps).await.unwrap();

        assert!(!h.blob_path(&current.storage_key).exists());
        assert!(matches!(h.drive.files.get(file.id).await, Err(AppError::NotFound(_))));
        assert!(matches!(h.drive.versions.history(file.id).await, Err(AppError::NotFound(_))));
        assert!(matches!(h.drive.versions.latest(file.id).await, Err(AppError::NotFound(_))));
        assert!(matches!(h.drive.files.view(file.id).await, Err(AppError::NotFound(_))));
        assert!(matches!(
            h.drive.files.restore(file.id, USER, caps).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            h.drive.files.soft_delete(file.id, USER, caps).await,
            Err(AppError::NotFound(_))
        ));

        // Purge is not idempotent
        assert!(matches!(h.drive.bin.purge(file.id, USER, caps).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn purge_removes_every_binary_version_blob() {
        let h = harness().await;
        let caps = Capabilities::all();
        let scope = Scope::Personal(USER.into());
        let file = upload(&h, &scope, "scan.png").await;

        let mut keys = Vec::new();
        for i in 0..3u8 {
            let v = h
                .drive
                .versions
                .append_version(file.id, NewContent::Binary(Bytes::from(vec![i; 4])), USER, caps)
                .await
                .unwrap();
            keys.push(v.content.blob_key().unwrap().to_string());
        }
        assert!(keys.iter().all(|k| h.blob_path(k).exists()));

        h.drive.files.soft_delete(file.id, USER, caps).await.unwrap();
        h.drive.bin.purge(file.id, USER, caps).await.unwrap();
        assert!(keys.iter().all(|k| !h.blob_path(k).exists()));
    }

    #[tokio::test]
    async fn active_files_cannot_be_purged() {
        let h = harness().await;
        let caps = Capabilities::all();
        let file = upload(&h, &Scope::Personal(USER.into()), "a.txt").await;

        let err = h.drive.bin.purge(file.id, USER, caps).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
        assert!(h.drive.files.get(file.id).await.is_ok());
    }

    #[tokio::test]
    async fn expired_file_is_swept_not_restored() {
        let h = harness().await;
        let caps = Capabilities::all();
        let file = upload(&h, &Scope::Team(Uuid::new_v4()), "notes.txt").await;

        h.drive.files.soft_delete(file.id, USER, caps).await.unwrap();
        h.clock.advance(Duration::days(31));

        assert!(matches!(
            h.drive.files.restore(file.id, USER, caps).await,
            Err(AppError::Expired(_))
        ));

        let report = h.drive.bin.sweep().await.unwrap();
        assert_eq!(report.purged, vec![file.id]);
        assert!(report.failed.is_empty());
        assert!(matches!(h.drive.files.view(file.id).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn sweep_respects_per_team_retention() {
        let h = harness().await;
        let caps = Capabilities::all();
        let short = Uuid::new_v4();
        let long = Scope::Team(Uuid::new_v4());
        h.drive.bin.set_retention_days(short, 3, caps).await.unwrap();

        let a = upload(&h, &Scope::Team(short), "a.txt").await;
        let b = upload(&h, &long, "b.txt").await;
        let c = upload(&h, &long, "c.txt").await;
        for id in [a.id, b.id] {
            h.drive.files.soft_delete(id, USER, caps).await.unwrap();
        }
        h.clock.advance(Duration::days(5));

        let report = h.drive.bin.sweep().await.unwrap();
        assert_eq!(report.purged, vec![a.id]);
        assert!(h.drive.files.get(b.id).await.unwrap().is_deleted);
        assert!(!h.drive.files.get(c.id).await.unwrap().is_deleted);
    }

    #[tokio::test]
    async fn empty_bin_purges_only_deleted_files_in_scope() {
        let h = harness().await;
        let caps = Capabilities::all();
        let team = Scope::Team(Uuid::new_v4());
        let elsewhere = Scope::Team(Uuid::new_v4());

        let mut deleted = Vec::new();
        for name in ["a.txt", "b.txt", "c.txt"] {
            let file = upload(&h, &team, name).await;
            h.drive.files.soft_delete(file.id, USER, caps).await.unwrap();
            deleted.push(file.id);
        }
        let active: Vec<Uuid> = [upload(&h, &team, "d.txt").await, upload(&h, &team, "e.txt").await]
            .iter()
            .map(|f| f.id)
            .collect();
        let foreign = upload(&h, &elsewhere, "f.txt").await;
        h.drive.files.soft_delete(foreign.id, USER, caps).await.unwrap();

        let mut report = h.drive.bin.empty_bin(&team, USER, caps).await.unwrap();
        report.purged.sort();
        deleted.sort();
        assert_eq!(report.purged, deleted);

        for id in active {
            assert!(!h.drive.files.get(id).await.unwrap().is_deleted);
        }
        assert!(h.drive.files.get(foreign.id).await.unwrap().is_deleted);
        assert!(h.drive.bin.list_bin(&team).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bin_listing_reports_time_left() {
        let h = harness().await;
        let caps = Capabilities::all();
        let scope = Scope::Personal(USER.into());
        let file = upload(&h, &scope, "a.txt").await;

        h.drive.files.soft_delete(file.id, USER, caps).await.unwrap();
        h.clock.advance(Duration::days(10));

        let entries = h.drive.bin.list_bin(&scope).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].days_remaining, 20);
        assert_eq!(entries[0].expires_at, entries[0].file.deleted_at.unwrap() + Duration::days(30));
    }

    #[tokio::test]
    async fn bin_operations_require_delete_capability() {
        let h = harness().await;
        let scope = Scope::Team(Uuid::new_v4());
        let caps = Capabilities { can_delete: false, ..Capabilities::all() };

        assert!(matches!(
            h.drive.bin.empty_bin(&scope, USER, caps).await,
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            h.drive.bin.set_retention_days(Uuid::new_v4(), 10, caps).await,
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            h.drive.bin.set_retention_days(Uuid::new_v4(), 0, Capabilities::all()).await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_purge_and_restore_never_leave_a_file_without_bytes() {
        let h = harness().await;
        let caps = Capabilities::all();
        let scope = Scope::Team(Uuid::new_v4());

        for i in 0..24 {
            let file = upload(&h, &scope, &format!("race-{i}.txt")).await;
            h.drive.files.soft_delete(file.id, USER, caps).await.unwrap();

            let id = file.id;
            let bin = h.drive.bin.clone();
            let files = h.drive.files.clone();
            let purge = tokio::spawn(async move { bin.purge(id, USER, caps).await });
            let restore = tokio::spawn(async move { files.restore(id, USER, caps).await });
            let purged = purge.await.unwrap();
            let restored = restore.await.unwrap();

            match h.drive.files.get(id).await {
                Ok(survivor) => {
                    assert!(!survivor.is_deleted);
                    assert!(matches!(purged, Err(AppError::InvalidState(_))));
                    assert!(restored.is_ok());
                    assert!(h.drive.files.download(id).await.is_ok());
                }
                Err(AppError::NotFound(_)) => {
                    assert!(purged.is_ok());
                    assert!(matches!(restored, Err(AppError::NotFound(_))));
                    assert!(!h.blob_path(&file.storage_key).exists());
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    #[tokio::test]
    async fn storage_failure_during_purge_still_removes_the_record() {
        let h = harness().await;
        let caps = Capabilities::all();
        let file = upload(&h, &Scope::Personal(USER.into()), "notes.txt").await;
        h.drive.files.soft_delete(file.id, USER, caps).await.unwrap();

        // Every blob delete now fails
        let files_dir = h.dir.path().join("files");
        std::fs::remove_dir_all(&files_dir).unwrap();
        std::fs::write(&files_dir, b"not a directory").unwrap();

        h.drive.bin.purge(file.id, USER, caps).await.unwrap();
        assert!(matches!(h.drive.files.get(file.id).await, Err(AppError::NotFound(_))));
        assert!(matches!(
            h.drive.files.restore(file.id, USER, caps).await,
            Err(AppError::NotFound(_))
        ));
    }
}
