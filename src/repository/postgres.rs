use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{AppendedVersion, FileRepository, PurgedFile, Transition, VersionDraft};
use crate::{
    error::AppError,
    models::{Activity, File, Folder, Scope, Version, VersionContent},
};

#[derive(Debug, FromRow)]
struct FileRow {
    id: Uuid,
    name: String,
    storage_key: String,
    storage_kind: String,
    file_size: i64,
    kind: String,
    mime_type: String,
    checksum: Option<String>,
    team_id: Option<Uuid>,
    folder_id: Option<Uuid>,
    uploaded_by: String,
    is_deleted: bool,
    deleted_at: Option<DateTime<Utc>>,
    version: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<FileRow> for File {
    type Error = AppError;

    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        Ok(File {
            id: row.id,
            name: row.name,
            storage_key: row.storage_key,
            storage_kind: row.storage_kind.parse().map_err(AppError::InternalServerError)?,
            file_size: row.file_size,
            kind: row.kind.parse().map_err(AppError::InternalServerError)?,
            mime_type: row.mime_type,
            checksum: row.checksum,
            team_id: row.team_id,
            folder_id: row.folder_id,
            uploaded_by: row.uploaded_by,
            is_deleted: row.is_deleted,
            deleted_at: row.deleted_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct VersionRow {
    id: Uuid,
    file_id: Uuid,
    version_number: i32,
    content: Option<String>,
    blob_key: Option<String>,
    created_by: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<VersionRow> for Version {
    type Error = AppError;

    fn try_from(row: VersionRow) -> Result<Self, Self::Error> {
        let content = match (row.content, row.blob_key) {
            (Some(text), None) => VersionContent::Text(text),
            (None, Some(key)) => VersionContent::Blob(key),
            _ => {
                return Err(AppError::InternalServerError(format!(
                    "version {} must hold exactly one of content or blob_key",
                    row.id
                )))
            }
        };
        Ok(Version {
            id: row.id,
            file_id: row.file_id,
            version_number: row.version_number,
            content,
            created_by: row.created_by,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ActivityRow {
    id: Uuid,
    team_id: Option<Uuid>,
    user_id: String,
    action: String,
    target_type: String,
    target_id: Uuid,
    description: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ActivityRow> for Activity {
    type Error = AppError;

    fn try_from(row: ActivityRow) -> Result<Self, Self::Error> {
        Ok(Activity {
            id: row.id,
            team_id: row.team_id,
            user_id: row.user_id,
            action: row.action.parse().map_err(AppError::InternalServerError)?,
            target_type: row.target_type,
            target_id: row.target_id,
            description: row.description,
            created_at: row.created_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, AppError>
where
    T: TryFrom<R, Error = AppError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn map_unique_violation(err: sqlx::Error, what: impl FnOnce() -> String) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => AppError::Conflict(what()),
        _ => AppError::DatabaseError(err),
    }
}

fn push_scope(builder: &mut QueryBuilder<'_, Postgres>, scope: &Scope) {
    match scope {
        Scope::Team(team_id) => {
            builder.push(" AND team_id = ");
            builder.push_bind(*team_id);
        }
        Scope::Personal(user) => {
            builder.push(" AND team_id IS NULL AND uploaded_by = ");
            builder.push_bind(user.clone());
        }
    }
}

async fn insert_activity(conn: &mut PgConnection, activity: &Activity) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO activities (
            id, team_id, user_id, action, target_type, target_id, description, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(activity.id)
    .bind(activity.team_id)
    .bind(&activity.user_id)
    .bind(activity.action.as_str())
    .bind(&activity.target_type)
    .bind(activity.target_id)
    .bind(&activity.description)
    .bind(activity.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn fetch_file(conn: &mut PgConnection, id: Uuid) -> Result<Option<File>, AppError> {
    sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE id = $1")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .map(File::try_from)
        .transpose()
}

/// PostgreSQL-backed record store. Schema lives in `sql/schema.sql`.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FileRepository for PgRepository {
    async fn insert_file(
        &self,
        file: &File,
        initial: Option<&Version>,
        activity: &Activity,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let key_in_use: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(SELECT 1 FROM files WHERE storage_key = $1)
                OR EXISTS(SELECT 1 FROM file_versions WHERE blob_key = $1)
            "#,
        )
        .bind(&file.storage_key)
        .fetch_one(&mut *tx)
        .await?;
        if key_in_use {
            return Err(AppError::Conflict(format!(
                "stored object {} already belongs to another file",
                file.storage_key
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO files (
                id, name, storage_key, storage_kind, file_size, kind, mime_type, checksum,
                team_id, folder_id, uploaded_by, is_deleted, deleted_at, version,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(file.id)
        .bind(&file.name)
        .bind(&file.storage_key)
        .bind(file.storage_kind.as_str())
        .bind(file.file_size)
        .bind(file.kind.as_str())
        .bind(&file.mime_type)
        .bind(&file.checksum)
        .bind(file.team_id)
        .bind(file.folder_id)
        .bind(&file.uploaded_by)
        .bind(file.is_deleted)
        .bind(file.deleted_at)
        .bind(file.version)
        .bind(file.created_at)
        .bind(file.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            map_unique_violation(e, || format!("file {} or its stored object already exists", file.id))
        })?;

        if let Some(version) = initial {
            sqlx::query(
                r#"
                INSERT INTO file_versions (
                    id, file_id, version_number, content, blob_key, created_by, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(version.id)
            .bind(version.file_id)
            .bind(version.version_number)
            .bind(version.content.text())
            .bind(version.content.blob_key())
            .bind(&version.created_by)
            .bind(version.created_at)
            .execute(&mut *tx)
            .await?;
        }

        insert_activity(&mut tx, activity).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_file(&self, id: Uuid) -> Result<Option<File>, AppError> {
        let mut conn = self.pool.acquire().await?;
        fetch_file(&mut conn, id).await
    }

    async fn list_active(&self, scope: &Scope, folder_id: Option<Uuid>) -> Result<Vec<File>, AppError> {
        let mut builder = QueryBuilder::new("SELECT * FROM files WHERE NOT is_deleted");
        push_scope(&mut builder, scope);
        builder.push(" AND folder_id IS NOT DISTINCT FROM ");
        builder.push_bind(folder_id);
        builder.push(" ORDER BY updated_at DESC, created_at DESC");

        let rows = builder.build_query_as::<FileRow>().fetch_all(&self.pool).await?;
        convert_all(rows)
    }

    async fn list_deleted(&self, scope: Option<&Scope>) -> Result<Vec<File>, AppError> {
        let mut builder = QueryBuilder::new("SELECT * FROM files WHERE is_deleted");
        if let Some(scope) = scope {
            push_scope(&mut builder, scope);
        }
        builder.push(" ORDER BY deleted_at DESC");

        let rows = builder.build_query_as::<FileRow>().fetch_all(&self.pool).await?;
        convert_all(rows)
    }

    async fn mark_deleted(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        activity: &Activity,
    ) -> Result<Transition, AppError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, FileRow>(
            r#"
            UPDATE files SET is_deleted = TRUE, deleted_at = $2
            WHERE id = $1 AND NOT is_deleted
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?;

        match updated {
            Some(row) => {
                insert_activity(&mut tx, activity).await?;
                tx.commit().await?;
                Ok(Transition::Changed(row.try_into()?))
            }
            None => {
                let file = fetch_file(&mut tx, id).await?.ok_or_else(|| AppError::file_not_found(id))?;
                Ok(Transition::Unchanged(file))
            }
        }
    }

    async fn clear_deleted(&self, id: Uuid, activity: &Activity) -> Result<Transition, AppError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, FileRow>(
            r#"
            UPDATE files SET is_deleted = FALSE, deleted_at = NULL
            WHERE id = $1 AND is_deleted
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        match updated {
            Some(row) => {
                insert_activity(&mut tx, activity).await?;
                tx.commit().await?;
                Ok(Transition::Changed(row.try_into()?))
            }
            None => {
                let file = fetch_file(&mut tx, id).await?.ok_or_else(|| AppError::file_not_found(id))?;
                Ok(Transition::Unchanged(file))
            }
        }
    }

    async fn append_version(
        &self,
        file_id: Uuid,
        draft: &VersionDraft,
        activity: &Activity,
    ) -> Result<AppendedVersion, AppError> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes appends to this file until commit
        let locked: Option<(bool, String)> =
            sqlx::query_as("SELECT is_deleted, storage_key FROM files WHERE id = $1 FOR UPDATE")
                .bind(file_id)
                .fetch_optional(&mut *tx)
                .await?;
        let previous_key = match locked {
            Some((false, key)) => key,
            _ => return Err(AppError::file_not_found(file_id)),
        };

        let current: Option<i32> =
            sqlx::query_scalar("SELECT MAX(version_number) FROM file_versions WHERE file_id = $1")
                .bind(file_id)
                .fetch_one(&mut *tx)
                .await?;
        let next = current.map_or(1, |n| n + 1);

        let version_row = sqlx::query_as::<_, VersionRow>(
            r#"
            INSERT INTO file_versions (
                id, file_id, version_number, content, blob_key, created_by, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(file_id)
        .bind(next)
        .bind(draft.content.text())
        .bind(draft.content.blob_key())
        .bind(&draft.created_by)
        .bind(draft.created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            map_unique_violation(e, || format!("version {next} of file {file_id} already exists"))
        })?;

        let file_row = sqlx::query_as::<_, FileRow>(
            r#"
            UPDATE files
            SET version = $2, storage_key = $3, file_size = $4, checksum = $5, updated_at = $6
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(file_id)
        .bind(next)
        .bind(&draft.storage_key)
        .bind(draft.file_size)
        .bind(&draft.checksum)
        .bind(draft.created_at)
        .fetch_one(&mut *tx)
        .await?;

        insert_activity(&mut tx, activity).await?;
        tx.commit().await?;

        Ok(AppendedVersion {
            file: file_row.try_into()?,
            version: version_row.try_into()?,
            previous_key,
        })
    }

    async fn latest_version(&self, file_id: Uuid) -> Result<Option<Version>, AppError> {
        sqlx::query_as::<_, VersionRow>(
            "SELECT * FROM file_versions WHERE file_id = $1 ORDER BY version_number DESC LIMIT 1",
        )
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Version::try_from)
        .transpose()
    }

    async fn list_versions(&self, file_id: Uuid) -> Result<Vec<Version>, AppError> {
        let rows = sqlx::query_as::<_, VersionRow>(
            "SELECT * FROM file_versions WHERE file_id = $1 ORDER BY version_number DESC",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn blob_referenced(&self, file_id: Uuid, key: &str) -> Result<bool, AppError> {
        let referenced: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM file_versions WHERE file_id = $1 AND blob_key = $2)",
        )
        .bind(file_id)
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(referenced)
    }

    async fn delete_file(&self, id: Uuid, activity: &Activity) -> Result<PurgedFile, AppError> {
        let mut tx = self.pool.begin().await?;

        // Versions are read before the cascade removes them
        let version_rows = sqlx::query_as::<_, VersionRow>(
            r#"
            SELECT v.* FROM file_versions v
            JOIN files f ON f.id = v.file_id
            WHERE v.file_id = $1 AND f.is_deleted
            FOR UPDATE OF f
            "#,
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        let deleted = sqlx::query_as::<_, FileRow>(
            "DELETE FROM files WHERE id = $1 AND is_deleted RETURNING *",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = deleted else {
            return match fetch_file(&mut tx, id).await? {
                Some(_) => Err(AppError::InvalidState(format!("file {id} is not in the bin"))),
                None => Err(AppError::file_not_found(id)),
            };
        };

        insert_activity(&mut tx, activity).await?;
        tx.commit().await?;

        let versions: Vec<Version> = convert_all(version_rows)?;
        Ok(PurgedFile::new(row.try_into()?, &versions))
    }

    async fn insert_folder(&self, folder: &Folder, activity: &Activity) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO folders (id, name, team_id, parent_id, created_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(folder.id)
        .bind(&folder.name)
        .bind(folder.team_id)
        .bind(folder.parent_id)
        .bind(&folder.created_by)
        .bind(folder.created_at)
        .execute(&mut *tx)
        .await?;

        insert_activity(&mut tx, activity).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_folder(&self, id: Uuid) -> Result<Option<Folder>, AppError> {
        Ok(sqlx::query_as::<_, Folder>("SELECT * FROM folders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_folders(&self, team_id: Uuid, parent_id: Option<Uuid>) -> Result<Vec<Folder>, AppError> {
        Ok(sqlx::query_as::<_, Folder>(
            r#"
            SELECT * FROM folders
            WHERE team_id = $1 AND parent_id IS NOT DISTINCT FROM $2
            ORDER BY name ASC
            "#,
        )
        .bind(team_id)
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn set_folder_parent(
        &self,
        id: Uuid,
        parent_id: Option<Uuid>,
        activity: &Activity,
    ) -> Result<Folder, AppError> {
        let mut tx = self.pool.begin().await?;

        // Moves within a team are serialized so each sees the tree the last one left
        let locked: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM folders
            WHERE team_id = (SELECT team_id FROM folders WHERE id = $1)
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;
        if !locked.contains(&id) {
            return Err(AppError::folder_not_found(id));
        }

        if let Some(parent_id) = parent_id {
            let creates_cycle: bool = sqlx::query_scalar(
                r#"
                WITH RECURSIVE lineage AS (
                    SELECT id, parent_id FROM folders WHERE id = $2
                    UNION
                    SELECT f.id, f.parent_id FROM folders f
                    JOIN lineage l ON f.id = l.parent_id
                )
                SELECT EXISTS(SELECT 1 FROM lineage WHERE id = $1)
                "#,
            )
            .bind(id)
            .bind(parent_id)
            .fetch_one(&mut *tx)
            .await?;
            if creates_cycle {
                return Err(AppError::InvalidState(format!(
                    "folder {} cannot move into itself or its own subfolder",
                    id
                )));
            }
        }

        let folder = sqlx::query_as::<_, Folder>(
            "UPDATE folders SET parent_id = $2 WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(parent_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::folder_not_found(id))?;

        insert_activity(&mut tx, activity).await?;
        tx.commit().await?;
        Ok(folder)
    }

    async fn retention_days(&self, team_id: Uuid) -> Result<Option<i64>, AppError> {
        Ok(sqlx::query_scalar("SELECT retention_days FROM team_settings WHERE team_id = $1")
            .bind(team_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn set_retention_days(&self, team_id: Uuid, days: i64) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO team_settings (team_id, retention_days) VALUES ($1, $2)
            ON CONFLICT (team_id) DO UPDATE SET retention_days = EXCLUDED.retention_days
            "#,
        )
        .bind(team_id)
        .bind(days)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_activity(&self, scope: &Scope, limit: i64) -> Result<Vec<Activity>, AppError> {
        let mut builder = QueryBuilder::new("SELECT * FROM activities WHERE TRUE");
        match scope {
            Scope::Team(team_id) => {
                builder.push(" AND team_id = ");
                builder.push_bind(*team_id);
            }
            Scope::Personal(user) => {
                builder.push(" AND team_id IS NULL AND user_id = ");
                builder.push_bind(user.clone());
            }
        }
        builder.push(" ORDER BY created_at DESC LIMIT ");
        builder.push_bind(limit);

        let rows = builder.build_query_as::<ActivityRow>().fetch_all(&self.pool).await?;
        convert_all(rows)
    }
}
