use axum::{
    Json,
    extract::{FromRequestParts, Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode, header, request::Parts},
    response::Response,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::{
    error::AppError,
    models::*,
    state::AppState,
};

const USER_HEADER: &str = "x-user-id";
const CAPABILITIES_HEADER: &str = "x-capabilities";
const DEFAULT_ACTIVITY_LIMIT: i64 = 50;

/// Acting user and rights, as asserted by the upstream gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct Actor {
    pub user_id: String,
    pub caps: Capabilities,
}

impl Actor {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, AppError> {
        let user_id = headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::BadRequest(format!("missing {} header", USER_HEADER)))?
            .to_string();

        let caps = match headers.get(CAPABILITIES_HEADER) {
            None => Capabilities::read_only(),
            Some(value) => {
                let list = value.to_str().map_err(|_| {
                    AppError::BadRequest(format!("{} must be ASCII", CAPABILITIES_HEADER))
                })?;
                Capabilities::parse(list).map_err(AppError::BadRequest)?
            }
        };

        Ok(Self { user_id, caps })
    }

    /// Team scope when a team is named, the actor's personal space otherwise.
    fn scope(&self, team_id: Option<Uuid>) -> Scope {
        match team_id {
            Some(team_id) => Scope::Team(team_id),
            None => Scope::Personal(self.user_id.clone()),
        }
    }
}

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Actor::from_headers(&parts.headers)
    }
}

#[derive(Debug, Deserialize)]
pub struct ScopeQuery {
    pub team_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    pub team_id: Option<Uuid>,
    pub folder_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct FolderQuery {
    pub team_id: Uuid,
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    pub team_id: Option<Uuid>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateFolderRequest {
    pub team_id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct MoveFolderRequest {
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RetentionRequest {
    pub days: i64,
}

#[derive(Debug, Serialize)]
pub struct RetentionResponse {
    pub team_id: Uuid,
    pub retention_days: i64,
}

#[derive(Debug, Serialize)]
pub struct ViewResponse {
    #[serde(flatten)]
    pub file: FileResponse,
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BinItemResponse {
    #[serde(flatten)]
    pub file: FileResponse,
    pub expires_at: DateTime<Utc>,
    pub days_remaining: i64,
}

impl From<BinEntry> for BinItemResponse {
    fn from(entry: BinEntry) -> Self {
        Self {
            file: entry.file.into(),
            expires_at: entry.expires_at,
            days_remaining: entry.days_remaining,
        }
    }
}

fn optional_uuid(name: &str, value: &str) -> Result<Option<Uuid>, AppError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    Uuid::parse_str(value)
        .map(Some)
        .map_err(|_| AppError::BadRequest(format!("{} is not a valid id", name)))
}

/// Upload a file using multipart/form-data.
///
/// Fields: `file` (required), `team_id` and `folder_id` (optional). Without a
/// team the file lands in the uploader's personal space.
pub async fn upload_file(
    State(state): State<AppState>,
    actor: Actor,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<FileResponse>), AppError> {
    let mut file_data: Option<Bytes> = None;
    let mut original_filename: Option<String> = None;
    let mut mime_type: Option<String> = None;
    let mut team_id: Option<Uuid> = None;
    let mut folder_id: Option<Uuid> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        error!("Error parsing multipart: {}", e);
        AppError::BadRequest(format!("Failed to parse multipart form: {}", e))
    })? {
        match field.name().unwrap_or("") {
            "file" => {
                original_filename = field.file_name().map(|s| s.to_string());
                mime_type = field.content_type().map(|s| s.to_string());
                let data = field.bytes().await.map_err(|e| {
                    error!("Error reading file bytes: {}", e);
                    AppError::BadRequest(format!("Failed to read the file: {}", e))
                })?;
                file_data = Some(data);
            }
            name @ ("team_id" | "folder_id") => {
                let name = name.to_string();
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Failed to read {}: {}", name, e)))?;
                let id = optional_uuid(&name, &text)?;
                if name == "team_id" {
                    team_id = id;
                } else {
                    folder_id = id;
                }
            }
            _ => {}
        }
    }

    let file_data = file_data.ok_or_else(|| AppError::BadRequest("No file provided".into()))?;
    let name = original_filename.ok_or_else(|| AppError::BadRequest("No file provided".into()))?;

    let new = NewFile {
        scope: actor.scope(team_id),
        folder_id,
        name,
        mime_type,
    };
    let file = state
        .drive
        .files
        .create_file(new, InitialContent::Bytes(file_data), &actor.user_id, actor.caps)
        .await?;

    Ok((StatusCode::CREATED, Json(file.into())))
}

/// Active files directly inside a folder, or at the scope root.
pub async fn list_files(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<ListFilesQuery>,
) -> Result<Json<Vec<FileResponse>>, AppError> {
    let files = state
        .drive
        .files
        .list_active(&actor.scope(query.team_id), query.folder_id)
        .await?;
    Ok(Json(files.into_iter().map(FileResponse::from).collect()))
}

/// Get metadata for a single file by its ID.
pub async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<FileResponse>, AppError> {
    let file = state.drive.files.get(id).await?;
    Ok(Json(file.into()))
}

pub async fn view_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ViewResponse>, AppError> {
    let view = state.drive.files.view(id).await?;
    Ok(Json(ViewResponse { file: view.file.into(), content: view.content }))
}

/// Download the current content of a file.
pub async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let (file, content) = state.drive.files.download(id).await?;

    let mut response = Response::new(content.into());
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_str(&file.mime_type)
            .unwrap_or_else(|_| header::HeaderValue::from_static("application/octet-stream")),
    );
    response
        .headers_mut()
        .insert(header::CONTENT_DISPOSITION, attachment_disposition(&file.name));

    Ok(response)
}

/// `attachment; filename="..."` with anything that could break out of the
/// quoted string replaced by `_`.
fn attachment_disposition(name: &str) -> header::HeaderValue {
    let safe: String = name
        .chars()
        .map(|c| if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') { c } else { '_' })
        .collect();
    header::HeaderValue::from_str(&format!("attachment; filename=\"{}\"", safe))
        .unwrap_or_else(|_| header::HeaderValue::from_static("attachment"))
}

/// Replace a file's content with the request body, creating a new version.
/// `text/*` bodies are recorded as text.
pub async fn update_content(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Version>, AppError> {
    let is_text = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/"));

    let content = if is_text {
        let text = String::from_utf8(body.to_vec())
            .map_err(|_| AppError::BadRequest("text content must be valid UTF-8".into()))?;
        NewContent::Text(text)
    } else {
        NewContent::Binary(body)
    };

    let version = state
        .drive
        .versions
        .append_version(id, content, &actor.user_id, actor.caps)
        .await?;
    Ok(Json(version))
}

pub async fn list_versions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Version>>, AppError> {
    Ok(Json(state.drive.versions.history(id).await?))
}

/// `null` when the file has no version rows (binary uploads never edited).
pub async fn latest_version(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Option<Version>>, AppError> {
    Ok(Json(state.drive.versions.latest(id).await?))
}

/// Move a file to the bin.
pub async fn delete_file(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<FileResponse>, AppError> {
    let file = state.drive.files.soft_delete(id, &actor.user_id, actor.caps).await?;
    Ok(Json(file.into()))
}

pub async fn restore_file(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<FileResponse>, AppError> {
    let file = state.drive.files.restore(id, &actor.user_id, actor.caps).await?;
    Ok(Json(file.into()))
}

pub async fn list_bin(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<ScopeQuery>,
) -> Result<Json<Vec<BinItemResponse>>, AppError> {
    let entries = state.drive.bin.list_bin(&actor.scope(query.team_id)).await?;
    Ok(Json(entries.into_iter().map(BinItemResponse::from).collect()))
}

pub async fn empty_bin(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<ScopeQuery>,
) -> Result<Json<PurgeReport>, AppError> {
    let report = state
        .drive
        .bin
        .empty_bin(&actor.scope(query.team_id), &actor.user_id, actor.caps)
        .await?;
    Ok(Json(report))
}

/// Permanently delete a binned file.
pub async fn purge_file(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.drive.bin.purge(id, &actor.user_id, actor.caps).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Purge everything past its retention window, across all scopes.
pub async fn sweep_bin(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<Json<PurgeReport>, AppError> {
    if !actor.caps.can_delete {
        return Err(AppError::Forbidden("not permitted to sweep the bin".into()));
    }
    Ok(Json(state.drive.bin.sweep().await?))
}

pub async fn set_retention(
    State(state): State<AppState>,
    actor: Actor,
    Path(team_id): Path<Uuid>,
    Json(request): Json<RetentionRequest>,
) -> Result<Json<RetentionResponse>, AppError> {
    state
        .drive
        .bin
        .set_retention_days(team_id, request.days, actor.caps)
        .await?;
    Ok(Json(RetentionResponse { team_id, retention_days: request.days }))
}

pub async fn create_folder(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<CreateFolderRequest>,
) -> Result<(StatusCode, Json<Folder>), AppError> {
    let folder = state
        .drive
        .folders
        .create_folder(request.team_id, &request.name, request.parent_id, &actor.user_id, actor.caps)
        .await?;
    Ok((StatusCode::CREATED, Json(folder)))
}

pub async fn list_folders(
    State(state): State<AppState>,
    Query(query): Query<FolderQuery>,
) -> Result<Json<Vec<Folder>>, AppError> {
    Ok(Json(state.drive.folders.list_folders(query.team_id, query.parent_id).await?))
}

/// Re-parent a folder; a `null` parent moves it to the team root.
pub async fn move_folder(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(request): Json<MoveFolderRequest>,
) -> Result<Json<Folder>, AppError> {
    let folder = state
        .drive
        .folders
        .move_folder(id, request.parent_id, &actor.user_id, actor.caps)
        .await?;
    Ok(Json(folder))
}

pub async fn folder_ancestors(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Folder>>, AppError> {
    Ok(Json(state.drive.folders.ancestors(id).await?))
}

pub async fn list_activity(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<Vec<Activity>>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT);
    let entries = state
        .drive
        .activity
        .recent(&actor.scope(query.team_id), limit)
        .await?;
    Ok(Json(entries))
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn download_filename_cannot_break_out_of_quotes() {
        assert_eq!(attachment_disposition("report v2.pdf"), "attachment; filename=\"report v2.pdf\"");
        assert_eq!(
            attachment_disposition("a\"; filename=\"evil.exe"),
            "attachment; filename=\"a_; filename=_evil.exe\""
        );
        assert_eq!(attachment_disposition("back\\slash\r\nx.txt"), "attachment; filename=\"back_slash__x.txt\"");
        assert_eq!(attachment_disposition("résumé.txt"), "attachment; filename=\"r_sum_.txt\"");
    }

    #[test]
    fn actor_reads_user_and_capabilities() {
        let actor = Actor::from_headers(&headers(&[
            (USER_HEADER, "alice"),
            (CAPABILITIES_HEADER, "upload, delete"),
        ]))
        .unwrap();
        assert_eq!(actor.user_id, "alice");
        assert_eq!(
            actor.caps,
            Capabilities { can_upload: true, can_edit: false, can_delete: true }
        );
    }

    #[test]
    fn actor_without_capabilities_is_read_only() {
        let actor = Actor::from_headers(&headers(&[(USER_HEADER, "bob")])).unwrap();
        assert_eq!(actor.caps, Capabilities::read_only());
        assert_eq!(actor.scope(None), Scope::Personal("bob".into()));
    }

    #[test]
    fn actor_requires_a_user() {
        assert!(matches!(
            Actor::from_headers(&headers(&[(CAPABILITIES_HEADER, "edit")])),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            Actor::from_headers(&headers(&[(USER_HEADER, "bob"), (CAPABILITIES_HEADER, "admin")])),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn blank_form_ids_are_absent() {
        assert_eq!(optional_uuid("team_id", "  ").unwrap(), None);
        let id = Uuid::new_v4();
        assert_eq!(optional_uuid("team_id", &id.to_string()).unwrap(), Some(id));
        assert!(optional_uuid("team_id", "nope").is_err());
    }
}
