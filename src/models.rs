use std::{fmt, str::FromStr};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use uuid::Uuid;

use crate::utils::get_file_extension;

/// Ownership context of a file: a team workspace or a user's personal space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Scope {
    Team(Uuid),
    Personal(String),
}

impl Scope {
    pub fn team_id(&self) -> Option<Uuid> {
        match self {
            Scope::Team(id) => Some(*id),
            Scope::Personal(_) => None,
        }
    }

    /// Whether `file` is listed under this scope.
    pub fn contains(&self, file: &File) -> bool {
        match self {
            Scope::Team(id) => file.team_id == Some(*id),
            Scope::Personal(user) => file.team_id.is_none() && &file.uploaded_by == user,
        }
    }

    /// Whether an activity entry belongs to this scope.
    pub fn owns_activity(&self, activity: &Activity) -> bool {
        match self {
            Scope::Team(id) => activity.team_id == Some(*id),
            Scope::Personal(user) => activity.team_id.is_none() && &activity.user_id == user,
        }
    }
}

/// Rights the caller has already evaluated for the acting user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub can_upload: bool,
    pub can_edit: bool,
    pub can_delete: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self { can_upload: true, can_edit: true, can_delete: true }
    }

    pub fn read_only() -> Self {
        Self::default()
    }

    /// Parses a comma-separated list such as `upload,edit,delete`.
    pub fn parse(list: &str) -> Result<Self, String> {
        let mut caps = Self::default();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match item.to_ascii_lowercase().as_str() {
                "upload" => caps.can_upload = true,
                "edit" => caps.can_edit = true,
                "delete" => caps.can_delete = true,
                other => return Err(format!("unknown capability '{other}'")),
            }
        }
        Ok(caps)
    }
}

/// Declared content category, derived from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Text,
    Document,
    Other,
}

impl FileKind {
    pub fn from_filename(filename: &str) -> Self {
        match get_file_extension(filename).as_deref() {
            Some("jpg" | "jpeg" | "png" | "gif" | "svg") => FileKind::Image,
            Some("txt" | "md") => FileKind::Text,
            Some("docx" | "pdf") => FileKind::Document,
            _ => FileKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Image => "image",
            FileKind::Text => "text",
            FileKind::Document => "document",
            FileKind::Other => "other",
        }
    }
}

impl FromStr for FileKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(FileKind::Image),
            "text" => Ok(FileKind::Text),
            "document" => Ok(FileKind::Document),
            "other" => Ok(FileKind::Other),
            other => Err(format!("unknown file kind '{other}'")),
        }
    }
}

/// Which storage backend holds a file's bytes. Recorded per file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Remote,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Local => "local",
            StorageKind::Remote => "remote",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(StorageKind::Local),
            "remote" => Ok(StorageKind::Remote),
            other => Err(format!("unknown storage kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub id: Uuid,
    pub name: String,
    pub storage_key: String,
    pub storage_kind: StorageKind,
    pub file_size: i64,
    pub kind: FileKind,
    pub mime_type: String,
    pub checksum: Option<String>,
    pub team_id: Option<Uuid>,
    pub folder_id: Option<Uuid>,
    pub uploaded_by: String,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle state of a file that still has a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Active,
    Deleted { at: DateTime<Utc> },
}

impl File {
    pub fn state(&self) -> FileState {
        match self.deleted_at {
            Some(at) if self.is_deleted => FileState::Deleted { at },
            _ => FileState::Active,
        }
    }

    pub fn scope(&self) -> Scope {
        match self.team_id {
            Some(team) => Scope::Team(team),
            None => Scope::Personal(self.uploaded_by.clone()),
        }
    }
}

/// Content snapshot held by a version: inline text or a stored blob key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum VersionContent {
    Text(String),
    Blob(String),
}

impl VersionContent {
    pub fn text(&self) -> Option<&str> {
        match self {
            VersionContent::Text(text) => Some(text),
            VersionContent::Blob(_) => None,
        }
    }

    pub fn blob_key(&self) -> Option<&str> {
        match self {
            VersionContent::Blob(key) => Some(key),
            VersionContent::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: Uuid,
    pub file_id: Uuid,
    pub version_number: i32,
    pub content: VersionContent,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Folder {
    pub id: Uuid,
    pub name: String,
    pub team_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    UploadFile,
    EditFile,
    DeleteFile,
    RestoreFile,
    PurgeFile,
    CreateFolder,
    MoveFolder,
}

impl ActivityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityAction::UploadFile => "upload_file",
            ActivityAction::EditFile => "edit_file",
            ActivityAction::DeleteFile => "delete_file",
            ActivityAction::RestoreFile => "restore_file",
            ActivityAction::PurgeFile => "purge_file",
            ActivityAction::CreateFolder => "create_folder",
            ActivityAction::MoveFolder => "move_folder",
        }
    }
}

impl FromStr for ActivityAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload_file" => Ok(ActivityAction::UploadFile),
            "edit_file" => Ok(ActivityAction::EditFile),
            "delete_file" => Ok(ActivityAction::DeleteFile),
            "restore_file" => Ok(ActivityAction::RestoreFile),
            "purge_file" => Ok(ActivityAction::PurgeFile),
            "create_folder" => Ok(ActivityAction::CreateFolder),
            "move_folder" => Ok(ActivityAction::MoveFolder),
            other => Err(format!("unknown activity action '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    pub team_id: Option<Uuid>,
    pub user_id: String,
    pub action: ActivityAction,
    pub target_type: String,
    pub target_id: Uuid,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Activity {
    pub fn for_file(
        file: &File,
        user_id: &str,
        action: ActivityAction,
        description: String,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            team_id: file.team_id,
            user_id: user_id.to_string(),
            action,
            target_type: "file".to_string(),
            target_id: file.id,
            description,
            created_at: at,
        }
    }

    pub fn for_folder(
        folder: &Folder,
        user_id: &str,
        action: ActivityAction,
        description: String,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            team_id: Some(folder.team_id),
            user_id: user_id.to_string(),
            action,
            target_type: "folder".to_string(),
            target_id: folder.id,
            description,
            created_at: at,
        }
    }
}

/// Metadata supplied by the caller when uploading a file.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub scope: Scope,
    pub folder_id: Option<Uuid>,
    pub name: String,
    pub mime_type: Option<String>,
}

/// Bytes for a new upload, or a reference to a blob already written.
#[derive(Debug, Clone)]
pub enum InitialContent {
    Bytes(Bytes),
    Stored { kind: StorageKind, key: String },
}

/// Content for a new version.
#[derive(Debug, Clone)]
pub enum NewContent {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Clone, Serialize)]
pub struct FileView {
    pub file: File,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BinEntry {
    pub file: File,
    pub expires_at: DateTime<Utc>,
    pub days_remaining: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurgeFailure {
    pub file_id: Uuid,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PurgeReport {
    pub purged: Vec<Uuid>,
    pub failed: Vec<PurgeFailure>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileResponse {
    pub id: Uuid,
    pub name: String,
    pub kind: FileKind,
    pub size: i64,
    pub mime_type: String,
    pub version: i32,
    pub team_id: Option<Uuid>,
    pub folder_id: Option<Uuid>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub download_url: String,
}

impl From<File> for FileResponse {
    fn from(file: File) -> Self {
        Self {
            download_url: format!("/files/{}/download", file.id),
            id: file.id,
            name: file.name,
            kind: file.kind,
            size: file.file_size,
            mime_type: file.mime_type,
            version: file.version,
            team_id: file.team_id,
            folder_id: file.folder_id,
            is_deleted: file.is_deleted,
            deleted_at: file.deleted_at,
            updated_at: file.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_extension() {
        assert_eq!(FileKind::from_filename("notes.TXT"), FileKind::Text);
        assert_eq!(FileKind::from_filename("README.md"), FileKind::Text);
        assert_eq!(FileKind::from_filename("photo.jpeg"), FileKind::Image);
        assert_eq!(FileKind::from_filename("report.pdf"), FileKind::Document);
        assert_eq!(FileKind::from_filename("archive.zip"), FileKind::Other);
        assert_eq!(FileKind::from_filename("Makefile"), FileKind::Other);
    }

    #[test]
    fn parses_capability_lists() {
        let caps = Capabilities::parse("upload, Delete").unwrap();
        assert!(caps.can_upload && caps.can_delete && !caps.can_edit);
        assert_eq!(Capabilities::parse("").unwrap(), Capabilities::read_only());
        assert!(Capabilities::parse("admin").is_err());
    }
}
