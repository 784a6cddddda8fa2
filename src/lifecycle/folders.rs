use std::{collections::HashSet, sync::Arc};

use tracing::info;
use uuid::Uuid;

use super::{LifecycleContext, require};
use crate::{
    error::AppError,
    models::{Activity, ActivityAction, Capabilities, Folder},
};

/// Team folder hierarchy stored as parent references.
#[derive(Clone)]
pub struct FolderTree {
    ctx: Arc<LifecycleContext>,
}

impl FolderTree {
    pub(super) fn new(ctx: Arc<LifecycleContext>) -> Self {
        Self { ctx }
    }

    pub async fn create_folder(
        &self,
        team_id: Uuid,
        name: &str,
        parent_id: Option<Uuid>,
        actor: &str,
        caps: Capabilities,
    ) -> Result<Folder, AppError> {
        require(caps.can_upload, "create folders")?;

        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::BadRequest("folder name must not be empty".into()));
        }
        if let Some(parent_id) = parent_id {
            self.team_folder(team_id, parent_id).await?;
        }

        let folder = Folder {
            id: Uuid::new_v4(),
            name: name.to_string(),
            team_id,
            parent_id,
            created_by: actor.to_string(),
            created_at: self.ctx.clock.now(),
        };
        let activity = Activity::for_folder(
            &folder,
            actor,
            ActivityAction::CreateFolder,
            format!("Created folder \"{}\"", folder.name),
            folder.created_at,
        );
        self.ctx.repo.insert_folder(&folder, &activity).await?;

        info!("Folder created: {} in team {}", folder.id, team_id);
        Ok(folder)
    }

    pub async fn list_folders(&self, team_id: Uuid, parent_id: Option<Uuid>) -> Result<Vec<Folder>, AppError> {
        self.ctx.repo.list_folders(team_id, parent_id).await
    }

    /// Re-parents a folder. `None` moves it to the team root. The subtree check
    /// happens inside the repository write, so concurrent moves cannot close a
    /// loop.
    pub async fn move_folder(
        &self,
        folder_id: Uuid,
        new_parent: Option<Uuid>,
        actor: &str,
        caps: Capabilities,
    ) -> Result<Folder, AppError> {
        require(caps.can_upload, "move folders")?;
        let folder = self.folder(folder_id).await?;

        if let Some(parent_id) = new_parent {
            if parent_id == folder_id {
                return Err(AppError::InvalidState("a folder cannot contain itself".into()));
            }
            self.team_folder(folder.team_id, parent_id).await?;
        }

        if folder.parent_id == new_parent {
            return Ok(folder);
        }

        let destination = match new_parent {
            Some(parent_id) => format!("folder {}", parent_id),
            None => "the root".to_string(),
        };
        let activity = Activity::for_folder(
            &folder,
            actor,
            ActivityAction::MoveFolder,
            format!("Moved folder \"{}\" to {}", folder.name, destination),
            self.ctx.clock.now(),
        );
        let moved = self.ctx.repo.set_folder_parent(folder_id, new_parent, &activity).await?;
        info!("Folder {} moved to {}", folder_id, destination);
        Ok(moved)
    }

    /// Breadcrumb from the team root down to and including `folder_id`.
    pub async fn ancestors(&self, folder_id: Uuid) -> Result<Vec<Folder>, AppError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(folder_id);

        while let Some(id) = next {
            if !seen.insert(id) {
                return Err(AppError::InvalidState(format!("folder {} is part of a cycle", id)));
            }
            let folder = self.folder(id).await?;
            next = folder.parent_id;
            chain.push(folder);
        }

        chain.reverse();
        Ok(chain)
    }

    async fn folder(&self, id: Uuid) -> Result<Folder, AppError> {
        self.ctx.repo.get_folder(id).await?.ok_or_else(|| AppError::folder_not_found(id))
    }

    async fn team_folder(&self, team_id: Uuid, id: Uuid) -> Result<Folder, AppError> {
        let folder = self.folder(id).await?;
        if folder.team_id != team_id {
            return Err(AppError::BadRequest(format!("folder {} belongs to another team", id)));
        }
        Ok(folder)
    }
}
