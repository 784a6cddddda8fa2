use std::sync::Arc;

use super::LifecycleContext;
use crate::{
    error::AppError,
    models::{Activity, Scope},
};

const MAX_ACTIVITY_PAGE: i64 = 500;

/// Read side of the activity trail. Entries are written by the operations
/// they describe, inside the same repository call.
#[derive(Clone)]
pub struct ActivityLog {
    ctx: Arc<LifecycleContext>,
}

impl ActivityLog {
    pub(super) fn new(ctx: Arc<LifecycleContext>) -> Self {
        Self { ctx }
    }

    /// Newest first, at most `limit` entries (clamped to 1..=500).
    pub async fn recent(&self, scope: &Scope, limit: i64) -> Result<Vec<Activity>, AppError> {
        let limit = limit.clamp(1, MAX_ACTIVITY_PAGE);
        self.ctx.repo.list_activity(scope, limit).await
    }
}
