use crate::lifecycle::Drive;

/// Central application state shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// File lifecycle operations over the configured repository and storage.
    pub drive: Drive,
}
