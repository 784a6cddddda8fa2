use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, patch, post, put},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use teamdrive::{
    clock::SystemClock,
    config::Config,
    database::init_db,
    handlers::*,
    lifecycle::{Drive, LifecycleContext, LifecycleSettings},
    repository::{FileRepository, MemoryRepository, PgRepository},
    state::AppState,
    storage::init_storage,
};

// Multipart framing on top of the largest accepted file
const BODY_OVERHEAD: usize = 64 * 1024;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let repo: Arc<dyn FileRepository> = match &config.database_url {
        Some(url) => {
            let pool = init_db(url, config.database_max_connections).await?;
            Arc::new(PgRepository::new(pool))
        }
        None => {
            info!("DATABASE_URL not set, keeping records in memory");
            Arc::new(MemoryRepository::new())
        }
    };

    let storage = init_storage(&config).await?;

    let drive = Drive::new(LifecycleContext {
        repo,
        storage,
        clock: Arc::new(SystemClock),
        settings: LifecycleSettings::from(&config),
    });

    let body_limit = usize::try_from(config.max_file_size)?.saturating_add(BODY_OVERHEAD);
    let addr: SocketAddr = config.bind_addr.parse()?;

    let app_state = AppState { drive };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/files", post(upload_file).get(list_files))
        .route("/files/{id}", get(get_file).delete(delete_file))
        .route("/files/{id}/view", get(view_file))
        .route("/files/{id}/download", get(download_file))
        .route("/files/{id}/content", put(update_content))
        .route("/files/{id}/versions", get(list_versions))
        .route("/files/{id}/versions/latest", get(latest_version))
        .route("/files/{id}/restore", post(restore_file))
        .route("/bin", get(list_bin).delete(empty_bin))
        .route("/bin/sweep", post(sweep_bin))
        .route("/bin/{id}", delete(purge_file))
        .route("/teams/{id}/retention", put(set_retention))
        .route("/folders", post(create_folder).get(list_folders))
        .route("/folders/{id}", patch(move_folder))
        .route("/folders/{id}/ancestors", get(folder_ancestors))
        .route("/activity", get(list_activity))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
