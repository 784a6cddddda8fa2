use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;

/// Initialize and return a PostgreSQL connection pool.
pub async fn init_db(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    info!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    info!("Database connection established ({} max connections)", max_connections);
    Ok(pool)
}
