use std::path::{Path, PathBuf};

use tracing::info;

const WORKSPACE_MIGRATIONS_DIR: &str = "server/migrations";
const CRATE_MIGRATIONS_DIR: &str = "./migrations";

/// `MIGRATIONS_DIR` wins, then the workspace layout, then the crate directory.
fn migrations_path() -> PathBuf {
    if let Ok(dir) = std::env::var("MIGRATIONS_DIR") {
        return PathBuf::from(dir);
    }
    let workspace_path = Path::new(WORKSPACE_MIGRATIONS_DIR);
    if workspace_path.exists() {
        return workspace_path.to_path_buf();
    }
    PathBuf::from(CRATE_MIGRATIONS_DIR)
}

/// Creates the `pixels` and `pixel_history` tables if they are missing.
pub async fn run(pool: &sqlx::PgPool) -> Result<(), sqlx_core::migrate::MigrateError> {
    let path = migrations_path();
    let migrator = sqlx_core::migrate::Migrator::new(path.as_path()).await?;
    migrator.run(pool).await?;
    info!(path = %path.display(), "pixel store migrations applied");
    Ok(())
}
