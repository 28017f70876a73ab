use std::path::Path;

use sqlx::{
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Sqlite,
};
use tokio::fs;

use crate::NimbusResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Migrator for the volume and template catalog.
pub static CATALOG_DB_MIGRATOR: Migrator = sqlx::migrate!("lib/management/migrations/catalog");

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Opens the SQLite catalog at `db_path`, creating it and running migrations if needed.
///
/// ## Arguments
///
/// * `db_path` - Path of the SQLite database file
/// * `migrator` - Migrations to apply
pub async fn init_db(db_path: impl AsRef<Path>, migrator: &Migrator) -> NimbusResult<Pool<Sqlite>> {
    let db_path = db_path.as_ref();

    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    migrator.run(&pool).await?;

    tracing::debug!(path = %db_path.display(), "catalog database ready");
    Ok(pool)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::*;

    #[tokio::test]
    async fn test_init_db_is_reentrant() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("nested/nimbus.db");

        let pool = init_db(&path, &CATALOG_DB_MIGRATOR).await?;
        pool.close().await;

        let pool = init_db(&path, &CATALOG_DB_MIGRATOR).await?;
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name IN ('volumes', 'templates', 'builds')",
        )
        .fetch_one(&pool)
        .await?;
        assert_eq!(row.get::<i64, _>("n"), 3);
        Ok(())
    }
}
