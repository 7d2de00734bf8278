use crate::domain::error::{AppError, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const CATALOG_SCHEMA: &str = include_str!("../../../../resources/catalog/schema.sql");

/// Stored in `PRAGMA user_version`. Bump when the schema script changes.
pub const CATALOG_SCHEMA_VERSION: i32 = 1;

/// Opens (creating if missing) the catalog database and brings its schema
/// up to date.
pub async fn init_catalog_db(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await
        .map_err(|e| AppError::Database(format!("Failed to open catalog database: {e}")))?;

    migrate(&pool).await?;
    info!(path = %db_path.display(), "Catalog database ready");
    Ok(pool)
}

/// Private in-memory database. Single connection that never expires, since
/// every SQLite connection to `:memory:` sees its own database.
pub async fn init_in_memory_catalog_db() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new().in_memory(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(|e| AppError::Database(format!("Failed to open in-memory catalog: {e}")))?;

    migrate(&pool).await?;
    Ok(pool)
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    let found = schema_version(pool).await?;
    if found > CATALOG_SCHEMA_VERSION {
        return Err(AppError::Database(format!(
            "Catalog database was written by a newer build (schema {found}, supported {CATALOG_SCHEMA_VERSION})"
        )));
    }

    // Every statement in the script is idempotent.
    sqlx::raw_sql(CATALOG_SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to apply catalog schema: {e}")))?;

    if found < CATALOG_SCHEMA_VERSION {
        sqlx::raw_sql(&format!("PRAGMA user_version = {CATALOG_SCHEMA_VERSION}"))
            .execute(pool)
            .await
            .map_err(|e| AppError::Database(format!("Failed to record schema version: {e}")))?;
        debug!(from = found, to = CATALOG_SCHEMA_VERSION, "Catalog schema upgraded");
    }
    Ok(())
}

pub async fn schema_version(pool: &SqlitePool) -> Result<i32> {
    sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to read schema version: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn table_names(pool: &SqlitePool) -> Vec<String> {
        sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(pool)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_db_has_schema_and_version() {
        let pool = init_in_memory_catalog_db().await.unwrap();
        assert_eq!(schema_version(&pool).await.unwrap(), CATALOG_SCHEMA_VERSION);
        assert_eq!(
            table_names(&pool).await,
            vec!["fingerprint_occurrences", "template_catalog"]
        );
    }

    #[tokio::test]
    async fn test_file_db_is_reopenable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("catalog.db");
        let pool = init_catalog_db(&path).await.unwrap();
        pool.close().await;
        let pool = init_catalog_db(&path).await.unwrap();
        assert_eq!(schema_version(&pool).await.unwrap(), CATALOG_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_newer_schema_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");
        let pool = init_catalog_db(&path).await.unwrap();
        sqlx::raw_sql("PRAGMA user_version = 99")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let err = init_catalog_db(&path).await.unwrap_err();
        assert!(matches!(err, AppError::Database(_)));
    }
}
