//! PostgreSQL adapter for multi-instance deployments.

mod sessions;

pub use sessions::PgSessionRepo;

use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{info, instrument};

use keel_settings::DatabaseSettings;

use crate::error::StoreError;
use crate::schema;

/// Open a connection pool sized from the database settings.
#[instrument(skip(url, settings), fields(max_connections = settings.max_connections))]
pub async fn connect_pool(url: &str, settings: &DatabaseSettings) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout())
        .connect(url)
        .await
        .map_err(|e| StoreError::Unavailable(format!("connect: {e}")))?;
    info!("postgres pool ready");
    Ok(pool)
}

/// Create tables and indexes if missing and record the schema version.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    for statement in schema::POSTGRES_STATEMENTS {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(format!("schema: {e}")))?;
    }

    let existing: Option<PgRow> = sqlx::query("SELECT version FROM schema_version LIMIT 1")
        .fetch_optional(&mut *tx)
        .await?;
    match existing {
        Some(row) => {
            let version: i32 = row.try_get("version")?;
            info!(version, "schema already present");
        }
        None => {
            sqlx::query("INSERT INTO schema_version (version) VALUES ($1)")
                .bind(schema::SCHEMA_VERSION as i32)
                .execute(&mut *tx)
                .await?;
        }
    }
    tx.commit().await?;
    Ok(())
}
