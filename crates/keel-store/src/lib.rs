//! # keel-store
//!
//! Authoritative persistence for sessions, messages and checkpoints.
//!
//! [`SessionRepository`] is the contract the session service consumes. Two
//! adapters implement it: [`sqlite::SqliteSessionRepo`] for a single node and
//! [`postgres::PgSessionRepo`] for shared deployments. Every update is a
//! single conditional statement carrying the row version, so concurrent
//! writers can never silently overwrite each other.

#![deny(unsafe_code)]

pub mod error;
pub mod postgres;
pub mod repository;
pub mod schema;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use keel_settings::DatabaseSettings;
use tracing::info;

pub use error::StoreError;
pub use repository::{
    ListSessionsQuery, NewCheckpoint, NewSession, SessionPage, SessionPatch, SessionRepository,
};

/// Which adapter a database URL selects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreTarget {
    SqliteFile(String),
    SqliteMemory,
    Postgres(String),
}

impl StoreTarget {
    pub fn parse(url: &str) -> Result<Self, StoreError> {
        if url == "sqlite::memory:" || url == "sqlite://:memory:" {
            Ok(Self::SqliteMemory)
        } else if let Some(path) = url.strip_prefix("sqlite://") {
            if path.is_empty() {
                return Err(StoreError::Unavailable("sqlite url has no path".into()));
            }
            Ok(Self::SqliteFile(path.to_string()))
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Self::Postgres(url.to_string()))
        } else {
            Err(StoreError::Unavailable(format!(
                "unsupported database url scheme: {}",
                url.split("://").next().unwrap_or(url)
            )))
        }
    }
}

/// Open the configured store and make sure its schema exists.
pub async fn open_repository(
    settings: &DatabaseSettings,
) -> Result<Arc<dyn SessionRepository>, StoreError> {
    let repo: Arc<dyn SessionRepository> = match StoreTarget::parse(&settings.url)? {
        StoreTarget::SqliteMemory => Arc::new(sqlite::SqliteSessionRepo::new(sqlite::Database::in_memory()?)),
        StoreTarget::SqliteFile(path) => {
            let db = tokio::task::spawn_blocking(move || sqlite::Database::open(Path::new(&path)))
                .await
                .map_err(|e| StoreError::Database(format!("blocking task failed: {e}")))??;
            Arc::new(sqlite::SqliteSessionRepo::new(db))
        }
        StoreTarget::Postgres(url) => {
            let pool = postgres::connect_pool(&url, settings).await?;
            postgres::migrate(&pool).await?;
            Arc::new(postgres::PgSessionRepo::new(pool))
        }
    };
    info!(backend = repo.backend(), "session store ready");
    Ok(repo)
}
