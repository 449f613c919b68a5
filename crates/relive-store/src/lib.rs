//! Durable task store on SQLite.
//!
//! Single source of truth for every worker in the engine: anchors and
//! recordings, downloads, submission tasks with their media rows, workflow
//! instances/steps/configurations, sync mirror jobs and task relations.
//! Workers serialize their state transitions through row updates here; a
//! worker recovering from a crash reconstructs what to do solely from
//! store state.

pub mod anchors;
pub mod downloads;
pub mod error;
pub mod recordings;
pub mod relations;
pub mod submissions;
pub mod sync_tasks;
pub mod workflows;

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Executor;
use tracing::info;

pub use error::{StoreError, StoreResult};

/// Handle to the task store. Cheap to clone; all methods take `&self`.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the store at the given path and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(false);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        // A single connection: each in-memory connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Apply the schema. Statements are all `IF NOT EXISTS`, so this is
    /// idempotent across restarts.
    async fn migrate(&self) -> StoreResult<()> {
        self.pool.execute(include_str!("schema.sql")).await?;
        self.seed_default_configurations().await?;
        Ok(())
    }

    /// Reset in-flight work left behind by a crashed process so workers can
    /// re-claim it from store state alone.
    pub async fn recover(&self) -> StoreResult<()> {
        let downloads = sqlx::query("UPDATE video_download SET status = 0 WHERE status = 1")
            .execute(&self.pool)
            .await?
            .rows_affected();

        let syncs = sqlx::query("UPDATE sync_task SET status = 'PENDING' WHERE status = 'UPLOADING'")
            .execute(&self.pool)
            .await?
            .rows_affected();

        let steps = sqlx::query("UPDATE workflow_step SET status = 'pending' WHERE status = 'running'")
            .execute(&self.pool)
            .await?
            .rows_affected();

        let uploads = sqlx::query(
            "UPDATE merged_video SET status = 'pending' WHERE status = 'uploading'",
        )
        .execute(&self.pool)
        .await?
        .rows_affected()
            + sqlx::query(
                "UPDATE task_output_segment SET status = 'pending' WHERE status = 'uploading'",
            )
            .execute(&self.pool)
            .await?
            .rows_affected();

        if downloads + syncs + steps + uploads > 0 {
            info!(
                downloads, syncs, steps, uploads,
                "recovered in-flight work from previous run"
            );
        }
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
