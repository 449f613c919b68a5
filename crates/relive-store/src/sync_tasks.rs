//! Sync mirror job queries.

use chrono::{DateTime, Utc};
use relive_models::{SyncStatus, SyncTask};

use crate::{Store, StoreError, StoreResult};

#[derive(sqlx::FromRow)]
struct SyncRow {
    id: i64,
    local_path: String,
    remote_dir: String,
    remote_name: String,
    status: String,
    progress: f64,
    retry_count: i64,
    max_retries: i64,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SyncRow> for SyncTask {
    type Error = StoreError;

    fn try_from(row: SyncRow) -> Result<Self, Self::Error> {
        Ok(SyncTask {
            id: row.id,
            local_path: row.local_path,
            remote_dir: row.remote_dir,
            remote_name: row.remote_name,
            status: row.status.parse::<SyncStatus>().map_err(StoreError::invalid_value)?,
            progress: row.progress,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl Store {
    pub async fn insert_sync_task(&self, task: &SyncTask) -> StoreResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO sync_task
               (local_path, remote_dir, remote_name, status, progress, retry_count, max_retries,
                error_message, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&task.local_path)
        .bind(&task.remote_dir)
        .bind(&task.remote_name)
        .bind(task.status.as_str())
        .bind(task.progress)
        .bind(task.retry_count)
        .bind(task.max_retries)
        .bind(&task.error_message)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_sync_task(&self, id: i64) -> StoreResult<SyncTask> {
        let row: SyncRow = sqlx::query_as("SELECT * FROM sync_task WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::not_found("sync task", id))?;
        row.try_into()
    }

    pub async fn list_sync_tasks(&self) -> StoreResult<Vec<SyncTask>> {
        let rows: Vec<SyncRow> = sqlx::query_as("SELECT * FROM sync_task ORDER BY created_at DESC")
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Claim the oldest PENDING job; the conditional UPDATE makes the claim
    /// atomic across workers.
    pub async fn claim_next_pending_sync(&self) -> StoreResult<Option<SyncTask>> {
        let row: Option<SyncRow> = sqlx::query_as(
            "SELECT * FROM sync_task WHERE status = 'PENDING' ORDER BY created_at LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let claimed = sqlx::query(
            "UPDATE sync_task SET status = 'UPLOADING', updated_at = ? WHERE id = ? AND status = 'PENDING'",
        )
        .bind(Utc::now())
        .bind(row.id)
        .execute(self.pool())
        .await?
        .rows_affected();

        if claimed == 0 {
            return Ok(None);
        }

        let mut task: SyncTask = row.try_into()?;
        task.status = SyncStatus::Uploading;
        Ok(Some(task))
    }

    pub async fn update_sync_progress(&self, id: i64, progress: f64) -> StoreResult<()> {
        sqlx::query("UPDATE sync_task SET progress = ?, updated_at = ? WHERE id = ?")
            .bind(progress)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_sync_status(&self, id: i64, status: SyncStatus, error: Option<&str>) -> StoreResult<()> {
        sqlx::query("UPDATE sync_task SET status = ?, error_message = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Failure handling: under the retry budget the job goes back to
    /// PENDING for another automatic attempt, otherwise it fails
    /// terminally. Returns the resulting status.
    pub async fn record_sync_failure(&self, id: i64, error: &str) -> StoreResult<SyncStatus> {
        let task = self.get_sync_task(id).await?;
        let retry_count = task.retry_count + 1;
        let status = if retry_count <= task.max_retries {
            SyncStatus::Pending
        } else {
            SyncStatus::Failed
        };

        sqlx::query(
            r#"UPDATE sync_task
               SET status = ?, retry_count = ?, error_message = ?, progress = 0.0, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(status.as_str())
        .bind(retry_count)
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(status)
    }

    /// Explicit user retry: any non-running job goes back to PENDING with a
    /// fresh retry budget.
    pub async fn retry_sync_task(&self, id: i64) -> StoreResult<()> {
        sqlx::query(
            r#"UPDATE sync_task
               SET status = 'PENDING', retry_count = 0, error_message = NULL, progress = 0.0, updated_at = ?
               WHERE id = ? AND status != 'UPLOADING'"#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Pause is reachable from PENDING and UPLOADING; a running upload
    /// observes the status change cooperatively.
    pub async fn pause_sync_task(&self, id: i64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE sync_task SET status = 'PAUSED', updated_at = ? WHERE id = ? AND status IN ('PENDING', 'UPLOADING')",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn cancel_sync_task(&self, id: i64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE sync_task SET status = 'CANCELLED', updated_at = ? WHERE id = ? AND status NOT IN ('SUCCESS')",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Removes the job record only; the already-uploaded remote copy is
    /// intentionally left in place.
    pub async fn delete_sync_task(&self, id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM sync_task WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn count_uploading_syncs(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_task WHERE status = 'UPLOADING'")
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_lifecycle() {
        let store = Store::open_in_memory().await.unwrap();
        let task = SyncTask::new("/rec/a.flv", "/录播", "a.flv", 2);
        let id = store.insert_sync_task(&task).await.unwrap();

        let claimed = store.claim_next_pending_sync().await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, SyncStatus::Uploading);
        assert!(store.claim_next_pending_sync().await.unwrap().is_none());

        store.update_sync_progress(id, 55.0).await.unwrap();
        store.set_sync_status(id, SyncStatus::Success, None).await.unwrap();
        store.update_sync_progress(id, 100.0).await.unwrap();

        let done = store.get_sync_task(id).await.unwrap();
        assert_eq!(done.status, SyncStatus::Success);
        assert!((done.progress - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_auto_retry_until_budget_exhausted() {
        let store = Store::open_in_memory().await.unwrap();
        let task = SyncTask::new("/rec/a.flv", "/录播", "a.flv", 2);
        let id = store.insert_sync_task(&task).await.unwrap();

        assert_eq!(store.record_sync_failure(id, "network").await.unwrap(), SyncStatus::Pending);
        assert_eq!(store.record_sync_failure(id, "network").await.unwrap(), SyncStatus::Pending);
        assert_eq!(store.record_sync_failure(id, "network").await.unwrap(), SyncStatus::Failed);

        let failed = store.get_sync_task(id).await.unwrap();
        assert_eq!(failed.retry_count, 3);
        assert_eq!(failed.error_message.as_deref(), Some("network"));
    }

    #[tokio::test]
    async fn test_explicit_retry_resets_budget() {
        let store = Store::open_in_memory().await.unwrap();
        let task = SyncTask::new("/rec/a.flv", "/录播", "a.flv", 0);
        let id = store.insert_sync_task(&task).await.unwrap();
        store.record_sync_failure(id, "boom").await.unwrap();

        store.retry_sync_task(id).await.unwrap();
        let retried = store.get_sync_task(id).await.unwrap();
        assert_eq!(retried.status, SyncStatus::Pending);
        assert_eq!(retried.retry_count, 0);
        assert!(retried.error_message.is_none());
    }

    #[tokio::test]
    async fn test_pause_only_from_pending_or_uploading() {
        let store = Store::open_in_memory().await.unwrap();
        let task = SyncTask::new("/rec/a.flv", "/录播", "a.flv", 2);
        let id = store.insert_sync_task(&task).await.unwrap();

        store.pause_sync_task(id).await.unwrap();
        assert_eq!(store.get_sync_task(id).await.unwrap().status, SyncStatus::Paused);

        // Paused jobs are not claimable.
        assert!(store.claim_next_pending_sync().await.unwrap().is_none());

        store.set_sync_status(id, SyncStatus::Success, None).await.unwrap();
        store.pause_sync_task(id).await.unwrap();
        assert_eq!(store.get_sync_task(id).await.unwrap().status, SyncStatus::Success);
    }

    #[tokio::test]
    async fn test_recover_resets_uploading_to_pending() {
        let store = Store::open_in_memory().await.unwrap();
        let task = SyncTask::new("/rec/a.flv", "/录播", "a.flv", 2);
        let id = store.insert_sync_task(&task).await.unwrap();
        store.claim_next_pending_sync().await.unwrap();

        store.recover().await.unwrap();
        assert_eq!(store.get_sync_task(id).await.unwrap().status, SyncStatus::Pending);
    }
}
