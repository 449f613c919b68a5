//! Task relation queries for the integrated download-and-submit flow.

use chrono::{DateTime, Utc};
use relive_models::{RelationStatus, TaskRelation};

use crate::{Store, StoreError, StoreResult};

#[derive(sqlx::FromRow)]
struct RelationRow {
    id: i64,
    download_id: i64,
    task_id: i64,
    relation_type: String,
    workflow_status: String,
    instance_id: Option<String>,
    retry_count: i64,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<RelationRow> for TaskRelation {
    type Error = StoreError;

    fn try_from(row: RelationRow) -> Result<Self, Self::Error> {
        Ok(TaskRelation {
            id: row.id,
            download_id: row.download_id,
            task_id: row.task_id,
            relation_type: row.relation_type,
            workflow_status: row
                .workflow_status
                .parse::<RelationStatus>()
                .map_err(StoreError::invalid_value)?,
            instance_id: row.instance_id,
            retry_count: row.retry_count,
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}

impl Store {
    pub async fn insert_relation(&self, relation: &TaskRelation) -> StoreResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO task_relation
               (download_id, task_id, relation_type, workflow_status, instance_id, retry_count, last_error, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(relation.download_id)
        .bind(relation.task_id)
        .bind(&relation.relation_type)
        .bind(relation.workflow_status.as_str())
        .bind(&relation.instance_id)
        .bind(relation.retry_count)
        .bind(&relation.last_error)
        .bind(relation.created_at)
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list_relations_for_task(&self, task_id: i64) -> StoreResult<Vec<TaskRelation>> {
        let rows: Vec<RelationRow> =
            sqlx::query_as("SELECT * FROM task_relation WHERE task_id = ? ORDER BY id")
                .bind(task_id)
                .fetch_all(self.pool())
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn list_relations_for_download(&self, download_id: i64) -> StoreResult<Vec<TaskRelation>> {
        let rows: Vec<RelationRow> =
            sqlx::query_as("SELECT * FROM task_relation WHERE download_id = ? ORDER BY id")
                .bind(download_id)
                .fetch_all(self.pool())
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Tasks whose relations may be ready to start their workflow.
    pub async fn list_tasks_awaiting_workflow(&self) -> StoreResult<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"SELECT DISTINCT task_id FROM task_relation
               WHERE workflow_status IN ('PENDING_DOWNLOAD', 'READY')"#,
        )
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }

    pub async fn set_relation_status(
        &self,
        id: i64,
        status: RelationStatus,
        error: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE task_relation SET workflow_status = ?, last_error = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Mark every relation of a task started, recording the instance id.
    pub async fn mark_relations_workflow_started(
        &self,
        task_id: i64,
        instance_id: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE task_relation SET workflow_status = 'WORKFLOW_STARTED', instance_id = ? WHERE task_id = ?",
        )
        .bind(instance_id)
        .bind(task_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn record_relation_failure(&self, id: i64, error: &str) -> StoreResult<()> {
        sqlx::query(
            r#"UPDATE task_relation
               SET workflow_status = 'DOWNLOAD_FAILED', retry_count = retry_count + 1, last_error = ?
               WHERE id = ?"#,
        )
        .bind(error)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relation_lifecycle() {
        let store = Store::open_in_memory().await.unwrap();
        let relation = TaskRelation::integrated(11, 22);
        let id = store.insert_relation(&relation).await.unwrap();

        let awaiting = store.list_tasks_awaiting_workflow().await.unwrap();
        assert_eq!(awaiting, vec![22]);

        store.set_relation_status(id, RelationStatus::Ready, None).await.unwrap();
        store.mark_relations_workflow_started(22, "instance-1").await.unwrap();

        let loaded = store.list_relations_for_task(22).await.unwrap();
        assert_eq!(loaded[0].workflow_status, RelationStatus::WorkflowStarted);
        assert_eq!(loaded[0].instance_id.as_deref(), Some("instance-1"));
        assert!(store.list_tasks_awaiting_workflow().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_relation_failure_increments_retry() {
        let store = Store::open_in_memory().await.unwrap();
        let relation = TaskRelation::integrated(1, 2);
        let id = store.insert_relation(&relation).await.unwrap();

        store.record_relation_failure(id, "download failed").await.unwrap();
        let loaded = store.list_relations_for_download(1).await.unwrap();
        assert_eq!(loaded[0].workflow_status, RelationStatus::DownloadFailed);
        assert_eq!(loaded[0].retry_count, 1);
        assert_eq!(loaded[0].last_error.as_deref(), Some("download failed"));
    }
}
