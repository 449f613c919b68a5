//! Live recording task queries.

use chrono::{DateTime, Utc};
use relive_models::{LiveRecordTask, RecordingStatus};

use crate::{Store, StoreError, StoreResult};

#[derive(sqlx::FromRow)]
struct RecordRow {
    id: i64,
    room_id: i64,
    status: String,
    file_path: String,
    segment_index: i64,
    title: Option<String>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    file_size: i64,
    error_message: Option<String>,
}

impl TryFrom<RecordRow> for LiveRecordTask {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        Ok(LiveRecordTask {
            id: row.id,
            room_id: row.room_id,
            status: row.status.parse::<RecordingStatus>().map_err(StoreError::invalid_value)?,
            file_path: row.file_path,
            segment_index: row.segment_index,
            title: row.title,
            started_at: row.started_at,
            ended_at: row.ended_at,
            file_size: row.file_size,
            error_message: row.error_message,
        })
    }
}

impl Store {
    /// Next segment index for a room: strictly increasing, starting at 1.
    pub async fn next_segment_index(&self, room_id: i64) -> StoreResult<i64> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(segment_index) FROM live_record_task WHERE room_id = ?",
        )
        .bind(room_id)
        .fetch_one(self.pool())
        .await?;
        Ok(max.unwrap_or(0) + 1)
    }

    /// Persist a freshly opened segment, returning its row id.
    pub async fn insert_recording(&self, task: &LiveRecordTask) -> StoreResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO live_record_task (room_id, status, file_path, segment_index, title, started_at, ended_at, file_size, error_message)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(task.room_id)
        .bind(task.status.as_str())
        .bind(&task.file_path)
        .bind(task.segment_index)
        .bind(&task.title)
        .bind(task.started_at)
        .bind(task.ended_at)
        .bind(task.file_size)
        .bind(&task.error_message)
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_recording(&self, id: i64) -> StoreResult<LiveRecordTask> {
        let row: RecordRow = sqlx::query_as("SELECT * FROM live_record_task WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::not_found("recording", id))?;
        row.try_into()
    }

    pub async fn list_recordings(&self, room_id: i64) -> StoreResult<Vec<LiveRecordTask>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            "SELECT * FROM live_record_task WHERE room_id = ? ORDER BY segment_index",
        )
        .bind(room_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Update byte accounting while recording.
    pub async fn update_recording_size(&self, id: i64, file_size: i64) -> StoreResult<()> {
        sqlx::query("UPDATE live_record_task SET file_size = ? WHERE id = ?")
            .bind(file_size)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Close a segment cleanly.
    pub async fn complete_recording(&self, id: i64, file_size: i64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE live_record_task SET status = 'completed', file_size = ?, ended_at = ? WHERE id = ?",
        )
        .bind(file_size)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Abort a segment with an error message.
    pub async fn fail_recording(&self, id: i64, error: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE live_record_task SET status = 'failed', error_message = ?, ended_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Segments still marked `recording` (e.g. after a crash); the recorder
    /// finalizes them on startup.
    pub async fn list_open_recordings(&self) -> StoreResult<Vec<LiveRecordTask>> {
        let rows: Vec<RecordRow> =
            sqlx::query_as("SELECT * FROM live_record_task WHERE status = 'recording'")
                .fetch_all(self.pool())
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_segment_indices_increase_without_gaps() {
        let store = Store::open_in_memory().await.unwrap();

        for expected in 1..=3 {
            let index = store.next_segment_index(42).await.unwrap();
            assert_eq!(index, expected);
            let task = LiveRecordTask::open(42, index, format!("/rec/seg-{index}.flv"), None);
            let id = store.insert_recording(&task).await.unwrap();
            store.complete_recording(id, 100).await.unwrap();
        }

        let segments = store.list_recordings(42).await.unwrap();
        let indices: Vec<i64> = segments.iter().map(|s| s.segment_index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_duplicate_segment_index_rejected() {
        let store = Store::open_in_memory().await.unwrap();
        let task = LiveRecordTask::open(7, 1, "/rec/seg-1.flv", None);
        store.insert_recording(&task).await.unwrap();
        assert!(store.insert_recording(&task).await.is_err());
    }

    #[tokio::test]
    async fn test_rotation_leaves_open_and_closed_rows() {
        let store = Store::open_in_memory().await.unwrap();

        let first = LiveRecordTask::open(12345, 1, "/rec/seg-1.flv", Some("t".into()));
        let first_id = store.insert_recording(&first).await.unwrap();
        store.complete_recording(first_id, 4096).await.unwrap();

        let second = LiveRecordTask::open(12345, 2, "/rec/seg-2.flv", Some("t".into()));
        store.insert_recording(&second).await.unwrap();

        let segments = store.list_recordings(12345).await.unwrap();
        assert_eq!(segments.len(), 2);
        assert!(segments[0].ended_at.is_some());
        assert!(segments[1].ended_at.is_none());

        let open = store.list_open_recordings().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].segment_index, 2);
    }

    #[tokio::test]
    async fn test_failed_recording_keeps_message() {
        let store = Store::open_in_memory().await.unwrap();
        let task = LiveRecordTask::open(9, 1, "/rec/x.flv", None);
        let id = store.insert_recording(&task).await.unwrap();
        store.fail_recording(id, "disk full").await.unwrap();

        let loaded = store.get_recording(id).await.unwrap();
        assert_eq!(loaded.status, RecordingStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("disk full"));
    }
}
