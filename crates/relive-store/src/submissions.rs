//! Submission tasks and their media rows.

use chrono::{DateTime, Utc};
use relive_models::submission::{SubmissionStatus, VideoType};
use relive_models::{MergedVideo, SubmissionTask, TaskOutputSegment, TaskSourceVideo, UploadState};

use crate::{Store, StoreError, StoreResult};

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    status: String,
    title: String,
    description: String,
    partition_id: i64,
    tags: String,
    video_type: i64,
    collection_id: Option<i64>,
    bvid: Option<String>,
    aid: Option<i64>,
    remote_state: Option<i64>,
    reject_reason: Option<String>,
    segment_prefix: String,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for SubmissionTask {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(SubmissionTask {
            id: row.id,
            status: row.status.parse::<SubmissionStatus>().map_err(StoreError::invalid_value)?,
            title: row.title,
            description: row.description,
            partition_id: row.partition_id,
            tags: row.tags,
            video_type: VideoType::from_code(row.video_type),
            collection_id: row.collection_id,
            bvid: row.bvid,
            aid: row.aid,
            remote_state: row.remote_state,
            reject_reason: row.reject_reason,
            segment_prefix: row.segment_prefix,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// The resumable-upload column block shared by merged videos and output
/// segments. Column names are part of the persisted contract.
#[derive(sqlx::FromRow)]
struct UploadColumns {
    upload_progress: f64,
    upload_uploaded_bytes: i64,
    upload_total_bytes: i64,
    upload_cid: Option<i64>,
    upload_file_name: Option<String>,
    upload_session_id: Option<String>,
    upload_biz_id: i64,
    upload_endpoint: Option<String>,
    upload_auth: Option<String>,
    upload_uri: Option<String>,
    upload_chunk_size: i64,
    upload_last_part_index: i64,
}

impl From<UploadColumns> for UploadState {
    fn from(c: UploadColumns) -> Self {
        UploadState {
            progress: c.upload_progress,
            uploaded_bytes: c.upload_uploaded_bytes,
            total_bytes: c.upload_total_bytes,
            cid: c.upload_cid,
            file_name: c.upload_file_name,
            session_id: c.upload_session_id,
            biz_id: c.upload_biz_id,
            endpoint: c.upload_endpoint,
            auth: c.upload_auth,
            uri: c.upload_uri,
            chunk_size: c.upload_chunk_size,
            last_part_index: c.upload_last_part_index,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MergedRow {
    id: i64,
    task_id: i64,
    file_path: String,
    duration_seconds: f64,
    status: String,
    created_at: DateTime<Utc>,
    #[sqlx(flatten)]
    upload: UploadColumns,
}

impl From<MergedRow> for MergedVideo {
    fn from(row: MergedRow) -> Self {
        MergedVideo {
            id: row.id,
            task_id: row.task_id,
            file_path: row.file_path,
            duration_seconds: row.duration_seconds,
            status: row.status,
            upload: row.upload.into(),
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SegmentRow {
    id: i64,
    task_id: i64,
    part_name: String,
    file_path: String,
    part_order: i64,
    status: String,
    #[sqlx(flatten)]
    upload: UploadColumns,
}

impl From<SegmentRow> for TaskOutputSegment {
    fn from(row: SegmentRow) -> Self {
        TaskOutputSegment {
            id: row.id,
            task_id: row.task_id,
            part_name: row.part_name,
            file_path: row.file_path,
            part_order: row.part_order,
            status: row.status,
            upload: row.upload.into(),
        }
    }
}

impl Store {
    pub async fn insert_task(&self, task: &SubmissionTask) -> StoreResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO submission_task
               (status, title, description, partition_id, tags, video_type, collection_id,
                bvid, aid, remote_state, reject_reason, segment_prefix, error_message, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(task.status.as_str())
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.partition_id)
        .bind(&task.tags)
        .bind(task.video_type.as_code())
        .bind(task.collection_id)
        .bind(&task.bvid)
        .bind(task.aid)
        .bind(task.remote_state)
        .bind(&task.reject_reason)
        .bind(&task.segment_prefix)
        .bind(&task.error_message)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_task(&self, id: i64) -> StoreResult<SubmissionTask> {
        let row: TaskRow = sqlx::query_as("SELECT * FROM submission_task WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::not_found("submission task", id))?;
        row.try_into()
    }

    pub async fn list_tasks(&self) -> StoreResult<Vec<SubmissionTask>> {
        let rows: Vec<TaskRow> =
            sqlx::query_as("SELECT * FROM submission_task ORDER BY created_at DESC")
                .fetch_all(self.pool())
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn set_task_status(
        &self,
        id: i64,
        status: SubmissionStatus,
        error: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE submission_task SET status = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Set the remote identity on first publish. At most once: the guard on
    /// `bvid IS NULL` makes a second publish attempt a no-op.
    pub async fn set_task_remote_identity(&self, id: i64, bvid: &str, aid: i64) -> StoreResult<bool> {
        let updated = sqlx::query(
            "UPDATE submission_task SET bvid = ?, aid = ?, updated_at = ? WHERE id = ? AND bvid IS NULL",
        )
        .bind(bvid)
        .bind(aid)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    pub async fn set_task_remote_state(
        &self,
        id: i64,
        remote_state: i64,
        reject_reason: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE submission_task SET remote_state = ?, reject_reason = ?, updated_at = ? WHERE id = ?",
        )
        .bind(remote_state)
        .bind(reject_reason)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Delete a task and everything it owns: sources, merged videos,
    /// segments, relations, workflow instances and their steps.
    pub async fn delete_task_cascade(&self, id: i64) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"DELETE FROM workflow_step WHERE instance_id IN
               (SELECT id FROM workflow_instance WHERE task_id = ?)"#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"DELETE FROM execution_log WHERE instance_id IN
               (SELECT id FROM workflow_instance WHERE task_id = ?)"#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM workflow_instance WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM task_source_video WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM merged_video WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM task_output_segment WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM task_relation WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM submission_task WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    // --- sources ---

    pub async fn insert_source(&self, source: &TaskSourceVideo) -> StoreResult<i64> {
        let result = sqlx::query(
            "INSERT INTO task_source_video (task_id, file_path, sort_order, start_time, end_time) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(source.task_id)
        .bind(&source.file_path)
        .bind(source.sort_order)
        .bind(&source.start_time)
        .bind(&source.end_time)
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list_sources(&self, task_id: i64) -> StoreResult<Vec<TaskSourceVideo>> {
        let rows: Vec<TaskSourceVideo> = sqlx::query_as::<_, SourceRow>(
            "SELECT * FROM task_source_video WHERE task_id = ? ORDER BY sort_order",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
        Ok(rows)
    }

    // --- merged videos ---

    pub async fn insert_merged(&self, merged: &MergedVideo) -> StoreResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO merged_video (task_id, file_path, duration_seconds, status, created_at, upload_total_bytes)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(merged.task_id)
        .bind(&merged.file_path)
        .bind(merged.duration_seconds)
        .bind(&merged.status)
        .bind(merged.created_at)
        .bind(merged.upload.total_bytes)
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_merged(&self, id: i64) -> StoreResult<MergedVideo> {
        let row: MergedRow = sqlx::query_as("SELECT * FROM merged_video WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::not_found("merged video", id))?;
        Ok(row.into())
    }

    pub async fn list_merged(&self, task_id: i64) -> StoreResult<Vec<MergedVideo>> {
        let rows: Vec<MergedRow> =
            sqlx::query_as("SELECT * FROM merged_video WHERE task_id = ? ORDER BY id")
                .bind(task_id)
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn set_merged_status(&self, id: i64, status: &str) -> StoreResult<()> {
        sqlx::query("UPDATE merged_video SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Persist the full upload-state block of a merged video in one write.
    pub async fn save_merged_upload_state(&self, id: i64, upload: &UploadState) -> StoreResult<()> {
        self.save_upload_state("merged_video", id, upload).await
    }

    // --- output segments ---

    pub async fn insert_segment(&self, segment: &TaskOutputSegment) -> StoreResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO task_output_segment (task_id, part_name, file_path, part_order, status, upload_total_bytes)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(segment.task_id)
        .bind(&segment.part_name)
        .bind(&segment.file_path)
        .bind(segment.part_order)
        .bind(&segment.status)
        .bind(segment.upload.total_bytes)
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_segment(&self, id: i64) -> StoreResult<TaskOutputSegment> {
        let row: SegmentRow = sqlx::query_as("SELECT * FROM task_output_segment WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::not_found("output segment", id))?;
        Ok(row.into())
    }

    /// Segments in `part_order`, the order the platform assembles them in.
    pub async fn list_segments(&self, task_id: i64) -> StoreResult<Vec<TaskOutputSegment>> {
        let rows: Vec<SegmentRow> =
            sqlx::query_as("SELECT * FROM task_output_segment WHERE task_id = ? ORDER BY part_order")
                .bind(task_id)
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn set_segment_status(&self, id: i64, status: &str) -> StoreResult<()> {
        sqlx::query("UPDATE task_output_segment SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Persist the full upload-state block of a segment in one write.
    pub async fn save_segment_upload_state(&self, id: i64, upload: &UploadState) -> StoreResult<()> {
        self.save_upload_state("task_output_segment", id, upload).await
    }

    async fn save_upload_state(&self, table: &str, id: i64, upload: &UploadState) -> StoreResult<()> {
        // Table names are fixed call sites, never user input.
        let sql = format!(
            r#"UPDATE {table} SET
               upload_progress = ?, upload_uploaded_bytes = ?, upload_total_bytes = ?,
               upload_cid = ?, upload_file_name = ?, upload_session_id = ?, upload_biz_id = ?,
               upload_endpoint = ?, upload_auth = ?, upload_uri = ?,
               upload_chunk_size = ?, upload_last_part_index = ?
               WHERE id = ?"#
        );
        sqlx::query(&sql)
            .bind(upload.progress)
            .bind(upload.uploaded_bytes)
            .bind(upload.total_bytes)
            .bind(upload.cid)
            .bind(&upload.file_name)
            .bind(&upload.session_id)
            .bind(upload.biz_id)
            .bind(&upload.endpoint)
            .bind(&upload.auth)
            .bind(&upload.uri)
            .bind(upload.chunk_size)
            .bind(upload.last_part_index)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct SourceRow {
    id: i64,
    task_id: i64,
    file_path: String,
    sort_order: i64,
    start_time: Option<String>,
    end_time: Option<String>,
}

impl From<SourceRow> for TaskSourceVideo {
    fn from(row: SourceRow) -> Self {
        TaskSourceVideo {
            id: row.id,
            task_id: row.task_id,
            file_path: row.file_path,
            sort_order: row.sort_order,
            start_time: row.start_time,
            end_time: row.end_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_task(store: &Store) -> i64 {
        let task = SubmissionTask::new("night stream highlights", 17);
        store.insert_task(&task).await.unwrap()
    }

    #[tokio::test]
    async fn test_task_round_trip_with_sources() {
        let store = Store::open_in_memory().await.unwrap();
        let task_id = seed_task(&store).await;

        for (order, (start, end)) in [("00:00:10", "00:02:00"), ("", "00:01:30")].iter().enumerate() {
            let source = TaskSourceVideo {
                id: 0,
                task_id,
                file_path: format!("/src/{order}.mp4"),
                sort_order: order as i64,
                start_time: Some(start.to_string()),
                end_time: Some(end.to_string()),
            };
            store.insert_source(&source).await.unwrap();
        }

        let sources = store.list_sources(task_id).await.unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].sort_order, 0);
        assert_eq!(sources[1].file_path, "/src/1.mp4");
    }

    #[tokio::test]
    async fn test_remote_identity_set_at_most_once() {
        let store = Store::open_in_memory().await.unwrap();
        let task_id = seed_task(&store).await;

        assert!(store.set_task_remote_identity(task_id, "BV1aa", 111).await.unwrap());
        assert!(!store.set_task_remote_identity(task_id, "BV1bb", 222).await.unwrap());

        let task = store.get_task(task_id).await.unwrap();
        assert_eq!(task.bvid.as_deref(), Some("BV1aa"));
        assert_eq!(task.aid, Some(111));
    }

    #[tokio::test]
    async fn test_upload_state_round_trip_on_segment() {
        let store = Store::open_in_memory().await.unwrap();
        let task_id = seed_task(&store).await;

        let mut segment = TaskOutputSegment::new(task_id, "P1", "/out/part_000.mp4", 0);
        segment.upload = UploadState::new(1000);
        let id = store.insert_segment(&segment).await.unwrap();

        let mut upload = store.get_segment(id).await.unwrap().upload;
        upload.begin_session("sess-1", "upos.example.com", "auth-token", "/b/v.mp4", 9, 100);
        upload.record_chunk(0, 100);
        upload.record_chunk(1, 100);
        store.save_segment_upload_state(id, &upload).await.unwrap();

        let loaded = store.get_segment(id).await.unwrap();
        assert_eq!(loaded.upload, upload);
        assert_eq!(loaded.upload.next_part_index(), 2);
        assert!(loaded.upload.uploaded_bytes <= loaded.upload.total_bytes);
    }

    #[tokio::test]
    async fn test_segments_listed_in_part_order() {
        let store = Store::open_in_memory().await.unwrap();
        let task_id = seed_task(&store).await;

        for order in [2i64, 0, 1] {
            let segment =
                TaskOutputSegment::new(task_id, format!("P{order}"), format!("/out/{order}.mp4"), order);
            store.insert_segment(&segment).await.unwrap();
        }

        let segments = store.list_segments(task_id).await.unwrap();
        let orders: Vec<i64> = segments.iter().map(|s| s.part_order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_cascade_delete_removes_children() {
        let store = Store::open_in_memory().await.unwrap();
        let task_id = seed_task(&store).await;

        let source = TaskSourceVideo {
            id: 0,
            task_id,
            file_path: "/src/a.mp4".to_string(),
            sort_order: 0,
            start_time: None,
            end_time: None,
        };
        store.insert_source(&source).await.unwrap();
        store
            .insert_merged(&MergedVideo::new(task_id, "/out/merged.mp4", 120.0))
            .await
            .unwrap();
        store
            .insert_segment(&TaskOutputSegment::new(task_id, "P1", "/out/p0.mp4", 0))
            .await
            .unwrap();

        store.delete_task_cascade(task_id).await.unwrap();
        assert!(store.get_task(task_id).await.is_err());
        assert!(store.list_sources(task_id).await.unwrap().is_empty());
        assert!(store.list_merged(task_id).await.unwrap().is_empty());
        assert!(store.list_segments(task_id).await.unwrap().is_empty());
    }
}
