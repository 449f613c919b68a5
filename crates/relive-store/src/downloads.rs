//! Video download queries.

use chrono::{DateTime, Utc};
use relive_models::{DownloadStatus, VideoDownload};

use crate::{Store, StoreError, StoreResult};

#[derive(sqlx::FromRow)]
struct DownloadRow {
    id: i64,
    bvid: String,
    aid: Option<i64>,
    cid: Option<i64>,
    title: String,
    url: Option<String>,
    local_path: String,
    status: i64,
    progress_done: i64,
    progress_total: i64,
    resolution: Option<i64>,
    codec: Option<String>,
    format: Option<String>,
    part_index: i64,
    part_count: i64,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DownloadRow> for VideoDownload {
    fn from(row: DownloadRow) -> Self {
        VideoDownload {
            id: row.id,
            bvid: row.bvid,
            aid: row.aid,
            cid: row.cid,
            title: row.title,
            url: row.url,
            local_path: row.local_path,
            status: DownloadStatus::from_code(row.status),
            progress_done: row.progress_done,
            progress_total: row.progress_total,
            resolution: row.resolution,
            codec: row.codec,
            format: row.format,
            part_index: row.part_index,
            part_count: row.part_count,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl Store {
    pub async fn insert_download(&self, dl: &VideoDownload) -> StoreResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO video_download
               (bvid, aid, cid, title, url, local_path, status, progress_done, progress_total,
                resolution, codec, format, part_index, part_count, error_message, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&dl.bvid)
        .bind(dl.aid)
        .bind(dl.cid)
        .bind(&dl.title)
        .bind(&dl.url)
        .bind(&dl.local_path)
        .bind(dl.status.as_code())
        .bind(dl.progress_done)
        .bind(dl.progress_total)
        .bind(dl.resolution)
        .bind(&dl.codec)
        .bind(&dl.format)
        .bind(dl.part_index)
        .bind(dl.part_count)
        .bind(&dl.error_message)
        .bind(dl.created_at)
        .bind(dl.updated_at)
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_download(&self, id: i64) -> StoreResult<VideoDownload> {
        let row: DownloadRow = sqlx::query_as("SELECT * FROM video_download WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::not_found("download", id))?;
        Ok(row.into())
    }

    pub async fn list_downloads(&self) -> StoreResult<Vec<VideoDownload>> {
        let rows: Vec<DownloadRow> =
            sqlx::query_as("SELECT * FROM video_download ORDER BY created_at DESC")
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Jobs occupying queue capacity (pending + downloading). Used to apply
    /// backpressure at submission time.
    pub async fn count_active_downloads(&self) -> StoreResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM video_download WHERE status IN (0, 1)")
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }

    /// Claim the oldest pending download for a worker. The conditional
    /// UPDATE makes the claim atomic across concurrent workers.
    pub async fn claim_next_pending_download(&self) -> StoreResult<Option<VideoDownload>> {
        let row: Option<DownloadRow> = sqlx::query_as(
            "SELECT * FROM video_download WHERE status = 0 ORDER BY created_at LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let claimed = sqlx::query(
            "UPDATE video_download SET status = 1, updated_at = ? WHERE id = ? AND status = 0",
        )
        .bind(Utc::now())
        .bind(row.id)
        .execute(self.pool())
        .await?
        .rows_affected();

        if claimed == 0 {
            // Another worker took it first.
            return Ok(None);
        }

        let mut dl: VideoDownload = row.into();
        dl.status = DownloadStatus::Downloading;
        Ok(Some(dl))
    }

    /// Byte-level progress update. Progress is monotonic except on explicit
    /// retry, which goes through [`Store::retry_download`].
    pub async fn update_download_progress(&self, id: i64, done: i64, total: i64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE video_download SET progress_done = MAX(progress_done, ?), progress_total = ?, updated_at = ? WHERE id = ?",
        )
        .bind(done)
        .bind(total)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Record the negotiated stream selection for a claimed job.
    pub async fn update_download_selection(
        &self,
        id: i64,
        url: &str,
        resolution: Option<i64>,
        codec: Option<&str>,
        format: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE video_download SET url = ?, resolution = ?, codec = ?, format = ?, updated_at = ? WHERE id = ?",
        )
        .bind(url)
        .bind(resolution)
        .bind(codec)
        .bind(format)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_download_status(&self, id: i64, status: DownloadStatus) -> StoreResult<()> {
        sqlx::query("UPDATE video_download SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_code())
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn fail_download(&self, id: i64, error: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE video_download SET status = 3, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Cooperative pause: keeps the persisted byte offset for resume.
    pub async fn pause_download(&self, id: i64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE video_download SET status = 4, updated_at = ? WHERE id = ? AND status IN (0, 1)",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Resume a paused job; the worker reopens from `progress_done`.
    pub async fn resume_download(&self, id: i64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE video_download SET status = 0, updated_at = ? WHERE id = ? AND status = 4",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Explicit retry of a failed job: restart from zero, clearing prior
    /// progress and the stale URL (play URLs expire).
    pub async fn retry_download(&self, id: i64) -> StoreResult<()> {
        sqlx::query(
            r#"UPDATE video_download
               SET status = 0, progress_done = 0, error_message = NULL, url = NULL, updated_at = ?
               WHERE id = ? AND status = 3"#,
        )
        .bind(Utc::now())
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
    async fn test_claim_is_exclusive() {
        let store = Store::open_in_memory().await.unwrap();
        let dl = VideoDownload::new("BV1xx", "part 1", "/dl/p1.mp4", 1, 1);
        store.insert_download(&dl).await.unwrap();

        let first = store.claim_next_pending_download().await.unwrap();
        assert!(first.is_some());
        assert_eq!(first.unwrap().status, DownloadStatus::Downloading);

        let second = store.claim_next_pending_download().await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_progress_never_regresses() {
        let store = Store::open_in_memory().await.unwrap();
        let dl = VideoDownload::new("BV1xx", "part 1", "/dl/p1.mp4", 1, 1);
        let id = store.insert_download(&dl).await.unwrap();

        store.update_download_progress(id, 400, 1000).await.unwrap();
        store.update_download_progress(id, 300, 1000).await.unwrap();
        let loaded = store.get_download(id).await.unwrap();
        assert_eq!(loaded.progress_done, 400);
    }

    #[tokio::test]
    async fn test_pause_resume_keeps_offset() {
        let store = Store::open_in_memory().await.unwrap();
        let dl = VideoDownload::new("BV1xx", "part 1", "/dl/p1.mp4", 1, 1);
        let id = store.insert_download(&dl).await.unwrap();
        store.claim_next_pending_download().await.unwrap();
        store.update_download_progress(id, 400, 1000).await.unwrap();

        store.pause_download(id).await.unwrap();
        let paused = store.get_download(id).await.unwrap();
        assert_eq!(paused.status, DownloadStatus::Paused);
        assert_eq!(paused.progress_done, 400);

        store.resume_download(id).await.unwrap();
        let resumed = store.get_download(id).await.unwrap();
        assert_eq!(resumed.status, DownloadStatus::Pending);
        assert_eq!(resumed.progress_done, 400);
    }

    #[tokio::test]
    async fn test_retry_resets_progress_and_url() {
        let store = Store::open_in_memory().await.unwrap();
        let dl = VideoDownload::new("BV1xx", "part 1", "/dl/p1.mp4", 1, 1);
        let id = store.insert_download(&dl).await.unwrap();
        store
            .update_download_selection(id, "https://cdn/x.m4s", Some(64), Some("avc1"), "dash")
            .await
            .unwrap();
        store.update_download_progress(id, 400, 1000).await.unwrap();
        store.fail_download(id, "503").await.unwrap();

        store.retry_download(id).await.unwrap();
        let retried = store.get_download(id).await.unwrap();
        assert_eq!(retried.status, DownloadStatus::Pending);
        assert_eq!(retried.progress_done, 0);
        assert!(retried.url.is_none());
        assert!(retried.error_message.is_none());
    }

    #[tokio::test]
    async fn test_active_count_for_backpressure() {
        let store = Store::open_in_memory().await.unwrap();
        for i in 0..3 {
            let dl = VideoDownload::new("BV1xx", format!("part {i}"), format!("/dl/p{i}.mp4"), 1, 1);
            store.insert_download(&dl).await.unwrap();
        }
        assert_eq!(store.count_active_downloads().await.unwrap(), 3);

        let claimed = store.claim_next_pending_download().await.unwrap().unwrap();
        store.set_download_status(claimed.id, DownloadStatus::Done).await.unwrap();
        assert_eq!(store.count_active_downloads().await.unwrap(), 2);
    }
}
