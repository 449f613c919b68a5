//! Anchor (subscribed room) queries.

use chrono::{DateTime, Utc};
use relive_models::{Anchor, LiveStatus};

use crate::{Store, StoreResult};

#[derive(sqlx::FromRow)]
struct AnchorRow {
    room_id: i64,
    name: String,
    live_status: i64,
    title: Option<String>,
    last_checked_at: Option<DateTime<Utc>>,
    auto_record: i64,
    sync_enabled: i64,
    sync_path: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<AnchorRow> for Anchor {
    fn from(row: AnchorRow) -> Self {
        Anchor {
            room_id: row.room_id,
            name: row.name,
            live_status: LiveStatus::from_code(row.live_status),
            title: row.title,
            last_checked_at: row.last_checked_at,
            auto_record: row.auto_record != 0,
            sync_enabled: row.sync_enabled != 0,
            sync_path: row.sync_path,
            created_at: row.created_at,
        }
    }
}

impl Store {
    /// Subscribe a room, or refresh its name if already subscribed.
    pub async fn upsert_anchor(&self, anchor: &Anchor) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO anchor (room_id, name, live_status, title, last_checked_at, auto_record, sync_enabled, sync_path, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT (room_id) DO UPDATE SET name = excluded.name"#,
        )
        .bind(anchor.room_id)
        .bind(&anchor.name)
        .bind(anchor.live_status.as_code())
        .bind(&anchor.title)
        .bind(anchor.last_checked_at)
        .bind(anchor.auto_record as i64)
        .bind(anchor.sync_enabled as i64)
        .bind(&anchor.sync_path)
        .bind(anchor.created_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_anchor(&self, room_id: i64) -> StoreResult<Option<Anchor>> {
        let row: Option<AnchorRow> = sqlx::query_as("SELECT * FROM anchor WHERE room_id = ?")
            .bind(room_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(Into::into))
    }

    pub async fn list_anchors(&self) -> StoreResult<Vec<Anchor>> {
        let rows: Vec<AnchorRow> = sqlx::query_as("SELECT * FROM anchor ORDER BY created_at")
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Rooms that should be monitored for auto-recording.
    pub async fn list_auto_record_anchors(&self) -> StoreResult<Vec<Anchor>> {
        let rows: Vec<AnchorRow> =
            sqlx::query_as("SELECT * FROM anchor WHERE auto_record = 1 ORDER BY room_id")
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Record a status poll result.
    pub async fn update_anchor_status(
        &self,
        room_id: i64,
        status: LiveStatus,
        title: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE anchor SET live_status = ?, title = COALESCE(?, title), last_checked_at = ? WHERE room_id = ?",
        )
        .bind(status.as_code())
        .bind(title)
        .bind(Utc::now())
        .bind(room_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_anchor_auto_record(&self, room_id: i64, auto_record: bool) -> StoreResult<()> {
        sqlx::query("UPDATE anchor SET auto_record = ? WHERE room_id = ?")
            .bind(auto_record as i64)
            .bind(room_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_anchor_sync(
        &self,
        room_id: i64,
        enabled: bool,
        path: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE anchor SET sync_enabled = ?, sync_path = ? WHERE room_id = ?")
            .bind(enabled as i64)
            .bind(path)
            .bind(room_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Unsubscribe. Recordings keep their room_id reference and are not
    /// deleted with the anchor.
    pub async fn delete_anchor(&self, room_id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM anchor WHERE room_id = ?")
            .bind(room_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
