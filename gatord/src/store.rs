use std::{fs, path::Path, time::Duration};

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;

use crate::model::{FileRef, HookLease, now_unix};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid persisted payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A received queue message. The receipt handle acknowledges exactly this
/// delivery; an un-acked message becomes redeliverable once its visibility
/// window lapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub receipt: i64,
    pub attempt: i64,
    pub file: FileRef,
}

/// Durable daemon state: the change-feed cursor, the hook lease, and the
/// download queue, all in one sqlite database.
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn get_cursor(&self) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT cursor FROM sync_cursor WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get("cursor")?),
            None => Ok(None),
        }
    }

    pub async fn put_cursor(&self, cursor: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_cursor (id, cursor, updated_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
                cursor = excluded.cursor,
                updated_at = excluded.updated_at",
        )
        .bind(cursor)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_lease(&self) -> Result<Option<HookLease>, StoreError> {
        let row = sqlx::query("SELECT lease FROM hook_lease WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.try_get("lease")?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub async fn put_lease(&self, lease: &HookLease) -> Result<(), StoreError> {
        let raw = serde_json::to_string(lease)?;
        sqlx::query(
            "INSERT INTO hook_lease (id, lease, updated_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
                lease = excluded.lease,
                updated_at = excluded.updated_at",
        )
        .bind(raw)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Enqueues a download, deduplicating on file id: re-enqueueing an
    /// already-pending file replaces its payload and makes it immediately
    /// visible again.
    pub async fn enqueue(&self, file: &FileRef) -> Result<(), StoreError> {
        let payload = serde_json::to_string(file)?;
        sqlx::query(
            "INSERT INTO download_queue (file_id, payload, attempt, visible_at, enqueued_at)
             VALUES (?1, ?2, 0, 0, ?3)
             ON CONFLICT(file_id) DO UPDATE SET
                payload = excluded.payload,
                visible_at = 0",
        )
        .bind(&file.id)
        .bind(payload)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Receives up to `max` visible messages, stamping each with a
    /// visibility deadline so concurrent drains do not race on them.
    pub async fn receive(
        &self,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<QueueMessage>, StoreError> {
        let now = now_unix();
        let rows = sqlx::query(
            "SELECT id, payload, attempt FROM download_queue
             WHERE visible_at <= ?1
             ORDER BY id ASC
             LIMIT ?2",
        )
        .bind(now)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;

        let deadline = now.saturating_add(visibility.as_secs() as i64);
        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let attempt: i64 = row.try_get("attempt")?;
            let claimed = sqlx::query(
                "UPDATE download_queue SET visible_at = ?1, attempt = attempt + 1
                 WHERE id = ?2 AND visible_at <= ?3",
            )
            .bind(deadline)
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;
            if claimed.rows_affected() == 0 {
                // Another drain claimed it between select and update.
                continue;
            }
            let payload: String = row.try_get("payload")?;
            messages.push(QueueMessage {
                receipt: id,
                attempt: attempt + 1,
                file: serde_json::from_str(&payload)?,
            });
        }
        Ok(messages)
    }

    pub async fn ack(&self, receipt: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM download_queue WHERE id = ?1")
            .bind(receipt)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn queue_depth(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS depth FROM download_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("depth")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_store() -> StateStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = StateStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    fn file_ref(id: &str) -> FileRef {
        FileRef {
            id: id.into(),
            name: format!("{id}.pdf"),
            md5: Some("abc".into()),
            size: Some(10),
            group_id: None,
        }
    }

    #[tokio::test]
    async fn cursor_round_trips_and_overwrites() {
        let store = make_store().await;
        assert_eq!(store.get_cursor().await.unwrap(), None);

        store.put_cursor("8841").await.unwrap();
        assert_eq!(store.get_cursor().await.unwrap().as_deref(), Some("8841"));

        store.put_cursor("8900").await.unwrap();
        assert_eq!(store.get_cursor().await.unwrap().as_deref(), Some("8900"));
    }

    #[tokio::test]
    async fn lease_round_trips_as_json() {
        let store = make_store().await;
        assert!(store.get_lease().await.unwrap().is_none());

        let lease = HookLease {
            id: "chan-1".into(),
            resource_id: "res-9".into(),
            resource_uri: None,
            kind: "web_hook".into(),
            address: "https://example.org/hook".into(),
            expiration: 1_700_000_000_000,
            cursor: "8841".into(),
        };
        store.put_lease(&lease).await.unwrap();
        assert_eq!(store.get_lease().await.unwrap(), Some(lease));
    }

    #[tokio::test]
    async fn enqueue_deduplicates_on_file_id() {
        let store = make_store().await;
        store.enqueue(&file_ref("f-1")).await.unwrap();
        store.enqueue(&file_ref("f-1")).await.unwrap();
        store.enqueue(&file_ref("f-2")).await.unwrap();

        assert_eq!(store.queue_depth().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn received_messages_are_invisible_until_window_lapses() {
        let store = make_store().await;
        store.enqueue(&file_ref("f-1")).await.unwrap();

        let first = store
            .receive(10, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].file.id, "f-1");
        assert_eq!(first[0].attempt, 1);

        // Not acknowledged, but still inside the visibility window.
        let second = store
            .receive(10, Duration::from_secs(300))
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn unacked_message_is_redelivered_after_window() {
        let store = make_store().await;
        store.enqueue(&file_ref("f-1")).await.unwrap();

        let first = store.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);

        let redelivered = store.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].attempt, 2);
    }

    #[tokio::test]
    async fn ack_retires_the_message() {
        let store = make_store().await;
        store.enqueue(&file_ref("f-1")).await.unwrap();

        let messages = store.receive(10, Duration::ZERO).await.unwrap();
        store.ack(messages[0].receipt).await.unwrap();

        assert!(store.receive(10, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(store.queue_depth().await.unwrap(), 0);
    }
}
