#[cfg(feature = "database")]
use anyhow::{Context, Result};
#[cfg(feature = "database")]
use async_trait::async_trait;
#[cfg(feature = "database")]
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Row, SqlitePool};
#[cfg(feature = "database")]
use tracing::info;

#[cfg(feature = "database")]
use crate::automerge::{ScheduleStore, UniqueQueue};
#[cfg(feature = "database")]
use crate::config::DatabaseConfig;
#[cfg(feature = "database")]
use crate::types::{PullId, ScheduledAutoMerge};

#[cfg(feature = "database")]
/// Database manager for the durable auto-merge state
#[derive(Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

#[cfg(feature = "database")]
impl DatabaseManager {
    /// Connect, creating the database file and running migrations as configured
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        if !sqlx::Sqlite::database_exists(&config.url).await? {
            info!("Creating database at {}", config.url);
            sqlx::Sqlite::create_database(&config.url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .with_context(|| format!("Failed to connect to {}", config.url))?;

        if config.auto_migrate {
            info!("Running database migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Database migrations completed");
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn schedule_store(&self) -> SqliteScheduleStore {
        SqliteScheduleStore {
            pool: self.pool.clone(),
        }
    }

    /// Opens the queue and hands unacknowledged keys out again.
    pub async fn unique_queue(&self) -> Result<SqliteUniqueQueue> {
        let queue = SqliteUniqueQueue {
            pool: self.pool.clone(),
        };
        let reset = queue.reset_in_flight().await?;
        if reset > 0 {
            info!("Requeued {} unacknowledged auto merge keys", reset);
        }
        Ok(queue)
    }

    /// Close database connections gracefully
    pub async fn shutdown(&self) {
        info!("Shutting down database connections...");
        self.pool.close().await;
        info!("Database connections closed");
    }
}

#[cfg(feature = "database")]
pub struct SqliteScheduleStore {
    pool: SqlitePool,
}

#[cfg(feature = "database")]
#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn insert(&self, schedule: ScheduledAutoMerge) -> Result<bool> {
        let doer = serde_json::to_string(&schedule.doer)?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO scheduled_auto_merges (pull_id, doer, style, message, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(schedule.pull_id)
        .bind(doer)
        .bind(schedule.style.as_str())
        .bind(&schedule.message)
        .bind(schedule.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, pull_id: PullId) -> Result<Option<ScheduledAutoMerge>> {
        let row = sqlx::query(
            r#"
            SELECT pull_id, doer, style, message, created_at
            FROM scheduled_auto_merges
            WHERE pull_id = ?1
            "#,
        )
        .bind(pull_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let doer: String = row.get("doer");
        let style: String = row.get("style");
        let created_at: String = row.get("created_at");

        Ok(Some(ScheduledAutoMerge {
            pull_id: row.get("pull_id"),
            doer: serde_json::from_str(&doer)?,
            style: style.parse().map_err(anyhow::Error::msg)?,
            message: row.get("message"),
            created_at: chrono::DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&chrono::Utc),
        }))
    }

    async fn delete(&self, pull_id: PullId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scheduled_auto_merges WHERE pull_id = ?1")
            .bind(pull_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(feature = "database")]
/// Unique queue backed by a table keyed on the queue key.
///
/// Rows are `pending` until popped and `in_flight` until acknowledged.
/// Pushing a key that is in flight re-arms it as pending.
pub struct SqliteUniqueQueue {
    pool: SqlitePool,
}

#[cfg(feature = "database")]
impl SqliteUniqueQueue {
    pub async fn reset_in_flight(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE auto_merge_queue SET state = 'pending' WHERE state = 'in_flight'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl UniqueQueue for SqliteUniqueQueue {
    async fn push(&self, key: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO auto_merge_queue (key, state, enqueued_at)
            VALUES (?1, 'pending', datetime('now'))
            ON CONFLICT(key) DO UPDATE SET state = 'pending', enqueued_at = datetime('now')
            WHERE auto_merge_queue.state = 'in_flight'
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn pop(&self) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            UPDATE auto_merge_queue SET state = 'in_flight'
            WHERE key = (
                SELECT key FROM auto_merge_queue
                WHERE state = 'pending'
                ORDER BY enqueued_at ASC, rowid ASC
                LIMIT 1
            )
            RETURNING key
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| row.get("key")))
    }

    async fn ack(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM auto_merge_queue WHERE key = ?1 AND state = 'in_flight'")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS pending FROM auto_merge_queue WHERE state = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        let pending: i64 = row.get("pending");
        Ok(pending as usize)
    }
}

#[cfg(all(test, feature = "database"))]
mod tests {
    use super::*;
    use crate::types::{MergeStyle, User};
    use chrono::Utc;

    async fn manager() -> (tempfile::TempDir, DatabaseManager) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("state.db").display());
        let config = DatabaseConfig {
            url,
            max_connections: 1,
            auto_migrate: true,
        };
        let manager = DatabaseManager::new(&config).await.unwrap();
        (dir, manager)
    }

    #[tokio::test]
    async fn test_schedule_store_is_unique_per_pull() {
        let (_dir, db) = manager().await;
        let store = db.schedule_store();
        let schedule = ScheduledAutoMerge {
            pull_id: 7,
            doer: User {
                id: 1,
                name: "alice".into(),
                email: "alice@example.com".into(),
            },
            style: MergeStyle::Squash,
            message: String::new(),
            created_at: Utc::now(),
        };

        assert!(store.insert(schedule.clone()).await.unwrap());
        assert!(!store.insert(schedule).await.unwrap());
        let loaded = store.get(7).await.unwrap().unwrap();
        assert_eq!(loaded.style, MergeStyle::Squash);
        assert!(store.delete(7).await.unwrap());
        assert!(store.get(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_requeues_in_flight_keys_on_restart() {
        let (_dir, db) = manager().await;
        let queue = db.unique_queue().await.unwrap();
        assert!(queue.push("1_abc").await.unwrap());
        assert!(!queue.push("1_abc").await.unwrap());
        assert_eq!(queue.pop().await.unwrap().as_deref(), Some("1_abc"));
        assert_eq!(queue.len().await.unwrap(), 0);

        let reopened = db.unique_queue().await.unwrap();
        assert_eq!(reopened.pop().await.unwrap().as_deref(), Some("1_abc"));
        reopened.ack("1_abc").await.unwrap();
        assert!(reopened.pop().await.unwrap().is_none());
    }
}
