use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    ConflictSnafu, CreateSqliteDirectorySnafu, InvariantViolationSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, StorageResult,
};
use super::feed::{InsertFeed, InsertSubscription};
use super::ids::{MessageId, UserId};
use super::types::{MessageRecord, MessageRole, NewMessage};
use super::{BoxFuture, MessageStore};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
    feed: InsertFeed,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // One long-lived connection serializes writes and keeps `:memory:` databases alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::info!(database_url = %database_url, "opened chat message store");

        Ok(Self {
            pool,
            database_url,
            feed: InsertFeed::default(),
        })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    async fn fetch_rows(&self, user_id: UserId) -> StorageResult<Vec<MessageRecord>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, user_id, role, content, created_at FROM chat_messages WHERE user_id = ? ORDER BY created_at ASC, seq ASC",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-fetch-query",
        })?;

        rows.into_iter().map(message_row_to_record).collect()
    }

    async fn insert_row(&self, user_id: UserId, input: NewMessage) -> StorageResult<MessageRecord> {
        if input.content.trim().is_empty() {
            return ConflictSnafu {
                stage: "message-insert-empty-content",
                entity: "chat_message",
                details: "message content must not be blank".to_string(),
            }
            .fail();
        }

        let message_id = MessageId::new_v7();
        let created_at = Utc::now();

        sqlx::query(
            "INSERT INTO chat_messages (id, user_id, role, content, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(message_id.to_string())
        .bind(user_id.to_string())
        .bind(input.role.as_str())
        .bind(input.content.clone())
        .bind(created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-insert-apply",
        })?;

        let record = MessageRecord {
            id: message_id,
            user_id,
            role: input.role,
            content: input.content,
            created_at: timestamp_from_millis(created_at.timestamp_millis(), "message-insert-created-at")?,
        };

        self.feed.publish(record.clone());
        tracing::debug!(
            message_id = %record.id,
            user_id = %record.user_id,
            role = record.role.as_str(),
            "inserted chat message"
        );

        Ok(record)
    }
}

impl MessageStore for SqliteStorage {
    fn fetch_messages<'a>(
        &'a self,
        user_id: UserId,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(self.fetch_rows(user_id))
    }

    fn insert_message<'a>(
        &'a self,
        user_id: UserId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(self.insert_row(user_id, input))
    }

    fn subscribe_inserts(&self, user_id: UserId) -> InsertSubscription {
        self.feed.subscribe(user_id)
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    user_id: String,
    role: String,
    content: String,
    created_at: i64,
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        user_id: UserId::parse(&row.user_id)?,
        role: role_from_sql(&row.role)?,
        content: row.content,
        created_at: timestamp_from_millis(row.created_at, "message-row-created-at")?,
    })
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn timestamp_from_millis(value: i64, stage: &'static str) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value).context(InvariantViolationSnafu {
        stage,
        details: format!("sqlite timestamp '{value}' is out of range"),
    })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    async fn memory_store() -> SqliteStorage {
        SqliteStorage::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn fetch_returns_only_the_owners_rows_in_insert_order() {
        let store = memory_store().await;
        let ada = UserId::from_email("ada@example.com");
        let grace = UserId::from_email("grace@example.com");

        store
            .insert_message(ada, NewMessage::user("Tokyo in winter"))
            .await
            .unwrap();
        store
            .insert_message(grace, NewMessage::user("Rave party"))
            .await
            .unwrap();
        store
            .insert_message(ada, NewMessage::assistant("Here are your outfit suggestions"))
            .await
            .unwrap();

        let history = store.fetch_messages(ada).await.unwrap();
        let contents = history
            .iter()
            .map(|record| record.content.as_str())
            .collect::<Vec<_>>();

        assert_eq!(
            contents,
            vec!["Tokyo in winter", "Here are your outfit suggestions"]
        );
        assert!(history.iter().all(|record| record.user_id == ada));
        assert_eq!(history[1].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn insert_publishes_to_owner_subscription() {
        let store = memory_store().await;
        let ada = UserId::from_email("ada@example.com");
        let mut subscription = store.subscribe_inserts(ada);

        let inserted = store
            .insert_message(ada, NewMessage::user("Baby shower outfit"))
            .await
            .unwrap();

        assert_eq!(subscription.recv().await, Some(inserted));
    }

    #[tokio::test]
    async fn blank_content_is_rejected() {
        let store = memory_store().await;
        let ada = UserId::from_email("ada@example.com");

        let error = store
            .insert_message(ada, NewMessage::user("   "))
            .await
            .unwrap_err();

        assert!(matches!(error, StorageError::Conflict { .. }));
        assert!(store.fetch_messages(ada).await.unwrap().is_empty());
    }

    #[test]
    fn database_locations_normalize_to_sqlite_urls() {
        assert_eq!(normalize_database_url(":memory:"), "sqlite::memory:");
        assert_eq!(
            normalize_database_url("sqlite://already.db"),
            "sqlite://already.db"
        );
        assert_eq!(
            normalize_database_url("data/chat.db"),
            "sqlite://data/chat.db"
        );
    }
}
