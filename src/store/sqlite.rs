//! SQLite-backed session store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::path::Path;
use std::str::FromStr;

use super::{SessionQuery, SessionStore};
use crate::session::{Interaction, Session};

/// Database connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) a database at the given path.
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory: {}", parent.display()))?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .context("parsing database URL")?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("connecting to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory database URL")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("connecting to in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")?;
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Raw session row; interactions are a JSON column.
#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    owner: String,
    mode: String,
    session_type: String,
    model: String,
    adapter_dir: Option<String>,
    created_at: String,
    interactions: String,
}

impl SessionRow {
    fn into_session(self) -> Result<Session> {
        let interactions: Vec<Interaction> =
            serde_json::from_str(&self.interactions).context("parsing interactions JSON")?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .context("parsing created_at")?
            .with_timezone(&Utc);

        Ok(Session {
            id: self.id,
            owner: self.owner,
            mode: self.mode.parse().map_err(anyhow::Error::msg)?,
            session_type: self.session_type.parse().map_err(anyhow::Error::msg)?,
            model: self.model,
            adapter_dir: self.adapter_dir,
            created_at,
            interactions,
        })
    }
}

/// Session store backed by SQLite.
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn list_sessions(&self, query: SessionQuery) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = match query.owner {
            Some(owner) => {
                sqlx::query_as(
                    r#"
                    SELECT id, owner, mode, session_type, model, adapter_dir,
                           created_at, interactions
                    FROM sessions
                    WHERE owner = ?
                    ORDER BY updated_at DESC
                    "#,
                )
                .bind(owner)
                .fetch_all(&self.pool)
                .await
                .context("listing sessions by owner")?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT id, owner, mode, session_type, model, adapter_dir,
                           created_at, interactions
                    FROM sessions
                    ORDER BY updated_at DESC
                    "#,
                )
                .fetch_all(&self.pool)
                .await
                .context("listing sessions")?
            }
        };

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, owner, mode, session_type, model, adapter_dir,
                   created_at, interactions
            FROM sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session")?;

        row.map(SessionRow::into_session).transpose()
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        let interactions =
            serde_json::to_string(&session.interactions).context("encoding interactions")?;

        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, owner, mode, session_type, model, adapter_dir,
                created_at, updated_at, interactions
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.owner)
        .bind(session.mode.to_string())
        .bind(session.session_type.to_string())
        .bind(&session.model)
        .bind(&session.adapter_dir)
        .bind(session.created_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(interactions)
        .execute(&self.pool)
        .await
        .context("creating session")?;

        Ok(())
    }

    async fn update_session(&self, session: &Session) -> Result<Session> {
        let interactions =
            serde_json::to_string(&session.interactions).context("encoding interactions")?;

        sqlx::query(
            r#"
            UPDATE sessions
            SET owner = ?, mode = ?, session_type = ?, model = ?,
                adapter_dir = ?, updated_at = ?, interactions = ?
            WHERE id = ?
            "#,
        )
        .bind(&session.owner)
        .bind(session.mode.to_string())
        .bind(session.session_type.to_string())
        .bind(&session.model)
        .bind(&session.adapter_dir)
        .bind(Utc::now().to_rfc3339())
        .bind(interactions)
        .bind(&session.id)
        .execute(&self.pool)
        .await
        .context("updating session")?;

        Ok(session.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Interaction, SessionMode, SessionType};

    async fn test_store() -> SqliteSessionStore {
        let db = Database::in_memory().await.unwrap();
        SqliteSessionStore::new(&db)
    }

    fn session(owner: &str, message: &str) -> Session {
        Session::new(
            owner,
            SessionMode::Create,
            SessionType::Text,
            "llama3:instruct",
            message,
        )
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = test_store().await;
        let s = session("alice", "hi");

        store.create_session(&s).await.unwrap();

        let fetched = store.get_session(&s.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, s.id);
        assert_eq!(fetched.interactions.len(), 1);
        assert_eq!(fetched.interactions[0].message, "hi");
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = test_store().await;
        assert!(store.get_session("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_last_writer_wins() {
        let store = test_store().await;
        let mut s = session("alice", "hi");
        store.create_session(&s).await.unwrap();

        s.interactions.push(Interaction::system_pending());
        store.update_session(&s).await.unwrap();

        s.trailing_interaction_mut().unwrap().message = "hello".to_string();
        store.update_session(&s).await.unwrap();

        let fetched = store.get_session(&s.id).await.unwrap().unwrap();
        assert_eq!(fetched.interactions.len(), 2);
        assert_eq!(fetched.trailing_interaction().unwrap().message, "hello");
    }

    #[tokio::test]
    async fn test_list_descending_recency() {
        let store = test_store().await;

        let first = session("alice", "first");
        store.create_session(&first).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let second = session("alice", "second");
        store.create_session(&second).await.unwrap();

        let listed = store.list_sessions(SessionQuery::default()).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
    }

    #[tokio::test]
    async fn test_list_filtered_by_owner() {
        let store = test_store().await;
        store.create_session(&session("alice", "a")).await.unwrap();
        store.create_session(&session("bob", "b")).await.unwrap();

        let listed = store
            .list_sessions(SessionQuery {
                owner: Some("bob".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].owner, "bob");
    }
}
