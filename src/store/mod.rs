//! Session persistence.
//!
//! The control-plane core treats the store as an opaque contract: list
//! sessions in descending recency, fetch one, create one, update one
//! with last-writer-wins semantics. No transactional multi-key updates
//! are ever assumed.

mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::session::Session;

pub use sqlite::{Database, SqliteSessionStore};

/// Query options for listing sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionQuery {
    /// Restrict to a single owner.
    pub owner: Option<String>,
}

/// Contract between the control-plane core and session persistence.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// List sessions in descending recency order.
    async fn list_sessions(&self, query: SessionQuery) -> Result<Vec<Session>>;

    /// Fetch a single session.
    async fn get_session(&self, id: &str) -> Result<Option<Session>>;

    /// Persist a new session.
    async fn create_session(&self, session: &Session) -> Result<()>;

    /// Overwrite a session, last writer wins. Returns the stored value.
    async fn update_session(&self, session: &Session) -> Result<Session>;
}
