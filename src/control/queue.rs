//! Ordered, deduplicated queue of sessions awaiting a response.

use anyhow::{Context, Result};
use log::{debug, warn};
use tokio::sync::Mutex;

use crate::session::{Session, SessionFilter};
use crate::store::{SessionQuery, SessionStore};

/// FIFO-among-matches queue of pending sessions.
///
/// The ordered list is held behind a single mutex for the entirety of
/// every operation; critical sections are O(n) in queue length, which
/// is acceptable at expected depths (hundreds).
#[derive(Debug, Default)]
pub struct SessionQueue {
    sessions: Mutex<Vec<Session>>,
}

impl SessionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to the tail of the queue.
    ///
    /// If a session with the same id is already queued it is replaced
    /// in place, preserving its position: a user edit mid-flight must
    /// not lose queue priority.
    pub async fn push(&self, session: Session) {
        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.iter_mut().find(|s| s.id == session.id) {
            debug!("replacing queued session {} in place", session.id);
            *existing = session;
            return;
        }

        sessions.push(session);
    }

    /// Remove and return the first session matching the filter.
    ///
    /// FIFO among matches; the queue is unchanged when nothing matches.
    pub async fn shift(&self, filter: &SessionFilter) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;

        let idx = sessions.iter().position(|s| filter.matches(s))?;
        Some(sessions.remove(idx))
    }

    /// Replace the queue with the store-visible sessions still awaiting
    /// a response, oldest first.
    ///
    /// The store returns descending recency, so the list is walked in
    /// reverse. Sessions with an empty interaction list violate the
    /// store invariant; they are skipped with a warning rather than
    /// failing recovery.
    pub async fn rebuild(&self, store: &dyn SessionStore) -> Result<usize> {
        let listed = store
            .list_sessions(SessionQuery::default())
            .await
            .context("listing sessions for queue rebuild")?;

        let mut rebuilt = Vec::new();
        for session in listed.into_iter().rev() {
            if session.interactions.is_empty() {
                warn!(
                    "skipping session {} with no interactions during rebuild",
                    session.id
                );
                continue;
            }
            if !session.awaiting_response() {
                continue;
            }
            rebuilt.push(session);
        }

        let mut sessions = self.sessions.lock().await;
        let count = rebuilt.len();
        *sessions = rebuilt;
        Ok(count)
    }

    /// Number of queued sessions.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Queued session ids in order, for observability.
    pub async fn snapshot(&self) -> Vec<String> {
        self.sessions
            .lock()
            .await
            .iter()
            .map(|s| s.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionMode, SessionType};

    fn session(message: &str, session_type: SessionType) -> Session {
        Session::new(
            "alice",
            SessionMode::Create,
            session_type,
            "llama3:instruct",
            message,
        )
    }

    #[tokio::test]
    async fn test_push_appends_in_order() {
        let queue = SessionQueue::new();
        let a = session("a", SessionType::Text);
        let b = session("b", SessionType::Text);

        queue.push(a.clone()).await;
        queue.push(b.clone()).await;

        assert_eq!(queue.snapshot().await, vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn test_push_dedup_preserves_position() {
        let queue = SessionQueue::new();
        let a = session("a", SessionType::Text);
        let x = session("x", SessionType::Text);
        let b = session("b", SessionType::Text);

        queue.push(a.clone()).await;
        queue.push(x.clone()).await;
        queue.push(b.clone()).await;

        let mut edited = x.clone();
        edited.interactions[0].message = "x edited".to_string();
        queue.push(edited).await;

        assert_eq!(
            queue.snapshot().await,
            vec![a.id.clone(), x.id.clone(), b.id.clone()]
        );

        let filter = SessionFilter::default();
        queue.shift(&filter).await.unwrap();
        let shifted = queue.shift(&filter).await.unwrap();
        assert_eq!(shifted.id, x.id);
        assert_eq!(shifted.interactions[0].message, "x edited");
    }

    #[tokio::test]
    async fn test_shift_fifo_among_matches() {
        let queue = SessionQueue::new();
        let a = session("a", SessionType::Text);
        let b = session("b", SessionType::Image);
        let c = session("c", SessionType::Text);

        queue.push(a.clone()).await;
        queue.push(b.clone()).await;
        queue.push(c.clone()).await;

        let filter = SessionFilter {
            session_type: Some(SessionType::Text),
            ..Default::default()
        };

        assert_eq!(queue.shift(&filter).await.unwrap().id, a.id);
        assert_eq!(queue.shift(&filter).await.unwrap().id, c.id);
        assert!(queue.shift(&filter).await.is_none());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_shift_miss_leaves_queue_unchanged() {
        let queue = SessionQueue::new();
        queue.push(session("a", SessionType::Image)).await;
        queue.push(session("b", SessionType::Image)).await;

        let filter = SessionFilter {
            session_type: Some(SessionType::Text),
            ..Default::default()
        };

        assert!(queue.shift(&filter).await.is_none());
        assert_eq!(queue.len().await, 2);
    }
}
