//! Control-plane core: dispatch, response reconciliation, recovery.

use anyhow::{Context, Result};
use dashmap::DashMap;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use super::queue::SessionQueue;
use crate::model;
use crate::protocol::{InferenceRequest, ModelInstanceState, TaskResponse, TaskResponseKind};
use crate::session::{Interaction, Session, SessionFilter, SessionMode, SessionType};
use crate::store::SessionStore;

/// Buffer size for the hub-wide update channel.
const UPDATE_BUFFER_SIZE: usize = 256;

/// Buffer size for per-session stream channels.
const STREAM_BUFFER_SIZE: usize = 64;

/// Parameters for creating a session from the first user message.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub owner: String,
    pub mode: SessionMode,
    pub session_type: SessionType,
    pub model: String,
    pub message: String,
    pub adapter_dir: Option<String>,
}

/// The scheduler-side core.
///
/// Owns the session queue, the in-flight session registry, and the
/// subscriber channels. Runners talk to it through
/// [`Controller::next_request`] and [`Controller::handle_response`].
pub struct Controller {
    store: Arc<dyn SessionStore>,
    queue: SessionQueue,

    /// Sessions currently streaming a response. Lock is held for map
    /// insert/lookup/remove only; mutation happens on a clone.
    active: Mutex<HashMap<String, Session>>,

    /// Per-session response streams, dropped when the result frame has
    /// been applied.
    streams: DashMap<String, broadcast::Sender<TaskResponse>>,

    /// Hub-wide feed of every applied frame.
    updates: broadcast::Sender<TaskResponse>,

    /// Last-reported instance snapshots, keyed by instance id.
    instances: Mutex<HashMap<String, ModelInstanceState>>,
}

impl Controller {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER_SIZE);
        Self {
            store,
            queue: SessionQueue::new(),
            active: Mutex::new(HashMap::new()),
            streams: DashMap::new(),
            updates,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild the queue from the store. Must complete before serving.
    ///
    /// In-flight streams from before a crash are not resumed: their
    /// trailing interaction is still user-authored, so they re-enter
    /// the queue here and are dispatched afresh.
    pub async fn start(&self) -> Result<()> {
        let count = self
            .queue
            .rebuild(self.store.as_ref())
            .await
            .context("rebuilding session queue")?;
        info!("session queue recovered with {} pending sessions", count);
        Ok(())
    }

    /// Create a session from the first user message and enqueue it.
    pub async fn add_session(&self, new: NewSession) -> Result<Session> {
        let mut session = Session::new(
            new.owner,
            new.mode,
            new.session_type,
            new.model,
            new.message,
        );
        session.adapter_dir = new.adapter_dir;

        self.store
            .create_session(&session)
            .await
            .context("persisting new session")?;
        self.queue.push(session.clone()).await;

        info!("session {} queued for model {}", session.id, session.model);
        Ok(session)
    }

    /// Re-enqueue an edited session. Replaces any queued copy in place
    /// so the edit does not lose queue priority.
    pub async fn push_session(&self, session: Session) -> Result<()> {
        self.store
            .update_session(&session)
            .await
            .context("persisting edited session")?;
        self.queue.push(session).await;
        Ok(())
    }

    /// Hand the next matching session to a runner as an inference
    /// request, or `None` when nothing in the queue matches.
    pub async fn next_request(&self, filter: &SessionFilter) -> Result<Option<InferenceRequest>> {
        let Some(mut session) = self.queue.shift(filter).await else {
            return Ok(None);
        };

        // Finetune branches are reserved; nothing renders a prompt for
        // them yet.
        if session.mode != SessionMode::Create {
            warn!(
                "dropping {} session {}: mode not dispatchable",
                session.mode, session.id
            );
            return Ok(None);
        }

        let prompt = model::render_prompt(&session);

        // The pending system turn lives only in the active registry
        // until the first frame persists it. A crash before any frame
        // leaves the stored trailing interaction user-authored, so the
        // session re-enters the queue on restart.
        let pending = Interaction::system_pending();
        let interaction_id = pending.id.clone();
        session.interactions.push(pending);

        let request = InferenceRequest {
            session_id: session.id.clone(),
            interaction_id,
            owner: session.owner.clone(),
            model: session.model.clone(),
            prompt,
            stream: session.session_type == SessionType::Text,
        };

        self.streams
            .entry(session.id.clone())
            .or_insert_with(|| broadcast::channel(STREAM_BUFFER_SIZE).0);

        let mut active = self.active.lock().await;
        active.insert(session.id.clone(), session);

        Ok(Some(request))
    }

    /// Apply one response frame to its session.
    ///
    /// Stream frames append their delta to the trailing interaction and
    /// persist; the result frame replaces the message with the full
    /// concatenation, marks the interaction finished, and retires the
    /// session from the active registry. Frames for unknown sessions
    /// are dropped with a warning.
    pub async fn handle_response(&self, res: TaskResponse) -> Result<()> {
        let Some(mut session) = self.active.lock().await.get(&res.session_id).cloned() else {
            warn!(
                "dropping response frame for unknown session {}",
                res.session_id
            );
            return Ok(());
        };

        let finished = res.is_result();
        let mut persist = true;

        match res.kind {
            TaskResponseKind::Stream if !res.done => {
                if let Some(interaction) = session.trailing_interaction_mut() {
                    interaction.message.push_str(&res.message);
                }
            }
            TaskResponseKind::Stream => {
                // Stream-done marker: the reduce signal. Nothing to
                // persist, subscribers still hear it.
                persist = false;
            }
            TaskResponseKind::Result => {
                if let Some(interaction) = session.trailing_interaction_mut() {
                    if !res.message.is_empty() {
                        interaction.message = res.message.clone();
                    }
                    interaction.finished = true;
                }
                if let Some(ref error) = res.error {
                    warn!("session {} failed on runner: {}", res.session_id, error);
                }
            }
        }

        {
            let mut active = self.active.lock().await;
            if finished {
                active.remove(&res.session_id);
            } else {
                active.insert(res.session_id.clone(), session.clone());
            }
        }

        if persist {
            // A failed write leaves the session inconsistent until the
            // next frame; the stream must keep flowing regardless.
            if let Err(err) = self.store.update_session(&session).await {
                warn!("failed to persist session {}: {:?}", session.id, err);
            }
        }

        let _ = self.updates.send(res.clone());
        if let Some(stream) = self.streams.get(&res.session_id) {
            let _ = stream.send(res.clone());
        }
        if finished {
            self.streams.remove(&res.session_id);
        }

        Ok(())
    }

    /// Fetch a session, preferring the authoritative in-flight copy
    /// over the stored one while a response is streaming.
    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        if let Some(session) = self.active.lock().await.get(id) {
            return Ok(Some(session.clone()));
        }
        self.store.get_session(id).await
    }

    /// Subscribe to every applied frame, across all sessions.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<TaskResponse> {
        self.updates.subscribe()
    }

    /// Subscribe to one in-flight session's frames, if it is active.
    pub fn subscribe_session(&self, session_id: &str) -> Option<broadcast::Receiver<TaskResponse>> {
        self.streams.get(session_id).map(|tx| tx.subscribe())
    }

    /// Record a runner's instance snapshot.
    pub async fn report_instance_state(&self, state: ModelInstanceState) {
        let mut instances = self.instances.lock().await;
        instances.insert(state.id.clone(), state);
    }

    /// Last-reported instance snapshots.
    pub async fn instance_states(&self) -> Vec<ModelInstanceState> {
        let instances = self.instances.lock().await;
        let mut states: Vec<_> = instances.values().cloned().collect();
        states.sort_by(|a, b| a.model.cmp(&b.model).then(a.id.cmp(&b.id)));
        states
    }

    /// Number of queued sessions, for health reporting.
    pub async fn queue_depth(&self) -> usize {
        self.queue.len().await
    }
}
