//! Session data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Inference: produce a response to the latest user message.
    Create,
    /// Fine-tuning. Reserved; the dispatcher does not build work for it.
    Finetune,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMode::Create => write!(f, "create"),
            SessionMode::Finetune => write!(f, "finetune"),
        }
    }
}

impl std::str::FromStr for SessionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(SessionMode::Create),
            "finetune" => Ok(SessionMode::Finetune),
            _ => Err(format!("unknown session mode: {}", s)),
        }
    }
}

/// Session payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Text,
    Image,
}

impl std::fmt::Display for SessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionType::Text => write!(f, "text"),
            SessionType::Image => write!(f, "image"),
        }
    }
}

impl std::str::FromStr for SessionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(SessionType::Text),
            "image" => Ok(SessionType::Image),
            _ => Err(format!("unknown session type: {}", s)),
        }
    }
}

/// Who authored an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Creator {
    User,
    System,
}

/// A single turn within a session.
///
/// Once `finished` is true the message is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    /// Unique interaction ID.
    pub id: String,
    /// Who authored this turn.
    pub creator: Creator,
    /// Message text. Grows while a response is streaming.
    pub message: String,
    /// Attachment paths or URLs.
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Whether this turn is complete.
    #[serde(default)]
    pub finished: bool,
}

impl Interaction {
    /// Create a finished user turn.
    pub fn user(message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            creator: Creator::User,
            message: message.into(),
            attachments: Vec::new(),
            finished: true,
        }
    }

    /// Create an empty, unfinished system turn to stream a response into.
    pub fn system_pending() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            creator: Creator::System,
            message: String::new(),
            attachments: Vec::new(),
            finished: false,
        }
    }
}

/// A persistent multi-turn user conversation.
///
/// Invariant: the interaction list is non-empty. The trailing
/// interaction's creator is User while the session is awaiting a
/// response and System once a response has been started or given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Stable session ID.
    pub id: String,
    /// Owner (user) ID.
    pub owner: String,
    /// Session mode.
    pub mode: SessionMode,
    /// Session payload type.
    #[serde(rename = "type")]
    pub session_type: SessionType,
    /// Model name this session is bound to.
    pub model: String,
    /// LoRA adapter directory, if any. Filterable by runners.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_dir: Option<String>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Ordered list of turns, oldest first.
    pub interactions: Vec<Interaction>,
}

impl Session {
    /// Create a new session from the first user message.
    pub fn new(
        owner: impl Into<String>,
        mode: SessionMode,
        session_type: SessionType,
        model: impl Into<String>,
        first_message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner: owner.into(),
            mode,
            session_type,
            model: model.into(),
            adapter_dir: None,
            created_at: Utc::now(),
            interactions: vec![Interaction::user(first_message)],
        }
    }

    /// The most recent interaction, if any.
    pub fn trailing_interaction(&self) -> Option<&Interaction> {
        self.interactions.last()
    }

    /// Mutable access to the most recent interaction.
    pub fn trailing_interaction_mut(&mut self) -> Option<&mut Interaction> {
        self.interactions.last_mut()
    }

    /// True when the trailing interaction was authored by the user,
    /// i.e. the session is waiting for a response.
    pub fn awaiting_response(&self) -> bool {
        matches!(
            self.trailing_interaction().map(|i| i.creator),
            Some(Creator::User)
        )
    }

    /// The latest user-authored interaction.
    pub fn latest_user_interaction(&self) -> Option<&Interaction> {
        self.interactions
            .iter()
            .rev()
            .find(|i| i.creator == Creator::User)
    }

    /// Condensed view for job history and dashboards.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            owner: self.owner.clone(),
            mode: self.mode,
            model: self.model.clone(),
            created_at: self.created_at,
        }
    }
}

/// Condensed session view used for instance job history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub owner: String,
    pub mode: SessionMode,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// Predicate used to shift matching work from the session queue.
///
/// A `None` field matches any session; a `Some` field must match
/// exactly. The first queued session matching all specified fields is
/// selected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SessionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    pub session_type: Option<SessionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_dir: Option<String>,
}

impl SessionFilter {
    /// Filter sessions for a specific model in inference mode.
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            mode: Some(SessionMode::Create),
            session_type: None,
            model: Some(model.into()),
            adapter_dir: None,
        }
    }

    /// Whether the given session satisfies every specified field.
    pub fn matches(&self, session: &Session) -> bool {
        if let Some(mode) = self.mode {
            if session.mode != mode {
                return false;
            }
        }
        if let Some(session_type) = self.session_type {
            if session.session_type != session_type {
                return false;
            }
        }
        if let Some(ref model) = self.model {
            if &session.model != model {
                return false;
            }
        }
        if let Some(ref adapter_dir) = self.adapter_dir {
            if session.adapter_dir.as_deref() != Some(adapter_dir.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_session(model: &str) -> Session {
        Session::new("alice", SessionMode::Create, SessionType::Text, model, "hi")
    }

    #[test]
    fn test_new_session_awaits_response() {
        let session = text_session("llama3:instruct");
        assert_eq!(session.interactions.len(), 1);
        assert!(session.awaiting_response());
    }

    #[test]
    fn test_session_with_system_response_is_idle() {
        let mut session = text_session("llama3:instruct");
        session.interactions.push(Interaction::system_pending());
        assert!(!session.awaiting_response());
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = SessionFilter::default();
        assert!(filter.matches(&text_session("llama3:instruct")));
        assert!(filter.matches(&text_session("mistral:7b")));
    }

    #[test]
    fn test_filter_on_model() {
        let filter = SessionFilter::for_model("llama3:instruct");
        assert!(filter.matches(&text_session("llama3:instruct")));
        assert!(!filter.matches(&text_session("mistral:7b")));
    }

    #[test]
    fn test_filter_on_type() {
        let filter = SessionFilter {
            session_type: Some(SessionType::Image),
            ..Default::default()
        };
        assert!(!filter.matches(&text_session("llama3:instruct")));
    }

    #[test]
    fn test_filter_on_adapter_dir() {
        let filter = SessionFilter {
            adapter_dir: Some("/adapters/legal".to_string()),
            ..Default::default()
        };
        let mut session = text_session("llama3:instruct");
        assert!(!filter.matches(&session));

        session.adapter_dir = Some("/adapters/legal".to_string());
        assert!(filter.matches(&session));
    }

    #[test]
    fn test_mode_round_trip() {
        let mode: SessionMode = "create".parse().unwrap();
        assert_eq!(mode, SessionMode::Create);
        assert_eq!(mode.to_string(), "create");
        assert!("training".parse::<SessionMode>().is_err());
    }
}
