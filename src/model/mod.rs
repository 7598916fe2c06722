//! Model catalog: prompt templates and memory requirements.
//!
//! The dispatcher renders a session's chat history through the bound
//! model's template before handing work to a runner, and runners report
//! the model's memory class in instance state snapshots.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::session::{Creator, Session};

const GIB: u64 = 1024 * 1024 * 1024;

/// How a model wants its chat history flattened into a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTemplate {
    /// `User:` / `Assistant:` turn prefixes with a trailing cue.
    Plain,
    /// Llama-style `[INST] ... [/INST]` wrapping of user turns.
    Instruct,
}

impl ChatTemplate {
    /// Flatten the session's interactions into a single prompt string.
    ///
    /// Unfinished system turns (the one currently being streamed into)
    /// are skipped; they carry no content the model should see.
    pub fn render(&self, session: &Session) -> String {
        let mut prompt = String::new();
        for interaction in &session.interactions {
            if interaction.creator == Creator::System && !interaction.finished {
                continue;
            }
            match (self, interaction.creator) {
                (ChatTemplate::Plain, Creator::User) => {
                    prompt.push_str("User: ");
                    prompt.push_str(&interaction.message);
                    prompt.push('\n');
                }
                (ChatTemplate::Plain, Creator::System) => {
                    prompt.push_str("Assistant: ");
                    prompt.push_str(&interaction.message);
                    prompt.push('\n');
                }
                (ChatTemplate::Instruct, Creator::User) => {
                    prompt.push_str("[INST] ");
                    prompt.push_str(&interaction.message);
                    prompt.push_str(" [/INST]\n");
                }
                (ChatTemplate::Instruct, Creator::System) => {
                    prompt.push_str(&interaction.message);
                    prompt.push('\n');
                }
            }
        }
        if *self == ChatTemplate::Plain {
            prompt.push_str("Assistant:");
        }
        prompt
    }
}

/// Catalog entry for one known model.
#[derive(Debug, Clone)]
pub struct ModelEntry {
    /// Estimated resident memory once loaded.
    pub memory_bytes: u64,
    /// Prompt template.
    pub template: ChatTemplate,
}

static KNOWN_MODELS: Lazy<HashMap<&'static str, ModelEntry>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(
        "llama3:instruct",
        ModelEntry {
            memory_bytes: 8 * GIB,
            template: ChatTemplate::Instruct,
        },
    );
    m.insert(
        "llama3:70b",
        ModelEntry {
            memory_bytes: 39 * GIB,
            template: ChatTemplate::Instruct,
        },
    );
    m.insert(
        "mistral:7b-instruct",
        ModelEntry {
            memory_bytes: 6 * GIB,
            template: ChatTemplate::Instruct,
        },
    );
    m.insert(
        "phi3:instruct",
        ModelEntry {
            memory_bytes: 4 * GIB,
            template: ChatTemplate::Plain,
        },
    );
    m
});

/// Default assumption for models missing from the catalog.
const DEFAULT_ENTRY: ModelEntry = ModelEntry {
    memory_bytes: 8 * GIB,
    template: ChatTemplate::Plain,
};

/// Look up a model, falling back to the default entry.
pub fn lookup(model: &str) -> ModelEntry {
    KNOWN_MODELS.get(model).cloned().unwrap_or(DEFAULT_ENTRY)
}

/// Estimated memory requirement for a model name.
pub fn memory_requirement(model: &str) -> u64 {
    lookup(model).memory_bytes
}

/// Render a session's history through its model's template.
pub fn render_prompt(session: &Session) -> String {
    lookup(&session.model).template.render(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Interaction, SessionMode, SessionType};

    fn session_with_history() -> Session {
        let mut session = Session::new(
            "alice",
            SessionMode::Create,
            SessionType::Text,
            "phi3:instruct",
            "hi",
        );
        session.interactions.push(Interaction {
            finished: true,
            ..Interaction::system_pending()
        });
        session.trailing_interaction_mut().unwrap().message = "hello there".to_string();
        session.interactions.push(Interaction::user("how are you?"));
        session
    }

    #[test]
    fn test_plain_template_renders_turns() {
        let prompt = render_prompt(&session_with_history());
        assert_eq!(
            prompt,
            "User: hi\nAssistant: hello there\nUser: how are you?\nAssistant:"
        );
    }

    #[test]
    fn test_unfinished_system_turn_is_skipped() {
        let mut session = session_with_history();
        session.interactions.push(Interaction::system_pending());
        let prompt = render_prompt(&session);
        assert!(prompt.ends_with("User: how are you?\nAssistant:"));
    }

    #[test]
    fn test_instruct_template() {
        let mut session = session_with_history();
        session.model = "llama3:instruct".to_string();
        let prompt = render_prompt(&session);
        assert!(prompt.starts_with("[INST] hi [/INST]\n"));
        assert!(prompt.contains("hello there\n"));
    }

    #[test]
    fn test_unknown_model_gets_default() {
        let entry = lookup("some-model-nobody-knows");
        assert_eq!(entry.memory_bytes, 8 * GIB);
        assert_eq!(entry.template, ChatTemplate::Plain);
    }
}
