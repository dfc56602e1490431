use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::character::{Character, CharacterRepository, TemplateError};
use crate::logger::{MessageKind, UserLogger};
use crate::models::{Message, Role};

/// Message list of one session. Index 0 is always the system prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Everything after the system prompt.
    pub fn history(&self) -> &[Message] {
        &self.messages[1..]
    }

    #[cfg(test)]
    pub fn system_prompt(&self) -> &str {
        &self.messages[0].content
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(Message::assistant(content));
    }

    /// Drops the trailing user message, if the conversation ends with one.
    pub fn pop_user(&mut self) -> Option<Message> {
        if self.messages.len() > 1 && self.messages.last().is_some_and(|m| m.role == Role::User) {
            self.messages.pop()
        } else {
            None
        }
    }

    /// Back to the system prompt alone.
    pub fn reset(&mut self) {
        self.messages.truncate(1);
    }
}

/// Per-session context: created when a visitor arrives, dropped when the
/// session ends.
#[derive(Debug)]
pub struct ChatSession {
    pub trace_id: Uuid,
    pub user_name: String,
    pub created_at: DateTime<Utc>,
    character: Character,
    conversation: Conversation,
}

impl ChatSession {
    pub fn start(
        repo: &CharacterRepository,
        character: &Character,
        user_name: impl Into<String>,
    ) -> Result<Self, TemplateError> {
        let user_name = user_name.into();
        let prompt = repo.render_prompt(character, &user_name)?;
        let session = Self {
            trace_id: Uuid::new_v4(),
            user_name,
            created_at: Utc::now(),
            character: character.clone(),
            conversation: Conversation::new(prompt),
        };
        let trace = session.trace_id.to_string();
        session.logger().log(MessageKind::NewUser, &trace);
        Ok(session)
    }

    pub fn character(&self) -> &Character {
        &self.character
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn conversation_mut(&mut self) -> &mut Conversation {
        &mut self.conversation
    }

    pub fn logger(&self) -> UserLogger {
        UserLogger::new(self.trace_id.to_string(), self.character.char_name.clone())
    }

    /// Activates another persona. The conversation restarts; on a template
    /// failure the session is left as it was.
    pub fn switch_character(
        &mut self,
        repo: &CharacterRepository,
        character: &Character,
    ) -> Result<(), TemplateError> {
        let prompt = repo.render_prompt(character, &self.user_name)?;
        self.character = character.clone();
        self.conversation = Conversation::new(prompt);
        Ok(())
    }
}
