use futures_util::StreamExt;
use thiserror::Error;

use crate::character::{CharacterRepository, TemplateError};
use crate::logger::MessageKind;
use crate::models::{ChatBackend, Completion, Message, QueryOptions};
use crate::session::ChatSession;
use crate::think::{self, FilteredText, ThinkFilter};

pub const FALLBACK_MESSAGE: &str = "抱歉, 出错了. 请重试一次.";

pub struct EngineContext<'a> {
    pub backend: &'a dyn ChatBackend,
    pub characters: &'a CharacterRepository,
}

pub enum SessionCommand<'a> {
    Send { input: &'a str },
    ClearHistory,
    SwitchCharacter { name: &'a str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Answered(String),
    /// Nothing displayable came back; the user message was rolled back.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Turn(TurnOutcome),
    Cleared,
    Switched,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown character {0:?}")]
    UnknownCharacter(String),
    #[error(transparent)]
    Template(#[from] TemplateError),
}

pub async fn execute<F>(
    ctx: EngineContext<'_>,
    session: &mut ChatSession,
    cmd: SessionCommand<'_>,
    on_display: F,
) -> Result<CommandOutcome, EngineError>
where
    F: FnMut(&str) + Send,
{
    match cmd {
        SessionCommand::Send { input } => {
            let outcome = run_turn(ctx.backend, session, input, on_display).await;
            Ok(CommandOutcome::Turn(outcome))
        }
        SessionCommand::ClearHistory => {
            clear_history(session);
            Ok(CommandOutcome::Cleared)
        }
        SessionCommand::SwitchCharacter { name } => {
            let character = ctx
                .characters
                .get(name)
                .ok_or_else(|| EngineError::UnknownCharacter(name.to_string()))?;
            session.switch_character(ctx.characters, character)?;
            Ok(CommandOutcome::Switched)
        }
    }
}

pub fn clear_history(session: &mut ChatSession) {
    session.conversation_mut().reset();
}

/// Request messages for the backend. Thinking models get the system prompt
/// folded into the first user message instead of a system message.
pub fn build_payload(messages: &[Message], thinking: bool) -> Vec<Message> {
    let mut payload = messages.to_vec();
    if thinking && payload.len() > 1 {
        let system = std::mem::take(&mut payload[0].content);
        payload[1].content = format!("{system}\nuser input:\n{}", payload[1].content);
    }
    payload
}

/// One user turn. Displayable text is handed to `on_display` as it arrives.
pub async fn run_turn<F>(
    backend: &dyn ChatBackend,
    session: &mut ChatSession,
    input: &str,
    mut on_display: F,
) -> TurnOutcome
where
    F: FnMut(&str) + Send,
{
    let logger = session.logger();
    let thinking = backend.thinking();

    session.conversation_mut().push_user(input);
    let payload = build_payload(session.conversation().messages(), thinking);
    logger.log(MessageKind::UserQuery, input);

    let answer = match backend.query(&payload, QueryOptions::default()).await {
        Ok(Completion::Stream(mut tokens)) => {
            let mut filter = ThinkFilter::new(thinking);
            while let Some(fragment) = tokens.next().await {
                if let Some(shown) = filter.push(&fragment) {
                    on_display(shown);
                }
            }
            filter.finish()
        }
        Ok(Completion::Text(text)) => {
            let out = think::filter_complete(text, thinking);
            if !out.display.is_empty() {
                on_display(&out.display);
            }
            out
        }
        Err(e) => {
            logger.error(&e.to_string());
            FilteredText::default()
        }
    };

    let outcome = if answer.display.is_empty() {
        session.conversation_mut().pop_user();
        TurnOutcome::Fallback
    } else {
        session.conversation_mut().push_assistant(answer.display.clone());
        TurnOutcome::Answered(answer.display)
    };
    logger.log(MessageKind::BotAnswer, &answer.raw);

    let history = serde_json::to_string(session.conversation().history()).unwrap_or_default();
    logger.log(MessageKind::ChatHistory, &history);
    outcome
}
