use std::fmt;

use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

/// Category attached to every user-scoped log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    NewUser,
    UserQuery,
    BotAnswer,
    ChatHistory,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::NewUser => "New User",
            MessageKind::UserQuery => "User Query",
            MessageKind::BotAnswer => "Bot Answer",
            MessageKind::ChatHistory => "Chat History",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Installs the process-wide subscriber: stderr, local timestamps, `RUST_LOG`
/// filtering with `info` as the default level.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_timer(LocalTime)
        .with_writer(std::io::stderr)
        .init();
}

/// Level filter from `RUST_LOG`, read at call time.
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Logger bound to one session's trace id and the active character.
#[derive(Debug, Clone)]
pub struct UserLogger {
    user_name: String,
    char_name: String,
}

impl UserLogger {
    pub fn new(user_name: impl Into<String>, char_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            char_name: char_name.into(),
        }
    }

    pub fn log(&self, kind: MessageKind, text: &str) {
        tracing::info!(
            user_name = %self.user_name,
            char_name = %self.char_name,
            mes_type = %kind,
            "{}",
            text
        );
    }

    pub fn error(&self, text: &str) {
        tracing::error!(user_name = %self.user_name, char_name = %self.char_name, "{}", text);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_log_lines_carry_tags() {
        let (logs, _guard) = capture::capture();
        let logger = UserLogger::new("trace-1", "Alice");
        logger.log(MessageKind::UserQuery, "hi there");
        let out = logs.contents();
        assert!(out.contains("user_name=trace-1"), "{out}");
        assert!(out.contains("char_name=Alice"), "{out}");
        assert!(out.contains("mes_type=User Query"), "{out}");
        assert!(out.contains("hi there"), "{out}");
        assert!(out.contains("INFO"), "{out}");
    }

    #[test]
    fn message_kind_labels() {
        assert_eq!(MessageKind::NewUser.to_string(), "New User");
        assert_eq!(MessageKind::BotAnswer.as_str(), "Bot Answer");
        assert_eq!(MessageKind::ChatHistory.as_str(), "Chat History");
    }
}
