use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThinkState {
    Normal,
    InsideThink,
}

/// Assembles streamed fragments into the raw answer and the text shown to the
/// user, dropping everything between a `<think>` and a `</think>` fragment.
///
/// Markers are only recognized when a fragment is exactly the marker. A span
/// that is still open when the stream ends never reaches the display.
#[derive(Debug)]
pub struct ThinkFilter {
    thinking_aware: bool,
    state: ThinkState,
    raw: String,
    display: String,
}

/// Both renditions of one finished answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilteredText {
    pub raw: String,
    pub display: String,
}

impl ThinkFilter {
    pub fn new(thinking_aware: bool) -> Self {
        Self {
            thinking_aware,
            state: ThinkState::Normal,
            raw: String::new(),
            display: String::new(),
        }
    }

    /// Feeds one fragment. Returns the part to show, if any.
    pub fn push<'a>(&mut self, fragment: &'a str) -> Option<&'a str> {
        if fragment.is_empty() {
            return None;
        }

        if self.thinking_aware {
            match (self.state, fragment) {
                (ThinkState::Normal, THINK_OPEN) => {
                    self.state = ThinkState::InsideThink;
                    return None;
                }
                (ThinkState::InsideThink, THINK_CLOSE) => {
                    self.state = ThinkState::Normal;
                    return None;
                }
                (ThinkState::InsideThink, _) => {
                    self.raw.push_str(fragment);
                    return None;
                }
                (ThinkState::Normal, _) => {}
            }
        }

        self.raw.push_str(fragment);
        self.display.push_str(fragment);
        Some(fragment)
    }

    #[cfg(test)]
    pub fn is_thinking(&self) -> bool {
        self.state == ThinkState::InsideThink
    }

    pub fn finish(self) -> FilteredText {
        FilteredText {
            raw: self.raw,
            display: self.display,
        }
    }
}

fn think_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("static regex"))
}

/// Removes every `<think>...</think>` block from a complete answer.
pub fn strip_think_blocks(text: &str) -> Cow<'_, str> {
    think_block().replace_all(text, "")
}

/// Filters a complete (non-streamed) answer.
pub fn filter_complete(text: String, thinking_aware: bool) -> FilteredText {
    let display = if thinking_aware {
        strip_think_blocks(&text).into_owned()
    } else {
        text.clone()
    };
    FilteredText { raw: text, display }
}
