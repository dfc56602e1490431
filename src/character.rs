use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const REQUIRED_FIELDS: [&str; 7] = [
    "char_name",
    "char_avatar_name",
    "introduction",
    "personality",
    "dialogue_example",
    "scene",
    "greeting",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    pub char_name: String,
    pub char_avatar_name: String,
    pub introduction: String,
    pub personality: String,
    pub dialogue_example: String,
    pub scene: String,
    pub greeting: String,
}

#[derive(Debug, Error)]
pub enum CharacterError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: invalid json: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path}: missing required field `{field}`")]
    MissingField { path: PathBuf, field: &'static str },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template references unknown placeholder {{{0}}}")]
    UnknownPlaceholder(String),
    #[error("malformed template: unmatched brace at byte {0}")]
    Malformed(usize),
}

/// Substitutes `{name}` placeholders. `{{` and `}}` produce literal braces.
pub fn render_template(template: &str, vars: &HashMap<&str, &str>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '{' => {
                if let Some((_, '{')) = chars.peek() {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some((_, '}')) => break,
                        Some((_, '{')) | None => return Err(TemplateError::Malformed(i)),
                        Some((_, ch)) => name.push(ch),
                    }
                }
                match vars.get(name.as_str()) {
                    Some(value) => out.push_str(value),
                    None => return Err(TemplateError::UnknownPlaceholder(name)),
                }
            }
            '}' => {
                if let Some((_, '}')) = chars.peek() {
                    chars.next();
                    out.push('}');
                    continue;
                }
                return Err(TemplateError::Malformed(i));
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

/// Personas plus the shared system prompt template, loaded once at startup.
#[derive(Debug, Clone)]
pub struct CharacterRepository {
    characters: Vec<Character>,
    template: String,
}

impl CharacterRepository {
    pub fn new(characters: Vec<Character>, template: impl Into<String>) -> Self {
        Self {
            characters,
            template: template.into(),
        }
    }

    /// Reads every `*.json` persona of `dir`, in file name order, and the
    /// template at `template_path`.
    pub fn load(dir: &Path, template_path: &Path) -> Result<Self, CharacterError> {
        let template = fs::read_to_string(template_path).map_err(|source| CharacterError::Io {
            path: template_path.to_path_buf(),
            source,
        })?;

        let entries = fs::read_dir(dir).map_err(|source| CharacterError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut characters = Vec::with_capacity(paths.len());
        for path in paths {
            characters.push(load_character(&path)?);
        }
        tracing::info!(count = characters.len(), dir = %dir.display(), "loaded characters");
        Ok(Self::new(characters, template))
    }

    pub fn get(&self, name: &str) -> Option<&Character> {
        self.characters.iter().find(|c| c.char_name == name)
    }

    pub fn first(&self) -> Option<&Character> {
        self.characters.first()
    }

    pub fn characters(&self) -> &[Character] {
        &self.characters
    }

    #[cfg(test)]
    pub fn names(&self) -> Vec<&str> {
        self.characters.iter().map(|c| c.char_name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }

    /// Full system prompt of `character` addressed to `user_name`.
    pub fn render_prompt(&self, character: &Character, user_name: &str) -> Result<String, TemplateError> {
        let dialogue_example = render_template(
            &character.dialogue_example,
            &HashMap::from([("user_name", user_name)]),
        )?;
        let vars = HashMap::from([
            ("user_name", user_name),
            ("char_name", character.char_name.as_str()),
            ("introduction", character.introduction.as_str()),
            ("personality", character.personality.as_str()),
            ("dialogue_example", dialogue_example.as_str()),
            ("scene", character.scene.as_str()),
        ]);
        render_template(&self.template, &vars)
    }
}

fn load_character(path: &Path) -> Result<Character, CharacterError> {
    let raw = fs::read_to_string(path).map_err(|source| CharacterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: serde_json::Value = serde_json::from_str(&raw).map_err(|source| CharacterError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    for field in REQUIRED_FIELDS {
        if !value.get(field).is_some_and(|v| v.is_string()) {
            return Err(CharacterError::MissingField {
                path: path.to_path_buf(),
                field,
            });
        }
    }
    serde_json::from_value(value).map_err(|source| CharacterError::Json {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub const TEMPLATE: &str = "You are {char_name}. {introduction}\n\
        Personality: {personality}\n\
        Scene: {scene}\n\
        Example:\n{dialogue_example}\n\
        Talk to {user_name}. Reply as {{\"text\": ...}}.";

    pub fn character(name: &str) -> Character {
        Character {
            char_name: name.into(),
            char_avatar_name: format!("{}.svg", name.to_lowercase()),
            introduction: format!("{name} runs the tea house."),
            personality: "warm, teasing".into(),
            dialogue_example: "{user_name}: hi\nme: welcome back, {user_name}!".into(),
            scene: "a rainy evening".into(),
            greeting: format!("Hello, I am {name}."),
        }
    }

    pub fn repository() -> CharacterRepository {
        CharacterRepository::new(vec![character("Aria"), character("Bo")], TEMPLATE)
    }
}
