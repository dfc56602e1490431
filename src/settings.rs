use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_PROVIDER_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_USER_NAME: &str = "顾易";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("{var}: expected a boolean, got {value:?}")]
    InvalidBool { var: String, value: String },
    #[error("MODEL_OPTION: unknown backend {0:?} (expected \"ours\" or \"openai\")")]
    UnknownBackend(String),
    #[error("{var}: invalid base url {value:?}: {reason}")]
    InvalidBaseUrl {
        var: String,
        value: String,
        reason: String,
    },
    #[error("{0}: model name must not be empty")]
    EmptyModel(String),
}

/// Connection details of one OpenAI-compatible backend.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BackendConfig {
    #[serde(skip_serializing)]
    pub api_key: String,
    pub api_base: String,
    pub model_name: String,
    pub streaming: bool,
    pub thinking: bool,
}

impl BackendConfig {
    /// Base url requests go to; an empty base selects the public provider.
    pub fn effective_base(&self) -> &str {
        if self.api_base.is_empty() {
            DEFAULT_PROVIDER_BASE
        } else {
            &self.api_base
        }
    }
}

/// The backend selected by `MODEL_OPTION`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Ours(BackendConfig),
    OpenAi(BackendConfig),
}

impl Backend {
    pub fn alias(&self) -> &'static str {
        match self {
            Backend::Ours(_) => "ours",
            Backend::OpenAi(_) => "openai",
        }
    }

    pub fn config(&self) -> &BackendConfig {
        match self {
            Backend::Ours(c) | Backend::OpenAi(c) => c,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub backend: Backend,
    pub resource_path: PathBuf,
    pub user_name: String,
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary variable source. Variables that are
    /// not read here are ignored.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let option = lookup("MODEL_OPTION").unwrap_or_else(|| "ours".into());
        let backend = match option.trim().to_ascii_lowercase().as_str() {
            "ours" => Backend::Ours(backend_from_lookup(
                &lookup,
                "OURS",
                "http://127.0.0.1:6016/v1",
                "Qwen2.5-7B-Instruct",
            )?),
            "openai" => Backend::OpenAi(backend_from_lookup(
                &lookup,
                "OPENAI",
                DEFAULT_PROVIDER_BASE,
                "gpt-4o",
            )?),
            _ => return Err(SettingsError::UnknownBackend(option)),
        };

        Ok(Settings {
            backend,
            resource_path: lookup("RESOURCE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("resources")),
            user_name: lookup("USER_NAME").unwrap_or_else(|| DEFAULT_USER_NAME.into()),
        })
    }

    pub fn characters_dir(&self) -> PathBuf {
        self.resource_path.join("character_data")
    }

    pub fn template_path(&self) -> PathBuf {
        self.resource_path.join("system_prompt.txt")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.resource_path.join("images")
    }
}

fn backend_from_lookup<F>(
    lookup: &F,
    prefix: &str,
    default_base: &str,
    default_model: &str,
) -> Result<BackendConfig, SettingsError>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |suffix: &str| format!("{prefix}_{suffix}");

    let api_base = lookup(&var("API_BASE")).unwrap_or_else(|| default_base.into());
    if !api_base.is_empty() {
        if let Err(e) = url::Url::parse(&api_base) {
            return Err(SettingsError::InvalidBaseUrl {
                var: var("API_BASE"),
                value: api_base,
                reason: e.to_string(),
            });
        }
    }

    let model_name = lookup(&var("MODEL_NAME")).unwrap_or_else(|| default_model.into());
    if model_name.trim().is_empty() {
        return Err(SettingsError::EmptyModel(var("MODEL_NAME")));
    }

    Ok(BackendConfig {
        api_key: lookup(&var("API_KEY")).unwrap_or_default(),
        api_base,
        model_name,
        streaming: parse_flag(lookup, &var("MODEL_STREAMING"), true)?,
        thinking: parse_flag(lookup, &var("MODEL_THINKING"), false)?,
    })
}

fn parse_flag<F>(lookup: &F, var: &str, default: bool) -> Result<bool, SettingsError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Ok(false),
        _ => Err(SettingsError::InvalidBool {
            var: var.to_string(),
            value: raw,
        }),
    }
}
