use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

mod character;
mod chat;
mod logger;
mod models;
mod server;
mod session;
mod settings;
mod stream;
mod think;

use character::CharacterRepository;
use models::ChatClient;
use settings::Settings;

#[derive(Debug, Parser)]
#[command(name = "persona_chat")]
#[command(about = "Character role-play chat over an OpenAI-compatible backend", long_about = None)]
struct Cli {
    /// Read variables from this file instead of `./.env`
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the chat page and its API
    Serve {
        #[arg(long, default_value = "127.0.0.1:8501")]
        listen: String,
    },
    /// List the personas found under the resource path
    Characters,
}

fn load_env(env_file: Option<&PathBuf>) -> anyhow::Result<()> {
    match env_file {
        Some(path) => {
            dotenvy::from_path(path).with_context(|| format!("cannot load {}", path.display()))?;
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }
    Ok(())
}

fn load_characters(settings: &Settings) -> anyhow::Result<CharacterRepository> {
    let repo = CharacterRepository::load(&settings.characters_dir(), &settings.template_path())?;
    if repo.is_empty() {
        anyhow::bail!("no characters under {}", settings.characters_dir().display());
    }
    // every persona must render before any session can pick it
    for c in repo.characters() {
        repo.render_prompt(c, &settings.user_name)
            .with_context(|| format!("character {}", c.char_name))?;
    }
    Ok(repo)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    load_env(cli.env_file.as_ref())?;
    logger::init();

    let settings = Settings::from_env()?;
    let characters = load_characters(&settings)?;

    match cli.command {
        Commands::Serve { listen } => {
            let addr: SocketAddr = listen.parse()?;
            let backend = settings.backend.config();
            tracing::info!(
                backend = settings.backend.alias(),
                model = %backend.model_name,
                base = backend.effective_base(),
                streaming = backend.streaming,
                thinking = backend.thinking,
                "chat backend selected"
            );
            let client = ChatClient::from_backend(backend)?;
            let state = server::AppState::new(
                characters,
                Arc::new(client),
                settings.user_name.clone(),
                settings.images_dir(),
            );
            server::serve(addr, state).await?;
        }
        Commands::Characters => {
            for c in characters.characters() {
                println!("{}\t{}\t{}", c.char_name, c.char_avatar_name, c.greeting);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_file_reaches_the_log_filter() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.env");
        std::fs::write(&path, "RUST_LOG=persona_chat=debug\n").unwrap();

        load_env(Some(&path)).unwrap();
        assert!(logger::env_filter().to_string().contains("persona_chat=debug"));
    }

    #[test]
    fn missing_env_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_env(Some(&dir.path().join("absent.env"))).is_err());
    }
}
