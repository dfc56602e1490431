use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::{net::SocketAddr, sync::Arc};

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse};
use axum::{Json, Router, routing::{get, post, put}};
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::character::{Character, CharacterRepository};
use crate::chat::engine::{
    self, CommandOutcome, EngineContext, EngineError, FALLBACK_MESSAGE, SessionCommand, TurnOutcome,
};
use crate::models::{ChatBackend, Message};
use crate::session::ChatSession;

pub const USER_AVATAR: &str = "anonymous.png";

const INDEX_HTML: &str = include_str!("ui/index.html");

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<RwLock<HashMap<Uuid, Arc<Mutex<ChatSession>>>>>,
    pub characters: Arc<CharacterRepository>,
    pub backend: Arc<dyn ChatBackend>,
    pub user_name: String,
    pub images_dir: PathBuf,
}

impl AppState {
    pub fn new(
        characters: CharacterRepository,
        backend: Arc<dyn ChatBackend>,
        user_name: impl Into<String>,
        images_dir: PathBuf,
    ) -> Self {
        Self {
            sessions: Arc::default(),
            characters: Arc::new(characters),
            backend,
            user_name: user_name.into(),
            images_dir,
        }
    }

    fn engine(&self) -> EngineContext<'_> {
        EngineContext {
            backend: self.backend.as_ref(),
            characters: self.characters.as_ref(),
        }
    }

    async fn session(&self, id: Uuid) -> Result<Arc<Mutex<ChatSession>>, StatusCode> {
        let sessions = self.sessions.read().await;
        sessions.get(&id).cloned().ok_or(StatusCode::NOT_FOUND)
    }
}

fn avatar_url(file: &str) -> String {
    format!("/avatars/{file}")
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    user_name: String,
    user_avatar: String,
    streaming: bool,
    thinking: bool,
}

async fn info(State(state): State<AppState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        user_name: state.user_name.clone(),
        user_avatar: avatar_url(USER_AVATAR),
        streaming: state.backend.streaming(),
        thinking: state.backend.thinking(),
    })
}

#[derive(Debug, Serialize)]
struct CharacterSummary {
    name: String,
    greeting: String,
    avatar: String,
}

impl From<&Character> for CharacterSummary {
    fn from(c: &Character) -> Self {
        Self {
            name: c.char_name.clone(),
            greeting: c.greeting.clone(),
            avatar: avatar_url(&c.char_avatar_name),
        }
    }
}

#[derive(Debug, Serialize)]
struct ListCharactersResponse {
    characters: Vec<CharacterSummary>,
}

async fn list_characters(State(state): State<AppState>) -> Json<ListCharactersResponse> {
    let characters = state.characters.characters().iter().map(CharacterSummary::from).collect();
    Json(ListCharactersResponse { characters })
}

#[derive(Debug, Serialize)]
struct SessionView {
    id: Uuid,
    character: CharacterSummary,
    created_at: DateTime<Utc>,
    messages: Vec<Message>,
}

impl SessionView {
    fn of(session: &ChatSession) -> Self {
        Self {
            id: session.trace_id,
            character: CharacterSummary::from(session.character()),
            created_at: session.created_at,
            messages: session.conversation().history().to_vec(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionBody {
    pub character: Option<String>,
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<SessionView>, StatusCode> {
    let character = match &body.character {
        Some(name) => state.characters.get(name),
        None => state.characters.first(),
    }
    .ok_or(StatusCode::NOT_FOUND)?;
    let session = ChatSession::start(&state.characters, character, state.user_name.clone()).map_err(|e| {
        tracing::error!(character = %character.char_name, "cannot start session: {e}");
        StatusCode::UNPROCESSABLE_ENTITY
    })?;
    let view = SessionView::of(&session);
    state
        .sessions
        .write()
        .await
        .insert(session.trace_id, Arc::new(Mutex::new(session)));
    Ok(Json(view))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, StatusCode> {
    let session = state.session(id).await?;
    let session = session.lock().await;
    Ok(Json(SessionView::of(&session)))
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> StatusCode {
    match state.sessions.write().await.remove(&id) {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

#[derive(Debug, Deserialize)]
pub struct SwitchCharacterBody {
    pub character: String,
}

async fn switch_character(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SwitchCharacterBody>,
) -> Result<Json<SessionView>, StatusCode> {
    let session = state.session(id).await?;
    let mut session = session.try_lock().map_err(|_| StatusCode::CONFLICT)?;
    let cmd = SessionCommand::SwitchCharacter { name: &body.character };
    match engine::execute(state.engine(), &mut session, cmd, |_: &str| {}).await {
        Ok(_) => Ok(Json(SessionView::of(&session))),
        Err(EngineError::UnknownCharacter(_)) => Err(StatusCode::NOT_FOUND),
        Err(EngineError::Template(e)) => {
            session.logger().error(&format!("cannot switch to {}: {e}", body.character));
            Err(StatusCode::UNPROCESSABLE_ENTITY)
        }
    }
}

async fn clear_messages(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, StatusCode> {
    let session = state.session(id).await?;
    let mut session = session.try_lock().map_err(|_| StatusCode::CONFLICT)?;
    match engine::execute(state.engine(), &mut session, SessionCommand::ClearHistory, |_: &str| {}).await {
        Ok(_) => Ok(StatusCode::NO_CONTENT),
        Err(e) => {
            session.logger().error(&format!("cannot clear history: {e}"));
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    pub content: String,
}

#[derive(Debug)]
enum TurnEvent {
    Delta(String),
    Done(String),
    Fallback,
}

impl TurnEvent {
    fn into_event(self) -> Event {
        match self {
            TurnEvent::Delta(text) => Event::default()
                .event("delta")
                .data(serde_json::json!({ "text": text }).to_string()),
            TurnEvent::Done(content) => Event::default()
                .event("done")
                .data(serde_json::json!({ "content": content }).to_string()),
            TurnEvent::Fallback => Event::default()
                .event("fallback")
                .data(serde_json::json!({ "message": FALLBACK_MESSAGE }).to_string()),
        }
    }
}

/// Runs one turn; the answer is streamed back as server-sent events.
async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SendMessageBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    if body.content.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let session = state.session(id).await?;
    let mut session = session.try_lock_owned().map_err(|_| StatusCode::CONFLICT)?;
    let (tx, rx) = mpsc::unbounded_channel();

    let turn = tokio::spawn(async move {
        let deltas = tx.clone();
        let cmd = SessionCommand::Send { input: &body.content };
        let result = engine::execute(state.engine(), &mut session, cmd, move |text: &str| {
            let _ = deltas.send(TurnEvent::Delta(text.to_string()));
        })
        .await;
        match result {
            Ok(CommandOutcome::Turn(TurnOutcome::Answered(content))) => {
                let _ = tx.send(TurnEvent::Done(content));
            }
            Ok(CommandOutcome::Turn(TurnOutcome::Fallback)) => {
                let _ = tx.send(TurnEvent::Fallback);
            }
            Ok(other) => tracing::warn!(?other, "unexpected outcome of a send command"),
            Err(e) => session.logger().error(&format!("turn failed: {e:?}")),
        }
    });
    tokio::spawn(async move {
        if let Err(e) = turn.await {
            tracing::error!(session = %id, "turn task aborted: {e:?}");
        }
    });

    let events = UnboundedReceiverStream::new(rx).map(|ev| Ok::<_, Infallible>(ev.into_event()));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\'])
}

async fn avatar(State(state): State<AppState>, Path(file): Path<String>) -> Result<impl IntoResponse, StatusCode> {
    if !is_plain_file_name(&file) {
        return Err(StatusCode::NOT_FOUND);
    }
    let bytes = tokio::fs::read(state.images_dir.join(&file))
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let mime = mime_guess::from_path(&file).first_or_octet_stream();
    Ok(([(header::CONTENT_TYPE, mime.essence_str().to_string())], bytes))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/avatars/:file", get(avatar))
        .route("/v1/info", get(info))
        .route("/v1/characters", get(list_characters))
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/:id", get(get_session).delete(delete_session))
        .route("/v1/sessions/:id/character", put(switch_character))
        .route("/v1/sessions/:id/messages", post(send_message).delete(clear_messages))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
