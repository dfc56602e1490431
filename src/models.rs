use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::settings::BackendConfig;
use crate::stream::{self, TokenStream};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("request failed: {0}")]
    RequestFailure(String),
    #[error("Query Error: Connection error.")]
    Connection,
    #[error("cannot build http client: {0}")]
    Client(String),
}

/// Per-call overrides. `None`, and for the numeric fields also zero, keep
/// the client's configured value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueryOptions {
    pub enable_stream: Option<bool>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// The answer of one query.
pub enum Completion {
    Text(String),
    Stream(TokenStream),
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Text(t) => f.debug_tuple("Text").field(t).finish(),
            Completion::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn streaming(&self) -> bool;
    fn thinking(&self) -> bool;
    async fn query(&self, messages: &[Message], options: QueryOptions) -> Result<Completion, ChatError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    pub api_key: String,
    pub base_url: String,
    pub model_name: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub retry_times: u32,
    pub frequency_penalty: f32,
    pub streaming: bool,
    pub thinking: bool,
    /// Connect, read and (non-streaming) total timeout of one attempt.
    pub(crate) request_timeout: Duration,
}

impl ClientOptions {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            api_key: String::new(),
            base_url: String::new(),
            model_name: model_name.into(),
            temperature: 0.8,
            top_p: 0.8,
            max_tokens: 1000,
            retry_times: 3,
            frequency_penalty: 0.0,
            streaming: true,
            thinking: false,
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn from_backend(config: &BackendConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            base_url: config.effective_base().to_string(),
            streaming: config.streaming,
            thinking: config.thinking,
            ..Self::new(config.model_name.clone())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ResolvedParams {
    stream: bool,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
}

fn non_zero_f32(v: Option<f32>) -> Option<f32> {
    v.filter(|x| *x != 0.0)
}

fn resolve_params(defaults: &ClientOptions, request: &QueryOptions) -> ResolvedParams {
    ResolvedParams {
        stream: request.enable_stream.unwrap_or(defaults.streaming),
        temperature: non_zero_f32(request.temperature).unwrap_or(defaults.temperature),
        top_p: non_zero_f32(request.top_p).unwrap_or(defaults.top_p),
        max_tokens: request
            .max_tokens
            .filter(|n| *n != 0)
            .unwrap_or(defaults.max_tokens),
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    frequency_penalty: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// One server-sent chunk of a streamed completion.
#[derive(Debug, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

impl ChatChunk {
    /// Text of the first choice, empty when the chunk carries none.
    pub fn delta_text(self) -> String {
        self.choices
            .into_iter()
            .next()
            .and_then(|c| c.delta)
            .and_then(|d| d.content)
            .unwrap_or_default()
    }
}

/// Client of an OpenAI-compatible `chat/completions` endpoint.
pub struct ChatClient {
    http: reqwest::Client,
    endpoint: String,
    options: ClientOptions,
}

impl ChatClient {
    pub fn new(options: ClientOptions) -> Result<Self, ChatError> {
        let http = reqwest::Client::builder()
            .connect_timeout(options.request_timeout)
            .read_timeout(options.request_timeout)
            .build()
            .map_err(|e| ChatError::Client(e.to_string()))?;
        let base = if options.base_url.is_empty() {
            crate::settings::DEFAULT_PROVIDER_BASE
        } else {
            options.base_url.as_str()
        };
        let endpoint = format!("{}/chat/completions", base.trim_end_matches('/'));
        Ok(Self { http, endpoint, options })
    }

    pub fn from_backend(config: &BackendConfig) -> Result<Self, ChatError> {
        Self::new(ClientOptions::from_backend(config))
    }

    async fn attempt(&self, messages: &[Message], params: &ResolvedParams) -> Result<Completion, ChatError> {
        let body = ChatRequest {
            model: &self.options.model_name,
            messages,
            stream: params.stream,
            temperature: params.temperature,
            top_p: params.top_p,
            max_tokens: params.max_tokens,
            frequency_penalty: self.options.frequency_penalty,
        };
        let mut rb = self.http.post(&self.endpoint).json(&body);
        if !self.options.api_key.is_empty() {
            rb = rb.bearer_auth(&self.options.api_key);
        }
        if !params.stream {
            // streamed bodies are bounded per read, not in total
            rb = rb.timeout(self.options.request_timeout);
        }

        let resp = rb
            .send()
            .await
            .map_err(|e| ChatError::RequestFailure(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ChatError::RequestFailure(format!("{status}: {}", text.trim())));
        }

        if params.stream {
            return Ok(Completion::Stream(stream::from_response(resp)));
        }
        let v: ChatResponse = resp
            .json()
            .await
            .map_err(|e| ChatError::RequestFailure(e.to_string()))?;
        let content = v
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        Ok(Completion::Text(content))
    }
}

#[async_trait]
impl ChatBackend for ChatClient {
    fn streaming(&self) -> bool {
        self.options.streaming
    }

    fn thinking(&self) -> bool {
        self.options.thinking
    }

    async fn query(&self, messages: &[Message], options: QueryOptions) -> Result<Completion, ChatError> {
        let params = resolve_params(&self.options, &options);
        for attempt in 1..=self.options.retry_times {
            match self.attempt(messages, &params).await {
                Ok(completion) => return Ok(completion),
                Err(e) => {
                    tracing::warn!(model = %self.options.model_name, "Query Error: {e}, retrying {attempt} times.");
                }
            }
        }
        Err(ChatError::Connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::capture;
    use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
    use futures_util::StreamExt;
    use std::sync::{Arc, Mutex};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct Upstream {
        hits: Arc<AtomicUsize>,
        fail_first: usize,
        last_body: Arc<Mutex<Option<serde_json::Value>>>,
    }

    async fn completions(State(up): State<Upstream>, Json(body): Json<serde_json::Value>) -> axum::response::Response {
        let n = up.hits.fetch_add(1, Ordering::SeqCst);
        *up.last_body.lock().unwrap() = Some(body.clone());
        if n < up.fail_first {
            return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
        }
        if body["stream"].as_bool() == Some(true) {
            let mut sse = String::new();
            for piece in ["Hel", "lo", ""] {
                sse.push_str(&format!(
                    "data: {}\n\n",
                    serde_json::json!({"choices": [{"delta": {"content": piece}}]})
                ));
            }
            sse.push_str("data: [DONE]\n\n");
            ([("content-type", "text/event-stream")], sse).into_response()
        } else {
            Json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "<think>hm</think>Hi"}}]
            }))
            .into_response()
        }
    }

    async fn spawn_upstream(up: Upstream) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route("/v1/chat/completions", post(completions))
            .with_state(up);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v1/", addr)
    }

    fn client(base: String, streaming: bool) -> ChatClient {
        let mut opts = ClientOptions::new("test-model");
        opts.base_url = base;
        opts.api_key = "sk-test".into();
        opts.streaming = streaming;
        ChatClient::new(opts).unwrap()
    }

    #[test]
    fn zero_overrides_keep_defaults() {
        let defaults = ClientOptions::new("m");
        let p = resolve_params(
            &defaults,
            &QueryOptions {
                enable_stream: Some(false),
                temperature: Some(0.0),
                top_p: Some(0.5),
                max_tokens: Some(0),
            },
        );
        assert!(!p.stream);
        assert_eq!(p.temperature, 0.8);
        assert_eq!(p.top_p, 0.5);
        assert_eq!(p.max_tokens, 1000);

        let p = resolve_params(&defaults, &QueryOptions::default());
        assert!(p.stream);
    }

    #[tokio::test]
    async fn non_streaming_query_returns_full_text() {
        let up = Upstream::default();
        let base = spawn_upstream(up.clone()).await;
        let c = client(base, false);
        let out = c
            .query(&[Message::system("sys"), Message::user("hi")], QueryOptions::default())
            .await
            .unwrap();
        let Completion::Text(text) = out else { panic!("expected text") };
        assert_eq!(text, "<think>hm</think>Hi");

        let body = up.last_body.lock().unwrap().clone().unwrap();
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["stream"], false);
        assert_eq!(body["max_tokens"], 1000);
        assert_eq!(body["frequency_penalty"], 0.0);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
    }

    #[tokio::test]
    async fn streaming_query_yields_fragments() {
        let up = Upstream::default();
        let base = spawn_upstream(up.clone()).await;
        let c = client(base, true);
        let out = c.query(&[Message::user("hi")], QueryOptions::default()).await.unwrap();
        let Completion::Stream(s) = out else { panic!("expected stream") };
        let parts: Vec<String> = s.collect().await;
        assert_eq!(parts, vec!["Hel", "lo", ""]);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let up = Upstream { fail_first: 2, ..Default::default() };
        let base = spawn_upstream(up.clone()).await;
        let (logs, _guard) = capture::capture();
        let c = client(base, false);
        let out = c.query(&[Message::user("hi")], QueryOptions::default()).await;
        assert!(matches!(out, Ok(Completion::Text(_))));
        assert_eq!(up.hits.load(Ordering::SeqCst), 3);
        assert_eq!(logs.count("retrying"), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_raise_connection_error_once() {
        let up = Upstream { fail_first: usize::MAX, ..Default::default() };
        let base = spawn_upstream(up.clone()).await;
        let (logs, _guard) = capture::capture();
        let c = client(base, true);
        let err = c
            .query(&[Message::user("hi")], QueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Connection));
        assert_eq!(err.to_string(), "Query Error: Connection error.");
        assert_eq!(up.hits.load(Ordering::SeqCst), 3);
        assert_eq!(logs.count("retrying"), 3);
        assert_eq!(logs.count("retrying 3 times"), 1);
    }

    #[tokio::test]
    async fn silent_upstream_times_out_each_attempt() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(socket);
            }
        });

        let (logs, _guard) = capture::capture();
        let mut opts = ClientOptions::new("m");
        opts.base_url = format!("http://{addr}/v1");
        opts.request_timeout = Duration::from_millis(200);
        let c = ChatClient::new(opts).unwrap();
        let err = tokio::time::timeout(
            Duration::from_secs(10),
            c.query(&[Message::user("hi")], QueryOptions::default()),
        )
        .await
        .expect("each attempt should time out on its own")
        .unwrap_err();

        assert!(matches!(err, ChatError::Connection));
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
        assert_eq!(logs.count("retrying"), 3);
    }

    #[tokio::test]
    async fn unreachable_endpoint_counts_as_failed_attempts() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let mut opts = ClientOptions::new("m");
        opts.base_url = format!("http://{addr}/v1");
        opts.retry_times = 2;
        let c = ChatClient::new(opts).unwrap();
        let err = c.query(&[Message::user("hi")], QueryOptions::default()).await.unwrap_err();
        assert!(matches!(err, ChatError::Connection));
    }
}
