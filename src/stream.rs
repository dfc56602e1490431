use std::collections::VecDeque;
use std::pin::Pin;

use futures_util::stream::{self, Stream, StreamExt};

use crate::models::ChatChunk;

/// Forward-only sequence of text deltas of one streamed answer. Consuming it
/// is the only way to read the answer; it cannot be restarted.
pub type TokenStream = Pin<Box<dyn Stream<Item = String> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    Done,
    Malformed(String),
}

/// Splits a `text/event-stream` body into chat chunk events.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            match std::str::from_utf8(&line) {
                Ok(s) => {
                    if let Some(ev) = decode_line(s.trim()) {
                        events.push(ev);
                    }
                }
                Err(e) => events.push(SseEvent::Malformed(format!("invalid utf-8: {e}"))),
            }
        }
        events
    }

    /// Flushes a last line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        let s = String::from_utf8_lossy(&rest);
        decode_line(s.trim())
    }
}

fn decode_line(line: &str) -> Option<SseEvent> {
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload == "[DONE]" {
        return Some(SseEvent::Done);
    }
    if payload.is_empty() {
        return None;
    }
    match serde_json::from_str::<ChatChunk>(payload) {
        Ok(chunk) => Some(SseEvent::Delta(chunk.delta_text())),
        Err(_) => Some(SseEvent::Malformed(payload.to_string())),
    }
}

type BytesStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, String>> + Send>>;

struct DecodeState {
    body: BytesStream,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    finished: bool,
}

/// Turns a raw event-stream body into a [`TokenStream`]. Transport errors and
/// undecodable chunks end the stream with a warning.
pub fn token_stream<S>(body: S) -> TokenStream
where
    S: Stream<Item = Result<Vec<u8>, String>> + Send + 'static,
{
    let state = DecodeState {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(text) = st.pending.pop_front() {
                return Some((text, st));
            }
            if st.finished {
                return None;
            }
            let events = match st.body.next().await {
                Some(Ok(bytes)) => st.decoder.push(&bytes),
                Some(Err(e)) => {
                    tracing::warn!("stream interrupted: {e}");
                    st.finished = true;
                    Vec::new()
                }
                None => {
                    st.finished = true;
                    st.decoder.finish().into_iter().collect()
                }
            };
            for ev in events {
                match ev {
                    SseEvent::Delta(text) => st.pending.push_back(text),
                    SseEvent::Done => {
                        st.finished = true;
                        break;
                    }
                    SseEvent::Malformed(payload) => {
                        tracing::warn!("undecodable stream chunk: {payload}");
                        st.finished = true;
                        break;
                    }
                }
            }
        }
    })
    .boxed()
}

/// Adapts a `reqwest` streaming body.
pub fn from_response(resp: reqwest::Response) -> TokenStream {
    token_stream(
        resp.bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| e.to_string())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    #[test]
    fn decoder_handles_split_lines_and_spacing() {
        let mut dec = SseDecoder::new();
        let line = chunk("Hello");
        let (a, b) = line.split_at(10);
        assert!(dec.push(a.as_bytes()).is_empty());
        assert_eq!(dec.push(b.as_bytes()), vec![SseEvent::Delta("Hello".into())]);

        let events = dec.push(b"data:{\"choices\":[{\"delta\":{\"content\":\"World\"}}]}\ndata:[DONE]\n");
        assert_eq!(
            events,
            vec![SseEvent::Delta("World".into()), SseEvent::Done]
        );
    }

    #[test]
    fn chunks_without_text_become_empty_deltas() {
        let mut dec = SseDecoder::new();
        let events = dec.push(
            b"data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\
              data: {\"choices\":[]}\n\
              data: {\"choices\":[{\"delta\":{\"content\":null}}]}\n\
              : keep-alive\n\
              event: ping\n",
        );
        assert_eq!(
            events,
            vec![
                SseEvent::Delta(String::new()),
                SseEvent::Delta(String::new()),
                SseEvent::Delta(String::new()),
            ]
        );
    }

    #[tokio::test]
    async fn token_stream_stops_at_done() {
        let body = format!("{}{}data: [DONE]\n\n{}", chunk("a"), chunk("b"), chunk("ignored"));
        let parts: Vec<Result<Vec<u8>, String>> = body
            .as_bytes()
            .chunks(7)
            .map(|c| Ok(c.to_vec()))
            .collect();
        let tokens: Vec<String> = token_stream(stream::iter(parts)).collect().await;
        assert_eq!(tokens, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn token_stream_ends_on_transport_error() {
        let parts: Vec<Result<Vec<u8>, String>> = vec![
            Ok(chunk("kept").into_bytes()),
            Err("connection reset".into()),
            Ok(chunk("lost").into_bytes()),
        ];
        let tokens: Vec<String> = token_stream(stream::iter(parts)).collect().await;
        assert_eq!(tokens, vec!["kept"]);
    }

    #[tokio::test]
    async fn token_stream_flushes_unterminated_tail() {
        let body = r#"data: {"choices":[{"delta":{"content":"tail"}}]}"#;
        let parts: Vec<Result<Vec<u8>, String>> = vec![Ok(body.as_bytes().to_vec())];
        let tokens: Vec<String> = token_stream(stream::iter(parts)).collect().await;
        assert_eq!(tokens, vec!["tail"]);
    }
}
