//! HTTP Backend Implementation
//!
//! Bot backend for a remote bot server that streams responses as
//! Server-Sent Events.
//!
//! # Protocol
//!
//! Each bot is reached at `POST {base_url}/bot/{bot}` with a JSON body
//! carrying the conversation history and the caller credential. The response
//! is an event stream:
//!
//! | Event              | Meaning                             |
//! |--------------------|-------------------------------------|
//! | `text`             | append `data.text`                  |
//! | `replace_response` | replace the response with `data.text` |
//! | `suggested_reply`  | suggested follow-up `data.text`     |
//! | `meta`             | metadata, no visible text           |
//! | `error`            | terminal failure                    |
//! | `done`             | end of response                     |

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::traits::{Backend, BackendError, BotRequest, StreamingToken};
use crate::config::PolyglotConfig;
use crate::fragment::Fragment;

/// Time allowed to establish a connection to the bot server
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One dispatched Server-Sent Event
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name (`message` when the server sent none)
    pub event: String,
    /// Data lines joined with `\n`
    pub data: String,
}

/// Incremental Server-Sent Events parser
///
/// Bytes are buffered until a full line is available, so multi-byte
/// characters split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    /// Create an empty parser
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every event it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            if self.event.is_none() && self.data.is_empty() {
                return None;
            }
            return Some(SseEvent {
                event: self.event.take().unwrap_or_else(|| "message".to_string()),
                data: std::mem::take(&mut self.data).join("\n"),
            });
        }

        // Comment line
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}

/// What the stream task should do with one event
#[derive(Debug, PartialEq, Eq)]
enum SseAction {
    Emit(StreamingToken),
    Done,
    Skip,
}

#[derive(Deserialize)]
struct TextPayload {
    #[serde(default)]
    text: String,
}

fn payload_text(data: &str) -> Result<String, serde_json::Error> {
    serde_json::from_str::<TextPayload>(data).map(|p| p.text)
}

fn interpret(event: &SseEvent) -> SseAction {
    let fragment = |build: fn(String) -> Fragment| match payload_text(&event.data) {
        Ok(text) => SseAction::Emit(StreamingToken::Fragment(build(text))),
        Err(e) => SseAction::Emit(StreamingToken::Error(format!(
            "malformed {} event: {e}",
            event.event
        ))),
    };

    match event.event.as_str() {
        "text" => fragment(Fragment::append),
        "replace_response" => fragment(Fragment::replace),
        "suggested_reply" => fragment(Fragment::suggested_reply),
        "meta" => SseAction::Emit(StreamingToken::Fragment(Fragment::control())),
        "error" => {
            let text = payload_text(&event.data).unwrap_or_else(|_| event.data.clone());
            SseAction::Emit(StreamingToken::Error(text))
        }
        "done" => SseAction::Done,
        other => {
            debug!(event = other, "Ignoring unknown event");
            SseAction::Skip
        }
    }
}

/// HTTP/SSE backend client
#[derive(Clone)]
pub struct HttpBackend {
    /// Server base URL, without trailing slash
    base_url: String,
    /// HTTP client
    http_client: reqwest::Client,
    /// Response channel capacity
    channel_capacity: usize,
}

impl HttpBackend {
    /// Create a new HTTP backend
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        base_url: impl Into<String>,
        connect_timeout: Option<Duration>,
    ) -> Result<Self, BackendError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let http_client = builder.build().map_err(|source| BackendError::Request {
            bot: String::new(),
            source,
        })?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
            channel_capacity: 100,
        })
    }

    /// Create from the loaded configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn from_config(config: &PolyglotConfig) -> Result<Self, BackendError> {
        let mut backend = Self::new(config.base_url.clone(), Some(CONNECT_TIMEOUT))?;
        backend.channel_capacity = config.channel_capacity;
        Ok(backend)
    }

    /// Get the base URL
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the endpoint URL for a bot
    fn bot_url(&self, bot: &str) -> String {
        format!("{}/bot/{bot}", self.base_url)
    }

    fn request_body(request: &BotRequest) -> serde_json::Value {
        serde_json::json!({
            "bot": request.bot,
            "query": request.query,
            "access_key": request.access_key,
        })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &'static str {
        "Http"
    }

    async fn send_streaming(
        &self,
        request: &BotRequest,
    ) -> Result<mpsc::Receiver<StreamingToken>, BackendError> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let bot = request.bot.clone();

        let response = self
            .http_client
            .post(self.bot_url(&bot))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&Self::request_body(request))
            .send()
            .await
            .map_err(|source| BackendError::Request {
                bot: bot.clone(),
                source,
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status { bot, status, body });
        }

        let mut stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut parser = SseParser::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(bot = %bot, error = %e, "Response body interrupted");
                        let _ = tx.send(StreamingToken::Error(e.to_string())).await;
                        return;
                    }
                };

                for event in parser.feed(&bytes) {
                    match interpret(&event) {
                        SseAction::Emit(token) => {
                            let terminal = matches!(token, StreamingToken::Error(_));
                            if tx.send(token).await.is_err() || terminal {
                                // Receiver dropped, or nothing follows an error
                                return;
                            }
                        }
                        SseAction::Done => return,
                        SseAction::Skip => {}
                    }
                }
            }

            debug!(bot = %bot, "Event stream closed without done event");
        });

        Ok(rx)
    }
}
