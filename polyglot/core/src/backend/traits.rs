//! Backend Traits
//!
//! Trait definitions for bot backends. The orchestrator only ever talks to a
//! backend through [`Backend::send_streaming`], which hands back a channel of
//! [`StreamingToken`]s. Everything protocol-specific stays behind the trait.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::fragment::Fragment;
use crate::messages::{ProtocolMessage, QueryRequest};

/// Events delivered on a backend's response channel
///
/// The channel closing is the graceful end of the response. An `Error` is
/// terminal; nothing meaningful follows it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamingToken {
    /// A response fragment
    Fragment(Fragment),
    /// The backend failed mid-response
    Error(String),
}

/// A request addressed to one bot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BotRequest {
    /// Bot identifier (backend-specific)
    pub bot: String,
    /// Conversation history to send
    pub query: Vec<ProtocolMessage>,
    /// Caller credential
    pub access_key: String,
}

impl BotRequest {
    /// Address a query request to a bot
    pub fn new(bot: impl Into<String>, request: QueryRequest) -> Self {
        Self {
            bot: bot.into(),
            query: request.query,
            access_key: request.access_key,
        }
    }

    /// Text of the most recent message, if any
    #[must_use]
    pub fn last_message(&self) -> Option<&str> {
        self.query.last().map(|m| m.content.as_str())
    }
}

/// Errors surfaced by backends
///
/// All of these are terminal for one bot's response only; the labeling
/// adapter turns them into an inline error marker.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The HTTP request could not be sent or its body could not be read
    #[error("request to {bot} failed: {source}")]
    Request {
        /// Bot being called
        bot: String,
        /// Underlying client error
        source: reqwest::Error,
    },

    /// The server answered with a non-success status
    #[error("{bot} returned {status}: {body}")]
    Status {
        /// Bot being called
        bot: String,
        /// HTTP status code
        status: u16,
        /// Response body, for diagnostics
        body: String,
    },

    /// The response stream reported an error
    #[error("stream error: {0}")]
    Stream(String),

    /// No response within the configured deadline
    #[error("timed out waiting for response")]
    Timeout,

    /// The backend does not serve this bot
    #[error("unknown bot: {0}")]
    UnknownBot(String),
}

/// Bot backend trait
///
/// Implement this trait to add support for a different bot provider.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Get the backend name (e.g., "Http", "Scripted")
    fn name(&self) -> &str;

    /// Send a request and get a streaming response
    ///
    /// Returns a channel receiver that will receive tokens as they arrive.
    /// The channel is closed when the response is complete. Dropping the
    /// receiver must stop the producer.
    async fn send_streaming(
        &self,
        request: &BotRequest,
    ) -> Result<mpsc::Receiver<StreamingToken>, BackendError>;
}
