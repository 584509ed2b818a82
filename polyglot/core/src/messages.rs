//! Inbound Query Messages
//!
//! The request shape accepted at the hosting boundary: an ordered list of
//! role-tagged messages plus the caller's credential. This is what gets
//! collapsed into plain text for routing and re-attributed per bot before it
//! is forwarded to each backend.

use serde::{Deserialize, Serialize};

/// Who sent a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instructions
    System,
    /// End user input
    User,
    /// A bot answer (possibly a previously merged multi-bot answer)
    Bot,
}

/// A single message in the conversation history
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    /// Who sent this message
    pub role: MessageRole,
    /// The message content
    pub content: String,
}

impl ProtocolMessage {
    /// Create a message
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create a bot message
    pub fn bot(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Bot, content)
    }
}

/// Conversation identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Generate a new random conversation ID
    #[must_use]
    pub fn new() -> Self {
        Self(format!("conv_{}", uuid::Uuid::new_v4().simple()))
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

/// A query received from the hosting boundary
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Conversation this query belongs to
    #[serde(default)]
    pub conversation_id: ConversationId,
    /// Conversation history, oldest first; the last message is the new query
    pub query: Vec<ProtocolMessage>,
    /// Caller credential forwarded to every backend
    #[serde(default)]
    pub access_key: String,
}

impl QueryRequest {
    /// Create a request from history and credential
    pub fn new(query: Vec<ProtocolMessage>, access_key: impl Into<String>) -> Self {
        Self {
            conversation_id: ConversationId::new(),
            query,
            access_key: access_key.into(),
        }
    }

    /// Create a single-message user request
    pub fn from_text(text: impl Into<String>, access_key: impl Into<String>) -> Self {
        Self::new(vec![ProtocolMessage::user(text)], access_key)
    }

    /// Collapse the whole history into one line of plain text
    ///
    /// Contents are concatenated without separators and newlines become
    /// spaces, which is the form the classification prompt embeds.
    #[must_use]
    pub fn plain_text(&self) -> String {
        self.query
            .iter()
            .map(|m| m.content.as_str())
            .collect::<String>()
            .replace('\n', " ")
    }

    /// Copy of this request with a different message list
    #[must_use]
    pub fn with_query(&self, query: Vec<ProtocolMessage>) -> Self {
        Self {
            conversation_id: self.conversation_id.clone(),
            query,
            access_key: self.access_key.clone(),
        }
    }
}
