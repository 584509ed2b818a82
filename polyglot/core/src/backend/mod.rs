//! Bot Backend Integration
//!
//! This module provides abstracted access to the text-generation services the
//! orchestrator fans out to, through a common trait interface. A single
//! backend serves many bots, the same way one LLM server hosts many models.
//!
//! # Available Backends
//!
//! - **Http**: remote bot server speaking Server-Sent Events
//! - **Scripted**: deterministic in-process responses for tests and dry runs
//!
//! # Usage
//!
//! ```ignore
//! use polyglot_core::backend::{Backend, BotRequest, HttpBackend};
//! use polyglot_core::QueryRequest;
//!
//! let backend = HttpBackend::new("https://bots.example.com", None)?;
//! let request = BotRequest::new("GPT-4", QueryRequest::from_text("Hello!", "key"));
//! let rx = backend.send_streaming(&request).await?;
//! ```

mod http;
mod scripted;
mod traits;

pub use http::{HttpBackend, SseEvent, SseParser};
pub use scripted::{BotScript, ScriptStep, ScriptedBackend};
pub use traits::{Backend, BackendError, BotRequest, StreamingToken};
