//! Polyglot Core - Multi-Bot Answer Orchestration
//!
//! This crate sends one conversation to several text-generation bots at once
//! and merges their streaming answers into a single labeled response that
//! updates live as any bot produces text.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Orchestrator                            │
//! │                                                                  │
//! │   QueryRequest ──▶ QueryRouter ──▶ BackendSelection              │
//! │                    (classifier)     │                            │
//! │                                     ▼                            │
//! │            ┌────────────────┬────────────────┬───────────────┐   │
//! │            │ LabelingAdapter│ LabelingAdapter│ LabelingAdapter│  │
//! │            │   "**GPT-4**"  │ "**Claude**"   │  "**...**"    │   │
//! │            └───────┬────────┴───────┬────────┴──────┬────────┘   │
//! │                    │  mpsc::Receiver<Fragment>      │            │
//! │                    └──────────┬─────┴───────────────┘            │
//! │                               ▼                                  │
//! │                      StreamMultiplexer                           │
//! │                   (Aggregator, snapshots)                        │
//! └───────────────────────────────┼──────────────────────────────────┘
//!                                 ▼
//!                      merged Replace snapshots
//!                      + suggested replies
//! ```
//!
//! # Key Types
//!
//! - [`Orchestrator`]: routes a request and returns the merged stream
//! - [`Fragment`]: one unit of streamed output with its [`FragmentMode`]
//! - [`Backend`]: the seam to a bot service ([`HttpBackend`], [`ScriptedBackend`])
//! - [`LabelingAdapter`]: labels one bot's stream and absorbs its failures
//! - [`StreamMultiplexer`]: races all labeled streams into merged snapshots
//! - [`QueryRouter`]: picks the bots for a request
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use polyglot_core::{load_config, HttpBackend, Orchestrator, QueryRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let backend = Arc::new(HttpBackend::from_config(&config)?);
//!     let orchestrator = Orchestrator::new(backend, config)?;
//!
//!     let request = QueryRequest::from_text("How do I sear a steak?", "access-key");
//!     let mut rx = orchestrator.get_response(&request).await;
//!     while let Some(fragment) = rx.recv().await {
//!         // Replace fragments carry the full merged answer so far
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: bot service abstraction (HTTP/SSE, scripted)
//! - [`config`]: layered TOML/env/CLI configuration
//! - [`fragment`]: streamed output units and source identity
//! - [`messages`]: conversation messages and inbound requests
//! - [`orchestrator`]: request fan-out and merge
//! - [`routing`]: classification, bot selection, history re-attribution
//! - [`streaming`]: labeling adapter and stream multiplexer

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod fragment;
pub mod messages;
pub mod orchestrator;
pub mod routing;
pub mod streaming;

// Re-exports for convenience
pub use backend::{
    Backend, BackendError, BotRequest, BotScript, HttpBackend, ScriptStep, ScriptedBackend,
    StreamingToken,
};
pub use fragment::{Fragment, FragmentMode, SourceId};
pub use messages::{ConversationId, MessageRole, ProtocolMessage, QueryRequest};
pub use orchestrator::Orchestrator;

// Routing exports
pub use routing::{
    reattribute_message, reattribute_request, BackendRole, BackendSelection, QueryRouter,
    RoutingVerdict, SelectedBackend,
};

// Streaming exports
pub use streaming::{
    Aggregator, ErrorPolicy, Label, LabelingAdapter, MergeStats, StreamMultiplexer,
    SNAPSHOT_SEPARATOR,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, PolyglotConfig, PolyglotToml,
};
