//! Streaming Infrastructure for Fan-Out Responses
//!
//! This module turns several independent bot responses into one
//! continuously refreshed response.
//!
//! # Architecture
//!
//! ```text
//!   Backend ──► LabelingAdapter ──┐
//!   Backend ──► LabelingAdapter ──┼──► StreamMultiplexer ──► merged fragments
//!   Backend ──► LabelingAdapter ──┘         │
//!                                           ▼
//!                                      Aggregator
//!                         (one buffer per source, snapshot rendering)
//! ```
//!
//! - [`LabelingAdapter`] prefixes a bot's output with its [`Label`] header and
//!   converts failures into an inline error marker.
//! - [`StreamMultiplexer`] races all sources and feeds whichever is ready into
//!   the [`Aggregator`], which re-renders the merged snapshot after every
//!   buffer-affecting fragment.
//!
//! # Example
//!
//! ```ignore
//! use polyglot_core::streaming::StreamMultiplexer;
//!
//! let mut mux = StreamMultiplexer::new();
//! mux.add_source(first_rx);
//! mux.add_source(second_rx);
//!
//! let mut merged = mux.merge();
//! while let Some(fragment) = merged.recv().await {
//!     render(&fragment);
//! }
//! ```

mod labeling;
mod multiplexer;

pub use labeling::{ErrorPolicy, Label, LabeledSection, LabelingAdapter};
pub use multiplexer::{Aggregator, MergeStats, StreamMultiplexer, SNAPSHOT_SEPARATOR};
