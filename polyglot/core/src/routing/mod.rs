//! Fan-Out Routing
//!
//! Decides which bots answer a query. One classification call is made, its
//! JSON verdict is parsed, and the verdict's predicates switch optional bots
//! on top of the always-invoked mandatory set.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |   QueryRouter    |  <-- one classification call (label suppressed)
//! +--------+---------+
//!          |
//!          v
//! +------------------+
//! |  RoutingVerdict  |  <-- first {...} in the reply, missing keys = false
//! +--------+---------+
//!          |
//!          v
//! +------------------+
//! | BackendSelection |  <-- mandatory ∪ optional(predicate) ∪ enrichment
//! +------------------+
//! ```

mod history;
mod router;
mod verdict;

pub use history::{reattribute_message, reattribute_request};
pub use router::{classification_prompt, BackendRole, BackendSelection, QueryRouter, SelectedBackend};
pub use verdict::{extract_json_object, RoutingVerdict};
