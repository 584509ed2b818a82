//! Response Fragments
//!
//! The unit every stream in the orchestrator carries. Backends produce
//! fragments, the labeling adapter rewrites them, and the multiplexer folds
//! them into merged snapshots that are handed to the hosting boundary.
//!
//! A fragment is a text delta plus a [`FragmentMode`] telling the consumer what
//! to do with it:
//!
//! | Mode             | Effect on the source's buffer          |
//! |------------------|----------------------------------------|
//! | `Append`         | text is concatenated                   |
//! | `Replace`        | buffer is discarded and set to text    |
//! | `SuggestedReply` | none, forwarded verbatim downstream    |
//! | `ControlOnly`    | none, dropped by the multiplexer       |

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// How a fragment's text is applied
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentMode {
    /// Concatenate to the running buffer
    #[default]
    Append,
    /// Discard the running buffer and start over with this text
    Replace,
    /// A suggested follow-up for the end user; never part of merged text
    SuggestedReply,
    /// Metadata-only signal with no visible text
    ControlOnly,
}

impl FragmentMode {
    /// Whether fragments of this mode change a source's buffer
    #[must_use]
    pub fn affects_buffer(self) -> bool {
        matches!(self, Self::Append | Self::Replace)
    }
}

/// One unit of a streaming response
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// Text delta (empty for control fragments)
    pub text: String,
    /// How the text is applied
    #[serde(default)]
    pub mode: FragmentMode,
}

impl Fragment {
    /// Create a fragment with an explicit mode
    pub fn new(text: impl Into<String>, mode: FragmentMode) -> Self {
        Self {
            text: text.into(),
            mode,
        }
    }

    /// Text to concatenate to the running buffer
    pub fn append(text: impl Into<String>) -> Self {
        Self::new(text, FragmentMode::Append)
    }

    /// Text that replaces the running buffer
    pub fn replace(text: impl Into<String>) -> Self {
        Self::new(text, FragmentMode::Replace)
    }

    /// A suggested reply, forwarded as-is
    pub fn suggested_reply(text: impl Into<String>) -> Self {
        Self::new(text, FragmentMode::SuggestedReply)
    }

    /// A control-only fragment carrying no visible text
    #[must_use]
    pub fn control() -> Self {
        Self::new(String::new(), FragmentMode::ControlOnly)
    }

    /// Check if this fragment replaces the running buffer
    #[must_use]
    pub fn is_replace(&self) -> bool {
        self.mode == FragmentMode::Replace
    }

    /// Check if this fragment is a suggested reply
    #[must_use]
    pub fn is_suggested_reply(&self) -> bool {
        self.mode == FragmentMode::SuggestedReply
    }
}

/// Identity of one source stream inside a merge
///
/// Allocated from a process-wide counter, so an id is never handed out twice
/// even across merges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(u64);

impl SourceId {
    /// Allocate a fresh source id
    #[must_use]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Raw numeric value
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src_{}", self.0)
    }
}
