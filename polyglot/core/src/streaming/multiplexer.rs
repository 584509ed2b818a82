//! Stream Multiplexer Implementation
//!
//! Merges any number of fragment streams into one. Every time a source's text
//! changes, the full merged snapshot is re-rendered and emitted as a single
//! `Replace` fragment, so a consumer only ever needs the latest output.

use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt, StreamMap};
use tracing::debug;

use crate::fragment::{Fragment, FragmentMode, SourceId};

/// Separator placed between sources in a merged snapshot
pub const SNAPSHOT_SEPARATOR: &str = "\n\n";

// ============================================================================
// Aggregator
// ============================================================================

/// Counters for one merge
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Fragments received from all sources
    pub fragments_received: u64,
    /// Snapshots emitted
    pub snapshots_emitted: u64,
    /// Suggested replies forwarded
    pub suggested_replies: u64,
    /// Control fragments dropped
    pub control_dropped: u64,
    /// Sources that reached end of stream
    pub sources_finished: u64,
}

/// Accumulated text for one source
#[derive(Debug)]
struct SourceBuffer {
    source: SourceId,
    chunks: Vec<String>,
}

impl SourceBuffer {
    fn render(&self) -> String {
        self.chunks.concat()
    }
}

/// Snapshot bookkeeping for a merge
///
/// Holds one buffer per live source, kept in the order each source first
/// touched its buffer. This is the whole merge state machine, with no I/O,
/// so it can be driven directly by tests.
#[derive(Debug, Default)]
pub struct Aggregator {
    buffers: Vec<SourceBuffer>,
    stats: MergeStats,
}

impl Aggregator {
    /// Create an empty aggregator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one fragment from `source`
    ///
    /// Returns the fragment to emit downstream: the re-rendered snapshot for
    /// `Append`/`Replace`, the fragment itself for `SuggestedReply`, and
    /// nothing for `ControlOnly`.
    pub fn apply(&mut self, source: SourceId, fragment: Fragment) -> Option<Fragment> {
        self.stats.fragments_received += 1;

        match fragment.mode {
            FragmentMode::ControlOnly => {
                self.stats.control_dropped += 1;
                return None;
            }
            FragmentMode::SuggestedReply => {
                self.stats.suggested_replies += 1;
                return Some(fragment);
            }
            FragmentMode::Replace => {
                let buffer = self.buffer_mut(source);
                buffer.chunks.clear();
                buffer.chunks.push(fragment.text);
            }
            FragmentMode::Append => self.buffer_mut(source).chunks.push(fragment.text),
        }

        self.stats.snapshots_emitted += 1;
        Some(Fragment::replace(self.render()))
    }

    /// Remove a finished source from future snapshots
    ///
    /// Returns whether the source had a buffer.
    pub fn close(&mut self, source: SourceId) -> bool {
        self.stats.sources_finished += 1;
        let before = self.buffers.len();
        self.buffers.retain(|b| b.source != source);
        self.buffers.len() != before
    }

    /// Render the merged snapshot of all live sources
    #[must_use]
    pub fn render(&self) -> String {
        self.buffers
            .iter()
            .map(SourceBuffer::render)
            .collect::<Vec<_>>()
            .join(SNAPSHOT_SEPARATOR)
    }

    /// Current text of one source, if it is live
    #[must_use]
    pub fn source_text(&self, source: SourceId) -> Option<String> {
        self.buffers
            .iter()
            .find(|b| b.source == source)
            .map(SourceBuffer::render)
    }

    /// Number of sources with a live buffer
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.buffers.len()
    }

    /// Merge counters so far
    #[must_use]
    pub fn stats(&self) -> MergeStats {
        self.stats
    }

    fn buffer_mut(&mut self, source: SourceId) -> &mut SourceBuffer {
        let index = match self.buffers.iter().position(|b| b.source == source) {
            Some(index) => index,
            None => {
                self.buffers.push(SourceBuffer {
                    source,
                    chunks: Vec::new(),
                });
                self.buffers.len() - 1
            }
        };
        &mut self.buffers[index]
    }
}

// ============================================================================
// Stream Multiplexer
// ============================================================================

/// Item produced by a source cursor
enum SourceEvent {
    Fragment(Fragment),
    End,
}

type Cursor = Pin<Box<dyn Stream<Item = SourceEvent> + Send>>;

/// Races several fragment streams and emits merged snapshots
///
/// Sources are raced fairly: whichever has a fragment ready is processed
/// next, and no source can starve the others. Order is preserved within a
/// source only.
pub struct StreamMultiplexer {
    sources: Vec<(SourceId, mpsc::Receiver<Fragment>)>,
    channel_capacity: usize,
}

impl Default for StreamMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamMultiplexer {
    /// Create a multiplexer with no sources
    #[must_use]
    pub fn new() -> Self {
        Self::with_channel_capacity(100)
    }

    /// Create a multiplexer with a custom output channel capacity
    #[must_use]
    pub fn with_channel_capacity(capacity: usize) -> Self {
        Self {
            sources: Vec::new(),
            channel_capacity: capacity.max(1),
        }
    }

    /// Add a source, returning its identity within the merge
    pub fn add_source(&mut self, receiver: mpsc::Receiver<Fragment>) -> SourceId {
        let id = SourceId::new();
        self.sources.push((id, receiver));
        id
    }

    /// Number of sources added
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Start merging on a new task
    ///
    /// The returned channel closes once every source is exhausted. Dropping
    /// it cancels the merge and drops every source receiver.
    #[must_use]
    pub fn merge(self) -> mpsc::Receiver<Fragment> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        tokio::spawn(async move {
            self.run(tx).await;
        });
        rx
    }

    /// Merge all sources into `tx` until they are exhausted or `tx` closes
    pub async fn run(self, tx: mpsc::Sender<Fragment>) -> MergeStats {
        let mut cursors: StreamMap<SourceId, Cursor> = StreamMap::with_capacity(self.sources.len());
        for (id, receiver) in self.sources {
            let cursor = ReceiverStream::new(receiver)
                .map(SourceEvent::Fragment)
                .chain(tokio_stream::once(SourceEvent::End));
            cursors.insert(id, Box::pin(cursor));
        }

        let mut aggregator = Aggregator::new();
        let mut cancelled = false;

        loop {
            let next = tokio::select! {
                biased;
                () = tx.closed() => {
                    cancelled = true;
                    break;
                }
                next = cursors.next() => next,
            };

            match next {
                None => break,
                Some((id, SourceEvent::End)) => {
                    cursors.remove(&id);
                    aggregator.close(id);
                    debug!(source = %id, remaining = cursors.len(), "Source finished");
                }
                Some((id, SourceEvent::Fragment(fragment))) => {
                    if let Some(output) = aggregator.apply(id, fragment) {
                        if tx.send(output).await.is_err() {
                            cancelled = true;
                            break;
                        }
                    }
                }
            }
        }

        let stats = aggregator.stats();
        debug!(
            cancelled,
            fragments = stats.fragments_received,
            snapshots = stats.snapshots_emitted,
            suggested_replies = stats.suggested_replies,
            sources_finished = stats.sources_finished,
            "Merge finished"
        );
        stats
    }
}

// ============================================================================
// Tests
// ============================================================================
