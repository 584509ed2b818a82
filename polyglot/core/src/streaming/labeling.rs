//! Labeling Adapter
//!
//! Wraps one backend response so that it identifies itself and can never fail
//! loudly. The adapter emits the bot's header before any upstream data,
//! re-asserts it whenever the bot replaces its own response, and turns a
//! failure into a single `"**Bot** ran into an error"` fragment.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::{Backend, BackendError, BotRequest, StreamingToken};
use crate::fragment::Fragment;

const HEADER_OPEN: &str = "**";
const HEADER_CLOSE: &str = "** says:\n";
const MARKER_CLOSE: &str = "** ran into an error";

/// Identifying label for one bot's section of a merged answer
///
/// The header format is defined here and nowhere else: adapters render it and
/// history re-attribution parses it back with [`Label::sections`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Label {
    name: String,
}

/// One bot's section of a previously merged answer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LabeledSection<'a> {
    /// Display name from the header
    pub name: &'a str,
    /// Text following the header, up to the next header
    pub text: &'a str,
}

impl Label {
    /// Create a label from a bot's display name
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Display name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Section header, e.g. `**GPT-4** says:\n`
    #[must_use]
    pub fn header(&self) -> String {
        format!("{HEADER_OPEN}{}{HEADER_CLOSE}", self.name)
    }

    /// Inline marker shown in place of a failed bot's answer
    #[must_use]
    pub fn error_marker(&self) -> String {
        format!("{HEADER_OPEN}{}{MARKER_CLOSE}", self.name)
    }

    /// Whether a parsed section belongs to this label (ASCII case-insensitive)
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Split a merged answer into its labeled sections
    ///
    /// Text before the first header is not part of any section. The paragraph
    /// break that separated a section from the next one is not included.
    #[must_use]
    pub fn sections(content: &str) -> Vec<LabeledSection<'_>> {
        let spans = find_spans(content);

        spans
            .iter()
            .enumerate()
            .filter(|(_, span)| span.kind == SpanKind::Header)
            .map(|(i, span)| {
                let text = match spans.get(i + 1) {
                    Some(next) => {
                        let text = &content[span.end..next.start];
                        text.strip_suffix("\n\n").unwrap_or(text)
                    }
                    None => &content[span.end..],
                };
                LabeledSection {
                    name: &content[span.name_start..span.name_end],
                    text,
                }
            })
            .collect()
    }

    /// Names of bots whose error marker appears in a merged answer
    #[must_use]
    pub fn failed(content: &str) -> Vec<&str> {
        find_spans(content)
            .into_iter()
            .filter(|span| span.kind == SpanKind::Marker)
            .map(|span| &content[span.name_start..span.name_end])
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SpanKind {
    Header,
    Marker,
}

/// A header or error marker found in merged text
struct LabelSpan {
    kind: SpanKind,
    start: usize,
    name_start: usize,
    name_end: usize,
    end: usize,
}

fn find_spans(content: &str) -> Vec<LabelSpan> {
    let mut spans = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = content[cursor..].find(HEADER_OPEN) {
        let start = cursor + offset;
        let name_start = start + HEADER_OPEN.len();
        let Some(name_len) = content[name_start..].find(HEADER_OPEN) else {
            break;
        };
        let name_end = name_start + name_len;
        let name = &content[name_start..name_end];
        let rest = &content[name_end..];

        let kind = if name.is_empty() || name.contains(['*', '\n']) {
            None
        } else if rest.starts_with(HEADER_CLOSE) {
            Some((SpanKind::Header, HEADER_CLOSE.len()))
        } else if rest.starts_with(MARKER_CLOSE) {
            Some((SpanKind::Marker, MARKER_CLOSE.len()))
        } else {
            None
        };

        match kind {
            Some((kind, close_len)) => {
                let end = name_end + close_len;
                spans.push(LabelSpan {
                    kind,
                    start,
                    name_start,
                    name_end,
                    end,
                });
                cursor = end;
            }
            // Not a label (e.g. bold text); resume at the closing marker
            None => cursor = name_end,
        }
    }

    spans
}

/// What to show when a wrapped bot fails
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Replace the bot's section with its error marker
    #[default]
    Marker,
    /// End the bot's stream silently
    Omit,
}

/// Why forwarding stopped early
enum Interrupt {
    /// Downstream receiver is gone
    Closed,
    /// The backend failed
    Failed(BackendError),
}

/// Wraps a backend response into a labeled, failure-safe fragment stream
#[derive(Clone, Debug)]
pub struct LabelingAdapter {
    label: Label,
    emit_label: bool,
    error_policy: ErrorPolicy,
    timeout: Option<Duration>,
    channel_capacity: usize,
}

impl LabelingAdapter {
    /// Create an adapter that emits the label header
    #[must_use]
    pub fn new(label: Label) -> Self {
        Self {
            label,
            emit_label: true,
            error_policy: ErrorPolicy::Marker,
            timeout: None,
            channel_capacity: 100,
        }
    }

    /// Set whether the header is emitted
    #[must_use]
    pub fn with_emit_label(mut self, emit_label: bool) -> Self {
        self.emit_label = emit_label;
        self
    }

    /// Set the failure presentation
    #[must_use]
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Fail the bot if it goes silent for longer than `timeout`
    ///
    /// The deadline restarts with every token, so a bot that keeps streaming
    /// is never cut off.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the output channel capacity
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// The label this adapter applies
    #[must_use]
    pub fn label(&self) -> &Label {
        &self.label
    }

    /// Start the bot call and return its labeled fragment stream
    ///
    /// The call runs on its own task. Dropping the returned receiver cancels
    /// it and releases the backend's channel.
    pub fn wrap(
        self,
        backend: Arc<dyn Backend>,
        request: BotRequest,
    ) -> mpsc::Receiver<Fragment> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        tokio::spawn(async move {
            self.run(backend.as_ref(), &request, &tx).await;
        });
        rx
    }

    /// Drive one bot call to completion, sending labeled fragments to `tx`
    pub async fn run(
        &self,
        backend: &dyn Backend,
        request: &BotRequest,
        tx: &mpsc::Sender<Fragment>,
    ) {
        if self.emit_label && tx.send(Fragment::replace(self.label.header())).await.is_err() {
            return;
        }

        match self.forward(backend, request, tx).await {
            Ok(()) => debug!(bot = %request.bot, "Bot response complete"),
            Err(Interrupt::Closed) => {
                debug!(bot = %request.bot, "Downstream closed, dropping bot stream");
            }
            Err(Interrupt::Failed(e)) => {
                warn!(bot = %request.bot, error = %e, "Bot ran into an error");
                if self.error_policy == ErrorPolicy::Marker {
                    let _ = tx.send(Fragment::replace(self.label.error_marker())).await;
                }
            }
        }
    }

    async fn forward(
        &self,
        backend: &dyn Backend,
        request: &BotRequest,
        tx: &mpsc::Sender<Fragment>,
    ) -> Result<(), Interrupt> {
        let mut upstream = tokio::select! {
            biased;
            () = tx.closed() => return Err(Interrupt::Closed),
            result = within(self.timeout, backend.send_streaming(request)) => {
                result.and_then(|r| r).map_err(Interrupt::Failed)?
            }
        };

        loop {
            let token = tokio::select! {
                biased;
                () = tx.closed() => return Err(Interrupt::Closed),
                token = within(self.timeout, upstream.recv()) => token.map_err(Interrupt::Failed)?,
            };

            let fragment = match token {
                None => return Ok(()),
                Some(StreamingToken::Error(reason)) => {
                    return Err(Interrupt::Failed(BackendError::Stream(reason)));
                }
                Some(StreamingToken::Fragment(fragment)) => fragment,
            };

            if self.emit_label && fragment.is_replace() {
                // Keep the header in front of the replacement text
                send(tx, Fragment::replace(self.label.header())).await?;
                send(tx, Fragment::append(fragment.text)).await?;
            } else {
                send(tx, fragment).await?;
            }
        }
    }
}

async fn send(tx: &mpsc::Sender<Fragment>, fragment: Fragment) -> Result<(), Interrupt> {
    tx.send(fragment).await.map_err(|_| Interrupt::Closed)
}

async fn within<F: Future>(idle: Option<Duration>, fut: F) -> Result<F::Output, BackendError> {
    match idle {
        Some(idle) => tokio::time::timeout(idle, fut)
            .await
            .map_err(|_| BackendError::Timeout),
        None => Ok(fut.await),
    }
}
