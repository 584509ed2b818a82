//! One-shot answer rendering for `ask`
//!
//! Merged snapshots only cover bots that are still streaming, so the last
//! snapshot alone can miss bots that finished early. The transcript keeps
//! the latest text seen for every bot instead.

use polyglot_core::{Fragment, FragmentMode, Label};

enum Entry {
    Answer(String),
    Failed,
}

/// Latest known answer of every bot seen in a merged stream
#[derive(Default)]
pub struct Transcript {
    entries: Vec<(String, Entry)>,
    suggestions: Vec<String>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one merged fragment
    pub fn observe(&mut self, fragment: &Fragment) {
        match fragment.mode {
            FragmentMode::Replace => {
                for section in Label::sections(&fragment.text) {
                    self.record(section.name, Entry::Answer(section.text.to_string()));
                }
                for name in Label::failed(&fragment.text) {
                    self.record(name, Entry::Failed);
                }
            }
            FragmentMode::SuggestedReply => {
                if !self.suggestions.contains(&fragment.text) {
                    self.suggestions.push(fragment.text.clone());
                }
            }
            FragmentMode::Append | FragmentMode::ControlOnly => {}
        }
    }

    fn record(&mut self, name: &str, entry: Entry) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = entry,
            None => self.entries.push((name.to_string(), entry)),
        }
    }

    /// Full answer, one section per bot in first-seen order
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|(name, entry)| {
                let label = Label::new(name.as_str());
                match entry {
                    Entry::Answer(text) => format!("{}{text}", label.header()),
                    Entry::Failed => label.error_marker(),
                }
            })
            .collect::<Vec<_>>()
            .join(polyglot_core::SNAPSHOT_SEPARATOR)
    }

    pub fn suggestions(&self) -> &[String] {
        &self.suggestions
    }
}
