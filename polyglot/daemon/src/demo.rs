//! Offline bots for `--dry-run`
//!
//! Every declared bot answers with a short canned reply streamed word by
//! word. The classifier answers classification prompts with a verdict built
//! from keywords in the quoted request.

use std::time::Duration;

use polyglot_core::{BotRequest, BotScript, Fragment, MessageRole, PolyglotConfig, ScriptedBackend};

const WORD_DELAY: Duration = Duration::from_millis(40);

/// Topic fragment of a predicate name and the words that trigger it
const KEYWORDS: &[(&str, &[&str])] = &[
    ("psychology", &["feel", "anxious", "stress", "sad", "motivation"]),
    ("education", &["learn", "study", "school", "exam", "teach"]),
    ("cooking", &["cook", "recipe", "bake", "sear", "boil", "dinner"]),
    ("fitness", &["workout", "gym", "run", "marathon", "exercise"]),
    ("internet", &["today", "latest", "news", "current", "price"]),
];

/// Scripted backend serving every bot `config` declares
pub fn demo_backend(config: &PolyglotConfig) -> ScriptedBackend {
    let classifier = config.routing.classifier.clone();
    let mut backend = ScriptedBackend::new().with_channel_capacity(config.channel_capacity);

    for id in config.dependencies().into_keys() {
        let is_classifier = id == classifier;
        let name = id.clone();
        backend = backend.with_responder(id, move |request| {
            let prompt = request.last_message().unwrap_or_default();
            if is_classifier && is_classification(request) {
                BotScript::new().text(verdict_for(prompt))
            } else {
                answer(&name, prompt)
            }
        });
    }

    backend
}

fn is_classification(request: &BotRequest) -> bool {
    request.query.len() == 1 && request.query[0].role == MessageRole::Bot
}

/// Build a JSON verdict for the keys listed in a classification prompt
fn verdict_for(prompt: &str) -> String {
    let request = prompt
        .lines()
        .find_map(|line| line.strip_prefix("> "))
        .unwrap_or_default()
        .to_lowercase();

    let verdict: serde_json::Map<String, serde_json::Value> = prompt
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix("- "))
        .map(|key| {
            let matched = KEYWORDS
                .iter()
                .filter(|(topic, _)| key.contains(topic))
                .any(|(_, words)| words.iter().any(|w| request.contains(w)));
            (key.to_string(), serde_json::Value::Bool(matched))
        })
        .collect();

    serde_json::Value::Object(verdict).to_string()
}

fn answer(name: &str, question: &str) -> BotScript {
    let reply = format!("{name} here (dry run). You asked: \"{question}\"");

    let mut script = BotScript::new();
    for (i, word) in reply.split(' ').enumerate() {
        let chunk = if i == 0 { word.to_string() } else { format!(" {word}") };
        script = script.text(chunk).delay(WORD_DELAY);
    }
    script.emit(Fragment::suggested_reply(format!("Ask {name} for more detail")))
}
