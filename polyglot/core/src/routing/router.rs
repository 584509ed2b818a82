//! Query Router
//!
//! Chooses the bots that answer a request: the mandatory set always, plus
//! optional bots whose routing predicate the classifier marked `true`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::verdict::RoutingVerdict;
use crate::backend::{Backend, BotRequest};
use crate::config::{EnrichmentConfig, PolyglotConfig, RoutingConfig};
use crate::fragment::{Fragment, FragmentMode};
use crate::messages::{ProtocolMessage, QueryRequest};
use crate::streaming::{Label, LabelingAdapter};

/// Build the classification prompt for `request_text`
///
/// The classifier is asked for a single JSON object holding one boolean per
/// entry in `predicates`.
#[must_use]
pub fn classification_prompt(request_text: &str, predicates: &[&str]) -> String {
    let keys = predicates
        .iter()
        .map(|p| format!("    - {p}"))
        .collect::<Vec<_>>()
        .join("\n");
    let example = predicates
        .iter()
        .enumerate()
        .map(|(i, p)| format!("\"{p}\": {}", i % 2 == 1))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "I'm going to show you a textual request:\n\n\
         > {request_text}\n\n\
         Decide whether answering it needs up-to-date information from the internet, \
         and which of the listed topics it relates to.\n\n\
         Reply with a single valid JSON object whose keys are exactly the following, \
         each with a boolean value:\n\
         {keys}\n\n\
         Example:\n\n\
         {{{example}}}"
    )
}

/// Why a bot was selected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendRole {
    /// Queried for every request
    Mandatory,
    /// Gated by a topic predicate
    Optional,
    /// Web search contribution; its failures are omitted
    Enrichment,
}

/// One selected bot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectedBackend {
    /// Backend id
    pub id: String,
    /// Why it was selected
    pub role: BackendRole,
}

/// Ordered, duplicate-free set of bots answering one request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackendSelection {
    backends: Vec<SelectedBackend>,
}

impl BackendSelection {
    /// Empty selection
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `id` unless it is already selected
    ///
    /// Returns whether it was added.
    pub fn push(&mut self, id: impl Into<String>, role: BackendRole) -> bool {
        let id = id.into();
        if self.contains(&id) {
            return false;
        }
        self.backends.push(SelectedBackend { id, role });
        true
    }

    /// Whether `id` is selected
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.backends.iter().any(|b| b.id == id)
    }

    /// Selected ids in order
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.id.as_str()).collect()
    }

    /// Iterate in selection order
    pub fn iter(&self) -> std::slice::Iter<'_, SelectedBackend> {
        self.backends.iter()
    }

    /// Number of selected bots
    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether nothing is selected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl<'a> IntoIterator for &'a BackendSelection {
    type Item = &'a SelectedBackend;
    type IntoIter = std::slice::Iter<'a, SelectedBackend>;

    fn into_iter(self) -> Self::IntoIter {
        self.backends.iter()
    }
}

/// Decides which bots answer a request
pub struct QueryRouter {
    backend: Arc<dyn Backend>,
    routing: RoutingConfig,
    enrichment: EnrichmentConfig,
    timeout: Option<Duration>,
    channel_capacity: usize,
}

impl QueryRouter {
    /// Create a router that classifies through `backend`
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, config: &PolyglotConfig) -> Self {
        Self {
            backend,
            routing: config.routing.clone(),
            enrichment: config.enrichment.clone(),
            timeout: config.request_timeout,
            channel_capacity: config.channel_capacity,
        }
    }

    /// Select the bots for `request`
    ///
    /// Never fails: an unusable classification only narrows the selection
    /// to the mandatory bots.
    pub async fn decide(&self, request: &QueryRequest) -> BackendSelection {
        if !self.routing.enabled {
            debug!("Routing disabled, using mandatory bots only");
            return self.select(&RoutingVerdict::empty());
        }

        let verdict = self
            .classify(&request.plain_text(), &request.access_key)
            .await;
        self.select(&verdict)
    }

    /// Ask the classifier for a verdict on `request_text`
    ///
    /// Makes exactly one call. A reply without a usable JSON object yields an
    /// empty verdict.
    pub async fn classify(&self, request_text: &str, access_key: &str) -> RoutingVerdict {
        let predicates = self.predicates();
        let prompt = classification_prompt(request_text, &predicates);

        let request = BotRequest {
            bot: self.routing.classifier.clone(),
            query: vec![ProtocolMessage::bot(prompt)],
            access_key: access_key.to_string(),
        };

        let adapter = LabelingAdapter::new(Label::new(self.routing.classifier.clone()))
            .with_emit_label(false)
            .with_timeout(self.timeout)
            .with_channel_capacity(self.channel_capacity);
        let reply = drain(adapter.wrap(Arc::clone(&self.backend), request)).await;

        match RoutingVerdict::parse(&reply) {
            Ok(verdict) => {
                info!(
                    classifier = %self.routing.classifier,
                    matched = ?verdict.true_predicates().collect::<Vec<_>>(),
                    "Classified request"
                );
                verdict
            }
            Err(payload) => {
                warn!(
                    classifier = %self.routing.classifier,
                    payload = %payload,
                    "Classifier reply is not a routing verdict, using mandatory bots only"
                );
                RoutingVerdict::empty()
            }
        }
    }

    /// Map a verdict to the bot selection
    #[must_use]
    pub fn select(&self, verdict: &RoutingVerdict) -> BackendSelection {
        let mut selection = BackendSelection::new();

        for id in &self.routing.mandatory {
            selection.push(id.clone(), BackendRole::Mandatory);
        }

        for rule in &self.routing.optional {
            if verdict.get(&rule.predicate) {
                selection.push(rule.backend.clone(), BackendRole::Optional);
            }
        }

        if self.enrichment.web_search && verdict.get(&self.enrichment.predicate) {
            selection.push(self.enrichment.backend.clone(), BackendRole::Enrichment);
        }

        selection
    }

    fn predicates(&self) -> Vec<&str> {
        let mut predicates: Vec<&str> = Vec::new();
        if self.enrichment.web_search {
            predicates.push(&self.enrichment.predicate);
        }
        for rule in &self.routing.optional {
            if !predicates.contains(&rule.predicate.as_str()) {
                predicates.push(&rule.predicate);
            }
        }
        predicates
    }
}

/// Collect a fragment stream into its final text
async fn drain(mut rx: mpsc::Receiver<Fragment>) -> String {
    let mut reply = String::new();
    while let Some(fragment) = rx.recv().await {
        match fragment.mode {
            FragmentMode::Append => reply.push_str(&fragment.text),
            FragmentMode::Replace => reply = fragment.text,
            FragmentMode::SuggestedReply | FragmentMode::ControlOnly => {}
        }
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BotScript, ScriptedBackend};
    use crate::config::OptionalBackend;
    use pretty_assertions::assert_eq;

    fn router_with(
        backend: ScriptedBackend,
        config: &PolyglotConfig,
    ) -> (QueryRouter, Arc<ScriptedBackend>) {
        let backend = Arc::new(backend);
        let router = QueryRouter::new(Arc::clone(&backend) as Arc<dyn Backend>, config);
        (router, backend)
    }

    #[test]
    fn test_prompt_embeds_request_and_keys() {
        let prompt = classification_prompt(
            "How long do I boil an egg?",
            &["is_related_to_cooking", "requires_internet"],
        );

        assert!(prompt.contains("> How long do I boil an egg?"));
        assert!(prompt.contains("    - is_related_to_cooking"));
        assert!(prompt.contains("{\"is_related_to_cooking\": false, \"requires_internet\": true}"));
    }

    #[test]
    fn test_selection_dedup_and_order() {
        let mut selection = BackendSelection::new();
        assert!(selection.push("GPT-4", BackendRole::Mandatory));
        assert!(selection.push("leocooks", BackendRole::Optional));
        assert!(!selection.push("GPT-4", BackendRole::Optional));

        assert_eq!(selection.ids(), vec!["GPT-4", "leocooks"]);
        assert_eq!(selection.len(), 2);
        assert_eq!(selection.iter().next().map(|b| b.role), Some(BackendRole::Mandatory));
    }

    #[test]
    fn test_select_mandatory_plus_matched() {
        let (router, _) = router_with(ScriptedBackend::new(), &PolyglotConfig::default());

        let verdict = RoutingVerdict::from_pairs([
            ("is_related_to_cooking", true),
            ("is_related_to_fitness", false),
            ("requires_internet", true),
        ]);
        let selection = router.select(&verdict);

        // Web search is disabled by default
        assert_eq!(
            selection.ids(),
            vec!["GPT-4", "Claude-2-100k", "fw-mistral-7b", "Llama-2-70b", "leocooks"]
        );
    }

    #[test]
    fn test_select_enrichment_when_enabled() {
        let mut config = PolyglotConfig::default();
        config.enrichment.web_search = true;
        let (router, _) = router_with(ScriptedBackend::new(), &config);

        let selection = router.select(&RoutingVerdict::from_pairs([("requires_internet", true)]));

        let last = selection.iter().last().cloned();
        assert_eq!(
            last,
            Some(SelectedBackend {
                id: "Web-Search".to_string(),
                role: BackendRole::Enrichment,
            })
        );
    }

    #[test]
    fn test_empty_verdict_selects_mandatory_only() {
        let (router, _) = router_with(ScriptedBackend::new(), &PolyglotConfig::default());
        let selection = router.select(&RoutingVerdict::empty());
        assert!(selection.iter().all(|b| b.role == BackendRole::Mandatory));
        assert_eq!(selection.len(), 4);
    }

    #[tokio::test]
    async fn test_decide_with_json_reply() {
        let backend = ScriptedBackend::new().with_bot(
            "GPT-4",
            BotScript::new()
                .text("Sure! {\"is_related_to_fitness\": true, ")
                .text("\"is_related_to_cooking\": false} hope that helps"),
        );
        let (router, backend) = router_with(backend, &PolyglotConfig::default());

        let request = QueryRequest::from_text("Best way to\ntrain for a marathon?", "key");
        let selection = router.decide(&request).await;

        assert!(selection.contains("1FitCoach"));
        assert!(!selection.contains("leocooks"));

        let sent = backend.last_request_for("GPT-4").unwrap();
        assert_eq!(sent.query.len(), 1);
        assert!(sent.query[0].content.contains("> Best way to train for a marathon?"));
        assert_eq!(sent.access_key, "key");
    }

    #[tokio::test]
    async fn test_decide_with_prose_reply() {
        let backend = ScriptedBackend::new()
            .with_bot("GPT-4", BotScript::new().text("I think this is about cooking."));
        let (router, backend) = router_with(backend, &PolyglotConfig::default());

        let selection = router
            .decide(&QueryRequest::from_text("How do I sear a steak?", "key"))
            .await;

        assert_eq!(
            selection.ids(),
            vec!["GPT-4", "Claude-2-100k", "fw-mistral-7b", "Llama-2-70b"]
        );
        assert_eq!(backend.request_count("GPT-4"), 1);
    }

    #[tokio::test]
    async fn test_decide_with_failing_classifier() {
        let backend = ScriptedBackend::new()
            .with_bot("GPT-4", BotScript::rejecting("quota exceeded"));
        let (router, _) = router_with(backend, &PolyglotConfig::default());

        let selection = router.decide(&QueryRequest::from_text("hello", "key")).await;
        assert_eq!(selection.len(), 4);
    }

    #[tokio::test]
    async fn test_decide_respects_classifier_replace() {
        let backend = ScriptedBackend::new().with_bot(
            "GPT-4",
            BotScript::new()
                .text("{\"is_related_to_cooking\": true}")
                .replace("{\"is_related_to_psychology\": true}"),
        );
        let (router, _) = router_with(backend, &PolyglotConfig::default());

        let selection = router.decide(&QueryRequest::from_text("hi", "key")).await;
        assert!(selection.contains("PsychologistGPT"));
        assert!(!selection.contains("leocooks"));
    }

    #[tokio::test]
    async fn test_routing_disabled_skips_classifier() {
        let mut config = PolyglotConfig::default();
        config.routing.enabled = false;
        config.routing.optional = vec![OptionalBackend::new("is_related_to_cooking", "leocooks")];
        let backend = ScriptedBackend::new()
            .with_bot("GPT-4", BotScript::new().text("{\"is_related_to_cooking\": true}"));
        let (router, backend) = router_with(backend, &config);

        let selection = router.decide(&QueryRequest::from_text("Pasta?", "key")).await;

        assert!(!selection.contains("leocooks"));
        assert_eq!(backend.request_count("GPT-4"), 0);
    }

    #[test]
    fn test_predicates_follow_config() {
        let mut config = PolyglotConfig::default();
        config.enrichment.web_search = true;
        let (router, _) = router_with(ScriptedBackend::new(), &config);

        assert_eq!(
            router.predicates(),
            vec![
                "requires_internet",
                "is_related_to_psychology",
                "is_related_to_cooking",
                "is_related_to_fitness"
            ]
        );
    }
}
