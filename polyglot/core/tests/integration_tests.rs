//! Integration Tests for Polyglot Core
//!
//! These tests drive the public API end to end:
//! - Merged snapshots across several live sources
//! - Labeling adapters feeding the multiplexer, including bot failures
//! - Routing through the orchestrator with a scripted backend
//! - History re-attribution across turns
//! - Loading configuration from a TOML file
//!
//! Sources are driven one fragment at a time through their own channels and
//! the merged output is awaited after each step, so every interleaving below
//! is deterministic. `settle` lets the merge task observe a closed source
//! before the next step.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use polyglot_core::{
    load_config_from_path, Backend, BackendError, BotRequest, BotScript, ErrorPolicy, Fragment,
    FragmentMode, Label, LabelingAdapter, MessageRole, Orchestrator, PolyglotConfig,
    ProtocolMessage, QueryRequest, ScriptedBackend, StreamMultiplexer, StreamingToken,
};

// =============================================================================
// Helpers
// =============================================================================

/// Wait until every other task is idle
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn source() -> (mpsc::Sender<Fragment>, mpsc::Receiver<Fragment>) {
    mpsc::channel(16)
}

async fn collect(mut rx: mpsc::Receiver<Fragment>) -> Vec<Fragment> {
    let mut out = Vec::new();
    while let Some(fragment) = rx.recv().await {
        out.push(fragment);
    }
    out
}

fn snapshot_texts(fragments: &[Fragment]) -> Vec<&str> {
    fragments
        .iter()
        .filter(|f| f.is_replace())
        .map(|f| f.text.as_str())
        .collect()
}

fn mandatory_only(bots: &[&str]) -> PolyglotConfig {
    let mut config = PolyglotConfig::default();
    config.routing.enabled = false;
    config.routing.mandatory = bots.iter().map(ToString::to_string).collect();
    config.routing.optional.clear();
    config
}

fn is_classification(request: &BotRequest) -> bool {
    request.query.len() == 1 && request.query[0].role == MessageRole::Bot
}

// =============================================================================
// Multiplexer Scenarios
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_two_sources_merge_in_activation_order() {
    let (first_tx, first_rx) = source();
    let (second_tx, second_rx) = source();

    let mut mux = StreamMultiplexer::new();
    mux.add_source(first_rx);
    mux.add_source(second_rx);
    let mut merged = mux.merge();

    first_tx.send(Fragment::append("Hi")).await.unwrap();
    assert_eq!(merged.recv().await.unwrap(), Fragment::replace("Hi"));

    first_tx.send(Fragment::append(" there")).await.unwrap();
    assert_eq!(merged.recv().await.unwrap(), Fragment::replace("Hi there"));

    second_tx.send(Fragment::append("Hello")).await.unwrap();
    assert_eq!(
        merged.recv().await.unwrap(),
        Fragment::replace("Hi there\n\nHello")
    );

    drop(first_tx);
    drop(second_tx);
    assert!(merged.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_activation_order_is_first_fragment_not_registration() {
    let (first_tx, first_rx) = source();
    let (second_tx, second_rx) = source();

    let mut mux = StreamMultiplexer::new();
    mux.add_source(first_rx);
    mux.add_source(second_rx);
    let mut merged = mux.merge();

    second_tx.send(Fragment::append("B")).await.unwrap();
    assert_eq!(merged.recv().await.unwrap().text, "B");

    first_tx.send(Fragment::append("A")).await.unwrap();
    assert_eq!(merged.recv().await.unwrap().text, "B\n\nA");
}

#[tokio::test]
async fn test_draft_then_final() {
    let (tx, rx) = source();
    let mut mux = StreamMultiplexer::new();
    mux.add_source(rx);
    let merged = mux.merge();

    tx.send(Fragment::append("draft")).await.unwrap();
    tx.send(Fragment::replace("final")).await.unwrap();
    drop(tx);

    let out = collect(merged).await;
    assert_eq!(snapshot_texts(&out), vec!["draft", "final"]);
}

#[tokio::test(start_paused = true)]
async fn test_replace_only_touches_its_own_source() {
    let (first_tx, first_rx) = source();
    let (second_tx, second_rx) = source();

    let mut mux = StreamMultiplexer::new();
    mux.add_source(first_rx);
    mux.add_source(second_rx);
    let mut merged = mux.merge();

    first_tx.send(Fragment::append("one")).await.unwrap();
    merged.recv().await.unwrap();
    second_tx.send(Fragment::append("two")).await.unwrap();
    merged.recv().await.unwrap();

    second_tx.send(Fragment::replace("TWO")).await.unwrap();
    assert_eq!(merged.recv().await.unwrap().text, "one\n\nTWO");
}

#[tokio::test(start_paused = true)]
async fn test_ended_source_excluded_from_next_snapshot() {
    let (first_tx, first_rx) = source();
    let (second_tx, second_rx) = source();

    let mut mux = StreamMultiplexer::new();
    mux.add_source(first_rx);
    mux.add_source(second_rx);
    let mut merged = mux.merge();

    first_tx.send(Fragment::append("gone soon")).await.unwrap();
    merged.recv().await.unwrap();
    second_tx.send(Fragment::append("still")).await.unwrap();
    assert_eq!(merged.recv().await.unwrap().text, "gone soon\n\nstill");

    drop(first_tx);
    settle().await;

    second_tx.send(Fragment::append(" here")).await.unwrap();
    assert_eq!(merged.recv().await.unwrap().text, "still here");
}

#[tokio::test(start_paused = true)]
async fn test_suggested_reply_and_control_passthrough() {
    let (tx, rx) = source();
    let mut mux = StreamMultiplexer::new();
    mux.add_source(rx);
    let mut merged = mux.merge();

    tx.send(Fragment::append("answer")).await.unwrap();
    merged.recv().await.unwrap();

    tx.send(Fragment::control()).await.unwrap();
    tx.send(Fragment::suggested_reply("Tell me more")).await.unwrap();

    // Control is dropped, so the next output is the suggestion itself
    assert_eq!(
        merged.recv().await.unwrap(),
        Fragment::suggested_reply("Tell me more")
    );

    tx.send(Fragment::append("!")).await.unwrap();
    assert_eq!(merged.recv().await.unwrap().text, "answer!");
}

#[tokio::test]
async fn test_no_sources_completes_immediately() {
    let merged = StreamMultiplexer::new().merge();
    assert!(collect(merged).await.is_empty());
}

// =============================================================================
// Randomized Replay
// =============================================================================

/// Independent model of the merged snapshot
#[derive(Default)]
struct Model {
    order: Vec<usize>,
    buffers: BTreeMap<usize, String>,
}

impl Model {
    fn apply(&mut self, source: usize, fragment: &Fragment) {
        match fragment.mode {
            FragmentMode::Append => {
                if !self.buffers.contains_key(&source) {
                    self.order.push(source);
                }
                self.buffers.entry(source).or_default().push_str(&fragment.text);
            }
            FragmentMode::Replace => {
                if !self.buffers.contains_key(&source) {
                    self.order.push(source);
                }
                self.buffers.insert(source, fragment.text.clone());
            }
            FragmentMode::SuggestedReply | FragmentMode::ControlOnly => {}
        }
    }

    fn end(&mut self, source: usize) {
        self.order.retain(|s| *s != source);
        self.buffers.remove(&source);
    }

    fn join(&self) -> String {
        let mut out = String::new();
        for (i, source) in self.order.iter().enumerate() {
            if i > 0 {
                out.push_str("\n\n");
            }
            out.push_str(&self.buffers[source]);
        }
        out
    }
}

fn random_fragment(rng: &mut StdRng, source: usize, step: usize) -> Fragment {
    let text = format!("s{source}.{step}");
    match rng.gen_range(0..10) {
        0..=5 => Fragment::append(text),
        6 | 7 => Fragment::replace(text),
        8 => Fragment::suggested_reply(text),
        _ => Fragment::control(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_randomized_interleavings_match_model() {
    for seed in 0..20u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let source_count = rng.gen_range(1..=5);

        let mut mux = StreamMultiplexer::new();
        let mut senders = Vec::new();
        let mut remaining = Vec::new();
        for _ in 0..source_count {
            let (tx, rx) = source();
            mux.add_source(rx);
            senders.push(Some(tx));
            remaining.push(rng.gen_range(0..8usize));
        }
        let mut merged = mux.merge();
        let mut model = Model::default();
        let mut step = 0;

        while senders.iter().any(Option::is_some) {
            let live: Vec<usize> = (0..source_count).filter(|i| senders[*i].is_some()).collect();
            let picked = live[rng.gen_range(0..live.len())];
            step += 1;

            if remaining[picked] == 0 {
                senders[picked] = None;
                model.end(picked);
                settle().await;
                continue;
            }
            remaining[picked] -= 1;

            let fragment = random_fragment(&mut rng, picked, step);
            model.apply(picked, &fragment);
            if let Some(tx) = &senders[picked] {
                tx.send(fragment.clone()).await.unwrap();
            }

            match fragment.mode {
                FragmentMode::ControlOnly => settle().await,
                FragmentMode::SuggestedReply => {
                    assert_eq!(merged.recv().await.unwrap(), fragment, "seed {seed}");
                }
                FragmentMode::Append | FragmentMode::Replace => {
                    assert_eq!(
                        merged.recv().await.unwrap(),
                        Fragment::replace(model.join()),
                        "seed {seed}, step {step}"
                    );
                }
            }
        }

        assert!(merged.recv().await.is_none(), "seed {seed}");
    }
}

// =============================================================================
// Adapter + Multiplexer
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_mid_stream_failure_leaves_others_untouched() {
    let backend: Arc<dyn Backend> = Arc::new(
        ScriptedBackend::new()
            .with_bot(
                "Claude-2-100k",
                BotScript::new()
                    .text("partial")
                    .delay(Duration::from_millis(10))
                    .fail("connection reset"),
            )
            .with_bot(
                "GPT-4",
                BotScript::new()
                    .text("fine")
                    .delay(Duration::from_millis(50))
                    .text(" and done"),
            ),
    );
    let request = QueryRequest::from_text("hi", "key");

    let mut mux = StreamMultiplexer::new();
    for bot in ["Claude-2-100k", "GPT-4"] {
        let rx = LabelingAdapter::new(Label::new(bot))
            .wrap(Arc::clone(&backend), BotRequest::new(bot, request.clone()));
        mux.add_source(rx);
    }
    let out = collect(mux.merge()).await;
    let texts = snapshot_texts(&out);

    assert!(texts.iter().any(|t| t.contains("**Claude-2-100k** says:\npartial")));
    assert!(texts
        .iter()
        .any(|t| t.contains("**Claude-2-100k** ran into an error")
            && t.contains("**GPT-4** says:\nfine")));
    assert_eq!(texts.last().copied(), Some("**GPT-4** says:\nfine and done"));
}

#[tokio::test]
async fn test_failure_before_any_fragment_marks_once() {
    let backend: Arc<dyn Backend> =
        Arc::new(ScriptedBackend::new().with_bot("Llama-2-70b", BotScript::rejecting("503")));
    let request = BotRequest::new("Llama-2-70b", QueryRequest::from_text("hi", "key"));

    let out = collect(LabelingAdapter::new(Label::new("Llama-2-70b")).wrap(backend, request)).await;

    let markers = out
        .iter()
        .filter(|f| f.text == "**Llama-2-70b** ran into an error")
        .count();
    assert_eq!(markers, 1);
    assert_eq!(out.last().map(|f| f.mode), Some(FragmentMode::Replace));
}

#[tokio::test]
async fn test_omit_policy_never_shows_marker() {
    let backend: Arc<dyn Backend> =
        Arc::new(ScriptedBackend::new().with_bot("Web-Search", BotScript::rejecting("offline")));
    let request = BotRequest::new("Web-Search", QueryRequest::from_text("hi", "key"));

    let out = collect(
        LabelingAdapter::new(Label::new("Web-Search"))
            .with_error_policy(ErrorPolicy::Omit)
            .wrap(backend, request),
    )
    .await;

    assert!(out.iter().all(|f| !f.text.contains("ran into an error")));
}

// =============================================================================
// Orchestrator
// =============================================================================

#[tokio::test]
async fn test_prose_classification_runs_mandatory_only() {
    let mut config = PolyglotConfig::default();
    config.routing.enabled = true;

    let mut scripted = ScriptedBackend::new().with_responder("GPT-4", |request| {
        if is_classification(request) {
            BotScript::new().text("This looks like a cooking question to me.")
        } else {
            BotScript::new().text("gpt")
        }
    });
    for bot in ["Claude-2-100k", "fw-mistral-7b", "Llama-2-70b", "leocooks"] {
        scripted = scripted.with_bot(bot, BotScript::new().text(bot));
    }
    let backend = Arc::new(scripted);
    let orchestrator =
        Orchestrator::new(Arc::clone(&backend) as Arc<dyn Backend>, config).unwrap();

    let rx = orchestrator
        .get_response(&QueryRequest::from_text("How do I caramelize onions?", "key"))
        .await;
    collect(rx).await;

    let mut called = backend.called_bots();
    called.sort();
    assert_eq!(
        called,
        vec!["Claude-2-100k", "GPT-4", "GPT-4", "Llama-2-70b", "fw-mistral-7b"]
    );
    let classifications = backend
        .requests()
        .iter()
        .filter(|r| is_classification(r))
        .count();
    assert_eq!(classifications, 1);
}

#[tokio::test]
async fn test_suggested_replies_reach_the_caller() {
    let backend = ScriptedBackend::new().with_bot(
        "GPT-4",
        BotScript::new()
            .text("Here you go")
            .emit(Fragment::suggested_reply("What else?")),
    );
    let orchestrator = Orchestrator::new(Arc::new(backend), mandatory_only(&["GPT-4"])).unwrap();

    let out = collect(
        orchestrator
            .get_response(&QueryRequest::from_text("hi", "key"))
            .await,
    )
    .await;

    assert!(out.contains(&Fragment::suggested_reply("What else?")));
    assert!(!snapshot_texts(&out).iter().any(|t| t.contains("What else?")));
}

#[tokio::test(start_paused = true)]
async fn test_second_turn_sees_only_own_history() {
    let bots = ["GPT-4", "Claude-2-100k"];
    let mut scripted = ScriptedBackend::new();
    for bot in bots {
        scripted = scripted.with_responder(bot, move |request| {
            let turn = request.query.len();
            BotScript::new()
                .text(format!("{bot} turn {turn}"))
                .delay(Duration::from_millis(20))
        });
    }
    let backend = Arc::new(scripted);
    let orchestrator =
        Orchestrator::new(Arc::clone(&backend) as Arc<dyn Backend>, mandatory_only(&bots))
            .unwrap();

    // First turn: take the snapshot with both sections as the stored answer
    let first = QueryRequest::from_text("hello", "key");
    let out = collect(orchestrator.get_response(&first).await).await;
    let merged = snapshot_texts(&out)
        .into_iter()
        .find(|t| t.contains("GPT-4 turn 1") && t.contains("Claude-2-100k turn 1"))
        .unwrap()
        .to_string();

    let mut history = first.query.clone();
    history.push(ProtocolMessage::bot(merged));
    history.push(ProtocolMessage::user("and now?"));
    let second = first.with_query(history);
    collect(orchestrator.get_response(&second).await).await;

    assert_eq!(
        backend.last_request_for("GPT-4").unwrap().query[1].content,
        "GPT-4 turn 1"
    );
    assert_eq!(
        backend.last_request_for("Claude-2-100k").unwrap().query[1].content,
        "Claude-2-100k turn 1"
    );
}

#[tokio::test]
async fn test_orchestrator_from_toml_config() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(
        br#"
[backends]
request_timeout_secs = 5

[backends.display_names]
"fw-mistral-7b" = "Mistral"

[routing]
enabled = false
mandatory = ["fw-mistral-7b"]
"#,
    )
    .unwrap();
    let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();

    let backend =
        ScriptedBackend::new().with_bot("fw-mistral-7b", BotScript::new().text("bonjour"));
    let orchestrator = Orchestrator::new(Arc::new(backend), config).unwrap();

    let out = collect(
        orchestrator
            .get_response(&QueryRequest::from_text("salut", "key"))
            .await,
    )
    .await;
    assert_eq!(
        snapshot_texts(&out).last().copied(),
        Some("**Mistral** says:\nbonjour")
    );
}

/// Backend that keeps the producer side of every response it hands out
#[derive(Default)]
struct HeldBackend {
    producers: parking_lot::Mutex<Vec<mpsc::Sender<StreamingToken>>>,
}

impl HeldBackend {
    fn producer(&self, index: usize) -> mpsc::Sender<StreamingToken> {
        self.producers.lock()[index].clone()
    }
}

#[async_trait::async_trait]
impl Backend for HeldBackend {
    fn name(&self) -> &str {
        "Held"
    }

    async fn send_streaming(
        &self,
        _request: &BotRequest,
    ) -> Result<mpsc::Receiver<StreamingToken>, BackendError> {
        let (tx, rx) = mpsc::channel(4);
        tx.send(StreamingToken::Fragment(Fragment::append("start")))
            .await
            .map_err(|e| BackendError::Stream(e.to_string()))?;
        self.producers.lock().push(tx);
        Ok(rx)
    }
}

#[tokio::test]
async fn test_dropping_response_cancels_bots() {
    let backend = Arc::new(HeldBackend::default());
    let orchestrator = Orchestrator::new(
        Arc::clone(&backend) as Arc<dyn Backend>,
        mandatory_only(&["GPT-4", "Claude-2-100k"]),
    )
    .unwrap();

    let mut rx = orchestrator
        .get_response(&QueryRequest::from_text("hi", "key"))
        .await;
    // Header plus "start" from both bots
    for _ in 0..4 {
        assert!(rx.recv().await.is_some());
    }
    assert_eq!(backend.producers.lock().len(), 2);

    drop(rx);

    for index in 0..2 {
        tokio::time::timeout(Duration::from_secs(1), backend.producer(index).closed())
            .await
            .expect("bot stream should be released once the response is dropped");
    }
}
