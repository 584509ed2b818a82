//! Scripted Backend
//!
//! Deterministic in-process backend. Each bot replays a [`BotScript`] of
//! fragments, delays and failures, and every request is recorded so callers
//! can verify which bots were invoked and with what history.
//!
//! # Usage
//!
//! ```ignore
//! use polyglot_core::backend::{BotScript, ScriptedBackend};
//!
//! let backend = ScriptedBackend::new()
//!     .with_bot("GPT-4", BotScript::new().text("Hi").text(" there"))
//!     .with_bot("leocooks", BotScript::new().text("partial").fail("boom"));
//!
//! // After the run, verify which bots were called
//! assert_eq!(backend.request_count("leocooks"), 1);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::traits::{Backend, BackendError, BotRequest, StreamingToken};
use crate::fragment::Fragment;

/// One step of a scripted response
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptStep {
    /// Send a fragment
    Emit(Fragment),
    /// Wait before the next step
    Delay(Duration),
    /// Fail the response mid-stream
    Fail(String),
}

/// Scripted response for one bot
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BotScript {
    steps: Vec<ScriptStep>,
    /// Fail the call itself, before any channel exists
    rejection: Option<String>,
}

impl BotScript {
    /// Create an empty script (the response ends immediately)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A script whose call fails outright
    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self {
            steps: Vec::new(),
            rejection: Some(reason.into()),
        }
    }

    /// Emit a fragment
    #[must_use]
    pub fn emit(mut self, fragment: Fragment) -> Self {
        self.steps.push(ScriptStep::Emit(fragment));
        self
    }

    /// Emit an `Append` fragment
    #[must_use]
    pub fn text(self, text: impl Into<String>) -> Self {
        self.emit(Fragment::append(text))
    }

    /// Emit a `Replace` fragment
    #[must_use]
    pub fn replace(self, text: impl Into<String>) -> Self {
        self.emit(Fragment::replace(text))
    }

    /// Wait before the next step
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.steps.push(ScriptStep::Delay(delay));
        self
    }

    /// Fail mid-stream; later steps are never reached
    #[must_use]
    pub fn fail(mut self, reason: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Fail(reason.into()));
        self
    }

    /// The scripted steps
    #[must_use]
    pub fn steps(&self) -> &[ScriptStep] {
        &self.steps
    }
}

type Responder = Box<dyn Fn(&BotRequest) -> BotScript + Send + Sync>;

/// Backend that replays scripted responses
pub struct ScriptedBackend {
    /// Response generator per bot
    responders: HashMap<String, Responder>,
    /// Request history for verification
    requests: Arc<Mutex<Vec<BotRequest>>>,
    /// Response channel capacity
    channel_capacity: usize,
}

impl std::fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedBackend")
            .field("bot_count", &self.responders.len())
            .field("request_count", &self.requests.lock().len())
            .finish()
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    /// Create a backend that serves no bots
    #[must_use]
    pub fn new() -> Self {
        Self {
            responders: HashMap::new(),
            requests: Arc::new(Mutex::new(Vec::new())),
            channel_capacity: 100,
        }
    }

    /// Serve a bot with a fixed script
    #[must_use]
    pub fn with_bot(self, bot: impl Into<String>, script: BotScript) -> Self {
        self.with_responder(bot, move |_| script.clone())
    }

    /// Serve a bot with a script chosen per request
    #[must_use]
    pub fn with_responder<F>(mut self, bot: impl Into<String>, responder: F) -> Self
    where
        F: Fn(&BotRequest) -> BotScript + Send + Sync + 'static,
    {
        self.responders.insert(bot.into(), Box::new(responder));
        self
    }

    /// Set the response channel capacity
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Get request count for a specific bot
    #[must_use]
    pub fn request_count(&self, bot: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.bot == bot).count()
    }

    /// Get full request history
    #[must_use]
    pub fn requests(&self) -> Vec<BotRequest> {
        self.requests.lock().clone()
    }

    /// Get the bots called, in call order
    #[must_use]
    pub fn called_bots(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.bot.clone()).collect()
    }

    /// Get the last request sent to a specific bot
    #[must_use]
    pub fn last_request_for(&self, bot: &str) -> Option<BotRequest> {
        self.requests
            .lock()
            .iter()
            .rev()
            .find(|r| r.bot == bot)
            .cloned()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "Scripted"
    }

    async fn send_streaming(
        &self,
        request: &BotRequest,
    ) -> Result<mpsc::Receiver<StreamingToken>, BackendError> {
        self.requests.lock().push(request.clone());

        let responder = self
            .responders
            .get(&request.bot)
            .ok_or_else(|| BackendError::UnknownBot(request.bot.clone()))?;
        let script = responder(request);

        if let Some(reason) = script.rejection {
            return Err(BackendError::Stream(reason));
        }

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        tokio::spawn(async move {
            for step in script.steps {
                match step {
                    ScriptStep::Emit(fragment) => {
                        if tx.send(StreamingToken::Fragment(fragment)).await.is_err() {
                            // Receiver dropped, stop replaying
                            return;
                        }
                    }
                    ScriptStep::Delay(delay) => tokio::time::sleep(delay).await,
                    ScriptStep::Fail(reason) => {
                        let _ = tx.send(StreamingToken::Error(reason)).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
