//! Orchestrator
//!
//! Entry point for one request: route it, fan it out to every selected bot
//! through a labeling adapter, and merge the labeled streams into a single
//! live answer.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::backend::{Backend, BotRequest};
use crate::config::{ConfigError, PolyglotConfig};
use crate::fragment::Fragment;
use crate::messages::QueryRequest;
use crate::routing::{reattribute_request, BackendRole, QueryRouter};
use crate::streaming::{ErrorPolicy, LabelingAdapter, StreamMultiplexer};

/// Fans requests out to several bots and merges their answers
pub struct Orchestrator {
    backend: Arc<dyn Backend>,
    config: PolyglotConfig,
    router: QueryRouter,
}

impl Orchestrator {
    /// Create an orchestrator over `backend`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if `config` fails validation.
    pub fn new(backend: Arc<dyn Backend>, config: PolyglotConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let router = QueryRouter::new(Arc::clone(&backend), &config);

        Ok(Self {
            backend,
            config,
            router,
        })
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &PolyglotConfig {
        &self.config
    }

    /// Declared bots with their priority weights
    #[must_use]
    pub fn dependencies(&self) -> BTreeMap<String, u32> {
        self.config.dependencies()
    }

    /// Answer `request` as a live stream of merged fragments
    ///
    /// Resolves once routing is decided; the returned channel then carries
    /// one snapshot per content change plus forwarded suggested replies, and
    /// closes when every bot has finished. Dropping it cancels every bot.
    pub async fn get_response(&self, request: &QueryRequest) -> mpsc::Receiver<Fragment> {
        let selection = self.router.decide(request).await;

        info!(
            conversation = %request.conversation_id.0,
            backend = self.backend.name(),
            bots = ?selection.ids(),
            "Dispatching request"
        );

        let mut multiplexer = StreamMultiplexer::with_channel_capacity(self.config.channel_capacity);
        for selected in &selection {
            let label = self.config.label_for(&selected.id);
            let bot_request =
                BotRequest::new(selected.id.clone(), reattribute_request(request, &label));

            let error_policy = match selected.role {
                BackendRole::Enrichment => ErrorPolicy::Omit,
                BackendRole::Mandatory | BackendRole::Optional => ErrorPolicy::Marker,
            };

            let adapter = LabelingAdapter::new(label)
                .with_error_policy(error_policy)
                .with_timeout(self.config.request_timeout)
                .with_channel_capacity(self.config.channel_capacity);

            multiplexer.add_source(adapter.wrap(Arc::clone(&self.backend), bot_request));
        }

        multiplexer.merge()
    }
}
