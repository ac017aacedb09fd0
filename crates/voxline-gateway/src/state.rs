//! Gateway shared state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use voxline_core::config::Config;
use voxline_pipeline::Runner;
use voxline_providers::{ConfigResolver, ProviderResolver};

use crate::registry::SessionRegistry;

/// Shared state handed to every HTTP handler and WebSocket connection.
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub runner: Arc<Runner>,
    pub resolver: Arc<dyn ProviderResolver>,
    pub started_at: Instant,
    #[cfg(feature = "metrics")]
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl AppState {
    pub fn new(config: Arc<Config>, resolver: Arc<dyn ProviderResolver>) -> Self {
        let grace = Duration::from_millis(config.pipeline().shutdown_grace_ms);
        Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            runner: Arc::new(Runner::new(grace)),
            resolver,
            started_at: Instant::now(),
            #[cfg(feature = "metrics")]
            prometheus: None,
        }
    }

    /// State whose providers are built from `config`.
    pub fn from_config(config: Arc<Config>) -> Self {
        let resolver = Arc::new(ConfigResolver::new(config.clone()));
        Self::new(config, resolver)
    }

    #[cfg(feature = "metrics")]
    pub fn with_prometheus(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    /// System prompt for a session, honouring a per-session override.
    pub fn system_prompt(&self, session: &voxline_core::session::SessionConfig) -> String {
        session
            .system_prompt
            .clone()
            .unwrap_or_else(|| self.config.llm().system_prompt)
    }
}
