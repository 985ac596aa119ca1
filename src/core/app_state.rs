use std::sync::Arc;

use crate::core::config::PacewardenConfig;
use crate::core::error::PacingError;
use crate::features::antibot::RequestDelay;
use crate::features::click_engine::{ClickDecisionEngine, ClickError, ClickOutcome, ClickTarget};
use crate::features::injection::{InjectionPipeline, RateLimitedInjectionPipeline};
use crate::features::orchestrator::Orchestrator;
use crate::storage::{DocumentStore, JsonFileStore};
use tokio_util::sync::CancellationToken;

/// Everything one process needs, wired from a resolved config.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PacewardenConfig>,
    pub store: Arc<dyn DocumentStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub injection: Arc<RateLimitedInjectionPipeline>,
    pub click_engine: Arc<ClickDecisionEngine>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("storage_root", &self.config.storage_root)
            .field("sliding_window", &self.config.pacing.sliding_window)
            .field(
                "injection_fallback_enabled",
                &self.config.interaction.injection_fallback_enabled,
            )
            .finish()
    }
}

impl AppState {
    /// File-backed state rooted at `config.storage_root`.
    pub fn new(config: PacewardenConfig) -> Self {
        let store: Arc<dyn DocumentStore> =
            Arc::new(JsonFileStore::new(config.storage_root.clone()));
        Self::with_store(config, store)
    }

    pub fn with_store(config: PacewardenConfig, store: Arc<dyn DocumentStore>) -> Self {
        let orchestrator = Orchestrator::new(config.pacing.clone(), store.clone())
            .with_anti_detection(config.anti_detection.clone());
        let injection = Arc::new(RateLimitedInjectionPipeline::new(
            RequestDelay::new(config.injection.min_delay_ms, config.injection.max_delay_ms),
            config.injection.audit_capacity,
        ));
        let pipeline: Arc<dyn InjectionPipeline> = injection.clone();
        Self {
            config: Arc::new(config),
            store,
            orchestrator: Arc::new(orchestrator),
            injection,
            click_engine: Arc::new(ClickDecisionEngine::new(pipeline)),
        }
    }

    /// Click with the operator's interaction policy and the context's live
    /// anti-detection policy as the two dispatch gates.
    pub async fn click_for_context(
        &self,
        context_id: &str,
        target: &dyn ClickTarget,
        cancel: &CancellationToken,
    ) -> Result<Result<ClickOutcome, ClickError>, PacingError> {
        let anti_detection = self.orchestrator.anti_detection_policy(context_id).await?;
        Ok(self
            .click_engine
            .click(target, &self.config.interaction, &anti_detection, cancel)
            .await)
    }
}
