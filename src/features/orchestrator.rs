//! Adaptive pacing orchestrator.
//!
//! Every `record()` call folds one [`Signal`] into the context's sliding
//! window, recomputes hostile-traffic rates over the whole window and emits
//! exactly one [`Adjustment`]. The adjustment is *persisted* (becomes the
//! context's current pacing, enters history, gets an audit document) only
//! when it differs materially from the last persisted one or the minimum
//! adjustment interval has elapsed. Otherwise it is returned to the caller
//! but leaves the pacing untouched.
//!
//! ## Concurrency
//!
//! One async mutex per context id, created lazily and never removed. The
//! whole load → decide → write sequence runs under that gate, so calls on
//! one context apply in gate-acquisition order while different contexts
//! proceed in parallel.
//!
//! ## Documents
//!
//! * `{state_prefix}/{ctx}`: serialized [`ContextState`], rewritten on every call.
//! * `{adjustments_prefix}/{ctx}/{issued_at}`: one per persisted adjustment.
//! * `{adjustments_prefix}/{ctx}/manifest`: latest adjustment + newest-first summaries.

use crate::core::clock::{Clock, SystemClock};
use crate::core::config::{AntiDetectionConfig, PacingConfig};
use crate::core::error::PacingError;
use crate::core::types::{
    Adjustment, AdjustmentManifest, ContextState, ManifestEntry, PacingProfile, Signal,
};
use crate::features::baseline::{self, EnvironmentSnapshot, ValidationResult, Whitelist};
use crate::features::policy::AntiDetectionPolicy;
use crate::storage::{context_key, get_typed, put_typed, DocumentStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 403 rate at which the context is paused outright.
pub const SEVERE_403_RATE: f64 = 0.12;
/// Captcha rate at which the context is paused outright.
pub const SEVERE_CAPTCHA_RATE: f64 = 0.08;

const PAUSE_REASON: &str = "severe anomaly, pause for review";
const STEADY_REASON: &str = "steady: no threshold crossed";

/// Aggregates over the sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowStats {
    pub signals: usize,
    pub total_interactions: u64,
    pub http_429: u64,
    pub http_403: u64,
    pub captcha_challenges: u64,
    pub injection_fallback_used: usize,
    pub rate_429: f64,
    pub rate_403: f64,
    pub rate_captcha: f64,
}

impl WindowStats {
    pub fn from_signals(signals: &[Signal]) -> Self {
        let mut stats = WindowStats {
            signals: signals.len(),
            ..Default::default()
        };
        for s in signals {
            stats.total_interactions =
                stats.total_interactions.saturating_add(s.total_interactions);
            stats.http_429 = stats.http_429.saturating_add(s.http_429);
            stats.http_403 = stats.http_403.saturating_add(s.http_403);
            stats.captcha_challenges =
                stats.captcha_challenges.saturating_add(s.captcha_challenges);
            if s.injection_fallback_used {
                stats.injection_fallback_used += 1;
            }
        }
        let denom = stats.total_interactions.max(1) as f64;
        stats.rate_429 = stats.http_429 as f64 / denom;
        stats.rate_403 = stats.http_403 as f64 / denom;
        stats.rate_captcha = stats.captcha_challenges as f64 / denom;
        stats
    }

    pub fn is_clean(&self) -> bool {
        self.http_429 == 0 && self.http_403 == 0 && self.captcha_challenges == 0
    }
}

/// Output of the pure decision step, before it is stamped into an [`Adjustment`].
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub pacing_profile: PacingProfile,
    pub rotate_fingerprint: bool,
    pub refresh_cookies: bool,
    pub pause_interactions: bool,
    pub enable_navigator_patch: bool,
    pub enable_ua_language_scrub: bool,
    pub confidence: f64,
    pub reason: String,
}

/// Ordered, de-duplicated reason fragments.
#[derive(Debug, Default)]
struct Reasons(Vec<String>);

impl Reasons {
    fn push(&mut self, fragment: impl Into<String>) {
        let fragment = fragment.into();
        if !self.0.contains(&fragment) {
            self.0.push(fragment);
        }
    }

    fn join(self) -> String {
        if self.0.is_empty() {
            STEADY_REASON.to_string()
        } else {
            self.0.join("; ")
        }
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Pick the target profile and side flags for the current window.
///
/// Base profile, first match wins:
/// 1. any rate at/above its high threshold → Conservative
/// 2. Conservative (or Paused) with all rates at/below recovery → one step down
/// 3. not Paused, zero hostile counts across a long enough window → Aggressive
/// 4. otherwise keep the current profile
///
/// Then, independently, a severe 403 or captcha rate forces Paused.
pub fn decide(config: &PacingConfig, current: PacingProfile, stats: &WindowStats) -> Decision {
    let mut reasons = Reasons::default();

    let escalate_429 = stats.rate_429 >= config.http_429_high;
    let escalate_403 = stats.rate_403 >= config.http_403_high;
    let escalate_captcha = stats.rate_captcha >= config.captcha_high;
    let recovered = stats.rate_429 <= config.http_429_recover
        && stats.rate_403 <= config.http_403_recover
        && stats.rate_captcha <= config.captcha_high / 2.0;

    let mut target = if escalate_429 || escalate_403 || escalate_captcha {
        if escalate_429 {
            reasons.push(format!(
                "http_429 rate {:.3} >= {:.3}",
                stats.rate_429, config.http_429_high
            ));
        }
        if escalate_403 {
            reasons.push(format!(
                "http_403 rate {:.3} >= {:.3}",
                stats.rate_403, config.http_403_high
            ));
        }
        if escalate_captcha {
            reasons.push(format!(
                "captcha rate {:.3} >= {:.3}",
                stats.rate_captcha, config.captcha_high
            ));
        }
        PacingProfile::Conservative
    } else if current == PacingProfile::Conservative && recovered {
        reasons.push("recovered: rates below recovery thresholds");
        PacingProfile::Normal
    } else if current == PacingProfile::Paused && recovered {
        reasons.push("recovering from pause: rates below recovery thresholds");
        PacingProfile::Conservative
    } else if current != PacingProfile::Paused
        && stats.is_clean()
        && stats.signals >= config.aggressive_window_requirement
    {
        reasons.push("sustained clean window");
        PacingProfile::Aggressive
    } else {
        current
    };

    if stats.rate_403 >= SEVERE_403_RATE || stats.rate_captcha >= SEVERE_CAPTCHA_RATE {
        target = PacingProfile::Paused;
        reasons.push(PAUSE_REASON);
    }

    let enable_navigator_patch = stats.http_403 > 0 || stats.injection_fallback_used > 0;
    let enable_ua_language_scrub = stats.rate_429 > config.http_429_high / 2.0;
    let rotate_fingerprint =
        stats.rate_403 > config.http_403_high || stats.injection_fallback_used >= 2;
    let refresh_cookies = stats.rate_captcha >= config.captcha_high || rotate_fingerprint;
    let confidence = round3(
        (1.0 - (stats.rate_429 + stats.rate_403) - stats.rate_captcha * 0.5).clamp(0.0, 1.0),
    );

    Decision {
        pacing_profile: target,
        rotate_fingerprint,
        refresh_cookies,
        pause_interactions: target == PacingProfile::Paused,
        enable_navigator_patch,
        enable_ua_language_scrub,
        confidence,
        reason: reasons.join(),
    }
}

/// Persisted record of a baseline check run through the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineAudit {
    pub context_id: String,
    pub checked_at: DateTime<Utc>,
    pub result: ValidationResult,
}

pub struct Orchestrator {
    config: PacingConfig,
    anti_detection: AntiDetectionConfig,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(config: PacingConfig, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            config,
            anti_detection: AntiDetectionConfig::default(),
            store,
            clock: Arc::new(SystemClock),
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_anti_detection(mut self, anti_detection: AntiDetectionConfig) -> Self {
        self.anti_detection = anti_detection;
        self
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    fn gate_for(&self, context_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(|p| p.into_inner());
        gates
            .entry(context_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn state_key(&self, context_id: &str) -> String {
        format!("{}/{}", self.config.state_prefix, context_key(context_id))
    }

    fn adjustments_dir(&self, context_id: &str) -> String {
        format!("{}/{}", self.config.adjustments_prefix, context_key(context_id))
    }

    fn require_context_id(context_id: &str) -> Result<(), PacingError> {
        if context_id.trim().is_empty() {
            Err(PacingError::validation("context_id must not be empty"))
        } else {
            Ok(())
        }
    }

    /// Fold a signal into its context and return the resulting adjustment.
    pub async fn record(&self, signal: Signal) -> Result<Adjustment, PacingError> {
        self.record_cancellable(signal, &CancellationToken::new())
            .await
    }

    /// [`record`](Self::record) that gives up while waiting for the context gate.
    ///
    /// Cancellation is only honored before the gate is held; once state is
    /// being mutated the call runs to completion.
    pub async fn record_cancellable(
        &self,
        mut signal: Signal,
        cancel: &CancellationToken,
    ) -> Result<Adjustment, PacingError> {
        Self::require_context_id(&signal.context_id)?;

        let gate = self.gate_for(&signal.context_id);
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PacingError::Cancelled),
            guard = gate.lock() => guard,
        };

        let context_id = signal.context_id.clone();
        let mut state = self
            .load_state(&context_id)
            .await?
            .unwrap_or_else(|| ContextState::new(context_id.clone(), signal.workflow.clone()));
        if !signal.workflow.trim().is_empty() {
            state.workflow = signal.workflow.clone();
        }

        let tags = signal.tags.clone();
        state.update_human_like_score(signal.human_like_score);
        signal.sanitize(state.smoothed_human_like_score);
        state.push_signal(signal, self.config.sliding_window);

        let stats = WindowStats::from_signals(&state.signals);
        let decision = decide(&self.config, state.current_pacing, &stats);
        let now = self.clock.now();
        let adjustment = stamp(&state, decision, tags, now);

        if self.should_persist(&state, &adjustment, now) {
            state.current_pacing = adjustment.pacing_profile;
            state.last_adjustment = Some(adjustment.clone());
            state.last_adjustment_at = Some(now);
            state.push_history(adjustment.clone(), self.config.history_depth);
            self.write_audit(&adjustment).await?;
            info!(
                "pacing: {} -> {} (confidence {:.3}): {}",
                context_id, adjustment.pacing_profile, adjustment.confidence, adjustment.reason
            );
            if adjustment.pause_interactions {
                warn!(
                    "pacing: {} paused; manual review required ({})",
                    context_id, adjustment.reason
                );
            }
        } else {
            debug!(
                "pacing: {} decision unchanged ({}), not persisted",
                context_id, adjustment.pacing_profile
            );
        }

        self.save_state(&state).await?;
        Ok(adjustment)
    }

    fn should_persist(
        &self,
        state: &ContextState,
        adjustment: &Adjustment,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(last) = &state.last_adjustment else {
            return true;
        };
        if last.differs_materially(adjustment) {
            return true;
        }
        match state.last_adjustment_at {
            Some(at) => now - at > self.config.minimum_adjustment_interval(),
            None => true,
        }
    }

    async fn load_state(&self, context_id: &str) -> Result<Option<ContextState>, PacingError> {
        Ok(get_typed(self.store.as_ref(), &self.state_key(context_id)).await?)
    }

    async fn save_state(&self, state: &ContextState) -> Result<(), PacingError> {
        put_typed(self.store.as_ref(), &self.state_key(&state.context_id), state).await?;
        Ok(())
    }

    async fn write_audit(&self, adjustment: &Adjustment) -> Result<(), PacingError> {
        let dir = self.adjustments_dir(&adjustment.context_id);
        let file = format!(
            "{}/{}",
            dir,
            adjustment.issued_at.format("%Y%m%dT%H%M%S%.3fZ")
        );
        put_typed(self.store.as_ref(), &file, adjustment).await?;

        let manifest_key = format!("{}/manifest", dir);
        let mut manifest = get_typed::<AdjustmentManifest>(self.store.as_ref(), &manifest_key)
            .await?
            .unwrap_or_else(|| AdjustmentManifest {
                context_id: adjustment.context_id.clone(),
                latest: adjustment.clone(),
                entries: Vec::new(),
            });
        manifest.latest = adjustment.clone();
        manifest.entries.insert(
            0,
            ManifestEntry {
                issued_at: adjustment.issued_at,
                pacing_profile: adjustment.pacing_profile,
                reason: adjustment.reason.clone(),
                confidence: adjustment.confidence,
                file,
            },
        );
        manifest.entries.truncate(self.config.history_depth);
        put_typed(self.store.as_ref(), &manifest_key, &manifest).await?;
        Ok(())
    }

    /// Read-only snapshot of a context's state.
    pub async fn get_state(&self, context_id: &str) -> Result<Option<ContextState>, PacingError> {
        Self::require_context_id(context_id)?;
        self.load_state(context_id).await
    }

    /// Persisted adjustments, newest first, at most `min(take, history_depth)`.
    pub async fn get_recent_adjustments(
        &self,
        context_id: &str,
        take: usize,
    ) -> Result<Vec<Adjustment>, PacingError> {
        Self::require_context_id(context_id)?;
        let Some(state) = self.load_state(context_id).await? else {
            return Ok(Vec::new());
        };
        let mut history = state.history;
        history.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        history.truncate(take.min(self.config.history_depth));
        Ok(history)
    }

    pub async fn get_manifest(
        &self,
        context_id: &str,
    ) -> Result<Option<AdjustmentManifest>, PacingError> {
        Self::require_context_id(context_id)?;
        let key = format!("{}/manifest", self.adjustments_dir(context_id));
        Ok(get_typed(self.store.as_ref(), &key).await?)
    }

    /// Anti-detection view for the click engine: static config + live state.
    pub async fn anti_detection_policy(
        &self,
        context_id: &str,
    ) -> Result<AntiDetectionPolicy, PacingError> {
        let state = self.get_state(context_id).await?;
        Ok(AntiDetectionPolicy::derive(&self.anti_detection, state.as_ref()))
    }

    /// Validate a snapshot and keep the result next to the context's adjustments.
    pub async fn audit_snapshot(
        &self,
        context_id: &str,
        snapshot: &EnvironmentSnapshot,
        whitelist: &Whitelist,
    ) -> Result<ValidationResult, PacingError> {
        Self::require_context_id(context_id)?;
        let result = baseline::validate(snapshot, whitelist);
        let checked_at = self.clock.now();
        let key = format!(
            "{}/baseline-{}",
            self.adjustments_dir(context_id),
            checked_at.format("%Y%m%dT%H%M%S%.3fZ")
        );
        let audit = BaselineAudit {
            context_id: context_id.to_string(),
            checked_at,
            result: result.clone(),
        };
        put_typed(self.store.as_ref(), &key, &audit).await?;

        if result.is_hard_failure() {
            warn!(
                "baseline: {} failed with {} violations: {:?}",
                context_id, result.total_violations, result.violations
            );
        } else if result.degrade_recommended {
            info!(
                "baseline: {} degraded ({} violations within tolerance): {:?}",
                context_id, result.total_violations, result.violations
            );
        }
        Ok(result)
    }
}

fn stamp(
    state: &ContextState,
    decision: Decision,
    tags: BTreeSet<String>,
    issued_at: DateTime<Utc>,
) -> Adjustment {
    Adjustment {
        context_id: state.context_id.clone(),
        workflow: state.workflow.clone(),
        issued_at,
        pacing_profile: decision.pacing_profile,
        rotate_fingerprint: decision.rotate_fingerprint,
        refresh_cookies: decision.refresh_cookies,
        pause_interactions: decision.pause_interactions,
        enable_navigator_patch: decision.enable_navigator_patch,
        enable_ua_language_scrub: decision.enable_ua_language_scrub,
        confidence: decision.confidence,
        reason: decision.reason,
        tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(total: u64, h429: u64, h403: u64, captcha: u64, signals: usize) -> WindowStats {
        let mut window = Vec::new();
        for i in 0..signals {
            let mut s = Signal::new("ctx", "comment", Utc::now());
            if i == 0 {
                s = s.with_counts(total, h429, h403, captcha);
            }
            window.push(s);
        }
        WindowStats::from_signals(&window)
    }

    #[test]
    fn rates_use_total_interactions_floor_of_one() {
        let s = stats(0, 1, 0, 0, 1);
        assert_eq!(s.rate_429, 1.0);
        let s = stats(200, 10, 4, 2, 3);
        assert!((s.rate_429 - 0.05).abs() < 1e-12);
        assert!((s.rate_403 - 0.02).abs() < 1e-12);
        assert!((s.rate_captcha - 0.01).abs() < 1e-12);
    }

    #[test]
    fn high_403_escalates_with_rate_in_reason() {
        let cfg = PacingConfig::default();
        let d = decide(&cfg, PacingProfile::Normal, &stats(100, 0, 5, 0, 1));
        assert_eq!(d.pacing_profile, PacingProfile::Conservative);
        assert!(d.reason.contains("0.050"), "reason: {}", d.reason);
        assert!(d.rotate_fingerprint);
        assert!(d.refresh_cookies);
        assert!(d.enable_navigator_patch);
        assert_eq!(d.confidence, 0.95);
    }

    #[test]
    fn conservative_recovers_to_normal() {
        let cfg = PacingConfig::default();
        let d = decide(&cfg, PacingProfile::Conservative, &stats(1000, 5, 2, 5, 2));
        assert_eq!(d.pacing_profile, PacingProfile::Normal);
        assert!(d.reason.starts_with("recovered"));
    }

    #[test]
    fn paused_steps_down_to_conservative_on_clean_window() {
        let cfg = PacingConfig::default();
        let d = decide(&cfg, PacingProfile::Paused, &stats(100, 0, 0, 0, 10));
        assert_eq!(d.pacing_profile, PacingProfile::Conservative);
        assert!(!d.pause_interactions);
    }

    #[test]
    fn clean_window_needs_enough_signals_for_aggressive() {
        let cfg = PacingConfig::default();
        let short = decide(&cfg, PacingProfile::Normal, &stats(100, 0, 0, 0, 5));
        assert_eq!(short.pacing_profile, PacingProfile::Normal);
        assert_eq!(short.reason, STEADY_REASON);

        let long = decide(&cfg, PacingProfile::Normal, &stats(100, 0, 0, 0, 6));
        assert_eq!(long.pacing_profile, PacingProfile::Aggressive);
        assert_eq!(long.reason, "sustained clean window");
        assert_eq!(long.confidence, 1.0);
    }

    #[test]
    fn severe_captcha_forces_pause() {
        let cfg = PacingConfig::default();
        let d = decide(&cfg, PacingProfile::Aggressive, &stats(100, 0, 0, 8, 1));
        assert_eq!(d.pacing_profile, PacingProfile::Paused);
        assert!(d.pause_interactions);
        assert!(d.reason.ends_with(PAUSE_REASON));
        assert!(d.reason.contains("captcha rate 0.080"));
        assert_eq!(d.confidence, 0.96);
    }

    #[test]
    fn severe_403_forces_pause_even_from_paused() {
        let cfg = PacingConfig::default();
        let d = decide(&cfg, PacingProfile::Paused, &stats(100, 0, 12, 0, 1));
        assert_eq!(d.pacing_profile, PacingProfile::Paused);
    }

    #[test]
    fn derived_flags() {
        let cfg = PacingConfig::default();
        // 429 rate 0.03: above half the high threshold, below escalation.
        let d = decide(&cfg, PacingProfile::Normal, &stats(100, 3, 0, 0, 1));
        assert!(d.enable_ua_language_scrub);
        assert!(!d.enable_navigator_patch);
        assert!(!d.rotate_fingerprint);
        assert!(!d.refresh_cookies);
        assert_eq!(d.pacing_profile, PacingProfile::Normal);
    }

    #[test]
    fn repeated_injection_fallback_rotates_fingerprint() {
        let cfg = PacingConfig::default();
        let mut window = Vec::new();
        for _ in 0..2 {
            let mut s = Signal::new("ctx", "comment", Utc::now()).with_counts(10, 0, 0, 0);
            s.injection_fallback_used = true;
            window.push(s);
        }
        let d = decide(&cfg, PacingProfile::Normal, &WindowStats::from_signals(&window));
        assert!(d.rotate_fingerprint);
        assert!(d.refresh_cookies);
        assert!(d.enable_navigator_patch);
    }

    #[test]
    fn huge_counters_saturate_instead_of_overflowing() {
        let window = vec![
            Signal::new("ctx", "comment", Utc::now()).with_counts(u64::MAX, 0, 0, 0),
            Signal::new("ctx", "comment", Utc::now()).with_counts(1, 0, 1, 0),
        ];
        let s = WindowStats::from_signals(&window);
        assert_eq!(s.total_interactions, u64::MAX);
        assert_eq!(s.http_403, 1);
        assert!(s.rate_403 < 1e-12);
    }

    #[test]
    fn reasons_are_deduplicated_in_order() {
        let mut r = Reasons::default();
        r.push("a");
        r.push("b");
        r.push("a");
        assert_eq!(r.join(), "a; b");
    }
}
