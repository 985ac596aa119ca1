use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

fn default_human_like_score() -> f64 {
    1.0
}

/// One observation window's worth of traffic/behavior counters for one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub context_id: String,
    pub workflow: String,
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub total_interactions: u64,
    #[serde(default)]
    pub http_429: u64,
    #[serde(default)]
    pub http_403: u64,
    #[serde(default)]
    pub captcha_challenges: u64,
    #[serde(default)]
    pub injection_fallback_used: bool,
    /// Behavioral score in `[0, 1]`; 1.0 means indistinguishable from a human.
    #[serde(default = "default_human_like_score")]
    pub human_like_score: f64,
    #[serde(default)]
    pub p95_latency_ms: f64,
    #[serde(default)]
    pub p99_latency_ms: f64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Open-ended metric bag; no schema beyond string keys.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl Signal {
    /// Empty signal (all counters zero, perfect human-likeness) for a context.
    pub fn new(
        context_id: impl Into<String>,
        workflow: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            context_id: context_id.into(),
            workflow: workflow.into(),
            observed_at,
            total_interactions: 0,
            http_429: 0,
            http_403: 0,
            captcha_challenges: 0,
            injection_fallback_used: false,
            human_like_score: 1.0,
            p95_latency_ms: 0.0,
            p99_latency_ms: 0.0,
            tags: BTreeSet::new(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_counts(mut self, total: u64, http_429: u64, http_403: u64, captcha: u64) -> Self {
        self.total_interactions = total;
        self.http_429 = http_429;
        self.http_403 = http_403;
        self.captcha_challenges = captcha;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn hostile_count(&self) -> u64 {
        self.http_429
            .saturating_add(self.http_403)
            .saturating_add(self.captcha_challenges)
    }

    /// Make every float JSON-representable before the signal enters a window.
    ///
    /// A non-finite score becomes `fallback_score`, non-finite or negative
    /// latencies become 0, and non-finite metrics are dropped.
    pub fn sanitize(&mut self, fallback_score: f64) {
        self.human_like_score = if self.human_like_score.is_finite() {
            self.human_like_score.clamp(0.0, 1.0)
        } else {
            fallback_score
        };
        for latency in [&mut self.p95_latency_ms, &mut self.p99_latency_ms] {
            if !latency.is_finite() || *latency < 0.0 {
                *latency = 0.0;
            }
        }
        self.metrics.retain(|_, v| v.is_finite());
    }
}

/// How fast/cautious automated interaction should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PacingProfile {
    Aggressive,
    #[default]
    Normal,
    Conservative,
    Paused,
}

impl PacingProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacingProfile::Aggressive => "aggressive",
            PacingProfile::Normal => "normal",
            PacingProfile::Conservative => "conservative",
            PacingProfile::Paused => "paused",
        }
    }

    pub fn parse_str(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "aggressive" => Some(PacingProfile::Aggressive),
            "normal" => Some(PacingProfile::Normal),
            "conservative" => Some(PacingProfile::Conservative),
            "paused" => Some(PacingProfile::Paused),
            _ => None,
        }
    }
}

impl std::fmt::Display for PacingProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable decision record produced by every `record()` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub context_id: String,
    pub workflow: String,
    pub issued_at: DateTime<Utc>,
    pub pacing_profile: PacingProfile,
    pub rotate_fingerprint: bool,
    pub refresh_cookies: bool,
    pub pause_interactions: bool,
    pub enable_navigator_patch: bool,
    pub enable_ua_language_scrub: bool,
    pub confidence: f64,
    pub reason: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Adjustment {
    /// Whether `other` would change what the automation does (or why).
    ///
    /// Reason text is compared verbatim, so fragments must be emitted in a
    /// stable order.
    pub fn differs_materially(&self, other: &Adjustment) -> bool {
        self.pacing_profile != other.pacing_profile
            || self.rotate_fingerprint != other.rotate_fingerprint
            || self.refresh_cookies != other.refresh_cookies
            || self.pause_interactions != other.pause_interactions
            || self.enable_navigator_patch != other.enable_navigator_patch
            || self.enable_ua_language_scrub != other.enable_ua_language_scrub
            || self.reason != other.reason
    }
}

/// Per-context state, owned exclusively by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextState {
    pub context_id: String,
    pub workflow: String,
    /// Sliding window, oldest first.
    pub signals: Vec<Signal>,
    pub current_pacing: PacingProfile,
    pub smoothed_human_like_score: f64,
    pub last_adjustment: Option<Adjustment>,
    pub last_adjustment_at: Option<DateTime<Utc>>,
    /// Persisted adjustments, oldest first.
    pub history: Vec<Adjustment>,
}

pub const HUMAN_LIKE_SCORE_ALPHA: f64 = 0.2;

impl ContextState {
    pub fn new(context_id: impl Into<String>, workflow: impl Into<String>) -> Self {
        Self {
            context_id: context_id.into(),
            workflow: workflow.into(),
            signals: Vec::new(),
            current_pacing: PacingProfile::Normal,
            smoothed_human_like_score: 1.0,
            last_adjustment: None,
            last_adjustment_at: None,
            history: Vec::new(),
        }
    }

    /// Insert into the window, re-sort by observation time and keep the newest `window`.
    pub fn push_signal(&mut self, signal: Signal, window: usize) {
        self.signals.push(signal);
        self.signals.sort_by_key(|s| s.observed_at);
        if self.signals.len() > window {
            let excess = self.signals.len() - window;
            self.signals.drain(..excess);
        }
    }

    pub fn update_human_like_score(&mut self, observed: f64) {
        let observed = if observed.is_finite() {
            observed.clamp(0.0, 1.0)
        } else {
            self.smoothed_human_like_score
        };
        self.smoothed_human_like_score = self.smoothed_human_like_score
            * (1.0 - HUMAN_LIKE_SCORE_ALPHA)
            + HUMAN_LIKE_SCORE_ALPHA * observed;
    }

    pub fn push_history(&mut self, adjustment: Adjustment, depth: usize) {
        self.history.push(adjustment);
        if self.history.len() > depth {
            let excess = self.history.len() - depth;
            self.history.drain(..excess);
        }
    }
}

/// One line of the per-context adjustment manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub issued_at: DateTime<Utc>,
    pub pacing_profile: PacingProfile,
    pub reason: String,
    pub confidence: f64,
    /// Store key of the full adjustment document.
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentManifest {
    pub context_id: String,
    pub latest: Adjustment,
    /// Newest first.
    pub entries: Vec<ManifestEntry>,
}
