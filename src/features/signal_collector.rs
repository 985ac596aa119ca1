//! Turns execution results into the next [`Signal`] for the orchestrator.

use crate::core::types::Signal;
use crate::features::click_engine::{ClickOutcome, ClickPath};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
pub struct SignalCollector {
    context_id: String,
    workflow: String,
    total_interactions: u64,
    http_429: u64,
    http_403: u64,
    captcha_challenges: u64,
    injection_fallback_used: bool,
    latencies_ms: Vec<f64>,
    human_like_scores: Vec<f64>,
    tags: BTreeSet<String>,
    metrics: BTreeMap<String, f64>,
}

impl SignalCollector {
    pub fn new(context_id: impl Into<String>, workflow: impl Into<String>) -> Self {
        Self {
            context_id: context_id.into(),
            workflow: workflow.into(),
            total_interactions: 0,
            http_429: 0,
            http_403: 0,
            captcha_challenges: 0,
            injection_fallback_used: false,
            latencies_ms: Vec::new(),
            human_like_scores: Vec::new(),
            tags: BTreeSet::new(),
            metrics: BTreeMap::new(),
        }
    }

    /// One interaction that produced an HTTP response.
    pub fn observe_response(&mut self, status: u16, latency_ms: f64) {
        self.total_interactions += 1;
        match status {
            429 => self.http_429 += 1,
            403 => self.http_403 += 1,
            _ => {}
        }
        if latency_ms.is_finite() && latency_ms >= 0.0 {
            self.latencies_ms.push(latency_ms);
        }
    }

    pub fn observe_captcha(&mut self) {
        self.captcha_challenges += 1;
    }

    pub fn observe_click(&mut self, outcome: &ClickOutcome) {
        self.total_interactions += 1;
        if outcome.path == ClickPath::Dispatch {
            self.injection_fallback_used = true;
        }
    }

    pub fn observe_injection_fallback(&mut self) {
        self.injection_fallback_used = true;
    }

    pub fn observe_human_like_score(&mut self, score: f64) {
        if score.is_finite() {
            self.human_like_scores.push(score.clamp(0.0, 1.0));
        }
    }

    pub fn tag(&mut self, tag: impl Into<String>) {
        self.tags.insert(tag.into());
    }

    /// Non-finite values have no JSON form and are skipped.
    pub fn metric(&mut self, name: impl Into<String>, value: f64) {
        if value.is_finite() {
            self.metrics.insert(name.into(), value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_interactions == 0 && self.captcha_challenges == 0
    }

    /// Close the observation window.
    pub fn finish(self, observed_at: DateTime<Utc>) -> Signal {
        let mut sorted = self.latencies_ms;
        sorted.sort_by(|a, b| a.total_cmp(b));
        let human_like_score = if self.human_like_scores.is_empty() {
            1.0
        } else {
            self.human_like_scores.iter().sum::<f64>() / self.human_like_scores.len() as f64
        };
        Signal {
            context_id: self.context_id,
            workflow: self.workflow,
            observed_at,
            total_interactions: self.total_interactions,
            http_429: self.http_429,
            http_403: self.http_403,
            captcha_challenges: self.captcha_challenges,
            injection_fallback_used: self.injection_fallback_used,
            human_like_score,
            p95_latency_ms: nearest_rank(&sorted, 0.95),
            p99_latency_ms: nearest_rank(&sorted, 0.99),
            tags: self.tags,
            metrics: self.metrics,
        }
    }
}

/// Nearest-rank percentile over an ascending slice; 0 when empty.
pub fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_tallied() {
        let mut c = SignalCollector::new("ctx", "comment");
        for status in [200, 200, 429, 403, 403, 500] {
            c.observe_response(status, 100.0);
        }
        c.observe_captcha();
        c.tag("note-detail");
        let signal = c.finish(Utc::now());
        assert_eq!(signal.total_interactions, 6);
        assert_eq!(signal.http_429, 1);
        assert_eq!(signal.http_403, 2);
        assert_eq!(signal.captcha_challenges, 1);
        assert!(signal.tags.contains("note-detail"));
        assert_eq!(signal.human_like_score, 1.0);
    }

    #[test]
    fn percentiles_use_nearest_rank() {
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert_eq!(nearest_rank(&values, 0.95), 95.0);
        assert_eq!(nearest_rank(&values, 0.99), 99.0);
        assert_eq!(nearest_rank(&[42.0], 0.99), 42.0);
        assert_eq!(nearest_rank(&[], 0.95), 0.0);
    }

    #[test]
    fn human_like_scores_are_averaged() {
        let mut c = SignalCollector::new("ctx", "comment");
        c.observe_human_like_score(0.5);
        c.observe_human_like_score(1.5);
        c.observe_human_like_score(f64::NAN);
        let signal = c.finish(Utc::now());
        assert!((signal.human_like_score - 0.75).abs() < 1e-9);
    }
}
