//! Read-only policy views consumed by the click decision engine.
//!
//! The injected-event fallback needs two independent approvals: the
//! operator's local [`InteractionPolicy`] and the orchestrator-derived
//! [`AntiDetectionPolicy`]. Each is an [`InjectionGate`]; the engine asks both.

use crate::core::config::AntiDetectionConfig;
use crate::core::types::{ContextState, PacingProfile};
use serde::{Deserialize, Serialize};

pub trait InjectionGate: Send + Sync {
    fn permits_injection(&self) -> bool;
    fn gate_name(&self) -> &'static str;
}

/// Static, operator-set interaction policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionPolicy {
    #[serde(default)]
    pub injection_fallback_enabled: bool,
}

impl InjectionGate for InteractionPolicy {
    fn permits_injection(&self) -> bool {
        self.injection_fallback_enabled
    }

    fn gate_name(&self) -> &'static str {
        "interaction_policy"
    }
}

/// Snapshot of the orchestrator's live stance for one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntiDetectionPolicy {
    pub allow_ui_injection_fallback: bool,
    pub pacing_profile: PacingProfile,
    pub enable_navigator_patch: bool,
    pub enable_ua_language_scrub: bool,
    pub rotate_fingerprint: bool,
    pub refresh_cookies: bool,
}

impl AntiDetectionPolicy {
    /// Static config plus live state. A paused context never permits injection.
    pub fn derive(config: &AntiDetectionConfig, state: Option<&ContextState>) -> Self {
        let pacing_profile = state.map(|s| s.current_pacing).unwrap_or_default();
        let last = state.and_then(|s| s.last_adjustment.as_ref());
        Self {
            allow_ui_injection_fallback: config.allow_ui_injection_fallback
                && pacing_profile != PacingProfile::Paused,
            pacing_profile,
            enable_navigator_patch: last.is_some_and(|a| a.enable_navigator_patch),
            enable_ua_language_scrub: last.is_some_and(|a| a.enable_ua_language_scrub),
            rotate_fingerprint: last.is_some_and(|a| a.rotate_fingerprint),
            refresh_cookies: last.is_some_and(|a| a.refresh_cookies),
        }
    }
}

impl InjectionGate for AntiDetectionPolicy {
    fn permits_injection(&self) -> bool {
        self.allow_ui_injection_fallback
    }

    fn gate_name(&self) -> &'static str {
        "anti_detection_policy"
    }
}
