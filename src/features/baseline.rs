//! Environment baseline validation against an operator-authored whitelist.
//!
//! [`validate`] is a pure function: no I/O, no hidden state, safe to call from
//! any number of tasks at once. Every whitelist field is optional and an
//! absent field is simply not checked. Each failing rule appends a stable
//! violation code; rules that fail per-token embed the token in the code
//! (`UA_MUST_CONTAIN:Chrome`).

use crate::core::error::PacingError;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const WEBDRIVER_NOT_ALLOWED: &str = "WEBDRIVER_NOT_ALLOWED";
pub const PLATFORM_NOT_ALLOWED: &str = "PLATFORM_NOT_ALLOWED";
pub const TIMEZONE_NOT_ALLOWED: &str = "TIMEZONE_NOT_ALLOWED";
pub const LANGUAGE_NOT_ALLOWED: &str = "LANGUAGE_NOT_ALLOWED";
pub const WEBGL_VENDOR_NOT_ALLOWED: &str = "WEBGL_VENDOR_NOT_ALLOWED";
pub const WEBGL_RENDERER_NOT_ALLOWED: &str = "WEBGL_RENDERER_NOT_ALLOWED";
pub const UA_MUST_CONTAIN: &str = "UA_MUST_CONTAIN";
pub const UA_MUST_NOT_CONTAIN: &str = "UA_MUST_NOT_CONTAIN";
pub const DEVICE_PIXEL_RATIO_TOO_LOW: &str = "DEVICE_PIXEL_RATIO_TOO_LOW";
pub const HARDWARE_CONCURRENCY_TOO_LOW: &str = "HARDWARE_CONCURRENCY_TOO_LOW";
pub const COOKIES_ENABLED_MISMATCH: &str = "COOKIES_ENABLED_MISMATCH";
pub const LOCAL_STORAGE_KEYS_TOO_LOW: &str = "LOCAL_STORAGE_KEYS_TOO_LOW";
pub const SESSION_STORAGE_KEYS_TOO_LOW: &str = "SESSION_STORAGE_KEYS_TOO_LOW";
pub const FONT_REQUIRED_MISSING: &str = "FONT_REQUIRED_MISSING";
pub const FONT_FORBIDDEN_PRESENT: &str = "FONT_FORBIDDEN_PRESENT";
pub const PERMISSION_STATE_DENIED: &str = "PERMISSION_STATE_DENIED";
pub const MEDIA_AUDIO_INPUTS_TOO_LOW: &str = "MEDIA_AUDIO_INPUTS_TOO_LOW";
pub const MEDIA_AUDIO_OUTPUTS_TOO_LOW: &str = "MEDIA_AUDIO_OUTPUTS_TOO_LOW";
pub const MEDIA_VIDEO_INPUTS_TOO_LOW: &str = "MEDIA_VIDEO_INPUTS_TOO_LOW";
pub const SENSOR_REQUIRED_MISSING: &str = "SENSOR_REQUIRED_MISSING";
pub const SENSOR_FORBIDDEN_PRESENT: &str = "SENSOR_FORBIDDEN_PRESENT";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaDeviceCounts {
    #[serde(default)]
    pub audio_inputs: Option<u32>,
    #[serde(default)]
    pub audio_outputs: Option<u32>,
    #[serde(default)]
    pub video_inputs: Option<u32>,
}

/// Browser environment fingerprint, captured externally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentSnapshot {
    pub user_agent: Option<String>,
    pub webdriver: Option<bool>,
    pub platform: Option<String>,
    pub timezone: Option<String>,
    pub languages: Vec<String>,
    pub webgl_vendor: Option<String>,
    pub webgl_renderer: Option<String>,
    pub device_pixel_ratio: Option<f64>,
    pub hardware_concurrency: Option<u32>,
    pub cookies_enabled: Option<bool>,
    pub local_storage_keys: Option<u32>,
    pub session_storage_keys: Option<u32>,
    pub fonts: Vec<String>,
    /// Permission name → reported state (`granted`, `denied`, `prompt`).
    pub permissions: BTreeMap<String, String>,
    pub media_devices: MediaDeviceCounts,
    /// Sensor name → supported.
    pub sensors: BTreeMap<String, bool>,
}

/// Allow-list policy. Absent field = unchecked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Whitelist {
    /// Allowed `navigator.webdriver` values. An empty list means "expect false".
    pub allowed_webdrivers: Option<Vec<bool>>,
    pub allowed_platforms: Option<Vec<String>>,
    pub allowed_timezones: Option<Vec<String>>,
    /// Passes if any reported language is listed.
    pub allowed_languages: Option<Vec<String>>,
    pub allowed_webgl_vendors: Option<Vec<String>>,
    /// Passes if any pattern matches the renderer string.
    pub webgl_renderer_patterns: Option<Vec<String>>,
    pub user_agent_must_contain: Option<Vec<String>>,
    pub user_agent_must_not_contain: Option<Vec<String>>,
    pub min_device_pixel_ratio: Option<f64>,
    pub min_hardware_concurrency: Option<u32>,
    pub cookies_enabled: Option<bool>,
    pub min_local_storage_keys: Option<u32>,
    pub min_session_storage_keys: Option<u32>,
    pub fonts_required_any: Option<Vec<String>>,
    pub fonts_forbidden_any: Option<Vec<String>>,
    /// Permission name → allowed states.
    pub permission_states: Option<BTreeMap<String, Vec<String>>>,
    pub min_audio_inputs: Option<u32>,
    pub min_audio_outputs: Option<u32>,
    pub min_video_inputs: Option<u32>,
    pub sensors_required_any: Option<Vec<String>>,
    pub sensors_forbidden_any: Option<Vec<String>>,
    /// Violations at or below this count are a soft failure.
    pub max_violations: usize,
}

impl Whitelist {
    pub fn from_json_str(raw: &str) -> Result<Self, PacingError> {
        serde_json::from_str(raw)
            .map_err(|e| PacingError::validation(format!("malformed whitelist: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self, PacingError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PacingError::validation(format!(
                "cannot read whitelist {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&raw)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub violations: Vec<String>,
    pub total_violations: usize,
    pub degrade_recommended: bool,
}

impl ValidationResult {
    pub fn is_clean(&self) -> bool {
        self.total_violations == 0
    }

    /// Violations beyond the tolerated count.
    pub fn is_hard_failure(&self) -> bool {
        self.total_violations > 0 && !self.degrade_recommended
    }
}

fn eq_ci(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn in_set(value: Option<&str>, allowed: &[String]) -> bool {
    value.is_some_and(|v| allowed.iter().any(|a| eq_ci(a, v)))
}

fn below<T: PartialOrd + Copy>(value: Option<T>, min: Option<T>) -> bool {
    matches!((value, min), (Some(v), Some(m)) if v < m)
}

fn any_regex_matches(value: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| {
        RegexBuilder::new(p)
            .case_insensitive(true)
            .build()
            .map(|re| re.is_match(value))
            .unwrap_or(false)
    })
}

/// Compare a captured snapshot against a whitelist.
pub fn validate(snapshot: &EnvironmentSnapshot, whitelist: &Whitelist) -> ValidationResult {
    let mut violations: Vec<String> = Vec::new();

    if let Some(allowed) = &whitelist.allowed_webdrivers {
        let webdriver = snapshot.webdriver.unwrap_or(false);
        let ok = if allowed.is_empty() {
            !webdriver
        } else {
            allowed.contains(&webdriver)
        };
        if !ok {
            violations.push(WEBDRIVER_NOT_ALLOWED.to_string());
        }
    }

    for (allowed, value, code) in [
        (
            &whitelist.allowed_platforms,
            snapshot.platform.as_deref(),
            PLATFORM_NOT_ALLOWED,
        ),
        (
            &whitelist.allowed_timezones,
            snapshot.timezone.as_deref(),
            TIMEZONE_NOT_ALLOWED,
        ),
        (
            &whitelist.allowed_webgl_vendors,
            snapshot.webgl_vendor.as_deref(),
            WEBGL_VENDOR_NOT_ALLOWED,
        ),
    ] {
        if let Some(allowed) = allowed {
            if !in_set(value, allowed) {
                violations.push(code.to_string());
            }
        }
    }

    if let Some(allowed) = &whitelist.allowed_languages {
        if !snapshot
            .languages
            .iter()
            .any(|l| in_set(Some(l.as_str()), allowed))
        {
            violations.push(LANGUAGE_NOT_ALLOWED.to_string());
        }
    }

    let ua = snapshot
        .user_agent
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    if let Some(tokens) = &whitelist.user_agent_must_contain {
        for token in tokens {
            if !ua.contains(&token.to_lowercase()) {
                violations.push(format!("{}:{}", UA_MUST_CONTAIN, token));
            }
        }
    }
    if let Some(tokens) = &whitelist.user_agent_must_not_contain {
        for token in tokens {
            if !token.is_empty() && ua.contains(&token.to_lowercase()) {
                violations.push(format!("{}:{}", UA_MUST_NOT_CONTAIN, token));
            }
        }
    }

    if let Some(patterns) = &whitelist.webgl_renderer_patterns {
        let ok = snapshot
            .webgl_renderer
            .as_deref()
            .is_some_and(|r| any_regex_matches(r, patterns));
        if !ok {
            violations.push(WEBGL_RENDERER_NOT_ALLOWED.to_string());
        }
    }

    if below(snapshot.device_pixel_ratio, whitelist.min_device_pixel_ratio) {
        violations.push(DEVICE_PIXEL_RATIO_TOO_LOW.to_string());
    }
    if below(snapshot.hardware_concurrency, whitelist.min_hardware_concurrency) {
        violations.push(HARDWARE_CONCURRENCY_TOO_LOW.to_string());
    }
    if let Some(expected) = whitelist.cookies_enabled {
        if snapshot.cookies_enabled != Some(expected) {
            violations.push(COOKIES_ENABLED_MISMATCH.to_string());
        }
    }
    if below(snapshot.local_storage_keys, whitelist.min_local_storage_keys) {
        violations.push(LOCAL_STORAGE_KEYS_TOO_LOW.to_string());
    }
    if below(snapshot.session_storage_keys, whitelist.min_session_storage_keys) {
        violations.push(SESSION_STORAGE_KEYS_TOO_LOW.to_string());
    }

    let has_font = |name: &String| snapshot.fonts.iter().any(|f| eq_ci(f, name));
    if let Some(required) = &whitelist.fonts_required_any {
        if !required.is_empty() && !required.iter().any(has_font) {
            violations.push(FONT_REQUIRED_MISSING.to_string());
        }
    }
    if let Some(forbidden) = &whitelist.fonts_forbidden_any {
        if forbidden.iter().any(has_font) {
            violations.push(FONT_FORBIDDEN_PRESENT.to_string());
        }
    }

    if let Some(rules) = &whitelist.permission_states {
        for (name, allowed) in rules {
            let ok = snapshot
                .permissions
                .get(name)
                .is_some_and(|state| allowed.iter().any(|a| eq_ci(a, state)));
            if !ok {
                violations.push(format!("{}:{}", PERMISSION_STATE_DENIED, name));
            }
        }
    }

    let media = &snapshot.media_devices;
    for (count, min, code) in [
        (media.audio_inputs, whitelist.min_audio_inputs, MEDIA_AUDIO_INPUTS_TOO_LOW),
        (media.audio_outputs, whitelist.min_audio_outputs, MEDIA_AUDIO_OUTPUTS_TOO_LOW),
        (media.video_inputs, whitelist.min_video_inputs, MEDIA_VIDEO_INPUTS_TOO_LOW),
    ] {
        if let Some(min) = min {
            if count.unwrap_or(0) < min {
                violations.push(code.to_string());
            }
        }
    }

    let sensor_supported = |name: &String| snapshot.sensors.get(name).copied().unwrap_or(false);
    if let Some(required) = &whitelist.sensors_required_any {
        if !required.is_empty() && !required.iter().any(sensor_supported) {
            violations.push(SENSOR_REQUIRED_MISSING.to_string());
        }
    }
    if let Some(forbidden) = &whitelist.sensors_forbidden_any {
        if forbidden.iter().any(sensor_supported) {
            violations.push(SENSOR_FORBIDDEN_PRESENT.to_string());
        }
    }

    let total_violations = violations.len();
    ValidationResult {
        violations,
        total_violations,
        degrade_recommended: total_violations > 0 && total_violations <= whitelist.max_violations,
    }
}
