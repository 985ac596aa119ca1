use crate::core::error::PacingError;
use crate::features::policy::InteractionPolicy;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// File config: pacewarden.json with env-var fallback
// ---------------------------------------------------------------------------

pub const ENV_CONFIG_PATH: &str = "PACEWARDEN_CONFIG";
pub const ENV_SLIDING_WINDOW: &str = "PACEWARDEN_SLIDING_WINDOW";
pub const ENV_HISTORY_DEPTH: &str = "PACEWARDEN_HISTORY_DEPTH";
pub const ENV_MIN_ADJUSTMENT_INTERVAL_SECS: &str = "PACEWARDEN_MIN_ADJUSTMENT_INTERVAL_SECS";
pub const ENV_STORAGE_ROOT: &str = "PACEWARDEN_STORAGE_ROOT";
pub const ENV_ALLOW_UI_INJECTION_FALLBACK: &str = "PACEWARDEN_ALLOW_UI_INJECTION_FALLBACK";

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    let v = std::env::var(key).ok()?;
    let v = v.trim().to_ascii_lowercase();
    if matches!(v.as_str(), "1" | "true" | "yes" | "on") {
        Some(true)
    } else if matches!(v.as_str(), "0" | "false" | "no" | "off" | "disabled") {
        Some(false)
    } else {
        None
    }
}

/// Orchestrator sub-config (mirrors the `pacing` key in pacewarden.json).
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct PacingFileConfig {
    /// Signals kept in the sliding window. Minimum 3, default 24.
    pub sliding_window: Option<usize>,
    /// Persisted adjustments kept per context. Minimum 1, default 12.
    pub history_depth: Option<usize>,
    pub http_429_high: Option<f64>,
    pub http_403_high: Option<f64>,
    pub captcha_high: Option<f64>,
    pub http_429_recover: Option<f64>,
    pub http_403_recover: Option<f64>,
    /// Clean signals required before stepping up to Aggressive.
    pub aggressive_window_requirement: Option<usize>,
    pub minimum_adjustment_interval_secs: Option<u64>,
    pub adjustments_prefix: Option<String>,
    pub state_prefix: Option<String>,
}

impl PacingFileConfig {
    /// File value → env var → default, then range-checked.
    pub fn resolve(&self) -> Result<PacingConfig, PacingError> {
        let d = PacingConfig::default();
        let cfg = PacingConfig {
            sliding_window: self
                .sliding_window
                .or_else(|| env_parse(ENV_SLIDING_WINDOW))
                .unwrap_or(d.sliding_window),
            history_depth: self
                .history_depth
                .or_else(|| env_parse(ENV_HISTORY_DEPTH))
                .unwrap_or(d.history_depth),
            http_429_high: self.http_429_high.unwrap_or(d.http_429_high),
            http_403_high: self.http_403_high.unwrap_or(d.http_403_high),
            captcha_high: self.captcha_high.unwrap_or(d.captcha_high),
            http_429_recover: self.http_429_recover.unwrap_or(d.http_429_recover),
            http_403_recover: self.http_403_recover.unwrap_or(d.http_403_recover),
            aggressive_window_requirement: self
                .aggressive_window_requirement
                .unwrap_or(d.aggressive_window_requirement),
            minimum_adjustment_interval_secs: self
                .minimum_adjustment_interval_secs
                .or_else(|| env_parse(ENV_MIN_ADJUSTMENT_INTERVAL_SECS))
                .unwrap_or(d.minimum_adjustment_interval_secs),
            adjustments_prefix: non_blank(&self.adjustments_prefix)
                .unwrap_or(d.adjustments_prefix),
            state_prefix: non_blank(&self.state_prefix).unwrap_or(d.state_prefix),
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

fn non_blank(v: &Option<String>) -> Option<String> {
    v.as_ref()
        .map(|s| s.trim().trim_matches('/').to_string())
        .filter(|s| !s.is_empty())
}

/// Resolved orchestrator configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct PacingConfig {
    pub sliding_window: usize,
    pub history_depth: usize,
    pub http_429_high: f64,
    pub http_403_high: f64,
    pub captcha_high: f64,
    pub http_429_recover: f64,
    pub http_403_recover: f64,
    pub aggressive_window_requirement: usize,
    pub minimum_adjustment_interval_secs: u64,
    pub adjustments_prefix: String,
    pub state_prefix: String,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            sliding_window: 24,
            history_depth: 12,
            http_429_high: 0.05,
            http_403_high: 0.03,
            captcha_high: 0.02,
            http_429_recover: 0.01,
            http_403_recover: 0.005,
            aggressive_window_requirement: 6,
            minimum_adjustment_interval_secs: 300,
            adjustments_prefix: "adjustments".to_string(),
            state_prefix: "state".to_string(),
        }
    }
}

impl PacingConfig {
    pub fn minimum_adjustment_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.minimum_adjustment_interval_secs.min(i64::MAX as u64) as i64)
    }

    pub fn validate(&self) -> Result<(), PacingError> {
        if self.sliding_window < 3 {
            return Err(PacingError::validation(format!(
                "sliding_window must be >= 3 (got {})",
                self.sliding_window
            )));
        }
        if self.history_depth < 1 {
            return Err(PacingError::validation("history_depth must be >= 1"));
        }
        if self.aggressive_window_requirement > self.sliding_window {
            return Err(PacingError::validation(format!(
                "aggressive_window_requirement ({}) cannot exceed sliding_window ({})",
                self.aggressive_window_requirement, self.sliding_window
            )));
        }
        for (name, v) in [
            ("http_429_high", self.http_429_high),
            ("http_403_high", self.http_403_high),
            ("captcha_high", self.captcha_high),
            ("http_429_recover", self.http_429_recover),
            ("http_403_recover", self.http_403_recover),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(PacingError::validation(format!(
                    "{} must be within [0, 1] (got {})",
                    name, v
                )));
            }
        }
        Ok(())
    }
}

/// Static half of the anti-detection policy (mirrors `anti_detection`).
#[derive(serde::Deserialize, serde::Serialize, Default, Clone, Debug, PartialEq)]
pub struct AntiDetectionConfig {
    /// Operator switch for the last-resort injected event dispatch.
    #[serde(default)]
    pub allow_ui_injection_fallback: bool,
}

/// Injection pipeline rate limit (mirrors `injection`).
#[derive(serde::Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct InjectionConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub audit_capacity: usize,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 400,
            max_delay_ms: 1200,
            audit_capacity: 64,
        }
    }
}

#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct StorageFileConfig {
    pub root: Option<String>,
}

impl StorageFileConfig {
    /// Storage root: JSON field → `PACEWARDEN_STORAGE_ROOT` → `~/.pacewarden`.
    pub fn resolve_root(&self) -> PathBuf {
        if let Some(r) = &self.root {
            if !r.trim().is_empty() {
                return PathBuf::from(r.trim());
            }
        }
        if let Ok(r) = std::env::var(ENV_STORAGE_ROOT) {
            if !r.trim().is_empty() {
                return PathBuf::from(r.trim());
            }
        }
        dirs::home_dir()
            .map(|h| h.join(".pacewarden"))
            .unwrap_or_else(|| PathBuf::from(".pacewarden"))
    }
}

/// Top-level config loaded from `pacewarden.json`.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct PacewardenFileConfig {
    #[serde(default)]
    pub pacing: PacingFileConfig,
    #[serde(default)]
    pub anti_detection: Option<AntiDetectionConfig>,
    #[serde(default)]
    pub interaction: InteractionPolicy,
    #[serde(default)]
    pub injection: InjectionConfig,
    #[serde(default)]
    pub storage: StorageFileConfig,
}

/// Fully resolved runtime configuration.
#[derive(Clone, Debug)]
pub struct PacewardenConfig {
    pub pacing: PacingConfig,
    pub anti_detection: AntiDetectionConfig,
    pub interaction: InteractionPolicy,
    pub injection: InjectionConfig,
    pub storage_root: PathBuf,
}

impl PacewardenConfig {
    pub fn resolve(file: &PacewardenFileConfig) -> Result<Self, PacingError> {
        let pacing = file.pacing.resolve()?;
        let anti_detection = match &file.anti_detection {
            Some(a) => a.clone(),
            None => AntiDetectionConfig {
                allow_ui_injection_fallback: env_flag(ENV_ALLOW_UI_INJECTION_FALLBACK)
                    .unwrap_or(false),
            },
        };
        let mut injection = file.injection.clone();
        if injection.min_delay_ms > injection.max_delay_ms {
            std::mem::swap(&mut injection.min_delay_ms, &mut injection.max_delay_ms);
        }
        Ok(Self {
            pacing,
            anti_detection,
            interaction: file.interaction.clone(),
            injection,
            storage_root: file.storage.resolve_root(),
        })
    }
}

/// Load `pacewarden.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `PACEWARDEN_CONFIG` env var path
/// 2. `./pacewarden.json`
/// 3. `../pacewarden.json`
///
/// Missing file → defaults (env-var fallbacks apply).
/// Parse error → warning, defaults.
pub fn load_file_config() -> PacewardenFileConfig {
    let mut candidates = vec![
        PathBuf::from("pacewarden.json"),
        PathBuf::from("../pacewarden.json"),
    ];
    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        candidates.insert(0, PathBuf::from(env_path));
    }

    for path in &candidates {
        let Ok(contents) = std::fs::read_to_string(path) else {
            continue;
        };
        match serde_json::from_str::<PacewardenFileConfig>(&contents) {
            Ok(cfg) => {
                tracing::info!("pacewarden.json loaded from {}", path.display());
                return cfg;
            }
            Err(e) => {
                tracing::warn!(
                    "pacewarden.json parse error at {}: {}, using defaults",
                    path.display(),
                    e
                );
                return PacewardenFileConfig::default();
            }
        }
    }

    PacewardenFileConfig::default()
}

pub fn load_config() -> Result<PacewardenConfig, PacingError> {
    PacewardenConfig::resolve(&load_file_config())
}
