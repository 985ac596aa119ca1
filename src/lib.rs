pub mod browser;
pub mod core;
pub mod features;
pub mod storage;

// --- Primary core exports ---
pub use core::types;
pub use core::types::*;
pub use core::{AppState, PacingError};

pub use features::baseline::{validate, EnvironmentSnapshot, ValidationResult, Whitelist};
pub use features::click_engine::{
    ClickDecisionEngine, ClickError, ClickOutcome, ClickPath, ClickTarget,
};
pub use features::injection::{InjectionPipeline, RateLimitedInjectionPipeline};
pub use features::orchestrator::Orchestrator;
pub use features::policy::{AntiDetectionPolicy, InjectionGate, InteractionPolicy};
pub use features::signal_collector::SignalCollector;
pub use storage::{DocumentStore, JsonFileStore, MemoryStore, StoreError};
