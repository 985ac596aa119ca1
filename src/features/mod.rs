pub mod antibot;
pub mod baseline;
pub mod click_engine;
pub mod injection;
pub mod orchestrator;
pub mod policy;
pub mod signal_collector;
