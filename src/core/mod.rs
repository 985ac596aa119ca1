pub mod app_state;
pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use app_state::AppState;
pub use error::PacingError;
