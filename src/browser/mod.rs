//! chromiumoxide adapters for the click engine and baseline validator.

pub mod cdp_target;
pub mod snapshot_probe;

pub use cdp_target::CdpClickTarget;
pub use snapshot_probe::{capture_snapshot, parse_probe_payload};
