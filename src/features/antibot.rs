use crate::core::error::PacingError;
use crate::core::types::PacingProfile;
use std::sync::Mutex;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Delay range enforced between consecutive automated actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestDelay {
    /// Minimum delay in milliseconds between actions
    pub min_ms: u64,
    /// Maximum delay in milliseconds between actions
    pub max_ms: u64,
}

impl RequestDelay {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        if min_ms > max_ms {
            Self {
                min_ms: max_ms,
                max_ms: min_ms,
            }
        } else {
            Self { min_ms, max_ms }
        }
    }

    /// Random delay within the configured range with jitter
    pub fn random_delay(&self) -> u64 {
        use rand::distr::{Distribution, Uniform};
        if self.max_ms == 0 {
            return 0;
        }
        let mut rng = rand::rng();
        let base_delay = match Uniform::new_inclusive(self.min_ms, self.max_ms) {
            Ok(d) => d.sample(&mut rng),
            Err(_) => self.min_ms,
        };

        // ±20% jitter so gaps never settle into a fixed cadence
        let jitter_range = (base_delay as f64 * 0.2) as i64;
        let jitter = match Uniform::new_inclusive(-jitter_range, jitter_range) {
            Ok(d) => d.sample(&mut rng),
            Err(_) => 0,
        };

        (base_delay as i64 + jitter)
            .clamp(self.min_ms as i64, self.max_ms as i64) as u64
    }

    /// 100ms-500ms
    pub fn aggressive() -> Self {
        Self {
            min_ms: 100,
            max_ms: 500,
        }
    }

    /// 500ms-1500ms
    pub fn normal() -> Self {
        Self {
            min_ms: 500,
            max_ms: 1500,
        }
    }

    /// 1000ms-3000ms
    pub fn conservative() -> Self {
        Self {
            min_ms: 1000,
            max_ms: 3000,
        }
    }

    /// Delay range for a pacing profile; `None` means no interaction at all.
    pub fn for_profile(profile: PacingProfile) -> Option<Self> {
        match profile {
            PacingProfile::Aggressive => Some(Self::aggressive()),
            PacingProfile::Normal => Some(Self::normal()),
            PacingProfile::Conservative => Some(Self::conservative()),
            PacingProfile::Paused => None,
        }
    }
}

/// Spaces consecutive actions by a randomized [`RequestDelay`].
#[derive(Debug)]
pub struct Pacer {
    delay_config: RequestDelay,
    next_allowed: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(delay_config: RequestDelay) -> Self {
        Self {
            delay_config,
            next_allowed: Mutex::new(None),
        }
    }

    pub fn for_profile(profile: PacingProfile) -> Option<Self> {
        RequestDelay::for_profile(profile).map(Self::new)
    }

    pub fn delay_config(&self) -> RequestDelay {
        self.delay_config
    }

    /// Wait until the next action is allowed. Returns the milliseconds waited.
    ///
    /// The slot is reserved before sleeping, so concurrent callers queue up
    /// one delay apart instead of firing together.
    pub async fn wait_turn(&self, cancel: &CancellationToken) -> Result<u64, PacingError> {
        if cancel.is_cancelled() {
            return Err(PacingError::Cancelled);
        }
        let now = Instant::now();
        let delay = Duration::from_millis(self.delay_config.random_delay());
        let start_at = {
            let mut next = self.next_allowed.lock().unwrap_or_else(|p| p.into_inner());
            let start_at = match *next {
                Some(t) if t > now => t,
                _ => now,
            };
            *next = Some(start_at + delay);
            start_at
        };

        let wait = start_at.saturating_duration_since(now);
        if !wait.is_zero() {
            info!("Waiting {}ms before next action (pacing)", wait.as_millis());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PacingError::Cancelled),
                _ = tokio::time::sleep_until(start_at) => {}
            }
        }
        Ok(wait.as_millis() as u64)
    }

    /// Forget the reserved slot; the next action runs immediately.
    pub fn reset(&self) {
        *self.next_allowed.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}
