//! Humanized click decision engine.
//!
//! One click attempt escalates through up to three strategies and stops at
//! the first success:
//!
//! 1. `regular`: scroll into view and issue a direct click.
//! 2. `coordinate`: synthesize a short pointer trajectory to the element
//!    center and click at that point (skipped without a bounding box).
//! 3. `dispatch`: injected event dispatch through the [`InjectionPipeline`],
//!    only when BOTH the interaction policy and the anti-detection policy
//!    permit it.
//!
//! Preflight inspection runs first but is advisory: a not-ready report is
//! attached to the diagnostics and the regular click is still attempted.
//! When the dispatch step is refused by policy, the original regular or
//! coordinate failure is what the caller receives.

use crate::features::injection::InjectionPipeline;
use crate::features::policy::InjectionGate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DISPATCH_OPERATION: &str = "click.dispatchEvent";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn is_empty(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0)
    }
}

/// DOM readiness: disabled / busy state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub disabled: bool,
    pub busy: bool,
}

impl ReadinessReport {
    pub fn is_ready(&self) -> bool {
        !self.disabled && !self.busy
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClickabilityReport {
    pub has_bounding_box: bool,
    pub in_viewport: bool,
    pub pointer_events_enabled: bool,
    pub center_occluded: bool,
}

impl ClickabilityReport {
    pub fn is_clickable(&self) -> bool {
        self.has_bounding_box
            && self.in_viewport
            && self.pointer_events_enabled
            && !self.center_occluded
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PreflightReport {
    pub readiness: Option<ReadinessReport>,
    pub clickability: Option<ClickabilityReport>,
    pub errors: Vec<String>,
}

impl PreflightReport {
    pub fn is_ready(&self) -> bool {
        self.errors.is_empty()
            && self.readiness.as_ref().is_some_and(|r| r.is_ready())
            && self.clickability.as_ref().is_some_and(|c| c.is_clickable())
    }
}

/// Element-level operations the engine needs from the automation driver.
#[async_trait]
pub trait ClickTarget: Send + Sync {
    /// Short label for logs and audit records (selector, role, …).
    fn describe(&self) -> String;
    async fn inspect_readiness(&self) -> anyhow::Result<ReadinessReport>;
    async fn assess_clickability(&self) -> anyhow::Result<ClickabilityReport>;
    async fn scroll_into_view(&self) -> anyhow::Result<()>;
    async fn click(&self) -> anyhow::Result<()>;
    async fn bounding_box(&self) -> anyhow::Result<Option<BoundingBox>>;
    async fn move_pointer(&self, to: Point) -> anyhow::Result<()>;
    async fn click_at(&self, point: Point) -> anyhow::Result<()>;
    /// Synthetic mousedown/mouseup/click sequence on the element.
    async fn dispatch_click(&self) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClickPath {
    Regular,
    Coordinate,
    Dispatch,
}

impl ClickPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClickPath::Regular => "regular",
            ClickPath::Coordinate => "coordinate",
            ClickPath::Dispatch => "dispatch",
        }
    }
}

impl std::fmt::Display for ClickPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClickAttempt {
    pub path: ClickPath,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClickDiagnostics {
    pub target: String,
    pub preflight: PreflightReport,
    pub attempts: Vec<ClickAttempt>,
    /// Why the coordinate path was skipped, if it was.
    pub coordinate_skipped: Option<String>,
    /// Gates that refused the dispatch fallback.
    pub injection_denied_by: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClickOutcome {
    pub path: ClickPath,
    pub diagnostics: ClickDiagnostics,
}

#[derive(Debug, Error)]
pub enum ClickError {
    /// Displays the underlying failure unchanged: the regular/coordinate
    /// error when the fallback is refused, the pipeline's otherwise.
    #[error("{error}")]
    Failed {
        error: anyhow::Error,
        diagnostics: Box<ClickDiagnostics>,
    },

    #[error("click cancelled")]
    Cancelled { diagnostics: Box<ClickDiagnostics> },
}

impl ClickError {
    pub fn diagnostics(&self) -> &ClickDiagnostics {
        match self {
            ClickError::Failed { diagnostics, .. } | ClickError::Cancelled { diagnostics } => {
                diagnostics
            }
        }
    }
}

/// Shape of the synthesized pointer approach.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryConfig {
    pub min_steps: usize,
    pub max_steps: usize,
    /// Max distance of the approach start from the target center.
    pub start_offset_px: f64,
    /// Max perpendicular wobble on intermediate points.
    pub jitter_px: f64,
    pub step_delay_min_ms: u64,
    pub step_delay_max_ms: u64,
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self {
            min_steps: 6,
            max_steps: 12,
            start_offset_px: 120.0,
            jitter_px: 3.0,
            step_delay_min_ms: 8,
            step_delay_max_ms: 24,
        }
    }
}

/// Eased path from `start` to `end` with light jitter; the last point is
/// exactly `end`.
pub fn synthesize_trajectory<R: rand::Rng + ?Sized>(
    start: Point,
    end: Point,
    steps: usize,
    jitter_px: f64,
    rng: &mut R,
) -> Vec<Point> {
    use rand::distr::{Distribution, Uniform};

    let steps = steps.max(2);
    let jitter = Uniform::new_inclusive(-jitter_px.abs(), jitter_px.abs()).ok();
    (1..=steps)
        .map(|i| {
            if i == steps {
                return end;
            }
            let t = i as f64 / steps as f64;
            let eased = t * t * (3.0 - 2.0 * t);
            let (jx, jy) = match &jitter {
                Some(d) => (d.sample(rng), d.sample(rng)),
                None => (0.0, 0.0),
            };
            let damp = 1.0 - t;
            Point::new(
                start.x + (end.x - start.x) * eased + jx * damp,
                start.y + (end.y - start.y) * eased + jy * damp,
            )
        })
        .collect()
}

struct PlannedApproach {
    points: Vec<Point>,
    delays_ms: Vec<u64>,
}

pub struct ClickDecisionEngine {
    injection: Arc<dyn InjectionPipeline>,
    trajectory: TrajectoryConfig,
}

impl ClickDecisionEngine {
    pub fn new(injection: Arc<dyn InjectionPipeline>) -> Self {
        Self {
            injection,
            trajectory: TrajectoryConfig::default(),
        }
    }

    pub fn with_trajectory(mut self, trajectory: TrajectoryConfig) -> Self {
        self.trajectory = trajectory;
        self
    }

    fn plan_approach(&self, center: Point) -> PlannedApproach {
        use rand::distr::{Distribution, Uniform};

        let cfg = &self.trajectory;
        let mut rng = rand::rng();
        let lo = cfg.min_steps.max(2);
        let hi = cfg.max_steps.max(lo);
        let steps = Uniform::new_inclusive(lo, hi)
            .map(|d| d.sample(&mut rng))
            .unwrap_or(lo);
        let offset = cfg.start_offset_px.abs();
        let (dx, dy) = match Uniform::new_inclusive(-offset, offset) {
            Ok(d) => (d.sample(&mut rng), d.sample(&mut rng)),
            Err(_) => (0.0, 0.0),
        };
        let start = Point::new((center.x + dx).max(0.0), (center.y + dy).max(0.0));
        let points = synthesize_trajectory(start, center, steps, cfg.jitter_px, &mut rng);

        let delay_lo = cfg.step_delay_min_ms.min(cfg.step_delay_max_ms);
        let delay_hi = cfg.step_delay_max_ms.max(delay_lo);
        let delay_dist = Uniform::new_inclusive(delay_lo, delay_hi).ok();
        let delays_ms = points
            .iter()
            .map(|_| delay_dist.as_ref().map(|d| d.sample(&mut rng)).unwrap_or(0))
            .collect();
        PlannedApproach { points, delays_ms }
    }

    async fn preflight(&self, target: &dyn ClickTarget) -> PreflightReport {
        let mut report = PreflightReport::default();
        match target.inspect_readiness().await {
            Ok(r) => report.readiness = Some(r),
            Err(e) => report.errors.push(format!("readiness: {}", e)),
        }
        match target.assess_clickability().await {
            Ok(c) => report.clickability = Some(c),
            Err(e) => report.errors.push(format!("clickability: {}", e)),
        }
        report
    }

    async fn regular_click(&self, target: &dyn ClickTarget) -> anyhow::Result<()> {
        target.scroll_into_view().await?;
        target.click().await
    }

    async fn coordinate_click(
        &self,
        target: &dyn ClickTarget,
        center: Point,
        cancel: &CancellationToken,
    ) -> Result<anyhow::Result<()>, ()> {
        let approach = self.plan_approach(center);
        for (point, delay_ms) in approach.points.iter().zip(approach.delays_ms) {
            if cancel.is_cancelled() {
                return Err(());
            }
            if let Err(e) = target.move_pointer(*point).await {
                return Ok(Err(e));
            }
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }
        Ok(target.click_at(center).await)
    }

    /// Run one escalating click attempt. No internal retries.
    pub async fn click(
        &self,
        target: &dyn ClickTarget,
        interaction: &dyn InjectionGate,
        anti_detection: &dyn InjectionGate,
        cancel: &CancellationToken,
    ) -> Result<ClickOutcome, ClickError> {
        let mut diagnostics = ClickDiagnostics {
            target: target.describe(),
            ..Default::default()
        };

        diagnostics.preflight = self.preflight(target).await;
        if !diagnostics.preflight.is_ready() {
            warn!(
                "click: preflight not ready for {} ({:?}), attempting anyway",
                diagnostics.target, diagnostics.preflight
            );
        }
        if cancel.is_cancelled() {
            return Err(ClickError::Cancelled {
                diagnostics: Box::new(diagnostics),
            });
        }

        // 1) Regular
        let mut last_error = match self.regular_click(target).await {
            Ok(()) => {
                diagnostics.attempts.push(ClickAttempt {
                    path: ClickPath::Regular,
                    error: None,
                });
                info!("click: {} succeeded via regular path", diagnostics.target);
                return Ok(ClickOutcome {
                    path: ClickPath::Regular,
                    diagnostics,
                });
            }
            Err(e) => {
                warn!("click: regular path failed for {}: {}", diagnostics.target, e);
                diagnostics.attempts.push(ClickAttempt {
                    path: ClickPath::Regular,
                    error: Some(e.to_string()),
                });
                e
            }
        };

        // 2) Coordinate
        let center = match target.bounding_box().await {
            Ok(Some(bbox)) if !bbox.is_empty() => Some(bbox.center()),
            Ok(_) => {
                diagnostics.coordinate_skipped = Some("no bounding box".to_string());
                None
            }
            Err(e) => {
                diagnostics.coordinate_skipped = Some(format!("bounding box unavailable: {}", e));
                None
            }
        };
        if let Some(center) = center {
            match self.coordinate_click(target, center, cancel).await {
                Err(()) => {
                    return Err(ClickError::Cancelled {
                        diagnostics: Box::new(diagnostics),
                    })
                }
                Ok(Ok(())) => {
                    diagnostics.attempts.push(ClickAttempt {
                        path: ClickPath::Coordinate,
                        error: None,
                    });
                    info!("click: {} succeeded via coordinate path", diagnostics.target);
                    return Ok(ClickOutcome {
                        path: ClickPath::Coordinate,
                        diagnostics,
                    });
                }
                Ok(Err(e)) => {
                    warn!(
                        "click: coordinate path failed for {}: {}",
                        diagnostics.target, e
                    );
                    diagnostics.attempts.push(ClickAttempt {
                        path: ClickPath::Coordinate,
                        error: Some(e.to_string()),
                    });
                    last_error = e;
                }
            }
        }

        // 3) Dispatch: both gates must agree.
        for gate in [interaction, anti_detection] {
            if !gate.permits_injection() {
                diagnostics.injection_denied_by.push(gate.gate_name());
            }
        }
        if !diagnostics.injection_denied_by.is_empty() {
            warn!(
                "click: dispatch fallback refused for {} by {:?}",
                diagnostics.target, diagnostics.injection_denied_by
            );
            return Err(ClickError::Failed {
                error: last_error,
                diagnostics: Box::new(diagnostics),
            });
        }
        if cancel.is_cancelled() {
            return Err(ClickError::Cancelled {
                diagnostics: Box::new(diagnostics),
            });
        }

        match self
            .injection
            .dispatch(DISPATCH_OPERATION, target, cancel)
            .await
        {
            Ok(true) => {
                diagnostics.attempts.push(ClickAttempt {
                    path: ClickPath::Dispatch,
                    error: None,
                });
                info!("click: {} succeeded via dispatch path", diagnostics.target);
                Ok(ClickOutcome {
                    path: ClickPath::Dispatch,
                    diagnostics,
                })
            }
            Ok(false) => {
                diagnostics.attempts.push(ClickAttempt {
                    path: ClickPath::Dispatch,
                    error: Some("dispatched event was not accepted".to_string()),
                });
                Err(ClickError::Failed {
                    error: last_error,
                    diagnostics: Box::new(diagnostics),
                })
            }
            Err(e) => {
                diagnostics.attempts.push(ClickAttempt {
                    path: ClickPath::Dispatch,
                    error: Some(e.to_string()),
                });
                if cancel.is_cancelled() {
                    return Err(ClickError::Cancelled {
                        diagnostics: Box::new(diagnostics),
                    });
                }
                Err(ClickError::Failed {
                    error: e,
                    diagnostics: Box::new(diagnostics),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trajectory_ends_on_target() {
        let mut rng = rand::rng();
        let start = Point::new(10.0, 10.0);
        let end = Point::new(300.0, 200.0);
        let path = synthesize_trajectory(start, end, 8, 3.0, &mut rng);
        assert_eq!(path.len(), 8);
        assert_eq!(*path.last().unwrap(), end);
    }

    #[test]
    fn trajectory_without_jitter_is_monotonic() {
        let mut rng = rand::rng();
        let path = synthesize_trajectory(
            Point::new(0.0, 0.0),
            Point::new(100.0, 50.0),
            10,
            0.0,
            &mut rng,
        );
        for pair in path.windows(2) {
            assert!(pair[1].x >= pair[0].x);
            assert!(pair[1].y >= pair[0].y);
        }
    }

    #[test]
    fn trajectory_has_at_least_two_points() {
        let mut rng = rand::rng();
        let path = synthesize_trajectory(
            Point::new(0.0, 0.0),
            Point::new(5.0, 5.0),
            0,
            1.0,
            &mut rng,
        );
        assert_eq!(path.len(), 2);
    }

    #[test]
    fn bbox_center_and_emptiness() {
        let bbox = BoundingBox {
            x: 10.0,
            y: 20.0,
            width: 100.0,
            height: 40.0,
        };
        assert_eq!(bbox.center(), Point::new(60.0, 40.0));
        assert!(!bbox.is_empty());
        assert!(BoundingBox {
            width: 0.0,
            ..bbox
        }
        .is_empty());
    }

    #[test]
    fn preflight_requires_both_reports() {
        let mut report = PreflightReport {
            readiness: Some(ReadinessReport::default()),
            clickability: None,
            errors: vec![],
        };
        assert!(!report.is_ready());
        report.clickability = Some(ClickabilityReport {
            has_bounding_box: true,
            in_viewport: true,
            pointer_events_enabled: true,
            center_occluded: false,
        });
        assert!(report.is_ready());
    }
}
