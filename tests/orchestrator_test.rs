use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pacewarden::core::clock::ManualClock;
use pacewarden::core::config::{AntiDetectionConfig, PacingConfig};
use pacewarden::features::policy::InjectionGate;
use pacewarden::storage::context_key;
use pacewarden::{
    AdjustmentManifest, ContextState, DocumentStore, MemoryStore, Orchestrator, PacingError,
    PacingProfile, Signal, SignalCollector, StoreError,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn t0() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_760_000_000, 0).unwrap()
}

struct Harness {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    orchestrator: Orchestrator,
}

fn harness(config: PacingConfig) -> Harness {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let orchestrator = Orchestrator::new(config, store.clone()).with_clock(clock.clone());
    Harness {
        store,
        clock,
        orchestrator,
    }
}

fn clean(ctx: &str, secs: i64) -> Signal {
    Signal::new(ctx, "comment", t0() + Duration::seconds(secs)).with_counts(100, 0, 0, 0)
}

#[tokio::test]
async fn window_keeps_newest_signals_only() {
    let h = harness(PacingConfig {
        sliding_window: 3,
        ..Default::default()
    });
    for secs in 0..5 {
        h.orchestrator.record(clean("acct-1", secs)).await.unwrap();
    }
    let state = h.orchestrator.get_state("acct-1").await.unwrap().unwrap();
    assert_eq!(state.signals.len(), 3);
    let times: Vec<_> = state.signals.iter().map(|s| s.observed_at).collect();
    assert_eq!(
        times,
        vec![
            t0() + Duration::seconds(2),
            t0() + Duration::seconds(3),
            t0() + Duration::seconds(4)
        ]
    );
}

#[tokio::test]
async fn out_of_order_signal_is_placed_by_observation_time() {
    let h = harness(PacingConfig::default());
    h.orchestrator.record(clean("acct-1", 20)).await.unwrap();
    h.orchestrator.record(clean("acct-1", 5)).await.unwrap();
    let state = h.orchestrator.get_state("acct-1").await.unwrap().unwrap();
    assert_eq!(state.signals[0].observed_at, t0() + Duration::seconds(5));
    assert_eq!(state.signals[1].observed_at, t0() + Duration::seconds(20));
}

#[tokio::test]
async fn identical_decisions_inside_interval_are_not_persisted() {
    let h = harness(PacingConfig::default());

    let first = h.orchestrator.record(clean("acct-1", 0)).await.unwrap();
    assert_eq!(first.pacing_profile, PacingProfile::Normal);

    h.clock.advance(Duration::seconds(10));
    let second = h.orchestrator.record(clean("acct-1", 10)).await.unwrap();
    assert!(!first.differs_materially(&second));

    let state = h.orchestrator.get_state("acct-1").await.unwrap().unwrap();
    assert_eq!(state.history.len(), 1);
    assert_eq!(state.last_adjustment.as_ref(), Some(&first));
    assert_eq!(state.last_adjustment_at, Some(t0()));
    assert_eq!(state.signals.len(), 2);

    // Past the minimum interval the same decision is re-issued.
    h.clock.advance(Duration::seconds(300));
    h.orchestrator.record(clean("acct-1", 20)).await.unwrap();
    let state = h.orchestrator.get_state("acct-1").await.unwrap().unwrap();
    assert_eq!(state.history.len(), 2);
}

#[tokio::test]
async fn history_and_manifest_are_capped_newest_first() {
    let h = harness(PacingConfig {
        history_depth: 2,
        ..Default::default()
    });
    for i in 0..4 {
        h.orchestrator.record(clean("acct-1", i)).await.unwrap();
        h.clock.advance(Duration::seconds(301));
    }

    let state = h.orchestrator.get_state("acct-1").await.unwrap().unwrap();
    assert_eq!(state.history.len(), 2);

    let recent = h
        .orchestrator
        .get_recent_adjustments("acct-1", 10)
        .await
        .unwrap();
    assert_eq!(recent.len(), 2);
    assert!(recent[0].issued_at > recent[1].issued_at);
    assert_eq!(recent[0].issued_at, t0() + Duration::seconds(3 * 301));

    let one = h
        .orchestrator
        .get_recent_adjustments("acct-1", 1)
        .await
        .unwrap();
    assert_eq!(one, recent[..1].to_vec());

    let manifest: AdjustmentManifest = h
        .orchestrator
        .get_manifest("acct-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(manifest.entries.len(), 2);
    assert_eq!(manifest.latest, recent[0]);
    assert_eq!(manifest.entries[0].issued_at, recent[0].issued_at);
}

#[tokio::test]
async fn high_403_rate_escalates_to_conservative() {
    let h = harness(PacingConfig::default());
    let signal = Signal::new("acct-1", "comment", t0())
        .with_counts(100, 0, 5, 0)
        .with_tag("note-detail");
    let adj = h.orchestrator.record(signal).await.unwrap();

    assert_eq!(adj.pacing_profile, PacingProfile::Conservative);
    assert!(adj.reason.contains("0.050"), "reason: {}", adj.reason);
    assert!(adj.rotate_fingerprint);
    assert!(adj.refresh_cookies);
    assert!(adj.enable_navigator_patch);
    assert!(!adj.pause_interactions);
    assert!(adj.tags.contains("note-detail"));
    assert_eq!(adj.issued_at, t0());

    let state = h.orchestrator.get_state("acct-1").await.unwrap().unwrap();
    assert_eq!(state.current_pacing, PacingProfile::Conservative);
}

#[tokio::test]
async fn conservative_recovers_once_window_is_diluted() {
    let h = harness(PacingConfig::default());
    h.orchestrator
        .record(Signal::new("acct-1", "comment", t0()).with_counts(100, 0, 5, 0))
        .await
        .unwrap();
    h.clock.advance(Duration::seconds(30));
    let adj = h
        .orchestrator
        .record(
            Signal::new("acct-1", "comment", t0() + Duration::seconds(30))
                .with_counts(1000, 0, 0, 0),
        )
        .await
        .unwrap();
    assert_eq!(adj.pacing_profile, PacingProfile::Normal);
    assert!(adj.reason.starts_with("recovered"), "reason: {}", adj.reason);

    let history = h
        .orchestrator
        .get_recent_adjustments("acct-1", 12)
        .await
        .unwrap();
    let profiles: Vec<_> = history.iter().map(|a| a.pacing_profile).collect();
    assert_eq!(
        profiles,
        vec![PacingProfile::Normal, PacingProfile::Conservative]
    );
}

#[tokio::test]
async fn severe_captcha_rate_pauses_and_blocks_injection() {
    let h = harness(PacingConfig::default());
    let orchestrator = h.orchestrator.with_anti_detection(AntiDetectionConfig {
        allow_ui_injection_fallback: true,
    });

    let before = orchestrator.anti_detection_policy("acct-1").await.unwrap();
    assert!(before.permits_injection());

    let adj = orchestrator
        .record(Signal::new("acct-1", "comment", t0()).with_counts(100, 0, 0, 8))
        .await
        .unwrap();
    assert_eq!(adj.pacing_profile, PacingProfile::Paused);
    assert!(adj.pause_interactions);
    assert!(adj.reason.contains("pause for review"));

    let after = orchestrator.anti_detection_policy("acct-1").await.unwrap();
    assert_eq!(after.pacing_profile, PacingProfile::Paused);
    assert!(!after.permits_injection());
    assert!(after.refresh_cookies);
}

#[tokio::test]
async fn paused_context_steps_back_through_conservative() {
    let h = harness(PacingConfig::default());
    h.orchestrator
        .record(Signal::new("acct-1", "comment", t0()).with_counts(100, 0, 0, 8))
        .await
        .unwrap();

    h.clock.advance(Duration::seconds(60));
    let adj = h
        .orchestrator
        .record(
            Signal::new("acct-1", "comment", t0() + Duration::seconds(60))
                .with_counts(10_000, 0, 0, 0),
        )
        .await
        .unwrap();
    assert_eq!(adj.pacing_profile, PacingProfile::Conservative);
    assert!(!adj.pause_interactions);
}

#[tokio::test]
async fn empty_context_id_is_rejected_without_side_effects() {
    let h = harness(PacingConfig::default());
    let err = h
        .orchestrator
        .record(Signal::new("   ", "comment", t0()).with_counts(10, 0, 0, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, PacingError::Validation(_)));
    assert!(h.store.keys_with_prefix("").await.is_empty());

    assert!(matches!(
        h.orchestrator.get_state("").await,
        Err(PacingError::Validation(_))
    ));
}

#[tokio::test]
async fn persisted_adjustment_writes_document_manifest_and_state() {
    let h = harness(PacingConfig::default());
    h.orchestrator.record(clean("acct/1", 0)).await.unwrap();

    let ctx = context_key("acct/1");
    let keys = h.store.keys_with_prefix("").await;
    assert!(keys.contains(&format!("state/{}", ctx)));
    assert!(keys.contains(&format!("adjustments/{}/manifest", ctx)));

    let manifest = h
        .orchestrator
        .get_manifest("acct/1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(manifest.entries.len(), 1);
    assert!(keys.contains(&manifest.entries[0].file));
    assert!(manifest.entries[0].file.ends_with("20251009T085320.000Z"));
}

#[tokio::test]
async fn unknown_context_reads_are_empty() {
    let h = harness(PacingConfig::default());
    assert!(h.orchestrator.get_state("nobody").await.unwrap().is_none());
    assert!(h
        .orchestrator
        .get_recent_adjustments("nobody", 5)
        .await
        .unwrap()
        .is_empty());
    let policy = h.orchestrator.anti_detection_policy("nobody").await.unwrap();
    assert_eq!(policy.pacing_profile, PacingProfile::Normal);
    assert!(!policy.permits_injection());
}

#[tokio::test]
async fn cancelled_record_leaves_no_state() {
    let h = harness(PacingConfig::default());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h
        .orchestrator
        .record_cancellable(clean("acct-1", 0), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PacingError::Cancelled));
    let state: Option<ContextState> = h.orchestrator.get_state("acct-1").await.unwrap();
    assert!(state.is_none());
}

#[tokio::test]
async fn human_like_score_is_smoothed_across_records() {
    let h = harness(PacingConfig::default());
    let mut s = clean("acct-1", 0);
    s.human_like_score = 0.0;
    h.orchestrator.record(s).await.unwrap();
    let state = h.orchestrator.get_state("acct-1").await.unwrap().unwrap();
    assert!((state.smoothed_human_like_score - 0.8).abs() < 1e-9);
}

#[tokio::test]
async fn non_finite_floats_do_not_poison_the_window() {
    let h = harness(PacingConfig::default());
    let mut collector = SignalCollector::new("acct-1", "comment");
    collector.observe_response(200, 120.0);
    collector.metric("ratio", f64::INFINITY);
    let mut s = collector.finish(t0());
    assert!(s.metrics.is_empty());
    s.metrics.insert("ratio".into(), f64::INFINITY);
    s.p95_latency_ms = f64::NAN;
    s.human_like_score = f64::NAN;
    h.orchestrator.record(s).await.unwrap();

    let adj = h.orchestrator.record(clean("acct-1", 10)).await.unwrap();
    assert_eq!(adj.pacing_profile, PacingProfile::Normal);

    let state = h.orchestrator.get_state("acct-1").await.unwrap().unwrap();
    assert_eq!(state.signals.len(), 2);
    assert!(state.signals[0].metrics.is_empty());
    assert_eq!(state.signals[0].human_like_score, 1.0);
    assert_eq!(state.smoothed_human_like_score, 1.0);
}

#[tokio::test]
async fn oversized_counters_keep_the_context_usable() {
    let h = harness(PacingConfig::default());
    h.orchestrator
        .record(Signal::new("acct-1", "comment", t0()).with_counts(u64::MAX, 0, 0, 0))
        .await
        .unwrap();
    let adj = h
        .orchestrator
        .record(
            Signal::new("acct-1", "comment", t0() + Duration::seconds(1))
                .with_counts(1, 0, 0, 0),
        )
        .await
        .unwrap();
    assert_eq!(adj.pacing_profile, PacingProfile::Normal);
    let state = h.orchestrator.get_state("acct-1").await.unwrap().unwrap();
    assert_eq!(state.signals.len(), 2);
}

/// Memory store whose state writes can be switched to fail.
#[derive(Default)]
struct FlakyStateStore {
    inner: MemoryStore,
    fail_state_writes: AtomicBool,
}

#[async_trait]
impl DocumentStore for FlakyStateStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, document: &Value) -> Result<(), StoreError> {
        if key.starts_with("state/") && self.fail_state_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io {
                path: key.to_string(),
                source: std::io::Error::other("disk full"),
            });
        }
        self.inner.put(key, document).await
    }
}

#[tokio::test]
async fn failed_state_write_surfaces_and_retry_uses_last_saved_window() {
    init_logger();
    let store = Arc::new(FlakyStateStore::default());
    let clock = Arc::new(ManualClock::new(t0()));
    let orch = Orchestrator::new(PacingConfig::default(), store.clone()).with_clock(clock);

    orch.record(clean("acct-1", 0)).await.unwrap();

    store.fail_state_writes.store(true, Ordering::SeqCst);
    let hostile = Signal::new("acct-1", "comment", t0() + Duration::seconds(5))
        .with_counts(100, 0, 5, 0);
    let err = orch.record(hostile).await.unwrap_err();
    assert!(
        matches!(err, PacingError::Persistence(StoreError::Io { .. })),
        "{}",
        err
    );

    let state = orch.get_state("acct-1").await.unwrap().unwrap();
    assert_eq!(state.signals.len(), 1);
    assert_eq!(state.current_pacing, PacingProfile::Normal);

    store.fail_state_writes.store(false, Ordering::SeqCst);
    let adj = orch.record(clean("acct-1", 10)).await.unwrap();
    assert_eq!(adj.pacing_profile, PacingProfile::Normal);
    let state = orch.get_state("acct-1").await.unwrap().unwrap();
    assert_eq!(state.signals.len(), 2);
    assert_eq!(state.history.len(), 1);
    let totals: u64 = state.signals.iter().map(|s| s.total_interactions).sum();
    assert_eq!(totals, 200);
}
