//! Rate-limited, audited pipeline for last-resort synthetic event dispatch.

use crate::features::antibot::{Pacer, RequestDelay};
use crate::features::click_engine::ClickTarget;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[async_trait]
pub trait InjectionPipeline: Send + Sync {
    /// Run one labelled injection against `target`. `Ok(true)` means the
    /// dispatched event was accepted by the page.
    async fn dispatch(
        &self,
        operation: &str,
        target: &dyn ClickTarget,
        cancel: &CancellationToken,
    ) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InjectionAuditRecord {
    pub operation: String,
    pub target: String,
    pub at: DateTime<Utc>,
    pub waited_ms: u64,
    pub accepted: bool,
    pub error: Option<String>,
}

/// Default pipeline: paces dispatches and keeps a bounded audit trail.
#[derive(Debug)]
pub struct RateLimitedInjectionPipeline {
    pacer: Pacer,
    audit: Mutex<VecDeque<InjectionAuditRecord>>,
    audit_capacity: usize,
}

impl RateLimitedInjectionPipeline {
    pub fn new(delay: RequestDelay, audit_capacity: usize) -> Self {
        Self {
            pacer: Pacer::new(delay),
            audit: Mutex::new(VecDeque::with_capacity(audit_capacity.min(1024))),
            audit_capacity: audit_capacity.max(1),
        }
    }

    /// Newest first.
    pub fn audit_trail(&self) -> Vec<InjectionAuditRecord> {
        let audit = self.audit.lock().unwrap_or_else(|p| p.into_inner());
        audit.iter().rev().cloned().collect()
    }

    fn push_audit(&self, record: InjectionAuditRecord) {
        let mut audit = self.audit.lock().unwrap_or_else(|p| p.into_inner());
        audit.push_back(record);
        while audit.len() > self.audit_capacity {
            audit.pop_front();
        }
    }
}

#[async_trait]
impl InjectionPipeline for RateLimitedInjectionPipeline {
    async fn dispatch(
        &self,
        operation: &str,
        target: &dyn ClickTarget,
        cancel: &CancellationToken,
    ) -> anyhow::Result<bool> {
        let waited_ms = self.pacer.wait_turn(cancel).await?;
        let description = target.describe();

        let result = target.dispatch_click().await;
        let (accepted, error) = match &result {
            Ok(accepted) => (*accepted, None),
            Err(e) => (false, Some(e.to_string())),
        };
        self.push_audit(InjectionAuditRecord {
            operation: operation.to_string(),
            target: description.clone(),
            at: Utc::now(),
            waited_ms,
            accepted,
            error,
        });

        match &result {
            Ok(true) => info!("injection: {} accepted on {}", operation, description),
            Ok(false) => warn!("injection: {} rejected by {}", operation, description),
            Err(e) => warn!("injection: {} failed on {}: {}", operation, description, e),
        }
        result
    }
}
