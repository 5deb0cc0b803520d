//! Adaptive Threshold Store
//!
//! Per-tenant divergence cutoff τ learned from human feedback on past
//! alerts. With fewer than 20 samples the global prior applies. Otherwise τ
//! is the candidate cutoff minimizing `false_positives + 2·false_negatives`
//! replayed against the recorded similarities, clamped to [0.70, 0.95].
//! Reads are O(1) off a cached value; feedback invalidates lazily.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use tracing::debug;

use crate::models::AlertFeedback;
use crate::stores::FeedbackStore;

pub const WINDOW_SIZE: usize = 200;
pub const MIN_SAMPLES: usize = 20;
pub const GLOBAL_PRIOR: f64 = 0.85;
pub const TAU_MIN: f64 = 0.70;
pub const TAU_MAX: f64 = 0.95;

/// Candidate grid step. 51 candidates across [0.70, 0.95].
const TAU_STEP: f64 = 0.005;

pub struct AdaptiveThresholdStore {
    feedback: Arc<dyn FeedbackStore>,
    cache: RwLock<HashMap<String, f64>>,
}

impl AdaptiveThresholdStore {
    pub fn new(feedback: Arc<dyn FeedbackStore>) -> Self {
        Self {
            feedback,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// τ for a tenant. Cached after the first computation; a feedback-store
    /// failure falls back to the prior without caching it.
    pub async fn threshold(&self, tenant_id: &str) -> f64 {
        if let Some(tau) = self.cache.read().get(tenant_id) {
            return *tau;
        }
        match self.recompute(tenant_id).await {
            Ok(tau) => tau,
            Err(e) => {
                debug!(tenant = tenant_id, error = %e, "feedback unavailable, using prior");
                GLOBAL_PRIOR
            }
        }
    }

    /// Drop the cached τ so the next read refits. Called when new feedback
    /// lands for a tenant.
    pub fn invalidate(&self, tenant_id: &str) {
        self.cache.write().remove(tenant_id);
    }

    async fn recompute(&self, tenant_id: &str) -> Result<f64> {
        let samples = self.feedback.recent(tenant_id, WINDOW_SIZE).await?;
        let tau = fit_threshold(&samples);
        self.cache.write().insert(tenant_id.to_string(), tau);
        debug!(tenant = tenant_id, samples = samples.len(), tau, "threshold fitted");
        Ok(tau)
    }
}

/// Replay every candidate cutoff against the recorded similarities and pick
/// the cheapest. Ties resolve to the lowest candidate, scanned ascending, so
/// the fit is deterministic.
pub fn fit_threshold(samples: &[AlertFeedback]) -> f64 {
    if samples.len() < MIN_SAMPLES {
        return GLOBAL_PRIOR;
    }

    let mut best_tau = GLOBAL_PRIOR.clamp(TAU_MIN, TAU_MAX);
    let mut best_cost = u64::MAX;

    let steps = ((TAU_MAX - TAU_MIN) / TAU_STEP).round() as usize;
    for step in 0..=steps {
        let tau = TAU_MIN + step as f64 * TAU_STEP;
        let mut cost: u64 = 0;
        for sample in samples {
            let would_alert = sample.similarity < tau;
            let divergent = sample.truly_divergent();
            if would_alert && !divergent {
                cost += 1; // false positive
            } else if !would_alert && divergent {
                cost += 2; // false negative, weighted double
            }
        }
        if cost < best_cost {
            best_cost = cost;
            best_tau = tau;
        }
    }

    best_tau.clamp(TAU_MIN, TAU_MAX)
}
