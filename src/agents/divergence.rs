//! Divergence Guard
//!
//! Dual-stream hallucination detector. The primary context is the canonical
//! text of everything extracted; the shadow context perturbs a random subset
//! of its monetary literals, reproducibly seeded from the session id. If the
//! model's reasoning vectors over the two contexts diverge below the
//! tenant's threshold, the reasoning was anchored to something other than
//! the numbers, and the verdict is forced to DIVERGENCE_ALERT.

use chrono::Utc;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::agents::{render_extracted, PipelineDeps};
use crate::decimal::Decimal;
use crate::models::{
    DivergenceMetrics, DivergenceRecord, DocumentKind, ErrorKind, PerturbationRecord,
    ProgressEvent, Stage,
};
use crate::state::PipelineState;

/// Each monetary literal is perturbed independently with this probability.
pub const PERTURB_PROBABILITY: f64 = 0.15;

/// Perturbation factors: ±5% and ±10%, applied as exact decimal multipliers.
const PERTURB_MULTIPLIERS: [(&str, f64); 4] = [
    ("0.90", -0.10),
    ("0.95", -0.05),
    ("1.05", 0.05),
    ("1.10", 0.10),
];

/// Monetary literal shape: integer part, point, exactly two places.
const MONEY_LITERAL_PATTERN: &str = r"\b\d+\.\d{2}\b";

fn money_literal_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(MONEY_LITERAL_PATTERN).expect("literal pattern is valid"))
}

const REASON_VECTOR_DEGENERATE: &str = "VECTOR_DEGENERATE";

pub async fn run(deps: &PipelineDeps, state: &mut PipelineState) -> super::StageResult {
    if state.extracted.is_none() {
        super::note_unavailable_input(state, Stage::DivergenceGuard, "extracted data");
    }

    let primary = primary_context(state);
    let seed = session_seed(&state.session_id);
    let (shadow, perturbations) = perturb_context(&primary, seed);

    let threshold = deps.thresholds.threshold(&state.tenant_id).await;

    let mut degraded = false;
    let mut degenerate_reason: Option<String> = None;

    // Byte-identical contexts are definitionally stable: similarity is 1.0
    // and no second vector is requested (an embedding backend is not
    // guaranteed to return identical vectors for repeated calls).
    let similarity = if shadow == primary {
        1.0
    } else {
        let primary_vec = deps
            .router
            .reasoning_vector(&analysis_prompt(&primary))
            .await;
        let shadow_vec = deps.router.reasoning_vector(&analysis_prompt(&shadow)).await;
        match (primary_vec, shadow_vec) {
            (Ok(p), Ok(s)) => {
                degraded = p.degraded || s.degraded;
                let cosine = cosine_similarity(&p.value, &s.value);
                if cosine.is_finite() {
                    cosine
                } else {
                    degenerate_reason = Some("reasoning vector has zero norm".to_string());
                    0.0
                }
            }
            (p, s) => {
                let error = p.err().or(s.err()).map(|e| format!("{e:#}")).unwrap_or_default();
                degenerate_reason = Some(format!("reasoning vector unavailable: {error}"));
                0.0
            }
        }
    };

    if degraded {
        state.push_error(
            Stage::DivergenceGuard,
            ErrorKind::UpstreamUnavailable,
            "reasoning vectors served by deterministic fallback",
            false,
        );
    }
    if let Some(reason) = &degenerate_reason {
        state.push_error(
            Stage::DivergenceGuard,
            ErrorKind::VectorDegenerate,
            reason.clone(),
            false,
        );
    }

    let alert_triggered = degenerate_reason.is_some() || similarity < threshold;
    let perturbation_summary = format!(
        "{} of {} monetary literals shifted by 5-10%",
        perturbations.len(),
        count_literals(&primary),
    );

    if alert_triggered {
        warn!(
            session = %state.session_id,
            similarity,
            threshold,
            "divergence alert triggered"
        );
        deps.bus.publish(
            &state.session_id,
            ProgressEvent::DivergenceAlert {
                similarity,
                threshold,
                perturbation_summary: perturbation_summary.clone(),
            },
        );
    } else {
        debug!(session = %state.session_id, similarity, threshold, "divergence clear");
        deps.bus.publish(
            &state.session_id,
            ProgressEvent::DivergenceClear { similarity },
        );
    }

    let metrics = DivergenceMetrics {
        similarity,
        threshold,
        alert_triggered,
        reason: degenerate_reason
            .is_some()
            .then(|| REASON_VECTOR_DEGENERATE.to_string()),
        perturbations,
        router_degraded: degraded,
        primary_digest: context_digest(&primary),
        shadow_digest: context_digest(&shadow),
    };

    let record = DivergenceRecord {
        session_id: state.session_id.clone(),
        tenant_id: state.tenant_id.clone(),
        primary_summary: format!("sha256:{} ({} bytes)", metrics.primary_digest, primary.len()),
        shadow_summary: format!("sha256:{} ({} bytes)", metrics.shadow_digest, shadow.len()),
        similarity,
        threshold_used: threshold,
        alert_triggered,
        perturbation_summary,
        router_degraded: degraded,
        created_at: Utc::now(),
    };
    if let Err(e) = deps.divergence_sink.record(&record).await {
        warn!(session = %state.session_id, error = %e, "divergence record not persisted");
    }

    state.divergence = Some(metrics);
    Ok(())
}

/// Canonical text concatenation of all extracted data, in document order.
fn primary_context(state: &PipelineState) -> String {
    let mut out = String::new();
    if let Some(extracted) = &state.extracted {
        for kind in DocumentKind::ALL {
            if let Some(doc) = extracted.get(kind) {
                out.push_str(&render_extracted(doc));
                out.push('\n');
            }
        }
    }
    out
}

fn analysis_prompt(context: &str) -> String {
    format!(
        "Assess whether the following three-way reconciliation evidence is \
         internally consistent and whether the documents agree:\n\n{context}"
    )
}

/// Stable per-session seed: leading bytes of the session id's digest.
pub fn session_seed(session_id: &str) -> u64 {
    let digest = Sha256::digest(session_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

fn count_literals(text: &str) -> usize {
    money_literal_re().find_iter(text).count()
}

/// Derive the shadow context: each monetary literal is independently
/// perturbed with probability 0.15 by an exact ±5/±10% multiplier, rounded
/// back to two places. Seeded, so the same session always produces the same
/// shadow.
pub fn perturb_context(text: &str, seed: u64) -> (String, Vec<PerturbationRecord>) {
    let pattern = money_literal_re();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut out = String::with_capacity(text.len());
    let mut perturbations = Vec::new();
    let mut cursor = 0usize;

    for found in pattern.find_iter(text) {
        out.push_str(&text[cursor..found.start()]);
        cursor = found.end();

        let literal = found.as_str();
        if rng.gen::<f64>() >= PERTURB_PROBABILITY {
            out.push_str(literal);
            continue;
        }
        let (multiplier, factor) = PERTURB_MULTIPLIERS[rng.gen_range(0..PERTURB_MULTIPLIERS.len())];

        let perturbed = Decimal::parse(literal)
            .ok()
            .and_then(|value| value.mul(Decimal::parse(multiplier).expect("static multiplier")).ok())
            .map(|shifted| shifted.round_dp(2).to_string_with_scale(2));
        match perturbed {
            // A shift that lands on the same rendering (0.00 and friends) is
            // not a perturbation.
            Some(perturbed) if perturbed != literal => {
                out.push_str(&perturbed);
                perturbations.push(PerturbationRecord {
                    literal: literal.to_string(),
                    perturbed,
                    factor,
                });
            }
            Some(_) => out.push_str(literal),
            // A literal the kernel cannot hold (overflow) passes through.
            None => out.push_str(literal),
        }
    }
    out.push_str(&text[cursor..]);
    (out, perturbations)
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return f64::NAN;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        norm_a += (*x as f64).powi(2);
        norm_b += (*y as f64).powi(2);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return f64::NAN;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn context_digest(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "line 0: widget | qty 10 | unit 50.00 | total 500.00\n\
                          subtotal: 500.00\ntax: 0.00\ngrand_total: 500.00\n";

    #[test]
    fn perturbation_is_reproducible() {
        let seed = session_seed("session-123");
        let (shadow_a, records_a) = perturb_context(SAMPLE, seed);
        let (shadow_b, records_b) = perturb_context(SAMPLE, seed);
        assert_eq!(shadow_a, shadow_b);
        assert_eq!(records_a.len(), records_b.len());

        let other = session_seed("session-456");
        assert_ne!(seed, other);
    }

    #[test]
    fn perturbed_literals_keep_two_places() {
        // Enough literals that some perturbation is near-certain.
        let text = (0..200)
            .map(|i| format!("amount {i}.00"))
            .collect::<Vec<_>>()
            .join("\n");
        let (shadow, records) = perturb_context(&text, 7);
        assert!(!records.is_empty(), "expected at least one perturbation");
        for record in &records {
            assert!(record.perturbed.contains('.'));
            let places = record.perturbed.split('.').nth(1).unwrap().len();
            assert_eq!(places, 2);
            assert!(
                [-0.10, -0.05, 0.05, 0.10].contains(&record.factor),
                "factor {}",
                record.factor
            );
        }
        assert_ne!(shadow, text);
    }

    #[test]
    fn non_monetary_text_passes_through_unchanged() {
        let text = "qty 10 and part AB-12, nothing with two places";
        let (shadow, records) = perturb_context(text, 42);
        assert_eq!(shadow, text);
        assert!(records.is_empty());
    }

    #[test]
    fn cosine_basics() {
        let a = [1.0f32, 0.0, 0.0];
        let b = [0.0f32, 1.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&a, &b).abs() < 1e-9);
        assert!(cosine_similarity(&a, &[0.0f32, 0.0, 0.0]).is_nan());
        assert!(cosine_similarity(&a, &[1.0f32, 0.0]).is_nan());
    }
}
