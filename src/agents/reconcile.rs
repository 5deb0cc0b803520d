//! Reconciliation Agent
//!
//! Builds the PO-anchored cross-document match table, derives the verdict
//! deterministically from the table, the quantitative flags, the compliance
//! risk and the divergence guard, and only then lets the model phrase the
//! discrepancy summary. The status ladder never depends on model output.

use anyhow::Context;
use tracing::{debug, warn};

use crate::agents::{note_unavailable_input, PipelineDeps};
use crate::decimal::{Decimal, PRICE_REL_TOL};
use crate::matching::{self, FULL_MATCH_THRESHOLD, LINK_THRESHOLD};
use crate::models::{
    ErrorKind, ExtractedData, ExtractedLineItem, LineItemMatch, OverallStatus, ProgressEvent,
    QuantitativeReport, Recommendation, Stage, TripleStatus, Verdict,
};
use crate::router::CompletionRequest;
use crate::state::PipelineState;

/// Risk score at which a MISMATCH hardens from HOLD to REJECT.
const REJECT_RISK_THRESHOLD: f64 = 7.0;

const MAX_SUMMARY_FINDINGS: usize = 5;

pub async fn run(deps: &PipelineDeps, state: &mut PipelineState) -> super::StageResult {
    let extracted = match state.extracted.clone() {
        Some(extracted) => extracted,
        None => {
            note_unavailable_input(state, Stage::Reconciliation, "extracted data");
            ExtractedData::default()
        }
    };
    let quantitative = match state.quantitative.clone() {
        Some(report) => report,
        None => {
            note_unavailable_input(state, Stage::Reconciliation, "quantitative report");
            QuantitativeReport::default()
        }
    };

    let table = build_match_table(&extracted);
    let alert = state.divergence_alerted();
    let similarity = state
        .divergence
        .as_ref()
        .map(|d| d.similarity)
        .unwrap_or(0.0);
    let risk_score = state
        .compliance
        .as_ref()
        .map(|c| c.risk_score)
        .unwrap_or(0.0);

    let (overall_status, recommendation) = derive_status(&table, &quantitative, alert, risk_score);
    let confidence = derive_confidence(&table, similarity, risk_score);

    let findings = deterministic_findings(&table, &quantitative, &extracted);
    deps.bus.publish(
        &state.session_id,
        ProgressEvent::AgentProgress {
            stage: Stage::Reconciliation,
            message: format!(
                "{} triples, status {}",
                table.len(),
                overall_status.as_str()
            ),
        },
    );
    let discrepancy_summary = narrate_summary(deps, state, &findings).await;

    let verdict = Verdict {
        overall_status,
        confidence,
        line_item_matches: table,
        discrepancy_summary,
        recommendation,
    };
    if let Err(violation) = verdict.validate() {
        return Err(super::FatalStageError::contract(violation));
    }

    debug!(
        session = %state.session_id,
        status = overall_status.as_str(),
        recommendation = recommendation.as_str(),
        confidence,
        "verdict derived"
    );
    state.verdict = Some(verdict);
    Ok(())
}

fn lines_of(doc: Option<&crate::models::ExtractedDocument>) -> &[ExtractedLineItem] {
    doc.map(|d| d.line_items.as_slice()).unwrap_or(&[])
}

/// PO-anchored match table plus leftover counterparty lines. Higher score
/// wins; equal scores keep the lower counterparty index (stable matching).
pub fn build_match_table(extracted: &ExtractedData) -> Vec<LineItemMatch> {
    let po_lines = lines_of(extracted.po.as_ref());
    let grn_lines = lines_of(extracted.grn.as_ref());
    let invoice_lines = lines_of(extracted.invoice.as_ref());

    let mut table = Vec::new();
    let mut grn_taken = vec![false; grn_lines.len()];
    let mut invoice_taken = vec![false; invoice_lines.len()];

    for (po_idx, po_line) in po_lines.iter().enumerate() {
        let grn_hit = matching::best_match(po_line, grn_lines);
        let invoice_hit = matching::best_match(po_line, invoice_lines);

        if let Some((j, _)) = grn_hit {
            grn_taken[j] = true;
        }
        if let Some((k, _)) = invoice_hit {
            invoice_taken[k] = true;
        }

        let grn_line = grn_hit.map(|(j, _)| &grn_lines[j]);
        let invoice_line = invoice_hit.map(|(k, _)| &invoice_lines[k]);

        // An unmatched counterparty side scores zero: agreement that cannot
        // be demonstrated is not agreement.
        let description_score = grn_hit
            .map(|(_, s)| s)
            .unwrap_or(0)
            .min(invoice_hit.map(|(_, s)| s).unwrap_or(0));

        let quantity_delta = invoice_line
            .or(grn_line)
            .and_then(|other| other.quantity.value.sub(po_line.quantity.value).ok())
            .unwrap_or(Decimal::ZERO);
        let price_delta = invoice_line
            .and_then(|inv| inv.unit_price.value.sub(po_line.unit_price.value).ok())
            .unwrap_or(Decimal::ZERO);

        let mut deltas_out = 0u8;
        let quantity_agrees = grn_line
            .map(|g| g.quantity.value == po_line.quantity.value)
            .unwrap_or(true)
            && invoice_line
                .map(|inv| {
                    let reference = grn_line.map(|g| g.quantity.value).unwrap_or(po_line.quantity.value);
                    inv.quantity.value == reference
                })
                .unwrap_or(true);
        if !quantity_agrees {
            deltas_out += 1;
        }
        let price_agrees = invoice_line
            .map(|inv| {
                po_line.unit_price.value.is_zero()
                    || inv
                        .unit_price
                        .value
                        .within_relative(po_line.unit_price.value, PRICE_REL_TOL)
            })
            .unwrap_or(true);
        if !price_agrees {
            deltas_out += 1;
        }

        table.push(LineItemMatch {
            po_index: Some(po_idx),
            grn_index: grn_hit.map(|(j, _)| j),
            invoice_index: invoice_hit.map(|(k, _)| k),
            description_score,
            quantity_delta,
            price_delta,
            status: triple_status(description_score, deltas_out),
        });
    }

    // Counterparty lines no PO line claimed are themselves exceptions.
    for (j, taken) in grn_taken.iter().enumerate() {
        if !taken {
            table.push(unmatched_row(None, Some(j), None));
        }
    }
    for (k, taken) in invoice_taken.iter().enumerate() {
        if !taken {
            table.push(unmatched_row(None, None, Some(k)));
        }
    }

    table
}

fn unmatched_row(
    po_index: Option<usize>,
    grn_index: Option<usize>,
    invoice_index: Option<usize>,
) -> LineItemMatch {
    LineItemMatch {
        po_index,
        grn_index,
        invoice_index,
        description_score: 0,
        quantity_delta: Decimal::ZERO,
        price_delta: Decimal::ZERO,
        status: TripleStatus::Mismatch,
    }
}

pub(crate) fn triple_status(description_score: u8, deltas_out: u8) -> TripleStatus {
    if description_score < LINK_THRESHOLD || deltas_out >= 2 {
        TripleStatus::Mismatch
    } else if description_score >= FULL_MATCH_THRESHOLD && deltas_out == 0 {
        TripleStatus::FullMatch
    } else {
        TripleStatus::PartialMatch
    }
}

/// Deterministic verdict ladder; the guard outranks everything.
pub(crate) fn derive_status(
    table: &[LineItemMatch],
    quantitative: &QuantitativeReport,
    alert: bool,
    risk_score: f64,
) -> (OverallStatus, Recommendation) {
    if alert {
        return (OverallStatus::DivergenceAlert, Recommendation::Escalate);
    }
    if table.is_empty() {
        // Nothing to reconcile at all: surfaced for a human, not approved.
        return (OverallStatus::Exception, Recommendation::Hold);
    }
    let any_mismatch = table.iter().any(|m| m.status == TripleStatus::Mismatch);
    let hard_flag = quantitative.flags.iter().any(|f| f.kind.is_hard());
    if any_mismatch || hard_flag {
        let recommendation = if risk_score >= REJECT_RISK_THRESHOLD {
            Recommendation::Reject
        } else {
            Recommendation::Hold
        };
        return (OverallStatus::Mismatch, recommendation);
    }
    if !quantitative.flags.is_empty() {
        // Only soft flags remain (LINE_ARITHMETIC / TAX_COMPOSITION).
        return (OverallStatus::PartialMatch, Recommendation::Hold);
    }
    if table.iter().all(|m| m.status == TripleStatus::FullMatch) {
        return (OverallStatus::FullMatch, Recommendation::Approve);
    }
    (OverallStatus::PartialMatch, Recommendation::Hold)
}

/// Weighted mean: description agreement 0.5, divergence similarity 0.3,
/// inverse compliance risk 0.2. Clamped to [0, 1].
pub(crate) fn derive_confidence(table: &[LineItemMatch], similarity: f64, risk_score: f64) -> f64 {
    let description = if table.is_empty() {
        0.0
    } else {
        table
            .iter()
            .map(|m| m.description_score as f64 / 100.0)
            .sum::<f64>()
            / table.len() as f64
    };
    let similarity = if similarity.is_finite() {
        similarity.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let inverse_risk = 1.0 - (risk_score.clamp(0.0, 10.0) / 10.0);
    (0.5 * description + 0.3 * similarity + 0.2 * inverse_risk).clamp(0.0, 1.0)
}

fn describe_row(row: &LineItemMatch, extracted: &ExtractedData) -> String {
    let description = row
        .po_index
        .and_then(|i| extracted.po.as_ref().and_then(|d| d.line_items.get(i)))
        .or_else(|| {
            row.grn_index
                .and_then(|j| extracted.grn.as_ref().and_then(|d| d.line_items.get(j)))
        })
        .or_else(|| {
            row.invoice_index
                .and_then(|k| extracted.invoice.as_ref().and_then(|d| d.line_items.get(k)))
        })
        .map(|l| l.description.clone())
        .unwrap_or_else(|| "unknown item".to_string());
    let side = match (row.po_index, row.grn_index, row.invoice_index) {
        (Some(_), None, None) => "has no counterpart in GRN or invoice",
        (Some(_), Some(_), None) => "is missing from the invoice",
        (Some(_), None, Some(_)) => "is missing from the GRN",
        (None, Some(_), _) => "appears on the GRN but not the purchase order",
        (None, None, Some(_)) => "appears on the invoice but not the purchase order",
        _ => "does not reconcile across documents",
    };
    format!("Line item {description:?} {side}")
}

fn deterministic_findings(
    table: &[LineItemMatch],
    quantitative: &QuantitativeReport,
    extracted: &ExtractedData,
) -> Vec<String> {
    let mut findings = Vec::new();
    for flag in &quantitative.flags {
        findings.push(format!("{}: {}", flag.kind.as_str(), flag.detail));
    }
    for row in table.iter().filter(|m| m.status == TripleStatus::Mismatch) {
        findings.push(describe_row(row, extracted));
    }
    findings.truncate(MAX_SUMMARY_FINDINGS);
    findings
}

/// Narrative polish only: the model may rephrase the deterministic findings
/// but contributes no numbers and no new findings. Anything malformed falls
/// back to the findings verbatim.
async fn narrate_summary(
    deps: &PipelineDeps,
    state: &mut PipelineState,
    findings: &[String],
) -> Vec<String> {
    if findings.is_empty() {
        return Vec::new();
    }
    let fallback = findings.join("\n");
    let request = CompletionRequest {
        system: "You are drafting audit findings. Rewrite each finding as one concise \
                 sentence, one per line, preserving every figure exactly. Do not add, \
                 merge or drop findings."
            .to_string(),
        prompt: format!("Findings:\n{fallback}"),
        temperature: 0.2,
        max_tokens: 400,
        json_mode: false,
        neutral_response: fallback.clone(),
    };
    match deps.router.complete(&request).await.context("summary narration") {
        Ok(outcome) => {
            if outcome.degraded {
                state.push_error(
                    Stage::Reconciliation,
                    ErrorKind::UpstreamUnavailable,
                    "summary narration served by deterministic fallback",
                    false,
                );
            }
            let lines: Vec<String> = outcome
                .value
                .lines()
                .map(|l| l.trim_start_matches(&['-', '*', ' '][..]).trim().to_string())
                .filter(|l| !l.is_empty())
                .take(MAX_SUMMARY_FINDINGS)
                .collect();
            if lines.len() == findings.len() {
                lines
            } else {
                findings.to_vec()
            }
        }
        Err(e) => {
            warn!(session = %state.session_id, error = %e, "summary narration failed");
            findings.to_vec()
        }
    }
}
