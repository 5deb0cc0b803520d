//! Compliance Agent
//!
//! Rule evaluation over the three extracted documents: duplicate-invoice
//! signal against the tenant's invoice history, vendor familiarity, tax
//! sanity, payment-terms consistency and line-count parity. The model's
//! judgment is advisory: any numeric claim it makes must be corroborated by
//! the quantitative report or it is excluded from the flags.

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::agents::{note_unavailable_input, render_extracted, PipelineDeps};
use crate::models::{
    ComplianceReport, DocumentKind, ErrorKind, ExtractedData, ProgressEvent, QuantFlagKind,
    QuantitativeReport, Stage,
};
use crate::router::CompletionRequest;
use crate::state::PipelineState;

const COMPLIANCE_SYSTEM_PROMPT: &str = "You are a procurement compliance reviewer. \
    Evaluate the reconciliation evidence and return ONLY a JSON object matching the \
    requested schema. Do not perform arithmetic; arithmetic findings are supplied \
    to you and re-verified elsewhere.";

const MAX_FLAGS: usize = 16;

fn neutral_compliance_json() -> String {
    r#"{"risk_score":0,"flags":[],"policy_violations":[],"duplicate_invoice":false,"vendor_known":true,"tax_computation_ok":true,"payment_terms_consistent":true,"line_count_parity":true}"#
        .to_string()
}

pub async fn run(deps: &PipelineDeps, state: &mut PipelineState) -> super::StageResult {
    let Some(extracted) = state.extracted.clone() else {
        note_unavailable_input(state, Stage::Compliance, "extracted data");
        state.compliance = Some(ComplianceReport {
            risk_score: 0.0,
            flags: Vec::new(),
            policy_violations: Vec::new(),
            uncorroborated: Vec::new(),
        });
        return Ok(());
    };

    let invoice_number = extracted
        .invoice
        .as_ref()
        .map(|d| d.document_number.clone())
        .unwrap_or_default();
    let vendor = extracted
        .invoice
        .as_ref()
        .or(extracted.po.as_ref())
        .map(|d| d.vendor_name.clone())
        .unwrap_or_default();

    let history = match deps
        .invoice_history
        .recent_invoice_numbers(&state.tenant_id, &vendor)
        .await
    {
        Ok(history) => history,
        Err(e) => {
            warn!(tenant = %state.tenant_id, error = %e, "invoice history unavailable");
            state.push_error(
                Stage::Compliance,
                ErrorKind::UnavailableInput,
                format!("invoice history unavailable: {e:#}"),
                false,
            );
            Vec::new()
        }
    };

    deps.bus.publish(
        &state.session_id,
        ProgressEvent::AgentProgress {
            stage: Stage::Compliance,
            message: "evaluating compliance rules".to_string(),
        },
    );

    let report = match evaluate(deps, &extracted, &history).await {
        Ok((raw, degraded)) => {
            if degraded {
                state.push_error(
                    Stage::Compliance,
                    ErrorKind::UpstreamUnavailable,
                    "compliance evaluation served by deterministic fallback",
                    false,
                );
            }
            cross_check(
                raw,
                &extracted,
                &history,
                &invoice_number,
                state.quantitative.as_ref(),
            )
        }
        Err(e) => {
            warn!(session = %state.session_id, error = %e, "compliance evaluation failed");
            state.push_error(
                Stage::Compliance,
                ErrorKind::ParseError,
                format!("compliance evaluation failed: {e:#}"),
                false,
            );
            state.compliance = None;
            return Ok(());
        }
    };

    debug!(
        session = %state.session_id,
        risk = report.risk_score,
        flags = report.flags.len(),
        "compliance evaluated"
    );
    state.compliance = Some(report);
    Ok(())
}

async fn evaluate(
    deps: &PipelineDeps,
    extracted: &ExtractedData,
    history: &[String],
) -> Result<(RawCompliance, bool)> {
    let mut prompt = String::from("Reconciliation evidence:\n\n");
    for kind in DocumentKind::ALL {
        if let Some(doc) = extracted.get(kind) {
            prompt.push_str(&render_extracted(doc));
            prompt.push('\n');
        }
    }
    prompt.push_str(&format!(
        "Previously recorded invoice numbers for this vendor: [{}]\n\n",
        history.join(", ")
    ));
    prompt.push_str(
        "Assess: duplicate invoice number, vendor familiarity, tax computation \
         plausibility, payment terms consistency, and line count parity across \
         documents.\n\
         Return a JSON object with exactly these keys:\n\
         {\"risk_score\": number 0-10, \"flags\": [string], \
         \"policy_violations\": [string], \"duplicate_invoice\": boolean, \
         \"vendor_known\": boolean, \"tax_computation_ok\": boolean, \
         \"payment_terms_consistent\": boolean, \"line_count_parity\": boolean}\n",
    );

    let request = CompletionRequest {
        system: COMPLIANCE_SYSTEM_PROMPT.to_string(),
        prompt,
        temperature: 0.0,
        max_tokens: 600,
        json_mode: true,
        neutral_response: neutral_compliance_json(),
    };
    let outcome = deps
        .router
        .complete(&request)
        .await
        .context("compliance completion")?;
    let raw: RawCompliance =
        serde_json::from_str(&outcome.value).context("compliance json did not match schema")?;
    Ok((raw, outcome.degraded))
}

/// Fold the model's claims into a report, keeping only what the ground data
/// corroborates. Deterministic signals (history lookup, line counts) always
/// win over the model's opinion of them.
fn cross_check(
    raw: RawCompliance,
    extracted: &ExtractedData,
    history: &[String],
    invoice_number: &str,
    quantitative: Option<&QuantitativeReport>,
) -> ComplianceReport {
    let mut flags: Vec<String> = Vec::new();
    let mut uncorroborated: Vec<String> = Vec::new();

    let duplicate_in_history = !invoice_number.is_empty()
        && history
            .iter()
            .any(|h| h.eq_ignore_ascii_case(invoice_number));
    if duplicate_in_history {
        flags.push(format!("duplicate_invoice:{invoice_number}"));
    } else if raw.duplicate_invoice {
        uncorroborated.push("model flagged a duplicate invoice absent from history".to_string());
    }

    if !raw.vendor_known {
        flags.push("vendor_unknown".to_string());
    }

    let tax_flagged = quantitative
        .map(|q| q.has(QuantFlagKind::TaxComposition))
        .unwrap_or(false);
    if !raw.tax_computation_ok {
        if tax_flagged {
            flags.push("tax_computation".to_string());
        } else {
            uncorroborated
                .push("model doubted tax computation, arithmetic re-check passed".to_string());
        }
    }

    if !raw.payment_terms_consistent {
        flags.push("payment_terms_inconsistent".to_string());
    }

    let line_counts: Vec<usize> = DocumentKind::ALL
        .iter()
        .filter_map(|k| extracted.get(*k).map(|d| d.line_items.len()))
        .collect();
    let parity_holds = line_counts.windows(2).all(|w| w[0] == w[1]);
    if !parity_holds {
        flags.push(format!(
            "line_count_parity:{}",
            line_counts
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join("/")
        ));
    } else if !raw.line_count_parity {
        uncorroborated.push("model reported line count mismatch, counts agree".to_string());
    }

    for flag in raw.flags.into_iter().take(MAX_FLAGS) {
        let flag = flag.trim().to_string();
        if !flag.is_empty() && !flags.contains(&flag) {
            flags.push(flag);
        }
    }

    let risk_score = if raw.risk_score.is_finite() {
        raw.risk_score.clamp(0.0, 10.0)
    } else {
        0.0
    };

    ComplianceReport {
        risk_score,
        flags,
        policy_violations: raw
            .policy_violations
            .into_iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .take(MAX_FLAGS)
            .collect(),
        uncorroborated,
    }
}

#[derive(Debug, Deserialize)]
struct RawCompliance {
    #[serde(default)]
    risk_score: f64,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    policy_violations: Vec<String>,
    #[serde(default)]
    duplicate_invoice: bool,
    #[serde(default = "default_true")]
    vendor_known: bool,
    #[serde(default = "default_true")]
    tax_computation_ok: bool,
    #[serde(default = "default_true")]
    payment_terms_consistent: bool,
    #[serde(default = "default_true")]
    line_count_parity: bool,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimal::Decimal;
    use crate::models::{CitationRef, ExtractedDocument, ExtractedValue, QuantFlag};

    fn value(raw: &str) -> ExtractedValue {
        ExtractedValue {
            raw: raw.to_string(),
            value: Decimal::parse(raw).unwrap(),
            citation: CitationRef::Unresolved,
        }
    }

    fn doc(kind: DocumentKind, number: &str, lines: usize) -> ExtractedDocument {
        ExtractedDocument {
            document_id: format!("{}-1", kind.as_str()),
            kind,
            vendor_name: "Acme".to_string(),
            document_number: number.to_string(),
            document_date: "2025-06-01".to_string(),
            currency: "USD".to_string(),
            line_items: (0..lines)
                .map(|i| crate::models::ExtractedLineItem {
                    description: format!("item {i}"),
                    part_number: None,
                    quantity: value("1"),
                    unit_price: value("10.00"),
                    total: value("10.00"),
                })
                .collect(),
            subtotal: value("10.00"),
            tax: value("0.00"),
            grand_total: value("10.00"),
        }
    }

    fn raw_neutral() -> RawCompliance {
        serde_json::from_str(&neutral_compliance_json()).unwrap()
    }

    #[test]
    fn duplicate_detection_is_deterministic() {
        let mut extracted = ExtractedData::default();
        extracted.set(DocumentKind::Invoice, doc(DocumentKind::Invoice, "INV-7", 1));

        // History contains the number: flagged even though the model said no.
        let report = cross_check(
            raw_neutral(),
            &extracted,
            &["inv-7".to_string()],
            "INV-7",
            None,
        );
        assert!(report.flags.iter().any(|f| f.starts_with("duplicate_invoice")));

        // Model claims a duplicate the history cannot corroborate.
        let mut claim = raw_neutral();
        claim.duplicate_invoice = true;
        let report = cross_check(claim, &extracted, &[], "INV-7", None);
        assert!(report.flags.is_empty());
        assert_eq!(report.uncorroborated.len(), 1);
    }

    #[test]
    fn tax_doubt_requires_arithmetic_corroboration() {
        let extracted = ExtractedData::default();
        let mut claim = raw_neutral();
        claim.tax_computation_ok = false;

        let clean = QuantitativeReport {
            flags: Vec::new(),
            math_verified: true,
        };
        let report = cross_check(claim, &extracted, &[], "", Some(&clean));
        assert!(!report.flags.contains(&"tax_computation".to_string()));
        assert_eq!(report.uncorroborated.len(), 1);

        let mut claim = raw_neutral();
        claim.tax_computation_ok = false;
        let flagged = QuantitativeReport {
            flags: vec![QuantFlag {
                kind: QuantFlagKind::TaxComposition,
                document: Some(DocumentKind::Invoice),
                line: None,
                detail: "off by a cent".to_string(),
            }],
            math_verified: false,
        };
        let report = cross_check(claim, &extracted, &[], "", Some(&flagged));
        assert!(report.flags.contains(&"tax_computation".to_string()));
    }

    #[test]
    fn line_count_parity_is_recomputed() {
        let mut extracted = ExtractedData::default();
        extracted.set(DocumentKind::Po, doc(DocumentKind::Po, "PO-1", 2));
        extracted.set(DocumentKind::Invoice, doc(DocumentKind::Invoice, "INV-1", 3));

        let report = cross_check(raw_neutral(), &extracted, &[], "INV-1", None);
        assert!(report
            .flags
            .iter()
            .any(|f| f.starts_with("line_count_parity")));

        let mut risk = raw_neutral();
        risk.risk_score = f64::NAN;
        let report = cross_check(risk, &extracted, &[], "INV-1", None);
        assert_eq!(report.risk_score, 0.0);
    }
}
