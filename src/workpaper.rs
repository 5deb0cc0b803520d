//! Workpaper Composer
//!
//! Builds the final structured audit artifact. Every number and citation in
//! the workpaper is copied from earlier stage slots; composition never
//! recomputes and never asks the model for a figure. Narrative prose is
//! layered on top by the drafting agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::citations::{BindingRecord, CitationReport};
use crate::decimal::Decimal;
use crate::models::{
    Citation, ComplianceReport, DivergenceMetrics, DocumentKind, ExtractedData,
    ExtractedLineItem, QuantitativeReport, TripleStatus, Verdict,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkpaperSection {
    pub id: String,
    pub title: String,
    pub body: String,
}

/// One side of a reconciliation table row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowSide {
    pub line_index: Option<usize>,
    pub quantity: Option<String>,
    pub unit_price: Option<String>,
    pub total: Option<String>,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkpaperRow {
    pub description: String,
    pub po: RowSide,
    pub grn: RowSide,
    pub invoice: RowSide,
    pub description_score: u8,
    pub quantity_delta: Decimal,
    pub price_delta: Decimal,
    pub status: TripleStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompliancePanel {
    pub risk_score: f64,
    pub flags: Vec<String>,
    pub policy_violations: Vec<String>,
    pub uncorroborated: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DivergencePanel {
    pub similarity: f64,
    pub threshold: f64,
    pub alert_triggered: bool,
    pub reason: Option<String>,
    pub perturbation_count: usize,
    pub router_degraded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workpaper {
    pub session_id: String,
    pub sections: Vec<WorkpaperSection>,
    pub line_item_table: Vec<WorkpaperRow>,
    pub compliance_panel: CompliancePanel,
    pub divergence_panel: DivergencePanel,
    pub citations: Vec<BindingRecord>,
    pub created_at: DateTime<Utc>,
}

impl Workpaper {
    pub fn section_mut(&mut self, id: &str) -> Option<&mut WorkpaperSection> {
        self.sections.iter_mut().find(|s| s.id == id)
    }
}

pub const SECTION_OBJECTIVE: &str = "objective";
pub const SECTION_PROCEDURE: &str = "procedure";
pub const SECTION_FINDINGS: &str = "findings";
pub const SECTION_MATERIALITY: &str = "materiality";
pub const SECTION_CONCLUSION: &str = "conclusion";

/// Deterministic composition from prior stage slots. Missing slots leave
/// explicit "not available" markers rather than silent blanks.
pub fn compose_skeleton(
    session_id: &str,
    extracted: Option<&ExtractedData>,
    citations: Option<&CitationReport>,
    quantitative: Option<&QuantitativeReport>,
    compliance: Option<&ComplianceReport>,
    divergence: Option<&DivergenceMetrics>,
    verdict: Option<&Verdict>,
) -> Workpaper {
    let line_item_table = match (extracted, verdict) {
        (Some(extracted), Some(verdict)) => build_table(extracted, verdict),
        _ => Vec::new(),
    };

    let compliance_panel = compliance
        .map(|c| CompliancePanel {
            risk_score: c.risk_score,
            flags: c.flags.clone(),
            policy_violations: c.policy_violations.clone(),
            uncorroborated: c.uncorroborated.clone(),
        })
        .unwrap_or_default();

    let divergence_panel = divergence
        .map(|d| DivergencePanel {
            similarity: d.similarity,
            threshold: d.threshold,
            alert_triggered: d.alert_triggered,
            reason: d.reason.clone(),
            perturbation_count: d.perturbations.len(),
            router_degraded: d.router_degraded,
        })
        .unwrap_or_default();

    let sections = vec![
        WorkpaperSection {
            id: SECTION_OBJECTIVE.to_string(),
            title: "Objective".to_string(),
            body: "Verify three-way agreement of quantities, unit prices and totals \
                   across the purchase order, goods receipt note and supplier invoice."
                .to_string(),
        },
        WorkpaperSection {
            id: SECTION_PROCEDURE.to_string(),
            title: "Procedure".to_string(),
            body: procedure_body(extracted),
        },
        WorkpaperSection {
            id: SECTION_FINDINGS.to_string(),
            title: "Findings".to_string(),
            body: findings_body(quantitative, verdict),
        },
        WorkpaperSection {
            id: SECTION_MATERIALITY.to_string(),
            title: "Materiality".to_string(),
            body: "Monetary comparisons applied an absolute tolerance of 0.01 currency \
                   units; unit prices a relative tolerance of 0.1%; quantities were \
                   compared exactly."
                .to_string(),
        },
        WorkpaperSection {
            id: SECTION_CONCLUSION.to_string(),
            title: "Conclusion".to_string(),
            body: conclusion_body(verdict),
        },
    ];

    Workpaper {
        session_id: session_id.to_string(),
        sections,
        line_item_table,
        compliance_panel,
        divergence_panel,
        citations: citations.map(|c| c.bindings.clone()).unwrap_or_default(),
        created_at: Utc::now(),
    }
}

fn side_for(item: Option<&ExtractedLineItem>, index: Option<usize>) -> RowSide {
    match item {
        Some(item) => {
            let mut citations = Vec::new();
            for value in [&item.quantity, &item.unit_price, &item.total] {
                if let Some(c) = value.citation.citation() {
                    citations.push(*c);
                }
            }
            RowSide {
                line_index: index,
                quantity: Some(item.quantity.value.to_string()),
                unit_price: Some(item.unit_price.value.to_string_with_scale(2)),
                total: Some(item.total.value.to_string_with_scale(2)),
                citations,
            }
        }
        None => RowSide::default(),
    }
}

fn build_table(extracted: &ExtractedData, verdict: &Verdict) -> Vec<WorkpaperRow> {
    verdict
        .line_item_matches
        .iter()
        .map(|m| {
            let po_item = m
                .po_index
                .and_then(|i| extracted.po.as_ref().and_then(|d| d.line_items.get(i)));
            let grn_item = m
                .grn_index
                .and_then(|i| extracted.grn.as_ref().and_then(|d| d.line_items.get(i)));
            let invoice_item = m.invoice_index.and_then(|i| {
                extracted
                    .invoice
                    .as_ref()
                    .and_then(|d| d.line_items.get(i))
            });
            let description = po_item
                .or(grn_item)
                .or(invoice_item)
                .map(|i| i.description.clone())
                .unwrap_or_default();
            WorkpaperRow {
                description,
                po: side_for(po_item, m.po_index),
                grn: side_for(grn_item, m.grn_index),
                invoice: side_for(invoice_item, m.invoice_index),
                description_score: m.description_score,
                quantity_delta: m.quantity_delta,
                price_delta: m.price_delta,
                status: m.status,
            }
        })
        .collect()
}

fn procedure_body(extracted: Option<&ExtractedData>) -> String {
    let documents: Vec<&str> = DocumentKind::ALL
        .iter()
        .filter(|k| extracted.map(|e| e.get(**k).is_some()).unwrap_or(false))
        .map(|k| k.as_str())
        .collect();
    if documents.is_empty() {
        return "No documents were available for examination.".to_string();
    }
    format!(
        "Extracted structured data from {} with spatial citations, re-verified all \
         line and total arithmetic with exact decimal comparison, linked line items \
         across documents by description similarity, and tested reasoning stability \
         against a perturbed shadow context.",
        documents.join(", ")
    )
}

fn findings_body(quantitative: Option<&QuantitativeReport>, verdict: Option<&Verdict>) -> String {
    let mut lines = Vec::new();
    if let Some(q) = quantitative {
        if q.flags.is_empty() {
            lines.push("All quantitative checks passed.".to_string());
        }
        for flag in &q.flags {
            lines.push(format!("[{}] {}", flag.kind.as_str(), flag.detail));
        }
    } else {
        lines.push("Quantitative verification unavailable.".to_string());
    }
    if let Some(v) = verdict {
        for finding in &v.discrepancy_summary {
            lines.push(finding.clone());
        }
    }
    lines.join("\n")
}

fn conclusion_body(verdict: Option<&Verdict>) -> String {
    match verdict {
        Some(v) => format!(
            "Overall status {} with recommendation {} at confidence {:.2}.",
            v.overall_status.as_str(),
            v.recommendation.as_str(),
            v.confidence
        ),
        None => "No verdict was produced for this session.".to_string(),
    }
}
