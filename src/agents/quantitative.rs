//! Quantitative Agent
//!
//! Pure deterministic verification, no model calls. Recomputes every line
//! and total inside each document with exact decimal arithmetic, then checks
//! quantity and price agreement across documents over fuzzy-matched line
//! pairs.

use tracing::debug;

use crate::agents::note_unavailable_input;
use crate::decimal::{Decimal, MONEY_ABS_TOL, PRICE_REL_TOL};
use crate::matching;
use crate::models::{
    DocumentKind, ErrorKind, ExtractedDocument, QuantFlag, QuantFlagKind, QuantitativeReport,
    Stage,
};
use crate::state::PipelineState;

pub fn run(state: &mut PipelineState) -> super::StageResult {
    let Some(extracted) = state.extracted.take() else {
        note_unavailable_input(state, Stage::Quantitative, "extracted data");
        state.quantitative = Some(QuantitativeReport {
            flags: Vec::new(),
            math_verified: false,
        });
        return Ok(());
    };

    let mut flags = Vec::new();
    let mut parse_trouble = Vec::new();

    for kind in DocumentKind::ALL {
        if let Some(doc) = extracted.get(kind) {
            verify_document(doc, &mut flags, &mut parse_trouble);
        }
    }

    let math_verified = !flags.iter().any(|f: &QuantFlag| {
        matches!(
            f.kind,
            QuantFlagKind::LineArithmetic
                | QuantFlagKind::DocTotalArithmetic
                | QuantFlagKind::TaxComposition
        )
    }) && parse_trouble.is_empty();

    cross_document_checks(&extracted, &mut flags);

    debug!(
        session = %state.session_id,
        flags = flags.len(),
        math_verified,
        "quantitative verification done"
    );

    for message in parse_trouble {
        state.push_error(Stage::Quantitative, ErrorKind::ParseError, message, false);
    }
    state.extracted = Some(extracted);
    state.quantitative = Some(QuantitativeReport {
        flags,
        math_verified,
    });
    Ok(())
}

fn verify_document(
    doc: &ExtractedDocument,
    flags: &mut Vec<QuantFlag>,
    parse_trouble: &mut Vec<String>,
) {
    let mut line_sum = Decimal::ZERO;

    for (idx, line) in doc.line_items.iter().enumerate() {
        match line.quantity.value.mul(line.unit_price.value) {
            Ok(recomputed) => {
                if recomputed.differs_by(line.total.value, MONEY_ABS_TOL) {
                    flags.push(QuantFlag {
                        kind: QuantFlagKind::LineArithmetic,
                        document: Some(doc.kind),
                        line: Some(idx),
                        detail: format!(
                            "{} line {idx}: {} x {} = {}, document claims {}",
                            doc.kind.as_str(),
                            line.quantity.value,
                            line.unit_price.value.to_string_with_scale(2),
                            recomputed.to_string_with_scale(2),
                            line.total.value.to_string_with_scale(2),
                        ),
                    });
                }
            }
            Err(e) => parse_trouble.push(format!(
                "{} line {idx}: could not recompute total: {e}",
                doc.kind.as_str()
            )),
        }
        match line_sum.add(line.total.value) {
            Ok(sum) => line_sum = sum,
            Err(e) => parse_trouble.push(format!(
                "{} line {idx}: total overflows document sum: {e}",
                doc.kind.as_str()
            )),
        }
    }

    // Line totals roll up into the subtotal where one is stated; documents
    // without a subtotal roll straight into the grand total.
    let rollup_target = if doc.subtotal.value.is_zero() && !doc.grand_total.value.is_zero() {
        ("grand total", doc.grand_total.value)
    } else {
        ("subtotal", doc.subtotal.value)
    };
    if !doc.line_items.is_empty() && line_sum.differs_by(rollup_target.1, MONEY_ABS_TOL) {
        flags.push(QuantFlag {
            kind: QuantFlagKind::DocTotalArithmetic,
            document: Some(doc.kind),
            line: None,
            detail: format!(
                "{}: line totals sum to {}, {} is {}",
                doc.kind.as_str(),
                line_sum.to_string_with_scale(2),
                rollup_target.0,
                rollup_target.1.to_string_with_scale(2),
            ),
        });
    }

    match doc.subtotal.value.add(doc.tax.value) {
        Ok(composed) => {
            if composed.differs_by(doc.grand_total.value, MONEY_ABS_TOL) {
                flags.push(QuantFlag {
                    kind: QuantFlagKind::TaxComposition,
                    document: Some(doc.kind),
                    line: None,
                    detail: format!(
                        "{}: subtotal {} + tax {} = {}, grand total claims {}",
                        doc.kind.as_str(),
                        doc.subtotal.value.to_string_with_scale(2),
                        doc.tax.value.to_string_with_scale(2),
                        composed.to_string_with_scale(2),
                        doc.grand_total.value.to_string_with_scale(2),
                    ),
                });
            }
        }
        Err(e) => parse_trouble.push(format!(
            "{}: subtotal + tax overflowed: {e}",
            doc.kind.as_str()
        )),
    }
}

fn cross_document_checks(
    extracted: &crate::models::ExtractedData,
    flags: &mut Vec<QuantFlag>,
) {
    // Short delivery: PO quantity vs what the GRN acknowledges.
    if let (Some(po), Some(grn)) = (&extracted.po, &extracted.grn) {
        for (po_idx, po_line) in po.line_items.iter().enumerate() {
            if let Some((grn_idx, _)) = matching::best_match(po_line, &grn.line_items) {
                let grn_line = &grn.line_items[grn_idx];
                if grn_line.quantity.value < po_line.quantity.value {
                    flags.push(QuantFlag {
                        kind: QuantFlagKind::ShortDelivery,
                        document: Some(DocumentKind::Grn),
                        line: Some(grn_idx),
                        detail: format!(
                            "PO line {po_idx} ordered {}, GRN received {}",
                            po_line.quantity.value, grn_line.quantity.value
                        ),
                    });
                }
            }
        }
    }

    // Overbilling: invoiced quantity vs what was actually received.
    if let (Some(grn), Some(invoice)) = (&extracted.grn, &extracted.invoice) {
        for (grn_idx, grn_line) in grn.line_items.iter().enumerate() {
            if let Some((inv_idx, _)) = matching::best_match(grn_line, &invoice.line_items) {
                let inv_line = &invoice.line_items[inv_idx];
                if inv_line.quantity.value > grn_line.quantity.value {
                    flags.push(QuantFlag {
                        kind: QuantFlagKind::Overbilling,
                        document: Some(DocumentKind::Invoice),
                        line: Some(inv_idx),
                        detail: format!(
                            "GRN line {grn_idx} received {}, invoice bills {}",
                            grn_line.quantity.value, inv_line.quantity.value
                        ),
                    });
                }
            }
        }
    }

    // Price deviation: invoiced unit price vs the agreed PO price, 0.1%
    // relative band.
    if let (Some(po), Some(invoice)) = (&extracted.po, &extracted.invoice) {
        for (po_idx, po_line) in po.line_items.iter().enumerate() {
            if let Some((inv_idx, _)) = matching::best_match(po_line, &invoice.line_items) {
                let inv_line = &invoice.line_items[inv_idx];
                if !po_line.unit_price.value.is_zero()
                    && !inv_line
                        .unit_price
                        .value
                        .within_relative(po_line.unit_price.value, PRICE_REL_TOL)
                {
                    flags.push(QuantFlag {
                        kind: QuantFlagKind::PriceDeviation,
                        document: Some(DocumentKind::Invoice),
                        line: Some(inv_idx),
                        detail: format!(
                            "PO line {po_idx} agreed {}, invoice charges {}",
                            po_line.unit_price.value.to_string_with_scale(2),
                            inv_line.unit_price.value.to_string_with_scale(2)
                        ),
                    });
                }
            }
        }
    }
}
