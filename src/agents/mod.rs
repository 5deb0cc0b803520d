//! The six pipeline agents and their shared plumbing.
//!
//! Every agent takes the mutable `PipelineState`, writes its own slot, and
//! reports failure through the state's error list. Only a
//! CONTRACT_VIOLATION is allowed to abort the session; everything else is
//! recorded and the supervisor routes around it.

pub mod compliance;
pub mod divergence;
pub mod drafting;
pub mod extraction;
pub mod quantitative;
pub mod reconcile;

#[cfg(test)]
mod extraction_tests;

use std::sync::Arc;

use crate::bus::ProgressBus;
use crate::models::{ErrorKind, ExtractedDocument, Stage};
use crate::router::LlmRouter;
use crate::state::PipelineState;
use crate::stores::{DivergenceSink, DocumentStore, InvoiceHistoryStore, VectorStore};
use crate::threshold::AdaptiveThresholdStore;

/// Everything an agent may reach beyond the state record itself.
pub struct PipelineDeps {
    pub router: Arc<LlmRouter>,
    pub bus: Arc<ProgressBus>,
    pub documents: Arc<dyn DocumentStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub thresholds: Arc<AdaptiveThresholdStore>,
    pub invoice_history: Arc<dyn InvoiceHistoryStore>,
    pub divergence_sink: Arc<dyn DivergenceSink>,
}

/// A stage-aborting failure. Anything an agent returns through here ends the
/// session as FAILED.
#[derive(Debug)]
pub struct FatalStageError {
    pub kind: ErrorKind,
    pub message: String,
}

impl FatalStageError {
    pub fn contract(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::ContractViolation,
            message: message.into(),
        }
    }
}

pub type StageResult = Result<(), FatalStageError>;

/// Record that a stage found a required upstream slot empty and is producing
/// best-effort partial output.
pub(crate) fn note_unavailable_input(state: &mut PipelineState, stage: Stage, what: &str) {
    state.push_error(
        stage,
        ErrorKind::UnavailableInput,
        format!("{what} unavailable, producing partial output"),
        false,
    );
}

/// Canonical text rendering of one extracted document. Used for LLM prompts
/// and as the divergence guard's primary context, so the ordering and the
/// two-place money formatting are load-bearing: the rendering must be
/// byte-stable for identical inputs.
pub(crate) fn render_extracted(doc: &ExtractedDocument) -> String {
    let mut out = String::new();
    out.push_str(&format!("document {}\n", doc.kind.as_str()));
    out.push_str(&format!("vendor: {}\n", doc.vendor_name));
    out.push_str(&format!("number: {}\n", doc.document_number));
    out.push_str(&format!("date: {}\n", doc.document_date));
    out.push_str(&format!("currency: {}\n", doc.currency));
    for (idx, item) in doc.line_items.iter().enumerate() {
        out.push_str(&format!(
            "line {}: {} | qty {} | unit {} | total {}\n",
            idx,
            item.description,
            item.quantity.value,
            item.unit_price.value.to_string_with_scale(2),
            item.total.value.to_string_with_scale(2),
        ));
    }
    out.push_str(&format!(
        "subtotal: {}\n",
        doc.subtotal.value.to_string_with_scale(2)
    ));
    out.push_str(&format!("tax: {}\n", doc.tax.value.to_string_with_scale(2)));
    out.push_str(&format!(
        "grand_total: {}\n",
        doc.grand_total.value.to_string_with_scale(2)
    ));
    out
}
