//! Core domain types shared across the pipeline: parsed documents, spatial
//! citations, stage reports, the verdict, progress events, and the persisted
//! record shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::Decimal;

/// Document roles in a three-way match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentKind {
    #[serde(rename = "PO")]
    Po,
    #[serde(rename = "GRN")]
    Grn,
    #[serde(rename = "INVOICE")]
    Invoice,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 3] = [DocumentKind::Po, DocumentKind::Grn, DocumentKind::Invoice];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Po => "PO",
            DocumentKind::Grn => "GRN",
            DocumentKind::Invoice => "INVOICE",
        }
    }
}

/// Normalized page-relative bounding box, coordinates in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

/// A pixel-region reference into a source document. Pages are 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub page: u32,
    pub bbox: BoundingBox,
}

/// A citation slot that may have failed to resolve. Unresolved values are
/// carried into the verdict as warnings, never dropped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "UPPERCASE")]
pub enum CitationRef {
    Resolved { citation: Citation },
    Unresolved,
}

impl CitationRef {
    pub fn is_resolved(&self) -> bool {
        matches!(self, CitationRef::Resolved { .. })
    }

    pub fn citation(&self) -> Option<&Citation> {
        match self {
            CitationRef::Resolved { citation } => Some(citation),
            CitationRef::Unresolved => None,
        }
    }
}

/// A pre-chunked span of document content with its spatial citation and the
/// retrieval score assigned by the vector store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub text: String,
    pub citation: Citation,
    pub score: f64,
}

/// An exact amount paired with the citation that evidences it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CitedAmount {
    pub value: Decimal,
    pub citation: Citation,
}

/// One line of a parsed source document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub claimed_total: Decimal,
    #[serde(default)]
    pub part_number: Option<String>,
    pub citation: Citation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentTotals {
    pub subtotal: CitedAmount,
    pub tax: CitedAmount,
    pub grand_total: CitedAmount,
}

/// A parsed source document, immutable for the session. Chunked content is
/// carried along so citation binding can scan the same spans the vector
/// store indexed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub kind: DocumentKind,
    pub currency: String,
    pub vendor_name: String,
    pub document_number: String,
    pub document_date: String,
    pub page_count: u32,
    pub line_items: Vec<LineItem>,
    pub totals: DocumentTotals,
    pub chunks: Vec<DocumentChunk>,
}

// =============================================================================
// EXTRACTION OUTPUT
// =============================================================================

/// A scalar pulled out of a document by the extraction agent: the literal as
/// returned by the model, the exact parsed value, and its evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedValue {
    pub raw: String,
    pub value: Decimal,
    pub citation: CitationRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedLineItem {
    pub description: String,
    #[serde(default)]
    pub part_number: Option<String>,
    pub quantity: ExtractedValue,
    pub unit_price: ExtractedValue,
    pub total: ExtractedValue,
}

/// Canonical structured form of one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub document_id: String,
    pub kind: DocumentKind,
    pub vendor_name: String,
    pub document_number: String,
    pub document_date: String,
    pub currency: String,
    pub line_items: Vec<ExtractedLineItem>,
    pub subtotal: ExtractedValue,
    pub tax: ExtractedValue,
    pub grand_total: ExtractedValue,
}

/// Extraction slot: explicit optional per-document slots so a partial
/// extraction (2 of 3 documents) is representable without sentinel values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedData {
    pub po: Option<ExtractedDocument>,
    pub grn: Option<ExtractedDocument>,
    pub invoice: Option<ExtractedDocument>,
}

impl ExtractedData {
    pub fn get(&self, kind: DocumentKind) -> Option<&ExtractedDocument> {
        match kind {
            DocumentKind::Po => self.po.as_ref(),
            DocumentKind::Grn => self.grn.as_ref(),
            DocumentKind::Invoice => self.invoice.as_ref(),
        }
    }

    pub fn set(&mut self, kind: DocumentKind, doc: ExtractedDocument) {
        match kind {
            DocumentKind::Po => self.po = Some(doc),
            DocumentKind::Grn => self.grn = Some(doc),
            DocumentKind::Invoice => self.invoice = Some(doc),
        }
    }

    pub fn present_count(&self) -> usize {
        [self.po.is_some(), self.grn.is_some(), self.invoice.is_some()]
            .iter()
            .filter(|p| **p)
            .count()
    }
}

// =============================================================================
// STAGE REPORTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuantFlagKind {
    LineArithmetic,
    DocTotalArithmetic,
    TaxComposition,
    ShortDelivery,
    Overbilling,
    PriceDeviation,
}

impl QuantFlagKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantFlagKind::LineArithmetic => "LINE_ARITHMETIC",
            QuantFlagKind::DocTotalArithmetic => "DOC_TOTAL_ARITHMETIC",
            QuantFlagKind::TaxComposition => "TAX_COMPOSITION",
            QuantFlagKind::ShortDelivery => "SHORT_DELIVERY",
            QuantFlagKind::Overbilling => "OVERBILLING",
            QuantFlagKind::PriceDeviation => "PRICE_DEVIATION",
        }
    }

    /// Flags that force a MISMATCH verdict on their own.
    pub fn is_hard(&self) -> bool {
        matches!(
            self,
            QuantFlagKind::ShortDelivery
                | QuantFlagKind::Overbilling
                | QuantFlagKind::PriceDeviation
                | QuantFlagKind::DocTotalArithmetic
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantFlag {
    pub kind: QuantFlagKind,
    #[serde(default)]
    pub document: Option<DocumentKind>,
    #[serde(default)]
    pub line: Option<usize>,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuantitativeReport {
    pub flags: Vec<QuantFlag>,
    /// True when every in-document arithmetic check passed.
    pub math_verified: bool,
}

impl QuantitativeReport {
    pub fn has(&self, kind: QuantFlagKind) -> bool {
        self.flags.iter().any(|f| f.kind == kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceReport {
    /// 0 (clean) to 10 (reject on sight). Clamped on ingestion.
    pub risk_score: f64,
    pub flags: Vec<String>,
    pub policy_violations: Vec<String>,
    /// Claims the model made that the quantitative report did not
    /// corroborate; excluded from flags but kept for the workpaper.
    #[serde(default)]
    pub uncorroborated: Vec<String>,
}

/// One reproducible shadow-stream perturbation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerturbationRecord {
    pub literal: String,
    pub perturbed: String,
    pub factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivergenceMetrics {
    pub similarity: f64,
    pub threshold: f64,
    pub alert_triggered: bool,
    #[serde(default)]
    pub reason: Option<String>,
    pub perturbations: Vec<PerturbationRecord>,
    /// True when a reasoning vector came from the deterministic fallback.
    pub router_degraded: bool,
    pub primary_digest: String,
    pub shadow_digest: String,
}

// =============================================================================
// VERDICT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    FullMatch,
    PartialMatch,
    Mismatch,
    Exception,
    DivergenceAlert,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::FullMatch => "FULL_MATCH",
            OverallStatus::PartialMatch => "PARTIAL_MATCH",
            OverallStatus::Mismatch => "MISMATCH",
            OverallStatus::Exception => "EXCEPTION",
            OverallStatus::DivergenceAlert => "DIVERGENCE_ALERT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    Approve,
    Hold,
    Reject,
    Escalate,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Approve => "APPROVE",
            Recommendation::Hold => "HOLD",
            Recommendation::Reject => "REJECT",
            Recommendation::Escalate => "ESCALATE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripleStatus {
    FullMatch,
    PartialMatch,
    Mismatch,
}

/// One row of the cross-document match table. Indices are per-document line
/// positions; an absent index means that side had no acceptable match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItemMatch {
    pub po_index: Option<usize>,
    pub grn_index: Option<usize>,
    pub invoice_index: Option<usize>,
    pub description_score: u8,
    pub quantity_delta: Decimal,
    pub price_delta: Decimal,
    pub status: TripleStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub overall_status: OverallStatus,
    pub confidence: f64,
    pub line_item_matches: Vec<LineItemMatch>,
    pub discrepancy_summary: Vec<String>,
    pub recommendation: Recommendation,
}

impl Verdict {
    /// Internal consistency gate. A violation here is CONTRACT_VIOLATION and
    /// aborts the session.
    pub fn validate(&self) -> Result<(), String> {
        if self.overall_status == OverallStatus::DivergenceAlert
            && self.recommendation != Recommendation::Escalate
        {
            return Err(format!(
                "DIVERGENCE_ALERT verdict must recommend ESCALATE, got {:?}",
                self.recommendation
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence) || !self.confidence.is_finite() {
            return Err(format!("confidence out of range: {}", self.confidence));
        }
        if self.discrepancy_summary.len() > 5 {
            return Err(format!(
                "discrepancy summary has {} findings (max 5)",
                self.discrepancy_summary.len()
            ));
        }
        Ok(())
    }
}

// =============================================================================
// ERRORS, STATUSES, EVENTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ParseError,
    UpstreamUnavailable,
    Timeout,
    ContractViolation,
    Cancelled,
    VectorDegenerate,
    UnresolvedCitation,
    UnavailableInput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Processing,
    Matched,
    DiscrepancyFound,
    DivergenceAlert,
    Exception,
    Failed,
    Cancelled,
}

/// Pipeline stages. The supervisor drives these strictly in order; `End`
/// freezes the state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extraction,
    Quantitative,
    Compliance,
    DivergenceGuard,
    Reconciliation,
    Drafting,
    End,
}

impl Stage {
    /// Execution order, `End` excluded.
    pub const PIPELINE: [Stage; 6] = [
        Stage::Extraction,
        Stage::Quantitative,
        Stage::Compliance,
        Stage::DivergenceGuard,
        Stage::Reconciliation,
        Stage::Drafting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Quantitative => "quantitative",
            Stage::Compliance => "compliance",
            Stage::DivergenceGuard => "divergence_guard",
            Stage::Reconciliation => "reconciliation",
            Stage::Drafting => "drafting",
            Stage::End => "end",
        }
    }

    /// The stage that follows in the default (error-free) routing.
    pub fn next(&self) -> Stage {
        match self {
            Stage::Extraction => Stage::Quantitative,
            Stage::Quantitative => Stage::Compliance,
            Stage::Compliance => Stage::DivergenceGuard,
            Stage::DivergenceGuard => Stage::Reconciliation,
            Stage::Reconciliation => Stage::Drafting,
            Stage::Drafting => Stage::End,
            Stage::End => Stage::End,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events fanned out to progress subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    WorkflowStarted {
        total_stages: usize,
    },
    AgentStarted {
        stage: Stage,
        message: String,
    },
    AgentProgress {
        stage: Stage,
        message: String,
    },
    AgentCompleted {
        stage: Stage,
        duration_ms: u64,
    },
    DivergenceAlert {
        similarity: f64,
        threshold: f64,
        perturbation_summary: String,
    },
    DivergenceClear {
        similarity: f64,
    },
    WorkflowComplete {
        status: SessionStatus,
        verdict_summary: String,
    },
    WorkflowError {
        stage: Stage,
        message: String,
    },
    Ping {},
}

impl ProgressEvent {
    /// The terminal event; the bus closes the session channel after it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::WorkflowComplete { .. })
    }
}

/// Envelope delivered to subscribers: every event carries its session and a
/// publish timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEnvelope {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ProgressEvent,
}

// =============================================================================
// FEEDBACK + PERSISTED RECORDS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackOutcome {
    Correct,
    FalsePositive,
    FalseNegative,
}

/// Human feedback on one past divergence decision. The similarity the guard
/// recorded at decision time is carried so threshold re-fitting can replay
/// candidate cutoffs against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertFeedback {
    pub was_alert: bool,
    pub outcome: FeedbackOutcome,
    pub similarity: f64,
}

impl AlertFeedback {
    /// Ground truth implied by the pair (decision, review outcome): was the
    /// reasoning actually divergent?
    pub fn truly_divergent(&self) -> bool {
        match (self.was_alert, self.outcome) {
            (true, FeedbackOutcome::Correct) => true,
            (true, _) => false,
            (false, FeedbackOutcome::FalseNegative) => true,
            (false, _) => false,
        }
    }
}

/// Authoritative divergence audit record, one per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivergenceRecord {
    pub session_id: String,
    pub tenant_id: String,
    pub primary_summary: String,
    pub shadow_summary: String,
    pub similarity: f64,
    pub threshold_used: f64,
    pub alert_triggered: bool,
    pub perturbation_summary: String,
    pub router_degraded: bool,
    pub created_at: DateTime<Utc>,
}
