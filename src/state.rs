//! Shared pipeline state.
//!
//! One `PipelineState` per reconciliation session. The supervisor structurally
//! enforces single-writer-by-stage: only the active stage mutates the record,
//! and a slot is read-only once its stage has written it. The agent trace and
//! the error list are append-only: never reordered, never truncated.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::citations::CitationReport;
use crate::models::{
    ComplianceReport, DivergenceMetrics, Document, DocumentKind, ErrorKind, ExtractedData,
    QuantitativeReport, SessionStatus, Stage, Verdict,
};
use crate::workpaper::Workpaper;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageOutcome {
    Completed,
    Skipped,
    Timeout,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: StageOutcome,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageError {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
    pub fatal: bool,
}

/// Parsed source documents fetched during extraction. Wrapped in `Arc` so the
/// parallel per-document tasks and later stages share them without copying.
#[derive(Debug, Clone, Default)]
pub struct DocumentSet {
    pub po: Option<Arc<Document>>,
    pub grn: Option<Arc<Document>>,
    pub invoice: Option<Arc<Document>>,
}

impl DocumentSet {
    pub fn get(&self, kind: DocumentKind) -> Option<&Arc<Document>> {
        match kind {
            DocumentKind::Po => self.po.as_ref(),
            DocumentKind::Grn => self.grn.as_ref(),
            DocumentKind::Invoice => self.invoice.as_ref(),
        }
    }

    pub fn set(&mut self, kind: DocumentKind, doc: Arc<Document>) {
        match kind {
            DocumentKind::Po => self.po = Some(doc),
            DocumentKind::Grn => self.grn = Some(doc),
            DocumentKind::Invoice => self.invoice = Some(doc),
        }
    }
}

#[derive(Debug)]
pub struct PipelineState {
    pub session_id: String,
    pub tenant_id: String,
    pub po_id: String,
    pub grn_id: String,
    pub invoice_id: String,

    pub documents: DocumentSet,

    // Per-stage slots. Written once by their stage, then read-only.
    pub extracted: Option<ExtractedData>,
    pub citations: Option<CitationReport>,
    pub quantitative: Option<QuantitativeReport>,
    pub compliance: Option<ComplianceReport>,
    pub divergence: Option<DivergenceMetrics>,
    pub verdict: Option<Verdict>,
    pub workpaper: Option<Workpaper>,

    pub agent_trace: Vec<TraceEntry>,
    pub errors: Vec<StageError>,

    pub current_stage: Stage,
    pub next_action: Stage,

    pub started_at: DateTime<Utc>,
}

impl PipelineState {
    pub fn new(
        session_id: impl Into<String>,
        tenant_id: impl Into<String>,
        po_id: impl Into<String>,
        grn_id: impl Into<String>,
        invoice_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            tenant_id: tenant_id.into(),
            po_id: po_id.into(),
            grn_id: grn_id.into(),
            invoice_id: invoice_id.into(),
            documents: DocumentSet::default(),
            extracted: None,
            citations: None,
            quantitative: None,
            compliance: None,
            divergence: None,
            verdict: None,
            workpaper: None,
            agent_trace: Vec::new(),
            errors: Vec::new(),
            current_stage: Stage::Extraction,
            next_action: Stage::Extraction,
            started_at: Utc::now(),
        }
    }

    pub fn document_id_for(&self, kind: DocumentKind) -> &str {
        match kind {
            DocumentKind::Po => &self.po_id,
            DocumentKind::Grn => &self.grn_id,
            DocumentKind::Invoice => &self.invoice_id,
        }
    }

    pub fn record_trace(
        &mut self,
        stage: Stage,
        started_at: DateTime<Utc>,
        outcome: StageOutcome,
    ) {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        self.agent_trace.push(TraceEntry {
            stage,
            started_at,
            finished_at,
            outcome,
            duration_ms,
        });
    }

    pub fn push_error(
        &mut self,
        stage: Stage,
        kind: ErrorKind,
        message: impl Into<String>,
        fatal: bool,
    ) {
        self.errors.push(StageError {
            stage,
            kind,
            message: message.into(),
            fatal,
        });
    }

    pub fn has_error(&self, kind: ErrorKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }

    pub fn has_fatal_error(&self) -> bool {
        self.errors.iter().any(|e| e.fatal)
    }

    pub fn stage_errored(&self, stage: Stage) -> bool {
        self.errors.iter().any(|e| e.stage == stage)
    }

    pub fn extracted_count(&self) -> usize {
        self.extracted
            .as_ref()
            .map(|e| e.present_count())
            .unwrap_or(0)
    }

    pub fn divergence_alerted(&self) -> bool {
        self.divergence
            .as_ref()
            .map(|d| d.alert_triggered)
            .unwrap_or(false)
    }

    /// Freeze into the session's authoritative persisted record.
    pub fn into_record(self, status: SessionStatus) -> SessionRecord {
        SessionRecord {
            id: self.session_id,
            tenant_id: self.tenant_id,
            po_id: self.po_id,
            grn_id: self.grn_id,
            invoice_id: self.invoice_id,
            status,
            verdict: self.verdict,
            workpaper: self.workpaper,
            agent_trace: self.agent_trace,
            errors: self.errors,
            started_at: self.started_at,
            completed_at: Utc::now(),
        }
    }
}

/// Authoritative per-session record, persisted by the session store. Carries
/// the composed workpaper so downstream storage can file it alongside the
/// verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub tenant_id: String,
    pub po_id: String,
    pub grn_id: String,
    pub invoice_id: String,
    pub status: SessionStatus,
    pub verdict: Option<Verdict>,
    pub workpaper: Option<Workpaper>,
    pub agent_trace: Vec<TraceEntry>,
    pub errors: Vec<StageError>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}
