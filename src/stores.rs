//! External collaborator interfaces.
//!
//! The pipeline consumes already-parsed documents, pre-indexed chunks,
//! alert feedback, and invoice history through these traits; real adapters
//! (document DB, vector DB, session DB) live outside the core. The in-memory
//! implementations here back the CLI runner and the test suites.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::matching;
use crate::models::{AlertFeedback, DivergenceRecord, Document, DocumentChunk};

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn fetch_parsed(&self, document_id: &str) -> Result<Document>;
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Top-k chunks for a document ranked against a retrieval probe.
    async fn retrieve_chunks(
        &self,
        document_id: &str,
        probe: &str,
        top_k: usize,
    ) -> Result<Vec<DocumentChunk>>;
}

#[async_trait]
pub trait FeedbackStore: Send + Sync {
    /// Most recent divergence feedback for a tenant, newest last.
    async fn recent(&self, tenant_id: &str, window: usize) -> Result<Vec<AlertFeedback>>;
}

#[async_trait]
pub trait InvoiceHistoryStore: Send + Sync {
    /// Invoice numbers previously seen for a tenant/vendor pair. Used as the
    /// duplicate-invoice probe.
    async fn recent_invoice_numbers(&self, tenant_id: &str, vendor: &str) -> Result<Vec<String>>;
}

#[async_trait]
pub trait DivergenceSink: Send + Sync {
    async fn record(&self, record: &DivergenceRecord) -> Result<()>;
}

// =============================================================================
// IN-MEMORY IMPLEMENTATIONS
// =============================================================================

#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<String, Arc<Document>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document: Document) {
        self.documents
            .write()
            .insert(document.document_id.clone(), Arc::new(document));
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn fetch_parsed(&self, document_id: &str) -> Result<Document> {
        self.documents
            .read()
            .get(document_id)
            .map(|d| (**d).clone())
            .ok_or_else(|| anyhow!("document {document_id} not found"))
    }
}

/// Serves chunks straight off the stored documents, ranked by lexical probe
/// overlap. Stands in for the real vector index.
pub struct InMemoryVectorStore {
    documents: Arc<InMemoryDocumentStore>,
}

impl InMemoryVectorStore {
    pub fn new(documents: Arc<InMemoryDocumentStore>) -> Self {
        Self { documents }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn retrieve_chunks(
        &self,
        document_id: &str,
        probe: &str,
        top_k: usize,
    ) -> Result<Vec<DocumentChunk>> {
        let document = self.documents.fetch_parsed(document_id).await?;
        let mut scored: Vec<(u8, usize, DocumentChunk)> = document
            .chunks
            .iter()
            .enumerate()
            .map(|(idx, chunk)| {
                let mut chunk = chunk.clone();
                let score = matching::score(probe, &chunk.text);
                chunk.score = score as f64 / 100.0;
                (score, idx, chunk)
            })
            .collect();
        // Highest score first; original position breaks ties so the ranking
        // is stable across runs.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(_, _, chunk)| chunk)
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryFeedbackStore {
    feedback: RwLock<HashMap<String, Vec<AlertFeedback>>>,
}

impl InMemoryFeedbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, tenant_id: &str, entry: AlertFeedback) {
        self.feedback
            .write()
            .entry(tenant_id.to_string())
            .or_default()
            .push(entry);
    }
}

#[async_trait]
impl FeedbackStore for InMemoryFeedbackStore {
    async fn recent(&self, tenant_id: &str, window: usize) -> Result<Vec<AlertFeedback>> {
        let feedback = self.feedback.read();
        let entries = feedback.get(tenant_id).cloned().unwrap_or_default();
        let skip = entries.len().saturating_sub(window);
        Ok(entries.into_iter().skip(skip).collect())
    }
}

#[derive(Default)]
pub struct InMemoryInvoiceHistory {
    // (tenant, vendor lowercased) -> invoice numbers
    history: RwLock<HashMap<(String, String), Vec<String>>>,
}

impl InMemoryInvoiceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, tenant_id: &str, vendor: &str, invoice_number: &str) {
        self.history
            .write()
            .entry((tenant_id.to_string(), vendor.to_lowercase()))
            .or_default()
            .push(invoice_number.to_string());
    }
}

#[async_trait]
impl InvoiceHistoryStore for InMemoryInvoiceHistory {
    async fn recent_invoice_numbers(&self, tenant_id: &str, vendor: &str) -> Result<Vec<String>> {
        Ok(self
            .history
            .read()
            .get(&(tenant_id.to_string(), vendor.to_lowercase()))
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryDivergenceSink {
    records: RwLock<Vec<DivergenceRecord>>,
}

impl InMemoryDivergenceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DivergenceRecord> {
        self.records.read().clone()
    }
}

#[async_trait]
impl DivergenceSink for InMemoryDivergenceSink {
    async fn record(&self, record: &DivergenceRecord) -> Result<()> {
        self.records.write().push(record.clone());
        Ok(())
    }
}
