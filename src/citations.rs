//! Citation Binder
//!
//! Associates every extracted scalar with the spatial citation of the chunk
//! that contains its literal. A value the binder cannot place gets an
//! `UNRESOLVED` citation and a warning, never a fabricated region.

use serde::{Deserialize, Serialize};

use crate::models::{Citation, CitationRef, Document};

/// One attempted binding, kept for the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingRecord {
    pub document_id: String,
    pub field: String,
    pub literal: String,
    pub citation: CitationRef,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CitationReport {
    pub bindings: Vec<BindingRecord>,
    pub unresolved: usize,
}

impl CitationReport {
    pub fn merge(&mut self, other: CitationReport) {
        self.unresolved += other.unresolved;
        self.bindings.extend(other.bindings);
    }

    pub fn record(&mut self, document_id: &str, field: &str, literal: &str, citation: CitationRef) {
        if !citation.is_resolved() {
            self.unresolved += 1;
        }
        self.bindings.push(BindingRecord {
            document_id: document_id.to_string(),
            field: field.to_string(),
            literal: literal.to_string(),
            citation,
        });
    }
}

/// Find the citation for a literal: first chunk whose text contains it
/// verbatim, else first chunk that contains it after numeric normalization
/// (grouping and currency markers stripped from both sides).
pub fn bind_literal(document: &Document, literal: &str) -> CitationRef {
    let needle = literal.trim();
    if needle.is_empty() {
        return CitationRef::Unresolved;
    }

    for chunk in &document.chunks {
        if chunk.text.contains(needle) {
            return CitationRef::Resolved {
                citation: chunk.citation,
            };
        }
    }

    let normalized_needle = normalize_numeric(needle);
    if normalized_needle.is_empty() {
        return CitationRef::Unresolved;
    }
    for chunk in &document.chunks {
        if normalize_numeric(&chunk.text).contains(&normalized_needle) {
            return CitationRef::Resolved {
                citation: chunk.citation,
            };
        }
    }

    CitationRef::Unresolved
}

/// True when the citation's page actually exists in the document.
pub fn page_exists(document: &Document, citation: &Citation) -> bool {
    citation.page < document.page_count
}

/// Strip presentation noise from a numeric literal: currency markers,
/// grouping commas, interior whitespace. Digits, sign and decimal point
/// survive unchanged; normalization never rounds.
pub fn normalize_numeric(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '$' | '€' | '£' | ',' | ' ' | '\t'))
        .collect()
}
