//! Extraction Agent
//!
//! Converts the three parsed documents into canonical structured form with a
//! spatial citation on every scalar. The documents are processed in
//! parallel; the router's global semaphore bounds the resulting outbound
//! LLM calls.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::agents::PipelineDeps;
use crate::citations::{bind_literal, normalize_numeric, page_exists, CitationReport};
use crate::decimal::Decimal;
use crate::matching;
use crate::models::{
    CitationRef, Document, DocumentChunk, DocumentKind, ErrorKind, ExtractedData,
    ExtractedDocument, ExtractedLineItem, ExtractedValue, ProgressEvent, Stage,
};
use crate::router::CompletionRequest;
use crate::state::PipelineState;

/// Chunks pulled from the vector store before re-ranking.
const RERANK_POOL: usize = 10;

/// Chunks kept after re-ranking.
const RERANK_KEEP: usize = 5;

const EXTRACTION_SYSTEM_PROMPT: &str = "You are a financial document extraction engine. \
    Read the provided document excerpts and return ONLY a JSON object matching the \
    requested schema. Every numeric value must be returned as a string exactly as \
    printed in the document, without rounding or reformatting.";

fn probe_for(kind: DocumentKind) -> &'static str {
    match kind {
        DocumentKind::Po => "purchase order vendor number items total",
        DocumentKind::Grn => "goods receipt vendor number items received total",
        DocumentKind::Invoice => "vendor number items total",
    }
}

pub fn neutral_extraction_json() -> String {
    r#"{"vendor_name":"","document_number":"","document_date":"","currency":"","line_items":[],"subtotal":"0.00","tax":"0.00","grand_total":"0.00"}"#
        .to_string()
}

struct DocumentOutcome {
    document: Arc<Document>,
    extracted: ExtractedDocument,
    citations: CitationReport,
    degraded: bool,
    unresolved_warnings: Vec<String>,
}

pub async fn run(deps: &PipelineDeps, state: &mut PipelineState) -> super::StageResult {
    let session_id = state.session_id.clone();
    let futures = DocumentKind::ALL.map(|kind| {
        let document_id = state.document_id_for(kind).to_string();
        let session_id = session_id.clone();
        async move {
            deps.bus.publish(
                &session_id,
                ProgressEvent::AgentProgress {
                    stage: Stage::Extraction,
                    message: format!("extracting {}", kind.as_str()),
                },
            );
            (kind, extract_document(deps, kind, &document_id).await)
        }
    });

    let results = join_all(futures).await;

    let mut extracted = ExtractedData::default();
    let mut citations = CitationReport::default();
    let mut any_degraded = false;

    for (kind, result) in results {
        match result {
            Ok(outcome) => {
                state.documents.set(kind, outcome.document);
                extracted.set(kind, outcome.extracted);
                citations.merge(outcome.citations);
                any_degraded |= outcome.degraded;
                for warning in outcome.unresolved_warnings {
                    state.push_error(
                        Stage::Extraction,
                        ErrorKind::UnresolvedCitation,
                        warning,
                        false,
                    );
                }
            }
            Err(e) => {
                warn!(kind = kind.as_str(), error = %e, "document extraction failed");
                state.push_error(
                    Stage::Extraction,
                    classify_extraction_error(&e),
                    format!("{} extraction failed: {e:#}", kind.as_str()),
                    false,
                );
            }
        }
    }

    if any_degraded {
        state.push_error(
            Stage::Extraction,
            ErrorKind::UpstreamUnavailable,
            "extraction served by deterministic fallback",
            false,
        );
    }

    state.extracted = Some(extracted);
    state.citations = Some(citations);
    Ok(())
}

pub(crate) fn classify_extraction_error(error: &anyhow::Error) -> ErrorKind {
    if error.downcast_ref::<crate::decimal::DecimalError>().is_some() {
        ErrorKind::ParseError
    } else if format!("{error:#}").contains("json") {
        ErrorKind::ParseError
    } else {
        ErrorKind::UpstreamUnavailable
    }
}

async fn extract_document(
    deps: &PipelineDeps,
    kind: DocumentKind,
    document_id: &str,
) -> Result<DocumentOutcome> {
    let document = Arc::new(
        deps.documents
            .fetch_parsed(document_id)
            .await
            .with_context(|| format!("fetch parsed {document_id}"))?,
    );

    let probe = probe_for(kind);
    let pool = match deps.vectors.retrieve_chunks(document_id, probe, RERANK_POOL).await {
        Ok(chunks) => chunks,
        Err(e) => {
            // The document carries its own chunks; retrieval is an
            // optimization, not a dependency.
            debug!(document = document_id, error = %e, "vector store miss, using raw chunks");
            document.chunks.iter().take(RERANK_POOL).cloned().collect()
        }
    };
    let selected = rerank(probe, pool);

    let request = CompletionRequest {
        system: EXTRACTION_SYSTEM_PROMPT.to_string(),
        prompt: build_prompt(kind, &selected),
        temperature: 0.0,
        max_tokens: 1500,
        json_mode: true,
        neutral_response: neutral_extraction_json(),
    };
    let outcome = deps
        .router
        .complete(&request)
        .await
        .context("extraction completion")?;

    let raw: RawExtraction =
        serde_json::from_str(&outcome.value).context("extraction json did not match schema")?;

    let mut citations = CitationReport::default();
    let mut unresolved_warnings = Vec::new();
    let mut bind = |field: &str, literal: &str| -> CitationRef {
        let mut citation = bind_literal(&document, literal);
        // A citation pointing past the last page is worse than none.
        if let Some(resolved) = citation.citation().copied() {
            if !page_exists(&document, &resolved) {
                citation = CitationRef::Unresolved;
            }
        }
        if !citation.is_resolved() && !literal.trim().is_empty() {
            unresolved_warnings.push(format!(
                "{}: no source chunk contains {:?} ({})",
                document_id, literal, field
            ));
        }
        citations.record(document_id, field, literal, citation);
        citation
    };

    let mut line_items = Vec::with_capacity(raw.line_items.len());
    for (idx, line) in raw.line_items.iter().enumerate() {
        line_items.push(ExtractedLineItem {
            description: line.description.trim().to_string(),
            part_number: line
                .part_number
                .as_ref()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
            quantity: parse_value(&line.quantity, &format!("line[{idx}].quantity"), &mut bind)?,
            unit_price: parse_value(
                &line.unit_price,
                &format!("line[{idx}].unit_price"),
                &mut bind,
            )?,
            total: parse_value(&line.total, &format!("line[{idx}].total"), &mut bind)?,
        });
    }

    let extracted = ExtractedDocument {
        document_id: document_id.to_string(),
        kind,
        vendor_name: raw.vendor_name.trim().to_string(),
        document_number: raw.document_number.trim().to_string(),
        document_date: raw.document_date.trim().to_string(),
        currency: raw.currency.trim().to_string(),
        line_items,
        subtotal: parse_value(&raw.subtotal, "subtotal", &mut bind)?,
        tax: parse_value(&raw.tax, "tax", &mut bind)?,
        grand_total: parse_value(&raw.grand_total, "grand_total", &mut bind)?,
    };
    drop(bind);

    debug!(
        document = document_id,
        kind = kind.as_str(),
        lines = extracted.line_items.len(),
        unresolved = citations.unresolved,
        "document extracted"
    );

    Ok(DocumentOutcome {
        document,
        extracted,
        citations,
        degraded: outcome.degraded,
        unresolved_warnings,
    })
}

/// Re-rank retrieved chunks against the probe with a lexical relevance
/// score, keeping the store's ordering as the tie-break, and take the top 5.
pub(crate) fn rerank(probe: &str, pool: Vec<DocumentChunk>) -> Vec<DocumentChunk> {
    let mut scored: Vec<(u8, usize, DocumentChunk)> = pool
        .into_iter()
        .enumerate()
        .map(|(idx, chunk)| (matching::score(probe, &chunk.text), idx, chunk))
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    scored
        .into_iter()
        .take(RERANK_KEEP)
        .map(|(_, _, chunk)| chunk)
        .collect()
}

fn build_prompt(kind: DocumentKind, chunks: &[DocumentChunk]) -> String {
    let mut prompt = format!(
        "DOCUMENT KIND: {}\n\nExcerpts (most relevant first):\n",
        kind.as_str()
    );
    for (idx, chunk) in chunks.iter().enumerate() {
        prompt.push_str(&format!("--- excerpt {idx} ---\n{}\n", chunk.text));
    }
    prompt.push_str(
        "\nReturn a JSON object with exactly these keys:\n\
         {\"vendor_name\": string, \"document_number\": string, \"document_date\": string, \
         \"currency\": string, \"line_items\": [{\"description\": string, \
         \"part_number\": string or null, \"quantity\": string, \"unit_price\": string, \
         \"total\": string}], \"subtotal\": string, \"tax\": string, \
         \"grand_total\": string}\n",
    );
    prompt
}

/// Parse one numeric literal through the decimal kernel and bind its
/// citation. Normalization strips presentation noise only; precision loss is
/// still an error.
fn parse_value(
    literal: &str,
    field: &str,
    bind: &mut impl FnMut(&str, &str) -> CitationRef,
) -> Result<ExtractedValue> {
    let normalized = normalize_numeric(literal);
    let value = Decimal::parse(&normalized)
        .with_context(|| format!("field {field} value {literal:?}"))?;
    let citation = bind(field, literal);
    Ok(ExtractedValue {
        raw: literal.to_string(),
        value,
        citation,
    })
}

#[derive(Debug, serde::Deserialize)]
struct RawExtraction {
    #[serde(default)]
    vendor_name: String,
    #[serde(default)]
    document_number: String,
    #[serde(default)]
    document_date: String,
    #[serde(default)]
    currency: String,
    #[serde(default)]
    line_items: Vec<RawLineItem>,
    #[serde(default = "zero_literal")]
    subtotal: String,
    #[serde(default = "zero_literal")]
    tax: String,
    #[serde(default = "zero_literal")]
    grand_total: String,
}

#[derive(Debug, serde::Deserialize)]
struct RawLineItem {
    #[serde(default)]
    description: String,
    #[serde(default)]
    part_number: Option<String>,
    #[serde(default = "zero_literal")]
    quantity: String,
    #[serde(default = "zero_literal")]
    unit_price: String,
    #[serde(default = "zero_literal")]
    total: String,
}

fn zero_literal() -> String {
    "0".to_string()
}
