//! Chunk re-ranking and extraction error classification tests.

use anyhow::Context;

use crate::agents::extraction::{classify_extraction_error, rerank};
use crate::decimal::Decimal;
use crate::models::{BoundingBox, Citation, DocumentChunk, ErrorKind};

fn chunk(text: &str) -> DocumentChunk {
    DocumentChunk {
        text: text.to_string(),
        citation: Citation {
            page: 0,
            bbox: BoundingBox {
                x0: 0.1,
                y0: 0.2,
                x1: 0.9,
                y1: 0.25,
            },
        },
        score: 0.0,
    }
}

fn texts(chunks: &[DocumentChunk]) -> Vec<&str> {
    chunks.iter().map(|c| c.text.as_str()).collect()
}

// =============================================================================
// RERANK
// =============================================================================

#[test]
fn rerank_orders_by_probe_relevance() {
    let pool = vec![
        chunk("terms and conditions of sale"),
        chunk("vendor number items total 500.00"),
        chunk("page footer"),
        chunk("vendor number"),
    ];
    let ranked = rerank("vendor number items total", pool);
    assert_eq!(texts(&ranked)[0], "vendor number items total 500.00");
    assert_eq!(texts(&ranked)[1], "vendor number");
}

#[test]
fn rerank_keeps_store_order_on_ties() {
    // Equal scores keep the store's ordering, so the ranking is stable
    // across runs.
    let pool = vec![
        chunk("vendor number items A"),
        chunk("vendor number items B"),
    ];
    let ranked = rerank("vendor number items", pool);
    assert_eq!(
        texts(&ranked),
        vec!["vendor number items A", "vendor number items B"]
    );
}

#[test]
fn rerank_takes_top_five_of_the_pool() {
    let mut pool: Vec<DocumentChunk> = (0..9)
        .map(|i| chunk(&format!("boilerplate clause {i}")))
        .collect();
    pool.push(chunk("vendor number items total"));
    let ranked = rerank("vendor number items total", pool);
    assert_eq!(ranked.len(), 5);
    // The only relevant chunk wins even from the back of the pool.
    assert_eq!(texts(&ranked)[0], "vendor number items total");
}

#[test]
fn rerank_handles_small_pools() {
    let ranked = rerank("vendor number items total", vec![chunk("vendor")]);
    assert_eq!(ranked.len(), 1);
    assert!(rerank("vendor number items total", Vec::new()).is_empty());
}

// =============================================================================
// ERROR CLASSIFICATION
// =============================================================================

#[test]
fn decimal_errors_classify_as_parse_errors() {
    let error = Decimal::parse("1.0000001")
        .context("field line[0].quantity value \"1.0000001\"")
        .unwrap_err();
    assert_eq!(classify_extraction_error(&error), ErrorKind::ParseError);
}

#[test]
fn schema_mismatches_classify_as_parse_errors() {
    let error = serde_json::from_str::<serde_json::Value>("{broken")
        .context("extraction json did not match schema")
        .unwrap_err();
    assert_eq!(classify_extraction_error(&error), ErrorKind::ParseError);
}

#[test]
fn upstream_failures_classify_as_unavailable() {
    let error = anyhow::anyhow!("document po-1 not found").context("fetch parsed po-1");
    assert_eq!(
        classify_extraction_error(&error),
        ErrorKind::UpstreamUnavailable
    );
}
