//! Fuzzy entity resolver for cross-document line linking.
//!
//! Token-set similarity: lowercase, strip punctuation, split on whitespace,
//! then a multiplicity-aware intersection over the two token multisets
//! (a token-set ratio). Part numbers override descriptions: two non-empty
//! part numbers that compare equal case-insensitively are the same item no
//! matter how the descriptions read.

use std::collections::HashMap;

use crate::models::ExtractedLineItem;

/// Minimum score at which two lines are linked across documents.
pub const LINK_THRESHOLD: u8 = 70;

/// Score at which a linked pair counts as a full description match.
pub const FULL_MATCH_THRESHOLD: u8 = 85;

fn tokens(text: &str) -> HashMap<String, u32> {
    let mut counts: HashMap<String, u32> = HashMap::new();
    let normalized: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();
    for tok in normalized.split_whitespace() {
        *counts.entry(tok.to_string()).or_insert(0) += 1;
    }
    counts
}

/// Token-set similarity in [0, 100]. `score(x, x) == 100` for any input,
/// including the empty string.
pub fn score(a: &str, b: &str) -> u8 {
    let ta = tokens(a);
    let tb = tokens(b);
    let na: u32 = ta.values().sum();
    let nb: u32 = tb.values().sum();
    if na == 0 && nb == 0 {
        return 100;
    }
    if na == 0 || nb == 0 {
        return 0;
    }
    let mut intersection: u32 = 0;
    for (tok, count) in &ta {
        if let Some(other) = tb.get(tok) {
            intersection += (*count).min(*other);
        }
    }
    // 2·|A ∩ B| / (|A| + |B|), scaled to 0..=100 with integer rounding.
    let total = (na + nb) as u64;
    (((200 * intersection as u64) + total / 2) / total) as u8
}

/// Line-item similarity with the part-number override.
pub fn score_items(a: &ExtractedLineItem, b: &ExtractedLineItem) -> u8 {
    if let (Some(pa), Some(pb)) = (&a.part_number, &b.part_number) {
        let pa = pa.trim();
        let pb = pb.trim();
        if !pa.is_empty() && pa.eq_ignore_ascii_case(pb) {
            return 100;
        }
    }
    score(&a.description, &b.description)
}

/// Best counterparty line for `item`, or None when nothing reaches the link
/// threshold. Equal scores keep the earlier counterparty index (candidates
/// are scanned in order and only a strictly higher score displaces the
/// incumbent), so matching is stable.
pub fn best_match(item: &ExtractedLineItem, candidates: &[ExtractedLineItem]) -> Option<(usize, u8)> {
    let mut best: Option<(usize, u8)> = None;
    for (idx, candidate) in candidates.iter().enumerate() {
        let s = score_items(item, candidate);
        if s < LINK_THRESHOLD {
            continue;
        }
        match best {
            Some((_, current)) if s <= current => {}
            _ => best = Some((idx, s)),
        }
    }
    best
}
