//! Drafting Agent
//!
//! Turns the session's stage slots into the final workpaper. The structure,
//! every figure and every citation come from `workpaper::compose_skeleton`;
//! the model contributes prose for the objective and conclusion sections and
//! nothing else. On outage the deterministic section bodies stand.

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::agents::{note_unavailable_input, PipelineDeps};
use crate::models::{ErrorKind, ProgressEvent, Stage};
use crate::router::CompletionRequest;
use crate::state::PipelineState;
use crate::workpaper::{self, SECTION_CONCLUSION, SECTION_FINDINGS, SECTION_OBJECTIVE};

const DRAFTING_SYSTEM_PROMPT: &str = "You are drafting the narrative sections of an \
    audit workpaper. Return ONLY a JSON object with the requested keys. Preserve \
    every figure exactly as given; do not introduce numbers of your own.";

pub async fn run(deps: &PipelineDeps, state: &mut PipelineState) -> super::StageResult {
    if state.verdict.is_none() {
        note_unavailable_input(state, Stage::Drafting, "verdict");
    }

    let mut paper = workpaper::compose_skeleton(
        &state.session_id,
        state.extracted.as_ref(),
        state.citations.as_ref(),
        state.quantitative.as_ref(),
        state.compliance.as_ref(),
        state.divergence.as_ref(),
        state.verdict.as_ref(),
    );

    deps.bus.publish(
        &state.session_id,
        ProgressEvent::AgentProgress {
            stage: Stage::Drafting,
            message: format!(
                "composing workpaper ({} table rows)",
                paper.line_item_table.len()
            ),
        },
    );

    let objective = section_body(&paper, SECTION_OBJECTIVE);
    let findings = section_body(&paper, SECTION_FINDINGS);
    let conclusion = section_body(&paper, SECTION_CONCLUSION);

    let neutral = serde_json::json!({
        "objective": objective,
        "conclusion": conclusion,
    })
    .to_string();
    let request = CompletionRequest {
        system: DRAFTING_SYSTEM_PROMPT.to_string(),
        prompt: format!(
            "Draft sections for this reconciliation workpaper.\n\n\
             Current objective: {objective}\n\
             Findings on record:\n{findings}\n\
             Current conclusion: {conclusion}\n\n\
             Return a JSON object: {{\"objective\": string, \"conclusion\": string}}"
        ),
        temperature: 0.3,
        max_tokens: 500,
        json_mode: true,
        neutral_response: neutral,
    };

    match deps.router.complete(&request).await.context("workpaper narration") {
        Ok(outcome) => {
            if outcome.degraded {
                state.push_error(
                    Stage::Drafting,
                    ErrorKind::UpstreamUnavailable,
                    "workpaper narration served by deterministic fallback",
                    false,
                );
            }
            match serde_json::from_str::<Narrative>(&outcome.value) {
                Ok(narrative) => {
                    apply_narrative(&mut paper, SECTION_OBJECTIVE, narrative.objective);
                    apply_narrative(&mut paper, SECTION_CONCLUSION, narrative.conclusion);
                }
                Err(e) => {
                    warn!(session = %state.session_id, error = %e, "narration json rejected");
                }
            }
        }
        Err(e) => {
            warn!(session = %state.session_id, error = %e, "workpaper narration failed");
            state.push_error(
                Stage::Drafting,
                ErrorKind::UpstreamUnavailable,
                format!("workpaper narration failed: {e:#}"),
                false,
            );
        }
    }

    debug!(
        session = %state.session_id,
        sections = paper.sections.len(),
        rows = paper.line_item_table.len(),
        citations = paper.citations.len(),
        "workpaper composed"
    );
    state.workpaper = Some(paper);
    Ok(())
}

fn section_body(paper: &workpaper::Workpaper, id: &str) -> String {
    paper
        .sections
        .iter()
        .find(|s| s.id == id)
        .map(|s| s.body.clone())
        .unwrap_or_default()
}

fn apply_narrative(paper: &mut workpaper::Workpaper, id: &str, text: Option<String>) {
    if let Some(text) = text {
        let text = text.trim();
        if !text.is_empty() {
            if let Some(section) = paper.section_mut(id) {
                section.body = text.to_string();
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct Narrative {
    #[serde(default)]
    objective: Option<String>,
    #[serde(default)]
    conclusion: Option<String>,
}
