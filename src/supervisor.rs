//! Supervisor / Orchestrator
//!
//! Drives the six agents strictly in order over one `PipelineState`,
//! enforcing stage deadlines, cooperative cancellation and the error-routing
//! policy. Stage serialization is structural: the supervisor owns the state
//! and hands it to exactly one agent at a time, so no stage ever observes a
//! half-written slot.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::agents::{
    compliance, divergence, drafting, extraction, quantitative, reconcile, FatalStageError,
    PipelineDeps,
};
use crate::bus::{ProgressBus, ProgressSubscription};
use crate::cancel::CancelToken;
use crate::models::{
    ErrorKind, OverallStatus, ProgressEvent, Recommendation, SessionStatus, Stage, Verdict,
};
use crate::state::{PipelineState, SessionRecord, StageOutcome};

/// Soft deadline per stage.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(60);

/// The divergence guard makes two reasoning calls and gets double budget.
pub const DEFAULT_GUARD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub stage_timeout: Duration,
    pub guard_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            guard_timeout: DEFAULT_GUARD_TIMEOUT,
        }
    }
}

enum StageRun {
    Done,
    Fatal(FatalStageError),
    TimedOut,
    Cancelled,
}

pub struct Pipeline {
    deps: PipelineDeps,
    config: SupervisorConfig,
}

impl Pipeline {
    pub fn new(deps: PipelineDeps, config: SupervisorConfig) -> Self {
        Self { deps, config }
    }

    pub fn bus(&self) -> &Arc<ProgressBus> {
        &self.deps.bus
    }

    pub fn subscribe(&self, session_id: &str) -> ProgressSubscription {
        self.deps.bus.subscribe(session_id)
    }

    /// Run one reconciliation session to its terminal status. Never panics
    /// out: every path ends in a frozen `SessionRecord` and a terminal
    /// `workflow_complete` event.
    pub async fn run(
        &self,
        session_id: &str,
        tenant_id: &str,
        po_id: &str,
        grn_id: &str,
        invoice_id: &str,
        cancel: CancelToken,
    ) -> SessionRecord {
        let mut state = PipelineState::new(session_id, tenant_id, po_id, grn_id, invoice_id);
        info!(
            session = session_id,
            tenant = tenant_id,
            "reconciliation session started"
        );
        self.deps.bus.publish(
            session_id,
            ProgressEvent::WorkflowStarted {
                total_stages: Stage::PIPELINE.len(),
            },
        );

        let mut cancelled = false;

        loop {
            let stage = state.next_action;
            if stage == Stage::End {
                break;
            }
            if cancel.is_cancelled() {
                let now = Utc::now();
                state.record_trace(stage, now, StageOutcome::Cancelled);
                state.push_error(stage, ErrorKind::Cancelled, "session cancelled", false);
                cancelled = true;
                break;
            }

            state.current_stage = stage;
            self.deps.bus.publish(
                session_id,
                ProgressEvent::AgentStarted {
                    stage,
                    message: stage_banner(stage).to_string(),
                },
            );

            let started = Utc::now();
            let deadline = self.deadline_for(stage);
            let outcome = tokio::select! {
                _ = cancel.cancelled() => StageRun::Cancelled,
                result = timeout(deadline, self.run_stage(stage, &mut state)) => match result {
                    Ok(Ok(())) => StageRun::Done,
                    Ok(Err(fatal)) => StageRun::Fatal(fatal),
                    Err(_) => StageRun::TimedOut,
                },
            };

            match outcome {
                StageRun::Done => {
                    state.record_trace(stage, started, StageOutcome::Completed);
                    let duration_ms = trace_duration(&state, stage);
                    self.deps.bus.publish(
                        session_id,
                        ProgressEvent::AgentCompleted { stage, duration_ms },
                    );
                    state.next_action = self.route_after(stage, &mut state);
                }
                StageRun::TimedOut => {
                    warn!(session = session_id, stage = %stage, "stage deadline expired");
                    state.record_trace(stage, started, StageOutcome::Timeout);
                    state.push_error(
                        stage,
                        ErrorKind::Timeout,
                        format!("stage exceeded {}s deadline", deadline.as_secs()),
                        false,
                    );
                    let duration_ms = trace_duration(&state, stage);
                    self.deps.bus.publish(
                        session_id,
                        ProgressEvent::AgentCompleted { stage, duration_ms },
                    );
                    state.next_action = self.route_after(stage, &mut state);
                }
                StageRun::Fatal(fatal) => {
                    error!(
                        session = session_id,
                        stage = %stage,
                        kind = ?fatal.kind,
                        message = %fatal.message,
                        "stage failed fatally"
                    );
                    state.record_trace(stage, started, StageOutcome::Failed);
                    self.deps.bus.publish(
                        session_id,
                        ProgressEvent::WorkflowError {
                            stage,
                            message: fatal.message.clone(),
                        },
                    );
                    state.push_error(stage, fatal.kind, fatal.message, true);
                    break;
                }
                StageRun::Cancelled => {
                    state.record_trace(stage, started, StageOutcome::Cancelled);
                    state.push_error(stage, ErrorKind::Cancelled, "session cancelled", false);
                    cancelled = true;
                    break;
                }
            }
        }

        self.finish(state, cancelled)
    }

    fn deadline_for(&self, stage: Stage) -> Duration {
        if stage == Stage::DivergenceGuard {
            self.config.guard_timeout
        } else {
            self.config.stage_timeout
        }
    }

    async fn run_stage(
        &self,
        stage: Stage,
        state: &mut PipelineState,
    ) -> Result<(), FatalStageError> {
        match stage {
            Stage::Extraction => extraction::run(&self.deps, state).await,
            Stage::Quantitative => quantitative::run(state),
            Stage::Compliance => compliance::run(&self.deps, state).await,
            Stage::DivergenceGuard => divergence::run(&self.deps, state).await,
            Stage::Reconciliation => reconcile::run(&self.deps, state).await,
            Stage::Drafting => drafting::run(&self.deps, state).await,
            Stage::End => Ok(()),
        }
    }

    /// Stage routing policy. May push warnings or a fatal marker onto the
    /// state while deciding where to go next.
    fn route_after(&self, stage: Stage, state: &mut PipelineState) -> Stage {
        match stage {
            Stage::Extraction => {
                let extracted = state.extracted_count();
                match extracted {
                    0 => {
                        // Nothing extracted from any document: unrecoverable.
                        state.push_error(
                            Stage::Extraction,
                            ErrorKind::UnavailableInput,
                            "no document yielded extracted data",
                            true,
                        );
                        self.deps.bus.publish(
                            &state.session_id,
                            ProgressEvent::WorkflowError {
                                stage: Stage::Extraction,
                                message: "no document yielded extracted data".to_string(),
                            },
                        );
                        Stage::End
                    }
                    1 | 2 => {
                        warn!(
                            session = %state.session_id,
                            extracted,
                            "partial extraction, continuing"
                        );
                        state.push_error(
                            Stage::Extraction,
                            ErrorKind::UnavailableInput,
                            format!("extraction incomplete: {extracted} of 3 documents"),
                            false,
                        );
                        Stage::Quantitative
                    }
                    _ => Stage::Quantitative,
                }
            }
            Stage::Quantitative => {
                if state.quantitative.is_none() {
                    // Quantitative produced nothing; compliance would be
                    // judging numbers nobody re-verified. Straight to the
                    // guard, with the skip on record.
                    let now = Utc::now();
                    state.record_trace(Stage::Compliance, now, StageOutcome::Skipped);
                    Stage::DivergenceGuard
                } else {
                    Stage::Compliance
                }
            }
            Stage::Compliance => Stage::DivergenceGuard,
            Stage::DivergenceGuard => Stage::Reconciliation,
            Stage::Reconciliation => Stage::Drafting,
            Stage::Drafting => Stage::End,
            Stage::End => Stage::End,
        }
    }

    /// Terminal bookkeeping: force the alert invariant, map the final
    /// status, publish the terminal event, freeze the record.
    fn finish(&self, mut state: PipelineState, cancelled: bool) -> SessionRecord {
        let fatal = state.has_fatal_error();

        if fatal {
            // A failed session carries no verdict.
            state.verdict = None;
        } else if state.divergence_alerted() && state.verdict.is_none() {
            // The guard fired but reconciliation never produced a verdict
            // (timeout). The alert invariant still holds: synthesize the
            // minimal escalation verdict.
            state.verdict = Some(Verdict {
                overall_status: OverallStatus::DivergenceAlert,
                confidence: 0.0,
                line_item_matches: Vec::new(),
                discrepancy_summary: vec![
                    "Divergence alert fired; reconciliation detail unavailable".to_string(),
                ],
                recommendation: Recommendation::Escalate,
            });
        }

        let status = if cancelled {
            SessionStatus::Cancelled
        } else if fatal {
            SessionStatus::Failed
        } else if state.divergence_alerted() {
            SessionStatus::DivergenceAlert
        } else {
            match state.verdict.as_ref().map(|v| v.overall_status) {
                Some(OverallStatus::FullMatch) => SessionStatus::Matched,
                Some(OverallStatus::PartialMatch) | Some(OverallStatus::Mismatch) => {
                    SessionStatus::DiscrepancyFound
                }
                Some(OverallStatus::Exception) => SessionStatus::Exception,
                Some(OverallStatus::DivergenceAlert) => SessionStatus::DivergenceAlert,
                None => SessionStatus::Exception,
            }
        };

        let verdict_summary = state
            .verdict
            .as_ref()
            .map(|v| {
                format!(
                    "{} / {} (confidence {:.2})",
                    v.overall_status.as_str(),
                    v.recommendation.as_str(),
                    v.confidence
                )
            })
            .unwrap_or_else(|| "no verdict".to_string());

        self.deps.bus.publish(
            &state.session_id,
            ProgressEvent::WorkflowComplete {
                status,
                verdict_summary,
            },
        );

        info!(
            session = %state.session_id,
            status = ?status,
            stages = state.agent_trace.len(),
            errors = state.errors.len(),
            "reconciliation session finished"
        );
        state.into_record(status)
    }
}

fn stage_banner(stage: Stage) -> &'static str {
    match stage {
        Stage::Extraction => "extracting structured data from documents",
        Stage::Quantitative => "re-verifying arithmetic",
        Stage::Compliance => "evaluating compliance rules",
        Stage::DivergenceGuard => "testing reasoning stability",
        Stage::Reconciliation => "reconciling line items",
        Stage::Drafting => "drafting workpaper",
        Stage::End => "finished",
    }
}

fn trace_duration(state: &PipelineState, stage: Stage) -> u64 {
    state
        .agent_trace
        .iter()
        .rev()
        .find(|t| t.stage == stage)
        .map(|t| t.duration_ms)
        .unwrap_or(0)
}
