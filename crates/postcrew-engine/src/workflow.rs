//! The run state machine.
//!
//! A `Workflow` drives one run from research through the bounded
//! write/critique loop to evaluation. After every agent invocation it appends
//! one step to the run ledger and publishes a notice; any failure ends the run
//! `failed` with a `workflow_error` event.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use postcrew_core::agents::{
    AgentOutcome, AgentRequest, AgentRole, CritiqueRequest, EvaluateRequest, GroundednessOutcome, Invocation,
    ResearchRequest, RouteRequest, Verdict, WriteRequest, MAX_GROUNDEDNESS_SCORE,
};
use postcrew_core::errors::InvocationError;
use postcrew_core::events::{preview, EventBody, EventSink, RunEvent, StepNotice};
use postcrew_core::ids::{ProjectId, RunId};
use postcrew_core::project::ProjectBrief;
use postcrew_store::drafts::{DraftRepo, DraftRow};
use postcrew_store::findings::FindingRepo;
use postcrew_store::projects::{ProjectRepo, ProjectStatus};
use postcrew_store::reports::ReportRepo;
use postcrew_store::runs::{RunRepo, RunStatus};
use postcrew_store::steps::{NewStep, StepRepo};
use postcrew_store::Database;

use crate::error::EngineError;
use crate::invoker::{invoke_bounded, AgentInvoker};
use crate::phase::{classify, Classification, Phase, WorkflowSnapshot};

pub const DEFAULT_MAX_REVISIONS: u32 = 5;
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(120);

const DRAFT_PREVIEW_CHARS: usize = 200;
const FEEDBACK_PREVIEW_CHARS: usize = 200;
const FINDING_PREVIEW_CHARS: usize = 120;

#[derive(Clone, Debug)]
pub struct WorkflowConfig {
    /// Write/critique cycles allowed after the first draft.
    pub max_revisions: u32,
    pub invoke_timeout: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_revisions: DEFAULT_MAX_REVISIONS,
            invoke_timeout: DEFAULT_INVOKE_TIMEOUT,
        }
    }
}

/// Handles a run shares with whoever started it.
#[derive(Clone, Debug)]
pub struct RunContext {
    pub run_id: RunId,
    pub project_id: ProjectId,
    /// User feedback for a regeneration run.
    pub feedback: Option<String>,
    pub cancel: CancellationToken,
    phase: Arc<RwLock<Phase>>,
}

impl RunContext {
    pub fn new(run_id: RunId, project_id: ProjectId, feedback: Option<String>) -> Self {
        Self {
            run_id,
            project_id,
            feedback,
            cancel: CancellationToken::new(),
            phase: Arc::new(RwLock::new(Phase::Init)),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.read()
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.write() = phase;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub final_post: String,
    pub groundedness_score: u8,
    pub total_revisions: u32,
    /// The revision ceiling approved the last draft.
    pub forced_approval: bool,
}

#[derive(Default)]
struct RunState {
    findings: Vec<String>,
    draft: Option<DraftRow>,
    last_verdict: Option<Verdict>,
    critique_notes: Option<String>,
    total_revisions: u32,
    evaluated: bool,
    feedback_pending: bool,
    forced_approval: bool,
}

impl RunState {
    fn snapshot(&self, max_revisions: u32) -> WorkflowSnapshot {
        WorkflowSnapshot {
            has_findings: !self.findings.is_empty(),
            has_draft: self.draft.is_some(),
            last_verdict: self.last_verdict,
            total_revisions: self.total_revisions,
            max_revisions,
            evaluated: self.evaluated,
            feedback_pending: self.feedback_pending,
        }
    }
}

pub struct Workflow {
    invoker: Arc<dyn AgentInvoker>,
    events: Arc<dyn EventSink>,
    config: WorkflowConfig,
    projects: ProjectRepo,
    runs: RunRepo,
    steps: StepRepo,
    findings: FindingRepo,
    drafts: DraftRepo,
    reports: ReportRepo,
}

impl Workflow {
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        db: Database,
        events: Arc<dyn EventSink>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            invoker,
            events,
            config,
            projects: ProjectRepo::new(db.clone()),
            runs: RunRepo::new(db.clone()),
            steps: StepRepo::new(db.clone()),
            findings: FindingRepo::new(db.clone()),
            drafts: DraftRepo::new(db.clone()),
            reports: ReportRepo::new(db),
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Execute a generation run to completion. On error the run has already
    /// been marked failed and `workflow_error` published.
    #[instrument(skip_all, fields(run_id = %ctx.run_id, project_id = %ctx.project_id))]
    pub async fn run(&self, ctx: &RunContext) -> Result<RunSummary, EngineError> {
        let result = self.generate(ctx).await;
        if let Err(e) = &result {
            self.fail(ctx, &e.to_string());
        }
        result
    }

    /// Evaluate a completed run's approved draft again. The run stays
    /// completed; the new report supersedes the project's current one.
    #[instrument(skip_all, fields(run_id = %ctx.run_id, project_id = %ctx.project_id))]
    pub async fn reevaluate(&self, ctx: &RunContext) -> Result<GroundednessOutcome, EngineError> {
        let result = self.evaluate_again(ctx).await;
        match &result {
            Ok(report) => info!(score = report.score, "re-evaluation complete"),
            Err(e) => {
                warn!(error = %e, "re-evaluation failed");
                self.report_error(ctx, &e.to_string());
            }
        }
        result
    }

    /// Mark the run and its project failed and publish the terminal error.
    /// A run that already ended is left as it is.
    pub fn fail(&self, ctx: &RunContext, message: &str) {
        let message = non_empty(message);
        if let Err(e) = self.runs.fail(&ctx.run_id, &message) {
            error!(run_id = %ctx.run_id, error = %e, "failed to record run failure");
        }
        if let Err(e) = self.projects.set_status(&ctx.project_id, ProjectStatus::Failed) {
            error!(project_id = %ctx.project_id, error = %e, "failed to mark project failed");
        }
        warn!(run_id = %ctx.run_id, error = %message, "run failed");
        self.report_error(ctx, &message);
    }

    /// Publish the terminal error without touching the store. Used where the
    /// run row must keep its status, as for a failed re-evaluation.
    pub fn report_error(&self, ctx: &RunContext, message: &str) {
        ctx.set_phase(Phase::Failed);
        self.emit(ctx, EventBody::WorkflowError { error: non_empty(message) });
    }

    async fn generate(&self, ctx: &RunContext) -> Result<RunSummary, EngineError> {
        let brief = self.projects.brief(&ctx.project_id, ctx.feedback.clone())?;
        let mut state = RunState {
            feedback_pending: ctx.feedback.is_some(),
            ..RunState::default()
        };
        if ctx.feedback.is_some() {
            state.findings = self
                .findings
                .list_for_project(&ctx.project_id)?
                .into_iter()
                .map(|f| f.summary)
                .collect();
        }
        info!(topic = %brief.topic, seeded_findings = state.findings.len(), "run started");

        loop {
            self.checkpoint(ctx)?;
            match self.supervise(ctx, &brief, &mut state).await? {
                Phase::Research => self.research(ctx, &brief, &mut state).await?,
                Phase::Write => {
                    self.write(ctx, &brief, &mut state).await?;
                    self.checkpoint(ctx)?;
                    self.critique(ctx, &brief, &mut state).await?;
                }
                Phase::Critique => self.critique(ctx, &brief, &mut state).await?,
                Phase::Evaluate => {
                    let report = self.evaluate(ctx, &mut state).await?;
                    return self.finish(ctx, &state, report.score);
                }
                other => {
                    return Err(EngineError::Internal(format!("supervisor routed to {other}")));
                }
            }
        }
    }

    fn checkpoint(&self, ctx: &RunContext) -> Result<(), EngineError> {
        if ctx.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    async fn supervise(
        &self,
        ctx: &RunContext,
        brief: &ProjectBrief,
        state: &mut RunState,
    ) -> Result<Phase, EngineError> {
        let start = Instant::now();
        let snapshot = state.snapshot(self.config.max_revisions);
        let input = to_snapshot(&snapshot);

        let (phase, output, decision, tokens_used) = match classify(&snapshot) {
            Classification::Decided { phase, reason } => (
                phase,
                json!({ "next": phase, "reason": reason, "source": "rules" }),
                format!("{phase}: {reason}"),
                None,
            ),
            Classification::CeilingReached { revisions } => {
                state.forced_approval = true;
                state.last_verdict = Some(Verdict::Approve);
                info!(revisions, "revision ceiling reached, approving last draft");
                (
                    Phase::Evaluate,
                    json!({ "next": Phase::Evaluate, "reason": "loop_ceiling_reached", "revisions": revisions }),
                    format!("loop_ceiling_reached: approving draft after {revisions} revisions"),
                    None,
                )
            }
            Classification::Ambiguous { reason } => {
                let request = AgentRequest::Route(RouteRequest {
                    brief: brief.clone(),
                    findings: state.findings.clone(),
                    draft: state.draft.as_ref().map(|d| d.content.clone()),
                    reason: reason.clone(),
                });
                let invocation = self.invoke(ctx, &request).await?;
                let AgentOutcome::Routed(route) = &invocation.outcome else {
                    return Err(mismatch(AgentRole::Supervisor));
                };
                state.feedback_pending = false;
                let phase = Phase::from(route.next);
                (
                    phase,
                    json!({ "next": phase, "reason": reason, "source": "model", "rationale": route.rationale }),
                    format!("{phase}: {}", route.rationale),
                    invocation.tokens_used,
                )
            }
        };

        self.record(
            ctx,
            NewStep {
                agent: AgentRole::Supervisor,
                input,
                output,
                decision,
                duration_ms: start.elapsed().as_millis() as u64,
                tokens_used,
            },
            |_| {},
        )?;
        Ok(phase)
    }

    async fn research(&self, ctx: &RunContext, brief: &ProjectBrief, state: &mut RunState) -> Result<(), EngineError> {
        self.enter(ctx, Phase::Research, ProjectStatus::Researching)?;
        let request = AgentRequest::Research(ResearchRequest {
            brief: brief.clone(),
            queries: research_queries(brief),
        });
        let invocation = self.invoke(ctx, &request).await?;
        let AgentOutcome::Researched(outcome) = &invocation.outcome else {
            return Err(mismatch(AgentRole::Researcher));
        };

        self.findings.record(&ctx.project_id, &ctx.run_id, &outcome.summaries)?;
        let bullets = outcome.bullets.clone();
        self.record(
            ctx,
            NewStep {
                agent: AgentRole::Researcher,
                input: to_snapshot(&request),
                output: to_snapshot(&invocation.outcome),
                decision: format!("{} findings from {} queries", bullets.len(), outcome.summaries.len()),
                duration_ms: invocation.duration_ms,
                tokens_used: invocation.tokens_used,
            },
            |n| n.findings_preview = Some(bullets.iter().map(|b| preview(b, FINDING_PREVIEW_CHARS)).collect()),
        )?;
        state.findings = bullets;
        Ok(())
    }

    async fn write(&self, ctx: &RunContext, brief: &ProjectBrief, state: &mut RunState) -> Result<(), EngineError> {
        self.enter(ctx, Phase::Write, ProjectStatus::Writing)?;
        let revising = state.last_verdict == Some(Verdict::Revise);
        if revising {
            state.total_revisions += 1;
            self.runs.set_revisions(&ctx.run_id, state.total_revisions)?;
        }

        let request = AgentRequest::Write(WriteRequest {
            brief: brief.clone(),
            findings: state.findings.clone(),
            previous_draft: state.draft.as_ref().filter(|_| revising).map(|d| d.content.clone()),
            critique_notes: state.critique_notes.clone().filter(|_| revising),
        });
        let invocation = self.invoke(ctx, &request).await?;
        let AgentOutcome::Wrote(outcome) = &invocation.outcome else {
            return Err(mismatch(AgentRole::Writer));
        };

        let draft = self
            .drafts
            .create(&ctx.project_id, &ctx.run_id, &outcome.content, outcome.word_count)?;
        let decision = if outcome.in_range {
            format!("draft v{} ({} words)", draft.version, outcome.word_count)
        } else {
            format!(
                "draft v{} ({} words, outside {}-{} after {} attempts)",
                draft.version, outcome.word_count, brief.word_range.min, brief.word_range.max, outcome.attempts
            )
        };
        let revision = state.total_revisions;
        self.record(
            ctx,
            NewStep {
                agent: AgentRole::Writer,
                input: to_snapshot(&request),
                output: to_snapshot(&invocation.outcome),
                decision,
                duration_ms: invocation.duration_ms,
                tokens_used: invocation.tokens_used,
            },
            |n| {
                n.draft_preview = Some(preview(&outcome.content, DRAFT_PREVIEW_CHARS));
                n.word_count = Some(outcome.word_count);
                n.revision = Some(revision);
            },
        )?;

        state.draft = Some(draft);
        state.last_verdict = None;
        state.critique_notes = None;
        Ok(())
    }

    async fn critique(&self, ctx: &RunContext, brief: &ProjectBrief, state: &mut RunState) -> Result<(), EngineError> {
        self.enter(ctx, Phase::Critique, ProjectStatus::Reviewing)?;
        let draft = state
            .draft
            .as_ref()
            .ok_or_else(|| EngineError::Internal("critique requested without a draft".into()))?;
        let request = AgentRequest::Critique(CritiqueRequest {
            brief: brief.clone(),
            draft: draft.content.clone(),
        });
        let invocation = self.invoke(ctx, &request).await?;
        let AgentOutcome::Critiqued(outcome) = &invocation.outcome else {
            return Err(mismatch(AgentRole::Critic));
        };

        self.drafts.set_critique(&draft.id, &outcome.notes)?;
        let approved = outcome.verdict == Verdict::Approve;
        let revision = state.total_revisions;
        self.record(
            ctx,
            NewStep {
                agent: AgentRole::Critic,
                input: to_snapshot(&request),
                output: to_snapshot(&invocation.outcome),
                decision: if approved { "approve".into() } else { "revise".into() },
                duration_ms: invocation.duration_ms,
                tokens_used: invocation.tokens_used,
            },
            |n| {
                n.feedback_preview = Some(preview(&outcome.notes, FEEDBACK_PREVIEW_CHARS));
                n.approved = Some(approved);
                n.revision = Some(revision);
            },
        )?;

        state.last_verdict = Some(outcome.verdict);
        state.critique_notes = Some(outcome.notes.clone());
        Ok(())
    }

    async fn evaluate(&self, ctx: &RunContext, state: &mut RunState) -> Result<GroundednessOutcome, EngineError> {
        self.enter(ctx, Phase::Evaluate, ProjectStatus::Reviewing)?;
        let draft = state
            .draft
            .as_ref()
            .ok_or_else(|| EngineError::Internal("evaluation requested without a draft".into()))?;
        self.drafts.approve(&draft.id)?;
        let report = self.evaluate_draft(ctx, &draft.content, state.findings.clone()).await?;
        state.evaluated = true;
        Ok(report)
    }

    async fn evaluate_again(&self, ctx: &RunContext) -> Result<GroundednessOutcome, EngineError> {
        let run = self.runs.get(&ctx.run_id)?;
        if run.status != RunStatus::Completed {
            return Err(EngineError::Internal(format!("run {} is {}, not completed", run.id, run.status)));
        }
        let draft = self
            .drafts
            .approved_for_run(&ctx.run_id)?
            .ok_or_else(|| EngineError::Internal(format!("run {} has no approved draft", ctx.run_id)))?;
        let mut findings: Vec<String> = self
            .findings
            .list_for_run(&ctx.run_id)?
            .into_iter()
            .map(|f| f.summary)
            .collect();
        if findings.is_empty() {
            findings = self
                .findings
                .list_for_project(&ctx.project_id)?
                .into_iter()
                .map(|f| f.summary)
                .collect();
        }

        self.checkpoint(ctx)?;
        let start = Instant::now();
        self.record(
            ctx,
            NewStep {
                agent: AgentRole::Supervisor,
                input: json!({ "draft_version": draft.version, "findings": findings.len() }),
                output: json!({ "next": Phase::Evaluate, "reason": "re-evaluation requested", "source": "request" }),
                decision: "evaluate: re-evaluation requested".into(),
                duration_ms: start.elapsed().as_millis() as u64,
                tokens_used: None,
            },
            |_| {},
        )?;
        ctx.set_phase(Phase::Evaluate);
        let report = self.evaluate_draft(ctx, &draft.content, findings).await?;

        ctx.set_phase(Phase::Done);
        self.emit(
            ctx,
            EventBody::WorkflowComplete {
                final_post: draft.content,
                groundedness_score: Some(report.score),
                revisions: run.total_revisions,
                note: Some("re-evaluated".into()),
            },
        );
        Ok(report)
    }

    async fn evaluate_draft(
        &self,
        ctx: &RunContext,
        draft: &str,
        findings: Vec<String>,
    ) -> Result<GroundednessOutcome, EngineError> {
        let request = AgentRequest::Evaluate(EvaluateRequest {
            draft: draft.to_string(),
            findings,
        });
        let invocation = self.invoke(ctx, &request).await?;
        let AgentOutcome::Evaluated(report) = &invocation.outcome else {
            return Err(mismatch(AgentRole::Evaluator));
        };

        self.reports.create(&ctx.project_id, &ctx.run_id, report)?;
        self.record(
            ctx,
            NewStep {
                agent: AgentRole::Evaluator,
                input: to_snapshot(&request),
                output: to_snapshot(&invocation.outcome),
                decision: format!("groundedness {}/{MAX_GROUNDEDNESS_SCORE}", report.score),
                duration_ms: invocation.duration_ms,
                tokens_used: invocation.tokens_used,
            },
            |_| {},
        )?;
        self.emit(
            ctx,
            EventBody::EvaluationComplete {
                groundedness_score: report.score,
                report: report.clone(),
            },
        );
        Ok(report.clone())
    }

    fn finish(&self, ctx: &RunContext, state: &RunState, score: u8) -> Result<RunSummary, EngineError> {
        let draft = state
            .draft
            .as_ref()
            .ok_or_else(|| EngineError::Internal("run finished without a draft".into()))?;
        self.projects.set_final_post(&ctx.project_id, &draft.content)?;
        self.runs.complete(&ctx.run_id, state.total_revisions)?;
        // A terminal phase frees the project for the next run, so it is set
        // only after the last store write and before the terminal event.
        ctx.set_phase(Phase::Done);

        let note = state.forced_approval.then(|| {
            format!(
                "revision limit of {} reached; last draft approved",
                self.config.max_revisions
            )
        });
        info!(
            revisions = state.total_revisions,
            score,
            forced = state.forced_approval,
            "run completed"
        );
        self.emit(
            ctx,
            EventBody::WorkflowComplete {
                final_post: draft.content.clone(),
                groundedness_score: Some(score),
                revisions: state.total_revisions,
                note,
            },
        );
        Ok(RunSummary {
            final_post: draft.content.clone(),
            groundedness_score: score,
            total_revisions: state.total_revisions,
            forced_approval: state.forced_approval,
        })
    }

    fn enter(&self, ctx: &RunContext, phase: Phase, status: ProjectStatus) -> Result<(), EngineError> {
        ctx.set_phase(phase);
        self.projects.set_status(&ctx.project_id, status)?;
        debug!(phase = %phase, "phase entered");
        Ok(())
    }

    /// Invoke an agent under the configured timeout. A failed invocation is
    /// still recorded as a step with an error decision.
    async fn invoke(&self, ctx: &RunContext, request: &AgentRequest) -> Result<Invocation, EngineError> {
        let role = request.role();
        let start = Instant::now();
        let result = invoke_bounded(self.invoker.as_ref(), request, self.config.invoke_timeout).await;

        match result {
            Ok(invocation) => Ok(invocation),
            Err(e) => {
                warn!(agent = %role, kind = e.error_kind(), error = %e, "agent invocation failed");
                self.record(
                    ctx,
                    NewStep {
                        agent: role,
                        input: to_snapshot(request),
                        output: json!({ "error": e.to_string(), "kind": e.error_kind() }),
                        decision: format!("error: {}", e.error_kind()),
                        duration_ms: start.elapsed().as_millis() as u64,
                        tokens_used: None,
                    },
                    |_| {},
                )?;
                Err(e.into())
            }
        }
    }

    fn record(
        &self,
        ctx: &RunContext,
        step: NewStep,
        decorate: impl FnOnce(&mut StepNotice),
    ) -> Result<(), EngineError> {
        let row = self.steps.append(&ctx.run_id, step)?;
        debug!(step = row.step_number, agent = %row.agent, decision = %row.decision, "step recorded");

        let mut notice = StepNotice::new(row.step_number, row.agent, row.decision, row.duration_ms);
        notice.tokens_used = row.tokens_used;
        decorate(&mut notice);
        self.emit(ctx, EventBody::AgentStep(notice));
        Ok(())
    }

    fn emit(&self, ctx: &RunContext, body: EventBody) {
        self.events
            .publish(RunEvent::new(ctx.run_id.clone(), ctx.project_id.clone(), body));
    }
}

fn research_queries(brief: &ProjectBrief) -> Vec<String> {
    let mut queries = vec![brief.topic.clone()];
    if let Some(feedback) = &brief.feedback {
        queries.push(format!("{} {}", brief.topic, feedback));
    }
    queries
}

fn to_snapshot<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_default()
}

fn mismatch(role: AgentRole) -> EngineError {
    EngineError::Invocation(InvocationError::malformed(role.as_str(), "unexpected outcome kind"))
}

fn non_empty(message: &str) -> String {
    if message.trim().is_empty() {
        "run failed".into()
    } else {
        message.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{Scripted, ScriptedInvoker};
    use postcrew_core::agents::{RouteChoice, WriteOutcome};
    use postcrew_store::projects::NewProject;

    #[derive(Default)]
    struct CollectingSink(parking_lot::Mutex<Vec<RunEvent>>);

    impl CollectingSink {
        fn types(&self) -> Vec<&'static str> {
            self.0.lock().iter().map(RunEvent::event_type).collect()
        }

        fn last(&self) -> RunEvent {
            self.0.lock().last().cloned().unwrap()
        }
    }

    impl EventSink for CollectingSink {
        fn publish(&self, event: RunEvent) {
            self.0.lock().push(event);
        }
    }

    struct Harness {
        db: Database,
        invoker: Arc<ScriptedInvoker>,
        sink: Arc<CollectingSink>,
        workflow: Arc<Workflow>,
        project_id: ProjectId,
    }

    impl Harness {
        fn new(invoker: ScriptedInvoker) -> Self {
            Self::with_config(invoker, WorkflowConfig::default())
        }

        fn with_config(invoker: ScriptedInvoker, config: WorkflowConfig) -> Self {
            let db = Database::in_memory().unwrap();
            let project: NewProject =
                serde_json::from_value(json!({ "title": "Launch", "topic": "Rust in production" })).unwrap();
            let project_id = ProjectRepo::new(db.clone()).create(&project).unwrap().id;
            let invoker = Arc::new(invoker);
            let sink = Arc::new(CollectingSink::default());
            let workflow = Arc::new(Workflow::new(invoker.clone(), db.clone(), sink.clone(), config));
            Self {
                db,
                invoker,
                sink,
                workflow,
                project_id,
            }
        }

        fn start(&self, feedback: Option<&str>) -> RunContext {
            let run = RunRepo::new(self.db.clone()).create_running(&self.project_id).unwrap();
            RunContext::new(run.id, self.project_id.clone(), feedback.map(String::from))
        }

        fn agents(&self, run_id: &RunId) -> Vec<AgentRole> {
            StepRepo::new(self.db.clone())
                .list_for_run(run_id)
                .unwrap()
                .into_iter()
                .map(|s| s.agent)
                .collect()
        }
    }

    use AgentRole::{Critic, Evaluator, Researcher, Supervisor, Writer};

    #[tokio::test]
    async fn revise_then_approve_sequence() {
        let h = Harness::new(
            ScriptedInvoker::new()
                .with(Critic, Scripted::verdict(Verdict::Revise))
                .with(Critic, Scripted::verdict(Verdict::Approve))
                .with(Evaluator, Scripted::score(4)),
        );
        let ctx = h.start(None);
        let summary = h.workflow.run(&ctx).await.unwrap();
        assert_eq!(summary.total_revisions, 1);
        assert_eq!(summary.groundedness_score, 4);
        assert!(!summary.forced_approval);

        assert_eq!(
            h.agents(&ctx.run_id),
            vec![Supervisor, Researcher, Supervisor, Writer, Critic, Supervisor, Writer, Critic, Supervisor, Evaluator]
        );
        let numbers: Vec<u32> = StepRepo::new(h.db.clone())
            .list_for_run(&ctx.run_id)
            .unwrap()
            .iter()
            .map(|s| s.step_number)
            .collect();
        assert_eq!(numbers, (1..=10).collect::<Vec<_>>());

        let run = RunRepo::new(h.db.clone()).get(&ctx.run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.total_revisions, 1);
        assert!(run.completed_at.is_some());

        let project = ProjectRepo::new(h.db.clone()).get(&h.project_id).unwrap();
        assert_eq!(project.status, ProjectStatus::Approved);
        assert_eq!(project.groundedness_score, Some(4));
        assert_eq!(project.final_post.as_deref(), Some(summary.final_post.as_str()));

        let drafts = DraftRepo::new(h.db.clone()).list_for_run(&ctx.run_id).unwrap();
        assert_eq!(drafts.len(), 2);
        assert!(!drafts[0].is_approved);
        assert!(drafts[1].is_approved);
        assert_eq!(drafts[0].critique_notes.as_deref(), Some("sharpen the opening line"));

        let types = h.sink.types();
        assert_eq!(types.iter().filter(|t| **t == "agent_step").count(), 10);
        assert_eq!(&types[types.len() - 2..], &["evaluation_complete", "workflow_complete"]);
        assert_eq!(ctx.phase(), Phase::Done);
    }

    #[tokio::test]
    async fn revision_ceiling_forces_approval() {
        let invoker = ScriptedInvoker::new();
        for _ in 0..6 {
            invoker.push(Critic, Scripted::verdict(Verdict::Revise));
        }
        let h = Harness::new(invoker);
        let ctx = h.start(None);
        let summary = h.workflow.run(&ctx).await.unwrap();
        assert_eq!(summary.total_revisions, DEFAULT_MAX_REVISIONS);
        assert!(summary.forced_approval);

        let agents = h.agents(&ctx.run_id);
        assert_eq!(agents.iter().filter(|a| **a == Writer).count(), 6);
        let steps = StepRepo::new(h.db.clone()).list_for_run(&ctx.run_id).unwrap();
        let ceiling = &steps[steps.len() - 2];
        assert_eq!(ceiling.agent, Supervisor);
        assert!(ceiling.decision.starts_with("loop_ceiling_reached"));

        let drafts = DraftRepo::new(h.db.clone()).approved_for_run(&ctx.run_id).unwrap().unwrap();
        assert_eq!(drafts.version, 6);
        let EventBody::WorkflowComplete { note, revisions, .. } = h.sink.last().body else {
            panic!("expected workflow_complete");
        };
        assert_eq!(revisions, 5);
        assert!(note.unwrap().contains("revision limit"));
    }

    #[tokio::test(start_paused = true)]
    async fn write_timeout_fails_run() {
        let slow_draft = Scripted::Outcome(AgentOutcome::Wrote(WriteOutcome {
            content: "late".into(),
            word_count: 1,
            attempts: 1,
            in_range: false,
        }));
        let h = Harness::with_config(
            ScriptedInvoker::new().with(Writer, Scripted::delayed(Duration::from_secs(10), slow_draft)),
            WorkflowConfig {
                invoke_timeout: Duration::from_secs(2),
                ..WorkflowConfig::default()
            },
        );
        let ctx = h.start(None);
        let err = h.workflow.run(&ctx).await.unwrap_err();
        assert!(matches!(err, EngineError::Invocation(InvocationError::Timeout(_))));

        let run = RunRepo::new(h.db.clone()).get(&ctx.run_id).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(!run.error_message.unwrap_or_default().is_empty());

        let steps = StepRepo::new(h.db.clone()).list_for_run(&ctx.run_id).unwrap();
        let last = steps.last().unwrap();
        assert_eq!(last.agent, Writer);
        assert_eq!(last.decision, "error: timeout");
        assert_eq!(steps.len(), 4);

        assert_eq!(h.sink.last().event_type(), "workflow_error");
        let project = ProjectRepo::new(h.db.clone()).get(&h.project_id).unwrap();
        assert_eq!(project.status, ProjectStatus::Failed);
        assert_eq!(ctx.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn research_failure_records_error_step() {
        let h = Harness::new(
            ScriptedInvoker::new().with(Researcher, Scripted::Fail(InvocationError::Network("reset".into()))),
        );
        let ctx = h.start(None);
        assert!(h.workflow.run(&ctx).await.is_err());
        assert_eq!(h.agents(&ctx.run_id), vec![Supervisor, Researcher]);
        let run = RunRepo::new(h.db.clone()).get(&ctx.run_id).unwrap();
        assert_eq!(run.error_message.as_deref(), Some("network error: reset"));
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let h = Harness::new(ScriptedInvoker::new());
        let ctx = h.start(None);
        ctx.cancel.cancel();
        assert!(matches!(h.workflow.run(&ctx).await, Err(EngineError::Cancelled)));
        assert!(h.agents(&ctx.run_id).is_empty());
        let run = RunRepo::new(h.db.clone()).get(&ctx.run_id).unwrap();
        assert_eq!(run.error_message.as_deref(), Some("run cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_lets_in_flight_step_finish() {
        let research = Scripted::delayed(
            Duration::from_secs(5),
            Scripted::Outcome(AgentOutcome::Researched(postcrew_core::agents::ResearchOutcome {
                summaries: vec![],
                bullets: vec!["fact".into()],
            })),
        );
        let h = Harness::new(ScriptedInvoker::new().with(Researcher, research));
        let ctx = h.start(None);
        let task = {
            let workflow = h.workflow.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { workflow.run(&ctx).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        ctx.cancel.cancel();

        assert!(matches!(task.await.unwrap(), Err(EngineError::Cancelled)));
        assert_eq!(h.agents(&ctx.run_id), vec![Supervisor, Researcher]);
        assert_eq!(h.invoker.calls(), vec![Researcher]);
    }

    #[tokio::test]
    async fn regeneration_asks_router_once() {
        let h = Harness::new(ScriptedInvoker::new());
        let first = h.start(None);
        h.workflow.run(&first).await.unwrap();

        h.invoker.push(Supervisor, Scripted::route(RouteChoice::Write));
        let second = h.start(Some("make it shorter"));
        h.workflow.run(&second).await.unwrap();

        assert_eq!(
            h.agents(&second.run_id),
            vec![Supervisor, Writer, Critic, Supervisor, Evaluator]
        );
        let routed = StepRepo::new(h.db.clone()).list_for_run(&second.run_id).unwrap();
        assert_eq!(routed[0].output["source"], "model");
        assert!(routed[0].tokens_used.is_some());

        let writes: Vec<_> = h
            .invoker
            .requests()
            .into_iter()
            .filter_map(|r| match r {
                AgentRequest::Write(w) => Some(w),
                _ => None,
            })
            .collect();
        let last = writes.last().unwrap();
        assert_eq!(last.brief.feedback.as_deref(), Some("make it shorter"));
        assert!(!last.findings.is_empty());
    }

    #[tokio::test]
    async fn regeneration_routed_to_research_does_not_loop() {
        let h = Harness::new(ScriptedInvoker::new());
        let first = h.start(None);
        h.workflow.run(&first).await.unwrap();

        h.invoker.push(Supervisor, Scripted::route(RouteChoice::Research));
        let second = h.start(Some("add recent numbers"));
        h.workflow.run(&second).await.unwrap();
        assert_eq!(
            h.agents(&second.run_id),
            vec![Supervisor, Researcher, Supervisor, Writer, Critic, Supervisor, Evaluator]
        );
    }

    #[tokio::test]
    async fn reevaluate_appends_and_supersedes() {
        let h = Harness::new(ScriptedInvoker::new().with(Evaluator, Scripted::score(4)));
        let ctx = h.start(None);
        h.workflow.run(&ctx).await.unwrap();
        let before = h.agents(&ctx.run_id).len();

        h.invoker.push(Evaluator, Scripted::score(2));
        let again = RunContext::new(ctx.run_id.clone(), h.project_id.clone(), None);
        let report = h.workflow.reevaluate(&again).await.unwrap();
        assert_eq!(report.score, 2);

        let agents = h.agents(&ctx.run_id);
        assert_eq!(agents.len(), before + 2);
        assert_eq!(&agents[before..], &[Supervisor, Evaluator]);

        let run = RunRepo::new(h.db.clone()).get(&ctx.run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let project = ProjectRepo::new(h.db.clone()).get(&h.project_id).unwrap();
        assert_eq!(project.groundedness_score, Some(2));
        assert_eq!(ReportRepo::new(h.db.clone()).list_for_run(&ctx.run_id).unwrap().len(), 2);
        assert_eq!(h.sink.last().event_type(), "workflow_complete");
    }

    #[tokio::test]
    async fn reevaluate_rejects_running_run() {
        let h = Harness::new(ScriptedInvoker::new());
        let ctx = h.start(None);
        assert!(h.workflow.reevaluate(&ctx).await.is_err());
        assert_eq!(h.sink.last().event_type(), "workflow_error");
        // The run itself is untouched.
        let run = RunRepo::new(h.db.clone()).get(&ctx.run_id).unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn report_error_leaves_run_row_alone() {
        let h = Harness::new(ScriptedInvoker::new());
        let ctx = h.start(None);
        h.workflow.run(&ctx).await.unwrap();

        let again = RunContext::new(ctx.run_id.clone(), h.project_id.clone(), None);
        h.workflow.report_error(&again, "internal error: boom");
        assert_eq!(again.phase(), Phase::Failed);

        let last = h.sink.last();
        let EventBody::WorkflowError { error } = &last.body else {
            panic!("expected workflow_error, got {}", last.event_type());
        };
        assert_eq!(error, "internal error: boom");
        let run = RunRepo::new(h.db.clone()).get(&ctx.run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    /// Records the run row's status at the moment each terminal event lands.
    struct StatusAtTerminal {
        runs: RunRepo,
        seen: parking_lot::Mutex<Vec<(&'static str, RunStatus)>>,
    }

    impl EventSink for StatusAtTerminal {
        fn publish(&self, event: RunEvent) {
            if event.is_terminal() {
                let status = self.runs.get(&event.run_id).unwrap().status;
                self.seen.lock().push((event.event_type(), status));
            }
        }
    }

    #[tokio::test]
    async fn run_row_is_final_before_terminal_event() {
        let db = Database::in_memory().unwrap();
        let project: NewProject =
            serde_json::from_value(json!({ "title": "Launch", "topic": "Rust in production" })).unwrap();
        let project_id = ProjectRepo::new(db.clone()).create(&project).unwrap().id;
        let sink = Arc::new(StatusAtTerminal {
            runs: RunRepo::new(db.clone()),
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let invoker = ScriptedInvoker::new().with(Critic, Scripted::Fail(InvocationError::Network("reset".into())));
        let workflow = Workflow::new(Arc::new(invoker), db.clone(), sink.clone(), WorkflowConfig::default());

        let first = RunRepo::new(db.clone()).create_running(&project_id).unwrap();
        let ctx = RunContext::new(first.id, project_id.clone(), None);
        assert!(workflow.run(&ctx).await.is_err());
        assert_eq!(ctx.phase(), Phase::Failed);

        let second = RunRepo::new(db.clone()).create_running(&project_id).unwrap();
        let ctx = RunContext::new(second.id, project_id, None);
        workflow.run(&ctx).await.unwrap();
        assert_eq!(ctx.phase(), Phase::Done);

        assert_eq!(
            *sink.seen.lock(),
            vec![
                ("workflow_error", RunStatus::Failed),
                ("workflow_complete", RunStatus::Completed)
            ]
        );
    }
}
