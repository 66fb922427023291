//! Run orchestrator: connects the workflow engine to the server.
//!
//! At most one run is active per project. The check and the insertion of
//! the `running` row happen under the project's map entry, and the store's
//! partial unique index backs it up. A run whose phase is terminal no longer
//! holds its project: the workflow settles the phase before it publishes the
//! terminal event, so a new run may be admitted from that point on. Each run
//! executes on its own task and removes its own entry when the task ends.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use tracing::{error, info, warn};

use postcrew_core::ids::{ProjectId, RunId};
use postcrew_engine::{Phase, RunContext, Workflow};
use postcrew_store::drafts::DraftRepo;
use postcrew_store::runs::{RunRepo, RunStatus};
use postcrew_store::{Database, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidState(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(msg) => Self::NotFound(msg),
            StoreError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Store(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunKind {
    Generation,
    Regeneration,
    Reevaluation,
}

impl RunKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Regeneration => "regeneration",
            Self::Reevaluation => "reevaluation",
        }
    }
}

struct ActiveRun {
    ctx: RunContext,
    kind: RunKind,
    /// Distinguishes successive occupants of one project's slot, which can
    /// share a run id when a finished run is re-evaluated.
    ticket: u64,
}

impl ActiveRun {
    fn is_settled(&self) -> bool {
        self.ctx.phase().is_terminal()
    }
}

/// Whether a project has a run in flight, and where it is.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunState {
    pub is_running: bool,
    pub run_id: Option<RunId>,
    pub phase: Option<Phase>,
}

pub struct RunOrchestrator {
    workflow: Arc<Workflow>,
    runs: RunRepo,
    drafts: DraftRepo,
    active: Arc<DashMap<ProjectId, ActiveRun>>,
    next_ticket: AtomicU64,
}

impl RunOrchestrator {
    pub fn new(workflow: Arc<Workflow>, db: Database) -> Self {
        Self {
            workflow,
            runs: RunRepo::new(db.clone()),
            drafts: DraftRepo::new(db),
            active: Arc::new(DashMap::new()),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Create a run for the project and execute it in the background.
    pub fn start_run(&self, project_id: &ProjectId) -> Result<RunId, OrchestratorError> {
        let (ctx, ticket) = self.admit(project_id, None)?;
        let run_id = ctx.run_id.clone();
        self.spawn(ctx, RunKind::Generation, ticket);
        Ok(run_id)
    }

    /// Start a regeneration run seeded with the project's prior findings
    /// and the user's feedback.
    pub fn resume_with_feedback(&self, project_id: &ProjectId, feedback: String) -> Result<RunId, OrchestratorError> {
        let (ctx, ticket) = self.admit(project_id, Some(feedback))?;
        let run_id = ctx.run_id.clone();
        self.spawn(ctx, RunKind::Regeneration, ticket);
        Ok(run_id)
    }

    /// Evaluate a completed run's approved draft again.
    pub fn reevaluate(&self, run_id: &RunId) -> Result<RunId, OrchestratorError> {
        let run = self.runs.get(run_id)?;
        if run.status != RunStatus::Completed {
            return Err(OrchestratorError::InvalidState(format!(
                "run {run_id} is {}, only completed runs can be re-evaluated",
                run.status
            )));
        }
        if self.drafts.approved_for_run(run_id)?.is_none() {
            return Err(OrchestratorError::InvalidState(format!("run {run_id} has no approved draft")));
        }

        let project_id = run.project_id.clone();
        let (ctx, ticket) = self.occupy(&project_id, RunKind::Reevaluation, || {
            Ok(RunContext::new(run.id, run.project_id, None))
        })?;
        let run_id = ctx.run_id.clone();
        self.spawn(ctx, RunKind::Reevaluation, ticket);
        Ok(run_id)
    }

    /// Ask a run to stop before its next phase.
    pub fn cancel_run(&self, run_id: &RunId) -> bool {
        match self
            .active
            .iter()
            .find(|entry| entry.ctx.run_id == *run_id && !entry.is_settled())
        {
            Some(entry) => {
                entry.ctx.cancel.cancel();
                info!(run_id = %run_id, project_id = %entry.key(), "run cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn run_state(&self, project_id: &ProjectId) -> RunState {
        match self.active.get(project_id).filter(|run| !run.is_settled()) {
            Some(run) => RunState {
                is_running: true,
                run_id: Some(run.ctx.run_id.clone()),
                phase: Some(run.ctx.phase()),
            },
            None => RunState {
                is_running: false,
                run_id: None,
                phase: None,
            },
        }
    }

    /// Cancel every active run. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for entry in self.active.iter().filter(|entry| !entry.is_settled()) {
            entry.ctx.cancel.cancel();
            count += 1;
        }
        count
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn admit(&self, project_id: &ProjectId, feedback: Option<String>) -> Result<(RunContext, u64), OrchestratorError> {
        let kind = if feedback.is_some() {
            RunKind::Regeneration
        } else {
            RunKind::Generation
        };
        self.occupy(project_id, kind, || {
            let run = self.runs.create_running(project_id)?;
            Ok(RunContext::new(run.id, project_id.clone(), feedback))
        })
    }

    /// Claim the project's slot if it is vacant or its occupant has settled.
    /// `prepare` runs under the entry lock.
    fn occupy(
        &self,
        project_id: &ProjectId,
        kind: RunKind,
        prepare: impl FnOnce() -> Result<RunContext, OrchestratorError>,
    ) -> Result<(RunContext, u64), OrchestratorError> {
        let entry = self.active.entry(project_id.clone());
        if let Entry::Occupied(busy) = &entry {
            if !busy.get().is_settled() {
                return Err(busy_project(project_id, busy.get()));
            }
        }

        let ctx = prepare()?;
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let run = ActiveRun {
            ctx: ctx.clone(),
            kind,
            ticket,
        };
        match entry {
            Entry::Occupied(mut settled) => {
                settled.insert(run);
            }
            Entry::Vacant(slot) => {
                slot.insert(run);
            }
        }
        Ok((ctx, ticket))
    }

    fn spawn(&self, ctx: RunContext, kind: RunKind, ticket: u64) {
        let workflow = Arc::clone(&self.workflow);
        let active = Arc::clone(&self.active);
        let started_at = Instant::now();

        tokio::spawn(async move {
            let outcome = match kind {
                RunKind::Reevaluation => AssertUnwindSafe(workflow.reevaluate(&ctx))
                    .catch_unwind()
                    .await
                    .map(|r| r.map(|_| ())),
                RunKind::Generation | RunKind::Regeneration => AssertUnwindSafe(workflow.run(&ctx))
                    .catch_unwind()
                    .await
                    .map(|r| r.map(|_| ())),
            };

            let elapsed_ms = started_at.elapsed().as_millis() as u64;
            match outcome {
                Ok(Ok(())) => {
                    info!(run_id = %ctx.run_id, kind = kind.as_str(), elapsed_ms, "run finished");
                }
                Ok(Err(e)) => {
                    warn!(run_id = %ctx.run_id, kind = kind.as_str(), error = %e, "run ended with error");
                }
                Err(panic) => {
                    let msg = panic_message(&panic);
                    error!(run_id = %ctx.run_id, kind = kind.as_str(), panic = %msg, "run task panicked");
                    let message = format!("internal error: {msg}");
                    match kind {
                        // The run was already completed; only the observers hear about it.
                        RunKind::Reevaluation => workflow.report_error(&ctx, &message),
                        RunKind::Generation | RunKind::Regeneration => workflow.fail(&ctx, &message),
                    }
                }
            }

            active.remove_if(&ctx.project_id, |_, run| run.ticket == ticket);
        });
    }
}

fn busy_project(project_id: &ProjectId, run: &ActiveRun) -> OrchestratorError {
    OrchestratorError::Conflict(format!(
        "project {project_id} already has an active {} run ({})",
        run.kind.as_str(),
        run.ctx.run_id
    ))
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_owned()
}
