use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use postcrew_core::agents::{
    word_count, AgentOutcome, AgentRequest, AgentRole, CritiqueOutcome, CriterionScores, GroundednessOutcome,
    Invocation, QuerySummary, ResearchOutcome, RouteChoice, RouteDecision, Source, Verdict, WriteOutcome,
};
use postcrew_core::errors::InvocationError;

use crate::invoker::AgentInvoker;

/// One scripted reaction of a `ScriptedInvoker`.
#[derive(Clone, Debug)]
pub enum Scripted {
    Outcome(AgentOutcome),
    Fail(InvocationError),
    /// Wait, then resolve the inner step.
    Delay(Duration, Box<Scripted>),
}

impl Scripted {
    pub fn verdict(verdict: Verdict) -> Self {
        Self::Outcome(critique(verdict))
    }

    pub fn score(score: u8) -> Self {
        Self::Outcome(evaluation(score))
    }

    pub fn route(next: RouteChoice) -> Self {
        Self::Outcome(AgentOutcome::Routed(RouteDecision {
            next,
            rationale: "scripted".into(),
        }))
    }

    pub fn delayed(delay: Duration, inner: Scripted) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Agent invoker driven by per-role scripts. A role with an empty script
/// answers with a plausible default (critic approves, evaluator scores 4).
#[derive(Default)]
pub struct ScriptedInvoker {
    scripts: Mutex<HashMap<AgentRole, VecDeque<Scripted>>>,
    calls: Mutex<Vec<AgentRequest>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, role: AgentRole, step: Scripted) -> Self {
        self.push(role, step);
        self
    }

    pub fn push(&self, role: AgentRole, step: Scripted) {
        self.scripts.lock().entry(role).or_default().push_back(step);
    }

    /// Roles invoked so far, in order.
    pub fn calls(&self) -> Vec<AgentRole> {
        self.calls.lock().iter().map(AgentRequest::role).collect()
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl AgentInvoker for ScriptedInvoker {
    async fn invoke(&self, request: &AgentRequest) -> Result<Invocation, InvocationError> {
        let role = request.role();
        self.calls.lock().push(request.clone());
        let next = self.scripts.lock().get_mut(&role).and_then(VecDeque::pop_front);
        let mut step = next.unwrap_or_else(|| Scripted::Outcome(default_outcome(request)));
        loop {
            match step {
                Scripted::Outcome(outcome) => {
                    if outcome.role() != role {
                        return Err(InvocationError::malformed(
                            role.as_str(),
                            format!("scripted {} outcome for {role}", outcome.role()),
                        ));
                    }
                    return Ok(Invocation {
                        outcome,
                        tokens_used: Some(100),
                        duration_ms: 5,
                    });
                }
                Scripted::Fail(e) => return Err(e),
                Scripted::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    step = *inner;
                }
            }
        }
    }
}

fn default_outcome(request: &AgentRequest) -> AgentOutcome {
    match request {
        AgentRequest::Route(_) => AgentOutcome::Routed(RouteDecision {
            next: RouteChoice::Write,
            rationale: "reuse prior findings".into(),
        }),
        AgentRequest::Research(r) => AgentOutcome::Researched(ResearchOutcome {
            summaries: r
                .queries
                .iter()
                .map(|q| QuerySummary {
                    query: q.clone(),
                    summary: format!("- background on {q}"),
                    sources: vec![Source {
                        title: q.clone(),
                        url: "https://example.com/source".into(),
                    }],
                })
                .collect(),
            bullets: (1..=5).map(|i| format!("finding {i} about {}", r.brief.topic)).collect(),
        }),
        AgentRequest::Write(w) => {
            let words = w.brief.word_range.min.max(1) as usize;
            let content = vec!["word"; words].join(" ");
            AgentOutcome::Wrote(WriteOutcome {
                word_count: word_count(&content),
                content,
                attempts: 1,
                in_range: true,
            })
        }
        AgentRequest::Critique(_) => critique(Verdict::Approve),
        AgentRequest::Evaluate(_) => evaluation(4),
    }
}

fn critique(verdict: Verdict) -> AgentOutcome {
    AgentOutcome::Critiqued(CritiqueOutcome {
        scores: CriterionScores::default(),
        verdict,
        notes: match verdict {
            Verdict::Approve => "ready to publish".into(),
            Verdict::Revise => "sharpen the opening line".into(),
        },
    })
}

fn evaluation(score: u8) -> AgentOutcome {
    AgentOutcome::Evaluated(GroundednessOutcome {
        supported: vec!["claim backed by research".into()],
        unsupported: vec![],
        score,
        notes: String::new(),
    })
}
