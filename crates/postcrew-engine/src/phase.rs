//! Deterministic supervisor routing.
//!
//! `classify` is a pure function of the run's observable progress. It either
//! names the next phase or reports that the situation is ambiguous, in which
//! case the workflow asks the routing model exactly once.

use serde::{Deserialize, Serialize};

use postcrew_core::agents::{AgentRole, RouteChoice, Verdict};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Research,
    Write,
    Critique,
    Evaluate,
    Done,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Research => "research",
            Self::Write => "write",
            Self::Critique => "critique",
            Self::Evaluate => "evaluate",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Agent that runs in this phase, if any.
    pub fn agent(&self) -> Option<AgentRole> {
        match self {
            Self::Research => Some(AgentRole::Researcher),
            Self::Write => Some(AgentRole::Writer),
            Self::Critique => Some(AgentRole::Critic),
            Self::Evaluate => Some(AgentRole::Evaluator),
            Self::Init | Self::Done | Self::Failed => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RouteChoice> for Phase {
    fn from(choice: RouteChoice) -> Self {
        match choice {
            RouteChoice::Research => Self::Research,
            RouteChoice::Write => Self::Write,
        }
    }
}

/// What the supervisor can see when deciding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub has_findings: bool,
    pub has_draft: bool,
    pub last_verdict: Option<Verdict>,
    pub total_revisions: u32,
    pub max_revisions: u32,
    pub evaluated: bool,
    pub feedback_pending: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Classification {
    Decided { phase: Phase, reason: String },
    /// The critic still wants changes but the revision budget is spent; the
    /// last draft is approved as-is.
    CeilingReached { revisions: u32 },
    Ambiguous { reason: String },
}

pub fn classify(s: &WorkflowSnapshot) -> Classification {
    let decided = |phase: Phase, reason: String| Classification::Decided { phase, reason };

    if s.evaluated {
        return decided(Phase::Done, "evaluation recorded".into());
    }

    if s.has_draft {
        return match s.last_verdict {
            None => decided(Phase::Critique, "draft awaiting review".into()),
            Some(Verdict::Approve) => decided(Phase::Evaluate, "critic approved the draft".into()),
            Some(Verdict::Revise) if s.total_revisions >= s.max_revisions => {
                Classification::CeilingReached {
                    revisions: s.total_revisions,
                }
            }
            Some(Verdict::Revise) => decided(
                Phase::Write,
                format!(
                    "critic requested revision {} of {}",
                    s.total_revisions + 1,
                    s.max_revisions
                ),
            ),
        };
    }

    match (s.has_findings, s.feedback_pending) {
        (true, true) => Classification::Ambiguous {
            reason: "prior findings available and user feedback pending".into(),
        },
        (true, false) => decided(Phase::Write, "research complete".into()),
        (false, _) => decided(Phase::Research, "no research yet".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> WorkflowSnapshot {
        WorkflowSnapshot {
            has_findings: false,
            has_draft: false,
            last_verdict: None,
            total_revisions: 0,
            max_revisions: 5,
            evaluated: false,
            feedback_pending: false,
        }
    }

    fn phase_of(c: Classification) -> Phase {
        match c {
            Classification::Decided { phase, .. } => phase,
            other => panic!("expected a decision, got {other:?}"),
        }
    }

    #[test]
    fn fresh_run_researches() {
        assert_eq!(phase_of(classify(&snapshot())), Phase::Research);
    }

    #[test]
    fn findings_lead_to_write() {
        let s = WorkflowSnapshot {
            has_findings: true,
            ..snapshot()
        };
        assert_eq!(phase_of(classify(&s)), Phase::Write);
    }

    #[test]
    fn revise_loops_back_to_write_until_ceiling() {
        let mut s = WorkflowSnapshot {
            has_findings: true,
            has_draft: true,
            last_verdict: Some(Verdict::Revise),
            ..snapshot()
        };
        for revisions in 0..5 {
            s.total_revisions = revisions;
            assert_eq!(phase_of(classify(&s)), Phase::Write);
        }
        s.total_revisions = 5;
        assert_eq!(classify(&s), Classification::CeilingReached { revisions: 5 });
    }

    #[test]
    fn approval_goes_to_evaluate_then_done() {
        let mut s = WorkflowSnapshot {
            has_findings: true,
            has_draft: true,
            last_verdict: Some(Verdict::Approve),
            ..snapshot()
        };
        assert_eq!(phase_of(classify(&s)), Phase::Evaluate);
        s.evaluated = true;
        assert_eq!(phase_of(classify(&s)), Phase::Done);
    }

    #[test]
    fn regeneration_with_findings_is_ambiguous() {
        let s = WorkflowSnapshot {
            has_findings: true,
            feedback_pending: true,
            ..snapshot()
        };
        assert!(matches!(classify(&s), Classification::Ambiguous { .. }));

        // Without findings there is nothing to choose between.
        let s = WorkflowSnapshot {
            feedback_pending: true,
            ..snapshot()
        };
        assert_eq!(phase_of(classify(&s)), Phase::Research);
    }

    #[test]
    fn unreviewed_draft_goes_to_critique() {
        let s = WorkflowSnapshot {
            has_findings: true,
            has_draft: true,
            ..snapshot()
        };
        assert_eq!(phase_of(classify(&s)), Phase::Critique);
    }

    #[test]
    fn phase_agents() {
        assert_eq!(Phase::Write.agent(), Some(AgentRole::Writer));
        assert_eq!(Phase::Done.agent(), None);
        assert!(Phase::Failed.is_terminal());
        assert_eq!(Phase::from(RouteChoice::Research), Phase::Research);
    }
}
