//! Agent roles and the typed requests/outcomes exchanged with them.
//!
//! Every invocation takes one `AgentRequest` and produces one `Invocation`
//! wrapping the role-specific `AgentOutcome`. Both sides serialize to JSON so
//! they can be stored verbatim as step input/output snapshots.

use serde::{Deserialize, Serialize};

use crate::project::ProjectBrief;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Supervisor,
    Researcher,
    Writer,
    Critic,
    Evaluator,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supervisor => "supervisor",
            Self::Researcher => "researcher",
            Self::Writer => "writer",
            Self::Critic => "critic",
            Self::Evaluator => "evaluator",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "supervisor" => Ok(Self::Supervisor),
            "researcher" => Ok(Self::Researcher),
            "writer" => Ok(Self::Writer),
            "critic" => Ok(Self::Critic),
            "evaluator" => Ok(Self::Evaluator),
            other => Err(format!("unknown agent: {other}")),
        }
    }
}

/// Where the routing model may send an ambiguous run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteChoice {
    Research,
    Write,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteRequest {
    pub brief: ProjectBrief,
    pub findings: Vec<String>,
    pub draft: Option<String>,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub next: RouteChoice,
    pub rationale: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResearchRequest {
    pub brief: ProjectBrief,
    pub queries: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub url: String,
}

/// Summary of one research query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuerySummary {
    pub query: String,
    pub summary: String,
    pub sources: Vec<Source>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResearchOutcome {
    pub summaries: Vec<QuerySummary>,
    pub bullets: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteRequest {
    pub brief: ProjectBrief,
    pub findings: Vec<String>,
    pub previous_draft: Option<String>,
    pub critique_notes: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub content: String,
    pub word_count: u32,
    pub attempts: u32,
    pub in_range: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CritiqueRequest {
    pub brief: ProjectBrief,
    pub draft: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Revise,
}

/// The six fixed critique criteria, each scored 0-10.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionScores {
    pub hook: u8,
    pub clarity: u8,
    pub value: u8,
    pub structure: u8,
    pub engagement: u8,
    pub tone: u8,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CritiqueOutcome {
    pub scores: CriterionScores,
    pub verdict: Verdict,
    pub notes: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvaluateRequest {
    pub draft: String,
    pub findings: Vec<String>,
}

pub const MAX_GROUNDEDNESS_SCORE: u8 = 5;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroundednessOutcome {
    pub supported: Vec<String>,
    pub unsupported: Vec<String>,
    pub score: u8,
    pub notes: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentRequest {
    Route(RouteRequest),
    Research(ResearchRequest),
    Write(WriteRequest),
    Critique(CritiqueRequest),
    Evaluate(EvaluateRequest),
}

impl AgentRequest {
    pub fn role(&self) -> AgentRole {
        match self {
            Self::Route(_) => AgentRole::Supervisor,
            Self::Research(_) => AgentRole::Researcher,
            Self::Write(_) => AgentRole::Writer,
            Self::Critique(_) => AgentRole::Critic,
            Self::Evaluate(_) => AgentRole::Evaluator,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentOutcome {
    Routed(RouteDecision),
    Researched(ResearchOutcome),
    Wrote(WriteOutcome),
    Critiqued(CritiqueOutcome),
    Evaluated(GroundednessOutcome),
}

impl AgentOutcome {
    pub fn role(&self) -> AgentRole {
        match self {
            Self::Routed(_) => AgentRole::Supervisor,
            Self::Researched(_) => AgentRole::Researcher,
            Self::Wrote(_) => AgentRole::Writer,
            Self::Critiqued(_) => AgentRole::Critic,
            Self::Evaluated(_) => AgentRole::Evaluator,
        }
    }
}

/// Result of one agent invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub outcome: AgentOutcome,
    pub tokens_used: Option<u32>,
    pub duration_ms: u64,
}

/// Whitespace-separated word count, as shown to users.
pub fn word_count(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_string_roundtrip() {
        for role in [
            AgentRole::Supervisor,
            AgentRole::Researcher,
            AgentRole::Writer,
            AgentRole::Critic,
            AgentRole::Evaluator,
        ] {
            let parsed: AgentRole = role.as_str().parse().unwrap();
            assert_eq!(parsed, role);
        }
        assert!("editor".parse::<AgentRole>().is_err());
    }

    #[test]
    fn request_role_matches_variant() {
        let req = AgentRequest::Evaluate(EvaluateRequest {
            draft: "post".into(),
            findings: vec![],
        });
        assert_eq!(req.role(), AgentRole::Evaluator);
    }

    #[test]
    fn outcome_serializes_with_kind_tag() {
        let outcome = AgentOutcome::Critiqued(CritiqueOutcome {
            scores: CriterionScores::default(),
            verdict: Verdict::Revise,
            notes: "tighten the hook".into(),
        });
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["kind"], "critiqued");
        assert_eq!(json["verdict"], "revise");
        assert_eq!(outcome.role(), AgentRole::Critic);
    }

    #[test]
    fn word_count_ignores_extra_whitespace() {
        assert_eq!(word_count("  one two\n\nthree  "), 3);
        assert_eq!(word_count(""), 0);
    }
}
