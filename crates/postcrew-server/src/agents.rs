//! Per-agent surface: a capability card for each role and direct invocation
//! of a single role outside any run.
//!
//! Invocation is synchronous. The returned task is already settled, so there
//! is no task store to poll.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use postcrew_core::agents::{AgentRequest, AgentRole, Invocation};
use postcrew_core::ids::TaskId;
use postcrew_engine::invoke_bounded;

use crate::handlers::{ApiError, AppState};

const ROLES: [AgentRole; 5] = [
    AgentRole::Supervisor,
    AgentRole::Researcher,
    AgentRole::Writer,
    AgentRole::Critic,
    AgentRole::Evaluator,
];

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Skill {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentCard {
    pub agent: AgentRole,
    pub name: &'static str,
    pub description: &'static str,
    /// Path accepting an `AgentRequest` of the matching kind.
    pub url: String,
    /// `kind` tag the request body must carry.
    pub request_kind: &'static str,
    pub skills: Vec<Skill>,
}

impl AgentCard {
    pub fn for_role(role: AgentRole) -> Self {
        let (name, description, request_kind, skill) = match role {
            AgentRole::Supervisor => (
                "Post Supervisor",
                "Decides whether an ambiguous run needs more research or a new draft.",
                "route",
                Skill {
                    id: "route-workflow",
                    name: "Route Workflow",
                    description: "Choose the next step of a post run",
                },
            ),
            AgentRole::Researcher => (
                "Post Researcher",
                "Searches the web for each query and condenses the results into findings.",
                "research",
                Skill {
                    id: "research-topic",
                    name: "Research Topic",
                    description: "Research a topic and return summarized findings",
                },
            ),
            AgentRole::Writer => (
                "Post Writer",
                "Writes or revises a post from findings and critique notes.",
                "write",
                Skill {
                    id: "write-post",
                    name: "Write Post",
                    description: "Write or revise a post within the word range",
                },
            ),
            AgentRole::Critic => (
                "Post Critic",
                "Scores a draft against the quality criteria and approves or asks for a revision.",
                "critique",
                Skill {
                    id: "critique-post",
                    name: "Critique Post",
                    description: "Review a draft and return a verdict with notes",
                },
            ),
            AgentRole::Evaluator => (
                "Post Evaluator",
                "Checks each claim of a post against the research findings.",
                "evaluate",
                Skill {
                    id: "evaluate-groundedness",
                    name: "Evaluate Groundedness",
                    description: "Score how well the post is supported by its findings",
                },
            ),
        };
        Self {
            agent: role,
            name,
            description,
            url: format!("/api/agents/{role}/invoke"),
            request_kind,
            skills: vec![skill],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct TaskFailure {
    pub kind: &'static str,
    pub message: String,
}

/// Settled result of one direct invocation.
#[derive(Clone, Debug, Serialize)]
pub struct AgentTask {
    pub id: TaskId,
    pub agent: AgentRole,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invocation: Option<Invocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
    pub finished_at: String,
}

fn parse_role(name: &str) -> Result<AgentRole, ApiError> {
    name.parse::<AgentRole>().map_err(ApiError::NotFound)
}

pub async fn list_agents() -> Json<Value> {
    let cards: Vec<AgentCard> = ROLES.into_iter().map(AgentCard::for_role).collect();
    Json(json!({ "agents": cards }))
}

pub async fn agent_card(Path(name): Path<String>) -> Result<Json<AgentCard>, ApiError> {
    Ok(Json(AgentCard::for_role(parse_role(&name)?)))
}

pub async fn invoke_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Result<Json<AgentRequest>, JsonRejection>,
) -> Result<Json<AgentTask>, ApiError> {
    let role = parse_role(&name)?;
    let Json(request) = payload?;
    if request.role() != role {
        return Err(ApiError::InvalidParams(format!(
            "request kind {} belongs to the {} agent, not {role}",
            AgentCard::for_role(request.role()).request_kind,
            request.role()
        )));
    }

    let id = TaskId::new();
    let result = invoke_bounded(state.invoker.as_ref(), &request, state.invoke_timeout).await;
    let task = match result {
        Ok(invocation) => {
            tracing::info!(task_id = %id, agent = %role, duration_ms = invocation.duration_ms, "agent task completed");
            AgentTask {
                id,
                agent: role,
                state: TaskState::Completed,
                invocation: Some(invocation),
                error: None,
                finished_at: Utc::now().to_rfc3339(),
            }
        }
        Err(e) => {
            tracing::warn!(task_id = %id, agent = %role, kind = e.error_kind(), error = %e, "agent task failed");
            AgentTask {
                id,
                agent: role,
                state: TaskState::Failed,
                invocation: None,
                error: Some(TaskFailure {
                    kind: e.error_kind(),
                    message: e.to_string(),
                }),
                finished_at: Utc::now().to_rfc3339(),
            }
        }
    };
    Ok(Json(task))
}
