use serde::{Deserialize, Serialize};

use crate::agents::{AgentRole, GroundednessOutcome};
use crate::ids::{ProjectId, RunId};

/// Progress notification published on a run's channel.
///
/// Serializes flat: `{"type": "...", "run_id": "...", "project_id": "...", ...}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: RunId,
    pub project_id: ProjectId,
    #[serde(flatten)]
    pub body: EventBody,
}

impl RunEvent {
    pub fn new(run_id: RunId, project_id: ProjectId, body: EventBody) -> Self {
        Self {
            run_id,
            project_id,
            body,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.body.event_type()
    }

    /// True for the events after which a run publishes nothing further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.body,
            EventBody::WorkflowComplete { .. } | EventBody::WorkflowError { .. }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    AgentStep(StepNotice),
    EvaluationComplete {
        groundedness_score: u8,
        report: GroundednessOutcome,
    },
    WorkflowComplete {
        final_post: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        groundedness_score: Option<u8>,
        revisions: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    WorkflowError {
        error: String,
    },
}

impl EventBody {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AgentStep(_) => "agent_step",
            Self::EvaluationComplete { .. } => "evaluation_complete",
            Self::WorkflowComplete { .. } => "workflow_complete",
            Self::WorkflowError { .. } => "workflow_error",
        }
    }
}

/// One recorded step, in the shape observers render.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepNotice {
    pub step: u32,
    pub agent: AgentRole,
    pub decision: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings_preview: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
}

impl StepNotice {
    pub fn new(step: u32, agent: AgentRole, decision: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            step,
            agent,
            decision: decision.into(),
            duration_ms,
            tokens_used: None,
            findings_preview: None,
            draft_preview: None,
            feedback_preview: None,
            revision: None,
            word_count: None,
            approved: None,
        }
    }
}

/// Destination for run events. Implementations must not block and must not
/// fail the caller when nobody is listening.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: RunEvent);
}

/// Sink that discards everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: RunEvent) {}
}

/// Truncate to at most `max_chars` characters, appending an ellipsis when cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (RunId, ProjectId) {
        (RunId::from_raw("run_1"), ProjectId::from_raw("proj_1"))
    }

    #[test]
    fn agent_step_wire_shape_is_flat() {
        let (run_id, project_id) = ids();
        let mut notice = StepNotice::new(3, AgentRole::Writer, "draft ready", 1200);
        notice.word_count = Some(210);
        notice.revision = Some(1);
        let event = RunEvent::new(run_id, project_id, EventBody::AgentStep(notice));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "agent_step");
        assert_eq!(json["run_id"], "run_1");
        assert_eq!(json["project_id"], "proj_1");
        assert_eq!(json["step"], 3);
        assert_eq!(json["agent"], "writer");
        assert_eq!(json["word_count"], 210);
        assert!(json.get("approved").is_none());
        assert!(json.get("tokens_used").is_none());
    }

    #[test]
    fn workflow_error_roundtrip() {
        let (run_id, project_id) = ids();
        let event = RunEvent::new(
            run_id,
            project_id,
            EventBody::WorkflowError {
                error: "timeout after 2s".into(),
            },
        );
        let text = serde_json::to_string(&event).unwrap();
        let back: RunEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, event);
        assert!(back.is_terminal());
        assert_eq!(back.event_type(), "workflow_error");
    }

    #[test]
    fn evaluation_complete_is_not_terminal() {
        let (run_id, project_id) = ids();
        let event = RunEvent::new(
            run_id,
            project_id,
            EventBody::EvaluationComplete {
                groundedness_score: 4,
                report: GroundednessOutcome {
                    supported: vec!["claim".into()],
                    unsupported: vec![],
                    score: 4,
                    notes: String::new(),
                },
            },
        );
        assert!(!event.is_terminal());
    }

    #[test]
    fn preview_respects_char_boundaries() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("abcdef", 3), "abc...");
        assert_eq!(preview("héllo wörld", 4), "héll...");
    }
}
