//! Agent invocation.
//!
//! `AgentInvoker` is the seam between the workflow and the model-backed
//! agents. `LlmAgentInvoker` implements each role on top of an injected
//! completion service and search service.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use postcrew_core::agents::{
    word_count, AgentOutcome, AgentRequest, AgentRole, CritiqueOutcome, CritiqueRequest, CriterionScores,
    EvaluateRequest, GroundednessOutcome, Invocation, QuerySummary, ResearchOutcome, ResearchRequest,
    RouteChoice, RouteDecision, RouteRequest, Source, Verdict, WriteOutcome, WriteRequest, MAX_GROUNDEDNESS_SCORE,
};
use postcrew_core::errors::InvocationError;
use postcrew_core::events::preview;
use postcrew_core::project::ProjectBrief;
use postcrew_core::provider::{CompletionRequest, CompletionService, SearchService};

/// Search hits kept per research query.
pub const RESULTS_PER_QUERY: usize = 3;
/// Research bullets asked of the summarizer.
pub const MIN_BULLETS: usize = 5;
/// Upper bound on research bullets handed to the writer.
pub const MAX_BULLETS: usize = 7;
/// Writer attempts before an out-of-range draft is accepted.
pub const MAX_WRITE_ATTEMPTS: u32 = 3;

const APPROVAL_MARKER: &str = "APPROVED";

#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: &AgentRequest) -> Result<Invocation, InvocationError>;
}

/// Invoke under `timeout` and check the outcome belongs to the requested role.
pub async fn invoke_bounded(
    invoker: &dyn AgentInvoker,
    request: &AgentRequest,
    timeout: Duration,
) -> Result<Invocation, InvocationError> {
    let role = request.role();
    let invocation = match tokio::time::timeout(timeout, invoker.invoke(request)).await {
        Ok(result) => result?,
        Err(_) => return Err(InvocationError::Timeout(timeout)),
    };
    if invocation.outcome.role() != role {
        return Err(InvocationError::malformed(
            role.as_str(),
            format!("received a {} outcome", invocation.outcome.role()),
        ));
    }
    Ok(invocation)
}

pub struct LlmAgentInvoker {
    chat: Arc<dyn CompletionService>,
    evaluator: Arc<dyn CompletionService>,
    search: Arc<dyn SearchService>,
}

struct Produced {
    outcome: AgentOutcome,
    tokens_used: Option<u32>,
}

impl LlmAgentInvoker {
    /// `evaluator` may be a stronger model than `chat`; it only serves the
    /// groundedness check.
    pub fn new(
        chat: Arc<dyn CompletionService>,
        evaluator: Arc<dyn CompletionService>,
        search: Arc<dyn SearchService>,
    ) -> Self {
        Self {
            chat,
            evaluator,
            search,
        }
    }

    async fn route(&self, req: &RouteRequest) -> Result<Produced, InvocationError> {
        #[derive(Deserialize)]
        struct Reply {
            next: RouteChoice,
            #[serde(default)]
            rationale: String,
        }

        let user = format!(
            "{}\nSituation: {}\nPrior findings:\n{}\nCurrent draft: {}\n\n\
             Reply with JSON {{\"next\": \"research\" | \"write\", \"rationale\": \"...\"}}.",
            describe_brief(&req.brief),
            req.reason,
            bullet_list(&req.findings),
            req.draft.as_deref().unwrap_or("(none)"),
        );
        let request = CompletionRequest::new(
            "You coordinate a content team. Decide whether to research again or go straight to writing.",
            user,
        )
        .json()
        .with_temperature(0.0);
        let completion = self.chat.complete(&request).await?;
        let reply: Reply = parse_json(AgentRole::Supervisor, &completion.text)?;
        Ok(Produced {
            outcome: AgentOutcome::Routed(RouteDecision {
                next: reply.next,
                rationale: reply.rationale,
            }),
            tokens_used: completion.tokens_used,
        })
    }

    async fn research(&self, req: &ResearchRequest) -> Result<Produced, InvocationError> {
        #[derive(Deserialize)]
        struct Reply {
            bullets: Vec<String>,
        }

        let mut summaries = Vec::with_capacity(req.queries.len());
        for query in &req.queries {
            let hits = self.search.search(query, RESULTS_PER_QUERY).await?;
            debug!(query = %query, hits = hits.len(), "search complete");
            let summary = hits
                .iter()
                .map(|h| format!("- {}: {}", h.title, preview(&h.content, 300)))
                .collect::<Vec<_>>()
                .join("\n");
            summaries.push(QuerySummary {
                query: query.clone(),
                summary,
                sources: hits
                    .into_iter()
                    .map(|h| Source {
                        title: h.title,
                        url: h.url,
                    })
                    .collect(),
            });
        }

        let material = summaries
            .iter()
            .map(|s| format!("Query: {}\n{}", s.query, s.summary))
            .collect::<Vec<_>>()
            .join("\n\n");
        let request = CompletionRequest::new(
            "You are a research analyst. Condense search results into 5-7 factual bullet points.",
            format!(
                "{}\n\nSearch results:\n{material}\n\nReply with JSON {{\"bullets\": [\"...\"]}}.",
                describe_brief(&req.brief)
            ),
        )
        .json()
        .with_temperature(0.2);
        let completion = self.chat.complete(&request).await?;
        let reply: Reply = parse_json(AgentRole::Researcher, &completion.text)?;

        let mut bullets: Vec<String> = reply
            .bullets
            .into_iter()
            .map(|b| b.trim().trim_start_matches(['-', '*', ' ']).to_string())
            .filter(|b| !b.is_empty())
            .collect();
        if bullets.is_empty() {
            return Err(InvocationError::malformed(AgentRole::Researcher.as_str(), "no bullets returned"));
        }
        if bullets.len() < MIN_BULLETS {
            debug!(count = bullets.len(), min = MIN_BULLETS, "research returned fewer bullets than requested");
        }
        bullets.truncate(MAX_BULLETS);

        Ok(Produced {
            outcome: AgentOutcome::Researched(ResearchOutcome { summaries, bullets }),
            tokens_used: completion.tokens_used,
        })
    }

    async fn write(&self, req: &WriteRequest) -> Result<Produced, InvocationError> {
        let range = req.brief.word_range;
        let mut tokens = TokenTally::default();
        let mut last = String::new();
        let mut count = 0;

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut user = format!(
                "{}\n\nResearch findings:\n{}",
                describe_brief(&req.brief),
                bullet_list(&req.findings)
            );
            if let Some(instructions) = &req.brief.template_instructions {
                user.push_str(&format!("\n\nStructure: {instructions}"));
            }
            if let Some(example) = &req.brief.example_post {
                user.push_str(&format!("\n\nExample post:\n{example}"));
            }
            if let Some(feedback) = &req.brief.feedback {
                user.push_str(&format!("\n\nUser feedback on the previous result: {feedback}"));
            }
            if let (Some(draft), Some(notes)) = (&req.previous_draft, &req.critique_notes) {
                user.push_str(&format!("\n\nPrevious draft:\n{draft}\n\nEditor notes:\n{notes}"));
            }
            if attempt > 1 {
                user.push_str(&format!(
                    "\n\nYour last attempt had {count} words. It must have between {} and {} words.",
                    range.min, range.max
                ));
            }

            let request = CompletionRequest::new(
                "You are a LinkedIn ghostwriter. Reply with the post text only.",
                user,
            )
            .with_temperature(0.7);
            let completion = self.chat.complete(&request).await?;
            tokens.add(completion.tokens_used);

            last = completion.text.trim().to_string();
            count = word_count(&last);
            if range.contains(count) {
                return Ok(tokens.produced(AgentOutcome::Wrote(WriteOutcome {
                    content: last,
                    word_count: count,
                    attempts: attempt,
                    in_range: true,
                })));
            }
            debug!(attempt, words = count, min = range.min, max = range.max, "draft outside word range");
        }

        warn!(words = count, "accepting draft outside word range");
        Ok(tokens.produced(AgentOutcome::Wrote(WriteOutcome {
            content: last,
            word_count: count,
            attempts: MAX_WRITE_ATTEMPTS,
            in_range: false,
        })))
    }

    async fn critique(&self, req: &CritiqueRequest) -> Result<Produced, InvocationError> {
        #[derive(Deserialize)]
        struct Reply {
            #[serde(default)]
            scores: CriterionScores,
            verdict: Verdict,
            #[serde(default)]
            notes: String,
        }

        let request = CompletionRequest::new(
            "You are a demanding editor. Score the post 0-10 on hook, clarity, value, structure, \
             engagement and tone, then approve it or ask for a revision.",
            format!(
                "{}\n\nPost:\n{}\n\nReply with JSON {{\"scores\": {{...}}, \"verdict\": \"approve\" | \"revise\", \
                 \"notes\": \"...\"}}.",
                describe_brief(&req.brief),
                req.draft
            ),
        )
        .json()
        .with_temperature(0.0);
        let completion = self.chat.complete(&request).await?;

        let outcome = match parse_json::<Reply>(AgentRole::Critic, &completion.text) {
            Ok(reply) => CritiqueOutcome {
                scores: reply.scores,
                verdict: reply.verdict,
                notes: reply.notes,
            },
            Err(e) => {
                // Free-form reviews approve by saying so explicitly.
                debug!(error = %e, "critic reply was not structured");
                let verdict = if completion.text.contains(APPROVAL_MARKER) {
                    Verdict::Approve
                } else {
                    Verdict::Revise
                };
                CritiqueOutcome {
                    scores: CriterionScores::default(),
                    verdict,
                    notes: completion.text.trim().to_string(),
                }
            }
        };
        Ok(Produced {
            outcome: AgentOutcome::Critiqued(outcome),
            tokens_used: completion.tokens_used,
        })
    }

    async fn evaluate(&self, req: &EvaluateRequest) -> Result<Produced, InvocationError> {
        let request = CompletionRequest::new(
            "You check social posts for claims not backed by the supplied research.",
            format!(
                "Research:\n{}\n\nPost:\n{}\n\nReply with JSON {{\"supported\": [...], \"unsupported\": [...], \
                 \"score\": 0-{MAX_GROUNDEDNESS_SCORE}, \"notes\": \"...\"}}.",
                bullet_list(&req.findings),
                req.draft
            ),
        )
        .json()
        .with_temperature(0.0);
        let completion = self.evaluator.complete(&request).await?;
        let report: GroundednessOutcome = parse_json(AgentRole::Evaluator, &completion.text)?;
        if report.score > MAX_GROUNDEDNESS_SCORE {
            return Err(InvocationError::malformed(
                AgentRole::Evaluator.as_str(),
                format!("score {} outside 0-{MAX_GROUNDEDNESS_SCORE}", report.score),
            ));
        }
        Ok(Produced {
            outcome: AgentOutcome::Evaluated(report),
            tokens_used: completion.tokens_used,
        })
    }
}

#[async_trait]
impl AgentInvoker for LlmAgentInvoker {
    #[instrument(skip_all, fields(agent = %request.role()))]
    async fn invoke(&self, request: &AgentRequest) -> Result<Invocation, InvocationError> {
        let start = Instant::now();
        let produced = match request {
            AgentRequest::Route(r) => self.route(r).await,
            AgentRequest::Research(r) => self.research(r).await,
            AgentRequest::Write(r) => self.write(r).await,
            AgentRequest::Critique(r) => self.critique(r).await,
            AgentRequest::Evaluate(r) => self.evaluate(r).await,
        }?;
        Ok(Invocation {
            outcome: produced.outcome,
            tokens_used: produced.tokens_used,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[derive(Default)]
struct TokenTally(Option<u32>);

impl TokenTally {
    fn add(&mut self, tokens: Option<u32>) {
        if let Some(t) = tokens {
            self.0 = Some(self.0.unwrap_or(0) + t);
        }
    }

    fn produced(self, outcome: AgentOutcome) -> Produced {
        Produced {
            outcome,
            tokens_used: self.0,
        }
    }
}

fn describe_brief(brief: &ProjectBrief) -> String {
    let mut out = format!(
        "Topic: {}\nTone: {}\nAudience: {}\nLanguage: {}\nLength: {}-{} words",
        brief.topic, brief.tone, brief.audience, brief.language, brief.word_range.min, brief.word_range.max
    );
    let flag = |on: bool| if on { "yes" } else { "no" };
    out.push_str(&format!(
        "\nHashtags: {}\nCall to action: {}\nEmoji: {}",
        flag(brief.include_hashtags),
        flag(brief.include_cta),
        flag(brief.include_emoji)
    ));
    out
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "(none)".into();
    }
    items.iter().map(|i| format!("- {i}")).collect::<Vec<_>>().join("\n")
}

/// Parse a JSON reply, tolerating a surrounding markdown code fence.
fn parse_json<T: DeserializeOwned>(agent: AgentRole, text: &str) -> Result<T, InvocationError> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).map_err(|e| InvocationError::malformed(agent.as_str(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use postcrew_core::ids::ProjectId;
    use postcrew_core::project::WordRange;
    use postcrew_llm::{MockCompletion, MockReply, MockSearch};
    use serde_json::json;

    fn brief() -> ProjectBrief {
        let mut b = ProjectBrief::new(ProjectId::from_raw("proj_1"), "Rust in production");
        b.word_range = WordRange { min: 3, max: 6 };
        b
    }

    fn invoker(chat: Vec<MockReply>) -> (LlmAgentInvoker, Arc<MockCompletion>, Arc<MockSearch>) {
        let chat = Arc::new(MockCompletion::new(chat));
        let search = Arc::new(MockSearch::new());
        let inv = LlmAgentInvoker::new(chat.clone(), chat.clone(), search.clone());
        (inv, chat, search)
    }

    #[tokio::test]
    async fn research_caps_bullets_and_keeps_sources() {
        let bullets: Vec<String> = (1..=9).map(|i| format!("- point {i}")).collect();
        let (inv, _, search) = invoker(vec![MockReply::json(json!({ "bullets": bullets }))]);
        let req = AgentRequest::Research(ResearchRequest {
            brief: brief(),
            queries: vec!["Rust in production".into()],
        });

        let out = inv.invoke(&req).await.unwrap();
        let AgentOutcome::Researched(research) = out.outcome else {
            panic!("expected research outcome");
        };
        assert_eq!(research.bullets.len(), MAX_BULLETS);
        assert_eq!(research.bullets[0], "point 1");
        assert_eq!(research.summaries.len(), 1);
        assert_eq!(research.summaries[0].sources.len(), RESULTS_PER_QUERY);
        assert_eq!(search.queries(), vec!["Rust in production".to_string()]);
    }

    #[tokio::test]
    async fn research_keeps_short_bullet_lists() {
        let (inv, _, _) = invoker(vec![MockReply::json(json!({ "bullets": ["- one", "two", "* three"] }))]);
        let req = AgentRequest::Research(ResearchRequest {
            brief: brief(),
            queries: vec!["Rust in production".into()],
        });

        let out = inv.invoke(&req).await.unwrap();
        let AgentOutcome::Researched(research) = out.outcome else {
            panic!("expected research outcome");
        };
        assert!(research.bullets.len() < MIN_BULLETS);
        assert_eq!(research.bullets, vec!["one", "two", "three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_invoke_times_out() {
        use crate::scripted::{Scripted, ScriptedInvoker};

        let slow = ScriptedInvoker::new().with(
            AgentRole::Evaluator,
            Scripted::delayed(Duration::from_secs(30), Scripted::score(4)),
        );
        let req = AgentRequest::Evaluate(EvaluateRequest {
            draft: "post".into(),
            findings: vec![],
        });
        let err = invoke_bounded(&slow, &req, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, InvocationError::Timeout(d) if d == Duration::from_secs(5)));

        let out = invoke_bounded(&slow, &req, Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.outcome.role(), AgentRole::Evaluator);
    }

    #[tokio::test]
    async fn research_search_failure_propagates() {
        let chat = Arc::new(MockCompletion::new(vec![]));
        let search = Arc::new(MockSearch::new().fail_first(InvocationError::Network("down".into()), 1));
        let inv = LlmAgentInvoker::new(chat.clone(), chat, search);
        let req = AgentRequest::Research(ResearchRequest {
            brief: brief(),
            queries: vec!["q".into()],
        });
        assert!(matches!(inv.invoke(&req).await, Err(InvocationError::Network(_))));
    }

    fn write_request() -> AgentRequest {
        AgentRequest::Write(WriteRequest {
            brief: brief(),
            findings: vec!["fact".into()],
            previous_draft: None,
            critique_notes: None,
        })
    }

    #[tokio::test]
    async fn writer_retries_until_in_range() {
        let (inv, chat, _) = invoker(vec![
            MockReply::text("too short"),
            MockReply::text("four words right here"),
        ]);
        let out = inv.invoke(&write_request()).await.unwrap();
        let AgentOutcome::Wrote(w) = out.outcome else {
            panic!("expected write outcome");
        };
        assert_eq!(w.attempts, 2);
        assert!(w.in_range);
        assert_eq!(w.word_count, 4);
        assert_eq!(out.tokens_used, Some(6));
        assert_eq!(chat.call_count(), 2);
    }

    #[tokio::test]
    async fn writer_accepts_out_of_range_after_three_attempts() {
        let (inv, chat, _) = invoker(vec![
            MockReply::text("one"),
            MockReply::text("two"),
            MockReply::text("three"),
        ]);
        let out = inv.invoke(&write_request()).await.unwrap();
        let AgentOutcome::Wrote(w) = out.outcome else {
            panic!("expected write outcome");
        };
        assert_eq!(w.attempts, MAX_WRITE_ATTEMPTS);
        assert!(!w.in_range);
        assert_eq!(w.content, "three");
        assert_eq!(chat.remaining(), 0);
    }

    fn critique_request() -> AgentRequest {
        AgentRequest::Critique(CritiqueRequest {
            brief: brief(),
            draft: "post".into(),
        })
    }

    #[tokio::test]
    async fn critic_structured_reply() {
        let (inv, _, _) = invoker(vec![MockReply::text(
            "```json\n{\"scores\": {\"hook\": 8, \"clarity\": 7, \"value\": 9, \"structure\": 8, \
             \"engagement\": 6, \"tone\": 9}, \"verdict\": \"revise\", \"notes\": \"stronger opening\"}\n```",
        )]);
        let out = inv.invoke(&critique_request()).await.unwrap();
        let AgentOutcome::Critiqued(c) = out.outcome else {
            panic!("expected critique outcome");
        };
        assert_eq!(c.verdict, Verdict::Revise);
        assert_eq!(c.scores.hook, 8);
        assert_eq!(c.notes, "stronger opening");
    }

    #[tokio::test]
    async fn critic_free_text_falls_back_to_marker() {
        let (inv, _, _) = invoker(vec![MockReply::text("Looks great. APPROVED"), MockReply::text("Needs work")]);
        let first = inv.invoke(&critique_request()).await.unwrap();
        let second = inv.invoke(&critique_request()).await.unwrap();
        assert!(matches!(first.outcome, AgentOutcome::Critiqued(CritiqueOutcome { verdict: Verdict::Approve, .. })));
        assert!(matches!(second.outcome, AgentOutcome::Critiqued(CritiqueOutcome { verdict: Verdict::Revise, .. })));
    }

    #[tokio::test]
    async fn evaluator_rejects_out_of_scale_score() {
        let (inv, _, _) = invoker(vec![
            MockReply::json(json!({"supported": ["a"], "unsupported": [], "score": 4, "notes": "ok"})),
            MockReply::json(json!({"supported": [], "unsupported": [], "score": 9, "notes": ""})),
        ]);
        let req = AgentRequest::Evaluate(EvaluateRequest {
            draft: "post".into(),
            findings: vec!["a".into()],
        });
        let ok = inv.invoke(&req).await.unwrap();
        assert!(matches!(ok.outcome, AgentOutcome::Evaluated(GroundednessOutcome { score: 4, .. })));
        let err = inv.invoke(&req).await.unwrap_err();
        assert_eq!(err.error_kind(), "malformed_output");
    }

    #[tokio::test]
    async fn evaluator_uses_its_own_service() {
        let chat = Arc::new(MockCompletion::new(vec![]));
        let eval = Arc::new(MockCompletion::new(vec![MockReply::json(
            json!({"supported": [], "unsupported": [], "score": 5, "notes": ""}),
        )]));
        let inv = LlmAgentInvoker::new(chat.clone(), eval.clone(), Arc::new(MockSearch::new()));
        let req = AgentRequest::Evaluate(EvaluateRequest {
            draft: "post".into(),
            findings: vec![],
        });
        inv.invoke(&req).await.unwrap();
        assert_eq!(chat.call_count(), 0);
        assert_eq!(eval.call_count(), 1);
    }

    #[tokio::test]
    async fn route_parses_choice_and_rejects_garbage() {
        let (inv, _, _) = invoker(vec![
            MockReply::json(json!({"next": "write", "rationale": "findings still fresh"})),
            MockReply::text("maybe research?"),
        ]);
        let req = AgentRequest::Route(RouteRequest {
            brief: brief(),
            findings: vec!["a".into()],
            draft: None,
            reason: "feedback pending".into(),
        });
        let out = inv.invoke(&req).await.unwrap();
        assert_eq!(
            out.outcome,
            AgentOutcome::Routed(RouteDecision {
                next: RouteChoice::Write,
                rationale: "findings still fresh".into(),
            })
        );
        assert!(matches!(
            inv.invoke(&req).await,
            Err(InvocationError::MalformedOutput { .. })
        ));
    }
}
