use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use postcrew_core::errors::InvocationError;
use postcrew_core::provider::{Completion, CompletionRequest, CompletionService, SearchHit, SearchService};

/// Pre-programmed completion result for deterministic tests.
#[derive(Clone, Debug)]
pub enum MockReply {
    Text(String),
    Error(InvocationError),
    /// Wait, then resolve the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self::Text(value.to_string())
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Completion service returning scripted replies in order.
pub struct MockCompletion {
    replies: Mutex<VecDeque<MockReply>>,
    seen: Mutex<Vec<CompletionRequest>>,
    call_count: AtomicUsize,
}

impl MockCompletion {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.seen.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().len()
    }
}

#[async_trait]
impl CompletionService for MockCompletion {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, InvocationError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.seen.lock().push(request.clone());
        let next = self.replies.lock().pop_front();
        let mut reply = next.ok_or_else(|| {
            InvocationError::InvalidRequest(format!("MockCompletion: no reply configured for call {idx}"))
        })?;
        loop {
            match reply {
                MockReply::Text(text) => {
                    return Ok(Completion {
                        tokens_used: Some(text.split_whitespace().count() as u32),
                        text,
                    })
                }
                MockReply::Error(e) => return Err(e),
                MockReply::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    reply = *inner;
                }
            }
        }
    }
}

/// Search service fabricating `max_results` hits per query.
pub struct MockSearch {
    failures: Mutex<VecDeque<InvocationError>>,
    queries: Mutex<Vec<String>>,
}

impl MockSearch {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(VecDeque::new()),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `times` calls with `error` before succeeding.
    pub fn fail_first(self, error: InvocationError, times: usize) -> Self {
        self.failures.lock().extend(std::iter::repeat(error).take(times));
        self
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

impl Default for MockSearch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SearchService for MockSearch {
    fn name(&self) -> &str {
        "mock-search"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, InvocationError> {
        self.queries.lock().push(query.to_string());
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        let slug: String = query
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        Ok((1..=max_results)
            .map(|i| SearchHit {
                title: format!("{query} ({i})"),
                url: format!("https://example.com/{slug}/{i}"),
                content: format!("Finding {i} about {query}."),
            })
            .collect())
    }
}
