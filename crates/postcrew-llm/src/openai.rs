use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use postcrew_core::errors::InvocationError;
use postcrew_core::provider::{ChatMessage, Completion, CompletionRequest, CompletionService};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Non-streaming client for any OpenAI-compatible `chat/completions` endpoint.
pub struct OpenAiCompletion {
    client: Client,
    api_key: SecretString,
    base_url: String,
    model: String,
}

impl OpenAiCompletion {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_body<'a>(&'a self, request: &'a CompletionRequest) -> ChatBody<'a> {
        ChatBody {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request
                .json_mode
                .then_some(ResponseFormat { kind: "json_object" }),
        }
    }
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    total_tokens: u32,
}

fn parse_response(body: &str) -> Result<Completion, InvocationError> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| InvocationError::InvalidRequest(format!("unparseable completion: {e}")))?;
    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| InvocationError::InvalidRequest("completion had no content".into()))?;
    Ok(Completion {
        text,
        tokens_used: parsed.usage.map(|u| u.total_tokens),
    })
}

pub(crate) fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

pub(crate) fn transport_error(e: reqwest::Error) -> InvocationError {
    InvocationError::Network(e.to_string())
}

#[async_trait]
impl CompletionService for OpenAiCompletion {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, request), fields(model = %self.model))]
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, InvocationError> {
        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.api_key.expose_secret())
            .json(&self.build_body(request))
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let delay = retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(match InvocationError::from_status(status, body) {
                InvocationError::RateLimited { .. } => InvocationError::RateLimited { retry_after: delay },
                other => other,
            });
        }

        let body = resp.text().await.map_err(transport_error)?;
        let completion = parse_response(&body)?;
        debug!(tokens = ?completion.tokens_used, "completion received");
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_includes_json_format_only_when_requested() {
        let svc = OpenAiCompletion::new(SecretString::from("sk-test".to_string()), DEFAULT_MODEL);
        let plain = CompletionRequest::new("sys", "user");
        let json = serde_json::to_value(svc.build_body(&plain)).unwrap();
        assert_eq!(json["model"], "gpt-4o-mini");
        assert!(json.get("response_format").is_none());
        assert!(json.get("temperature").is_none());

        let structured = CompletionRequest::new("sys", "user").json().with_temperature(0.2);
        let json = serde_json::to_value(svc.build_body(&structured)).unwrap();
        assert_eq!(json["response_format"]["type"], "json_object");
        assert_eq!(json["messages"][0]["role"], "system");
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let svc = OpenAiCompletion::new(SecretString::from("k".to_string()), "m").with_base_url("http://localhost:8080/v1/");
        assert_eq!(svc.endpoint(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn parse_response_extracts_text_and_usage() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"hello"}}],"usage":{"prompt_tokens":3,"completion_tokens":1,"total_tokens":4}}"#;
        let completion = parse_response(body).unwrap();
        assert_eq!(completion.text, "hello");
        assert_eq!(completion.tokens_used, Some(4));
    }

    #[test]
    fn parse_response_without_choices_is_error() {
        let err = parse_response(r#"{"choices":[]}"#).unwrap_err();
        assert!(matches!(err, InvocationError::InvalidRequest(_)));
    }

    #[test]
    fn retry_after_header_parsed_as_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after(&headers), None);
    }

    #[cfg(feature = "integration")]
    #[tokio::test]
    async fn live_completion() {
        let key = std::env::var("OPENAI_API_KEY").expect("OPENAI_API_KEY");
        let svc = OpenAiCompletion::new(SecretString::from(key), DEFAULT_MODEL);
        let out = svc
            .complete(&CompletionRequest::new("Reply with one word.", "Say hi"))
            .await
            .unwrap();
        assert!(!out.text.is_empty());
    }
}
