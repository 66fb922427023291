use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use postcrew_core::errors::InvocationError;
use postcrew_core::provider::{SearchHit, SearchService};

use crate::openai::{retry_after, transport_error};

const API_URL: &str = "https://api.tavily.com/search";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub struct TavilySearch {
    client: Client,
    api_key: SecretString,
    endpoint: String,
}

impl TavilySearch {
    pub fn new(api_key: SecretString) -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            api_key,
            endpoint: API_URL.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[derive(Serialize)]
struct SearchBody<'a> {
    query: &'a str,
    max_results: usize,
    search_depth: &'static str,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Deserialize)]
struct SearchResult {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    content: String,
}

fn parse_results(body: &str, max_results: usize) -> Result<Vec<SearchHit>, InvocationError> {
    let parsed: SearchResponse = serde_json::from_str(body)
        .map_err(|e| InvocationError::InvalidRequest(format!("unparseable search response: {e}")))?;
    Ok(parsed
        .results
        .into_iter()
        .take(max_results)
        .map(|r| SearchHit {
            title: r.title,
            url: r.url,
            content: r.content,
        })
        .collect())
}

#[async_trait]
impl SearchService for TavilySearch {
    fn name(&self) -> &str {
        "tavily"
    }

    #[instrument(skip(self))]
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, InvocationError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&SearchBody {
                query,
                max_results,
                search_depth: "basic",
            })
            .send()
            .await
            .map_err(transport_error)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let delay = retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(match InvocationError::from_status(status, body) {
                InvocationError::RateLimited { .. } => InvocationError::RateLimited { retry_after: delay },
                other => other,
            });
        }

        let body = resp.text().await.map_err(transport_error)?;
        let hits = parse_results(&body, max_results)?;
        debug!(hits = hits.len(), "search complete");
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_results_truncates_to_max() {
        let body = r#"{"query":"q","results":[
            {"title":"a","url":"https://a","content":"one","score":0.9},
            {"title":"b","url":"https://b","content":"two","score":0.8},
            {"title":"c","url":"https://c","content":"three","score":0.7},
            {"title":"d","url":"https://d","content":"four","score":0.6}
        ]}"#;
        let hits = parse_results(body, 3).unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].url, "https://a");
        assert_eq!(hits[2].content, "three");
    }

    #[test]
    fn missing_results_is_empty() {
        assert!(parse_results(r#"{"query":"q"}"#, 3).unwrap().is_empty());
    }

    #[test]
    fn garbage_body_is_error() {
        assert!(parse_results("<html>", 3).is_err());
    }
}
