use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ChatMessage, CodeGenerator, Generation, GenerationOptions};
use crate::config::GenerationSection;
use crate::errors::PipelineError;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Messages API client.
pub struct AnthropicClient {
    http: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    system: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Other,
}

impl AnthropicClient {
    pub fn new(config: &GenerationSection, api_key: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client for the generation API")?;
        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.api_url)
    }
}

/// Join text blocks and thinking blocks separately, each with `\n`.
fn collect_output(response: MessagesResponse) -> Generation {
    let mut text = Vec::new();
    let mut thinking = Vec::new();
    for block in response.content {
        match block {
            ContentBlock::Text { text: t } => text.push(t),
            ContentBlock::Thinking { thinking: t } => thinking.push(t),
            ContentBlock::Other => {}
        }
    }
    Generation {
        text: text.join("\n"),
        thinking: (!thinking.is_empty()).then(|| thinking.join("\n")),
    }
}

#[async_trait]
impl CodeGenerator for AnthropicClient {
    async fn generate(
        &self,
        conversation: &[ChatMessage],
        system: &str,
        options: &GenerationOptions,
    ) -> Result<Generation, PipelineError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| PipelineError::Configuration("ANTHROPIC_API_KEY".to_string()))?;

        let body = MessagesRequest {
            model: &options.model,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            system,
            messages: conversation,
        };

        tracing::debug!(
            model = %options.model,
            max_tokens = options.max_tokens,
            turns = conversation.len(),
            "Calling generation API"
        );

        let resp = self
            .http
            .post(self.messages_url())
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .context("Failed to reach the generation API")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Upstream {
                service: "Claude",
                status: status.as_u16(),
                body,
            });
        }

        let parsed: MessagesResponse = resp
            .json()
            .await
            .context("Failed to parse generation API response")?;
        Ok(collect_output(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode, routing::post};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client_for(api_url: String, key: Option<&str>) -> AnthropicClient {
        let config = GenerationSection {
            api_url,
            ..Default::default()
        };
        AnthropicClient::new(&config, key.map(String::from)).unwrap()
    }

    fn options() -> GenerationOptions {
        GenerationOptions::build(&GenerationSection::default())
    }

    #[test]
    fn test_collect_output_joins_blocks_by_kind() {
        let response: MessagesResponse = serde_json::from_value(serde_json::json!({
            "content": [
                {"type": "thinking", "thinking": "plan"},
                {"type": "text", "text": "first"},
                {"type": "tool_use", "id": "x", "name": "y", "input": {}},
                {"type": "text", "text": "second"}
            ]
        }))
        .unwrap();

        let generation = collect_output(response);
        assert_eq!(generation.text, "first\nsecond");
        assert_eq!(generation.thinking.as_deref(), Some("plan"));
    }

    #[test]
    fn test_collect_output_without_thinking() {
        let response: MessagesResponse =
            serde_json::from_value(serde_json::json!({"content": [{"type": "text", "text": "x"}]}))
                .unwrap();
        assert!(collect_output(response).thinking.is_none());
    }

    #[tokio::test]
    async fn test_missing_api_key_is_configuration_error() {
        let client = client_for("http://127.0.0.1:9".to_string(), None);
        let err = client
            .generate(&[ChatMessage::user("hi")], "system", &options())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(ref name) if name == "ANTHROPIC_API_KEY"));
    }

    #[tokio::test]
    async fn test_non_success_status_becomes_upstream_error() {
        let router = Router::new().route(
            "/v1/messages",
            post(|| async { (StatusCode::from_u16(529).unwrap(), "overloaded") }),
        );
        let client = client_for(serve(router).await, Some("sk-test"));

        let err = client
            .generate(&[ChatMessage::user("hi")], "system", &options())
            .await
            .unwrap_err();
        match err {
            PipelineError::Upstream { status, body, .. } => {
                assert_eq!(status, 529);
                assert_eq!(body, "overloaded");
            }
            other => panic!("Expected Upstream, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_successful_call_sends_headers_and_returns_text() {
        let router = Router::new().route(
            "/v1/messages",
            post(
                |headers: axum::http::HeaderMap, Json(body): Json<serde_json::Value>| async move {
                    assert_eq!(headers["x-api-key"], "sk-test");
                    assert_eq!(headers["anthropic-version"], "2023-06-01");
                    assert_eq!(body["system"], "system");
                    assert_eq!(body["max_tokens"], 8000);
                    assert_eq!(body["messages"][0]["role"], "user");
                    Json(serde_json::json!({
                        "content": [{"type": "text", "text": "<files></files>"}]
                    }))
                },
            ),
        );
        let client = client_for(serve(router).await, Some("sk-test"));

        let generation = client
            .generate(&[ChatMessage::user("hi")], "system", &options())
            .await
            .unwrap();
        assert_eq!(generation.text, "<files></files>");
    }
}
