use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{post_json, LlmClient, LlmSettings};

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client.
pub struct AnthropicClient {
    settings: LlmSettings,
    client: Client,
}

impl AnthropicClient {
    /// Requires `settings.api_key`.
    pub fn new(settings: LlmSettings) -> Result<Self> {
        let key = settings
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .context("ANTHROPIC_API_KEY is required for the anthropic provider")?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(key).context("ANTHROPIC_API_KEY is not a valid header value")?,
        );
        let client = Client::builder()
            .timeout(settings.timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Anthropic HTTP client")?;
        Ok(Self { settings, client })
    }
}

impl LlmClient for AnthropicClient {
    fn complete(&self, prompt: &str) -> Result<String> {
        let request = MessagesRequest {
            model: &self.settings.model,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            system: Some(self.settings.system_prompt.as_str()).filter(|s| !s.trim().is_empty()),
            messages: [UserTurn {
                role: "user",
                content: prompt,
            }],
        };
        let reply: MessagesReply = post_json(&self.client, MESSAGES_URL, "Anthropic messages", &request)?;
        let text = reply.text();
        anyhow::ensure!(!text.is_empty(), "Anthropic reply had no text blocks");
        Ok(text)
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: [UserTurn<'a>; 1],
}

/// Plain-string content is shorthand for a single text block.
#[derive(Serialize)]
struct UserTurn<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesReply {
    content: Vec<ReplyBlock>,
}

impl MessagesReply {
    fn text(self) -> String {
        self.content
            .into_iter()
            .filter_map(|block| match block {
                ReplyBlock::Text { text } => Some(text),
                ReplyBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ReplyBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings(api_key: Option<&str>) -> LlmSettings {
        LlmSettings {
            api_key: api_key.map(str::to_string),
            model: "claude-3-5-haiku-latest".into(),
            temperature: 0.0,
            max_tokens: 256,
            timeout: Duration::from_secs(1),
            system_prompt: String::new(),
        }
    }

    #[test]
    fn missing_key_is_rejected() {
        assert!(AnthropicClient::new(settings(Some("  "))).is_err());
        assert!(AnthropicClient::new(settings(None)).is_err());
    }

    #[test]
    fn only_text_blocks_are_kept() {
        let reply: MessagesReply = serde_json::from_str(
            r#"{"content":[{"type":"text","text":"a"},{"type":"tool_use","id":"x"},{"type":"text","text":"b"}]}"#,
        )
        .unwrap();
        assert_eq!(reply.text(), "a\nb");
    }

    #[test]
    fn blank_system_prompt_is_omitted() {
        let request = MessagesRequest {
            model: "m",
            max_tokens: 8,
            temperature: 0.0,
            system: None,
            messages: [UserTurn {
                role: "user",
                content: "hi",
            }],
        };
        let body = serde_json::to_value(&request).unwrap();
        assert!(body.get("system").is_none());
        assert_eq!(body["messages"][0]["content"], "hi");
    }
}
