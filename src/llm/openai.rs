use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{post_json, LlmClient, LlmSettings};

/// Chat completions client for OpenAI and compatible local servers
/// (LM Studio, llama.cpp server, vLLM).
pub struct OpenAiClient {
    settings: LlmSettings,
    endpoint: String,
    client: Client,
}

impl OpenAiClient {
    /// `base_url` is the API root, e.g. `https://api.openai.com/v1` or
    /// `http://localhost:1234/v1`.
    pub fn new(base_url: &str, settings: LlmSettings) -> Result<Self> {
        anyhow::ensure!(!settings.model.trim().is_empty(), "missing chat model name");
        anyhow::ensure!(
            base_url.starts_with("http://") || base_url.starts_with("https://"),
            "chat base URL must be an http(s) URL"
        );
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        // Local servers accept requests without a key.
        if let Some(key) = settings.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            let bearer = HeaderValue::from_str(&format!("Bearer {key}"))
                .context("OPENAI_API_KEY is not a valid header value")?;
            headers.insert(AUTHORIZATION, bearer);
        }
        let client = Client::builder()
            .timeout(settings.timeout)
            .default_headers(headers)
            .build()
            .context("failed to build chat HTTP client")?;
        Ok(Self {
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            settings,
            client,
        })
    }

    fn request<'a>(&'a self, prompt: &'a str) -> CompletionRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if !self.settings.system_prompt.trim().is_empty() {
            messages.push(Turn {
                role: "system",
                content: &self.settings.system_prompt,
            });
        }
        messages.push(Turn {
            role: "user",
            content: prompt,
        });
        CompletionRequest {
            model: &self.settings.model,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            messages,
        }
    }
}

impl LlmClient for OpenAiClient {
    fn complete(&self, prompt: &str) -> Result<String> {
        let reply: CompletionReply =
            post_json(&self.client, &self.endpoint, "chat completions", &self.request(prompt))?;
        reply
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .context("chat completions reply had no message content")
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: usize,
    messages: Vec<Turn<'a>>,
}

#[derive(Serialize)]
struct Turn<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct CompletionReply {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings(system_prompt: &str) -> LlmSettings {
        LlmSettings {
            api_key: None,
            model: "llama-3.2-1b-instruct".into(),
            temperature: 0.0,
            max_tokens: 256,
            timeout: Duration::from_secs(1),
            system_prompt: system_prompt.into(),
        }
    }

    #[test]
    fn endpoint_is_derived_from_base_url() {
        let client = OpenAiClient::new("http://localhost:1234/v1/", settings("sys")).unwrap();
        assert_eq!(client.endpoint, "http://localhost:1234/v1/chat/completions");
        assert!(OpenAiClient::new("localhost:1234", settings("sys")).is_err());
    }

    #[test]
    fn blank_system_prompt_is_not_sent() {
        let client = OpenAiClient::new("http://localhost:1234/v1", settings("")).unwrap();
        let body = serde_json::to_value(client.request("hi")).unwrap();
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");

        let client = OpenAiClient::new("http://localhost:1234/v1", settings("sys")).unwrap();
        let body = serde_json::to_value(client.request("hi")).unwrap();
        assert_eq!(body["messages"][0]["content"], "sys");
        assert_eq!(body["max_tokens"], 256);
    }

    #[test]
    fn reply_with_null_content_is_parsed() {
        let reply: CompletionReply =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#)
                .unwrap();
        assert!(reply.choices[0].message.content.is_none());
    }
}
