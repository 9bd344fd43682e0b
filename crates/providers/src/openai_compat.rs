//! OpenAI-compatible adapter.
//!
//! Works with Zhipu, OpenAI, Ollama, vLLM, and any other endpoint that
//! follows the OpenAI chat completions contract, including the multimodal
//! `image_url` content-part shape used for screenshots.

use serde_json::Value;

use fg_domain::config::LlmConfig;
use fg_domain::{Error, Result, TokenUsage};

use crate::traits::{ChatMessage, ChatRequest, ChatResponse, ContentPart, LlmProvider, Role};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            id: "openai_compat".into(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            client,
        })
    }

    fn build_chat_body(&self, req: &ChatRequest) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_openai).collect();

        let mut body = serde_json::json!({
            "model": req.model,
            "messages": messages,
            "stream": false,
        });
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if req.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn msg_to_openai(msg: &ChatMessage) -> Value {
    // Text-only messages use the plain string shape; anything with an image
    // uses the content-parts array.
    if !msg.has_image() {
        return serde_json::json!({
            "role": role_to_str(msg.role),
            "content": msg.text_content(),
        });
    }

    let parts: Vec<Value> = msg
        .parts
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => serde_json::json!({
                "type": "text",
                "text": text,
            }),
            ContentPart::ImageJpeg { base64 } => serde_json::json!({
                "type": "image_url",
                "image_url": { "url": format!("data:image/jpeg;base64,{base64}") },
            }),
        })
        .collect();

    serde_json::json!({
        "role": role_to_str(msg.role),
        "content": parts,
    })
}

fn parse_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    Some(TokenUsage {
        prompt_tokens: usage.get("prompt_tokens")?.as_u64()?,
        completion_tokens: usage.get("completion_tokens").and_then(Value::as_u64)?,
        total_tokens: usage
            .get("total_tokens")
            .and_then(Value::as_u64)
            .unwrap_or_default(),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LlmProvider impl
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(&req);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("LLM request: {e}"))
                } else {
                    Error::Provider {
                        provider: self.id.clone(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        let payload: Value = response.json().await.map_err(|e| Error::Provider {
            provider: self.id.clone(),
            message: format!("invalid response body: {e}"),
        })?;

        if !status.is_success() {
            let message = payload
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("request failed");
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("{status}: {message}"),
            });
        }

        let content = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let finish_reason = payload
            .pointer("/choices/0/finish_reason")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let model = payload
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&req.model)
            .to_owned();

        Ok(ChatResponse {
            content,
            usage: parse_usage(&payload),
            model,
            finish_reason,
        })
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OpenAiCompatProvider {
        let mut cfg = LlmConfig::default();
        cfg.api_key = "sk-test".into();
        OpenAiCompatProvider::from_config(&cfg).unwrap()
    }

    #[test]
    fn json_mode_sets_response_format() {
        let req = ChatRequest {
            messages: vec![ChatMessage::text(Role::User, "hi")],
            model: "glm-4-flash".into(),
            json_mode: true,
            ..Default::default()
        };
        let body = provider().build_chat_body(&req);
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn image_messages_use_content_parts() {
        let req = ChatRequest {
            messages: vec![ChatMessage::user_with_image("what do you see", "QUJD")],
            model: "glm-4v".into(),
            ..Default::default()
        };
        let body = provider().build_chat_body(&req);
        let parts = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["type"], "image_url");
        assert!(parts[1]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn usage_parsed_from_payload() {
        let payload = serde_json::json!({
            "usage": {"prompt_tokens": 120, "completion_tokens": 30, "total_tokens": 150}
        });
        let usage = parse_usage(&payload).unwrap();
        assert_eq!(usage.prompt_tokens, 120);
        assert_eq!(usage.total_tokens, 150);
    }
}
