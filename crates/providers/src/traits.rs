use fg_domain::{Result, TokenUsage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One piece of a chat message. Vision kernels attach screenshots as
/// base64-encoded JPEG parts.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text { text: String },
    ImageJpeg { base64: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl ChatMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![ContentPart::Text { text: text.into() }],
        }
    }

    pub fn user_with_image(text: impl Into<String>, image_base64: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![
                ContentPart::Text { text: text.into() },
                ContentPart::ImageJpeg {
                    base64: image_base64.into(),
                },
            ],
        }
    }

    /// Drop image parts, keeping the text. The vision kernel applies this to
    /// older user messages to cap context size.
    pub fn strip_images(&mut self) {
        self.parts
            .retain(|p| matches!(p, ContentPart::Text { .. }));
    }

    /// Concatenated text content of the message.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_image(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, ContentPart::ImageJpeg { .. }))
    }
}

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Model identifier. Empty lets the provider use its default.
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// When `true`, force the model to respond with valid JSON only.
    pub json_mode: bool,
}

impl Default for ChatMessage {
    fn default() -> Self {
        Self {
            role: Role::User,
            parts: Vec::new(),
        }
    }
}

/// A provider-agnostic chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub usage: Option<TokenUsage>,
    pub model: String,
    pub finish_reason: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every LLM adapter implements. Kernels hold an `Arc<dyn LlmProvider>`
/// so tests can substitute a scripted provider.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request and wait for the full response.
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse>;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_images_keeps_text() {
        let mut msg = ChatMessage::user_with_image("look at this", "aGVsbG8=");
        assert!(msg.has_image());
        msg.strip_images();
        assert!(!msg.has_image());
        assert_eq!(msg.text_content(), "look at this");
    }
}
