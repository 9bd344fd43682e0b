use serde::{Deserialize, Serialize};

/// Token usage for one LLM call, or the running total for a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Fold another call's usage into this running total.
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }

    pub fn is_zero(&self) -> bool {
        self.total_tokens == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates() {
        let mut total = TokenUsage::default();
        assert!(total.is_zero());
        total.add(TokenUsage::new(100, 20));
        total.add(TokenUsage::new(50, 10));
        assert_eq!(total.prompt_tokens, 150);
        assert_eq!(total.completion_tokens, 30);
        assert_eq!(total.total_tokens, 180);
    }
}
