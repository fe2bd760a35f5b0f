//! Tokenizer implementations
//!
//! Provides the approximate token estimate used for context budgeting.

use super::traits::Tokenizer;

/// Default flat estimate charged per attachment
pub const DEFAULT_ATTACHMENT_TOKENS: usize = 256;

/// Approximate tokenizer using character-based estimation
///
/// The ratio of ~4 bytes per token is an empirical average across providers.
/// Ceiling division keeps short texts from estimating as zero.
pub struct ApproximateTokenizer {
    attachment_tokens: usize,
}

impl ApproximateTokenizer {
    pub fn new(attachment_tokens: usize) -> Self {
        Self { attachment_tokens }
    }
}

impl Default for ApproximateTokenizer {
    fn default() -> Self {
        Self::new(DEFAULT_ATTACHMENT_TOKENS)
    }
}

impl Tokenizer for ApproximateTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        text.len().div_ceil(4)
    }

    fn attachment_tokens(&self) -> usize {
        self.attachment_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Role;

    #[test]
    fn test_approximate_tokenizer_basic() {
        let tokenizer = ApproximateTokenizer::default();

        assert_eq!(tokenizer.count_tokens(""), 0);
        assert_eq!(tokenizer.count_tokens("test"), 1);

        let text = "Hello, world!"; // 13 chars
        assert_eq!(tokenizer.count_tokens(text), 4);
    }

    #[test]
    fn test_message_tokens() {
        let tokenizer = ApproximateTokenizer::new(100);

        // 4 (overhead) + 2 ("hello" = 5 chars)
        assert_eq!(tokenizer.count_message_tokens(Role::User, "hello", 0), 6);
        assert_eq!(tokenizer.count_message_tokens(Role::User, "hello", 2), 206);
    }

    #[test]
    fn test_monotonic_in_content_length() {
        let tokenizer = ApproximateTokenizer::default();
        let mut last = 0;
        for n in 0..64 {
            let tokens = tokenizer.count_message_tokens(Role::User, &"x".repeat(n), 0);
            assert!(tokens >= last);
            last = tokens;
        }
    }
}
