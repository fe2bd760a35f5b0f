//! Context Manager - Token budgeting for outbound requests
//!
//! Handles:
//! - Validating the pinned system prompt against an absolute ceiling
//! - Selecting the most recent contiguous suffix of the log that fits the budget
//!
//! Trimming only shapes what is sent. The session log itself is never touched.

use super::errors::{ChatError, ChatResult};
use super::traits::Tokenizer;
use super::types::{Message, Role, SessionRecord};
use std::sync::Arc;

/// Messages selected for one exchange. Derived on every send, never persisted.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    /// Pinned system prompt, sent ahead of the messages
    pub system_prompt: String,
    /// Estimated tokens of the system prompt (not counted against the budget)
    pub system_tokens: usize,
    /// Chronologically ordered suffix of the session log
    pub messages: Vec<Message>,
    /// Estimated tokens of `messages`; always <= the budget
    pub conversation_tokens: usize,
    /// Number of older messages left out
    pub trimmed: usize,
}

impl ContextWindow {
    /// Usage of the conversation budget as a percentage (0-100)
    pub fn usage_percent(&self, budget: usize) -> f32 {
        if budget == 0 {
            return 0.0;
        }
        (self.conversation_tokens as f32 / budget as f32) * 100.0
    }
}

/// Builds context windows for a fixed budget
pub struct ContextManager {
    tokenizer: Arc<dyn Tokenizer>,
    /// Budget for conversational messages
    budget: usize,
    /// Absolute ceiling for the system prompt alone
    system_prompt_ceiling: usize,
}

impl ContextManager {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, budget: usize, system_prompt_ceiling: usize) -> Self {
        Self {
            tokenizer,
            budget,
            system_prompt_ceiling,
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    /// Estimate tokens of the system prompt as it will be sent
    pub fn system_prompt_tokens(&self, prompt: &str) -> usize {
        self.tokenizer.count_message_tokens(Role::System, prompt, 0)
    }

    /// Check a system prompt against the ceiling before it is adopted
    pub fn check_system_prompt(&self, prompt: &str) -> ChatResult<usize> {
        let tokens = self.system_prompt_tokens(prompt);
        if tokens > self.system_prompt_ceiling {
            return Err(ChatError::PromptTooLarge {
                tokens,
                ceiling: self.system_prompt_ceiling,
            });
        }
        Ok(tokens)
    }

    /// Select the context for the next request
    ///
    /// Walks the log from newest to oldest and stops at the first message that
    /// would push the running total over the budget. Messages are never split.
    pub fn build_context(&self, record: &SessionRecord) -> ChatResult<ContextWindow> {
        let system_tokens = self.check_system_prompt(&record.system_prompt)?;

        let mut used = 0usize;
        let mut start = record.messages.len();
        for (idx, message) in record.messages.iter().enumerate().rev() {
            let next = used + message.estimated_tokens;
            if next > self.budget {
                break;
            }
            used = next;
            start = idx;
        }

        // The newest message is the one being answered; without it the request is meaningless.
        if start == record.messages.len() {
            if let Some(latest) = record.messages.last() {
                return Err(ChatError::PromptTooLarge {
                    tokens: latest.estimated_tokens,
                    ceiling: self.budget,
                });
            }
        }

        let window = ContextWindow {
            system_prompt: record.system_prompt.clone(),
            system_tokens,
            messages: record.messages[start..].to_vec(),
            conversation_tokens: used,
            trimmed: start,
        };

        tracing::debug!(
            session_id = %record.id,
            sent = window.messages.len(),
            trimmed = window.trimmed,
            tokens = window.conversation_tokens,
            budget = self.budget,
            "Built context window"
        );

        Ok(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenerationConfig;
    use crate::core::tokenizer::ApproximateTokenizer;
    use crate::core::types::GenerationParams;
    use chrono::Utc;
    use proptest::prelude::*;

    fn manager(budget: usize) -> ContextManager {
        ContextManager::new(Arc::new(ApproximateTokenizer::default()), budget, 4000)
    }

    fn record_with_costs(costs: &[usize]) -> SessionRecord {
        let mut record = SessionRecord::new(
            "You are helpful.",
            GenerationParams::defaults(&GenerationConfig::default()),
        );
        for (i, cost) in costs.iter().enumerate() {
            record.push(Message {
                role: if i % 2 == 0 { Role::User } else { Role::Assistant },
                content: format!("message {}", i),
                attachments: Vec::new(),
                timestamp: Utc::now(),
                estimated_tokens: *cost,
            });
        }
        record
    }

    #[test]
    fn test_empty_log_with_new_message() {
        let tokenizer = ApproximateTokenizer::default();
        let mut record = record_with_costs(&[]);
        record.push(Message::user("hello", &tokenizer));

        let window = manager(1000).build_context(&record).unwrap();
        assert_eq!(window.system_prompt, "You are helpful.");
        assert_eq!(window.messages.len(), 1);
        assert_eq!(window.messages[0].content, "hello");
        assert_eq!(window.trimmed, 0);
    }

    #[test]
    fn test_oldest_messages_trimmed() {
        // 10 messages of 100 tokens; budget fits exactly 7
        let record = record_with_costs(&[100; 10]);
        let window = manager(700).build_context(&record).unwrap();

        assert_eq!(window.messages.len(), 7);
        assert_eq!(window.trimmed, 3);
        assert_eq!(window.messages[0].content, "message 3");
        assert_eq!(window.messages[6].content, "message 9");
        assert_eq!(window.conversation_tokens, 700);
        // Log untouched
        assert_eq!(record.messages.len(), 10);
    }

    #[test]
    fn test_boundary_message_excluded_not_split() {
        // 60 + 50 = 110 > 100: the 60-token message crosses the budget
        let record = record_with_costs(&[10, 60, 50]);
        let window = manager(100).build_context(&record).unwrap();
        assert_eq!(window.messages.len(), 1);
        assert_eq!(window.trimmed, 2);
    }

    #[test]
    fn test_older_small_message_not_skipped_into() {
        // Suffix must stay contiguous even if an older message would still fit
        let record = record_with_costs(&[1, 500, 50]);
        let window = manager(100).build_context(&record).unwrap();
        assert_eq!(window.messages.len(), 1);
        assert_eq!(window.messages[0].content, "message 2");
    }

    #[test]
    fn test_system_prompt_over_ceiling() {
        let mut record = record_with_costs(&[10]);
        record.system_prompt = "x".repeat(40_000);
        let err = manager(1000).build_context(&record).unwrap_err();
        assert!(matches!(err, ChatError::PromptTooLarge { ceiling: 4000, .. }));
    }

    #[test]
    fn test_latest_message_over_budget() {
        let record = record_with_costs(&[10, 2000]);
        let err = manager(1000).build_context(&record).unwrap_err();
        assert!(matches!(
            err,
            ChatError::PromptTooLarge {
                tokens: 2000,
                ceiling: 1000
            }
        ));
    }

    #[test]
    fn test_usage_percent() {
        let record = record_with_costs(&[250, 250]);
        let window = manager(1000).build_context(&record).unwrap();
        assert!((window.usage_percent(1000) - 50.0).abs() < 0.1);
    }

    proptest! {
        #[test]
        fn prop_window_is_suffix_within_budget(
            costs in proptest::collection::vec(1usize..400, 0..40),
            budget in 400usize..4000,
        ) {
            let record = record_with_costs(&costs);
            let window = manager(budget).build_context(&record).unwrap();

            let total: usize = window.messages.iter().map(|m| m.estimated_tokens).sum();
            prop_assert!(total <= budget);
            prop_assert_eq!(total, window.conversation_tokens);

            let start = record.messages.len() - window.messages.len();
            prop_assert_eq!(start, window.trimmed);
            for (sent, logged) in window.messages.iter().zip(&record.messages[start..]) {
                prop_assert_eq!(sent, logged);
            }

            // Maximal: the next older message would not have fit
            if start > 0 {
                prop_assert!(total + record.messages[start - 1].estimated_tokens > budget);
            }
        }
    }
}
