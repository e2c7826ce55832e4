//! Collaborators notified after an answer is finalized.

use async_trait::async_trait;

use loom_core::ids::{MessageId, ThreadId};
use loom_core::messages::{Answer, AnswerStatus};

#[derive(Debug, thiserror::Error)]
pub enum FollowupError {
    #[error("suggestion request failed: {0}")]
    Failed(String),
}

/// Generates next-step suggestions for a finalized answer.
/// Called fire-and-forget; failures are logged and never retried.
#[async_trait]
pub trait SuggestionTrigger: Send + Sync {
    async fn suggest(&self, answer_id: &MessageId) -> Result<Vec<String>, FollowupError>;
}

/// Tells list/detail caches that a thread has new messages.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate(&self, thread_id: &ThreadId);
}

pub struct NoSuggestions;

#[async_trait]
impl SuggestionTrigger for NoSuggestions {
    async fn suggest(&self, _answer_id: &MessageId) -> Result<Vec<String>, FollowupError> {
        Ok(Vec::new())
    }
}

pub struct NoopInvalidator;

#[async_trait]
impl CacheInvalidator for NoopInvalidator {
    async fn invalidate(&self, _thread_id: &ThreadId) {}
}

/// Decide on the finalized answer alone whether suggestions should run:
/// a successful answer that ran retrieval and cites at least one source.
pub fn should_suggest(answer: &Answer) -> bool {
    answer.status == AnswerStatus::Complete
        && answer.metadata.ran_retrieval
        && !answer.citations.is_empty()
}
