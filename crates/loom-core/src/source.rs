use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use secrecy::SecretString;

use crate::element::WireElement;
use crate::errors::{MalformedElement, SourceError};
use crate::ids::ThreadId;
use crate::messages::ContentFilter;

/// What the element source is asked to answer.
#[derive(Clone, Debug)]
pub struct ElementRequest {
    pub thread_id: ThreadId,
    pub question: String,
    pub filters: ContentFilter,
    pub auth_token: Option<SecretString>,
}

impl ElementRequest {
    pub fn new(thread_id: ThreadId, question: impl Into<String>) -> Self {
        Self {
            thread_id,
            question: question.into(),
            filters: ContentFilter::none(),
            auth_token: None,
        }
    }
}

/// One item pulled from a source. End-of-stream is the stream returning `None`,
/// which is distinct from `Failed`.
#[derive(Clone, Debug)]
pub enum SourceEvent {
    Element(WireElement),
    /// The source could not decode a unit of input.
    Malformed(MalformedElement),
    /// Transport-level failure; no further items follow.
    Failed(SourceError),
}

pub type ElementStream = Pin<Box<dyn Stream<Item = SourceEvent> + Send>>;

/// Opens ordered element streams for a question.
///
/// Cancellation is by dropping the returned stream: implementations must
/// release their resources on drop.
#[async_trait]
pub trait ElementSource: Send + Sync {
    fn name(&self) -> &str;

    async fn open(&self, request: &ElementRequest) -> Result<ElementStream, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn request_defaults() {
        let req = ElementRequest::new(ThreadId::from_raw("thr_1"), "why is the sky blue?");
        assert!(req.filters.is_none());
        assert!(req.auth_token.is_none());
    }

    #[test]
    fn auth_token_is_redacted_in_debug() {
        let mut req = ElementRequest::new(ThreadId::new(), "q");
        req.auth_token = Some(SecretString::from("hunter2"));
        let dbg = format!("{req:?}");
        assert!(!dbg.contains("hunter2"));
        assert_eq!(
            req.auth_token.as_ref().map(|t| t.expose_secret().to_string()),
            Some("hunter2".to_string())
        );
    }
}
