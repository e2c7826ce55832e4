//! Scripted element source and recording collaborators for deterministic tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use loom_core::element::{StreamElement, WireElement};
use loom_core::errors::SourceError;
use loom_core::ids::{MessageId, ThreadId};
use loom_core::source::{ElementRequest, ElementSource, ElementStream, SourceEvent};

use crate::followups::{CacheInvalidator, FollowupError, SuggestionTrigger};

/// One step of a scripted stream.
#[derive(Clone, Debug)]
pub enum MockStep {
    Event(SourceEvent),
    Sleep(Duration),
    /// Never yield again; the stream stays open until dropped.
    Stall,
}

/// Pre-programmed result of one `open` call.
#[derive(Clone, Debug)]
pub enum MockResponse {
    Stream(Vec<MockStep>),
    OpenError(SourceError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn elements(elements: Vec<StreamElement>) -> Self {
        Self::Stream(
            elements
                .into_iter()
                .map(|e| MockStep::Event(SourceEvent::Element(WireElement::from(e))))
                .collect(),
        )
    }

    /// Raw NDJSON lines; undecodable lines become `Malformed` events.
    pub fn lines(lines: &[&str]) -> Self {
        Self::Stream(
            lines
                .iter()
                .map(|line| {
                    MockStep::Event(match WireElement::decode(line) {
                        Ok(element) => SourceEvent::Element(element),
                        Err(err) => SourceEvent::Malformed(err),
                    })
                })
                .collect(),
        )
    }

    /// Yield the elements, then hang without ending the stream.
    pub fn stalling(elements: Vec<StreamElement>) -> Self {
        Self::elements(elements).then(MockStep::Stall)
    }

    pub fn then(self, step: MockStep) -> Self {
        match self {
            Self::Stream(mut steps) => {
                steps.push(step);
                Self::Stream(steps)
            }
            Self::Delay(d, inner) => Self::Delay(d, Box::new(inner.then(step))),
            other => other,
        }
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Bumps the shared counter when a scripted stream is dropped.
struct ReleaseGuard(Arc<AtomicUsize>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct Script {
    steps: VecDeque<MockStep>,
    _guard: ReleaseGuard,
}

/// Element source that replays pre-programmed responses in sequence.
pub struct MockSource {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<ElementRequest>>,
    released: Arc<AtomicUsize>,
}

impl MockSource {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn open_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<ElementRequest> {
        self.requests.lock().clone()
    }

    /// Streams that ended or were dropped by their consumer.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ElementSource for MockSource {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open(&self, request: &ElementRequest) -> Result<ElementStream, SourceError> {
        self.requests.lock().push(request.clone());
        let next = self.responses.lock().pop_front();
        let Some(mut response) = next else {
            return Err(SourceError::Connect(format!(
                "MockSource: no response configured for call {}",
                self.open_count()
            )));
        };

        loop {
            match response {
                MockResponse::Stream(steps) => {
                    let script = Script {
                        steps: steps.into(),
                        _guard: ReleaseGuard(Arc::clone(&self.released)),
                    };
                    return Ok(Box::pin(stream::unfold(script, |mut script| async move {
                        loop {
                            match script.steps.pop_front()? {
                                MockStep::Event(event) => return Some((event, script)),
                                MockStep::Sleep(d) => tokio::time::sleep(d).await,
                                MockStep::Stall => futures::future::pending::<()>().await,
                            }
                        }
                    })));
                }
                MockResponse::OpenError(e) => return Err(e),
                MockResponse::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    response = *inner;
                }
            }
        }
    }
}

/// Records suggestion requests and answers with a fixed reply.
pub struct RecordingSuggestions {
    calls: Mutex<Vec<MessageId>>,
    reply: Result<Vec<String>, String>,
}

impl RecordingSuggestions {
    pub fn new(steps: Vec<String>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            reply: Ok(steps),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            reply: Err(message.to_string()),
        }
    }

    pub fn calls(&self) -> Vec<MessageId> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SuggestionTrigger for RecordingSuggestions {
    async fn suggest(&self, answer_id: &MessageId) -> Result<Vec<String>, FollowupError> {
        self.calls.lock().push(answer_id.clone());
        self.reply.clone().map_err(FollowupError::Failed)
    }
}

#[derive(Default)]
pub struct RecordingInvalidator {
    calls: Mutex<Vec<ThreadId>>,
}

impl RecordingInvalidator {
    pub fn calls(&self) -> Vec<ThreadId> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CacheInvalidator for RecordingInvalidator {
    async fn invalidate(&self, thread_id: &ThreadId) {
        self.calls.lock().push(thread_id.clone());
    }
}
