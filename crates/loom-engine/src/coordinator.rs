//! Session coordinator: one worker task and one assembler per active stream.
//!
//! `start` persists the question and spawns a worker that opens the element
//! source, pulls elements into a [`StreamAssembler`] and, once the answer is
//! finalized, persists it and notifies collaborators. Transport failures,
//! inactivity and open errors are all fed to the assembler as fatal error
//! elements, so every stream ends through the same finalization path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use secrecy::SecretString;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

use loom_core::element::StreamElement;
use loom_core::errors::ProtocolViolation;
use loom_core::ids::{MessageId, StreamId, ThreadId};
use loom_core::messages::{Answer, ContentFilter, Question};
use loom_core::source::{ElementRequest, ElementSource, ElementStream, SourceEvent};
use loom_store::{Database, MessageRepo, ThreadRepo};

use crate::assembler::{AnswerSeed, AssemblerLimits, Step, StreamAssembler};
use crate::config::CoordinatorConfig;
use crate::error::EngineError;
use crate::followups::{
    should_suggest, CacheInvalidator, NoSuggestions, NoopInvalidator, SuggestionTrigger,
};

/// Parameters for starting an answer stream.
#[derive(Clone, Debug)]
pub struct StartRequest {
    pub thread_id: ThreadId,
    pub question: String,
    pub filters: ContentFilter,
    pub auth_token: Option<SecretString>,
}

impl StartRequest {
    pub fn new(thread_id: ThreadId, question: impl Into<String>) -> Self {
        Self {
            thread_id,
            question: question.into(),
            filters: ContentFilter::none(),
            auth_token: None,
        }
    }

    pub fn with_filters(mut self, filters: ContentFilter) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_auth_token(mut self, token: SecretString) -> Self {
        self.auth_token = Some(token);
        self
    }
}

pub type CompletionCallback = Box<dyn FnOnce(Arc<Answer>) + Send>;

enum Completion {
    Empty,
    Waiting(CompletionCallback),
    Ready(Arc<Answer>),
    Fired,
}

/// Holds at most one completion callback and fires it exactly once.
struct CompletionSlot {
    state: Mutex<Completion>,
}

impl CompletionSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(Completion::Empty),
        }
    }

    fn attach(&self, callback: CompletionCallback) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, Completion::Fired) {
            Completion::Empty => {
                *state = Completion::Waiting(callback);
                Ok(())
            }
            Completion::Ready(answer) => {
                drop(state);
                callback(answer);
                Ok(())
            }
            other @ (Completion::Waiting(_) | Completion::Fired) => {
                *state = other;
                Err(EngineError::CallbackAlreadyAttached)
            }
        }
    }

    fn complete(&self, answer: Arc<Answer>) {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, Completion::Fired) {
            Completion::Waiting(callback) => {
                drop(state);
                callback(answer);
            }
            Completion::Empty => *state = Completion::Ready(answer),
            other => *state = other,
        }
    }
}

/// Caller-side view of one running stream.
#[derive(Clone)]
pub struct StreamHandle {
    id: StreamId,
    thread_id: ThreadId,
    question_id: MessageId,
    answer_id: MessageId,
    cancel: CancellationToken,
    finished: watch::Receiver<Option<Arc<Answer>>>,
    completion: Arc<CompletionSlot>,
}

impl StreamHandle {
    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    pub fn question_id(&self) -> &MessageId {
        &self.question_id
    }

    /// Id the answer will carry once finalized.
    pub fn answer_id(&self) -> &MessageId {
        &self.answer_id
    }

    /// Request cancellation. The answer is still finalized, tagged cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The finalized answer, if the stream has ended.
    pub fn answer(&self) -> Option<Arc<Answer>> {
        self.finished.borrow().clone()
    }

    pub async fn wait(&self) -> Result<Arc<Answer>, EngineError> {
        let mut rx = self.finished.clone();
        let guard = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| EngineError::Internal("stream worker exited without an answer".into()))?;
        let answer: Option<Arc<Answer>> = (*guard).clone();
        answer.ok_or_else(|| EngineError::Internal("stream worker exited without an answer".into()))
    }

    /// Attach the completion callback. Runs immediately if the stream has
    /// already finished; only one callback may be attached per stream.
    pub fn on_complete<F>(&self, callback: F) -> Result<(), EngineError>
    where
        F: FnOnce(Arc<Answer>) + Send + 'static,
    {
        self.completion.attach(Box::new(callback))
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("thread_id", &self.thread_id)
            .field("answer_id", &self.answer_id)
            .finish_non_exhaustive()
    }
}

struct ActiveStream {
    cancel: CancellationToken,
    thread_id: ThreadId,
    _started_at: Instant,
}

pub struct SessionCoordinator {
    source: Arc<dyn ElementSource>,
    threads: Arc<ThreadRepo>,
    messages: Arc<MessageRepo>,
    suggestions: Arc<dyn SuggestionTrigger>,
    invalidator: Arc<dyn CacheInvalidator>,
    config: CoordinatorConfig,
    active: Arc<DashMap<StreamId, ActiveStream>>,
}

impl SessionCoordinator {
    pub fn new(source: Arc<dyn ElementSource>, db: Database) -> Self {
        Self {
            source,
            threads: Arc::new(ThreadRepo::new(db.clone())),
            messages: Arc::new(MessageRepo::new(db)),
            suggestions: Arc::new(NoSuggestions),
            invalidator: Arc::new(NoopInvalidator),
            config: CoordinatorConfig::default(),
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_suggestions(mut self, suggestions: Arc<dyn SuggestionTrigger>) -> Self {
        self.suggestions = suggestions;
        self
    }

    pub fn with_invalidator(mut self, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        self.invalidator = invalidator;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Persist the question and spawn the stream worker.
    #[instrument(skip(self, request), fields(thread_id = %request.thread_id))]
    pub async fn start(&self, request: StartRequest) -> Result<StreamHandle, EngineError> {
        if request.question.trim().is_empty() {
            return Err(EngineError::EmptyQuestion);
        }

        let thread_id = request.thread_id;
        self.threads.get(&thread_id).map_err(|e| {
            if e.is_not_found() {
                EngineError::ThreadNotFound(thread_id.to_string())
            } else {
                EngineError::Store(e)
            }
        })?;

        let parent_id = self.messages.last_message_id(&thread_id)?;
        let question = Question::new(thread_id.clone(), parent_id, request.question);
        self.messages.append_question(&question)?;

        let seed = AnswerSeed::new(thread_id.clone(), Some(question.id.clone()));
        let stream_id = StreamId::new();
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);
        let completion = Arc::new(CompletionSlot::new());

        let handle = StreamHandle {
            id: stream_id.clone(),
            thread_id: thread_id.clone(),
            question_id: question.id.clone(),
            answer_id: seed.id.clone(),
            cancel: cancel.clone(),
            finished: done_rx,
            completion: Arc::clone(&completion),
        };

        self.active.insert(
            stream_id.clone(),
            ActiveStream {
                cancel: cancel.clone(),
                thread_id: thread_id.clone(),
                _started_at: Instant::now(),
            },
        );

        let worker = StreamWorker {
            stream_id: stream_id.clone(),
            request: ElementRequest {
                thread_id,
                question: question.content,
                filters: request.filters,
                auth_token: request.auth_token,
            },
            seed,
            source: Arc::clone(&self.source),
            threads: Arc::clone(&self.threads),
            messages: Arc::clone(&self.messages),
            suggestions: Arc::clone(&self.suggestions),
            invalidator: Arc::clone(&self.invalidator),
            config: self.config.clone(),
            cancel,
        };
        let active = Arc::clone(&self.active);

        tokio::spawn(async move {
            let outcome = worker.run().await;
            active.remove(&stream_id);
            if let Ok(answer) = outcome {
                done_tx.send_replace(Some(Arc::clone(&answer)));
                completion.complete(answer);
            }
        });

        Ok(handle)
    }

    /// Cancel a stream by handle. Returns false if it already finished.
    pub fn cancel(&self, handle: &StreamHandle) -> bool {
        self.cancel_stream(handle.id())
    }

    pub fn cancel_stream(&self, stream_id: &StreamId) -> bool {
        if let Some((_, stream)) = self.active.remove(stream_id) {
            debug!(stream_id = %stream_id, thread_id = %stream.thread_id, "cancelling stream");
            stream.cancel.cancel();
            true
        } else {
            false
        }
    }

    pub fn cancel_all(&self) -> usize {
        let count = self.active.len();
        for entry in self.active.iter() {
            entry.value().cancel.cancel();
        }
        self.active.clear();
        count
    }

    pub fn is_active(&self, stream_id: &StreamId) -> bool {
        self.active.contains_key(stream_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Everything one spawned stream task owns.
struct StreamWorker {
    stream_id: StreamId,
    request: ElementRequest,
    seed: AnswerSeed,
    source: Arc<dyn ElementSource>,
    threads: Arc<ThreadRepo>,
    messages: Arc<MessageRepo>,
    suggestions: Arc<dyn SuggestionTrigger>,
    invalidator: Arc<dyn CacheInvalidator>,
    config: CoordinatorConfig,
    cancel: CancellationToken,
}

impl StreamWorker {
    #[instrument(
        name = "answer_stream",
        skip_all,
        fields(thread_id = %self.seed.thread_id, stream_id = %self.stream_id, source = self.source.name())
    )]
    async fn run(self) -> Result<Arc<Answer>, ProtocolViolation> {
        let mut assembler = StreamAssembler::new(self.seed.clone(), AssemblerLimits::from(&self.config));

        let answer = match self.drive(&mut assembler).await {
            Ok(answer) => answer,
            Err(violation) => {
                error!(%violation, "terminal signal on a closed assembler");
                assembler.answer().ok_or(violation)?
            }
        };

        self.after_finalize(&answer).await;
        Ok(answer)
    }

    async fn drive(&self, assembler: &mut StreamAssembler) -> Result<Arc<Answer>, ProtocolViolation> {
        let timeout = self.config.inactivity_timeout;
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return assembler.cancel(),
            opened = tokio::time::timeout(timeout, self.source.open(&self.request)) => opened,
        };

        let fatal = match opened {
            Ok(Ok(stream)) => return self.pump(stream, assembler).await,
            Ok(Err(e)) => {
                warn!(error = %e, kind = e.error_kind(), "element source failed to open");
                StreamElement::fatal(format!("element source unavailable: {e}"))
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "element source did not open in time");
                inactivity_error(timeout)
            }
        };
        match assembler.apply(fatal)? {
            Step::Finalized(answer) => Ok(answer),
            Step::Continue => assembler.finish(),
        }
    }

    async fn pump(
        &self,
        mut stream: ElementStream,
        assembler: &mut StreamAssembler,
    ) -> Result<Arc<Answer>, ProtocolViolation> {
        let timeout = self.config.inactivity_timeout;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("stream cancelled");
                    return assembler.cancel();
                }
                next = tokio::time::timeout(timeout, stream.next()) => next,
            };

            let element = match next {
                Err(_) => {
                    warn!(timeout_secs = timeout.as_secs(), "stream inactive, closing");
                    inactivity_error(timeout)
                }
                Ok(None) => return assembler.finish(),
                Ok(Some(SourceEvent::Failed(e))) => {
                    warn!(error = %e, kind = e.error_kind(), "element source failed mid-stream");
                    StreamElement::fatal(format!("transport failure: {e}"))
                }
                Ok(Some(SourceEvent::Malformed(e))) => {
                    warn!(error = %e, "skipping malformed element");
                    continue;
                }
                Ok(Some(SourceEvent::Element(wire))) => match wire.validate() {
                    Ok(element) => element,
                    Err(e) => {
                        warn!(error = %e, "skipping malformed element");
                        continue;
                    }
                },
            };

            if let Step::Finalized(answer) = assembler.apply(element)? {
                if let Some(violation) = report_trailing(&mut stream, assembler) {
                    error!(%violation, "element received after finalization");
                }
                return Ok(answer);
            }
        }
    }

    async fn after_finalize(&self, answer: &Arc<Answer>) {
        if let Err(e) = self.messages.append_answer(answer) {
            error!(error = %e, answer_id = %answer.id, "failed to persist answer");
        }
        if let Some(name) = &answer.metadata.thread_name {
            if let Err(e) = self.threads.rename(&answer.thread_id, name) {
                warn!(error = %e, "failed to apply thread name");
            }
        }

        self.invalidator.invalidate(&answer.thread_id).await;

        if should_suggest(answer) {
            let trigger = Arc::clone(&self.suggestions);
            let messages = Arc::clone(&self.messages);
            let answer_id = answer.id.clone();
            tokio::spawn(
                async move {
                    match trigger.suggest(&answer_id).await {
                        Ok(steps) if steps.is_empty() => {}
                        Ok(steps) => {
                            if let Err(e) = messages.record_next_steps(&answer_id, &steps) {
                                warn!(error = %e, "failed to record next steps");
                            }
                        }
                        Err(e) => warn!(answer_id = %answer_id, error = %e, "next-step suggestion failed"),
                    }
                }
                .in_current_span(),
            );
        }

        info!(
            answer_id = %answer.id,
            status = %answer.status,
            content_bytes = answer.content.len(),
            citations = answer.citations.len(),
            warnings = answer.metadata.warnings.len(),
            "answer finalized"
        );
    }
}

fn inactivity_error(timeout: Duration) -> StreamElement {
    StreamElement::fatal(format!("no element received for {}s", timeout.as_secs()))
}

/// Feed one element the source already had queued behind a terminal one.
/// Returns the violation a duplicate terminal (or any late element) raises.
fn report_trailing(
    stream: &mut ElementStream,
    assembler: &mut StreamAssembler,
) -> Option<ProtocolViolation> {
    let Some(Some(SourceEvent::Element(wire))) = stream.next().now_or_never() else {
        return None;
    };
    let element = wire.validate().ok()?;
    assembler.apply(element).err()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockResponse, MockSource, MockStep, RecordingInvalidator, RecordingSuggestions};
    use loom_core::element::{CitationData, ThinkingStep, ThreadMetadataPatch};
    use loom_core::errors::SourceError;
    use loom_core::ids::{NodeId, ReferenceId};
    use loom_core::messages::{AnswerStatus, ArticleSource, CitationSource, Message};
    use secrecy::ExposeSecret;

    struct Harness {
        db: Database,
        thread_id: ThreadId,
        source: Arc<MockSource>,
        suggestions: Arc<RecordingSuggestions>,
        invalidator: Arc<RecordingInvalidator>,
        coordinator: SessionCoordinator,
    }

    fn harness_with(responses: Vec<MockResponse>, suggestions: RecordingSuggestions) -> Harness {
        let db = Database::in_memory().unwrap();
        let thread_id = ThreadRepo::new(db.clone()).create("test", None).unwrap().id;
        let source = Arc::new(MockSource::new(responses));
        let suggestions = Arc::new(suggestions);
        let invalidator = Arc::new(RecordingInvalidator::default());
        let coordinator = SessionCoordinator::new(source.clone(), db.clone())
            .with_suggestions(suggestions.clone())
            .with_invalidator(invalidator.clone());
        Harness {
            db,
            thread_id,
            source,
            suggestions,
            invalidator,
            coordinator,
        }
    }

    fn harness(responses: Vec<MockResponse>) -> Harness {
        harness_with(
            responses,
            RecordingSuggestions::new(vec!["Why are sunsets red?".into()]),
        )
    }

    impl Harness {
        async fn ask(&self, question: &str) -> StreamHandle {
            self.coordinator
                .start(StartRequest::new(self.thread_id.clone(), question))
                .await
                .unwrap()
        }

        fn messages(&self) -> Vec<Message> {
            MessageRepo::new(self.db.clone()).list(&self.thread_id).unwrap()
        }
    }

    /// Let spawned fire-and-forget work run.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn citation(reference: &str) -> StreamElement {
        StreamElement::Citation(CitationData {
            reference_id: ReferenceId::from_raw(reference),
            source: CitationSource::Article(ArticleSource {
                title: "Why the sky is blue".into(),
                url: Some("https://science.example/sky".into()),
                publisher: None,
                published_at: None,
            }),
        })
    }

    fn retrieval() -> StreamElement {
        StreamElement::ThreadMetadata(ThreadMetadataPatch {
            thread_name: None,
            ran_retrieval: Some(true),
        })
    }

    #[tokio::test]
    async fn end_of_stream_completes_answer() {
        let h = harness(vec![MockResponse::elements(vec![
            StreamElement::chunk("The sky is"),
            StreamElement::chunk(" blue."),
            citation("c1"),
        ])]);
        let handle = h.ask("why is the sky blue?").await;
        let answer = handle.wait().await.unwrap();

        assert_eq!(answer.content, "The sky is blue.");
        assert_eq!(answer.citations.len(), 1);
        assert_eq!(answer.citations[0].reference_id.as_str(), "c1");
        assert!(!answer.metadata.error);
        assert_eq!(answer.status, AnswerStatus::Complete);
        assert_eq!(&answer.id, handle.answer_id());
        assert_eq!(answer.parent_id.as_ref(), Some(handle.question_id()));

        let messages = h.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].as_answer().unwrap(), answer.as_ref());
    }

    #[tokio::test]
    async fn fatal_error_keeps_partial_and_skips_suggestions() {
        let h = harness(vec![MockResponse::elements(vec![
            retrieval(),
            citation("c1"),
            StreamElement::chunk("Partial"),
            StreamElement::fatal("upstream timeout"),
        ])]);
        let answer = h.ask("q").await.wait().await.unwrap();
        settle().await;

        assert_eq!(answer.content, "Partial");
        assert!(answer.metadata.error);
        assert_eq!(answer.status, AnswerStatus::Errored);
        assert!(h.suggestions.calls().is_empty());
        assert_eq!(h.messages()[1].as_answer().unwrap().status, AnswerStatus::Errored);
    }

    #[tokio::test]
    async fn suggestions_run_once_after_successful_retrieval() {
        let h = harness(vec![MockResponse::elements(vec![
            retrieval(),
            StreamElement::chunk("Rayleigh scattering."),
            citation("c1"),
            StreamElement::Done,
        ])]);
        let answer = h.ask("q").await.wait().await.unwrap();
        assert!(answer.next_steps.is_empty());
        settle().await;

        assert_eq!(h.suggestions.calls(), vec![answer.id.clone()]);
        let stored = MessageRepo::new(h.db.clone()).get(&answer.id).unwrap();
        assert_eq!(stored.as_answer().unwrap().next_steps, ["Why are sunsets red?"]);
    }

    #[tokio::test]
    async fn no_suggestions_without_citations_or_retrieval() {
        let h = harness(vec![
            MockResponse::elements(vec![retrieval(), StreamElement::chunk("a"), StreamElement::Done]),
            MockResponse::elements(vec![citation("c1"), StreamElement::chunk("b"), StreamElement::Done]),
        ]);
        h.ask("first").await.wait().await.unwrap();
        h.ask("second").await.wait().await.unwrap();
        settle().await;
        assert!(h.suggestions.calls().is_empty());
    }

    #[tokio::test]
    async fn suggestion_failure_leaves_answer_intact() {
        let h = harness_with(
            vec![MockResponse::elements(vec![
                retrieval(),
                StreamElement::chunk("ok"),
                citation("c1"),
                StreamElement::Done,
            ])],
            RecordingSuggestions::failing("model offline"),
        );
        let answer = h.ask("q").await.wait().await.unwrap();
        settle().await;

        assert_eq!(h.suggestions.calls().len(), 1);
        let stored = h.messages()[1].as_answer().cloned().unwrap();
        assert_eq!(stored.content, "ok");
        assert_eq!(stored.status, AnswerStatus::Complete);
        assert!(stored.next_steps.is_empty());
        assert_eq!(stored.id, answer.id);
    }

    #[tokio::test]
    async fn cancel_mid_stream_preserves_partial_answer() {
        let h = harness(vec![MockResponse::stalling(vec![
            retrieval(),
            StreamElement::chunk("one "),
            citation("c1"),
            StreamElement::chunk("two"),
        ])]);
        let handle = h.ask("q").await;
        settle().await;
        assert!(h.coordinator.is_active(handle.id()));

        assert!(h.coordinator.cancel(&handle));
        let answer = handle.wait().await.unwrap();
        settle().await;

        assert_eq!(answer.status, AnswerStatus::Cancelled);
        assert_eq!(answer.content, "one two");
        assert_eq!(answer.citations.len(), 1);
        assert_eq!(answer.citations[0].offset, "one ".len());
        assert!(h.suggestions.calls().is_empty());
        assert_eq!(h.invalidator.calls().len(), 1);
        assert_eq!(h.source.released(), 1);
        assert!(!h.coordinator.is_active(handle.id()));
        assert_eq!(h.messages()[1].as_answer().unwrap().status, AnswerStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_before_open_completes() {
        let h = harness(vec![MockResponse::delayed(
            Duration::from_secs(30),
            MockResponse::elements(vec![StreamElement::chunk("late")]),
        )]);
        let handle = h.ask("q").await;
        handle.cancel();
        let answer = handle.wait().await.unwrap();
        assert_eq!(answer.status, AnswerStatus::Cancelled);
        assert_eq!(answer.content, "");
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_timeout_finalizes_with_error() {
        let h = harness(vec![MockResponse::stalling(vec![StreamElement::chunk("slow")])]);
        let coordinator = SessionCoordinator::new(h.source.clone(), h.db.clone()).with_config(
            CoordinatorConfig {
                inactivity_timeout: Duration::from_secs(60),
                ..Default::default()
            },
        );
        let handle = coordinator
            .start(StartRequest::new(h.thread_id.clone(), "q"))
            .await
            .unwrap();
        let answer = handle.wait().await.unwrap();

        assert_eq!(answer.status, AnswerStatus::Errored);
        assert_eq!(answer.content, "slow");
        assert!(answer
            .metadata
            .error_message
            .as_deref()
            .unwrap()
            .contains("no element received for 60s"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_but_steady_stream_is_not_timed_out() {
        let h = harness(vec![MockResponse::Stream(vec![
            MockStep::Event(SourceEvent::Element(StreamElement::chunk("a").into())),
            MockStep::Sleep(Duration::from_secs(45)),
            MockStep::Event(SourceEvent::Element(StreamElement::chunk("b").into())),
            MockStep::Sleep(Duration::from_secs(45)),
            MockStep::Event(SourceEvent::Element(StreamElement::Done.into())),
        ])]);
        let answer = h.ask("q").await.wait().await.unwrap();
        assert_eq!(answer.status, AnswerStatus::Complete);
        assert_eq!(answer.content, "ab");
    }

    #[tokio::test]
    async fn transport_failure_is_a_fatal_error() {
        let h = harness(vec![MockResponse::Stream(vec![
            MockStep::Event(SourceEvent::Element(StreamElement::chunk("half").into())),
            MockStep::Event(SourceEvent::Failed(SourceError::Interrupted("reset by peer".into()))),
        ])]);
        let answer = h.ask("q").await.wait().await.unwrap();
        assert_eq!(answer.status, AnswerStatus::Errored);
        assert_eq!(answer.content, "half");
        assert!(answer.metadata.error_message.as_deref().unwrap().contains("reset by peer"));
    }

    #[tokio::test]
    async fn open_failure_yields_errored_answer() {
        let h = harness(vec![MockResponse::OpenError(SourceError::Status {
            status: 401,
            body: "unauthorized".into(),
        })]);
        let answer = h.ask("q").await.wait().await.unwrap();
        assert_eq!(answer.status, AnswerStatus::Errored);
        assert!(answer.content.is_empty());
        assert_eq!(h.invalidator.calls().len(), 1);
        assert_eq!(h.messages().len(), 2);
    }

    #[tokio::test]
    async fn malformed_elements_are_skipped() {
        let h = harness(vec![MockResponse::lines(&[
            r#"{"type":"response_chunk","text":"a"}"#,
            "{not json",
            r#"{"type":"citation","citation":{"reference_id":"c1"}}"#,
            r#"{"type":"mystery"}"#,
            r#"{"type":"response_chunk","text":"b"}"#,
            r#"{"type":"done"}"#,
        ])]);
        let answer = h.ask("q").await.wait().await.unwrap();
        assert_eq!(answer.content, "ab");
        assert!(answer.citations.is_empty());
        assert_eq!(answer.status, AnswerStatus::Complete);
    }

    #[tokio::test]
    async fn elements_after_done_do_not_change_answer() {
        let h = harness(vec![MockResponse::elements(vec![
            StreamElement::chunk("x"),
            StreamElement::Done,
            StreamElement::chunk("y"),
            StreamElement::Done,
        ])]);
        let answer = h.ask("q").await.wait().await.unwrap();
        assert_eq!(answer.content, "x");
        assert_eq!(h.messages()[1].as_answer().unwrap().content, "x");
    }

    #[tokio::test]
    async fn completion_callback_fires_once() {
        let h = harness(vec![
            MockResponse::elements(vec![StreamElement::chunk("a"), StreamElement::Done]),
            MockResponse::elements(vec![StreamElement::chunk("b"), StreamElement::Done]),
        ]);

        let handle = h.ask("first").await;
        let (tx, rx) = tokio::sync::oneshot::channel();
        handle.on_complete(move |answer| {
            let _ = tx.send(answer.content.clone());
        })
        .unwrap();
        assert!(matches!(
            handle.on_complete(|_| {}),
            Err(EngineError::CallbackAlreadyAttached)
        ));
        assert_eq!(rx.await.unwrap(), "a");

        // Attached after the stream ended: runs immediately.
        let late = h.ask("second").await;
        late.wait().await.unwrap();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        late.on_complete(move |answer| *sink.lock() = Some(answer.content.clone()))
            .unwrap();
        assert_eq!(seen.lock().as_deref(), Some("b"));
        assert!(late.on_complete(|_| {}).is_err());
    }

    #[tokio::test]
    async fn invalidates_cache_once_per_stream() {
        let h = harness(vec![
            MockResponse::elements(vec![StreamElement::chunk("a"), StreamElement::Done]),
            MockResponse::elements(vec![StreamElement::fatal("boom")]),
        ]);
        h.ask("one").await.wait().await.unwrap();
        h.ask("two").await.wait().await.unwrap();
        assert_eq!(h.invalidator.calls(), vec![h.thread_id.clone(), h.thread_id.clone()]);
    }

    #[tokio::test]
    async fn questions_chain_to_previous_message() {
        let h = harness(vec![
            MockResponse::elements(vec![StreamElement::chunk("a1"), StreamElement::Done]),
            MockResponse::elements(vec![StreamElement::chunk("a2"), StreamElement::Done]),
        ]);
        let first = h.ask("q1").await.wait().await.unwrap();
        let second_handle = h.ask("q2").await;
        second_handle.wait().await.unwrap();

        let messages = h.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].parent_id(), None);
        assert_eq!(messages[2].id(), second_handle.question_id());
        assert_eq!(messages[2].parent_id(), Some(&first.id));
        assert_eq!(messages[3].parent_id(), Some(messages[2].id()));
    }

    #[tokio::test]
    async fn rejects_unknown_thread_and_blank_question() {
        let h = harness(vec![]);
        let err = h
            .coordinator
            .start(StartRequest::new(ThreadId::new(), "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ThreadNotFound(_)));

        let err = h
            .coordinator
            .start(StartRequest::new(h.thread_id.clone(), "   "))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EmptyQuestion));
        assert_eq!(h.source.open_count(), 0);
        assert!(h.messages().is_empty());
    }

    #[tokio::test]
    async fn request_is_passed_through_to_source() {
        let h = harness(vec![MockResponse::elements(vec![StreamElement::Done])]);
        let filters = ContentFilter(serde_json::json!({"sources": ["wire"], "opaque": {"x": 1}}));
        let handle = h
            .coordinator
            .start(
                StartRequest::new(h.thread_id.clone(), "what moved markets?")
                    .with_filters(filters.clone())
                    .with_auth_token(SecretString::from("tok-123")),
            )
            .await
            .unwrap();
        handle.wait().await.unwrap();

        let requests = h.source.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].thread_id, h.thread_id);
        assert_eq!(requests[0].question, "what moved markets?");
        assert_eq!(requests[0].filters, filters);
        assert_eq!(
            requests[0].auth_token.as_ref().map(|t| t.expose_secret().to_string()),
            Some("tok-123".to_string())
        );
    }

    #[tokio::test]
    async fn thread_name_metadata_renames_thread() {
        let h = harness(vec![MockResponse::elements(vec![
            StreamElement::ThreadMetadata(ThreadMetadataPatch {
                thread_name: Some("Blue skies".into()),
                ran_retrieval: None,
            }),
            StreamElement::Done,
        ])]);
        h.ask("q").await.wait().await.unwrap();
        let thread = ThreadRepo::new(h.db.clone()).get(&h.thread_id).unwrap();
        assert_eq!(thread.name, "Blue skies");
    }

    #[tokio::test]
    async fn cancel_all_stops_every_stream() {
        let h = harness(vec![
            MockResponse::stalling(vec![StreamElement::chunk("a")]),
            MockResponse::stalling(vec![StreamElement::chunk("b")]),
        ]);
        let first = h.ask("one").await;
        let second = h.ask("two").await;
        settle().await;
        assert_eq!(h.coordinator.active_count(), 2);

        assert_eq!(h.coordinator.cancel_all(), 2);
        let a = first.wait().await.unwrap();
        let b = second.wait().await.unwrap();
        assert_eq!((a.status, b.status), (AnswerStatus::Cancelled, AnswerStatus::Cancelled));
        assert_eq!(h.coordinator.active_count(), 0);
        assert_eq!(h.coordinator.cancel_all(), 0);
    }

    #[tokio::test]
    async fn concurrent_streams_on_one_thread_each_append() {
        let h = harness(vec![
            MockResponse::Stream(vec![
                MockStep::Sleep(Duration::from_millis(20)),
                MockStep::Event(SourceEvent::Element(StreamElement::chunk("slow").into())),
            ]),
            MockResponse::elements(vec![StreamElement::chunk("fast")]),
        ]);
        let slow = h.ask("one").await;
        let fast = h.ask("two").await;
        let (a, b) = tokio::join!(slow.wait(), fast.wait());
        assert_eq!(a.unwrap().content, "slow");
        assert_eq!(b.unwrap().content, "fast");

        let answers: Vec<_> = h
            .messages()
            .iter()
            .filter_map(|m| m.as_answer().map(|a| a.content.clone()))
            .collect();
        assert_eq!(answers, ["fast", "slow"]);
    }

    #[tokio::test]
    async fn cancel_unknown_or_finished_stream_returns_false() {
        let h = harness(vec![MockResponse::elements(vec![StreamElement::Done])]);
        assert!(!h.coordinator.cancel_stream(&StreamId::new()));
        let handle = h.ask("q").await;
        handle.wait().await.unwrap();
        assert!(!h.coordinator.cancel(&handle));
        assert!(handle.answer().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn open_that_never_returns_is_timed_out() {
        let h = harness(vec![MockResponse::delayed(
            Duration::from_secs(3600),
            MockResponse::elements(vec![StreamElement::chunk("late"), StreamElement::Done]),
        )]);
        let started = tokio::time::Instant::now();
        let answer = h.ask("q").await.wait().await.unwrap();

        assert_eq!(answer.status, AnswerStatus::Errored);
        assert_eq!(answer.content, "");
        assert!(answer
            .metadata
            .error_message
            .as_deref()
            .unwrap()
            .contains("no element received for 60s"));
        assert!(started.elapsed() < Duration::from_secs(61));
        assert_eq!(h.coordinator.active_count(), 0);
    }

    #[tokio::test]
    async fn trailing_terminal_is_reported_as_violation() {
        let source = MockSource::new(vec![
            MockResponse::elements(vec![
                StreamElement::chunk("x"),
                StreamElement::Done,
                StreamElement::Done,
            ]),
            MockResponse::elements(vec![StreamElement::Done]),
        ]);
        let request = ElementRequest::new(ThreadId::new(), "q");

        let mut stream = source.open(&request).await.unwrap();
        let mut assembler = StreamAssembler::new(
            AnswerSeed::new(request.thread_id.clone(), None),
            AssemblerLimits::from(&CoordinatorConfig::default()),
        );
        for _ in 0..2 {
            let Some(SourceEvent::Element(wire)) = stream.next().await else {
                panic!("expected an element");
            };
            assembler.apply(wire.validate().unwrap()).unwrap();
        }
        let violation = report_trailing(&mut stream, &mut assembler).unwrap();
        assert_eq!(violation.signal, "done");
        assert_eq!(assembler.answer().unwrap().content, "x");

        // Nothing queued behind the terminal element.
        let mut stream = source.open(&request).await.unwrap();
        let mut assembler = StreamAssembler::new(
            AnswerSeed::new(request.thread_id.clone(), None),
            AssemblerLimits::from(&CoordinatorConfig::default()),
        );
        let Some(SourceEvent::Element(wire)) = stream.next().await else {
            panic!("expected an element");
        };
        assembler.apply(wire.validate().unwrap()).unwrap();
        assert!(report_trailing(&mut stream, &mut assembler).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deep_thinking_trace_persists_and_reloads() {
        const DEPTH: usize = 10_000;
        let mut elements: Vec<StreamElement> = (0..DEPTH)
            .map(|i| {
                StreamElement::ThinkingBranch(ThinkingStep {
                    node_id: NodeId::from_raw(i.to_string()),
                    parent_id: i.checked_sub(1).map(|p| NodeId::from_raw(p.to_string())),
                    label: format!("step {i}"),
                })
            })
            .collect();
        elements.push(StreamElement::chunk("deep"));
        elements.push(StreamElement::Done);

        let h = harness(vec![MockResponse::elements(elements)]);
        let coordinator = SessionCoordinator::new(h.source.clone(), h.db.clone()).with_config(
            CoordinatorConfig {
                max_thinking_nodes: 2 * DEPTH,
                ..Default::default()
            },
        );
        let answer = coordinator
            .start(StartRequest::new(h.thread_id.clone(), "q"))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(answer.status, AnswerStatus::Complete);
        assert_eq!(answer.thinking.as_ref().unwrap().depth(), DEPTH);

        let stored = MessageRepo::new(h.db.clone()).get(&answer.id).unwrap();
        let tree = stored.as_answer().unwrap().thinking.clone().unwrap();
        assert_eq!(tree.depth(), DEPTH);
        assert_eq!(tree.node_count(), DEPTH);
        assert_eq!(h.messages().len(), 2);
    }
}
