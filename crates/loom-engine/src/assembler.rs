//! Per-stream state machine folding validated elements into one [`Answer`].
//!
//! ```text
//! Open ──chunk/citation/thinking/metadata/warning──▶ Open
//! Open ──done / end of stream──▶ Closing ──▶ Closed(success)
//! Open ──fatal error──────────▶ Closing ──▶ Closed(error)
//! Open ──cancel───────────────▶ Closing ──▶ Cancelled
//! ```
//!
//! Every terminal path goes through [`StreamAssembler::close`], which runs
//! the trace and citation finalization exactly once. Any signal after that
//! is a [`ProtocolViolation`] and leaves the finalized answer untouched.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use loom_core::element::{CitationData, StreamElement, ThreadMetadataPatch, TraceMetadataPatch};
use loom_core::errors::ProtocolViolation;
use loom_core::ids::{MessageId, ThreadId, TraceId};
use loom_core::messages::{Answer, AnswerMetadata, AnswerStatus, Citation};

use crate::citations::{AddOutcome, CitationRegistry};
use crate::config::CoordinatorConfig;
use crate::trace::{TraceBuilder, TraceEvent, TraceIngest};

/// Identity of the answer being assembled, fixed before the first element.
#[derive(Clone, Debug)]
pub struct AnswerSeed {
    pub id: MessageId,
    pub thread_id: ThreadId,
    /// The question being answered.
    pub parent_id: Option<MessageId>,
}

impl AnswerSeed {
    pub fn new(thread_id: ThreadId, parent_id: Option<MessageId>) -> Self {
        Self {
            id: MessageId::new(),
            thread_id,
            parent_id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseKind {
    Success,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssemblerState {
    Open,
    Closing,
    Closed(CloseKind),
    Cancelled,
}

impl AssemblerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed(_) | Self::Cancelled)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed(CloseKind::Success) => "closed(success)",
            Self::Closed(CloseKind::Error) => "closed(error)",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Outcome of feeding one element.
#[derive(Clone, Debug)]
pub enum Step {
    Continue,
    Finalized(Arc<Answer>),
}

impl Step {
    pub fn finalized(&self) -> Option<&Arc<Answer>> {
        match self {
            Self::Finalized(answer) => Some(answer),
            Self::Continue => None,
        }
    }
}

enum Closure {
    Success,
    Error(String),
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssemblerLimits {
    pub max_thinking_nodes: usize,
    pub max_content_bytes: usize,
}

impl Default for AssemblerLimits {
    fn default() -> Self {
        Self::from(&CoordinatorConfig::default())
    }
}

impl From<&CoordinatorConfig> for AssemblerLimits {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            max_thinking_nodes: config.max_thinking_nodes,
            max_content_bytes: config.max_content_bytes,
        }
    }
}

pub struct StreamAssembler {
    seed: AnswerSeed,
    state: AssemblerState,
    content: String,
    citations: CitationRegistry,
    trace: TraceBuilder,
    metadata: AnswerMetadata,
    trace_id: Option<TraceId>,
    max_content_bytes: usize,
    content_capped: bool,
    trace_capped: bool,
    answer: Option<Arc<Answer>>,
}

impl StreamAssembler {
    pub fn new(seed: AnswerSeed, limits: AssemblerLimits) -> Self {
        Self {
            seed,
            state: AssemblerState::Open,
            content: String::new(),
            citations: CitationRegistry::new(),
            trace: TraceBuilder::new(limits.max_thinking_nodes),
            metadata: AnswerMetadata::default(),
            trace_id: None,
            max_content_bytes: limits.max_content_bytes,
            content_capped: false,
            trace_capped: false,
            answer: None,
        }
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    pub fn answer_id(&self) -> &MessageId {
        &self.seed.id
    }

    /// Text accumulated so far (the final content once finalized).
    pub fn content(&self) -> &str {
        match &self.answer {
            Some(answer) => &answer.content,
            None => &self.content,
        }
    }

    /// Citations accepted so far, in arrival order.
    pub fn citations(&self) -> &[Citation] {
        self.citations.as_slice()
    }

    /// The finalized answer, once a terminal state is reached.
    pub fn answer(&self) -> Option<Arc<Answer>> {
        self.answer.clone()
    }

    /// Route one element. The only place element variants are matched.
    pub fn apply(&mut self, element: StreamElement) -> Result<Step, ProtocolViolation> {
        self.ensure_open(element.kind())?;

        match element {
            StreamElement::ResponseChunk { text } => self.append_text(&text),
            StreamElement::Citation(data) => self.add_citation(data),
            StreamElement::Error { message, fatal: true } => {
                return Ok(Step::Finalized(self.close(Closure::Error(message))));
            }
            StreamElement::Error { message, fatal: false } => {
                debug!(answer_id = %self.seed.id, %message, "non-fatal upstream error");
                self.metadata.warnings.push(message);
            }
            StreamElement::ThreadMetadata(patch) => self.merge_thread_metadata(patch),
            StreamElement::TraceMetadata(patch) => self.merge_trace_metadata(patch),
            StreamElement::ThinkingBranch(step) => self.ingest_thinking(TraceEvent::Branch(step)),
            StreamElement::ThinkingLeaf(step) => self.ingest_thinking(TraceEvent::Leaf(step)),
            StreamElement::ThinkingDuration { node_id, millis } => {
                self.ingest_thinking(TraceEvent::Duration { node_id, millis })
            }
            StreamElement::Done => {
                return Ok(Step::Finalized(self.close(Closure::Success)));
            }
        }
        Ok(Step::Continue)
    }

    /// The source ended without an explicit `done`.
    pub fn finish(&mut self) -> Result<Arc<Answer>, ProtocolViolation> {
        self.ensure_open("end_of_stream")?;
        Ok(self.close(Closure::Success))
    }

    pub fn cancel(&mut self) -> Result<Arc<Answer>, ProtocolViolation> {
        self.ensure_open("cancel")?;
        Ok(self.close(Closure::Cancelled))
    }

    fn ensure_open(&self, signal: &'static str) -> Result<(), ProtocolViolation> {
        match self.state {
            AssemblerState::Open => Ok(()),
            state => Err(ProtocolViolation {
                signal,
                state: state.label(),
            }),
        }
    }

    fn append_text(&mut self, text: &str) {
        if self.content_capped {
            return;
        }
        if self.content.len() + text.len() > self.max_content_bytes {
            self.content_capped = true;
            warn!(
                answer_id = %self.seed.id,
                limit = self.max_content_bytes,
                "answer content limit reached, dropping further text"
            );
            self.metadata.warnings.push(format!(
                "answer content exceeded {} bytes; further text dropped",
                self.max_content_bytes
            ));
            return;
        }
        self.content.push_str(text);
    }

    fn add_citation(&mut self, data: CitationData) {
        let citation = Citation {
            reference_id: data.reference_id,
            source: data.source,
            offset: self.content.len(),
        };
        if self.citations.add(citation) == AddOutcome::Duplicate {
            debug!(answer_id = %self.seed.id, "duplicate citation absorbed");
        }
    }

    fn merge_thread_metadata(&mut self, patch: ThreadMetadataPatch) {
        if let Some(name) = patch.thread_name {
            self.metadata.thread_name = Some(name);
        }
        if let Some(ran) = patch.ran_retrieval {
            self.metadata.ran_retrieval = ran;
        }
    }

    fn merge_trace_metadata(&mut self, patch: TraceMetadataPatch) {
        if let Some(trace_id) = patch.trace_id {
            self.trace_id = Some(trace_id);
        }
        self.metadata.attributes.extend(patch.attributes);
    }

    fn ingest_thinking(&mut self, event: TraceEvent) {
        match self.trace.ingest(event) {
            TraceIngest::Duplicate | TraceIngest::DuplicateDuration => {
                debug!(answer_id = %self.seed.id, "duplicate thinking event ignored");
            }
            TraceIngest::OverCapacity if !self.trace_capped => {
                self.trace_capped = true;
                warn!(answer_id = %self.seed.id, "thinking trace node limit reached");
                self.metadata
                    .warnings
                    .push("thinking trace exceeded node limit; further nodes dropped".into());
            }
            _ => {}
        }
    }

    fn close(&mut self, closure: Closure) -> Arc<Answer> {
        self.state = AssemblerState::Closing;

        let citations = self.citations.snapshot();
        let thinking = self.trace.finalize();
        let mut metadata = std::mem::take(&mut self.metadata);
        metadata.has_citations = !citations.is_empty();

        let (status, final_state) = match closure {
            Closure::Success => (AnswerStatus::Complete, AssemblerState::Closed(CloseKind::Success)),
            Closure::Error(message) => {
                metadata.error = true;
                metadata.error_message = Some(message);
                (AnswerStatus::Errored, AssemblerState::Closed(CloseKind::Error))
            }
            Closure::Cancelled => (AnswerStatus::Cancelled, AssemblerState::Cancelled),
        };

        let answer = Arc::new(Answer {
            id: self.seed.id.clone(),
            thread_id: self.seed.thread_id.clone(),
            parent_id: self.seed.parent_id.clone(),
            trace_id: self.trace_id.take(),
            content: std::mem::take(&mut self.content),
            citations,
            next_steps: Vec::new(),
            thinking,
            metadata,
            status,
            created_at: Utc::now(),
        });

        self.state = final_state;
        self.answer = Some(Arc::clone(&answer));
        answer
    }
}
