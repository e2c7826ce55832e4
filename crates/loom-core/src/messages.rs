use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, ReferenceId, ThreadId, TraceId};
use crate::thinking::ThinkingTree;

/// Opaque content filter. Passed through to the element source untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentFilter(pub serde_json::Value);

impl ContentFilter {
    pub fn none() -> Self {
        Self(serde_json::Value::Null)
    }

    pub fn is_none(&self) -> bool {
        self.0.is_null()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_filter: Option<ContentFilter>,
    #[serde(default)]
    pub shared: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    Question(Question),
    Answer(Answer),
}

impl Message {
    pub fn id(&self) -> &MessageId {
        match self {
            Self::Question(q) => &q.id,
            Self::Answer(a) => &a.id,
        }
    }

    pub fn thread_id(&self) -> &ThreadId {
        match self {
            Self::Question(q) => &q.thread_id,
            Self::Answer(a) => &a.thread_id,
        }
    }

    pub fn parent_id(&self) -> Option<&MessageId> {
        match self {
            Self::Question(q) => q.parent_id.as_ref(),
            Self::Answer(a) => a.parent_id.as_ref(),
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Question(q) => q.created_at,
            Self::Answer(a) => a.created_at,
        }
    }

    pub fn as_answer(&self) -> Option<&Answer> {
        match self {
            Self::Answer(a) => Some(a),
            Self::Question(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: MessageId,
    pub thread_id: ThreadId,
    /// Previous message in the thread; `None` for the first question.
    pub parent_id: Option<MessageId>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Question {
    pub fn new(thread_id: ThreadId, parent_id: Option<MessageId>, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            thread_id,
            parent_id,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// How an answer stream ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    Complete,
    Errored,
    Cancelled,
}

impl std::fmt::Display for AnswerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Errored => write!(f, "errored"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for AnswerStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(Self::Complete),
            "errored" => Ok(Self::Errored),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown answer status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnswerMetadata {
    pub ran_retrieval: bool,
    pub has_citations: bool,
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Non-fatal upstream errors, in arrival order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// A finalized assistant answer. Built once by the assembler; never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub id: MessageId,
    pub thread_id: ThreadId,
    /// The question this answers.
    pub parent_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    pub content: String,
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingTree>,
    pub metadata: AnswerMetadata,
    pub status: AnswerStatus,
    pub created_at: DateTime<Utc>,
}

impl Answer {
    pub fn is_cancelled(&self) -> bool {
        self.status == AnswerStatus::Cancelled
    }

    /// True when every citation offset lies within the content.
    pub fn offsets_consistent(&self) -> bool {
        self.citations.iter().all(|c| c.offset <= self.content.len())
    }
}

/// A source reference backing part of an answer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub reference_id: ReferenceId,
    pub source: CitationSource,
    /// Byte offset into the answer content at the moment the citation arrived.
    pub offset: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CitationSource {
    Article(ArticleSource),
    Wikipedia(WikipediaSource),
    FinancialData(FinancialDataSource),
    WebPage(WebPageSource),
    Story(StorySource),
    Generic(GenericSource),
}

impl CitationSource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Article(_) => "article",
            Self::Wikipedia(_) => "wikipedia",
            Self::FinancialData(_) => "financial_data",
            Self::WebPage(_) => "web_page",
            Self::Story(_) => "story",
            Self::Generic(_) => "generic",
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Article(s) => s.url.as_deref(),
            Self::Wikipedia(s) => Some(&s.url),
            Self::FinancialData(_) => None,
            Self::WebPage(s) => Some(&s.url),
            Self::Story(s) => s.url.as_deref(),
            Self::Generic(s) => s.url.as_deref(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArticleSource {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WikipediaSource {
    pub title: String,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinancialDataSource {
    pub symbol: String,
    pub metric: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_of: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebPageSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorySource {
    pub headline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenericSource {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer(content: &str, offsets: &[usize]) -> Answer {
        Answer {
            id: MessageId::new(),
            thread_id: ThreadId::new(),
            parent_id: None,
            trace_id: None,
            content: content.into(),
            citations: offsets
                .iter()
                .enumerate()
                .map(|(i, &offset)| Citation {
                    reference_id: ReferenceId::from_raw(format!("c{i}")),
                    source: CitationSource::Generic(GenericSource {
                        label: "src".into(),
                        url: None,
                        detail: None,
                    }),
                    offset,
                })
                .collect(),
            next_steps: Vec::new(),
            thinking: None,
            metadata: AnswerMetadata::default(),
            status: AnswerStatus::Complete,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn message_role_tag() {
        let q = Message::Question(Question::new(ThreadId::new(), None, "why?"));
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json["role"], "question");
        assert_eq!(json["content"], "why?");

        let a = Message::Answer(answer("because", &[]));
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["role"], "answer");
        assert_eq!(json["status"], "complete");
    }

    #[test]
    fn citation_source_tag_and_kind() {
        let src = CitationSource::Wikipedia(WikipediaSource {
            title: "Sky".into(),
            url: "https://en.wikipedia.org/wiki/Sky".into(),
        });
        let json = serde_json::to_value(&src).unwrap();
        assert_eq!(json["kind"], "wikipedia");
        assert_eq!(src.kind(), "wikipedia");
        assert_eq!(src.url(), Some("https://en.wikipedia.org/wiki/Sky"));
    }

    #[test]
    fn offsets_consistency_check() {
        assert!(answer("hello", &[0, 5]).offsets_consistent());
        assert!(!answer("hello", &[6]).offsets_consistent());
    }

    #[test]
    fn answer_status_parse_and_display() {
        for status in [AnswerStatus::Complete, AnswerStatus::Errored, AnswerStatus::Cancelled] {
            let parsed: AnswerStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<AnswerStatus>().is_err());
    }

    #[test]
    fn message_accessors() {
        let q = Question::new(ThreadId::new(), Some(MessageId::from_raw("msg_prev")), "q");
        let msg = Message::Question(q.clone());
        assert_eq!(msg.id(), &q.id);
        assert_eq!(msg.parent_id().map(MessageId::as_str), Some("msg_prev"));
        assert!(msg.as_answer().is_none());
    }

    #[test]
    fn content_filter_is_opaque() {
        let filter = ContentFilter(serde_json::json!({"sources": ["news"], "since": "2024"}));
        let json = serde_json::to_string(&filter).unwrap();
        let back: ContentFilter = serde_json::from_str(&json).unwrap();
        assert_eq!(back, filter);
        assert!(ContentFilter::none().is_none());
    }
}
