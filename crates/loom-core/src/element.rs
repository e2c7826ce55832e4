//! Stream elements: the closed set of protocol units that make up a live answer.
//!
//! [`WireElement`] is the lenient decoded form (one NDJSON line, every field
//! optional). [`WireElement::validate`] turns it into a [`StreamElement`],
//! whose payloads are complete, or rejects it as [`MalformedElement`].
//! Only validated elements ever reach the assembler.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::MalformedElement;
use crate::ids::{NodeId, ReferenceId, TraceId};
use crate::messages::{
    ArticleSource, CitationSource, FinancialDataSource, GenericSource, StorySource,
    WebPageSource, WikipediaSource,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireElement {
    ResponseChunk {
        #[serde(default)]
        text: Option<String>,
    },
    Citation {
        #[serde(default)]
        citation: Option<CitationPayload>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
        /// Absent means fatal.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fatal: Option<bool>,
    },
    ThreadMetadata {
        #[serde(default)]
        patch: ThreadMetadataPatch,
    },
    TraceMetadata {
        #[serde(default)]
        patch: TraceMetadataPatch,
    },
    ThinkingBranch {
        #[serde(default)]
        node_id: Option<NodeId>,
        #[serde(default)]
        parent_id: Option<NodeId>,
        #[serde(default)]
        label: String,
    },
    ThinkingLeaf {
        #[serde(default)]
        node_id: Option<NodeId>,
        #[serde(default)]
        parent_id: Option<NodeId>,
        #[serde(default)]
        label: String,
    },
    ThinkingDuration {
        #[serde(default)]
        node_id: Option<NodeId>,
        #[serde(default)]
        millis: Option<u64>,
    },
    Done,
}

/// Citation as it appears on the wire: one nullable field per source variant.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CitationPayload {
    #[serde(default)]
    pub reference_id: Option<ReferenceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub article: Option<ArticleSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wikipedia: Option<WikipediaSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub financial_data: Option<FinancialDataSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_page: Option<WebPageSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story: Option<StorySource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generic: Option<GenericSource>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadMetadataPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ran_retrieval: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceMetadataPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// Validated citation content, before the assembler stamps its offset.
#[derive(Clone, Debug, PartialEq)]
pub struct CitationData {
    pub reference_id: ReferenceId,
    pub source: CitationSource,
}

/// Branch or leaf announcement for a thinking node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThinkingStep {
    pub node_id: NodeId,
    /// `None` means root-level.
    pub parent_id: Option<NodeId>,
    pub label: String,
}

/// A validated stream element. Matched exhaustively at the assembler's routing point.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamElement {
    ResponseChunk { text: String },
    Citation(CitationData),
    Error { message: String, fatal: bool },
    ThreadMetadata(ThreadMetadataPatch),
    TraceMetadata(TraceMetadataPatch),
    ThinkingBranch(ThinkingStep),
    ThinkingLeaf(ThinkingStep),
    ThinkingDuration { node_id: NodeId, millis: u64 },
    Done,
}

impl StreamElement {
    pub fn chunk(text: impl Into<String>) -> Self {
        Self::ResponseChunk { text: text.into() }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            fatal: true,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResponseChunk { .. } => "response_chunk",
            Self::Citation(_) => "citation",
            Self::Error { .. } => "error",
            Self::ThreadMetadata(_) => "thread_metadata",
            Self::TraceMetadata(_) => "trace_metadata",
            Self::ThinkingBranch(_) => "thinking_branch",
            Self::ThinkingLeaf(_) => "thinking_leaf",
            Self::ThinkingDuration { .. } => "thinking_duration",
            Self::Done => "done",
        }
    }

    /// Whether this element ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { fatal: true, .. })
    }
}

impl WireElement {
    /// Decode one NDJSON line.
    pub fn decode(line: &str) -> Result<Self, MalformedElement> {
        serde_json::from_str(line).map_err(|e| MalformedElement::Decode(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResponseChunk { .. } => "response_chunk",
            Self::Citation { .. } => "citation",
            Self::Error { .. } => "error",
            Self::ThreadMetadata { .. } => "thread_metadata",
            Self::TraceMetadata { .. } => "trace_metadata",
            Self::ThinkingBranch { .. } => "thinking_branch",
            Self::ThinkingLeaf { .. } => "thinking_leaf",
            Self::ThinkingDuration { .. } => "thinking_duration",
            Self::Done => "done",
        }
    }

    /// Check that every field required by the variant is present.
    pub fn validate(self) -> Result<StreamElement, MalformedElement> {
        match self {
            Self::ResponseChunk { text } => {
                let text = text.ok_or(MalformedElement::missing("response_chunk", "text"))?;
                Ok(StreamElement::ResponseChunk { text })
            }
            Self::Citation { citation } => {
                let payload = citation.ok_or(MalformedElement::missing("citation", "citation"))?;
                payload.validate().map(StreamElement::Citation)
            }
            Self::Error { message, fatal } => {
                let message = message.ok_or(MalformedElement::missing("error", "message"))?;
                Ok(StreamElement::Error {
                    message,
                    fatal: fatal.unwrap_or(true),
                })
            }
            Self::ThreadMetadata { patch } => Ok(StreamElement::ThreadMetadata(patch)),
            Self::TraceMetadata { patch } => Ok(StreamElement::TraceMetadata(patch)),
            Self::ThinkingBranch {
                node_id,
                parent_id,
                label,
            } => thinking_step("thinking_branch", node_id, parent_id, label)
                .map(StreamElement::ThinkingBranch),
            Self::ThinkingLeaf {
                node_id,
                parent_id,
                label,
            } => thinking_step("thinking_leaf", node_id, parent_id, label)
                .map(StreamElement::ThinkingLeaf),
            Self::ThinkingDuration { node_id, millis } => {
                let node_id = required_node("thinking_duration", node_id)?;
                let millis = millis.ok_or(MalformedElement::missing("thinking_duration", "millis"))?;
                Ok(StreamElement::ThinkingDuration { node_id, millis })
            }
            Self::Done => Ok(StreamElement::Done),
        }
    }
}

/// Free-function form of [`WireElement::validate`].
pub fn validate(element: WireElement) -> Result<StreamElement, MalformedElement> {
    element.validate()
}

fn required_node(kind: &'static str, id: Option<NodeId>) -> Result<NodeId, MalformedElement> {
    id.filter(|id| !id.is_blank())
        .ok_or(MalformedElement::missing(kind, "node_id"))
}

fn thinking_step(
    kind: &'static str,
    node_id: Option<NodeId>,
    parent_id: Option<NodeId>,
    label: String,
) -> Result<ThinkingStep, MalformedElement> {
    Ok(ThinkingStep {
        node_id: required_node(kind, node_id)?,
        // Empty parent on the wire means root-level.
        parent_id: parent_id.filter(|p| !p.is_blank()),
        label,
    })
}

impl CitationPayload {
    pub fn validate(self) -> Result<CitationData, MalformedElement> {
        let reference_id = self
            .reference_id
            .filter(|r| !r.is_blank())
            .ok_or(MalformedElement::missing("citation", "reference_id"))?;

        let mut sources: Vec<CitationSource> = Vec::with_capacity(1);
        sources.extend(self.article.map(CitationSource::Article));
        sources.extend(self.wikipedia.map(CitationSource::Wikipedia));
        sources.extend(self.financial_data.map(CitationSource::FinancialData));
        sources.extend(self.web_page.map(CitationSource::WebPage));
        sources.extend(self.story.map(CitationSource::Story));
        sources.extend(self.generic.map(CitationSource::Generic));

        if sources.len() != 1 {
            return Err(MalformedElement::CitationSourceCount {
                reference_id: reference_id.to_string(),
                count: sources.len(),
            });
        }
        let source = sources.remove(0);
        Ok(CitationData {
            reference_id,
            source,
        })
    }
}

impl From<CitationData> for CitationPayload {
    fn from(data: CitationData) -> Self {
        let mut payload = CitationPayload {
            reference_id: Some(data.reference_id),
            ..Default::default()
        };
        match data.source {
            CitationSource::Article(s) => payload.article = Some(s),
            CitationSource::Wikipedia(s) => payload.wikipedia = Some(s),
            CitationSource::FinancialData(s) => payload.financial_data = Some(s),
            CitationSource::WebPage(s) => payload.web_page = Some(s),
            CitationSource::Story(s) => payload.story = Some(s),
            CitationSource::Generic(s) => payload.generic = Some(s),
        }
        payload
    }
}

impl From<StreamElement> for WireElement {
    fn from(element: StreamElement) -> Self {
        match element {
            StreamElement::ResponseChunk { text } => Self::ResponseChunk { text: Some(text) },
            StreamElement::Citation(data) => Self::Citation {
                citation: Some(data.into()),
            },
            StreamElement::Error { message, fatal } => Self::Error {
                message: Some(message),
                fatal: Some(fatal),
            },
            StreamElement::ThreadMetadata(patch) => Self::ThreadMetadata { patch },
            StreamElement::TraceMetadata(patch) => Self::TraceMetadata { patch },
            StreamElement::ThinkingBranch(step) => Self::ThinkingBranch {
                node_id: Some(step.node_id),
                parent_id: step.parent_id,
                label: step.label,
            },
            StreamElement::ThinkingLeaf(step) => Self::ThinkingLeaf {
                node_id: Some(step.node_id),
                parent_id: step.parent_id,
                label: step.label,
            },
            StreamElement::ThinkingDuration { node_id, millis } => Self::ThinkingDuration {
                node_id: Some(node_id),
                millis: Some(millis),
            },
            StreamElement::Done => Self::Done,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_valid(line: &str) -> StreamElement {
        WireElement::decode(line).unwrap().validate().unwrap()
    }

    #[test]
    fn decodes_every_variant() {
        let lines = [
            r#"{"type":"response_chunk","text":"The sky is"}"#,
            r#"{"type":"citation","citation":{"reference_id":"c1","article":{"title":"Sky"}}}"#,
            r#"{"type":"error","message":"upstream timeout","fatal":true}"#,
            r#"{"type":"thread_metadata","patch":{"thread_name":"Sky","ran_retrieval":true}}"#,
            r#"{"type":"trace_metadata","patch":{"trace_id":"tr-9","attributes":{"model":"m"}}}"#,
            r#"{"type":"thinking_branch","node_id":"1","parent_id":null,"label":"Plan"}"#,
            r#"{"type":"thinking_leaf","node_id":"2","parent_id":"1","label":"Search"}"#,
            r#"{"type":"thinking_duration","node_id":"2","millis":50}"#,
            r#"{"type":"done"}"#,
        ];
        let kinds: Vec<&str> = lines.iter().map(|l| decode_valid(l).kind()).collect();
        assert_eq!(
            kinds,
            [
                "response_chunk",
                "citation",
                "error",
                "thread_metadata",
                "trace_metadata",
                "thinking_branch",
                "thinking_leaf",
                "thinking_duration",
                "done",
            ]
        );
    }

    #[test]
    fn empty_chunk_is_valid_but_missing_text_is_not() {
        assert_eq!(
            decode_valid(r#"{"type":"response_chunk","text":""}"#),
            StreamElement::chunk("")
        );
        let err = WireElement::decode(r#"{"type":"response_chunk"}"#)
            .unwrap()
            .validate()
            .unwrap_err();
        assert_eq!(err, MalformedElement::missing("response_chunk", "text"));
    }

    #[test]
    fn unknown_type_and_bad_json_fail_decode() {
        assert!(matches!(
            WireElement::decode(r#"{"type":"mystery"}"#),
            Err(MalformedElement::Decode(_))
        ));
        assert!(matches!(
            WireElement::decode("not json"),
            Err(MalformedElement::Decode(_))
        ));
    }

    #[test]
    fn citation_requires_exactly_one_source() {
        let none = r#"{"type":"citation","citation":{"reference_id":"c1"}}"#;
        let err = WireElement::decode(none).unwrap().validate().unwrap_err();
        assert!(matches!(err, MalformedElement::CitationSourceCount { count: 0, .. }));

        let two = r#"{"type":"citation","citation":{"reference_id":"c1",
            "article":{"title":"A"},"web_page":{"url":"https://x.test"}}}"#;
        let err = WireElement::decode(two).unwrap().validate().unwrap_err();
        assert!(matches!(err, MalformedElement::CitationSourceCount { count: 2, .. }));
    }

    #[test]
    fn citation_requires_reference_id() {
        let line = r#"{"type":"citation","citation":{"reference_id":"  ","generic":{"label":"g"}}}"#;
        let err = WireElement::decode(line).unwrap().validate().unwrap_err();
        assert_eq!(err, MalformedElement::missing("citation", "reference_id"));
    }

    #[test]
    fn thinking_requires_node_id_and_normalizes_empty_parent() {
        let err = WireElement::decode(r#"{"type":"thinking_leaf","label":"x"}"#)
            .unwrap()
            .validate()
            .unwrap_err();
        assert_eq!(err, MalformedElement::missing("thinking_leaf", "node_id"));

        match decode_valid(r#"{"type":"thinking_branch","node_id":"1","parent_id":""}"#) {
            StreamElement::ThinkingBranch(step) => assert!(step.parent_id.is_none()),
            other => panic!("expected branch, got {other:?}"),
        }
    }

    #[test]
    fn duration_requires_millis() {
        let err = WireElement::decode(r#"{"type":"thinking_duration","node_id":"1"}"#)
            .unwrap()
            .validate()
            .unwrap_err();
        assert_eq!(err, MalformedElement::missing("thinking_duration", "millis"));
    }

    #[test]
    fn error_without_fatal_flag_is_fatal() {
        let el = decode_valid(r#"{"type":"error","message":"boom"}"#);
        assert!(el.is_terminal());
        let el = decode_valid(r#"{"type":"error","message":"meh","fatal":false}"#);
        assert!(!el.is_terminal());
    }

    #[test]
    fn terminal_classification() {
        assert!(StreamElement::Done.is_terminal());
        assert!(StreamElement::fatal("x").is_terminal());
        assert!(!StreamElement::warning("x").is_terminal());
        assert!(!StreamElement::chunk("x").is_terminal());
    }

    #[test]
    fn validated_element_encodes_back_to_wire() {
        let data = CitationData {
            reference_id: ReferenceId::from_raw("c7"),
            source: CitationSource::Story(StorySource {
                headline: "Markets rally".into(),
                url: None,
                story_id: Some("s-1".into()),
            }),
        };
        let wire: WireElement = StreamElement::Citation(data.clone()).into();
        let line = wire.encode().unwrap();
        assert!(line.contains(r#""type":"citation""#));
        assert_eq!(
            WireElement::decode(&line).unwrap().validate().unwrap(),
            StreamElement::Citation(data)
        );
    }
}
