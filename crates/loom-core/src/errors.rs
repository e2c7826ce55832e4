/// An element that failed variant validation. Recovered locally: logged and skipped.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MalformedElement {
    #[error("undecodable element: {0}")]
    Decode(String),
    #[error("{kind} element missing required field `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("citation {reference_id} has {count} source variants, expected exactly one")]
    CitationSourceCount { reference_id: String, count: usize },
}

impl MalformedElement {
    pub fn missing(kind: &'static str, field: &'static str) -> Self {
        Self::MissingField { kind, field }
    }
}

/// A signal arrived for an assembler that has already finalized.
/// Always surfaced: it points at an upstream or transport bug.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("protocol violation: `{signal}` received after stream reached {state}")]
pub struct ProtocolViolation {
    pub signal: &'static str,
    pub state: &'static str,
}

/// Failure opening or reading an element source.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("source rejected request with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("stream interrupted: {0}")]
    Interrupted(String),
    #[error("io error: {0}")]
    Io(String),
}

impl SourceError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Status { .. } => "status",
            Self::Interrupted(_) => "interrupted",
            Self::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_messages() {
        let err = MalformedElement::missing("citation", "reference_id");
        assert_eq!(
            err.to_string(),
            "citation element missing required field `reference_id`"
        );
        let err = MalformedElement::CitationSourceCount {
            reference_id: "c1".into(),
            count: 2,
        };
        assert!(err.to_string().contains("2 source variants"));
    }

    #[test]
    fn protocol_violation_message() {
        let v = ProtocolViolation {
            signal: "done",
            state: "closed(success)",
        };
        assert_eq!(
            v.to_string(),
            "protocol violation: `done` received after stream reached closed(success)"
        );
    }

    #[test]
    fn source_error_kinds() {
        assert_eq!(SourceError::Connect("refused".into()).error_kind(), "connect");
        assert_eq!(
            SourceError::Status { status: 502, body: String::new() }.error_kind(),
            "status"
        );
        assert_eq!(SourceError::Interrupted("eof".into()).error_kind(), "interrupted");
    }
}
