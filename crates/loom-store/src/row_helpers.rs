use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Get an optional column value.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Deserialize a JSON text column, returning CorruptRow on parse failure.
pub fn parse_json<T: DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

pub fn parse_timestamp(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table,
            column,
            detail: format!("invalid timestamp {raw}: {e}"),
        })
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
pub fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::messages::AnswerStatus;

    #[test]
    fn parse_enum_success() {
        let status: AnswerStatus = parse_enum("cancelled", "messages", "status").unwrap();
        assert_eq!(status, AnswerStatus::Cancelled);
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<AnswerStatus, _> = parse_enum("INVALID", "messages", "status");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "messages", column: "status", .. })
        ));
    }

    #[test]
    fn parse_json_success() {
        let value: serde_json::Value = parse_json(r#"{"key": "value"}"#, "messages", "payload").unwrap();
        assert_eq!(value["key"], "value");
    }

    #[test]
    fn parse_json_failure() {
        let result: Result<serde_json::Value, _> = parse_json("not valid json", "messages", "payload");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "messages", column: "payload", .. })
        ));
    }

    #[test]
    fn timestamps_round_trip_and_sort() {
        let a = Utc::now();
        let b = a + chrono::Duration::milliseconds(1);
        let (sa, sb) = (format_timestamp(&a), format_timestamp(&b));
        assert_eq!(sa.len(), sb.len());
        assert!(sa < sb);
        let back = parse_timestamp(&sa, "threads", "created_at").unwrap();
        assert_eq!(back.timestamp_micros(), a.timestamp_micros());
        assert!(parse_timestamp("yesterday", "threads", "created_at").is_err());
    }
}
