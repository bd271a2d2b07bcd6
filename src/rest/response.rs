//! Turning HTTP response bodies into records.
//!
//! APIs wrap their payloads in many ways. A top-level array is the record
//! list; an object is searched for the usual envelope keys, otherwise it is a
//! single record. Non-JSON bodies become one string record.

use serde_json::{Map, Value as JsonValue};

/// Envelope keys searched, in order, for the record list.
const ENVELOPE_KEYS: [&str; 4] = ["results", "items", "data", "content"];

/// Keys whose integer value is the total number of records on the server.
const TOTAL_KEYS: [&str; 4] = ["total", "count", "total_items", "totalCount"];

/// Pagination fields copied into result metadata.
const PAGINATION_KEYS: [&str; 11] = [
    "page",
    "page_size",
    "pages",
    "next",
    "previous",
    "has_next",
    "has_previous",
    "total",
    "count",
    "total_items",
    "totalCount",
];

/// Records and paging details extracted from one response body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedBody {
    pub records: Vec<JsonValue>,
    pub total_count: Option<u64>,
    pub pagination: Map<String, JsonValue>,
}

pub fn parse_body(content_type: Option<&str>, body: &[u8]) -> ParsedBody {
    if body.iter().all(u8::is_ascii_whitespace) {
        return ParsedBody::default();
    }

    let declared_json = content_type
        .map(|ct| ct.to_ascii_lowercase().contains("json"))
        .unwrap_or(false);
    match serde_json::from_slice::<JsonValue>(body) {
        Ok(value) if declared_json || content_type.is_none() => parse_json(value),
        _ => ParsedBody {
            records: vec![JsonValue::String(String::from_utf8_lossy(body).into_owned())],
            ..ParsedBody::default()
        },
    }
}

fn parse_json(value: JsonValue) -> ParsedBody {
    match value {
        JsonValue::Array(records) => ParsedBody {
            records,
            ..ParsedBody::default()
        },
        JsonValue::Object(object) => {
            let total_count = TOTAL_KEYS
                .iter()
                .find_map(|key| object.get(*key).and_then(as_count));
            let pagination = object
                .iter()
                .filter(|(k, _)| PAGINATION_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let records = extract_records(object);
            ParsedBody {
                records,
                total_count,
                pagination,
            }
        }
        JsonValue::Null => ParsedBody::default(),
        scalar => ParsedBody {
            records: vec![scalar],
            ..ParsedBody::default()
        },
    }
}

fn extract_records(mut object: Map<String, JsonValue>) -> Vec<JsonValue> {
    for key in ENVELOPE_KEYS {
        if matches!(object.get(key), Some(JsonValue::Array(_))) {
            if let Some(JsonValue::Array(records)) = object.remove(key) {
                return records;
            }
        }
    }
    vec![JsonValue::Object(object)]
}

/// Totals sometimes arrive as strings.
fn as_count(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// First `max` characters of a body, for error messages.
pub fn snippet(body: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const JSON: Option<&str> = Some("application/json; charset=utf-8");

    #[test]
    fn test_top_level_array() {
        let parsed = parse_body(JSON, br#"[{"id": 1}, {"id": 2}]"#);
        assert_eq!(parsed.records, vec![json!({"id": 1}), json!({"id": 2})]);
        assert_eq!(parsed.total_count, None);
    }

    #[test]
    fn test_envelope_with_pagination() {
        let body = br#"{"results": [{"id": 1}], "count": 42, "next": "/users?page=2", "page": 1, "extra": true}"#;
        let parsed = parse_body(JSON, body);
        assert_eq!(parsed.records, vec![json!({"id": 1})]);
        assert_eq!(parsed.total_count, Some(42));
        assert_eq!(parsed.pagination["next"], "/users?page=2");
        assert_eq!(parsed.pagination["page"], 1);
        assert!(!parsed.pagination.contains_key("extra"));
    }

    #[test]
    fn test_envelope_key_order() {
        let parsed = parse_body(JSON, br#"{"data": [1], "items": [2]}"#);
        assert_eq!(parsed.records, vec![json!(2)]);
    }

    #[test]
    fn test_single_object_is_wrapped() {
        let parsed = parse_body(JSON, br#"{"id": 7, "data": "not a list"}"#);
        assert_eq!(parsed.records, vec![json!({"id": 7, "data": "not a list"})]);
    }

    #[test]
    fn test_non_json_body() {
        let parsed = parse_body(Some("text/plain"), b"pong");
        assert_eq!(parsed.records, vec![json!("pong")]);

        let parsed = parse_body(Some("application/json"), b"<html>oops</html>");
        assert_eq!(parsed.records, vec![json!("<html>oops</html>")]);
    }

    #[test]
    fn test_empty_body() {
        assert!(parse_body(JSON, b"").records.is_empty());
        assert!(parse_body(None, b"  \n").records.is_empty());
    }

    #[test]
    fn test_total_as_string() {
        let parsed = parse_body(JSON, br#"{"items": [], "totalCount": "12"}"#);
        assert_eq!(parsed.total_count, Some(12));
        assert!(parsed.records.is_empty());
    }

    #[test]
    fn test_snippet() {
        assert_eq!(snippet(b"  short  ", 10), "short");
        assert_eq!(snippet(b"abcdefghij", 4), "abcd...");
    }
}
