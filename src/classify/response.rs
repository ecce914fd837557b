use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::classify::keywords::MAX_SNIPPET_BYTES;
use crate::model::{Category, Extraction, PolicySummary, RiskLevel, SummaryItem};
use crate::utils::truncate_bytes;

/// Field the summarizer service wraps the model output in.
const NESTED_FIELD: &str = "response";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no JSON payload in summarizer response")]
    NoPayload,
    #[error("summarizer payload is not a JSON object")]
    NotAnObject,
    #[error("no valid category entries ({skipped} skipped)")]
    NoValidEntries { skipped: usize },
}

/// Unwrap a summarizer response into a [`PolicySummary`].
///
/// Stages, each tolerant of the previous one finding nothing:
/// 1. drop markdown code fences;
/// 2. parse the outer JSON; if a string field (`response` first) embeds an
///    object, that object is the payload, else the outer object is;
/// 3. read one entry per category key. Entries with an unknown category,
///    a missing or empty field, or an unknown risk level are skipped.
///
/// Fails only when no entry survives.
pub fn parse(raw: &str) -> Result<PolicySummary, ParseError> {
    let cleaned = strip_fences(raw);
    let payload = unwrap_payload(&cleaned)?;
    let Value::Object(entries) = payload else {
        return Err(ParseError::NotAnObject);
    };
    read_entries(&entries)
}

fn strip_fences(raw: &str) -> String {
    raw.replace("```json", "").replace("```", "").trim().to_string()
}

fn unwrap_payload(text: &str) -> Result<Value, ParseError> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(outer)) => match nested_payload(&outer) {
            Some(inner) => Ok(inner),
            None => Ok(Value::Object(outer)),
        },
        Ok(Value::String(inner)) => embedded_object(&inner).found().ok_or(ParseError::NoPayload),
        Ok(_) => Err(ParseError::NotAnObject),
        Err(e) => {
            debug!(error = %e, "Response is not plain JSON, scanning for an embedded object");
            embedded_object(text).found().ok_or(ParseError::NoPayload)
        }
    }
}

fn nested_payload(outer: &Map<String, Value>) -> Option<Value> {
    let preferred = outer.get(NESTED_FIELD).into_iter();
    let others = outer
        .iter()
        .filter(|(k, _)| k.as_str() != NESTED_FIELD)
        .map(|(_, v)| v);
    preferred
        .chain(others)
        .filter_map(Value::as_str)
        .find_map(|s| embedded_object(s).found())
}

/// Find a JSON object inside free text.
///
/// One string-aware pass pairs every `{` with its closing `}`; the balanced
/// spans are then tried in order of their opening brace and the first that
/// parses as an object wins. Braces quoted inside snippets therefore do not
/// truncate or over-extend the payload, and a stray `{` in surrounding prose
/// does not hide an object that follows it.
pub fn embedded_object(text: &str) -> Extraction<Value> {
    if !text.contains('{') {
        return Extraction::NotFound;
    }
    for (start, end) in balanced_spans(text) {
        if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(&text[start..=end]) {
            return Extraction::Found(v);
        }
    }
    Extraction::Malformed("no balanced JSON object".into())
}

/// Byte ranges `(open, close)` of every balanced brace pair, sorted by
/// `open`. Quotes only open a string literal inside a brace, so prose
/// between objects cannot flip the string state.
fn balanced_spans(text: &str) -> Vec<(usize, usize)> {
    let mut open: Vec<usize> = Vec::new();
    let mut spans = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, b) in text.bytes().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' if !open.is_empty() => in_string = true,
            b'{' => open.push(i),
            b'}' => {
                if let Some(start) = open.pop() {
                    spans.push((start, i));
                }
            }
            _ => {}
        }
    }
    spans.sort_unstable();
    spans
}

fn read_entries(entries: &Map<String, Value>) -> Result<PolicySummary, ParseError> {
    let mut summary = PolicySummary::new();
    let mut skipped = 0usize;

    for (key, value) in entries {
        let Some(category) = Category::from_label(key) else {
            debug!(key = %key, "Ignoring unknown category");
            skipped += 1;
            continue;
        };
        match read_item(value) {
            Some(item) if summary.get(category).is_none() => summary.insert(category, item),
            Some(_) => {
                debug!(category = %category, "Duplicate category entry ignored");
                skipped += 1;
            }
            None => {
                warn!(category = %category, "Invalid summary entry skipped");
                skipped += 1;
            }
        }
    }

    if summary.is_empty() {
        return Err(ParseError::NoValidEntries { skipped });
    }
    Ok(summary)
}

fn read_item(value: &Value) -> Option<SummaryItem> {
    let field = |name: &str| {
        value
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };
    Some(SummaryItem {
        risk_level: RiskLevel::parse(field("risk_level")?)?,
        justification: field("justification")?.to_string(),
        snippet: truncate_bytes(field("snippet")?, MAX_SNIPPET_BYTES),
    })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_string_with_fences() {
        let raw = r#"{"response": "prefix ```json {\"EmailAddress\":{\"risk_level\":\"Red\",\"justification\":\"j\",\"snippet\":\"s\"}} ``` suffix"}"#;
        let s = parse(raw).unwrap();
        assert_eq!(s.len(), 1);
        let item = s.get(Category::EmailAddress).unwrap();
        assert_eq!(item.risk_level, RiskLevel::Red);
        assert_eq!(item.justification, "j");
        assert_eq!(item.snippet, "s");
    }

    #[test]
    fn direct_object_with_labels() {
        let raw = r#"```json
        {
          "Email Address": {"risk_level": "Yellow", "justification": "Used for login.", "snippet": "We use your email."},
          "Location": {"risk_level": "green", "justification": "Not tracked.", "snippet": "We do not track location."}
        }
        ```"#;
        let s = parse(raw).unwrap();
        assert_eq!(s.len(), 2);
        assert_eq!(s.get(Category::Location).unwrap().risk_level, RiskLevel::Green);
    }

    #[test]
    fn invalid_entries_are_isolated() {
        let raw = r#"{
          "Email Address": {"risk_level": "Purple", "justification": "j", "snippet": "s"},
          "Location": {"risk_level": "Red", "justification": "", "snippet": "s"},
          "Data Aggregation": {"risk_level": "Red", "snippet": "s"},
          "Unknown Thing": {"risk_level": "Red", "justification": "j", "snippet": "s"},
          "Control of Data": {"risk_level": "Green", "justification": "j", "snippet": "s"}
        }"#;
        let s = parse(raw).unwrap();
        assert_eq!(s.len(), 1);
        assert!(s.get(Category::ControlOfData).is_some());
    }

    #[test]
    fn zero_entries_is_error() {
        let raw = r#"{"error": "rate limited"}"#;
        assert_eq!(parse(raw), Err(ParseError::NoValidEntries { skipped: 1 }));
    }

    #[test]
    fn garbage_is_no_payload() {
        assert_eq!(parse("Sorry, I cannot help with that."), Err(ParseError::NoPayload));
        assert_eq!(parse(""), Err(ParseError::NoPayload));
    }

    #[test]
    fn array_is_not_an_object() {
        assert_eq!(parse("[1, 2]"), Err(ParseError::NotAnObject));
    }

    #[test]
    fn braces_inside_snippet() {
        let inner = r#"Here you go: {"Location": {"risk_level": "Red", "justification": "Shared.", "snippet": "We share {gps} data."}} Let me know {if} needed."#;
        let raw = serde_json::json!({ "response": inner }).to_string();
        let s = parse(&raw).unwrap();
        assert_eq!(s.get(Category::Location).unwrap().snippet, "We share {gps} data.");
    }

    #[test]
    fn prose_around_bare_json() {
        let raw = r#"Analysis: {"Ads and Marketing": {"risk_level": "Yellow", "justification": "j", "snippet": "s"}} done"#;
        let s = parse(raw).unwrap();
        assert!(s.get(Category::AdsAndMarketing).is_some());
    }

    #[test]
    fn embedded_object_outcomes() {
        let text = r#"{"a": 1} }"#;
        assert_eq!(embedded_object(text), Extraction::Found(serde_json::json!({"a": 1})));
        assert_eq!(
            embedded_object("{note} then {\"b\": 2}"),
            Extraction::Found(serde_json::json!({"b": 2}))
        );
        assert_eq!(embedded_object("no braces"), Extraction::NotFound);
        assert!(matches!(embedded_object("{ broken"), Extraction::Malformed(_)));
    }

    #[test]
    fn balanced_scan_skips_escaped_quotes() {
        let text = r#"{"k": "a \" } b"} tail"#;
        let close = text.find(" tail").unwrap() - 1;
        assert_eq!(balanced_spans(text), vec![(0, close)]);
    }

    #[test]
    fn stray_open_brace_before_payload() {
        let raw = r#"Result {see below: {"Location": {"risk_level": "Red", "justification": "j", "snippet": "s"}}"#;
        let s = parse(raw).unwrap();
        assert_eq!(s.get(Category::Location).unwrap().risk_level, RiskLevel::Red);
    }

    #[test]
    fn many_unmatched_braces_stay_linear() {
        let text = "{".repeat(200_000);
        assert!(balanced_spans(&text).is_empty());
        assert!(matches!(embedded_object(&text), Extraction::Malformed(_)));
    }

    #[test]
    fn remote_snippet_is_bounded() {
        let long = "é".repeat(MAX_SNIPPET_BYTES);
        let raw = serde_json::json!({
            "Email Address": {"risk_level": "Red", "justification": "j", "snippet": long}
        })
        .to_string();
        let s = parse(&raw).unwrap();
        let snippet = &s.get(Category::EmailAddress).unwrap().snippet;
        assert_eq!(snippet.len(), MAX_SNIPPET_BYTES);
        assert!(snippet.chars().all(|c| c == 'é'));
    }
}
