//! Model reply normalization
//!
//! Strips fenced-code wrapping from the model's raw text and reads the JSON
//! object inside into an [`AnalysisResult`]. [`normalize`] is total: any
//! reply that is not a JSON object becomes [`fallback_result`].

use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::{AnalysisResult, Priority};

const FENCE: &str = "```";

const DEFAULT_SUMMARY: &str = "no summary";
const DEFAULT_CATEGORY: &str = "uncategorized";
const FALLBACK_SUMMARY: &str = "analysis failed";

/// Why a reply could not be read
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("reply is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("reply JSON is not an object")]
    NotAnObject,
}

/// Fixed safe-default result used whenever a reply cannot be read
pub fn fallback_result() -> AnalysisResult {
    AnalysisResult {
        summary: FALLBACK_SUMMARY.to_owned(),
        category: DEFAULT_CATEGORY.to_owned(),
        priority: Priority::Unknown,
        todos: Vec::new(),
    }
}

/// Read a model reply, falling back to [`fallback_result`] on any failure
pub fn normalize(raw: &str) -> AnalysisResult {
    try_normalize(raw).unwrap_or_else(|_| fallback_result())
}

/// Read a model reply, reporting why it could not be read
///
/// Missing fields take defaults: summary `"no summary"`, category
/// `"uncategorized"`, priority `Low`, todos empty. Unknown fields are ignored.
pub fn try_normalize(raw: &str) -> Result<AnalysisResult, NormalizeError> {
    let text = strip_code_fence(raw);
    let value: Value =
        serde_json::from_str(text).map_err(|e| NormalizeError::InvalidJson(e.to_string()))?;
    let Value::Object(fields) = value else {
        return Err(NormalizeError::NotAnObject);
    };

    Ok(AnalysisResult {
        summary: text_field(&fields, "summary").unwrap_or_else(|| DEFAULT_SUMMARY.to_owned()),
        category: text_field(&fields, "category").unwrap_or_else(|| DEFAULT_CATEGORY.to_owned()),
        priority: text_field(&fields, "priority")
            .map(|p| Priority::parse(&p))
            .unwrap_or(Priority::Low),
        todos: todo_items(fields.get("todos")),
    })
}

/// Remove a leading fence (with optional language tag) and a trailing fence
fn strip_code_fence(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix(FENCE) {
        let tag_len = rest
            .find(|ch: char| !(ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '+')))
            .unwrap_or(rest.len());
        text = &rest[tag_len..];
    }
    if let Some(rest) = text.trim_end().strip_suffix(FENCE) {
        text = rest;
    }
    text.trim()
}

/// String field, with scalars stringified; null and missing are `None`
fn text_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Action items from an array (or a lone string); blanks are dropped
fn todo_items(value: Option<&Value>) -> Vec<String> {
    let items: Vec<String> = match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    };
    items
        .into_iter()
        .filter(|item| !item.trim().is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{fallback_result, normalize, strip_code_fence, try_normalize};
    use crate::models::{AnalysisResult, Priority};

    /// The JSON text a well-behaved model would reply with
    fn to_reply_text(result: &AnalysisResult) -> String {
        serde_json::json!({
            "summary": result.summary,
            "category": result.category,
            "priority": result.priority.to_string(),
            "todos": result.todos,
        })
        .to_string()
    }

    #[test]
    fn strips_json_fence_and_parses_all_fields() {
        let raw = "```json\n{\"summary\":\"x\",\"category\":\"Work\",\"priority\":\"High\",\"todos\":[]}\n```";
        assert_eq!(
            normalize(raw),
            AnalysisResult {
                summary: "x".to_owned(),
                category: "Work".to_owned(),
                priority: Priority::High,
                todos: vec![],
            }
        );
    }

    #[test]
    fn not_json_yields_fixed_fallback() {
        let result = normalize("oops not json");
        assert_eq!(result, fallback_result());
        assert_eq!(result.priority, Priority::Unknown);
        assert_eq!(result.summary, "analysis failed");
        assert_eq!(result.category, "uncategorized");
        assert!(result.todos.is_empty());
    }

    #[test]
    fn non_object_json_is_rejected() {
        assert!(try_normalize("[1, 2, 3]").is_err());
        assert_eq!(normalize("\"just a string\""), fallback_result());
        assert_eq!(normalize(""), fallback_result());
    }

    #[test]
    fn missing_fields_take_documented_defaults() {
        let result = normalize("{\"extra\": true}");
        assert_eq!(result.summary, "no summary");
        assert_eq!(result.category, "uncategorized");
        assert_eq!(result.priority, Priority::Low);
        assert!(result.todos.is_empty());
    }

    #[test]
    fn lenient_about_field_shapes() {
        let result = normalize(
            "{\"summary\":\"s\",\"priority\":\"medium\",\"todos\":\"reply to Bob\",\"category\":null}",
        );
        assert_eq!(result.priority, Priority::Medium);
        assert_eq!(result.todos, vec!["reply to Bob".to_owned()]);
        assert_eq!(result.category, "uncategorized");

        let result = normalize("{\"todos\":[\"a\", \"\", null, 3]}");
        assert_eq!(result.todos, vec!["a".to_owned(), "3".to_owned()]);
    }

    #[test]
    fn fence_without_language_tag_or_newlines() {
        assert_eq!(strip_code_fence("```{\"a\":1}```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  ```JSON\n{}\n```  "), "{}");
        assert_eq!(strip_code_fence("{}"), "{}");
    }

    #[test]
    fn reply_text_round_trips() {
        let cases = [
            AnalysisResult {
                summary: "Quarterly report is due".to_owned(),
                category: "Work".to_owned(),
                priority: Priority::High,
                todos: vec!["Send report".to_owned(), "Book room".to_owned()],
            },
            AnalysisResult {
                summary: "Weekly digest".to_owned(),
                category: "Newsletter".to_owned(),
                priority: Priority::Low,
                todos: vec![],
            },
            fallback_result(),
        ];
        for case in cases {
            assert_eq!(normalize(&to_reply_text(&case)), case);
        }
    }
}
