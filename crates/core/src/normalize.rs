use crate::models::CanonicalLabel;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

pub const MAX_LABEL_CHARS: usize = 64;

const NAME_KEYS: [&str; 4] = ["document_name", "documentName", "name", "label"];

/// How a classifier answer was shaped before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawLabel {
    Raw(String),
    Json(Value),
    Fenced(Box<RawLabel>),
}

fn fence_regex() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)^```(?:[A-Za-z0-9_-]*[ \t]*\n)?(.*?)\n?[ \t]*```$").ok())
        .as_ref()
}

pub fn parse_answer(answer: &str) -> RawLabel {
    let trimmed = answer.trim();

    if let Some(captures) = fence_regex().and_then(|fence| fence.captures(trimmed)) {
        let inner = captures.get(1).map_or("", |m| m.as_str());
        return RawLabel::Fenced(Box::new(parse_unfenced(inner)));
    }

    // Unterminated fence: the model stopped before the closing marker.
    if let Some(rest) = trimmed.strip_prefix("```") {
        let inner = rest
            .split_once('\n')
            .map_or("", |(_, body)| body)
            .trim_end_matches('`');
        return RawLabel::Fenced(Box::new(parse_unfenced(inner)));
    }

    parse_unfenced(trimmed)
}

fn parse_unfenced(text: &str) -> RawLabel {
    let text = text.trim();
    match serde_json::from_str::<Value>(text) {
        Ok(value @ (Value::Object(_) | Value::Array(_) | Value::String(_))) => RawLabel::Json(value),
        _ => RawLabel::Raw(text.to_string()),
    }
}

fn candidate_text(parsed: &RawLabel) -> Option<String> {
    match parsed {
        RawLabel::Raw(text) => text.split_whitespace().next().map(str::to_string),
        RawLabel::Json(value) => json_candidate(value),
        RawLabel::Fenced(inner) => candidate_text(inner),
    }
}

fn json_candidate(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Array(items) => items.iter().find_map(json_candidate),
        Value::Object(map) => NAME_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(json_candidate))
            .or_else(|| {
                map.iter()
                    .filter(|(key, _)| key.to_lowercase().contains("name"))
                    .find_map(|(_, value)| json_candidate(value))
            })
            .or_else(|| map.values().find_map(json_candidate)),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(_) | Value::Null => None,
    }
}

fn canonicalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|ch| ch.is_alphanumeric())
        .take(MAX_LABEL_CHARS)
        .collect()
}

/// `None` when nothing alphanumeric survives.
pub fn normalize_label(answer: &str) -> Option<CanonicalLabel> {
    let candidate = candidate_text(&parse_answer(answer))?;
    let label = canonicalize(&candidate);
    if label.is_empty() {
        None
    } else {
        Some(CanonicalLabel(label))
    }
}
