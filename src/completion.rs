//! Structured-output parsing at the boundary with the completion provider.
//!
//! Models asked for a single JSON object sometimes wrap it in prose, add a
//! trailing brace, or get cut off mid-object. [`parse_structured`] makes a
//! best-effort attempt to recover the object before giving up:
//!
//! 1. parse the trimmed payload as-is
//! 2. extract the first balanced `{...}` (string-aware)
//! 3. truncate at the last `}` and parse that prefix
//!
//! Callers decide the fallback value; this module only reports failure.

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::gateway::{ChatGateway, ChatRequest, ProviderError};

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("empty completion")]
    Empty,

    #[error("malformed structured output: {message}")]
    Malformed { message: String },
}

/// Send `req` and parse the completion into `T`.
pub async fn complete_structured<T: DeserializeOwned>(
    gateway: &dyn ChatGateway,
    req: ChatRequest,
) -> Result<T, CompletionError> {
    let resp = gateway.chat(req).await?;
    parse_structured(&resp.content)
}

/// Best-effort parse of a JSON object out of a model completion.
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T, CompletionError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CompletionError::Empty);
    }

    let first_err = match serde_json::from_str::<T>(trimmed) {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };

    if let Some(candidate) = extract_json(trimmed) {
        if let Ok(v) = serde_json::from_str::<T>(candidate) {
            return Ok(v);
        }
    }

    if let Some(candidate) = truncate_to_last_brace(trimmed) {
        if let Ok(v) = serde_json::from_str::<T>(candidate) {
            return Ok(v);
        }
    }

    Err(CompletionError::Malformed {
        message: first_err.to_string(),
    })
}

/// First balanced `{...}` in `raw`, ignoring braces inside JSON strings.
pub fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let remainder = &raw[start..];
    find_matching_brace(remainder).map(|end| &remainder[..end])
}

fn truncate_to_last_brace(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Byte offset just past the brace closing the object that opens `s`.
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Points {
        knowledge_points: Vec<String>,
    }

    #[test]
    fn parses_clean_json() {
        let p: Points = parse_structured(r#"{"knowledge_points": ["DNS"]}"#).unwrap();
        assert_eq!(p.knowledge_points, vec!["DNS"]);
    }

    #[test]
    fn recovers_from_surrounding_prose() {
        let raw = "Sure! Here you go:\n{\"knowledge_points\": [\"TCP\", \"UDP\"]}\nHope that helps.";
        let p: Points = parse_structured(raw).unwrap();
        assert_eq!(p.knowledge_points, vec!["TCP", "UDP"]);
    }

    #[test]
    fn recovers_from_trailing_brace() {
        let p: Points = parse_structured(r#"{"knowledge_points": ["IP"]}}"#).unwrap();
        assert_eq!(p.knowledge_points, vec!["IP"]);
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_extraction() {
        let raw = r#"note {"knowledge_points": ["a}b"]} tail"#;
        let p: Points = parse_structured(raw).unwrap();
        assert_eq!(p.knowledge_points, vec!["a}b"]);
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let err = parse_structured::<Points>(r#"{"knowledge_points": ["DNS""#).unwrap_err();
        assert!(matches!(err, CompletionError::Malformed { .. }));
    }

    #[test]
    fn blank_payload_is_empty() {
        assert!(matches!(
            parse_structured::<Points>("   \n"),
            Err(CompletionError::Empty)
        ));
    }
}
