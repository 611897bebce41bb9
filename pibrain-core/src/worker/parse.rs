//! JSON extraction from analyzer stdout.
//!
//! Three strategies in order: raw parse, fenced-code-block extraction, and a
//! bracket-balanced scan for the first syntactically valid JSON object.
//! Generalizes the teacher's naive `find('{')`/`rfind('}')` extraction, which
//! breaks on any trailing prose after the JSON object.

use crate::error::{ClassifiedError, Reason};
use serde_json::Value;

/// Extracts the analyzer's single JSON object from raw stdout text.
pub fn extract_json_object(raw: &str) -> Result<Value, ClassifiedError> {
    if let Ok(value) = serde_json::from_str::<Value>(raw.trim()) {
        if value.is_object() {
            return Ok(value);
        }
    }

    if let Some(fenced) = extract_fenced_block(raw) {
        if let Ok(value) = serde_json::from_str::<Value>(&fenced) {
            if value.is_object() {
                return Ok(value);
            }
        }
    }

    if let Some(candidate) = bracket_balanced_scan(raw) {
        if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
            if value.is_object() {
                return Ok(value);
            }
        }
    }

    Err(ClassifiedError::permanent(
        Reason::VALIDATION,
        "analyzer output did not contain a parseable JSON object",
    ))
}

fn extract_fenced_block(raw: &str) -> Option<String> {
    let start_marker = raw.find("```")?;
    let after_marker = &raw[start_marker + 3..];
    let after_lang = after_marker.find('\n').map(|i| &after_marker[i + 1..]).unwrap_or(after_marker);
    let end = after_lang.find("```")?;
    Some(after_lang[..end].trim().to_string())
}

/// Scans for the first syntactically valid JSON object: tracks brace depth
/// while respecting string literals and escapes, so braces inside quoted
/// strings don't throw off the balance.
fn bracket_balanced_scan(raw: &str) -> Option<String> {
    let bytes: Vec<char> = raw.chars().collect();
    let start = bytes.iter().position(|&c| c == '{')?;

    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &c) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset;
                    return Some(bytes[start..=end].iter().collect());
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

    #[test]
    fn parses_raw_json() {
        let raw = r#"{"summary":"did X","type":"coding"}"#;
        let value = extract_json_object(raw).unwrap();
        assert_eq!(value["summary"], "did X");
    }

    #[test]
    fn parses_fenced_json() {
        let raw = "here is the result:\n```json\n{\"summary\":\"ok\"}\n```\nthanks";
        let value = extract_json_object(raw).unwrap();
        assert_eq!(value["summary"], "ok");
    }

    #[test]
    fn bracket_scan_ignores_braces_inside_strings() {
        let raw = r#"preamble text {"summary": "contains a { brace } inline", "type": "coding"} trailing prose"#;
        let value = extract_json_object(raw).unwrap();
        assert_eq!(value["type"], "coding");
    }

    #[test]
    fn rejects_non_json_text() {
        let err = extract_json_object("not json at all").unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::Permanent);
    }
}
