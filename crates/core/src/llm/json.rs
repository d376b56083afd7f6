//! Locating JSON objects inside free-form LLM output.
//!
//! Models frequently wrap the requested object in prose or code fences, so
//! every stage decodes the first balanced `{...}` substring of the response.

use crate::errors::{AppError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};

/// Return the first balanced brace-delimited object in `text`.
///
/// Braces inside JSON string literals (including escaped quotes) do not
/// count toward nesting. An opening brace that never closes is skipped and
/// the scan resumes at the next one.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut search_from = 0;

    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for (i, &b) in bytes.iter().enumerate().skip(start) {
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
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(&text[start..=i]);
                    }
                }
                _ => {}
            }
        }

        search_from = start + 1;
    }

    None
}

/// Extract and decode the first JSON object in an LLM response
pub fn decode_json_object<T: DeserializeOwned>(text: &str) -> Result<T> {
    let object = extract_json_object(text).ok_or_else(|| AppError::MalformedResponse {
        message: "no JSON object found in response".to_string(),
    })?;

    serde_json::from_str(object).map_err(|e| AppError::MalformedResponse {
        message: format!("undecodable JSON object: {}", e),
    })
}

/// Field decoder that reads an explicit `null` as the type's default.
///
/// `#[serde(default)]` only covers absent keys; models often send `null` instead.
pub fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
