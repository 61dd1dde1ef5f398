//! JSON extraction from free-form model responses.
//!
//! Rubric judges answer with prose, fenced code blocks, or bare JSON. The
//! helpers here pull the first parseable JSON object out of such a response,
//! trying in order:
//! 1. A ```json fenced block
//! 2. Any fenced block containing an object
//! 3. The first balanced `{...}` anywhere in the content

use regex::Regex;

/// Extracts the first JSON object from `content` that parses successfully.
pub fn extract_json_object(content: &str) -> Option<serde_json::Value> {
    let trimmed = content.trim();

    if let Some(json) = extract_from_json_code_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&json) {
            return Some(value);
        }
    }

    if let Some(json) = extract_from_generic_code_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&json) {
            return Some(value);
        }
    }

    let mut offset = 0;
    while let Some(start) = trimmed[offset..].find('{') {
        let start = offset + start;
        if let Some(end) = find_matching_brace(&trimmed[start..]) {
            let candidate = &trimmed[start..=start + end];
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate) {
                return Some(value);
            }
        }
        offset = start + 1;
    }

    None
}

/// Returns the content of a ```json fenced block, trimmed to its object.
pub fn extract_from_json_code_block(content: &str) -> Option<String> {
    let re = Regex::new(r"```json\s*\n?([\s\S]*?)\n?```").ok()?;
    let caps = re.captures(content)?;
    let json_content = caps.get(1)?.as_str().trim();
    if !json_content.starts_with('{') {
        return None;
    }
    match find_matching_brace(json_content) {
        Some(end) => Some(json_content[..=end].to_string()),
        None => Some(json_content.to_string()),
    }
}

/// Returns the first object found inside any fenced code block.
pub fn extract_from_generic_code_block(content: &str) -> Option<String> {
    let re = Regex::new(r"```(?:\w+)?\s*\n?([\s\S]*?)\n?```").ok()?;
    let caps = re.captures(content)?;
    let block_content = caps.get(1)?.as_str().trim();
    let start = block_content.find('{')?;
    let end = find_matching_brace(&block_content[start..])?;
    Some(block_content[start..=start + end].to_string())
}

/// Finds the byte index of the brace closing the object that starts at
/// index 0, honoring string literals and escapes.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
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
    fn test_extract_bare_object() {
        let value = extract_json_object(r#"{"score": 8, "reasoning": "ok"}"#).unwrap();
        assert_eq!(value["score"], 8);
    }

    #[test]
    fn test_extract_from_fenced_block() {
        let response = "Here is my verdict:\n```json\n{\"score\": 0.9}\n```\nThanks.";
        let value = extract_json_object(response).unwrap();
        assert_eq!(value["score"], 0.9);
    }

    #[test]
    fn test_extract_skips_unparseable_prefix() {
        let response = "Consider {not json} then {\"score\": 3}";
        let value = extract_json_object(response).unwrap();
        assert_eq!(value["score"], 3);
    }

    #[test]
    fn test_braces_inside_strings_are_ignored() {
        let s = r#"{"a": "}{", "b": 1} trailing"#;
        let end = find_matching_brace(s).unwrap();
        assert_eq!(&s[..=end], r#"{"a": "}{", "b": 1}"#);
    }

    #[test]
    fn test_no_json_returns_none() {
        assert!(extract_json_object("no structured answer here").is_none());
    }
}
