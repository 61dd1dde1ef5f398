//! Shared utility functions for trialforge.
//!
//! Small helpers used across modules: crash-safe writes, JSON extraction
//! from judge responses, and output truncation.

pub mod fs_atomic;
pub mod json_extraction;

pub use fs_atomic::atomic_write_file;
pub use json_extraction::{extract_json_object, find_matching_brace};

/// Truncates a string to at most `max` bytes on a char boundary.
pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}... [truncated]", &s[..end])
    }
}

/// Keeps the last `max` bytes of a string on a char boundary.
///
/// Process output is most useful at its tail, where the failure usually is.
pub fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut start = s.len() - max;
        while !s.is_char_boundary(start) && start < s.len() {
            start += 1;
        }
        format!("[truncated] ...{}", &s[start..])
    }
}

/// Makes an identifier safe for use as a file or directory name.
pub fn sanitize_file_component(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
