//! Transcript data types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What a transcript entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    UserMessage,
    AssistantMessage,
    ToolCall,
    ToolResult,
    StepStart,
    StepFinish,
    Error,
    GraderResult,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntryKind::UserMessage => "user_message",
            EntryKind::AssistantMessage => "assistant_message",
            EntryKind::ToolCall => "tool_call",
            EntryKind::ToolResult => "tool_result",
            EntryKind::StepStart => "step_start",
            EntryKind::StepFinish => "step_finish",
            EntryKind::Error => "error",
            EntryKind::GraderResult => "grader_result",
        };
        write!(f, "{}", name)
    }
}

/// One timestamped event of a trial.
///
/// The payload shape depends on the kind:
/// - messages: `{"content": ...}`
/// - tool calls: `{"id", "name", "input"}`
/// - tool results: `{"id", "name", "output", "is_error"}`
/// - errors: `{"message", "stage"}`
/// - grader results: the serialized grader result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// Milliseconds since the trial started.
    pub elapsed_ms: u64,
    pub kind: EntryKind,
    pub payload: serde_json::Value,
}

impl TranscriptEntry {
    /// Returns the `content` field of a message payload.
    pub fn content(&self) -> Option<&str> {
        self.payload.get("content").and_then(|v| v.as_str())
    }
}

/// Counts per kind over a transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptSummary {
    pub total: usize,
    pub by_kind: BTreeMap<EntryKind, usize>,
    pub elapsed_ms: u64,
}

impl TranscriptSummary {
    pub fn count(&self, kind: EntryKind) -> usize {
        self.by_kind.get(&kind).copied().unwrap_or(0)
    }
}
