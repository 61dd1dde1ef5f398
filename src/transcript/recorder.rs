//! Append-only recorder for one trial's events.

use std::time::Instant;

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::grader::GraderResult;
use crate::runner::agents::AgentEvent;

use super::types::{EntryKind, TranscriptEntry, TranscriptSummary};

/// Records the events of one trial in order.
///
/// Entries can only be appended. Callers get owned snapshots, so nothing
/// outside the recorder can rewrite history.
pub struct TranscriptRecorder {
    started: Instant,
    entries: Vec<TranscriptEntry>,
}

impl TranscriptRecorder {
    /// Starts a recorder; elapsed times are measured from now.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            entries: Vec::new(),
        }
    }

    fn push(&mut self, kind: EntryKind, payload: serde_json::Value) {
        self.entries.push(TranscriptEntry {
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            kind,
            payload,
        });
    }

    pub fn record_user(&mut self, content: &str) {
        self.push(EntryKind::UserMessage, json!({ "content": content }));
    }

    pub fn record_assistant(&mut self, content: &str) {
        self.push(EntryKind::AssistantMessage, json!({ "content": content }));
    }

    pub fn record_tool_call(&mut self, id: Option<&str>, name: &str, input: &serde_json::Value) {
        self.push(
            EntryKind::ToolCall,
            json!({ "id": id, "name": name, "input": input }),
        );
    }

    pub fn record_tool_result(
        &mut self,
        id: Option<&str>,
        name: Option<&str>,
        output: &serde_json::Value,
        is_error: bool,
    ) {
        self.push(
            EntryKind::ToolResult,
            json!({ "id": id, "name": name, "output": output, "is_error": is_error }),
        );
    }

    pub fn record_step_start(&mut self, step: Option<u32>) {
        self.push(EntryKind::StepStart, json!({ "step": step }));
    }

    pub fn record_step_finish(&mut self, reason: Option<&str>) {
        self.push(EntryKind::StepFinish, json!({ "reason": reason }));
    }

    /// Records a fault; `stage` names where it happened (`setup`, `turn 2`, ...).
    pub fn record_error(&mut self, stage: &str, message: &str) {
        self.push(
            EntryKind::Error,
            json!({ "stage": stage, "message": message }),
        );
    }

    pub fn record_grader_result(&mut self, result: &GraderResult) {
        let payload = serde_json::to_value(result)
            .unwrap_or_else(|e| json!({ "type": result.grader_type, "serialization_error": e.to_string() }));
        self.push(EntryKind::GraderResult, payload);
    }

    /// Records an agent event under the matching entry kind.
    ///
    /// Text events are not recorded individually; the runner records the
    /// joined assistant message once the reply is complete.
    pub fn record_agent_event(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::StepStart { step } => self.record_step_start(*step),
            AgentEvent::Text { .. } => {}
            AgentEvent::ToolCall { id, name, input } => {
                self.record_tool_call(id.as_deref(), name, input)
            }
            AgentEvent::ToolResult {
                id,
                name,
                output,
                is_error,
            } => self.record_tool_result(id.as_deref(), name.as_deref(), output, *is_error),
            AgentEvent::StepFinish { reason } => self.record_step_finish(reason.as_deref()),
            AgentEvent::Error { message } => self.record_error("agent", message),
        }
    }

    /// Owned copy of every entry so far.
    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn summary(&self) -> TranscriptSummary {
        summarize(&self.entries, self.started.elapsed().as_millis() as u64)
    }

    /// SHA-256 of the serialized entries, hex encoded.
    pub fn digest(&self) -> String {
        digest_entries(&self.entries)
    }

    /// Consumes the recorder, returning the entries.
    pub fn into_entries(self) -> Vec<TranscriptEntry> {
        self.entries
    }
}

impl Default for TranscriptRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a summary over a finished transcript.
pub fn summarize(entries: &[TranscriptEntry], elapsed_ms: u64) -> TranscriptSummary {
    let mut summary = TranscriptSummary {
        total: entries.len(),
        elapsed_ms,
        ..Default::default()
    };
    for entry in entries {
        *summary.by_kind.entry(entry.kind).or_insert(0) += 1;
    }
    summary
}

/// SHA-256 over the JSON serialization of `entries`, hex encoded.
pub fn digest_entries(entries: &[TranscriptEntry]) -> String {
    let bytes = serde_json::to_vec(entries).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_are_ordered_and_timestamped() {
        let mut recorder = TranscriptRecorder::new();
        recorder.record_user("add a /health route");
        recorder.record_tool_call(Some("c1"), "write_file", &json!({"path": "server.js"}));
        recorder.record_assistant("done");

        let entries = recorder.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, EntryKind::UserMessage);
        assert_eq!(entries[0].content(), Some("add a /health route"));
        assert_eq!(entries[1].payload["name"], "write_file");
        assert!(entries.windows(2).all(|w| w[0].elapsed_ms <= w[1].elapsed_ms));
    }

    #[test]
    fn test_snapshots_do_not_affect_recorder() {
        let mut recorder = TranscriptRecorder::new();
        recorder.record_user("one");
        let mut snapshot = recorder.entries();
        snapshot.clear();
        recorder.record_user("two");

        let entries = recorder.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].content(), Some("one"));
    }

    #[test]
    fn test_agent_events_map_to_kinds() {
        let mut recorder = TranscriptRecorder::new();
        recorder.record_agent_event(&AgentEvent::StepStart { step: Some(1) });
        recorder.record_agent_event(&AgentEvent::Text {
            text: "thinking".into(),
        });
        recorder.record_agent_event(&AgentEvent::ToolCall {
            id: None,
            name: "bash".into(),
            input: json!({"cmd": "ls"}),
        });
        recorder.record_agent_event(&AgentEvent::Error {
            message: "rate limited".into(),
        });

        let summary = recorder.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.count(EntryKind::StepStart), 1);
        assert_eq!(summary.count(EntryKind::ToolCall), 1);
        assert_eq!(summary.count(EntryKind::Error), 1);
        assert_eq!(summary.count(EntryKind::AssistantMessage), 0);
    }

    #[test]
    fn test_digest_changes_with_content() {
        let mut recorder = TranscriptRecorder::new();
        recorder.record_user("a");
        let first = recorder.digest();
        assert_eq!(first.len(), 64);
        assert_eq!(first, digest_entries(&recorder.entries()));

        recorder.record_user("b");
        assert_ne!(first, recorder.digest());
    }
}
