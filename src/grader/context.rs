//! Conversational-context grader: what the assistant said.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    compile_patterns, mismatch, Grader, GraderConfig, GraderError, GraderKind, GraderResult,
    GradingContext,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Case-insensitive patterns some assistant message must match.
    #[serde(default)]
    pub must_mention: Vec<String>,
    /// Case-insensitive patterns no assistant message may match.
    #[serde(default)]
    pub must_not_mention: Vec<String>,
    /// Restrict to the assistant reply of this turn (0-based).
    #[serde(default)]
    pub turn: Option<usize>,
}

impl ContextConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.must_mention.is_empty() && self.must_not_mention.is_empty() {
            return Err("context grader needs must_mention or must_not_mention".to_string());
        }
        compile_patterns(&self.must_mention)?;
        compile_patterns(&self.must_not_mention)?;
        Ok(())
    }
}

pub struct ContextGrader;

#[async_trait]
impl Grader for ContextGrader {
    fn kind(&self) -> GraderKind {
        GraderKind::Context
    }

    async fn grade(
        &self,
        config: &GraderConfig,
        ctx: &GradingContext<'_>,
    ) -> Result<GraderResult, GraderError> {
        let GraderConfig::Context(cfg) = config else {
            return Err(mismatch(self.kind(), config));
        };
        cfg.validate().map_err(GraderError::InvalidConfig)?;
        let required = compile_patterns(&cfg.must_mention).map_err(GraderError::InvalidConfig)?;
        let forbidden =
            compile_patterns(&cfg.must_not_mention).map_err(GraderError::InvalidConfig)?;

        let mut messages = ctx.assistant_messages();
        if let Some(turn) = cfg.turn {
            messages = messages.get(turn).map(|m| vec![*m]).unwrap_or_default();
        }
        if messages.is_empty() {
            return Ok(GraderResult::fail(self.kind(), "no assistant messages to inspect"));
        }

        let mut missing = Vec::new();
        let mut violations = Vec::new();
        for (re, pattern) in required.iter().zip(&cfg.must_mention) {
            if !messages.iter().any(|m| re.is_match(m)) {
                missing.push(pattern.clone());
            }
        }
        for (re, pattern) in forbidden.iter().zip(&cfg.must_not_mention) {
            if messages.iter().any(|m| re.is_match(m)) {
                violations.push(pattern.clone());
            }
        }

        let total = required.len() + forbidden.len();
        let satisfied = total - missing.len() - violations.len();
        Ok(GraderResult::ratio(self.kind(), satisfied, total)
            .with_detail("messages", messages.len())
            .with_detail("missing", missing)
            .with_detail("violations", violations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grader::testing;
    use crate::transcript::TranscriptRecorder;
    use crate::workspace::PortPair;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_mentions_and_violations() {
        let mut recorder = TranscriptRecorder::new();
        recorder.record_user("Where are events stored?");
        recorder.record_assistant("Events are written to data/EVENTS.json by the API.");
        recorder.record_user("Anything else?");
        recorder.record_assistant("I also added a TODO for retries.");

        let temp = TempDir::new().unwrap();
        let ws = testing::workspace(temp.path(), PortPair { service: 1, dev: 2 });
        let config = GraderConfig::Context(ContextConfig {
            must_mention: vec!["events\\.json".into(), "sqlite".into()],
            must_not_mention: vec!["todo".into()],
            turn: None,
        });

        let result = testing::grade(&ContextGrader, &config, &ws, &recorder.entries())
            .await
            .unwrap();
        assert!(!result.passed);
        assert!((result.score - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(result.details["missing"], serde_json::json!(["sqlite"]));
        assert_eq!(result.details["violations"], serde_json::json!(["todo"]));
    }

    #[tokio::test]
    async fn test_turn_restriction() {
        let mut recorder = TranscriptRecorder::new();
        recorder.record_assistant("first: port 4100");
        recorder.record_assistant("second: nothing");

        let temp = TempDir::new().unwrap();
        let ws = testing::workspace(temp.path(), PortPair { service: 1, dev: 2 });
        let config = GraderConfig::Context(ContextConfig {
            must_mention: vec!["4100".into()],
            must_not_mention: Vec::new(),
            turn: Some(1),
        });

        let result = testing::grade(&ContextGrader, &config, &ws, &recorder.entries())
            .await
            .unwrap();
        assert!(!result.passed);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let cfg = ContextConfig {
            must_mention: vec!["(unclosed".into()],
            must_not_mention: Vec::new(),
            turn: None,
        };
        assert!(cfg.validate().is_err());
    }
}
