//! Behavior and alert signal graders: the agent acted on a detection
//! document seeded into `.detections/`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    compile_patterns, mismatch, Grader, GraderConfig, GraderError, GraderKind, GraderResult,
    GradingContext,
};
use crate::workspace::{DetectionSignal, DETECTION_DIR_NAME};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Some tool call must reference the detection document.
    #[serde(default = "default_true")]
    pub must_read: bool,
    /// Case-insensitive patterns the assistant must mention.
    #[serde(default)]
    pub acknowledge: Vec<String>,
    /// Project-relative file the agent must produce.
    #[serde(default)]
    pub output_path: Option<String>,
    /// Substrings `output_path` must contain.
    #[serde(default)]
    pub output_contains: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl SignalConfig {
    pub fn validate(&self) -> Result<(), String> {
        compile_patterns(&self.acknowledge)?;
        if !self.output_contains.is_empty() && self.output_path.is_none() {
            return Err("output_contains requires output_path".to_string());
        }
        if !self.must_read && self.acknowledge.is_empty() && self.output_path.is_none() {
            return Err("signal grader checks nothing".to_string());
        }
        Ok(())
    }
}

pub struct SignalGrader {
    signal: DetectionSignal,
}

impl SignalGrader {
    /// Grades reactions to `behaviors.json`.
    pub fn behavior() -> Self {
        Self {
            signal: DetectionSignal::Behavior,
        }
    }

    /// Grades reactions to `errors.json`.
    pub fn alert() -> Self {
        Self {
            signal: DetectionSignal::Error,
        }
    }

    fn config<'c>(&self, config: &'c GraderConfig) -> Option<&'c SignalConfig> {
        match (self.signal, config) {
            (DetectionSignal::Behavior, GraderConfig::BehaviorSignal(c)) => Some(c),
            (DetectionSignal::Error, GraderConfig::AlertSignal(c)) => Some(c),
            _ => None,
        }
    }
}

#[async_trait]
impl Grader for SignalGrader {
    fn kind(&self) -> GraderKind {
        match self.signal {
            DetectionSignal::Behavior => GraderKind::BehaviorSignal,
            DetectionSignal::Error => GraderKind::AlertSignal,
        }
    }

    async fn grade(
        &self,
        config: &GraderConfig,
        ctx: &GradingContext<'_>,
    ) -> Result<GraderResult, GraderError> {
        let Some(cfg) = self.config(config) else {
            return Err(mismatch(self.kind(), config));
        };
        cfg.validate().map_err(GraderError::InvalidConfig)?;
        let patterns = compile_patterns(&cfg.acknowledge).map_err(GraderError::InvalidConfig)?;

        let mut total = 0usize;
        let mut satisfied = 0usize;
        let mut result_details = Vec::new();

        if cfg.must_read {
            total += 1;
            let file_name = self.signal.file_name();
            let read = ctx.tool_entries().any(|entry| {
                let payload = entry.payload.to_string();
                payload.contains(file_name) || payload.contains(DETECTION_DIR_NAME)
            });
            if read {
                satisfied += 1;
            }
            result_details.push(("read_document", serde_json::Value::Bool(read)));
        }

        let messages = ctx.assistant_messages();
        let mut unacknowledged = Vec::new();
        for (re, pattern) in patterns.iter().zip(&cfg.acknowledge) {
            total += 1;
            if messages.iter().any(|m| re.is_match(m)) {
                satisfied += 1;
            } else {
                unacknowledged.push(pattern.clone());
            }
        }

        if let Some(path) = &cfg.output_path {
            let content = tokio::fs::read_to_string(ctx.workspace.resolve(path)).await.ok();
            total += 1;
            if content.is_some() {
                satisfied += 1;
            }
            let mut missing = Vec::new();
            for needle in &cfg.output_contains {
                total += 1;
                if content.as_deref().is_some_and(|c| c.contains(needle.as_str())) {
                    satisfied += 1;
                } else {
                    missing.push(needle.clone());
                }
            }
            result_details.push(("output_exists", serde_json::Value::Bool(content.is_some())));
            result_details.push(("output_missing", serde_json::json!(missing)));
        }

        let mut result = GraderResult::ratio(self.kind(), satisfied, total)
            .with_detail("document", self.signal.file_name())
            .with_detail("unacknowledged", unacknowledged);
        for (key, value) in result_details {
            result = result.with_detail(key, value);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::TranscriptRecorder;
    use crate::grader::testing;
    use crate::workspace::PortPair;
    use tempfile::TempDir;

    fn alert_config() -> GraderConfig {
        GraderConfig::AlertSignal(SignalConfig {
            must_read: true,
            acknowledge: vec!["error rate".into(), "checkout".into()],
            output_path: Some("fix-notes.md".into()),
            output_contains: vec!["retry".into()],
        })
    }

    #[tokio::test]
    async fn test_alert_fully_handled() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("fix-notes.md"), "added retry with backoff").unwrap();
        let ws = testing::workspace(temp.path(), PortPair { service: 1, dev: 2 });

        let mut recorder = TranscriptRecorder::new();
        recorder.record_tool_call(
            Some("t1"),
            "read_file",
            &serde_json::json!({"path": ".detections/errors.json"}),
        );
        recorder.record_assistant("The Error Rate spiked on the checkout endpoint.");

        let result = testing::grade(&SignalGrader::alert(), &alert_config(), &ws, &recorder.entries())
            .await
            .unwrap();
        assert!(result.passed);
        assert_eq!(result.score, 1.0);
        assert_eq!(result.grader_type, "alert_signal");
    }

    #[tokio::test]
    async fn test_alert_ignored() {
        let temp = TempDir::new().unwrap();
        let ws = testing::workspace(temp.path(), PortPair { service: 1, dev: 2 });
        let mut recorder = TranscriptRecorder::new();
        recorder.record_assistant("All done, the checkout page works.");

        let result = testing::grade(&SignalGrader::alert(), &alert_config(), &ws, &recorder.entries())
            .await
            .unwrap();
        // only "checkout" out of five checks
        assert!(!result.passed);
        assert!((result.score - 0.2).abs() < 1e-9);
        assert_eq!(result.details["read_document"], false);
    }

    #[tokio::test]
    async fn test_behavior_grader_rejects_alert_config() {
        let temp = TempDir::new().unwrap();
        let ws = testing::workspace(temp.path(), PortPair { service: 1, dev: 2 });
        let err = testing::grade(&SignalGrader::behavior(), &alert_config(), &ws, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, GraderError::ConfigMismatch { .. }));
    }
}
