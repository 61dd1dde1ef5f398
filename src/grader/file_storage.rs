//! File-storage grader: a file exists with the expected content.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::records_in;
use super::{mismatch, Grader, GraderConfig, GraderError, GraderKind, GraderResult, GradingContext};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStorageConfig {
    /// Project-relative path; placeholders are substituted.
    pub path: String,
    /// When false, a missing file passes and content checks are skipped.
    #[serde(default = "default_true")]
    pub must_exist: bool,
    /// Content must parse as JSON.
    #[serde(default)]
    pub json: bool,
    /// Keys required on the JSON object, or on some record of a JSON array.
    #[serde(default)]
    pub required_keys: Vec<String>,
    /// Substrings the content must contain.
    #[serde(default)]
    pub contains: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl FileStorageConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.path.trim().is_empty() {
            return Err("file_storage grader needs a path".to_string());
        }
        Ok(())
    }
}

pub struct FileStorageGrader;

#[async_trait]
impl Grader for FileStorageGrader {
    fn kind(&self) -> GraderKind {
        GraderKind::FileStorage
    }

    async fn grade(
        &self,
        config: &GraderConfig,
        ctx: &GradingContext<'_>,
    ) -> Result<GraderResult, GraderError> {
        let GraderConfig::FileStorage(cfg) = config else {
            return Err(mismatch(self.kind(), config));
        };
        cfg.validate().map_err(GraderError::InvalidConfig)?;

        let path = ctx.workspace.resolve(ctx.workspace.substitute(&cfg.path));
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(_) if !cfg.must_exist => {
                return Ok(GraderResult::pass(self.kind())
                    .with_detail("path", &cfg.path)
                    .with_detail("exists", false))
            }
            Err(_) => {
                return Ok(GraderResult::fail(self.kind(), format!("'{}' does not exist", cfg.path))
                    .with_detail("path", &cfg.path)
                    .with_detail("exists", false))
            }
        };

        // existence counts as the first satisfied check
        let mut total = 1;
        let mut satisfied = 1;
        let mut failures = Vec::new();

        let parsed = if cfg.json || !cfg.required_keys.is_empty() {
            total += 1;
            match serde_json::from_str::<serde_json::Value>(&content) {
                Ok(value) => {
                    satisfied += 1;
                    Some(value)
                }
                Err(e) => {
                    failures.push(format!("invalid JSON: {}", e));
                    None
                }
            }
        } else {
            None
        };

        for key in &cfg.required_keys {
            total += 1;
            if parsed.as_ref().is_some_and(|v| has_key(v, key)) {
                satisfied += 1;
            } else {
                failures.push(format!("missing key '{}'", key));
            }
        }

        for needle in &cfg.contains {
            total += 1;
            if content.contains(needle.as_str()) {
                satisfied += 1;
            } else {
                failures.push(format!("missing text '{}'", needle));
            }
        }

        Ok(GraderResult::ratio(self.kind(), satisfied, total)
            .with_detail("path", &cfg.path)
            .with_detail("exists", true)
            .with_detail("bytes", content.len())
            .with_detail("failures", failures))
    }
}

fn has_key(value: &serde_json::Value, key: &str) -> bool {
    if value.get(key).is_some() {
        return true;
    }
    records_in(value)
        .map(|records| records.iter().any(|r| r.get(key).is_some()))
        .unwrap_or(false)
}
