//! Anomaly-detection grader: events produce a behavior document.
//!
//! Sends the configured events to the service, then watches
//! `.detections/behaviors.json` until it appears or the settle window ends.
//! Scoring: the document exists (0.4), parses with at least one record (0.3),
//! and some record carries the expected severity and type (0.3).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::{ensure_service, records_in, send, url_for, Body, ServiceTarget};
use super::{mismatch, Grader, GraderConfig, GraderError, GraderKind, GraderResult, GradingContext};
use crate::workspace::DetectionSignal;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Events posted before watching; none means only the document is checked.
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default)]
    pub expect_severity: Option<String>,
    #[serde(default)]
    pub expect_type: Option<String>,
    #[serde(flatten)]
    pub target: ServiceTarget,
}

fn default_endpoint() -> String {
    "/events".to_string()
}

fn default_settle_ms() -> u64 {
    3000
}

pub struct AnomalyGrader;

#[async_trait]
impl Grader for AnomalyGrader {
    fn kind(&self) -> GraderKind {
        GraderKind::Anomaly
    }

    async fn grade(
        &self,
        config: &GraderConfig,
        ctx: &GradingContext<'_>,
    ) -> Result<GraderResult, GraderError> {
        let GraderConfig::Anomaly(cfg) = config else {
            return Err(mismatch(self.kind(), config));
        };

        let mut posted = 0usize;
        if !cfg.events.is_empty() {
            let port = match ensure_service(ctx, &cfg.target).await {
                Ok(port) => port,
                Err(e) => return Ok(GraderResult::fail(self.kind(), e.to_string())),
            };
            let url = url_for(port, &ctx.workspace.substitute(&cfg.endpoint));
            let headers = BTreeMap::new();
            for event in &cfg.events {
                if let Ok(reply) = send(ctx.http, "POST", &url, Body::Json(event), &headers, ctx.timeout).await {
                    if (200..300).contains(&reply.status) {
                        posted += 1;
                    }
                }
            }
        }

        let path = ctx.workspace.detection_file(DetectionSignal::Behavior);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(cfg.settle_ms);
        let document = loop {
            if let Ok(text) = tokio::fs::read_to_string(&path).await {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                    if records_in(&value).is_some_and(|r| !r.is_empty()) {
                        break Some((true, value));
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    break Some((false, serde_json::Value::Null));
                }
            } else if tokio::time::Instant::now() >= deadline {
                break None;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        let Some((valid, value)) = document else {
            return Ok(GraderResult::scored(self.kind(), 0.0, false)
                .with_error("behaviors.json was not produced")
                .with_detail("events_accepted", posted));
        };

        let mut score = 0.4;
        let mut matched = false;
        if valid {
            score += 0.3;
            let records = records_in(&value).cloned().unwrap_or_default();
            matched = records.iter().any(|r| {
                field_matches(r, &["severity", "level"], cfg.expect_severity.as_deref())
                    && field_matches(r, &["type", "kind", "anomaly"], cfg.expect_type.as_deref())
            });
            if matched {
                score += 0.3;
            }
        }

        Ok(GraderResult::scored(self.kind(), score, valid && matched)
            .with_detail("document_valid", valid)
            .with_detail("expectation_matched", matched)
            .with_detail("events_accepted", posted))
    }
}

/// True when `expected` is unset or one of `keys` holds it (case-insensitive).
fn field_matches(record: &serde_json::Value, keys: &[&str], expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    keys.iter().any(|k| {
        record
            .get(*k)
            .and_then(|v| v.as_str())
            .is_some_and(|v| v.eq_ignore_ascii_case(expected))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grader::testing;
    use crate::workspace::PortPair;
    use tempfile::TempDir;

    fn config(severity: Option<&str>) -> GraderConfig {
        GraderConfig::Anomaly(AnomalyConfig {
            endpoint: default_endpoint(),
            events: Vec::new(),
            settle_ms: 300,
            expect_severity: severity.map(str::to_string),
            expect_type: Some("burst".into()),
            target: ServiceTarget::default(),
        })
    }

    fn workspace_with(doc: Option<&str>) -> (TempDir, crate::workspace::Workspace) {
        let temp = TempDir::new().unwrap();
        let ws = testing::workspace(temp.path(), PortPair { service: 1, dev: 2 });
        std::fs::create_dir_all(&ws.detection_dir).unwrap();
        if let Some(doc) = doc {
            std::fs::write(ws.detection_file(DetectionSignal::Behavior), doc).unwrap();
        }
        (temp, ws)
    }

    #[tokio::test]
    async fn test_full_credit() {
        let (_temp, ws) = workspace_with(Some(
            r#"{"anomalies": [{"type": "burst", "severity": "HIGH", "userId": "u1"}]}"#,
        ));
        let result = testing::grade(&AnomalyGrader, &config(Some("high")), &ws, &[])
            .await
            .unwrap();
        assert!(result.passed);
        assert!((result.score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_wrong_severity() {
        let (_temp, ws) = workspace_with(Some(r#"[{"type": "burst", "severity": "low"}]"#));
        let result = testing::grade(&AnomalyGrader, &config(Some("high")), &ws, &[])
            .await
            .unwrap();
        assert!(!result.passed);
        assert!((result.score - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_invalid_document() {
        let (_temp, ws) = workspace_with(Some("not json"));
        let result = testing::grade(&AnomalyGrader, &config(None), &ws, &[])
            .await
            .unwrap();
        assert!(!result.passed);
        assert!((result.score - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_missing_document() {
        let (_temp, ws) = workspace_with(None);
        let result = testing::grade(&AnomalyGrader, &config(None), &ws, &[])
            .await
            .unwrap();
        assert!(!result.passed);
        assert_eq!(result.score, 0.0);
    }
}
