//! Error-injection grader: malformed requests must be rejected, and the
//! service must survive them.
//!
//! After every case the service is probed. If it stops answering, the run
//! ends with `serverCrashed: true`, a failed verdict and a score capped at
//! `crash_score_cap`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::http::{ensure_service, send, status_matches, url_for, Body, ServiceTarget};
use super::{mismatch, Grader, GraderConfig, GraderError, GraderKind, GraderResult, GradingContext};
use crate::workspace::process::port_accepts;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInjectionConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub cases: Vec<InjectionCase>,
    /// GET path used as the liveness probe; a TCP connect when unset.
    #[serde(default)]
    pub liveness_path: Option<String>,
    #[serde(default = "default_crash_cap")]
    pub crash_score_cap: f64,
    #[serde(flatten)]
    pub target: ServiceTarget,
}

/// One malformed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionCase {
    #[serde(default)]
    pub name: Option<String>,
    /// JSON body.
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    /// Raw body sent verbatim; wins over `body`.
    #[serde(default)]
    pub raw: Option<String>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default = "default_expect_status")]
    pub expect_status: u16,
}

fn default_endpoint() -> String {
    "/events".to_string()
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_crash_cap() -> f64 {
    0.2
}

fn default_content_type() -> String {
    "application/json".to_string()
}

fn default_expect_status() -> u16 {
    400
}

impl ErrorInjectionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.cases.is_empty() {
            return Err("error_injection grader needs at least one case".to_string());
        }
        if !(0.0..=1.0).contains(&self.crash_score_cap) {
            return Err("crash_score_cap must be within [0, 1]".to_string());
        }
        Ok(())
    }
}

pub struct ErrorInjectionGrader;

#[async_trait]
impl Grader for ErrorInjectionGrader {
    fn kind(&self) -> GraderKind {
        GraderKind::ErrorInjection
    }

    async fn grade(
        &self,
        config: &GraderConfig,
        ctx: &GradingContext<'_>,
    ) -> Result<GraderResult, GraderError> {
        let GraderConfig::ErrorInjection(cfg) = config else {
            return Err(mismatch(self.kind(), config));
        };
        cfg.validate().map_err(GraderError::InvalidConfig)?;

        let port = match ensure_service(ctx, &cfg.target).await {
            Ok(port) => port,
            Err(e) => return Ok(GraderResult::fail(self.kind(), e.to_string())),
        };

        let url = url_for(port, &ctx.workspace.substitute(&cfg.endpoint));
        let headers = BTreeMap::new();
        let mut handled = 0usize;
        let mut crashed_after: Option<usize> = None;
        let mut outcomes = Vec::with_capacity(cfg.cases.len());

        for (index, case) in cfg.cases.iter().enumerate() {
            let label = case.name.clone().unwrap_or_else(|| format!("case {}", index + 1));
            let body = match (&case.raw, &case.body) {
                (Some(raw), _) => Body::Raw {
                    content: raw,
                    content_type: &case.content_type,
                },
                (None, Some(json)) => Body::Json(json),
                (None, None) => Body::None,
            };

            let outcome = match send(ctx.http, &cfg.method, &url, body, &headers, ctx.timeout).await {
                Ok(reply) => {
                    let ok = status_matches(case.expect_status, reply.status);
                    if ok {
                        handled += 1;
                    }
                    serde_json::json!({ "case": label, "status": reply.status, "handled": ok })
                }
                Err(e) => serde_json::json!({ "case": label, "error": e.to_string(), "handled": false }),
            };
            outcomes.push(outcome);

            if !self.is_alive(ctx, port, cfg.liveness_path.as_deref()).await {
                warn!(
                    task_id = %ctx.workspace.task_id,
                    case = index + 1,
                    "Service stopped responding during error injection"
                );
                crashed_after = Some(index + 1);
                break;
            }
        }

        let total = cfg.cases.len();
        let ratio = handled as f64 / total as f64;
        let result = match crashed_after {
            Some(after) => GraderResult::scored(self.kind(), ratio.min(cfg.crash_score_cap), false)
                .with_error(format!("service crashed after {} of {} cases", after, total))
                .with_detail("serverCrashed", true),
            None => GraderResult::scored(self.kind(), ratio, handled == total)
                .with_detail("serverCrashed", false),
        };

        Ok(result
            .with_detail("handled", handled)
            .with_detail("cases", total)
            .with_detail("outcomes", outcomes))
    }
}

impl ErrorInjectionGrader {
    async fn is_alive(&self, ctx: &GradingContext<'_>, port: u16, liveness_path: Option<&str>) -> bool {
        match liveness_path {
            Some(path) => send(
                ctx.http,
                "GET",
                &url_for(port, path),
                Body::None,
                &BTreeMap::new(),
                PROBE_TIMEOUT,
            )
            .await
            .is_ok(),
            None => port_accepts(port, PROBE_TIMEOUT).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grader::testing;
    use crate::workspace::PortPair;
    use tempfile::TempDir;

    fn config(cases: usize) -> GraderConfig {
        GraderConfig::ErrorInjection(ErrorInjectionConfig {
            endpoint: default_endpoint(),
            method: default_method(),
            cases: (0..cases)
                .map(|i| InjectionCase {
                    name: None,
                    body: None,
                    raw: Some(format!("{{broken json {}", i)),
                    content_type: default_content_type(),
                    expect_status: 400,
                })
                .collect(),
            liveness_path: None,
            crash_score_cap: default_crash_cap(),
            target: ServiceTarget::default(),
        })
    }

    #[tokio::test]
    async fn test_rejects_all_cases() {
        let server = testing::serve(|_, _, _| (422, r#"{"error":"bad"}"#.to_string()), None).await;
        let temp = TempDir::new().unwrap();
        let ws = testing::workspace(temp.path(), PortPair { service: server.port, dev: 1 });

        let result = testing::grade(&ErrorInjectionGrader, &config(3), &ws, &[])
            .await
            .unwrap();
        assert!(result.passed);
        assert_eq!(result.score, 1.0);
        assert_eq!(result.details["serverCrashed"], false);
    }

    #[tokio::test]
    async fn test_crash_caps_score() {
        // Answers two requests correctly, then goes away.
        let server = testing::serve(|_, _, _| (400, "{}".to_string()), Some(2)).await;
        let temp = TempDir::new().unwrap();
        let ws = testing::workspace(temp.path(), PortPair { service: server.port, dev: 1 });

        let result = testing::grade(&ErrorInjectionGrader, &config(3), &ws, &[])
            .await
            .unwrap();
        assert!(!result.passed);
        assert!((result.score - 0.2).abs() < 1e-9);
        assert_eq!(result.details["serverCrashed"], true);
    }

    #[tokio::test]
    async fn test_server_error_is_not_handled() {
        let server = testing::serve(|_, _, _| (500, String::new()), None).await;
        let temp = TempDir::new().unwrap();
        let ws = testing::workspace(temp.path(), PortPair { service: server.port, dev: 1 });

        let result = testing::grade(&ErrorInjectionGrader, &config(2), &ws, &[])
            .await
            .unwrap();
        assert!(!result.passed);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.details["serverCrashed"], false);
    }
}
