//! Service-liveness grader: one request, expected status and body.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::{ensure_service, send, status_matches, url_for, Body, ServiceTarget};
use super::{mismatch, Grader, GraderConfig, GraderError, GraderKind, GraderResult, GradingContext};
use crate::utils::truncate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_status")]
    pub expect_status: u16,
    #[serde(default)]
    pub expect_body_contains: Option<String>,
    #[serde(flatten)]
    pub target: ServiceTarget,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

fn default_status() -> u16 {
    200
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(100..600).contains(&self.expect_status) {
            return Err(format!("expect_status {} is not an HTTP status", self.expect_status));
        }
        Ok(())
    }
}

pub struct ServerGrader;

#[async_trait]
impl Grader for ServerGrader {
    fn kind(&self) -> GraderKind {
        GraderKind::Server
    }

    async fn grade(
        &self,
        config: &GraderConfig,
        ctx: &GradingContext<'_>,
    ) -> Result<GraderResult, GraderError> {
        let GraderConfig::Server(cfg) = config else {
            return Err(mismatch(self.kind(), config));
        };

        let port = match ensure_service(ctx, &cfg.target).await {
            Ok(port) => port,
            Err(e) => {
                return Ok(GraderResult::fail(self.kind(), e.to_string())
                    .with_detail("reachable", false))
            }
        };

        let path = ctx.workspace.substitute(&cfg.path);
        let body = match &cfg.body {
            Some(value) => Body::Json(value),
            None => Body::None,
        };
        let reply = match send(ctx.http, &cfg.method, &url_for(port, &path), body, &cfg.headers, ctx.timeout).await {
            Ok(reply) => reply,
            Err(GraderError::InvalidConfig(msg)) => return Err(GraderError::InvalidConfig(msg)),
            Err(e) => {
                return Ok(GraderResult::fail(self.kind(), format!("request failed: {}", e))
                    .with_detail("reachable", false))
            }
        };

        let status_ok = status_matches(cfg.expect_status, reply.status);
        let body_ok = cfg
            .expect_body_contains
            .as_ref()
            .map(|needle| reply.body.contains(needle.as_str()))
            .unwrap_or(true);

        let (passed, score) = match (status_ok, body_ok) {
            (true, true) => (true, 1.0),
            (true, false) => (false, 0.5),
            _ => (false, 0.0),
        };

        Ok(GraderResult::scored(self.kind(), score, passed)
            .with_detail("reachable", true)
            .with_detail("method", cfg.method.to_uppercase())
            .with_detail("path", path)
            .with_detail("status", reply.status)
            .with_detail("expected_status", cfg.expect_status)
            .with_detail("body_matched", body_ok)
            .with_detail("body", truncate(&reply.body, 500)))
    }
}
