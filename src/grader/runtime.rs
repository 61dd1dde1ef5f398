//! Runtime check: the dev server starts, the page loads, and the process
//! output stays free of errors.
//!
//! Console output of every workspace process is scanned after the page has
//! been requested and a settle window has passed. Errors fail the check;
//! warnings only cost `warning_penalty` each, down to a floor of 0.5.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::http::{ensure_service, send, url_for, Body, PortTarget, ServiceTarget};
use super::{
    compile_patterns, mismatch, Grader, GraderConfig, GraderError, GraderKind, GraderResult,
    GradingContext,
};

const DEFAULT_ERROR_PATTERNS: &[&str] = &[
    r"\berror\b",
    r"\buncaught\b",
    r"\bunhandled\b",
    r"failed to compile",
    r"\bexception\b",
];

const DEFAULT_WARNING_PATTERNS: &[&str] = &[r"\bwarn(ing)?\b", r"\bdeprecat"];

const WARNING_SCORE_FLOOR: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Falls back to the template's dev command.
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_port")]
    pub port: PortTarget,
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    /// Wait after loading the page before reading output.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_warning_penalty")]
    pub warning_penalty: f64,
    /// Overrides the built-in error patterns.
    #[serde(default)]
    pub error_patterns: Vec<String>,
    /// Overrides the built-in warning patterns.
    #[serde(default)]
    pub warning_patterns: Vec<String>,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_port() -> PortTarget {
    PortTarget::Dev
}

fn default_ready_timeout_secs() -> u64 {
    60
}

fn default_settle_ms() -> u64 {
    1500
}

fn default_warning_penalty() -> f64 {
    0.1
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            start_command: None,
            path: default_path(),
            port: default_port(),
            ready_timeout_secs: default_ready_timeout_secs(),
            settle_ms: default_settle_ms(),
            warning_penalty: default_warning_penalty(),
            error_patterns: Vec::new(),
            warning_patterns: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.warning_penalty) {
            return Err("warning_penalty must be within [0, 1]".to_string());
        }
        compile_patterns(&self.error_patterns)?;
        compile_patterns(&self.warning_patterns)?;
        Ok(())
    }

    fn patterns(&self) -> Result<(Vec<Regex>, Vec<Regex>), String> {
        let or_default = |given: &[String], fallback: &[&str]| {
            if given.is_empty() {
                fallback.iter().map(|p| p.to_string()).collect::<Vec<_>>()
            } else {
                given.to_vec()
            }
        };
        Ok((
            compile_patterns(&or_default(&self.error_patterns, DEFAULT_ERROR_PATTERNS))?,
            compile_patterns(&or_default(&self.warning_patterns, DEFAULT_WARNING_PATTERNS))?,
        ))
    }
}

pub struct RuntimeGrader;

#[async_trait]
impl Grader for RuntimeGrader {
    fn kind(&self) -> GraderKind {
        GraderKind::Runtime
    }

    async fn grade(
        &self,
        config: &GraderConfig,
        ctx: &GradingContext<'_>,
    ) -> Result<GraderResult, GraderError> {
        let GraderConfig::Runtime(cfg) = config else {
            return Err(mismatch(self.kind(), config));
        };
        cfg.validate().map_err(GraderError::InvalidConfig)?;
        let (error_res, warning_res) = cfg.patterns().map_err(GraderError::InvalidConfig)?;

        let target = ServiceTarget {
            port: cfg.port,
            start_command: cfg
                .start_command
                .clone()
                .or_else(|| ctx.workspace.template.dev_command().map(str::to_string)),
            ready_timeout_secs: cfg.ready_timeout_secs,
        };
        let port = match ensure_service(ctx, &target).await {
            Ok(port) => port,
            Err(e) => {
                return Ok(GraderResult::fail(self.kind(), e.to_string())
                    .with_detail("output", ctx.workspace.processes().output_lines().await));
            }
        };

        let url = url_for(port, &ctx.workspace.substitute(&cfg.path));
        let reply = send(ctx.http, "GET", &url, Body::None, &BTreeMap::new(), ctx.timeout).await;
        tokio::time::sleep(Duration::from_millis(cfg.settle_ms)).await;

        let lines = ctx.workspace.processes().output_lines().await;
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        for line in &lines {
            if error_res.iter().any(|re| re.is_match(line)) {
                errors.push(line.clone());
            } else if warning_res.iter().any(|re| re.is_match(line)) {
                warnings.push(line.clone());
            }
        }

        let status = match reply {
            Ok(reply) => reply.status,
            Err(e) => {
                return Ok(GraderResult::fail(self.kind(), format!("page did not load: {}", e))
                    .with_detail("errors", errors));
            }
        };
        if status >= 400 {
            return Ok(GraderResult::fail(self.kind(), format!("page returned HTTP {}", status))
                .with_detail("status", status)
                .with_detail("errors", errors));
        }

        let result = if errors.is_empty() {
            let score =
                (1.0 - cfg.warning_penalty * warnings.len() as f64).max(WARNING_SCORE_FLOOR);
            GraderResult::scored(self.kind(), score, true)
        } else {
            GraderResult::scored(self.kind(), 0.25, false)
                .with_error(format!("{} error line(s) in process output", errors.len()))
        };

        Ok(result
            .with_detail("status", status)
            .with_detail("errors", errors)
            .with_detail("warnings", warnings))
    }
}
