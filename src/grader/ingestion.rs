//! Data-ingestion grader: events are accepted and then persisted.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::{count_records, ensure_service, records_in, send, url_for, Body, ServiceTarget};
use super::{mismatch, Grader, GraderConfig, GraderError, GraderKind, GraderResult, GradingContext};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub events: Vec<serde_json::Value>,
    /// Required status; any 2xx when unset.
    #[serde(default)]
    pub expect_status: Option<u16>,
    /// Project-relative file the service persists to.
    #[serde(default)]
    pub storage_path: Option<String>,
    /// GET endpoint returning the stored records.
    #[serde(default)]
    pub query_path: Option<String>,
    /// Records that must be persisted; defaults to the number of events.
    #[serde(default)]
    pub min_persisted: Option<usize>,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(flatten)]
    pub target: ServiceTarget,
}

fn default_endpoint() -> String {
    "/events".to_string()
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_settle_ms() -> u64 {
    500
}

impl IngestionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.events.is_empty() {
            return Err("ingestion grader needs at least one event".to_string());
        }
        Ok(())
    }
}

pub struct IngestionGrader;

#[async_trait]
impl Grader for IngestionGrader {
    fn kind(&self) -> GraderKind {
        GraderKind::Ingestion
    }

    async fn grade(
        &self,
        config: &GraderConfig,
        ctx: &GradingContext<'_>,
    ) -> Result<GraderResult, GraderError> {
        let GraderConfig::Ingestion(cfg) = config else {
            return Err(mismatch(self.kind(), config));
        };
        cfg.validate().map_err(GraderError::InvalidConfig)?;

        let port = match ensure_service(ctx, &cfg.target).await {
            Ok(port) => port,
            Err(e) => return Ok(GraderResult::fail(self.kind(), e.to_string())),
        };

        let url = url_for(port, &ctx.workspace.substitute(&cfg.endpoint));
        let headers = BTreeMap::new();
        let mut accepted = 0usize;
        let mut statuses = Vec::with_capacity(cfg.events.len());
        for event in &cfg.events {
            match send(ctx.http, &cfg.method, &url, Body::Json(event), &headers, ctx.timeout).await {
                Ok(reply) => {
                    let ok = match cfg.expect_status {
                        Some(expected) => reply.status == expected,
                        None => (200..300).contains(&reply.status),
                    };
                    if ok {
                        accepted += 1;
                    }
                    statuses.push(serde_json::json!(reply.status));
                }
                Err(e) => statuses.push(serde_json::json!(e.to_string())),
            }
        }

        tokio::time::sleep(Duration::from_millis(cfg.settle_ms)).await;

        let total = cfg.events.len();
        let accepted_ratio = accepted as f64 / total as f64;
        let required = cfg.min_persisted.unwrap_or(total);

        let persisted_count = if let Some(storage) = &cfg.storage_path {
            let path = ctx.workspace.resolve(ctx.workspace.substitute(storage));
            Some(match tokio::fs::read_to_string(&path).await {
                Ok(text) => count_records(&text),
                Err(_) => 0,
            })
        } else if let Some(query) = &cfg.query_path {
            let query_url = url_for(port, &ctx.workspace.substitute(query));
            Some(match send(ctx.http, "GET", &query_url, Body::None, &headers, ctx.timeout).await {
                Ok(reply) if (200..300).contains(&reply.status) => {
                    serde_json::from_str::<serde_json::Value>(&reply.body)
                        .ok()
                        .and_then(|v| records_in(&v).map(|r| r.len()))
                        .unwrap_or(0)
                }
                _ => 0,
            })
        } else {
            None
        };

        let result = match persisted_count {
            Some(count) => {
                let persisted = count >= required;
                let score = 0.5 * accepted_ratio + if persisted { 0.5 } else { 0.0 };
                GraderResult::scored(self.kind(), score, accepted == total && persisted)
                    .with_detail("persisted", count)
                    .with_detail("required", required)
            }
            None => GraderResult::scored(self.kind(), accepted_ratio, accepted == total),
        };

        Ok(result
            .with_detail("accepted", accepted)
            .with_detail("sent", total)
            .with_detail("statuses", statuses))
    }
}
